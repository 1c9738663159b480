// Allow dead_code because these helpers are used across different test files
// which are compiled separately
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use pocketbook::application::{Clock, LedgerService};
use pocketbook::config::{LedgerConfig, StorageConfig};
use pocketbook::domain::User;
use pocketbook::storage::{self, LedgerBackend};
use tempfile::TempDir;

/// Helper to create a test service with a temporary database
pub async fn test_service() -> Result<(LedgerService, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let service = LedgerService::init(db_path.to_str().unwrap()).await?;
    Ok((service, temp_dir))
}

/// One service per backend. The TempDir must outlive the sqlite service.
pub async fn all_services() -> Result<Vec<(LedgerService, Option<TempDir>)>> {
    let (sqlite, temp_dir) = test_service().await?;
    let memory = LedgerService::in_memory().await?;
    Ok(vec![(sqlite, Some(temp_dir)), (memory, None)])
}

/// A sqlite backend handle, for tests that need to reach below the service.
pub async fn sqlite_backend() -> Result<(Arc<dyn LedgerBackend>, TempDir)> {
    let temp_dir = TempDir::new()?;
    let db_path = temp_dir.path().join("test.db");
    let backend = storage::open(&StorageConfig::sqlite_file(db_path.to_str().unwrap())).await?;
    Ok((backend, temp_dir))
}

pub async fn memory_backend() -> Result<Arc<dyn LedgerBackend>> {
    storage::open(&StorageConfig::memory()).await
}

pub fn service_over(backend: Arc<dyn LedgerBackend>) -> LedgerService {
    LedgerService::new(backend, LedgerConfig::default())
}

/// Register a user with a placeholder credential.
pub async fn register(service: &LedgerService, email: &str) -> Result<User> {
    Ok(service.create_user(email, "test-hash").await?)
}

/// Register a user and give them a starting balance.
pub async fn funded(service: &LedgerService, email: &str, cents: i64) -> Result<User> {
    let user = register(service, email).await?;
    service.deposit(user.id, cents).await?;
    Ok(user)
}

/// Helper to parse a date string into DateTime<Utc>
pub fn parse_date(date_str: &str) -> DateTime<Utc> {
    day(date_str).and_hms_opt(12, 0, 0).unwrap().and_utc()
}

pub fn day(date_str: &str) -> NaiveDate {
    NaiveDate::parse_from_str(date_str, "%Y-%m-%d").unwrap()
}

/// A clock the test moves by hand.
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    pub fn at(date_str: &str) -> Self {
        Self(Arc::new(Mutex::new(parse_date(date_str))))
    }

    pub fn set(&self, date_str: &str) {
        *self.0.lock().unwrap() = parse_date(date_str);
    }

    pub fn advance(&self, duration: Duration) {
        *self.0.lock().unwrap() += duration;
    }

    pub fn clock(&self) -> Clock {
        let now = self.0.clone();
        Arc::new(move || *now.lock().unwrap())
    }
}

/// A sqlite service whose clock starts at noon of `date_str`.
pub async fn service_at(date_str: &str) -> Result<(LedgerService, TestClock, TempDir)> {
    let clock = TestClock::at(date_str);
    let (service, temp_dir) = test_service().await?;
    Ok((service.with_clock(clock.clock()), clock, temp_dir))
}

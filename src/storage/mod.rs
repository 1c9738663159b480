//! Storage backends for the ledger.
//!
//! Every mutation goes through a [`LedgerTx`] unit of work: the service reads,
//! validates and writes through it, then commits. Dropping a unit of work
//! without committing discards all of its writes.

mod memory;
mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{BackendKind, StorageConfig};
use crate::domain::{BalanceCheck, Budget, Cents, Entry, EntryId, Month, User, UserId};

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// SQL migration for users, entries and the sequence counter
pub const MIGRATION_001_INITIAL: &str = include_str!("migrations/001_initial.sql");

/// SQL migration for budgets
pub const MIGRATION_002_BUDGETS: &str = include_str!("migrations/002_budgets.sql");

/// Bounds for listing a user's entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryQuery {
    /// Inclusive lower bound
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl EntryQuery {
    pub fn between(from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            until: Some(until),
            limit: None,
        }
    }

    pub fn matches(&self, entry: &Entry) -> bool {
        self.from.is_none_or(|from| entry.timestamp >= from)
            && self.until.is_none_or(|until| entry.timestamp < until)
    }
}

/// Read side of a backend plus the entry point for units of work.
#[async_trait]
pub trait LedgerBackend: Send + Sync {
    /// Create tables if needed.
    async fn migrate(&self) -> Result<()>;

    /// Start a unit of work.
    async fn begin(&self) -> Result<Box<dyn LedgerTx>>;

    async fn get_user(&self, id: UserId) -> Result<Option<User>>;

    /// Look up a user by already-normalized email.
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn list_users(&self) -> Result<Vec<User>>;

    async fn get_entry(&self, id: EntryId) -> Result<Option<Entry>>;

    /// A user's entries, most recent first (timestamp, then sequence).
    async fn list_entries(&self, user_id: UserId, query: &EntryQuery) -> Result<Vec<Entry>>;

    /// Budgets of a user for one month, ordered by category.
    async fn list_budgets(&self, user_id: UserId, period: Month) -> Result<Vec<Budget>>;

    /// Signed sum of a user's entries.
    async fn ledger_sum(&self, user_id: UserId) -> Result<Cents>;

    /// Cached balance and ledger sum of a user, read from one snapshot.
    async fn balance_check(&self, user_id: UserId) -> Result<Option<BalanceCheck>>;
}

/// One all-or-nothing unit of work.
#[async_trait]
pub trait LedgerTx: Send {
    /// Read a user and hold the write lock for the rest of the unit of work.
    async fn lock_user(&mut self, id: UserId) -> Result<Option<User>>;

    /// Hold the write lock before registering a user, so that no other
    /// registration commits between the email check and the insert.
    async fn lock_users(&mut self) -> Result<()>;

    async fn get_user_by_email(&mut self, email: &str) -> Result<Option<User>>;

    async fn insert_user(&mut self, user: &User) -> Result<()>;

    /// Returns false if the user did not exist.
    async fn delete_user(&mut self, id: UserId) -> Result<bool>;

    async fn set_balance(&mut self, id: UserId, balance: Cents) -> Result<()>;

    /// Persist a new entry, assigning its sequence number.
    async fn insert_entry(&mut self, entry: &mut Entry) -> Result<()>;

    async fn get_entry(&mut self, id: EntryId) -> Result<Option<Entry>>;

    /// Overwrite amount and category of an existing entry.
    async fn update_entry(&mut self, entry: &Entry) -> Result<()>;

    async fn delete_entry(&mut self, id: EntryId) -> Result<()>;

    async fn ledger_sum(&mut self, user_id: UserId) -> Result<Cents>;

    /// Insert or replace the limit for (user, category, month). Returns the
    /// stored budget, which keeps its original id when replaced.
    async fn upsert_budget(&mut self, budget: &Budget) -> Result<Budget>;

    /// Returns false if no such budget existed.
    async fn delete_budget(&mut self, user_id: UserId, category: &str, period: Month) -> Result<bool>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Open and migrate the backend selected by configuration.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn LedgerBackend>> {
    let backend: Arc<dyn LedgerBackend> = match config.backend {
        BackendKind::Sqlite => Arc::new(SqliteBackend::connect(config).await?),
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
    };
    backend.migrate().await?;
    Ok(backend)
}

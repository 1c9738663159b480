use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::domain::{
    BalanceCheck, Budget, Cents, Entry, EntryId, EntryKind, Month, Provenance, User, UserId,
};

use super::{EntryQuery, LedgerBackend, LedgerTx, MIGRATION_001_INITIAL, MIGRATION_002_BUDGETS};

const USER_COLUMNS: &str = "id, email, credential_hash, balance_cents, created_at";
const ENTRY_COLUMNS: &str =
    "id, sequence, user_id, kind, amount_cents, category, provenance, transfer_id, timestamp";
const BUDGET_COLUMNS: &str = "id, user_id, category, limit_cents, month, year";

/// Signed sum of one user's entries.
const LEDGER_SUM: &str = r#"
    SELECT COALESCE(SUM(CASE WHEN kind = 'deposit' THEN amount_cents ELSE -amount_cents END), 0) AS total
    FROM transactions
    WHERE user_id = ?
"#;

/// A user's cached balance next to the sum of their entries. One statement,
/// so both come from the same snapshot.
const BALANCE_CHECK: &str = r#"
    SELECT u.email, u.balance_cents,
        (SELECT COALESCE(SUM(CASE WHEN t.kind = 'deposit' THEN t.amount_cents ELSE -t.amount_cents END), 0)
         FROM transactions t
         WHERE t.user_id = u.id) AS total
    FROM users u
    WHERE u.id = ?
"#;

/// SQLite-backed ledger storage.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Create a backend over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect using the storage settings. Creates the database file if it
    /// doesn't exist.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .with_context(|| format!("Invalid database URL: {}", config.url))?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        // Every connection to an in-memory database is a separate database
        let max_connections = if config.url.contains(":memory:") {
            1
        } else {
            config.max_connections.max(1)
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .context("Failed to connect to database")?;
        Ok(Self::new(pool))
    }

    fn row_to_user(row: &SqliteRow) -> Result<User> {
        let id_str: String = row.get("id");
        let created_at_str: String = row.get("created_at");

        Ok(User {
            id: Uuid::parse_str(&id_str).context("Invalid user ID")?,
            email: row.get("email"),
            credential_hash: row.get("credential_hash"),
            balance_cents: row.get("balance_cents"),
            created_at: parse_timestamp(&created_at_str).context("Invalid created_at timestamp")?,
        })
    }

    fn row_to_entry(row: &SqliteRow) -> Result<Entry> {
        let id_str: String = row.get("id");
        let user_id_str: String = row.get("user_id");
        let kind_str: String = row.get("kind");
        let provenance_str: String = row.get("provenance");
        let transfer_id_str: Option<String> = row.get("transfer_id");
        let timestamp_str: String = row.get("timestamp");

        Ok(Entry {
            id: Uuid::parse_str(&id_str).context("Invalid entry ID")?,
            sequence: row.get("sequence"),
            user_id: Uuid::parse_str(&user_id_str).context("Invalid user ID")?,
            kind: EntryKind::from_str(&kind_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid entry kind: {}", kind_str))?,
            amount_cents: row.get("amount_cents"),
            category: row.get("category"),
            provenance: Provenance::from_str(&provenance_str)
                .ok_or_else(|| anyhow::anyhow!("Invalid provenance: {}", provenance_str))?,
            transfer_id: transfer_id_str
                .map(|s| Uuid::parse_str(&s))
                .transpose()
                .context("Invalid transfer ID")?,
            timestamp: parse_timestamp(&timestamp_str).context("Invalid timestamp")?,
        })
    }

    fn row_to_budget(row: &SqliteRow) -> Result<Budget> {
        let id_str: String = row.get("id");
        let user_id_str: String = row.get("user_id");
        let year: i32 = row.get("year");
        let month: u32 = row.get("month");

        Ok(Budget {
            id: Uuid::parse_str(&id_str).context("Invalid budget ID")?,
            user_id: Uuid::parse_str(&user_id_str).context("Invalid user ID")?,
            category: row.get("category"),
            limit_cents: row.get("limit_cents"),
            period: Month::new(year, month)
                .ok_or_else(|| anyhow::anyhow!("Invalid budget month: {}-{}", year, month))?,
        })
    }
}

/// Fixed-width UTC timestamps so that text order is chronological order.
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

#[async_trait]
impl LedgerBackend for SqliteBackend {
    async fn migrate(&self) -> Result<()> {
        sqlx::query(MIGRATION_001_INITIAL)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 001")?;

        sqlx::query(MIGRATION_002_BUDGETS)
            .execute(&self.pool)
            .await
            .context("Failed to run migration 002")?;

        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await.context("Failed to begin transaction")?;
        Ok(Box::new(SqliteTx { tx }))
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")?;

        row.as_ref().map(Self::row_to_user).transpose()
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?"))
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user by email")?;

        row.as_ref().map(Self::row_to_user).transpose()
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let rows = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY email"))
            .fetch_all(&self.pool)
            .await
            .context("Failed to list users")?;

        rows.iter().map(Self::row_to_user).collect()
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<Entry>> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM transactions WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch entry")?;

        row.as_ref().map(Self::row_to_entry).transpose()
    }

    async fn list_entries(&self, user_id: UserId, query: &EntryQuery) -> Result<Vec<Entry>> {
        // Build query dynamically based on filters
        let mut sql = format!("SELECT {ENTRY_COLUMNS} FROM transactions WHERE user_id = ?");

        let from_str = query.from.as_ref().map(format_timestamp);
        let until_str = query.until.as_ref().map(format_timestamp);

        if from_str.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if until_str.is_some() {
            sql.push_str(" AND timestamp < ?");
        }

        sql.push_str(" ORDER BY timestamp DESC, sequence DESC");

        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let mut sql_query = sqlx::query(&sql).bind(user_id.to_string());
        if let Some(ref from) = from_str {
            sql_query = sql_query.bind(from);
        }
        if let Some(ref until) = until_str {
            sql_query = sql_query.bind(until);
        }

        let rows = sql_query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list entries")?;

        rows.iter().map(Self::row_to_entry).collect()
    }

    async fn list_budgets(&self, user_id: UserId, period: Month) -> Result<Vec<Budget>> {
        let rows = sqlx::query(&format!(
            "SELECT {BUDGET_COLUMNS} FROM budgets WHERE user_id = ? AND year = ? AND month = ? ORDER BY category"
        ))
        .bind(user_id.to_string())
        .bind(period.year)
        .bind(period.month)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list budgets")?;

        rows.iter().map(Self::row_to_budget).collect()
    }

    async fn ledger_sum(&self, user_id: UserId) -> Result<Cents> {
        let row = sqlx::query(LEDGER_SUM)
            .bind(user_id.to_string())
            .fetch_one(&self.pool)
            .await
            .context("Failed to sum ledger")?;

        Ok(row.get("total"))
    }

    async fn balance_check(&self, user_id: UserId) -> Result<Option<BalanceCheck>> {
        let row = sqlx::query(BALANCE_CHECK)
            .bind(user_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read balance check")?;

        Ok(row.map(|row| BalanceCheck {
            user_id,
            email: row.get("email"),
            cached: row.get("balance_cents"),
            derived: row.get("total"),
        }))
    }
}

/// A sqlx transaction. Dropping it without commit rolls it back.
struct SqliteTx {
    tx: Transaction<'static, Sqlite>,
}

#[async_trait]
impl LedgerTx for SqliteTx {
    async fn lock_user(&mut self, id: UserId) -> Result<Option<User>> {
        // A no-op write takes SQLite's write lock now rather than at the first
        // real write, like SELECT ... FOR UPDATE elsewhere.
        let row = sqlx::query(&format!(
            "UPDATE users SET balance_cents = balance_cents WHERE id = ? RETURNING {USER_COLUMNS}"
        ))
        .bind(id.to_string())
        .fetch_optional(&mut *self.tx)
        .await
        .context("Failed to lock user")?;

        row.as_ref().map(SqliteBackend::row_to_user).transpose()
    }

    async fn lock_users(&mut self) -> Result<()> {
        sqlx::query("UPDATE sequence_counter SET value = value WHERE name = 'entry_sequence'")
            .execute(&mut *self.tx)
            .await
            .context("Failed to take write lock")?;
        Ok(())
    }

    async fn get_user_by_email(&mut self, email: &str) -> Result<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?"))
            .bind(email)
            .fetch_optional(&mut *self.tx)
            .await
            .context("Failed to fetch user by email")?;

        row.as_ref().map(SqliteBackend::row_to_user).transpose()
    }

    async fn insert_user(&mut self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, credential_hash, balance_cents, created_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.email)
        .bind(&user.credential_hash)
        .bind(user.balance_cents)
        .bind(format_timestamp(&user.created_at))
        .execute(&mut *self.tx)
        .await
        .context("Failed to save user")?;
        Ok(())
    }

    async fn delete_user(&mut self, id: UserId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await
            .context("Failed to delete user")?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_balance(&mut self, id: UserId, balance: Cents) -> Result<()> {
        let result = sqlx::query("UPDATE users SET balance_cents = ? WHERE id = ?")
            .bind(balance)
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await
            .context("Failed to update balance")?;

        if result.rows_affected() != 1 {
            anyhow::bail!("Balance update touched {} rows", result.rows_affected());
        }
        Ok(())
    }

    async fn insert_entry(&mut self, entry: &mut Entry) -> Result<()> {
        let row = sqlx::query(
            r#"
            UPDATE sequence_counter
            SET value = value + 1
            WHERE name = 'entry_sequence'
            RETURNING value
            "#,
        )
        .fetch_one(&mut *self.tx)
        .await
        .context("Failed to get next sequence number")?;
        entry.sequence = row.get("value");

        sqlx::query(
            r#"
            INSERT INTO transactions (id, sequence, user_id, kind, amount_cents, category, provenance, transfer_id, timestamp)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.id.to_string())
        .bind(entry.sequence)
        .bind(entry.user_id.to_string())
        .bind(entry.kind.as_str())
        .bind(entry.amount_cents)
        .bind(&entry.category)
        .bind(entry.provenance.as_str())
        .bind(entry.transfer_id.map(|id| id.to_string()))
        .bind(format_timestamp(&entry.timestamp))
        .execute(&mut *self.tx)
        .await
        .context("Failed to save entry")?;

        Ok(())
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Option<Entry>> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM transactions WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&mut *self.tx)
            .await
            .context("Failed to fetch entry")?;

        row.as_ref().map(SqliteBackend::row_to_entry).transpose()
    }

    async fn update_entry(&mut self, entry: &Entry) -> Result<()> {
        let result = sqlx::query("UPDATE transactions SET amount_cents = ?, category = ? WHERE id = ?")
            .bind(entry.amount_cents)
            .bind(&entry.category)
            .bind(entry.id.to_string())
            .execute(&mut *self.tx)
            .await
            .context("Failed to update entry")?;

        if result.rows_affected() != 1 {
            anyhow::bail!("Entry update touched {} rows", result.rows_affected());
        }
        Ok(())
    }

    async fn delete_entry(&mut self, id: EntryId) -> Result<()> {
        let result = sqlx::query("DELETE FROM transactions WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await
            .context("Failed to delete entry")?;

        if result.rows_affected() != 1 {
            anyhow::bail!("Entry delete touched {} rows", result.rows_affected());
        }
        Ok(())
    }

    async fn ledger_sum(&mut self, user_id: UserId) -> Result<Cents> {
        let row = sqlx::query(LEDGER_SUM)
            .bind(user_id.to_string())
            .fetch_one(&mut *self.tx)
            .await
            .context("Failed to sum ledger")?;

        Ok(row.get("total"))
    }

    async fn upsert_budget(&mut self, budget: &Budget) -> Result<Budget> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO budgets (id, user_id, category, limit_cents, month, year)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (user_id, category, month, year)
            DO UPDATE SET limit_cents = excluded.limit_cents
            RETURNING {BUDGET_COLUMNS}
            "#
        ))
        .bind(budget.id.to_string())
        .bind(budget.user_id.to_string())
        .bind(&budget.category)
        .bind(budget.limit_cents)
        .bind(budget.period.month)
        .bind(budget.period.year)
        .fetch_one(&mut *self.tx)
        .await
        .context("Failed to save budget")?;

        SqliteBackend::row_to_budget(&row)
    }

    async fn delete_budget(&mut self, user_id: UserId, category: &str, period: Month) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM budgets WHERE user_id = ? AND category = ? AND year = ? AND month = ?",
        )
        .bind(user_id.to_string())
        .bind(category)
        .bind(period.year)
        .bind(period.month)
        .execute(&mut *self.tx)
        .await
        .context("Failed to delete budget")?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.context("Failed to commit transaction")
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.context("Failed to roll back transaction")
    }
}

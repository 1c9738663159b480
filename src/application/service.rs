use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, LedgerConfig, StorageConfig};
use crate::domain::{
    BalanceCheck, Budget, BudgetStatus, CategoryTotal, Cents, Entry, EntryId, EntryKind, MAX_CENTS,
    Month, User, UserId, apply_delta, day_start, edit_delta, format_cents, is_plausible_email,
    normalize_email, spending_by_category, transfer_pair,
};
use crate::storage::{self, EntryQuery, LedgerBackend, LedgerTx};

use super::{LedgerError, LedgerResult, MonthlySummary, TransferReceipt};

/// Source of "now" for timestamps and current-month reports.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Date bounds for history and spending queries. Both days are inclusive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryFilter {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub limit: Option<usize>,
}

impl HistoryFilter {
    pub fn between(date_from: NaiveDate, date_to: NaiveDate) -> Self {
        Self {
            date_from: Some(date_from),
            date_to: Some(date_to),
            limit: None,
        }
    }

    fn to_query(&self) -> LedgerResult<EntryQuery> {
        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                return Err(LedgerError::validation(format!(
                    "date range starts after it ends ({} > {})",
                    from, to
                )));
            }
        }
        Ok(EntryQuery {
            from: self.date_from.map(day_start),
            until: self.date_to.and_then(|d| d.succ_opt()).map(day_start),
            limit: self.limit,
        })
    }
}

/// The ledger: every balance change and its log entries are applied together
/// through one unit of work, and every call names the user it acts for.
pub struct LedgerService {
    backend: Arc<dyn LedgerBackend>,
    rules: LedgerConfig,
    clock: Clock,
}

impl LedgerService {
    /// Create a ledger service over an opened backend.
    pub fn new(backend: Arc<dyn LedgerBackend>, rules: LedgerConfig) -> Self {
        Self {
            backend,
            rules,
            clock: Arc::new(Utc::now),
        }
    }

    /// Open the configured backend and run migrations.
    pub async fn from_config(config: &AppConfig) -> LedgerResult<Self> {
        let backend = storage::open(&config.storage).await?;
        Ok(Self::new(backend, config.ledger.clone()))
    }

    /// Initialize (or reopen) a SQLite database at the given path.
    pub async fn init(database_path: &str) -> LedgerResult<Self> {
        let backend = storage::open(&StorageConfig::sqlite_file(database_path)).await?;
        Ok(Self::new(backend, LedgerConfig::default()))
    }

    /// A ledger that lives only as long as this process.
    pub async fn in_memory() -> LedgerResult<Self> {
        let backend = storage::open(&StorageConfig::memory()).await?;
        Ok(Self::new(backend, LedgerConfig::default()))
    }

    pub fn with_rules(mut self, rules: LedgerConfig) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Storage keeps microseconds, so timestamps are truncated up front.
    fn now(&self) -> DateTime<Utc> {
        (self.clock)().trunc_subsecs(6)
    }

    // ========================
    // User operations
    // ========================

    /// Register a user. The credential hash is opaque to the ledger.
    pub async fn create_user(&self, email: &str, credential_hash: &str) -> LedgerResult<User> {
        let email = normalize_email(email);
        if !is_plausible_email(&email) {
            return Err(LedgerError::validation(format!("not an email address: '{}'", email)));
        }
        if credential_hash.trim().is_empty() {
            return Err(LedgerError::validation("credential hash is empty"));
        }

        let user = User::new(&email, credential_hash, self.now());
        let mut tx = self.backend.begin().await?;
        let outcome = Self::apply_create_user(&mut *tx, &user).await;
        finish(tx, outcome).await.inspect_err(|e| log_rejection("create_user", e))?;

        info!(user_id = %user.id, "user created");
        Ok(user)
    }

    async fn apply_create_user(tx: &mut dyn LedgerTx, user: &User) -> LedgerResult<()> {
        // The email lookup must see every registration committed before ours
        tx.lock_users().await?;
        if tx.get_user_by_email(&user.email).await?.is_some() {
            return Err(LedgerError::EmailTaken(user.email.clone()));
        }
        tx.insert_user(user).await?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: UserId) -> LedgerResult<User> {
        self.backend
            .get_user(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))
    }

    pub async fn user_by_email(&self, email: &str) -> LedgerResult<User> {
        let email = normalize_email(email);
        self.backend
            .get_user_by_email(&email)
            .await?
            .ok_or(LedgerError::UserNotFound(email))
    }

    /// Resolve a user from credentials. `verify` receives the stored hash and
    /// decides whether the presented secret matches it.
    pub async fn authenticate<F>(&self, email: &str, verify: F) -> LedgerResult<User>
    where
        F: FnOnce(&str) -> bool,
    {
        let email = normalize_email(email);
        match self.backend.get_user_by_email(&email).await? {
            Some(user) if verify(&user.credential_hash) => {
                debug!(user_id = %user.id, "authenticated");
                Ok(user)
            }
            _ => {
                warn!("authentication failed");
                Err(LedgerError::InvalidCredentials)
            }
        }
    }

    /// Remove a user together with their entries and budgets.
    pub async fn delete_user(&self, user_id: UserId) -> LedgerResult<()> {
        let mut tx = self.backend.begin().await?;
        let outcome = match tx.delete_user(user_id).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(LedgerError::UserNotFound(user_id.to_string())),
            Err(e) => Err(e.into()),
        };
        finish(tx, outcome).await.inspect_err(|e| log_rejection("delete_user", e))?;

        info!(%user_id, "user deleted");
        Ok(())
    }

    // ========================
    // Balance-changing operations
    // ========================

    /// Credit `amount_cents` and log a deposit.
    pub async fn deposit(&self, user_id: UserId, amount_cents: Cents) -> LedgerResult<Entry> {
        validate_amount(amount_cents)?;
        let entry = Entry::deposit(user_id, amount_cents, self.now());

        let mut tx = self.backend.begin().await?;
        let outcome = Self::apply_new_entry(&mut *tx, entry).await;
        let entry = finish(tx, outcome).await.inspect_err(|e| log_rejection("deposit", e))?;

        info!(%user_id, entry_id = %entry.id, amount = amount_cents, "deposit recorded");
        Ok(entry)
    }

    /// Debit `amount_cents` and log a withdrawal. The funds check runs under
    /// the user lock, not before it.
    pub async fn withdraw(
        &self,
        user_id: UserId,
        amount_cents: Cents,
        category: Option<String>,
    ) -> LedgerResult<Entry> {
        validate_amount(amount_cents)?;
        let category = self.withdrawal_category(category)?;
        let entry = Entry::withdrawal(user_id, amount_cents, self.now()).with_category(category);

        let mut tx = self.backend.begin().await?;
        let outcome = Self::apply_new_entry(&mut *tx, entry).await;
        let entry = finish(tx, outcome).await.inspect_err(|e| log_rejection("withdraw", e))?;

        info!(%user_id, entry_id = %entry.id, amount = amount_cents, "withdrawal recorded");
        Ok(entry)
    }

    async fn apply_new_entry(tx: &mut dyn LedgerTx, mut entry: Entry) -> LedgerResult<Entry> {
        let user = lock_user(tx, entry.user_id).await?;
        let balance = apply_delta(user.balance_cents, entry.signed_amount())?;

        tx.insert_entry(&mut entry).await?;
        tx.set_balance(user.id, balance).await?;
        Ok(entry)
    }

    /// Move money to the user registered under `recipient_email`: one
    /// withdrawal on the sender and one deposit on the recipient, both or
    /// neither.
    pub async fn transfer(
        &self,
        sender_id: UserId,
        recipient_email: &str,
        amount_cents: Cents,
    ) -> LedgerResult<TransferReceipt> {
        validate_amount(amount_cents)?;
        let recipient_email = normalize_email(recipient_email);
        let now = self.now();

        let mut tx = self.backend.begin().await?;
        let outcome =
            Self::apply_transfer(&mut *tx, sender_id, &recipient_email, amount_cents, now).await;
        let receipt = finish(tx, outcome).await.inspect_err(|e| log_rejection("transfer", e))?;

        info!(
            %sender_id,
            recipient_id = %receipt.received.user_id,
            transfer_id = ?receipt.sent.transfer_id,
            amount = amount_cents,
            "transfer recorded"
        );
        Ok(receipt)
    }

    async fn apply_transfer(
        tx: &mut dyn LedgerTx,
        sender_id: UserId,
        recipient_email: &str,
        amount_cents: Cents,
        now: DateTime<Utc>,
    ) -> LedgerResult<TransferReceipt> {
        let sender = lock_user(tx, sender_id).await?;
        if sender.balance_cents < amount_cents {
            return Err(LedgerError::InsufficientFunds {
                balance: sender.balance_cents,
                required: amount_cents,
            });
        }

        let recipient = tx
            .get_user_by_email(recipient_email)
            .await?
            .ok_or_else(|| LedgerError::RecipientNotFound(recipient_email.to_string()))?;
        if recipient.id == sender.id {
            return Err(LedgerError::SelfTransfer);
        }

        let sender_balance = apply_delta(sender.balance_cents, -amount_cents)?;
        let recipient_balance = apply_delta(recipient.balance_cents, amount_cents)?;

        let (mut sent, mut received) = transfer_pair(sender.id, recipient.id, amount_cents, now);
        tx.insert_entry(&mut sent).await?;
        tx.insert_entry(&mut received).await?;
        tx.set_balance(sender.id, sender_balance).await?;
        tx.set_balance(recipient.id, recipient_balance).await?;

        Ok(TransferReceipt {
            message: format!(
                "Transferred {} to {}",
                format_cents(amount_cents),
                recipient.email
            ),
            recipient_email: recipient.email,
            sent,
            received,
        })
    }

    /// Change the amount and category of a manual entry, moving the balance
    /// by the difference. Edits that would leave the balance negative are
    /// rejected.
    pub async fn edit(
        &self,
        entry_id: EntryId,
        user_id: UserId,
        new_amount_cents: Cents,
        new_category: Option<String>,
    ) -> LedgerResult<Entry> {
        validate_amount(new_amount_cents)?;

        let mut tx = self.backend.begin().await?;
        let outcome = self
            .apply_edit(&mut *tx, entry_id, user_id, new_amount_cents, new_category)
            .await;
        let (old_amount, entry) =
            finish(tx, outcome).await.inspect_err(|e| log_rejection("edit", e))?;

        info!(
            %user_id,
            %entry_id,
            old_amount,
            new_amount = new_amount_cents,
            "entry edited"
        );
        Ok(entry)
    }

    async fn apply_edit(
        &self,
        tx: &mut dyn LedgerTx,
        entry_id: EntryId,
        user_id: UserId,
        new_amount_cents: Cents,
        new_category: Option<String>,
    ) -> LedgerResult<(Cents, Entry)> {
        let user = lock_user(tx, user_id).await?;
        let mut entry = owned_entry(tx, entry_id, user_id).await?;
        if entry.is_transfer() {
            return Err(LedgerError::validation(
                "transfer entries cannot be edited; record a new transfer instead",
            ));
        }

        let category = match entry.kind {
            EntryKind::Deposit => {
                if normalize_category(new_category).is_some() {
                    return Err(LedgerError::validation("deposits do not take a category"));
                }
                None
            }
            EntryKind::Withdrawal => self.withdrawal_category(new_category)?,
        };

        let balance = apply_delta(user.balance_cents, edit_delta(&entry, new_amount_cents))?;
        let old_amount = entry.amount_cents;
        entry.amount_cents = new_amount_cents;
        entry.category = category;

        tx.update_entry(&entry).await?;
        tx.set_balance(user.id, balance).await?;
        Ok((old_amount, entry))
    }

    /// Remove a manual entry after reversing its effect on the balance.
    /// Returns the removed entry.
    pub async fn delete(&self, entry_id: EntryId, user_id: UserId) -> LedgerResult<Entry> {
        let mut tx = self.backend.begin().await?;
        let outcome = Self::apply_delete(&mut *tx, entry_id, user_id).await;
        let entry = finish(tx, outcome).await.inspect_err(|e| log_rejection("delete", e))?;

        info!(%user_id, %entry_id, kind = %entry.kind, amount = entry.amount_cents, "entry deleted");
        Ok(entry)
    }

    async fn apply_delete(
        tx: &mut dyn LedgerTx,
        entry_id: EntryId,
        user_id: UserId,
    ) -> LedgerResult<Entry> {
        let user = lock_user(tx, user_id).await?;
        let entry = owned_entry(tx, entry_id, user_id).await?;
        if entry.is_transfer() {
            return Err(LedgerError::validation("transfer entries cannot be deleted"));
        }

        let balance = apply_delta(user.balance_cents, -entry.signed_amount())?;
        tx.delete_entry(entry.id).await?;
        tx.set_balance(user.id, balance).await?;
        Ok(entry)
    }

    // ========================
    // Queries
    // ========================

    pub async fn balance(&self, user_id: UserId) -> LedgerResult<Cents> {
        Ok(self.get_user(user_id).await?.balance_cents)
    }

    pub async fn get_entry(&self, entry_id: EntryId, user_id: UserId) -> LedgerResult<Entry> {
        self.backend
            .get_entry(entry_id)
            .await?
            .filter(|e| e.user_id == user_id)
            .ok_or_else(|| LedgerError::TransactionNotFound(entry_id.to_string()))
    }

    /// Entries, most recent first.
    pub async fn history(&self, user_id: UserId, filter: &HistoryFilter) -> LedgerResult<Vec<Entry>> {
        let query = filter.to_query()?;
        self.get_user(user_id).await?;

        let entries = self.backend.list_entries(user_id, &query).await?;
        debug!(%user_id, count = entries.len(), "history listed");
        Ok(entries)
    }

    /// Withdrawal totals per category, largest first.
    pub async fn spending_by_category(
        &self,
        user_id: UserId,
        date_from: Option<NaiveDate>,
        date_to: Option<NaiveDate>,
    ) -> LedgerResult<Vec<CategoryTotal>> {
        let filter = HistoryFilter {
            date_from,
            date_to,
            limit: None,
        };
        let entries = self.history(user_id, &filter).await?;
        Ok(spending_by_category(&entries))
    }

    /// Inflows and outflows for the current calendar month.
    pub async fn monthly_summary(&self, user_id: UserId) -> LedgerResult<MonthlySummary> {
        self.monthly_summary_for(user_id, Month::containing(self.now())).await
    }

    pub async fn monthly_summary_for(
        &self,
        user_id: UserId,
        period: Month,
    ) -> LedgerResult<MonthlySummary> {
        let entries = self.entries_in_month(user_id, period).await?;
        Ok(MonthlySummary::from_entries(period, &entries))
    }

    /// The `limit` biggest spending categories of the current month.
    pub async fn top_categories(
        &self,
        user_id: UserId,
        limit: usize,
    ) -> LedgerResult<Vec<CategoryTotal>> {
        let entries = self
            .entries_in_month(user_id, Month::containing(self.now()))
            .await?;
        let mut totals = spending_by_category(&entries);
        totals.truncate(limit);
        Ok(totals)
    }

    async fn entries_in_month(&self, user_id: UserId, period: Month) -> LedgerResult<Vec<Entry>> {
        self.get_user(user_id).await?;
        let (start, end) = period.bounds();
        Ok(self
            .backend
            .list_entries(user_id, &EntryQuery::between(start, end))
            .await?)
    }

    // ========================
    // Budget operations
    // ========================

    /// Set the monthly limit for a category, replacing any existing limit.
    pub async fn set_budget(
        &self,
        user_id: UserId,
        category: &str,
        limit_cents: Cents,
        month: u32,
        year: i32,
    ) -> LedgerResult<Budget> {
        validate_amount(limit_cents)?;
        let period = validate_month(month, year)?;
        let category = normalize_category(Some(category.to_string()))
            .ok_or_else(|| LedgerError::validation("budget category is empty"))?;
        let budget = Budget::new(user_id, category, limit_cents, period);

        let mut tx = self.backend.begin().await?;
        let outcome = Self::apply_set_budget(&mut *tx, &budget).await;
        let budget = finish(tx, outcome).await.inspect_err(|e| log_rejection("set_budget", e))?;

        info!(%user_id, category = %budget.category, period = %period, limit = limit_cents, "budget set");
        Ok(budget)
    }

    async fn apply_set_budget(tx: &mut dyn LedgerTx, budget: &Budget) -> LedgerResult<Budget> {
        lock_user(tx, budget.user_id).await?;
        Ok(tx.upsert_budget(budget).await?)
    }

    pub async fn delete_budget(
        &self,
        user_id: UserId,
        category: &str,
        month: u32,
        year: i32,
    ) -> LedgerResult<()> {
        let period = validate_month(month, year)?;
        let category = category.trim();

        let mut tx = self.backend.begin().await?;
        let outcome = match tx.delete_budget(user_id, category, period).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(LedgerError::BudgetNotFound(format!("{} {}", category, period))),
            Err(e) => Err(e.into()),
        };
        finish(tx, outcome).await.inspect_err(|e| log_rejection("delete_budget", e))?;

        info!(%user_id, %category, period = %period, "budget deleted");
        Ok(())
    }

    /// Every budget of the month next to what was spent in its category.
    pub async fn budget_vs_actual(
        &self,
        user_id: UserId,
        month: u32,
        year: i32,
    ) -> LedgerResult<Vec<BudgetStatus>> {
        let period = validate_month(month, year)?;
        let entries = self.entries_in_month(user_id, period).await?;
        let spent: HashMap<String, Cents> = spending_by_category(&entries)
            .into_iter()
            .map(|t| (t.category, t.total))
            .collect();

        let budgets = self.backend.list_budgets(user_id, period).await?;
        Ok(budgets
            .into_iter()
            .map(|budget| {
                let spent = spent.get(&budget.category).copied().unwrap_or(0);
                BudgetStatus::new(budget, spent)
            })
            .collect())
    }

    // ========================
    // Integrity operations
    // ========================

    /// Compare a user's cached balance with the fold of their ledger. Takes no
    /// write lock.
    pub async fn reconcile(&self, user_id: UserId) -> LedgerResult<BalanceCheck> {
        let check = self
            .backend
            .balance_check(user_id)
            .await?
            .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))?;
        report_drift(&check);
        Ok(check)
    }

    /// Recompute a user's balance from the ledger and store it. The ledger is
    /// the source of truth.
    pub async fn repair_balance(&self, user_id: UserId) -> LedgerResult<BalanceCheck> {
        let mut tx = self.backend.begin().await?;
        let outcome = Self::apply_repair(&mut *tx, user_id).await;
        let check = finish(tx, outcome).await.inspect_err(|e| log_rejection("repair_balance", e))?;

        if !check.is_consistent() {
            warn!(
                %user_id,
                cached = check.cached,
                derived = check.derived,
                "balance repaired from ledger"
            );
        }
        Ok(check)
    }

    async fn apply_repair(tx: &mut dyn LedgerTx, user_id: UserId) -> LedgerResult<BalanceCheck> {
        let check = Self::read_balance_check(tx, user_id).await?;
        if check.derived < 0 || check.derived > MAX_CENTS {
            return Err(LedgerError::validation(format!(
                "ledger of {} folds to {}, which cannot be stored as a balance",
                check.email,
                format_cents(check.derived)
            )));
        }
        if !check.is_consistent() {
            tx.set_balance(user_id, check.derived).await?;
        }
        Ok(check)
    }

    /// Reconcile every user.
    pub async fn check_all(&self) -> LedgerResult<Vec<BalanceCheck>> {
        let users = self.backend.list_users().await?;
        let mut checks = Vec::with_capacity(users.len());
        for user in users {
            // None if the user was deleted after the listing
            if let Some(check) = self.backend.balance_check(user.id).await? {
                report_drift(&check);
                checks.push(check);
            }
        }
        Ok(checks)
    }

    async fn read_balance_check(tx: &mut dyn LedgerTx, user_id: UserId) -> LedgerResult<BalanceCheck> {
        let user = lock_user(tx, user_id).await?;
        let derived = tx.ledger_sum(user_id).await?;
        Ok(BalanceCheck {
            user_id,
            email: user.email,
            cached: user.balance_cents,
            derived,
        })
    }

    fn withdrawal_category(&self, category: Option<String>) -> LedgerResult<Option<String>> {
        let category = normalize_category(category);
        if category.is_none() && self.rules.require_withdrawal_category {
            return Err(LedgerError::validation("withdrawals need a category"));
        }
        Ok(category)
    }
}

/// Commit on success, roll back on failure. The original error wins over a
/// failed rollback.
async fn finish<T>(tx: Box<dyn LedgerTx>, outcome: LedgerResult<T>) -> LedgerResult<T> {
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                error!(error = %rollback_err, "rollback failed");
            }
            Err(err)
        }
    }
}

fn log_rejection(operation: &str, err: &LedgerError) {
    match err {
        LedgerError::Storage(e) => error!(operation, error = %format!("{e:#}"), "storage failure"),
        other => warn!(operation, error = %other, "operation rejected"),
    }
}

fn report_drift(check: &BalanceCheck) {
    if !check.is_consistent() {
        warn!(user_id = %check.user_id, drift = check.drift(), "cached balance diverges from ledger");
    }
}

async fn lock_user(tx: &mut dyn LedgerTx, user_id: UserId) -> LedgerResult<User> {
    tx.lock_user(user_id)
        .await?
        .ok_or_else(|| LedgerError::UserNotFound(user_id.to_string()))
}

/// Entries of other users are reported as missing.
async fn owned_entry(tx: &mut dyn LedgerTx, entry_id: EntryId, user_id: UserId) -> LedgerResult<Entry> {
    tx.get_entry(entry_id)
        .await?
        .filter(|e| e.user_id == user_id)
        .ok_or_else(|| LedgerError::TransactionNotFound(entry_id.to_string()))
}

fn validate_amount(amount_cents: Cents) -> LedgerResult<()> {
    if amount_cents <= 0 {
        return Err(LedgerError::validation("amount must be positive"));
    }
    if amount_cents > MAX_CENTS {
        return Err(LedgerError::validation(format!(
            "amount exceeds the maximum of {}",
            format_cents(MAX_CENTS)
        )));
    }
    Ok(())
}

fn validate_month(month: u32, year: i32) -> LedgerResult<Month> {
    Month::new(year, month)
        .ok_or_else(|| LedgerError::validation(format!("invalid month {}-{}", year, month)))
}

/// Trimmed category, or None when blank.
fn normalize_category(category: Option<String>) -> Option<String> {
    category
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
}

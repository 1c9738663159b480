use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::domain::{BalanceCheck, Budget, Cents, Entry, EntryId, Month, User, UserId};

use super::{EntryQuery, LedgerBackend, LedgerTx};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    users: HashMap<UserId, User>,
    entries: HashMap<EntryId, Entry>,
    budgets: Vec<Budget>,
    sequence: i64,
}

impl MemoryState {
    fn user_by_email(&self, email: &str) -> Option<User> {
        self.users.values().find(|u| u.email == email).cloned()
    }

    fn ledger_sum(&self, user_id: UserId) -> Cents {
        self.entries
            .values()
            .filter(|e| e.user_id == user_id)
            .map(Entry::signed_amount)
            .sum()
    }
}

/// Process-local backend. Nothing survives the process; used for tests and
/// throwaway sessions.
///
/// A unit of work holds the lock for its whole lifetime and edits a private
/// copy of the state, which replaces the shared state only on commit.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerBackend for MemoryBackend {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn LedgerTx>> {
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemoryTx { guard, work }))
    }

    async fn get_user(&self, id: UserId) -> Result<Option<User>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self.state.lock().await.user_by_email(email))
    }

    async fn list_users(&self) -> Result<Vec<User>> {
        let mut users: Vec<User> = self.state.lock().await.users.values().cloned().collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(users)
    }

    async fn get_entry(&self, id: EntryId) -> Result<Option<Entry>> {
        Ok(self.state.lock().await.entries.get(&id).cloned())
    }

    async fn list_entries(&self, user_id: UserId, query: &EntryQuery) -> Result<Vec<Entry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<Entry> = state
            .entries
            .values()
            .filter(|e| e.user_id == user_id && query.matches(e))
            .cloned()
            .collect();
        drop(state);

        entries.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.sequence.cmp(&a.sequence))
        });
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn list_budgets(&self, user_id: UserId, period: Month) -> Result<Vec<Budget>> {
        let mut budgets: Vec<Budget> = self
            .state
            .lock()
            .await
            .budgets
            .iter()
            .filter(|b| b.user_id == user_id && b.period == period)
            .cloned()
            .collect();
        budgets.sort_by(|a, b| a.category.cmp(&b.category));
        Ok(budgets)
    }

    async fn ledger_sum(&self, user_id: UserId) -> Result<Cents> {
        Ok(self.state.lock().await.ledger_sum(user_id))
    }

    async fn balance_check(&self, user_id: UserId) -> Result<Option<BalanceCheck>> {
        let state = self.state.lock().await;
        Ok(state.users.get(&user_id).map(|user| BalanceCheck {
            user_id,
            email: user.email.clone(),
            cached: user.balance_cents,
            derived: state.ledger_sum(user_id),
        }))
    }
}

struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    work: MemoryState,
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn lock_user(&mut self, id: UserId) -> Result<Option<User>> {
        // The whole state is already locked
        Ok(self.work.users.get(&id).cloned())
    }

    async fn lock_users(&mut self) -> Result<()> {
        Ok(())
    }

    async fn get_user_by_email(&mut self, email: &str) -> Result<Option<User>> {
        Ok(self.work.user_by_email(email))
    }

    async fn insert_user(&mut self, user: &User) -> Result<()> {
        if self.work.users.contains_key(&user.id) {
            bail!("Failed to save user: duplicate id {}", user.id);
        }
        if self.work.user_by_email(&user.email).is_some() {
            bail!("Failed to save user: email already stored");
        }
        if user.balance_cents < 0 {
            bail!("Failed to save user: negative balance");
        }
        self.work.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn delete_user(&mut self, id: UserId) -> Result<bool> {
        if self.work.users.remove(&id).is_none() {
            return Ok(false);
        }
        self.work.entries.retain(|_, e| e.user_id != id);
        self.work.budgets.retain(|b| b.user_id != id);
        Ok(true)
    }

    async fn set_balance(&mut self, id: UserId, balance: Cents) -> Result<()> {
        if balance < 0 {
            bail!("Failed to update balance: negative balance");
        }
        match self.work.users.get_mut(&id) {
            Some(user) => {
                user.balance_cents = balance;
                Ok(())
            }
            None => bail!("Failed to update balance: unknown user {}", id),
        }
    }

    async fn insert_entry(&mut self, entry: &mut Entry) -> Result<()> {
        if !self.work.users.contains_key(&entry.user_id) {
            bail!("Failed to save entry: unknown user {}", entry.user_id);
        }
        if self.work.entries.contains_key(&entry.id) {
            bail!("Failed to save entry: duplicate id {}", entry.id);
        }
        if entry.amount_cents <= 0 {
            bail!("Failed to save entry: non-positive amount");
        }
        self.work.sequence += 1;
        entry.sequence = self.work.sequence;
        self.work.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Option<Entry>> {
        Ok(self.work.entries.get(&id).cloned())
    }

    async fn update_entry(&mut self, entry: &Entry) -> Result<()> {
        match self.work.entries.get_mut(&entry.id) {
            Some(stored) => {
                stored.amount_cents = entry.amount_cents;
                stored.category = entry.category.clone();
                Ok(())
            }
            None => bail!("Failed to update entry: unknown entry {}", entry.id),
        }
    }

    async fn delete_entry(&mut self, id: EntryId) -> Result<()> {
        match self.work.entries.remove(&id) {
            Some(_) => Ok(()),
            None => bail!("Failed to delete entry: unknown entry {}", id),
        }
    }

    async fn ledger_sum(&mut self, user_id: UserId) -> Result<Cents> {
        Ok(self.work.ledger_sum(user_id))
    }

    async fn upsert_budget(&mut self, budget: &Budget) -> Result<Budget> {
        if !self.work.users.contains_key(&budget.user_id) {
            bail!("Failed to save budget: unknown user {}", budget.user_id);
        }
        let existing = self.work.budgets.iter_mut().find(|b| {
            b.user_id == budget.user_id && b.category == budget.category && b.period == budget.period
        });
        match existing {
            Some(stored) => {
                stored.limit_cents = budget.limit_cents;
                Ok(stored.clone())
            }
            None => {
                self.work.budgets.push(budget.clone());
                Ok(budget.clone())
            }
        }
    }

    async fn delete_budget(&mut self, user_id: UserId, category: &str, period: Month) -> Result<bool> {
        let before = self.work.budgets.len();
        self.work
            .budgets
            .retain(|b| !(b.user_id == user_id && b.category == category && b.period == period));
        Ok(self.work.budgets.len() != before)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTx { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Cents, Entry, EntryKind, MAX_CENTS, UserId};

/// Compute a user's balance as the fold of their entries.
/// Deposits add, withdrawals subtract. Entries of other users are ignored.
pub fn compute_balance(user_id: UserId, entries: &[Entry]) -> Cents {
    entries
        .iter()
        .filter(|e| e.user_id == user_id)
        .fold(0, |balance, entry| balance + entry.signed_amount())
}

/// Apply a signed delta to a balance, refusing overflow and results
/// below zero.
pub fn apply_delta(balance: Cents, delta: Cents) -> Result<Cents, BalanceError> {
    let next = balance
        .checked_add(delta)
        .filter(|b| *b <= MAX_CENTS)
        .ok_or(BalanceError::Overflow)?;
    if next < 0 {
        return Err(BalanceError::Insufficient {
            balance,
            required: -delta,
        });
    }
    Ok(next)
}

/// Balance change caused by replacing `old` with an entry of the same kind
/// holding `new_amount`: undo the old effect, apply the new one.
pub fn edit_delta(old: &Entry, new_amount: Cents) -> Cents {
    old.kind.signed(new_amount) - old.signed_amount()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceError {
    Insufficient { balance: Cents, required: Cents },
    Overflow,
}

impl std::fmt::Display for BalanceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BalanceError::Insufficient { balance, required } => write!(
                f,
                "balance of {} cents cannot cover {} cents",
                balance, required
            ),
            BalanceError::Overflow => write!(f, "balance would exceed the supported range"),
        }
    }
}

impl std::error::Error for BalanceError {}

/// Total withdrawn in one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryTotal {
    pub category: String,
    pub total: Cents,
    pub count: i64,
}

/// Sum categorized withdrawals per category, largest total first
/// (ties broken by category name). Deposits and uncategorized withdrawals
/// are excluded.
pub fn spending_by_category(entries: &[Entry]) -> Vec<CategoryTotal> {
    let mut totals: HashMap<&str, (Cents, i64)> = HashMap::new();

    for entry in entries {
        if entry.kind != EntryKind::Withdrawal {
            continue;
        }
        if let Some(category) = entry.category.as_deref() {
            let slot = totals.entry(category).or_insert((0, 0));
            slot.0 += entry.amount_cents;
            slot.1 += 1;
        }
    }

    let mut result: Vec<CategoryTotal> = totals
        .into_iter()
        .map(|(category, (total, count))| CategoryTotal {
            category: category.to_string(),
            total,
            count,
        })
        .collect();
    result.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.category.cmp(&b.category)));
    result
}

/// Inflow/outflow totals over a set of entries.
pub fn flow_totals(entries: &[Entry]) -> (Cents, Cents) {
    entries.iter().fold((0, 0), |(inflows, outflows), entry| match entry.kind {
        EntryKind::Deposit => (inflows + entry.amount_cents, outflows),
        EntryKind::Withdrawal => (inflows, outflows + entry.amount_cents),
    })
}

/// Outcome of comparing a cached balance with the ledger fold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCheck {
    pub user_id: UserId,
    pub email: String,
    pub cached: Cents,
    pub derived: Cents,
}

impl BalanceCheck {
    pub fn is_consistent(&self) -> bool {
        self.cached == self.derived
    }

    pub fn drift(&self) -> Cents {
        self.cached - self.derived
    }
}

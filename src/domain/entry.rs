use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Cents, UserId};

pub type EntryId = Uuid;
pub type TransferId = Uuid;

/// Direction of an entry. Amounts are always positive; the kind carries the sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Deposit,
    Withdrawal,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Deposit => "deposit",
            EntryKind::Withdrawal => "withdrawal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "deposit" => Some(EntryKind::Deposit),
            "withdrawal" => Some(EntryKind::Withdrawal),
            _ => None,
        }
    }

    /// Signed effect of `amount` on the owner's balance.
    pub fn signed(&self, amount: Cents) -> Cents {
        match self {
            EntryKind::Deposit => amount,
            EntryKind::Withdrawal => -amount,
        }
    }
}

impl std::fmt::Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where an entry came from. Kept separate from the category so transfer
/// bookkeeping never pollutes spending reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    Manual,
    TransferSent,
    TransferReceived,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Manual => "manual",
            Provenance::TransferSent => "transfer-sent",
            Provenance::TransferReceived => "transfer-received",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Provenance::Manual),
            "transfer-sent" => Some(Provenance::TransferSent),
            "transfer-received" => Some(Provenance::TransferReceived),
            _ => None,
        }
    }

    pub fn is_transfer(&self) -> bool {
        !matches!(self, Provenance::Manual)
    }
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One line of a user's transaction log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    /// Global insertion counter, assigned by storage. Breaks timestamp ties.
    pub sequence: i64,
    pub user_id: UserId,
    pub kind: EntryKind,
    /// Always positive
    pub amount_cents: Cents,
    pub category: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub provenance: Provenance,
    /// Shared by both sides of a transfer
    pub transfer_id: Option<TransferId>,
}

impl Entry {
    /// Create a manual entry. Sequence number must be assigned by storage.
    pub fn new(user_id: UserId, kind: EntryKind, amount_cents: Cents, timestamp: DateTime<Utc>) -> Self {
        assert!(amount_cents > 0, "Entry amount must be positive");
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            user_id,
            kind,
            amount_cents,
            category: None,
            timestamp,
            provenance: Provenance::Manual,
            transfer_id: None,
        }
    }

    pub fn deposit(user_id: UserId, amount_cents: Cents, timestamp: DateTime<Utc>) -> Self {
        Self::new(user_id, EntryKind::Deposit, amount_cents, timestamp)
    }

    pub fn withdrawal(user_id: UserId, amount_cents: Cents, timestamp: DateTime<Utc>) -> Self {
        Self::new(user_id, EntryKind::Withdrawal, amount_cents, timestamp)
    }

    pub fn with_category(mut self, category: Option<String>) -> Self {
        self.category = category;
        self
    }

    pub fn with_transfer(mut self, transfer_id: TransferId, provenance: Provenance) -> Self {
        self.transfer_id = Some(transfer_id);
        self.provenance = provenance;
        self
    }

    /// Signed effect of this entry on its owner's balance.
    pub fn signed_amount(&self) -> Cents {
        self.kind.signed(self.amount_cents)
    }

    pub fn is_transfer(&self) -> bool {
        self.provenance.is_transfer()
    }
}

/// Build the two sides of a transfer: one withdrawal on the sender and one
/// deposit on the recipient, sharing a timestamp and a transfer id.
pub fn transfer_pair(
    sender: UserId,
    recipient: UserId,
    amount_cents: Cents,
    timestamp: DateTime<Utc>,
) -> (Entry, Entry) {
    let transfer_id = Uuid::new_v4();
    let sent = Entry::withdrawal(sender, amount_cents, timestamp)
        .with_transfer(transfer_id, Provenance::TransferSent);
    let received = Entry::deposit(recipient, amount_cents, timestamp)
        .with_transfer(transfer_id, Provenance::TransferReceived);
    (sent, received)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_amount_follows_kind() {
        let user = Uuid::new_v4();
        assert_eq!(Entry::deposit(user, 5000, Utc::now()).signed_amount(), 5000);
        assert_eq!(Entry::withdrawal(user, 5000, Utc::now()).signed_amount(), -5000);
    }

    #[test]
    fn test_transfer_pair() {
        let (sender, recipient) = (Uuid::new_v4(), Uuid::new_v4());
        let now = Utc::now();
        let (sent, received) = transfer_pair(sender, recipient, 10000, now);

        assert_eq!(sent.user_id, sender);
        assert_eq!(sent.kind, EntryKind::Withdrawal);
        assert_eq!(sent.provenance, Provenance::TransferSent);
        assert_eq!(received.user_id, recipient);
        assert_eq!(received.kind, EntryKind::Deposit);
        assert_eq!(received.provenance, Provenance::TransferReceived);
        assert_eq!(sent.transfer_id, received.transfer_id);
        assert_eq!(sent.timestamp, received.timestamp);
        assert!(sent.category.is_none() && received.category.is_none());
    }

    #[test]
    fn test_provenance_strings() {
        for p in [Provenance::Manual, Provenance::TransferSent, Provenance::TransferReceived] {
            assert_eq!(Provenance::from_str(p.as_str()), Some(p));
        }
        assert!(!Provenance::Manual.is_transfer());
    }

    #[test]
    #[should_panic(expected = "Entry amount must be positive")]
    fn test_entry_requires_positive_amount() {
        Entry::deposit(Uuid::new_v4(), 0, Utc::now());
    }
}

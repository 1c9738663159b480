use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Cents;

pub type UserId = Uuid;

/// A ledger owner. Identity and credentials belong to the authentication
/// collaborator; the balance belongs to the ledger and is only ever changed
/// by ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Normalized (trimmed, lowercase) email, unique across users
    pub email: String,
    /// Opaque credential hash produced by the authentication collaborator
    #[serde(skip_serializing)]
    pub credential_hash: String,
    /// Cached balance; always equal to the fold of the user's entries
    pub balance_cents: Cents,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: &str, credential_hash: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: normalize_email(email),
            credential_hash: credential_hash.into(),
            balance_cents: 0,
            created_at,
        }
    }
}

/// Emails are compared case-insensitively and without surrounding whitespace.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Minimal shape check: something on both sides of a single `@`.
pub fn is_plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && !domain.is_empty() && !domain.contains('@')
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user_starts_empty_with_normalized_email() {
        let user = User::new("  Alice@Example.COM ", "hash", Utc::now());
        assert_eq!(user.email, "alice@example.com");
        assert_eq!(user.balance_cents, 0);
    }

    #[test]
    fn test_plausible_email() {
        assert!(is_plausible_email("a@b.c"));
        assert!(!is_plausible_email("ab.c"));
        assert!(!is_plausible_email("@b.c"));
        assert!(!is_plausible_email("a@"));
        assert!(!is_plausible_email("a@b@c"));
    }
}

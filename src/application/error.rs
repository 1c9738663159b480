use thiserror::Error;

use crate::domain::{BalanceError, Cents, format_cents};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error(
        "Insufficient funds: balance {}, required {}",
        format_cents(*.balance),
        format_cents(*.required)
    )]
    InsufficientFunds { balance: Cents, required: Cents },

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("Budget not found: {0}")]
    BudgetNotFound(String),

    #[error("Cannot transfer to yourself")]
    SelfTransfer,

    #[error("Email already registered: {0}")]
    EmailTaken(String),

    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// True for every "unknown id / email" variant.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::UserNotFound(_)
                | Self::RecipientNotFound(_)
                | Self::TransactionNotFound(_)
                | Self::BudgetNotFound(_)
        )
    }
}

impl From<BalanceError> for LedgerError {
    fn from(err: BalanceError) -> Self {
        match err {
            BalanceError::Insufficient { balance, required } => {
                Self::InsufficientFunds { balance, required }
            }
            BalanceError::Overflow => Self::Validation(err.to_string()),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

pub mod application;
pub mod cli;
pub mod config;
pub mod domain;
pub mod storage;

pub use application::{LedgerError, LedgerResult, LedgerService};
pub use config::AppConfig;
pub use domain::*;
pub use storage::{LedgerBackend, LedgerTx};

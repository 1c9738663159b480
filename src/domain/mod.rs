mod budget;
mod entry;
mod ledger;
mod money;
mod user;

pub use budget::*;
pub use entry::*;
pub use ledger::*;
pub use money::*;
pub use user::*;

mod content_store;
mod ledger;

pub use content_store::*;
pub use ledger::*;

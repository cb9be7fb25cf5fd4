pub mod ledger;
pub mod profile;

pub use ledger::Model as LedgerRow;
pub use profile::Model as ProfileRow;

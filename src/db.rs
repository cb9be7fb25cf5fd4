//! SQL storage over sea-orm. Enabled by the `sqlite` or `pg` feature.
#![cfg(feature = "db")]
pub mod driver;
pub mod entity;
pub mod migrations;

pub use driver::SqlConnection;
pub use driver::SqlConnectionManager;
pub use migrations::Migrator;

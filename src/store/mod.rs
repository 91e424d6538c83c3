//! Persistence layer — SQLite-backed storage for job records and the
//! processed-id ledger.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;

/// Database Module
///
/// This module provides the database layer the session engine delegates
/// statement execution to, organized into focused submodules.
///
/// ## Architecture
///
/// - **Driver Contract** (`driver.rs`): the capability interface every backend implements
/// - **SQLite Driver** (`sqlite.rs`): the bundled backend built on rusqlite
/// - **Statement Helpers** (`statement.rs`): classification, splitting and normalization of SQL text
///
/// ## Error Handling
///
/// Drivers report failures as `DriverError` values; nothing panics or
/// unwinds across the driver boundary.
pub mod driver;
pub mod sqlite;
pub mod statement;

pub use driver::*;
pub use sqlite::{SqliteDriver, SqliteDriverFactory};
pub use statement::*;

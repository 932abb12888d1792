// Core infrastructure modules
pub mod config;
pub mod core;

// Session engine components
pub mod cache;
pub mod executor;
pub mod history;
pub mod registry;
pub mod session;
pub mod transaction;

// Line-oriented front end
pub mod repl;

#[cfg(test)]
pub(crate) mod test_utils;

pub use crate::core::{Result, SessionError};
pub use session::{ExecuteOptions, Session};

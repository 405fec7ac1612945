//! bgfetch storage layer
//!
//! SQLite persistence for request metadata that has to outlive a process.
//! All multi-row writes go through `Database::transaction`.

mod database;
mod error;
mod migrations;

pub use database::Database;
pub use error::StorageError;

pub type Result<T> = std::result::Result<T, StorageError>;

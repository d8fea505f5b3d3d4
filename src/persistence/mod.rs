//! Persistence - SQLite database and the admin key file

mod database;
mod key_file;

pub use database::{Database, HistoryEvent};
pub use key_file::{KeyFile, StoredKey};

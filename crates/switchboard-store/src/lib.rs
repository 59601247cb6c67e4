pub mod database;
pub mod directory;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod store;

pub use database::Database;
pub use error::StoreError;
pub use store::{SaveOutcome, SessionStore, SqliteStore};

//! Persistent state: policies, triggers, transaction history and queued tasks.
//!
//! Query modules take a `&Connection` so the same calls work on the shared
//! connection and inside [`Database::with_transaction`].

pub mod database;
pub mod policies;
pub mod schema;
pub mod tasks;
pub mod transactions;
pub mod triggers;

pub use database::Database;

use std::sync::Arc;
use tokio::sync::Mutex;

/// Database handle shared between the scheduler, the queue and the pipeline.
pub type SharedDb = Arc<Mutex<Database>>;

/// Wrap a database for sharing across tasks.
pub fn shared(db: Database) -> SharedDb {
    Arc::new(Mutex::new(db))
}

//! Durable outbox for channel deliveries.
//!
//! Entries move `pending -> sending -> {done | pending | dlq}`. The store
//! implementations share one contract ([`OutboxStore`]); the dispatcher,
//! sweeper and operator surface only ever see `Arc<dyn OutboxStore>`.

pub mod error;
pub mod memory;
pub mod outbox;
pub mod recovery;
pub mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use error::{OutboxError, Result};
pub use memory::MemoryOutboxStore;
pub use outbox::{validate_new_entry, Outbox};
pub use recovery::RecoveryTask;
pub use store::OutboxStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteOutboxStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresOutboxStore;

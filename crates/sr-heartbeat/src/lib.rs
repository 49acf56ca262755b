//! Scheduler liveness for Signal Relay.
//!
//! The scheduling process writes a [`HeartbeatRecord`] at a fixed interval;
//! the [`HeartbeatMonitor`] reports a stall when the record is older than the
//! TTL and invokes a [`StallHandler`] (log only, or an external restart
//! command).

pub mod error;
pub mod monitor;
pub mod store;
pub mod writer;

pub use error::{HeartbeatError, Result};
pub use monitor::{CommandStallHandler, HeartbeatMonitor, HeartbeatStatus, LogStallHandler, StallHandler};
pub use store::{HeartbeatRecord, HeartbeatStore, MemoryHeartbeatStore, RedisHeartbeatStore};
pub use writer::HeartbeatWriter;

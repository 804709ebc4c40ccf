//! Local event queue
//!
//! Pending events are buffered in SQLite until a dispatcher generation
//! delivers them. The store is the only state shared between the caller
//! path and the delivery path; every operation takes the connection lock
//! for its own duration only, never across network I/O.

pub mod queue;
pub mod schema;

pub use queue::{Batch, EventStore, PendingRecord};

//! # gametrics-core
//!
//! Client SDK for game telemetry: events are buffered in a durable local
//! queue and uploaded in signed, per-category batches to a remote
//! collection endpoint.
//!
//! ## Architecture
//!
//! - **Facade** ([`Gametrics`]): the public surface; validates session
//!   state, queues events off the caller's path, and triggers delivery.
//! - **EventStore**: mutex-guarded SQLite queue; a drain snapshots pending
//!   records into immutable batches, and only a confirmed upload deletes
//!   the exact sequence ids a batch captured.
//! - **Dispatcher**: background delivery generation; waits out the send
//!   interval, waits for connectivity, then signs and POSTs each batch.
//!   At most one generation is active at a time.
//! - **SessionManager**: session identity with inactivity timeout.
//!
//! Analytics must never crash or stall the host game: nothing in this
//! crate panics into the caller, and every failure ends in a `tracing`
//! event.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gametrics_core::{Config, Gametrics};
//!
//! let config = Config::new("game-key", "secret-key");
//! let client = Gametrics::initialise(config).expect("failed to initialise");
//!
//! client.start_session("MainMenu");
//! client.design_event("Tutorial:Start", 1.0);
//! client.business_event("Buy:Gems", "USD", 499);
//! ```

// Re-export commonly used items at the crate root
pub use client::{install_panic_hook, Gametrics};
pub use config::{Config, DeviceInfo, LoggingConfig};
pub use dispatcher::{DispatchMode, DispatchOutcome, Dispatcher};
pub use error::{Error, Result};
pub use events::{Category, Event, EventEnvelope, EventPayload, Gender, UserFields};
pub use net::{AlwaysOnline, CollectorClient, Connectivity, DeliveryOutcome};
pub use session::{SessionHandle, SessionManager};
pub use store::{Batch, EventStore, PendingRecord};

// Public modules
pub mod auth;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod logging;
pub mod net;
pub mod session;
pub mod store;

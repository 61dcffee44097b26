//! e2cast Core - shared library for the e2cast streaming gateway.
//!
//! This crate provides the core functionality for e2cast, a control plane
//! that turns an Enigma2 satellite/cable receiver into an IPTV backend:
//! play intents go in, live HLS comes out. It is designed to be embedded
//! by the standalone headless server.
//!
//! # Architecture
//!
//! The crate is organized into several modules:
//!
//! - [`api`]: HTTP control plane (intents, session state, HLS serving)
//! - [`session`]: session model, lifecycle FSM, orchestrator and workers
//! - [`store`]: session/lease/idempotency storage (memory, btree, lsm)
//! - [`services`]: lease manager and the GC sweeper
//! - [`receiver`]: Enigma2 Web API client (stream URLs, bouquets, EPG)
//! - [`probe`]: media probing and the remux decision
//! - [`encoder`]: encoder argument strategies, stderr classification and
//!   child-process supervision
//! - [`hls`]: atomic artifact publication and the playable-on-READY gate
//! - [`vod`]: recording remux builds and the disk-pressure cache
//! - [`events`]: domain events and the emitter abstraction
//! - [`error`]: centralized error types
//!
//! # Lifecycle guarantees
//!
//! - A session id returned by the intent API is stable across identical
//!   concurrent intents (atomic put-or-get admission).
//! - READY is only ever announced with a playlist and at least one media
//!   segment on disk.
//! - State transitions follow a fixed table; terminal states are final.
//! - All leases are flushed at startup; this is a single-node control
//!   plane and the process is the only lease writer.

#![warn(clippy::all)]

pub mod api;
pub mod bootstrap;
pub mod encoder;
pub mod error;
pub mod events;
pub mod hls;
pub mod idempotency;
pub mod lifecycle;
pub mod metrics;
pub mod probe;
pub mod protocol_constants;
pub mod receiver;
pub mod services;
pub mod session;
pub mod state;
pub mod store;
pub mod utils;
pub mod vod;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError};
pub use bootstrap::{bootstrap_services, BootstrapError, BootstrappedServices};
pub use error::{E2castError, E2castResult, ErrorCode};
pub use events::{CacheEvent, EventEmitter, LoggingEventEmitter, NoopEventEmitter, SessionEvent};
pub use lifecycle::Lifecycle;
pub use metrics::Metrics;
pub use session::{Orchestrator, Profile, Reason, Session, SessionState};
pub use state::{Config, WorkerMode};
pub use store::{open_store, SessionStore, StoreError};
pub use utils::now_millis;

// Re-export receiver types
pub use receiver::{Bouquet, EpgEvent, ReceiverClient, ServiceEntry, StreamResolver};

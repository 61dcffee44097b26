//! Enigma2 receiver Web API client (OpenWebif).
//!
//! The control plane treats the receiver as an unreliable collaborator:
//! every call is retried with bounded backoff, classified on failure, and
//! cancellable. The one hard rule lives here: the live stream URL is
//! always resolved per tune, never assembled from a hardcoded port - the
//! receiver allocates stream ports dynamically (encrypted channels route
//! through a secondary relay on a different port).

mod client;
mod types;

pub use client::{ReceiverClient, ReceiverError, ReceiverResult, StreamResolver};
pub use types::{Bouquet, EpgEvent, ServiceEntry};

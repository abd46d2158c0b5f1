//! Chat Sentinel - realtime chat session core
//!
//! Manages one live conversation at a time over a websocket channel, keeps a
//! deduplicated message ledger, composes the friend roster with suspicion
//! flags and drives bot-analysis polling for the selected peer.

pub mod analysis;
pub mod api;
pub mod config;
pub mod credential;
pub mod error;
pub mod events;
pub mod ledger;
pub mod messages;
pub mod roster;
pub mod session;
pub mod transport;

pub use error::{Error, Result};

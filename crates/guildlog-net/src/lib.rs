//! Guild Log Network Library
//!
//! Wire framing and the client-side replica for the guild log protocol.
//!
//! # Modules
//!
//! - [`frame`]: JSON array frames and error codes (cgp/0.1)
//! - [`replica`]: mirror reducer with dedup, gap detection, head pinning
//! - [`client`]: relay connection with reconnect backoff and peer gossip

pub mod client;
pub mod frame;
pub mod replica;

pub use frame::{ErrorCode, Frame, PROTOCOL};
pub use replica::Replica;

//! Guild Log Core Library
//!
//! This crate provides the event model, canonical encoding, cryptographic
//! primitives, state reducer, and permission validator for the guild log
//! protocol (cgp/0.1).
//!
//! # Modules
//!
//! - [`event`]: Event bodies, event ids, chain validation
//! - [`canonical`]: Deterministic serialization for hashing/signing
//! - [`crypto`]: secp256k1 keys, signatures, ECDH, payload AEAD
//! - [`state`]: Guild state and the deterministic reducer
//! - [`history`]: message history rendering over a log scan
//! - [`validate`]: Permission/eligibility predicate
//! - [`error`]: Error types

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod event;
pub mod history;
pub mod state;
pub mod validate;

pub use error::{Error, Result};
pub use event::*;
pub use state::GuildState;

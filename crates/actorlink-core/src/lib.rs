//! actorlink core library
//!
//! Identifiers, envelopes and canonical encoding shared by every actorlink
//! crate.
//!
//! # Modules
//!
//! - [`types`]: Node and actor identifiers, envelopes
//! - [`trace`]: Correlation id generation
//! - [`canonical`]: Deterministic serialization for hashing
//! - [`digest`]: Topology digests
//! - [`error`]: Error types

pub mod canonical;
pub mod digest;
pub mod error;
pub mod trace;
pub mod types;

pub use error::{Error, Result};
pub use trace::TraceIdGenerator;
pub use types::*;

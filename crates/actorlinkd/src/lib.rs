//! actorlinkd library
//!
//! Command-line configuration and the service loop around an
//! [`actorlink_net::Node`].

pub mod config;
pub mod server;

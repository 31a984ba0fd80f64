//! Topology digests
//!
//! A digest summarises a node's view of the cluster so that two peers can
//! cheaply notice when their views diverge. It uses BLAKE3 with a domain
//! separation prefix over canonical bytes.

use crate::canonical::{canonical_bytes, normalize_repeated};
use crate::error::Result;
use crate::types::{LaunchId, NodeId};
use blake3::Hasher;

/// Domain prefix for topology digests
pub const DOMAIN_TOPOLOGY: &[u8] = b"actorlink-topology";

/// Length of a topology digest in bytes
pub const DIGEST_LEN: usize = 32;

/// Compute the topology digest of a set of node incarnations.
///
/// `digest = BLAKE3("actorlink-topology" || canonical_bytes(sorted members))`
///
/// Input order does not matter; duplicates are ignored.
pub fn topology_digest(members: &[(NodeId, LaunchId)]) -> Result<[u8; DIGEST_LEN]> {
    let mut members = members.to_vec();
    normalize_repeated(&mut members);
    let bytes = canonical_bytes(&members)?;

    let mut hasher = Hasher::new();
    hasher.update(DOMAIN_TOPOLOGY);
    hasher.update(&bytes);

    Ok(*hasher.finalize().as_bytes())
}

/// Short hex form of a digest for log lines
pub fn short_hex(digest: &[u8]) -> String {
    hex::encode(&digest[..digest.len().min(8)])
}

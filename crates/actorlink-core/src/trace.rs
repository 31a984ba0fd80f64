//! Correlation id generation
//!
//! Layout (64 bits, most significant first):
//!
//! ```text
//! | 0 | unix secs (25b) | node_id (16b) | chunk (12b) | counter (10b) |
//! ```
//!
//! The counter runs 1..=1023 inside a chunk; a new chunk is claimed when it
//! is exhausted, so two ids generated in the same second never collide until
//! 4096 chunks have been used.

use crate::types::{CorrelationId, NodeId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const COUNTER_BITS: u32 = 10;
const CHUNK_BITS: u32 = 12;
const NODE_BITS: u32 = 16;
const IDS_PER_CHUNK: u64 = (1 << COUNTER_BITS) - 1;
const CHUNK_MASK: u64 = (1 << CHUNK_BITS) - 1;
const SECS_MASK: u64 = (1 << 25) - 1;

/// Per-node correlation id generator
#[derive(Debug)]
pub struct TraceIdGenerator {
    node: NodeId,
    issued: AtomicU64,
}

impl TraceIdGenerator {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            issued: AtomicU64::new(0),
        }
    }

    /// Generate the next correlation id
    pub fn generate(&self) -> CorrelationId {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.generate_at(secs)
    }

    fn generate_at(&self, unix_secs: u64) -> CorrelationId {
        let seq = self.issued.fetch_add(1, Ordering::Relaxed);
        let chunk = (seq / IDS_PER_CHUNK) & CHUNK_MASK;
        let counter = seq % IDS_PER_CHUNK + 1;

        let bottom = (chunk << COUNTER_BITS) | counter;
        let node = u64::from(self.node.get()) << (CHUNK_BITS + COUNTER_BITS);
        let time = (unix_secs & SECS_MASK) << (NODE_BITS + CHUNK_BITS + COUNTER_BITS);

        CorrelationId(time | node | bottom)
    }
}

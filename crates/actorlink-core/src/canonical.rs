//! Canonical encoding
//!
//! Hashed objects use the compact rmp-serde encoding with these constraints:
//! - No maps/hashmaps
//! - Repeated fields must be sorted and deduped
//! - Field order is Rust struct field order

use crate::error::Result;
use serde::Serialize;

/// Serialize a value to canonical MessagePack bytes.
///
/// Structs are encoded as arrays, so two implementations agreeing on field
/// order produce identical bytes.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec(value)?)
}

/// Sort and dedup a repeated field in place.
pub fn normalize_repeated<T: Ord>(items: &mut Vec<T>) {
    items.sort();
    items.dedup();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActorAddr, GroupNo, NodeId};

    #[test]
    fn test_canonical_bytes_deterministic() {
        let addr = ActorAddr::new(NodeId::new(4).unwrap(), GroupNo::new(1).unwrap(), 12).unwrap();
        let value = (addr, "name", vec![1u8, 2, 3]);

        let bytes1 = canonical_bytes(&value).unwrap();
        let bytes2 = canonical_bytes(&value).unwrap();
        assert_eq!(bytes1, bytes2);
    }

    #[test]
    fn test_normalize_repeated() {
        let mut items = vec![3, 1, 2, 3, 1];
        normalize_repeated(&mut items);
        assert_eq!(items, vec![1, 2, 3]);
    }
}

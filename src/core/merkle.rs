use sha2::{Digest, Sha256};

use crate::core::types::{Hash256, EMPTY_HASH};

/// Root of the binary hash tree over `leaves` (transaction encodings).
///
/// A leaf's value is SHA-256 of its bytes; an internal node's value is
/// SHA-256 of the concatenated children. A level with odd cardinality
/// duplicates its last node before pairing. The root over a single leaf is
/// the leaf hash itself.
pub fn merkle_root(leaves: &[Vec<u8>]) -> Hash256 {
    if leaves.is_empty() {
        return EMPTY_HASH;
    }

    let mut level: Vec<Hash256> = leaves.iter().map(|bytes| sha256(bytes)).collect();

    while level.len() > 1 {
        if level.len() % 2 != 0 {
            let last = *level.last().expect("non-empty level");
            level.push(last);
        }

        let mut next = Vec::with_capacity(level.len() / 2);
        for pair in level.chunks(2) {
            let mut combined = Vec::with_capacity(64);
            combined.extend_from_slice(&pair[0]);
            combined.extend_from_slice(&pair[1]);
            next.push(sha256(&combined));
        }
        level = next;
    }

    level[0]
}

fn sha256(data: &[u8]) -> Hash256 {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_leaf_is_its_hash() {
        let root = merkle_root(&[b"tx0".to_vec()]);
        assert_eq!(root, sha256(b"tx0"));
    }

    #[test]
    fn test_two_leaves() {
        let left = sha256(b"tx0");
        let right = sha256(b"tx1");
        let mut combined = Vec::new();
        combined.extend_from_slice(&left);
        combined.extend_from_slice(&right);
        let root = merkle_root(&[b"tx0".to_vec(), b"tx1".to_vec()]);
        assert_eq!(root, sha256(&combined));
    }

    #[test]
    fn test_odd_level_duplicates_last() {
        // Three leaves hash like four with the last one doubled.
        let three = merkle_root(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        let four = merkle_root(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"c".to_vec()]);
        assert_eq!(three, four);
    }

    #[test]
    fn test_order_matters() {
        let ab = merkle_root(&[b"a".to_vec(), b"b".to_vec()]);
        let ba = merkle_root(&[b"b".to_vec(), b"a".to_vec()]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(merkle_root(&[]), EMPTY_HASH);
    }
}

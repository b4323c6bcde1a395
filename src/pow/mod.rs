//! Proof-of-work over the canonical block header tuple.
//!
//! The preimage is `prev_hash || merkle_root || be64(nonce) ||
//! be64(difficulty) || be64(timestamp)`; the digest is a single SHA-256. A
//! candidate wins when the digest, read as a 256-bit big-endian integer, is
//! strictly below `2^(256 - difficulty)`. The merkle root is the block's
//! stored field, fixed at construction time and never recomputed here.

use num_bigint::BigUint;
use num_traits::One;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::Receiver;

use crate::core::types::{unix_now, Block, Hash256};

/// Refresh the block timestamp every this many nonces.
const TIMESTAMP_REFRESH_INTERVAL: i64 = 1_000;

/// Poll the cancellation channel every this many nonces.
const CANCEL_POLL_INTERVAL: i64 = 10_000;

/// Result of a proof-of-work search.
#[derive(Debug, PartialEq, Eq)]
pub enum SearchResult {
    Found,
    Cancelled,
}

/// The numeric target for a difficulty: `2^(256 - difficulty)`.
pub fn target(difficulty: u32) -> BigUint {
    BigUint::one() << (256 - difficulty as usize)
}

/// Digest of the canonical header tuple for a given nonce.
pub fn header_digest(block: &Block, nonce: i64) -> Hash256 {
    let mut preimage = Vec::with_capacity(88);
    preimage.extend_from_slice(&block.prev_hash);
    preimage.extend_from_slice(&block.merkle_root);
    preimage.extend_from_slice(&nonce.to_be_bytes());
    preimage.extend_from_slice(&(block.difficulty as i64).to_be_bytes());
    preimage.extend_from_slice(&block.timestamp.to_be_bytes());

    let digest = Sha256::digest(&preimage);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Search for a winning nonce, enumerating from 0 upward.
///
/// The block's timestamp is refreshed to the current wall clock every
/// ~1,000 iterations, and the cancellation channel is polled every ~10,000.
/// On success the winning nonce and digest are written into the block and
/// the timestamp that produced the digest is final. A cancelled search
/// leaves the block's hash untouched.
pub fn search(block: &mut Block, cancel: &mut Receiver<()>) -> SearchResult {
    let target = target(block.difficulty);
    let mut nonce: i64 = 0;

    while nonce < i64::MAX {
        if nonce % CANCEL_POLL_INTERVAL == 0 && cancel.try_recv().is_ok() {
            return SearchResult::Cancelled;
        }
        if nonce % TIMESTAMP_REFRESH_INTERVAL == 0 && nonce > 0 {
            block.timestamp = unix_now();
        }

        let digest = header_digest(block, nonce);
        if BigUint::from_bytes_be(&digest) < target {
            block.nonce = nonce;
            block.hash = digest;
            return SearchResult::Found;
        }
        nonce += 1;
    }

    // Nonce space exhausted; practically unreachable.
    SearchResult::Cancelled
}

/// Check a finished block against its own stored difficulty: the stored
/// hash must equal the digest of the stored header fields and sit below
/// the target.
pub fn validate(block: &Block) -> bool {
    let digest = header_digest(block, block.nonce);
    if digest != block.hash {
        return false;
    }
    BigUint::from_bytes_be(&digest) < target(block.difficulty)
}

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::merkle;
use crate::core::params::subsidy;
use crate::crypto::{self, Keypair};

/// A 32-byte SHA-256 digest used throughout the system.
pub type Hash256 = [u8; 32];

/// Empty hash, used as a coinbase input's prev_tx_id and the genesis
/// block's prev_hash.
pub const EMPTY_HASH: Hash256 = [0u8; 32];

/// Output index carried by a coinbase input.
pub const COINBASE_OUT_INDEX: i32 = -1;

/// Bytes of random coinbase data attached when the caller supplies none.
const COINBASE_DATA_LEN: usize = 24;

/// Current wall-clock time as UTC seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_secs() as i64
}

// ─── Transaction Types ───────────────────────────────────────────────

/// Transaction input - spends one output of a previous transaction.
///
/// A coinbase input references no output: `prev_tx_id` is empty,
/// `prev_out_index` is -1, and `pubkey` carries arbitrary coinbase data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxInput {
    pub prev_tx_id: Hash256,
    pub prev_out_index: i32,
    pub signature: Vec<u8>,
    pub pubkey: Vec<u8>,
}

/// Transaction output - `value` coins locked to a public-key hash.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TxOutput {
    pub value: u64,
    pub pubkey_hash: Vec<u8>,
}

impl TxOutput {
    /// Create an output locked to the holder of `address`.
    pub fn locked_to(value: u64, address: &str) -> Result<TxOutput, TxError> {
        let pubkey_hash = crypto::address_to_pubkey_hash(address)
            .ok_or_else(|| TxError::InvalidAddress(address.to_string()))?;
        Ok(TxOutput { value, pubkey_hash })
    }

    pub fn is_locked_with(&self, pubkey_hash: &[u8]) -> bool {
        self.pubkey_hash == pubkey_hash
    }
}

/// A complete transaction.
///
/// Invariant: `id` equals the SHA-256 of the transaction's serialization
/// with `id` zeroed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Transaction {
    pub id: Hash256,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Create a coinbase transaction minting the subsidy for `height` to
    /// `recipient`. `data` is arbitrary; 24 random bytes when omitted.
    pub fn new_coinbase(
        recipient: &str,
        data: Option<Vec<u8>>,
        height: i64,
    ) -> Result<Transaction, TxError> {
        let data = data.unwrap_or_else(|| {
            let mut buf = vec![0u8; COINBASE_DATA_LEN];
            OsRng.fill_bytes(&mut buf);
            buf
        });

        let input = TxInput {
            prev_tx_id: EMPTY_HASH,
            prev_out_index: COINBASE_OUT_INDEX,
            signature: Vec::new(),
            pubkey: data,
        };
        let output = TxOutput::locked_to(subsidy(height), recipient)?;

        let mut tx = Transaction {
            id: EMPTY_HASH,
            inputs: vec![input],
            outputs: vec![output],
        };
        tx.id = tx.compute_id();
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1
            && self.inputs[0].prev_tx_id == EMPTY_HASH
            && self.inputs[0].prev_out_index == COINBASE_OUT_INDEX
    }

    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("tx serialization failed")
    }

    pub fn deserialize(bytes: &[u8]) -> bincode::Result<Transaction> {
        bincode::deserialize(bytes)
    }

    /// SHA-256 of the serialization with `id` zeroed.
    pub fn compute_id(&self) -> Hash256 {
        let mut copy = self.clone();
        copy.id = EMPTY_HASH;
        let digest = Sha256::digest(copy.serialize());
        let mut id = [0u8; 32];
        id.copy_from_slice(&digest);
        id
    }

    /// Copy of this transaction with every input's signature and pubkey
    /// cleared. Signing and verification both derive digests from it.
    pub fn trimmed_copy(&self) -> Transaction {
        let inputs = self
            .inputs
            .iter()
            .map(|input| TxInput {
                prev_tx_id: input.prev_tx_id,
                prev_out_index: input.prev_out_index,
                signature: Vec::new(),
                pubkey: Vec::new(),
            })
            .collect();
        Transaction {
            id: self.id,
            inputs,
            outputs: self.outputs.clone(),
        }
    }

    /// Sign every input with `keypair`. `prev_txs` maps prev_tx_id to the
    /// referenced transaction; all of them must be present.
    pub fn sign(
        &mut self,
        keypair: &Keypair,
        prev_txs: &HashMap<Hash256, Transaction>,
    ) -> Result<(), TxError> {
        if self.is_coinbase() {
            return Ok(());
        }
        self.check_prev_txs(prev_txs)?;

        let mut trimmed = self.trimmed_copy();
        for idx in 0..self.inputs.len() {
            let digest = input_digest(&mut trimmed, idx, prev_txs);
            self.inputs[idx].signature = keypair.sign(&digest).to_vec();
        }
        Ok(())
    }

    /// Verify every input's signature against its attached pubkey. A
    /// coinbase is trivially valid.
    pub fn verify(&self, prev_txs: &HashMap<Hash256, Transaction>) -> Result<bool, TxError> {
        if self.is_coinbase() {
            return Ok(true);
        }
        self.check_prev_txs(prev_txs)?;

        let mut trimmed = self.trimmed_copy();
        for (idx, input) in self.inputs.iter().enumerate() {
            let digest = input_digest(&mut trimmed, idx, prev_txs);
            if !crypto::verify_signature(&input.pubkey, &digest, &input.signature) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn check_prev_txs(&self, prev_txs: &HashMap<Hash256, Transaction>) -> Result<(), TxError> {
        for input in &self.inputs {
            let prev = prev_txs
                .get(&input.prev_tx_id)
                .ok_or(TxError::MissingPrevTx(input.prev_tx_id))?;
            let in_bounds = usize::try_from(input.prev_out_index)
                .map(|index| index < prev.outputs.len())
                .unwrap_or(false);
            if !in_bounds {
                return Err(TxError::InvalidOutputIndex(input.prev_out_index));
            }
        }
        Ok(())
    }
}

/// Digest signed for input `idx`: the trimmed copy's id with that input's
/// pubkey temporarily replaced by the pubkey hash of the output it spends.
fn input_digest(
    trimmed: &mut Transaction,
    idx: usize,
    prev_txs: &HashMap<Hash256, Transaction>,
) -> Hash256 {
    let prev = &prev_txs[&trimmed.inputs[idx].prev_tx_id];
    let spent = &prev.outputs[trimmed.inputs[idx].prev_out_index as usize];
    trimmed.inputs[idx].pubkey = spent.pubkey_hash.clone();
    trimmed.id = trimmed.compute_id();
    trimmed.inputs[idx].pubkey = Vec::new();
    trimmed.id
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Transaction {}", hex::encode(self.id))?;
        for (i, input) in self.inputs.iter().enumerate() {
            writeln!(
                f,
                "  in  {}: prev={} out={}",
                i,
                hex::encode(input.prev_tx_id),
                input.prev_out_index,
            )?;
        }
        for (i, output) in self.outputs.iter().enumerate() {
            writeln!(
                f,
                "  out {}: value={} pkh={}",
                i,
                output.value,
                hex::encode(&output.pubkey_hash),
            )?;
        }
        Ok(())
    }
}

// ─── Block ───────────────────────────────────────────────────────────

/// A block: header fields plus an ordered transaction list, linked to its
/// predecessor by `prev_hash`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub timestamp: i64,
    pub hash: Hash256,
    pub prev_hash: Hash256,
    pub transactions: Vec<Transaction>,
    pub nonce: i64,
    pub height: i64,
    pub difficulty: u32,
    pub merkle_root: Hash256,
}

impl Block {
    /// Build a block ready for the proof-of-work search: merkle root is
    /// computed once here, `nonce` and `hash` are left for the search.
    pub fn new(
        transactions: Vec<Transaction>,
        prev_hash: Hash256,
        height: i64,
        difficulty: u32,
    ) -> Block {
        let leaves: Vec<Vec<u8>> = transactions.iter().map(|tx| tx.serialize()).collect();
        Block {
            timestamp: unix_now(),
            hash: EMPTY_HASH,
            prev_hash,
            transactions,
            nonce: 0,
            height,
            difficulty,
            merkle_root: merkle::merkle_root(&leaves),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.prev_hash == EMPTY_HASH
    }

    pub fn serialize(&self) -> Vec<u8> {
        bincode::serialize(self).expect("block serialization failed")
    }

    pub fn deserialize(bytes: &[u8]) -> bincode::Result<Block> {
        bincode::deserialize(bytes)
    }

    /// Recompute the merkle root from the current transaction list.
    pub fn compute_merkle_root(&self) -> Hash256 {
        let leaves: Vec<Vec<u8>> = self.transactions.iter().map(|tx| tx.serialize()).collect();
        merkle::merkle_root(&leaves)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block #{} [{}] txs={} diff={} ts={}",
            self.height,
            hex::encode(self.hash),
            self.transactions.len(),
            self.difficulty,
            self.timestamp,
        )
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum TxError {
    InvalidAddress(String),
    MissingPrevTx(Hash256),
    InvalidOutputIndex(i32),
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxError::InvalidAddress(addr) => write!(f, "address is not valid: {}", addr),
            TxError::MissingPrevTx(id) => {
                write!(f, "referenced transaction not found: {}", hex::encode(id))
            }
            TxError::InvalidOutputIndex(index) => {
                write!(f, "referenced output index {} out of range", index)
            }
        }
    }
}

impl std::error::Error for TxError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    fn test_address() -> (Keypair, String) {
        let kp = Keypair::generate();
        let addr = kp.address();
        (kp, addr)
    }

    #[test]
    fn test_coinbase_shape() {
        let (_, addr) = test_address();
        let tx = Transaction::new_coinbase(&addr, None, 0).unwrap();
        assert!(tx.is_coinbase());
        assert_eq!(tx.outputs.len(), 1);
        assert_eq!(tx.outputs[0].value, 50);
        assert_eq!(tx.inputs[0].pubkey.len(), COINBASE_DATA_LEN);
    }

    #[test]
    fn test_coinbase_custom_data() {
        let (_, addr) = test_address();
        let tx = Transaction::new_coinbase(&addr, Some(b"genesis".to_vec()), 0).unwrap();
        assert_eq!(tx.inputs[0].pubkey, b"genesis".to_vec());
    }

    #[test]
    fn test_id_invariant() {
        let (_, addr) = test_address();
        let tx = Transaction::new_coinbase(&addr, None, 0).unwrap();
        assert_eq!(tx.id, tx.compute_id());
        assert_ne!(tx.id, EMPTY_HASH);
    }

    #[test]
    fn test_tx_roundtrip() {
        let (_, addr) = test_address();
        let tx = Transaction::new_coinbase(&addr, None, 3).unwrap();
        let decoded = Transaction::deserialize(&tx.serialize()).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(decoded.serialize(), tx.serialize());
    }

    #[test]
    fn test_trimmed_copy_clears_inputs() {
        let (_, addr) = test_address();
        let mut tx = Transaction::new_coinbase(&addr, None, 0).unwrap();
        tx.inputs[0].signature = vec![1, 2, 3];
        let trimmed = tx.trimmed_copy();
        assert!(trimmed.inputs[0].signature.is_empty());
        assert!(trimmed.inputs[0].pubkey.is_empty());
        assert_eq!(trimmed.outputs, tx.outputs);
    }

    #[test]
    fn test_sign_and_verify() {
        let (kp, addr) = test_address();
        let (_, dest) = test_address();
        let prev = Transaction::new_coinbase(&addr, None, 0).unwrap();

        let mut tx = Transaction {
            id: EMPTY_HASH,
            inputs: vec![TxInput {
                prev_tx_id: prev.id,
                prev_out_index: 0,
                signature: Vec::new(),
                pubkey: kp.public_key_bytes().to_vec(),
            }],
            outputs: vec![TxOutput::locked_to(50, &dest).unwrap()],
        };
        tx.id = tx.compute_id();

        let mut prev_txs = HashMap::new();
        prev_txs.insert(prev.id, prev);

        tx.sign(&kp, &prev_txs).unwrap();
        assert!(tx.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_tampered_output_fails_verify() {
        let (kp, addr) = test_address();
        let (_, dest) = test_address();
        let prev = Transaction::new_coinbase(&addr, None, 0).unwrap();

        let mut tx = Transaction {
            id: EMPTY_HASH,
            inputs: vec![TxInput {
                prev_tx_id: prev.id,
                prev_out_index: 0,
                signature: Vec::new(),
                pubkey: kp.public_key_bytes().to_vec(),
            }],
            outputs: vec![TxOutput::locked_to(50, &dest).unwrap()],
        };
        tx.id = tx.compute_id();

        let mut prev_txs = HashMap::new();
        prev_txs.insert(prev.id, prev);
        tx.sign(&kp, &prev_txs).unwrap();

        tx.outputs[0].value = 51;
        assert!(!tx.verify(&prev_txs).unwrap());
    }

    #[test]
    fn test_verify_missing_prev_tx() {
        let (kp, _) = test_address();
        let (_, dest) = test_address();
        let mut tx = Transaction {
            id: EMPTY_HASH,
            inputs: vec![TxInput {
                prev_tx_id: [7u8; 32],
                prev_out_index: 0,
                signature: Vec::new(),
                pubkey: kp.public_key_bytes().to_vec(),
            }],
            outputs: vec![TxOutput::locked_to(1, &dest).unwrap()],
        };
        tx.id = tx.compute_id();
        assert!(tx.verify(&HashMap::new()).is_err());
    }

    #[test]
    fn test_block_roundtrip() {
        let (_, addr) = test_address();
        let coinbase = Transaction::new_coinbase(&addr, None, 0).unwrap();
        let block = Block::new(vec![coinbase], EMPTY_HASH, 0, 16);
        let decoded = Block::deserialize(&block.serialize()).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_block_merkle_root_set_on_build() {
        let (_, addr) = test_address();
        let coinbase = Transaction::new_coinbase(&addr, None, 0).unwrap();
        let block = Block::new(vec![coinbase], EMPTY_HASH, 0, 16);
        assert_eq!(block.merkle_root, block.compute_merkle_root());
        assert_ne!(block.merkle_root, EMPTY_HASH);
    }
}

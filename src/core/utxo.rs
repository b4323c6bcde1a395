use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::core::chain::{Blockchain, ChainError};
use crate::core::types::{Block, Hash256, TxOutput};
use crate::storage::Store;

/// Key prefix namespacing index entries within the node's backing store.
pub const UTXO_PREFIX: &[u8] = b"utxo-";

/// One unspent output, tagged with its index in the original transaction so
/// partial spends never shift the references later inputs are signed over.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct IndexedOutput {
    index: i32,
    output: TxOutput,
}

/// Persistent secondary index from transaction id to that transaction's
/// still-unspent outputs. Rebuildable from the chain at any time.
#[derive(Clone)]
pub struct UtxoIndex {
    store: Store,
}

impl UtxoIndex {
    pub fn new(store: Store) -> UtxoIndex {
        UtxoIndex { store }
    }

    /// Select outputs locked to `pubkey_hash` until their total covers
    /// `amount`. Returns the accumulated value and the selected output
    /// indices per transaction; callers may only rely on the total.
    pub fn find_spendable(
        &self,
        pubkey_hash: &[u8],
        amount: u64,
    ) -> Result<(u64, HashMap<Hash256, Vec<i32>>), ChainError> {
        let mut accumulated: u64 = 0;
        let mut spendable: HashMap<Hash256, Vec<i32>> = HashMap::new();

        'scan: for item in self.store.scan_prefix(UTXO_PREFIX) {
            let (key, value) = item.map_err(|e| ChainError::Corrupt(e.to_string()))?;
            let txid = txid_from_key(&key)?;
            let outputs = decode_outputs(&value)?;
            for entry in outputs {
                if !entry.output.is_locked_with(pubkey_hash) {
                    continue;
                }
                accumulated += entry.output.value;
                spendable.entry(txid).or_default().push(entry.index);
                if accumulated >= amount {
                    break 'scan;
                }
            }
        }

        Ok((accumulated, spendable))
    }

    /// Every unspent output locked to `pubkey_hash`.
    pub fn find_all(&self, pubkey_hash: &[u8]) -> Result<Vec<TxOutput>, ChainError> {
        let mut outputs = Vec::new();
        for item in self.store.scan_prefix(UTXO_PREFIX) {
            let (_, value) = item.map_err(|e| ChainError::Corrupt(e.to_string()))?;
            for entry in decode_outputs(&value)? {
                if entry.output.is_locked_with(pubkey_hash) {
                    outputs.push(entry.output);
                }
            }
        }
        Ok(outputs)
    }

    /// Sum of all unspent output values locked to `pubkey_hash`.
    pub fn balance(&self, pubkey_hash: &[u8]) -> Result<u64, ChainError> {
        Ok(self.find_all(pubkey_hash)?.iter().map(|o| o.value).sum())
    }

    /// Number of transactions with at least one unspent output.
    pub fn count(&self) -> Result<usize, ChainError> {
        let mut count = 0;
        for item in self.store.scan_prefix(UTXO_PREFIX) {
            item.map_err(|e| ChainError::Corrupt(e.to_string()))?;
            count += 1;
        }
        Ok(count)
    }

    /// Whether a specific output is still unspent.
    pub fn is_unspent(&self, txid: &Hash256, out_index: i32) -> Result<bool, ChainError> {
        match self.store.get(&utxo_key(txid))? {
            None => Ok(false),
            Some(value) => Ok(decode_outputs(&value)?
                .iter()
                .any(|entry| entry.index == out_index)),
        }
    }

    /// Rebuild the index from scratch by walking the whole chain with a
    /// spent-output set.
    pub fn reindex(&self, chain: &Blockchain) -> Result<(), ChainError> {
        let stale: Vec<Vec<u8>> = self
            .store
            .scan_prefix(UTXO_PREFIX)
            .keys()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| ChainError::Corrupt(e.to_string()))?
            .into_iter()
            .map(|k| k.to_vec())
            .collect();
        for key in stale {
            self.store.delete(&key)?;
        }

        // Tip-to-genesis walk: inputs are recorded before the outputs they
        // consume come up.
        let mut spent: HashMap<Hash256, Vec<i32>> = HashMap::new();
        let mut unspent: HashMap<Hash256, Vec<IndexedOutput>> = HashMap::new();
        for block in chain.iter()? {
            let block = block?;
            for tx in &block.transactions {
                for (index, output) in tx.outputs.iter().enumerate() {
                    let index = index as i32;
                    let consumed = spent
                        .get(&tx.id)
                        .map_or(false, |indices| indices.contains(&index));
                    if !consumed {
                        unspent
                            .entry(tx.id)
                            .or_default()
                            .push(IndexedOutput { index, output: output.clone() });
                    }
                }
                if !tx.is_coinbase() {
                    for input in &tx.inputs {
                        spent
                            .entry(input.prev_tx_id)
                            .or_default()
                            .push(input.prev_out_index);
                    }
                }
            }
        }

        for (txid, mut outputs) in unspent {
            outputs.sort_by_key(|entry| entry.index);
            self.store.put(&utxo_key(&txid), &encode_outputs(&outputs))?;
        }
        Ok(())
    }

    /// Apply one accepted block: drop the spent outputs of each non-coinbase
    /// input (deleting emptied entries), then record every transaction's
    /// full output list.
    pub fn update(&self, block: &Block) -> Result<(), ChainError> {
        for tx in &block.transactions {
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    let key = utxo_key(&input.prev_tx_id);
                    let value = self.store.get(&key)?.ok_or_else(|| {
                        ChainError::Corrupt(format!(
                            "spent output of unknown entry {}",
                            hex::encode(input.prev_tx_id)
                        ))
                    })?;
                    let mut outputs = decode_outputs(&value)?;
                    outputs.retain(|entry| entry.index != input.prev_out_index);
                    if outputs.is_empty() {
                        self.store.delete(&key)?;
                    } else {
                        self.store.put(&key, &encode_outputs(&outputs))?;
                    }
                }
            }

            let outputs: Vec<IndexedOutput> = tx
                .outputs
                .iter()
                .enumerate()
                .map(|(index, output)| IndexedOutput {
                    index: index as i32,
                    output: output.clone(),
                })
                .collect();
            self.store.put(&utxo_key(&tx.id), &encode_outputs(&outputs))?;
        }
        Ok(())
    }
}

fn utxo_key(txid: &Hash256) -> Vec<u8> {
    let mut key = Vec::with_capacity(UTXO_PREFIX.len() + 32);
    key.extend_from_slice(UTXO_PREFIX);
    key.extend_from_slice(txid);
    key
}

fn txid_from_key(key: &[u8]) -> Result<Hash256, ChainError> {
    if key.len() != UTXO_PREFIX.len() + 32 {
        return Err(ChainError::Corrupt("invalid utxo key length".to_string()));
    }
    let mut txid = [0u8; 32];
    txid.copy_from_slice(&key[UTXO_PREFIX.len()..]);
    Ok(txid)
}

fn encode_outputs(outputs: &[IndexedOutput]) -> Vec<u8> {
    bincode::serialize(outputs).expect("utxo entry serialization failed")
}

fn decode_outputs(bytes: &[u8]) -> Result<Vec<IndexedOutput>, ChainError> {
    bincode::deserialize(bytes).map_err(|e| ChainError::Corrupt(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::INITIAL_SUBSIDY;
    use crate::core::types::{Transaction, EMPTY_HASH};
    use crate::crypto::Keypair;
    use crate::wallet::Wallets;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: tempfile::TempDir,
        chain: Blockchain,
        utxo: UtxoIndex,
        wallets: Wallets,
        addr_a: String,
        addr_b: String,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let wallet_path = dir.path().join("wallet.json");
        let mut wallets = Wallets::load_or_create(&wallet_path).unwrap();
        let addr_a = wallets.create_address().unwrap();
        let addr_b = wallets.create_address().unwrap();

        let chain = Blockchain::create(dir.path().join("chain"), &addr_a).unwrap();
        let utxo = UtxoIndex::new(chain.store_handle());
        utxo.reindex(&chain).unwrap();

        Fixture { _dir: dir, chain, utxo, wallets, addr_a, addr_b }
    }

    fn mine(fx: &Fixture, reward_to: &str, extra: Vec<Transaction>) -> Block {
        let height = fx.chain.best_height().unwrap() + 1;
        let coinbase = Transaction::new_coinbase(reward_to, None, height).unwrap();
        let mut txs = vec![coinbase];
        txs.extend(extra);

        // Craft at low difficulty; the stored field is what validators use.
        let tip = fx.chain.tip().unwrap();
        let mut block = Block::new(txs, tip.hash, height, 8);
        let (_tx, mut rx) = mpsc::channel(1);
        assert_eq!(
            crate::pow::search(&mut block, &mut rx),
            crate::pow::SearchResult::Found
        );
        fx.chain.accept_block(&block).unwrap();
        block
    }

    fn pkh(wallets: &Wallets, addr: &str) -> Vec<u8> {
        wallets.get(addr).unwrap().pubkey_hash()
    }

    #[test]
    fn test_genesis_balance() {
        let fx = fixture();
        assert_eq!(fx.utxo.count().unwrap(), 1);
        let hash_a = pkh(&fx.wallets, &fx.addr_a);
        assert_eq!(fx.utxo.balance(&hash_a).unwrap(), INITIAL_SUBSIDY);
        assert_eq!(fx.utxo.find_all(&hash_a).unwrap().len(), 1);
    }

    #[test]
    fn test_coinbase_accrues() {
        let fx = fixture();
        let block = mine(&fx, &fx.addr_a, vec![]);
        fx.utxo.update(&block).unwrap();
        let hash_a = pkh(&fx.wallets, &fx.addr_a);
        assert_eq!(fx.utxo.balance(&hash_a).unwrap(), 100);
    }

    #[test]
    fn test_transfer_with_change() {
        let fx = fixture();
        let tx = fx
            .chain
            .new_transaction(&fx.addr_a, &fx.addr_b, 10, &fx.utxo, &fx.wallets)
            .unwrap();
        assert!(fx.chain.verify_transaction(&tx).unwrap());

        let block = mine(&fx, &fx.addr_a, vec![tx]);
        fx.utxo.update(&block).unwrap();

        let hash_a = pkh(&fx.wallets, &fx.addr_a);
        let hash_b = pkh(&fx.wallets, &fx.addr_b);
        // 50 - 10 change + 50 fresh coinbase.
        assert_eq!(fx.utxo.balance(&hash_a).unwrap(), 90);
        assert_eq!(fx.utxo.balance(&hash_b).unwrap(), 10);
    }

    #[test]
    fn test_insufficient_funds() {
        let fx = fixture();
        let before = fx.utxo.count().unwrap();
        let result =
            fx.chain
                .new_transaction(&fx.addr_a, &fx.addr_b, 1_000, &fx.utxo, &fx.wallets);
        assert!(matches!(
            result,
            Err(ChainError::NotEnoughFunds { available: 50, requested: 1_000 })
        ));
        // Nothing was mutated.
        assert_eq!(fx.utxo.count().unwrap(), before);
    }

    #[test]
    fn test_spent_entry_removed() {
        let fx = fixture();
        let genesis_coinbase_id = fx.chain.tip().unwrap().transactions[0].id;

        // Spend the whole genesis output.
        let tx = fx
            .chain
            .new_transaction(&fx.addr_a, &fx.addr_b, 50, &fx.utxo, &fx.wallets)
            .unwrap();
        assert_eq!(tx.outputs.len(), 1); // no change
        let block = mine(&fx, &fx.addr_b, vec![tx]);
        fx.utxo.update(&block).unwrap();

        assert!(!fx.utxo.is_unspent(&genesis_coinbase_id, 0).unwrap());
        assert!(fx
            .utxo
            .find_spendable(&pkh(&fx.wallets, &fx.addr_a), 1)
            .unwrap()
            .1
            .is_empty());
    }

    #[test]
    fn test_update_matches_reindex() {
        let fx = fixture();
        let tx = fx
            .chain
            .new_transaction(&fx.addr_a, &fx.addr_b, 10, &fx.utxo, &fx.wallets)
            .unwrap();
        let block = mine(&fx, &fx.addr_a, vec![tx]);
        fx.utxo.update(&block).unwrap();

        let hash_a = pkh(&fx.wallets, &fx.addr_a);
        let hash_b = pkh(&fx.wallets, &fx.addr_b);
        let (incr_a, incr_b, incr_count) = (
            fx.utxo.balance(&hash_a).unwrap(),
            fx.utxo.balance(&hash_b).unwrap(),
            fx.utxo.count().unwrap(),
        );

        fx.utxo.reindex(&fx.chain).unwrap();
        assert_eq!(fx.utxo.balance(&hash_a).unwrap(), incr_a);
        assert_eq!(fx.utxo.balance(&hash_b).unwrap(), incr_b);
        assert_eq!(fx.utxo.count().unwrap(), incr_count);
    }

    #[test]
    fn test_supply_bounded() {
        let fx = fixture();
        for _ in 0..3 {
            let block = mine(&fx, &fx.addr_a, vec![]);
            fx.utxo.update(&block).unwrap();
        }
        let mut total: u64 = 0;
        for item in fx.utxo.store.scan_prefix(UTXO_PREFIX) {
            let (_, value) = item.unwrap();
            for entry in decode_outputs(&value).unwrap() {
                total += entry.output.value;
            }
        }
        let tip_height = fx.chain.best_height().unwrap();
        let emitted: u64 = (0..=tip_height)
            .map(crate::core::params::subsidy)
            .sum();
        assert!(total <= emitted);
        assert!(emitted <= crate::core::params::MAX_SUPPLY);
    }
}

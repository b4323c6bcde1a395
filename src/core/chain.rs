use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

use tokio::sync::mpsc::{self, Receiver};

use crate::core::params::{DIFFICULTY, GENESIS_DIFFICULTY};
use crate::core::types::{Block, Hash256, Transaction, TxError, TxInput, TxOutput, EMPTY_HASH};
use crate::core::utxo::UtxoIndex;
use crate::crypto::{self, Keypair};
use crate::pow::{self, SearchResult};
use crate::storage::{Store, StoreError, TIP_KEY};
use crate::wallet::Wallets;

/// Result of a local mining attempt.
#[derive(Debug)]
pub enum MineOutcome {
    Mined(Block),
    Cancelled,
}

/// The chain store: blocks keyed by hash in the backing store, with the
/// distinguished `lh` key pointing at the tip. Exactly one writer mutates
/// the chain at a time; `commit_lock` serializes commits while sled serves
/// concurrent readers.
pub struct Blockchain {
    store: Store,
    commit_lock: Mutex<()>,
}

impl Blockchain {
    /// Initialize a chain store with a mined genesis block rewarding
    /// `address`. Re-running on a non-empty store is a no-op that reads the
    /// existing tip.
    pub fn create<P: AsRef<Path>>(path: P, address: &str) -> Result<Blockchain, ChainError> {
        if !crypto::validate_address(address) {
            return Err(ChainError::Tx(TxError::InvalidAddress(address.to_string())));
        }
        let store = Store::open(path)?;
        if store.get(TIP_KEY)?.is_some() {
            tracing::info!("blockchain already exists, reusing tip");
            return Ok(Blockchain::with_store(store));
        }

        let coinbase = Transaction::new_coinbase(address, None, 0)?;
        let mut genesis = Block::new(vec![coinbase], EMPTY_HASH, 0, GENESIS_DIFFICULTY);

        // No sender ever fires; the genesis search runs to completion.
        let (_cancel_tx, mut cancel_rx) = mpsc::channel(1);
        if pow::search(&mut genesis, &mut cancel_rx) != SearchResult::Found {
            return Err(ChainError::Interrupted);
        }

        store.commit_block(&genesis.hash, &genesis.serialize(), true)?;
        tracing::info!("genesis block mined: {}", hex::encode(genesis.hash));
        Ok(Blockchain::with_store(store))
    }

    /// Open an existing chain store; fails when the store holds no chain.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Blockchain, ChainError> {
        let store = Store::open(path)?;
        if store.get(TIP_KEY)?.is_none() {
            return Err(ChainError::NoChain);
        }
        Ok(Blockchain::with_store(store))
    }

    /// Attach to a store that may still be empty (a fresh node that will
    /// bootstrap its chain from the network).
    pub fn attach<P: AsRef<Path>>(path: P) -> Result<Blockchain, ChainError> {
        Ok(Blockchain::with_store(Store::open(path)?))
    }

    fn with_store(store: Store) -> Blockchain {
        Blockchain {
            store,
            commit_lock: Mutex::new(()),
        }
    }

    /// Clone of the backing store handle, for the UTXO index living in the
    /// same database.
    pub fn store_handle(&self) -> Store {
        self.store.clone()
    }

    // ─── Reads ──────────────────────────────────────────────────────

    pub fn tip_hash(&self) -> Result<Option<Hash256>, ChainError> {
        match self.store.get(TIP_KEY)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(parse_hash(&bytes)?)),
        }
    }

    pub fn tip(&self) -> Result<Block, ChainError> {
        let hash = self.tip_hash()?.ok_or(ChainError::NoChain)?;
        self.get_block(&hash)
    }

    /// Height of the tip, or -1 when the store holds no chain yet.
    pub fn best_height(&self) -> Result<i64, ChainError> {
        match self.tip_hash()? {
            None => Ok(-1),
            Some(hash) => Ok(self.get_block(&hash)?.height),
        }
    }

    pub fn get_block(&self, hash: &Hash256) -> Result<Block, ChainError> {
        let bytes = self
            .store
            .get(hash)?
            .ok_or(ChainError::BlockNotFound(*hash))?;
        Block::deserialize(&bytes).map_err(|e| ChainError::Corrupt(e.to_string()))
    }

    /// Idempotent write of a block's bytes under its hash. Does not touch
    /// the tip.
    pub fn put_block(&self, block: &Block) -> Result<(), ChainError> {
        self.store.put(&block.hash, &block.serialize())?;
        Ok(())
    }

    /// All block hashes from tip back to genesis.
    pub fn block_hashes(&self) -> Result<Vec<Hash256>, ChainError> {
        let mut hashes = Vec::new();
        for block in self.iter()? {
            hashes.push(block?.hash);
        }
        Ok(hashes)
    }

    /// Iterate blocks from the tip back to genesis by following
    /// `prev_hash` links.
    pub fn iter(&self) -> Result<ChainIter<'_>, ChainError> {
        Ok(ChainIter {
            chain: self,
            next: self.tip_hash()?,
        })
    }

    /// Linear scan for a transaction by id.
    pub fn find_transaction(&self, id: &Hash256) -> Result<Transaction, ChainError> {
        for block in self.iter()? {
            let block = block?;
            for tx in &block.transactions {
                if &tx.id == id {
                    return Ok(tx.clone());
                }
            }
        }
        Err(ChainError::TxNotFound(*id))
    }

    fn previous_transactions(
        &self,
        tx: &Transaction,
    ) -> Result<HashMap<Hash256, Transaction>, ChainError> {
        let mut prev_txs = HashMap::new();
        for input in &tx.inputs {
            let prev = self.find_transaction(&input.prev_tx_id)?;
            prev_txs.insert(prev.id, prev);
        }
        Ok(prev_txs)
    }

    // ─── Transactions ───────────────────────────────────────────────

    pub fn sign_transaction(
        &self,
        tx: &mut Transaction,
        keypair: &Keypair,
    ) -> Result<(), ChainError> {
        let prev_txs = self.previous_transactions(tx)?;
        tx.sign(keypair, &prev_txs)?;
        Ok(())
    }

    /// Verify a transaction's signatures against the chain. A missing
    /// referenced transaction or malformed input reference is a
    /// verification failure, not a store error.
    pub fn verify_transaction(&self, tx: &Transaction) -> Result<bool, ChainError> {
        if tx.is_coinbase() {
            return Ok(true);
        }
        let prev_txs = match self.previous_transactions(tx) {
            Ok(prev_txs) => prev_txs,
            Err(ChainError::TxNotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        Ok(tx.verify(&prev_txs).unwrap_or(false))
    }

    /// Build and sign a transfer of `amount` from `from` to `to`, selecting
    /// inputs from the UTXO index and returning change to the sender. Fails
    /// without touching any state when the sender's spendable total is
    /// insufficient.
    pub fn new_transaction(
        &self,
        from: &str,
        to: &str,
        amount: u64,
        utxo: &UtxoIndex,
        wallets: &Wallets,
    ) -> Result<Transaction, ChainError> {
        if !crypto::validate_address(to) {
            return Err(ChainError::Tx(TxError::InvalidAddress(to.to_string())));
        }
        let keypair = wallets
            .get(from)
            .ok_or_else(|| ChainError::WalletNotFound(from.to_string()))?;
        let pubkey_hash = keypair.pubkey_hash();

        let (accumulated, spendable) = utxo.find_spendable(&pubkey_hash, amount)?;
        if accumulated < amount {
            return Err(ChainError::NotEnoughFunds {
                available: accumulated,
                requested: amount,
            });
        }

        let mut inputs = Vec::new();
        for (txid, out_indices) in &spendable {
            for &out_index in out_indices {
                inputs.push(TxInput {
                    prev_tx_id: *txid,
                    prev_out_index: out_index,
                    signature: Vec::new(),
                    pubkey: keypair.public_key_bytes().to_vec(),
                });
            }
        }

        let mut outputs = vec![TxOutput::locked_to(amount, to).map_err(ChainError::Tx)?];
        if accumulated > amount {
            outputs.push(TxOutput {
                value: accumulated - amount,
                pubkey_hash,
            });
        }

        let mut tx = Transaction {
            id: EMPTY_HASH,
            inputs,
            outputs,
        };
        tx.id = tx.compute_id();
        self.sign_transaction(&mut tx, keypair)?;
        Ok(tx)
    }

    // ─── Mining & Acceptance ────────────────────────────────────────

    /// Mine a block of `txs` on top of the current tip at the standard
    /// difficulty. Every non-coinbase transaction must verify, or the
    /// attempt fails hard.
    pub fn mine_block(
        &self,
        txs: Vec<Transaction>,
        cancel: &mut Receiver<()>,
    ) -> Result<MineOutcome, ChainError> {
        self.mine_with_difficulty(txs, DIFFICULTY, cancel)
    }

    fn mine_with_difficulty(
        &self,
        txs: Vec<Transaction>,
        difficulty: u32,
        cancel: &mut Receiver<()>,
    ) -> Result<MineOutcome, ChainError> {
        for tx in &txs {
            if tx.is_coinbase() {
                continue;
            }
            if !self.verify_transaction(tx)? {
                return Err(ChainError::InvalidTransaction(format!(
                    "transaction {} failed verification",
                    hex::encode(tx.id)
                )));
            }
        }

        let tip = self.tip()?;
        let mut block = Block::new(txs, tip.hash, tip.height + 1, difficulty);

        match pow::search(&mut block, cancel) {
            SearchResult::Cancelled => Ok(MineOutcome::Cancelled),
            SearchResult::Found => {
                let _guard = self.commit_lock.lock().expect("commit lock poisoned");
                // First-accepted wins: a peer's block may have landed while
                // we searched. A stale solution is silently discarded.
                if self.tip_hash()? != Some(block.prev_hash) {
                    tracing::debug!(
                        "mined block #{} is stale, tip moved during search",
                        block.height
                    );
                    return Ok(MineOutcome::Cancelled);
                }
                self.store.commit_block(&block.hash, &block.serialize(), true)?;
                Ok(MineOutcome::Mined(block))
            }
        }
    }

    /// Accept a block gossiped in steady state: it must extend the tip by
    /// exactly one height and carry valid proof-of-work for its stored
    /// difficulty. Persisting the block and repointing the tip are atomic.
    pub fn accept_block(&self, block: &Block) -> Result<(), ChainError> {
        let _guard = self.commit_lock.lock().expect("commit lock poisoned");
        let tip = self.tip()?;

        if block.height != tip.height + 1 {
            return if block.height > tip.height + 1 {
                Err(ChainError::MissingBlocks {
                    got: block.height,
                    tip: tip.height,
                })
            } else {
                Err(ChainError::StaleBlock {
                    got: block.height,
                    tip: tip.height,
                })
            };
        }
        if block.prev_hash != tip.hash {
            return Err(ChainError::StaleBlock {
                got: block.height,
                tip: tip.height,
            });
        }
        if !pow::validate(block) {
            return Err(ChainError::InvalidPow(block.hash));
        }

        self.store.commit_block(&block.hash, &block.serialize(), true)?;
        Ok(())
    }

    /// Store a block delivered by the initial-sync drain. The drain walks
    /// the remote hash list tip-first, so linkage cannot be enforced per
    /// block; proof-of-work is, and the tip tracks the greatest height seen.
    pub fn store_sync_block(&self, block: &Block) -> Result<(), ChainError> {
        if !pow::validate(block) {
            return Err(ChainError::InvalidPow(block.hash));
        }
        let _guard = self.commit_lock.lock().expect("commit lock poisoned");
        let advance = match self.tip_hash()? {
            None => true,
            Some(tip_hash) => block.height > self.get_block(&tip_hash)?.height,
        };
        self.store.commit_block(&block.hash, &block.serialize(), advance)?;
        Ok(())
    }
}

fn parse_hash(bytes: &[u8]) -> Result<Hash256, ChainError> {
    if bytes.len() != 32 {
        return Err(ChainError::Corrupt(format!(
            "expected 32-byte hash, got {} bytes",
            bytes.len()
        )));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(bytes);
    Ok(hash)
}

/// Iterator from tip to genesis following `prev_hash` links.
pub struct ChainIter<'a> {
    chain: &'a Blockchain,
    next: Option<Hash256>,
}

impl Iterator for ChainIter<'_> {
    type Item = Result<Block, ChainError>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next?;
        match self.chain.get_block(&hash) {
            Ok(block) => {
                self.next = if block.is_genesis() {
                    None
                } else {
                    Some(block.prev_hash)
                };
                Some(Ok(block))
            }
            Err(e) => {
                self.next = None;
                Some(Err(e))
            }
        }
    }
}

// ─── Errors ──────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ChainError {
    Store(StoreError),
    NoChain,
    BlockNotFound(Hash256),
    TxNotFound(Hash256),
    WalletNotFound(String),
    NotEnoughFunds { available: u64, requested: u64 },
    InvalidTransaction(String),
    MissingBlocks { got: i64, tip: i64 },
    StaleBlock { got: i64, tip: i64 },
    InvalidPow(Hash256),
    Interrupted,
    Corrupt(String),
    Tx(TxError),
}

impl From<StoreError> for ChainError {
    fn from(e: StoreError) -> Self {
        ChainError::Store(e)
    }
}

impl From<TxError> for ChainError {
    fn from(e: TxError) -> Self {
        ChainError::Tx(e)
    }
}

impl fmt::Display for ChainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainError::Store(e) => write!(f, "{}", e),
            ChainError::NoChain => write!(f, "no existing blockchain found"),
            ChainError::BlockNotFound(h) => write!(f, "block not found: {}", hex::encode(h)),
            ChainError::TxNotFound(id) => {
                write!(f, "transaction not found: {}", hex::encode(id))
            }
            ChainError::WalletNotFound(addr) => write!(f, "no wallet for address {}", addr),
            ChainError::NotEnoughFunds { available, requested } => {
                write!(f, "not enough funds: have {}, need {}", available, requested)
            }
            ChainError::InvalidTransaction(msg) => write!(f, "invalid transaction: {}", msg),
            ChainError::MissingBlocks { got, tip } => {
                write!(f, "block height {} ahead of tip {}, missing blocks", got, tip)
            }
            ChainError::StaleBlock { got, tip } => {
                write!(f, "stale block at height {} (tip {})", got, tip)
            }
            ChainError::InvalidPow(h) => {
                write!(f, "invalid proof-of-work: {}", hex::encode(h))
            }
            ChainError::Interrupted => write!(f, "mining interrupted"),
            ChainError::Corrupt(msg) => write!(f, "corrupt data: {}", msg),
            ChainError::Tx(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ChainError {}

use sled::Db;
use std::path::Path;

/// Distinguished key holding the current tip hash.
pub const TIP_KEY: &[u8] = b"lh";

/// Persistent backing store: an ordered byte-keyed map over sled.
///
/// One database per node holds blocks (keyed by hash), the `lh` tip pointer,
/// and the `utxo-`-prefixed index entries. sled permits one writer alongside
/// concurrent snapshot readers, which is what the chain store requires.
#[derive(Clone)]
pub struct Store {
    db: Db,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path).map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(Store { db })
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self.db.get(key).map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(value.map(|ivec| ivec.to_vec()))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.db
            .insert(key, value)
            .map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.db
            .remove(key)
            .map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(())
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool, StoreError> {
        self.db
            .contains_key(key)
            .map_err(|e| StoreError::Db(e.to_string()))
    }

    pub fn scan_prefix(&self, prefix: &[u8]) -> sled::Iter {
        self.db.scan_prefix(prefix)
    }

    /// Atomically write a block and, when `update_tip` is set, repoint the
    /// tip key at it. The two writes land in one sled transaction so readers
    /// chasing `prev_hash` links never observe a dangling tip.
    pub fn commit_block(
        &self,
        hash: &[u8],
        bytes: &[u8],
        update_tip: bool,
    ) -> Result<(), StoreError> {
        let result: sled::transaction::TransactionResult<(), ()> =
            self.db.transaction(|t| {
                t.insert(hash, bytes)?;
                if update_tip {
                    t.insert(TIP_KEY, hash)?;
                }
                Ok(())
            });
        result.map_err(|e| StoreError::Db(format!("{:?}", e)))?;
        self.flush()
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::Db(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum StoreError {
    Db(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Db(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for StoreError {}

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::crypto::Keypair;

const WALLET_FILE_VERSION: u32 = 1;

/// On-disk wallet format: address → hex-encoded key material.
#[derive(Serialize, Deserialize)]
struct WalletFile {
    version: u32,
    keys: HashMap<String, StoredKey>,
}

#[derive(Serialize, Deserialize)]
struct StoredKey {
    secret: String,
    pubkey: String,
}

/// File-backed keystore mapping addresses to P-256 keypairs.
pub struct Wallets {
    keypairs: HashMap<String, Keypair>,
    path: PathBuf,
}

impl Wallets {
    /// Load the wallet file at `path`, or start an empty keystore if the
    /// file does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Wallets, WalletError> {
        if !path.exists() {
            return Ok(Wallets {
                keypairs: HashMap::new(),
                path: path.to_path_buf(),
            });
        }

        let json = std::fs::read_to_string(path)
            .map_err(|e| WalletError::Io(format!("{}: {}", path.display(), e)))?;
        let file: WalletFile =
            serde_json::from_str(&json).map_err(|e| WalletError::Corrupt(e.to_string()))?;

        let mut keypairs = HashMap::new();
        for (address, stored) in file.keys {
            let secret = hex::decode(&stored.secret)
                .map_err(|e| WalletError::Corrupt(e.to_string()))?;
            let keypair = Keypair::from_secret_bytes(&secret)
                .ok_or_else(|| WalletError::Corrupt(format!("bad key for {}", address)))?;
            keypairs.insert(address, keypair);
        }
        Ok(Wallets {
            keypairs,
            path: path.to_path_buf(),
        })
    }

    /// Generate a new keypair, persist it, and return its address.
    pub fn create_address(&mut self) -> Result<String, WalletError> {
        let keypair = Keypair::generate();
        let address = keypair.address();
        self.keypairs.insert(address.clone(), keypair);
        self.save()?;
        Ok(address)
    }

    pub fn get(&self, address: &str) -> Option<&Keypair> {
        self.keypairs.get(address)
    }

    /// All known addresses, sorted for stable listing.
    pub fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.keypairs.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    fn save(&self) -> Result<(), WalletError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WalletError::Io(e.to_string()))?;
        }
        let keys = self
            .keypairs
            .iter()
            .map(|(address, keypair)| {
                (
                    address.clone(),
                    StoredKey {
                        secret: hex::encode(keypair.secret_bytes()),
                        pubkey: hex::encode(keypair.public_key_bytes()),
                    },
                )
            })
            .collect();
        let file = WalletFile {
            version: WALLET_FILE_VERSION,
            keys,
        };
        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| WalletError::Corrupt(e.to_string()))?;
        std::fs::write(&self.path, json)
            .map_err(|e| WalletError::Io(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

#[derive(Debug)]
pub enum WalletError {
    Io(String),
    Corrupt(String),
}

impl std::fmt::Display for WalletError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalletError::Io(e) => write!(f, "wallet io error: {}", e),
            WalletError::Corrupt(e) => write!(f, "wallet file corrupt: {}", e),
        }
    }
}

impl std::error::Error for WalletError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto;

    #[test]
    fn test_create_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wallet.json");

        let mut wallets = Wallets::load_or_create(&path).unwrap();
        let addr1 = wallets.create_address().unwrap();
        let addr2 = wallets.create_address().unwrap();
        assert_ne!(addr1, addr2);

        let reloaded = Wallets::load_or_create(&path).unwrap();
        assert_eq!(reloaded.addresses().len(), 2);
        assert_eq!(
            reloaded.get(&addr1).unwrap().public_key_bytes(),
            wallets.get(&addr1).unwrap().public_key_bytes(),
        );
    }

    #[test]
    fn test_addresses_are_valid() {
        let dir = tempfile::tempdir().unwrap();
        let mut wallets = Wallets::load_or_create(&dir.path().join("w.json")).unwrap();
        let address = wallets.create_address().unwrap();
        assert!(crypto::validate_address(&address));
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let wallets = Wallets::load_or_create(&dir.path().join("none.json")).unwrap();
        assert!(wallets.addresses().is_empty());
        assert!(wallets.get("anything").is_none());
    }
}

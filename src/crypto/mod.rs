//! Cryptographic primitives: ECDSA over NIST P-256, public-key hashing,
//! and the Base58Check address codec.
//!
//! Public keys travel as the raw concatenation of the affine X and Y
//! coordinates (64 bytes); signatures as raw `r || s` (64 bytes). Addresses
//! are Base58Check over `version(1) || pubkey_hash(20) || checksum(4)`.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::generic_array::GenericArray;
use p256::EncodedPoint;
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Version byte prepended to the pubkey hash in an address.
pub const ADDRESS_VERSION: u8 = 0x00;

/// Bytes of double-SHA-256 appended as the address checksum.
const CHECKSUM_LEN: usize = 4;

/// Length of a decoded address: version + 20-byte hash + checksum.
const ADDRESS_PAYLOAD_LEN: usize = 1 + 20 + CHECKSUM_LEN;

// ─── Keypair ────────────────────────────────────────────────────────

/// Holds a P-256 signing key and its verifying key.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        let verifying_key = *signing_key.verifying_key();
        Self { signing_key, verifying_key }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Option<Self> {
        let signing_key = SigningKey::from_slice(bytes).ok()?;
        let verifying_key = *signing_key.verifying_key();
        Some(Self { signing_key, verifying_key })
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.signing_key.to_bytes());
        out
    }

    /// Raw X || Y, each coordinate 32 bytes zero-padded left.
    pub fn public_key_bytes(&self) -> [u8; 64] {
        let point = self.verifying_key.to_encoded_point(false);
        let mut out = [0u8; 64];
        out.copy_from_slice(&point.as_bytes()[1..]);
        out
    }

    /// Sign a digest, returning raw `r || s`.
    pub fn sign(&self, digest: &[u8]) -> [u8; 64] {
        let signature: Signature = self.signing_key.sign(digest);
        let mut out = [0u8; 64];
        out.copy_from_slice(&signature.to_bytes());
        out
    }

    pub fn pubkey_hash(&self) -> Vec<u8> {
        hash_pubkey(&self.public_key_bytes())
    }

    pub fn address(&self) -> String {
        pubkey_hash_to_address(&self.pubkey_hash())
    }
}

/// Verify a raw `r || s` signature against a raw `X || Y` public key.
pub fn verify_signature(pubkey: &[u8], msg: &[u8], signature: &[u8]) -> bool {
    if pubkey.len() != 64 || signature.len() != 64 {
        return false;
    }
    let point = EncodedPoint::from_untagged_bytes(GenericArray::from_slice(pubkey));
    let Ok(vk) = VerifyingKey::from_encoded_point(&point) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    vk.verify(msg, &sig).is_ok()
}

// ─── Hashing ────────────────────────────────────────────────────────

/// RIPEMD-160(SHA-256(pubkey)): the 20-byte hash outputs are locked to.
pub fn hash_pubkey(pubkey: &[u8]) -> Vec<u8> {
    let sha = Sha256::digest(pubkey);
    Ripemd160::digest(sha).to_vec()
}

/// First 4 bytes of double-SHA-256.
pub fn checksum(payload: &[u8]) -> [u8; CHECKSUM_LEN] {
    let first = Sha256::digest(payload);
    let second = Sha256::digest(first);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&second[..CHECKSUM_LEN]);
    out
}

// ─── Address Codec ──────────────────────────────────────────────────

pub fn pubkey_hash_to_address(pubkey_hash: &[u8]) -> String {
    let mut payload = Vec::with_capacity(ADDRESS_PAYLOAD_LEN);
    payload.push(ADDRESS_VERSION);
    payload.extend_from_slice(pubkey_hash);
    let check = checksum(&payload);
    payload.extend_from_slice(&check);
    base58_encode(&payload)
}

/// Decode and checksum-validate an address, returning its pubkey hash.
pub fn address_to_pubkey_hash(address: &str) -> Option<Vec<u8>> {
    let decoded = base58_decode(address)?;
    if decoded.len() != ADDRESS_PAYLOAD_LEN || decoded[0] != ADDRESS_VERSION {
        return None;
    }
    let (payload, check) = decoded.split_at(ADDRESS_PAYLOAD_LEN - CHECKSUM_LEN);
    if checksum(payload).as_slice() != check {
        return None;
    }
    Some(decoded[1..21].to_vec())
}

pub fn validate_address(address: &str) -> bool {
    address_to_pubkey_hash(address).is_some()
}

// ─── Base58 ─────────────────────────────────────────────────────────

const BASE58_ALPHABET: &[u8] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

pub fn base58_encode(data: &[u8]) -> String {
    if data.is_empty() {
        return String::new();
    }
    let zeros = data.iter().take_while(|&&b| b == 0).count();
    let mut num = data.to_vec();
    let mut encoded = Vec::new();
    while !num.iter().all(|&b| b == 0) {
        let mut remainder = 0u32;
        let mut quotient = Vec::with_capacity(num.len());
        for &byte in &num {
            let acc = (remainder << 8) + byte as u32;
            let digit = acc / 58;
            remainder = acc % 58;
            if !quotient.is_empty() || digit > 0 {
                quotient.push(digit as u8);
            }
        }
        encoded.push(BASE58_ALPHABET[remainder as usize]);
        num = quotient;
    }
    for _ in 0..zeros {
        encoded.push(b'1');
    }
    encoded.reverse();
    String::from_utf8(encoded).expect("alphabet is ascii")
}

pub fn base58_decode(encoded: &str) -> Option<Vec<u8>> {
    if encoded.is_empty() {
        return Some(Vec::new());
    }
    let zeros = encoded.bytes().take_while(|&b| b == b'1').count();
    let mut num: Vec<u8> = Vec::new();
    for ch in encoded.bytes() {
        let mut carry = BASE58_ALPHABET.iter().position(|&c| c == ch)? as u32;
        for byte in num.iter_mut().rev() {
            let acc = (*byte as u32) * 58 + carry;
            *byte = (acc & 0xFF) as u8;
            carry = acc >> 8;
        }
        while carry > 0 {
            num.insert(0, (carry & 0xFF) as u8);
            carry >>= 8;
        }
    }
    let mut decoded = vec![0u8; zeros];
    decoded.extend_from_slice(&num);
    Some(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"digest bytes");
        assert!(verify_signature(&kp.public_key_bytes(), b"digest bytes", &sig));
    }

    #[test]
    fn test_wrong_message_fails() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"digest bytes");
        assert!(!verify_signature(&kp.public_key_bytes(), b"other bytes", &sig));
    }

    #[test]
    fn test_wrong_key_fails() {
        let kp = Keypair::generate();
        let other = Keypair::generate();
        let sig = kp.sign(b"digest bytes");
        assert!(!verify_signature(&other.public_key_bytes(), b"digest bytes", &sig));
    }

    #[test]
    fn test_bad_lengths_rejected() {
        assert!(!verify_signature(&[0u8; 10], b"m", &[0u8; 64]));
        assert!(!verify_signature(&[0u8; 64], b"m", &[0u8; 10]));
    }

    #[test]
    fn test_keypair_roundtrip() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_bytes(&kp.secret_bytes()).unwrap();
        assert_eq!(restored.public_key_bytes(), kp.public_key_bytes());
    }

    #[test]
    fn test_pubkey_hash_is_20_bytes() {
        let kp = Keypair::generate();
        assert_eq!(kp.pubkey_hash().len(), 20);
    }

    #[test]
    fn test_address_roundtrip() {
        let kp = Keypair::generate();
        let address = kp.address();
        assert!(validate_address(&address));
        assert_eq!(address_to_pubkey_hash(&address).unwrap(), kp.pubkey_hash());
    }

    #[test]
    fn test_tampered_address_rejected() {
        let kp = Keypair::generate();
        let address = kp.address();
        // Flip one character to another alphabet member.
        let mut chars: Vec<char> = address.chars().collect();
        let idx = chars.len() / 2;
        chars[idx] = if chars[idx] == '2' { '3' } else { '2' };
        let tampered: String = chars.into_iter().collect();
        assert!(!validate_address(&tampered));
    }

    #[test]
    fn test_base58_roundtrip_with_leading_zeros() {
        let data = vec![0, 0, 1, 2, 3, 255];
        let encoded = base58_encode(&data);
        assert!(encoded.starts_with("11"));
        assert_eq!(base58_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn test_base58_rejects_invalid_char() {
        assert!(base58_decode("0OIl").is_none());
    }
}

//! Wallet identity: EVM addresses, recoverable secp256k1 signatures, and the
//! EIP-191 `personal_sign` digest.
//!
//! Every chat message is tied to the wallet that signed it. Nothing here keeps
//! key material except [`LocalWallet`], which stands in for a browser wallet in
//! the terminal client and in tests.

use std::fmt;
use std::str::FromStr;

use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// Errors produced while parsing or recovering wallet signatures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid signature encoding: {0}")]
    InvalidEncoding(String),
    #[error("signature recovery failed")]
    RecoveryFailed,
    #[error("signing failed: {0}")]
    SigningFailed(String),
}

/// Keccak-256 of `data`.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    Keccak256::digest(data).into()
}

/// Digest signed by `personal_sign` (EIP-191 version 0x45).
pub fn eip191_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

// ─── Address ────────────────────────────────────────────────────────────────

/// A 20-byte EVM wallet address.
///
/// Parsing accepts any hex casing (with or without `0x`); display is always
/// lower-case, so two addresses compare equal regardless of how they were typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Address derived from a secp256k1 public key.
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        let point = key.to_encoded_point(false);
        // Skip the 0x04 SEC1 tag; the address is the last 20 bytes of the hash.
        let hash = keccak256(&point.as_bytes()[1..]);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash[12..]);
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.len() != 40 {
            return Err(SignatureError::InvalidAddress(s.to_string()));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|_| SignatureError::InvalidAddress(s.to_string()))?;
        Ok(Address(bytes))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─── Signature ──────────────────────────────────────────────────────────────

/// A 65-byte recoverable signature in wallet order: `r ‖ s ‖ v`.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct WalletSignature(pub [u8; 65]);

impl WalletSignature {
    fn from_parts(signature: &Signature, recovery_id: RecoveryId) -> Self {
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&signature.to_bytes());
        bytes[64] = 27 + recovery_id.to_byte();
        WalletSignature(bytes)
    }

    /// Recover the address that produced this signature over `prehash`.
    pub fn recover(&self, prehash: &[u8; 32]) -> Result<Address, SignatureError> {
        let v = match self.0[64] {
            v @ (0 | 1) => v,
            v @ (27 | 28) => v - 27,
            other => {
                return Err(SignatureError::InvalidEncoding(format!(
                    "recovery byte {other}"
                )))
            }
        };
        let mut recovery_id = RecoveryId::from_byte(v).ok_or(SignatureError::RecoveryFailed)?;
        let mut signature = Signature::from_slice(&self.0[..64])
            .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
        // Wallets may hand back high-S signatures; flipping S flips the y parity.
        if let Some(normalized) = signature.normalize_s() {
            signature = normalized;
            recovery_id = RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced());
        }
        let key = VerifyingKey::recover_from_prehash(prehash, &signature, recovery_id)
            .map_err(|_| SignatureError::RecoveryFailed)?;
        Ok(Address::from_verifying_key(&key))
    }

    /// Recover the signer of an EIP-191 `personal_sign` over `message`.
    pub fn recover_personal(&self, message: &str) -> Result<Address, SignatureError> {
        self.recover(&eip191_hash(message.as_bytes()))
    }
}

impl fmt::Debug for WalletSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WalletSignature({self})")
    }
}

impl fmt::Display for WalletSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for WalletSignature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("0x");
        if digits.len() != 130 {
            return Err(SignatureError::InvalidEncoding(format!(
                "expected 65 bytes, got {} hex digits",
                digits.len()
            )));
        }
        let mut bytes = [0u8; 65];
        hex::decode_to_slice(digits, &mut bytes)
            .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
        Ok(WalletSignature(bytes))
    }
}

impl Serialize for WalletSignature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for WalletSignature {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ─── Local wallet ───────────────────────────────────────────────────────────

/// An in-process secp256k1 wallet.
#[derive(Clone)]
pub struct LocalWallet {
    key: SigningKey,
    address: Address,
}

impl LocalWallet {
    pub fn random() -> Self {
        Self::from_signing_key(SigningKey::random(&mut rand::rngs::OsRng))
    }

    /// Load a wallet from a 32-byte hex private key.
    pub fn from_hex(private_key: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(private_key.trim().trim_start_matches("0x"))
            .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
        Ok(Self::from_signing_key(key))
    }

    fn from_signing_key(key: SigningKey) -> Self {
        let address = Address::from_verifying_key(key.verifying_key());
        Self { key, address }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    /// Sign a 32-byte digest.
    pub fn sign_hash(&self, prehash: &[u8; 32]) -> Result<WalletSignature, SignatureError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(prehash)
            .map_err(|e| SignatureError::SigningFailed(e.to_string()))?;
        Ok(WalletSignature::from_parts(&signature, recovery_id))
    }

    /// `personal_sign` over a UTF-8 message.
    pub fn sign_personal(&self, message: &str) -> Result<WalletSignature, SignatureError> {
        self.sign_hash(&eip191_hash(message.as_bytes()))
    }
}

impl fmt::Debug for LocalWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWallet")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

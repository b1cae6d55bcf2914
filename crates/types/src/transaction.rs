use crate::address::Address;
use crate::amount::{amount_string, hex_array, Amount};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// 32-byte transaction identifier.
pub type TxHash = [u8; 32];

const HASH_DOMAIN: &[u8] = b"quill.tx.v1";

/// Errors produced while encoding, signing or verifying a transaction.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("signing key does not belong to sender {0}")]
    SignerMismatch(Address),
    #[error("transaction hash does not match its contents")]
    HashMismatch,
    #[error("sender address is not a valid ed25519 public key")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("invalid transaction encoding: {0}")]
    Encoding(#[from] bincode::Error),
    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// A signed value transfer.
///
/// `gas_price == 0` and `gas_limit == 0` ask the engine to substitute its
/// configured defaults. The sentinel values are what gets signed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Replay domain; must match the node's chain id.
    pub chain_id: u32,
    pub from: Address,
    pub to: Address,
    #[serde(with = "amount_string")]
    pub value: Amount,
    /// Must equal the sender's committed nonce + 1 when applied.
    pub nonce: u64,
    /// Creation time in seconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(with = "amount_string")]
    pub gas_price: Amount,
    pub gas_limit: u64,
    /// Opaque binary payload; charged per byte.
    #[serde(default, with = "serde_bytes")]
    pub data: Vec<u8>,
    #[serde(with = "hex_array")]
    pub hash: TxHash,
    #[serde(with = "hex_array")]
    pub signature: [u8; 64],
}

impl Transaction {
    /// Create an unsigned transfer stamped with the current time.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain_id: u32,
        from: Address,
        to: Address,
        value: Amount,
        nonce: u64,
        gas_price: Amount,
        gas_limit: u64,
    ) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let mut tx = Self {
            chain_id,
            from,
            to,
            value,
            nonce,
            timestamp,
            gas_price,
            gas_limit,
            data: Vec::new(),
            hash: [0u8; 32],
            signature: [0u8; 64],
        };
        tx.refresh_hash();
        tx
    }

    /// Attach a binary payload and recompute the hash.
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self.refresh_hash();
        self
    }

    /// Canonical byte layout covered by the hash (and thus the signature).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HASH_DOMAIN.len() + 4 + 64 + 16 + 8 + 8 + 16 + 8 + 4 + self.data.len());
        out.extend_from_slice(HASH_DOMAIN);
        out.extend_from_slice(&self.chain_id.to_be_bytes());
        out.extend_from_slice(self.from.as_bytes());
        out.extend_from_slice(self.to.as_bytes());
        out.extend_from_slice(&self.value.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.gas_price.to_be_bytes());
        out.extend_from_slice(&self.gas_limit.to_be_bytes());
        out.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    pub fn compute_hash(&self) -> TxHash {
        *blake3::hash(&self.canonical_bytes()).as_bytes()
    }

    fn refresh_hash(&mut self) {
        self.hash = self.compute_hash();
    }

    /// Sign with the sender's key. Fails if the key does not match `from`.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), TxError> {
        if Address::from_public_key(&key.verifying_key()) != self.from {
            return Err(TxError::SignerMismatch(self.from));
        }
        self.refresh_hash();
        self.signature = key.sign(&self.hash).to_bytes();
        Ok(())
    }

    /// Check the hash against the contents and the signature against `from`.
    pub fn verify(&self) -> Result<(), TxError> {
        if self.compute_hash() != self.hash {
            return Err(TxError::HashMismatch);
        }
        let key = self.from.verifying_key().ok_or(TxError::InvalidPublicKey)?;
        let signature = Signature::from_bytes(&self.signature);
        key.verify(&self.hash, &signature)
            .map_err(|_| TxError::InvalidSignature)
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }

    /// Binary wire encoding.
    pub fn to_raw(&self) -> Result<Vec<u8>, TxError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_raw(raw: &[u8]) -> Result<Self, TxError> {
        Ok(bincode::deserialize(raw)?)
    }

    /// Base64 of the wire encoding, as accepted by `sendRawTransaction`.
    pub fn to_base64(&self) -> Result<String, TxError> {
        Ok(BASE64.encode(self.to_raw()?))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, TxError> {
        let raw = BASE64.decode(encoded.trim())?;
        Self::from_raw(&raw)
    }
}

/// Parse a transaction hash from bare or `0x`-prefixed hex.
pub fn parse_tx_hash(input: &str) -> Option<TxHash> {
    let trimmed = input.trim();
    let payload = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    hex::decode(payload).ok()?.try_into().ok()
}

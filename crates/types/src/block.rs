use crate::address::Address;
use crate::amount::{amount_string, hex_array, Amount};
use crate::transaction::TxHash;
use blake3::Hasher as Blake3;
use serde::{Deserialize, Serialize};

/// Canonical identifier for a block header (32-byte digest).
pub type BlockHash = [u8; 32];

const HASH_DOMAIN: &[u8] = b"quill.block.v1";

/// Header of a sealed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    #[serde(with = "hex_array")]
    pub parent_hash: BlockHash,
    #[serde(with = "hex_array")]
    pub hash: BlockHash,
    /// Seal time in seconds since the Unix epoch.
    pub timestamp: i64,
    /// Receiver of the block reward and of every fee in the block.
    pub coinbase: Address,
    /// Applied transactions in execution order.
    pub tx_hashes: Vec<String>,
    pub gas_used: u64,
    #[serde(with = "amount_string")]
    pub fees: Amount,
    #[serde(with = "amount_string")]
    pub reward: Amount,
}

impl BlockHeader {
    /// Build a header and compute its hash.
    #[allow(clippy::too_many_arguments)]
    pub fn seal(
        height: u64,
        parent_hash: BlockHash,
        timestamp: i64,
        coinbase: Address,
        tx_hashes: &[TxHash],
        gas_used: u64,
        fees: Amount,
        reward: Amount,
    ) -> Self {
        let mut header = Self {
            height,
            parent_hash,
            hash: [0u8; 32],
            timestamp,
            coinbase,
            tx_hashes: tx_hashes.iter().map(hex::encode).collect(),
            gas_used,
            fees,
            reward,
        };
        header.hash = header.compute_hash(tx_hashes);
        header
    }

    fn compute_hash(&self, tx_hashes: &[TxHash]) -> BlockHash {
        let mut hasher = Blake3::new();
        hasher.update(HASH_DOMAIN);
        hasher.update(&self.height.to_be_bytes());
        hasher.update(&self.parent_hash);
        hasher.update(&self.timestamp.to_be_bytes());
        hasher.update(self.coinbase.as_bytes());
        for hash in tx_hashes {
            hasher.update(hash);
        }
        hasher.update(&self.gas_used.to_be_bytes());
        hasher.update(&self.fees.to_be_bytes());
        hasher.update(&self.reward.to_be_bytes());
        *hasher.finalize().as_bytes()
    }

    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_commits_to_transactions() {
        let coinbase = Address([1u8; 32]);
        let a = BlockHeader::seal(1, [0u8; 32], 10, coinbase, &[[2u8; 32]], 20_000, 5, 7);
        let b = BlockHeader::seal(1, [0u8; 32], 10, coinbase, &[[3u8; 32]], 20_000, 5, 7);
        let again = BlockHeader::seal(1, [0u8; 32], 10, coinbase, &[[2u8; 32]], 20_000, 5, 7);
        assert_ne!(a.hash, b.hash);
        assert_eq!(a.hash, again.hash);
        assert_eq!(a.tx_hashes, vec![hex::encode([2u8; 32])]);
    }
}

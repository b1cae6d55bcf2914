use quill_gas::GasPolicy;
use quill_types::{Address, Amount, UNITS_PER_COIN};
use std::time::Duration;

/// Reward minted to the coinbase for every sealed block: 0.48 coin.
pub const DEFAULT_BLOCK_REWARD: Amount = UNITS_PER_COIN / 100 * 48;

/// Chain-level parameters shared by validation, execution and production.
#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub chain_id: u32,
    pub coinbase: Address,
    pub block_reward: Amount,
    pub block_interval: Duration,
    pub max_transactions_per_block: usize,
    /// How far beyond the next expected nonce a submission may reach.
    pub max_nonce_gap: u64,
    /// Seal (and reward) blocks even when no transaction is ready.
    pub seal_empty_blocks: bool,
    pub gas: GasPolicy,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            chain_id: 100,
            coinbase: Address::ZERO,
            block_reward: DEFAULT_BLOCK_REWARD,
            block_interval: Duration::from_secs(5),
            max_transactions_per_block: 1_000,
            max_nonce_gap: 10_000,
            seal_empty_blocks: false,
            gas: GasPolicy::default(),
        }
    }
}

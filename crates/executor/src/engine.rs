//! Submission, lookup and block production over a shared ledger.

use crate::config::ChainConfig;
use crate::error::{ExecutionError, LookupError, SubmitError};
use crate::executor::{BlockStats, Execution, Executor};
use crate::validator::TxValidator;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use quill_ledger::{AccountDelta, AccountLedger, LedgerError};
use quill_mempool::{AddOutcome, Mempool, MempoolStats};
use quill_storage::Storage;
use quill_types::{
    AccountState, Address, Amount, BlockHeader, Event, Receipt, Transaction, TxHash,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A sealed block and what went into it.
#[derive(Debug, Clone)]
pub struct BlockSummary {
    pub header: BlockHeader,
    pub stats: BlockStats,
}

/// Transaction engine: validates submissions, pools them, applies them in
/// blocks and answers receipt and event lookups.
pub struct TxEngine {
    config: ChainConfig,
    storage: Arc<dyn Storage + Send + Sync>,
    ledger: AccountLedger,
    mempool: Arc<Mempool>,
    validator: TxValidator,
    executor: Executor,
    production: Mutex<()>,
    unsealed: Mutex<Option<UnsealedBlock>>,
}

impl TxEngine {
    pub fn new(
        config: ChainConfig,
        storage: Arc<dyn Storage + Send + Sync>,
        mempool: Arc<Mempool>,
    ) -> Result<Self> {
        config.gas.validate().context("invalid gas policy")?;
        let validator = TxValidator::new(config.chain_id, config.gas.clone(), config.max_nonce_gap);
        let executor = Executor::new(config.gas.clone(), config.coinbase);
        Ok(Self {
            ledger: AccountLedger::new(Arc::clone(&storage)),
            storage,
            mempool,
            validator,
            executor,
            config,
            production: Mutex::new(()),
            unsealed: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn chain_id(&self) -> u32 {
        self.config.chain_id
    }

    pub fn ledger(&self) -> &AccountLedger {
        &self.ledger
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn storage(&self) -> &Arc<dyn Storage + Send + Sync> {
        &self.storage
    }

    /// Credit the genesis allocations and store block zero, unless a genesis
    /// block already exists. Returns whether anything was written.
    pub fn initialize_genesis(&self, allocations: &[(Address, Amount)]) -> Result<bool> {
        let _guard = self.production.lock();
        if self.storage.get_block_by_height(0)?.is_some() {
            debug!("genesis already present");
            return Ok(false);
        }

        self.ledger.credit_genesis(allocations)?;
        let header = BlockHeader::seal(
            0,
            [0u8; 32],
            chrono::Utc::now().timestamp(),
            self.config.coinbase,
            &[],
            0,
            0,
            0,
        );
        self.storage.store_block(&header)?;
        info!(
            accounts = allocations.len(),
            hash = %header.hash_hex(),
            "genesis block created"
        );
        Ok(true)
    }

    /// Validate and pool a transaction.
    ///
    /// Resubmitting a transaction that is already pooled or confirmed returns
    /// its hash again without side effects.
    pub fn submit(&self, tx: Transaction) -> Result<TxHash, SubmitError> {
        let result = self.try_submit(tx);
        if let Err(err) = &result {
            metrics::counter!("quill_submissions_rejected_total", "reason" => err.kind().as_str())
                .increment(1);
            if err.is_client_error() {
                debug!(error = %err, "transaction rejected");
            } else {
                error!(error = %err, "transaction submission failed");
            }
        }
        result
    }

    /// Decode a base64 wire transaction and submit it.
    pub fn submit_raw(&self, encoded: &str) -> Result<TxHash, SubmitError> {
        let tx = Transaction::from_base64(encoded.trim())
            .map_err(|err| SubmitError::Malformed(err.to_string()))?;
        self.submit(tx)
    }

    fn try_submit(&self, tx: Transaction) -> Result<TxHash, SubmitError> {
        let gas = self.validator.check_stateless(&tx)?;
        let hash = tx.hash;

        if self.mempool.contains(&hash) || self.storage.get_receipt(&hash)?.is_some() {
            debug!(tx = %tx.hash_hex(), "duplicate submission");
            return Ok(hash);
        }

        let sender = self.ledger.get_state(&tx.from)?;
        self.validator.check_against_state(&tx, &sender, gas)?;

        self.storage.store_transaction(&tx)?;
        match self.mempool.add_transaction(tx, gas.gas_price)? {
            AddOutcome::Replaced(old) => {
                debug!(tx = %hex::encode(hash), replaced = %hex::encode(old), "replaced pooled transaction");
            }
            AddOutcome::Added | AddOutcome::AlreadyKnown => {}
        }
        metrics::gauge!("quill_mempool_size").set(self.mempool.size() as f64);
        debug!(tx = %hex::encode(hash), "transaction accepted");
        Ok(hash)
    }

    /// Committed state; unknown addresses read as zero.
    pub fn account_state(&self, address: &Address) -> Result<AccountState, LedgerError> {
        self.ledger.get_state(address)
    }

    /// Receipt for `hash`, or a pending receipt while it is still pooled.
    ///
    /// The pool is consulted first: a transaction leaves the pool only after
    /// its outcome is stored, so one of the two reads always sees it.
    pub fn receipt(&self, hash: &TxHash) -> Result<Receipt, LookupError> {
        if let Some(tx) = self.mempool.get_transaction(hash) {
            let gas = self.config.gas.resolve_tx(&tx);
            let mut receipt = Receipt::pending(&tx);
            receipt.gas_price = gas.gas_price;
            receipt.gas_limit = gas.gas_limit;
            return Ok(receipt);
        }
        self.storage.get_receipt(hash)?.ok_or(LookupError::NotFound)
    }

    /// Events recorded by a confirmed transaction.
    pub fn events(&self, hash: &TxHash) -> Result<Vec<Event>, LookupError> {
        if self.mempool.contains(hash) {
            return Err(LookupError::Pending);
        }
        if self.storage.get_receipt(hash)?.is_none() {
            return Err(LookupError::NotFound);
        }
        Ok(self.storage.get_events(hash)?)
    }

    pub fn transaction(&self, hash: &TxHash) -> Result<Option<Transaction>> {
        if let Some(tx) = self.mempool.get_transaction(hash) {
            return Ok(Some(tx));
        }
        self.storage.get_transaction(hash)
    }

    pub fn latest_block(&self) -> Result<Option<BlockHeader>> {
        let height = self.storage.get_latest_height()?;
        self.storage.get_block_by_height(height)
    }

    pub fn block(&self, height: u64) -> Result<Option<BlockHeader>> {
        self.storage.get_block_by_height(height)
    }

    pub fn mempool_stats(&self) -> MempoolStats {
        self.mempool.get_stats()
    }

    /// Apply ready transactions and seal a block.
    ///
    /// Returns `None` when nothing was applied and empty blocks are disabled.
    /// A block whose ledger changes are committed but whose records failed to
    /// persist is kept and sealed by the next call before anything new is
    /// selected.
    pub fn produce_block(&self) -> Result<Option<BlockSummary>> {
        let _guard = self.production.lock();

        let unsealed = self.unsealed.lock().take();
        if let Some(block) = unsealed {
            warn!(height = block.height, "retrying unsealed block");
            return self.seal(block).map(Some);
        }

        let ready = self
            .mempool
            .ready_transactions(self.config.max_transactions_per_block, |address| {
                match self.ledger.get_state(address) {
                    Ok(state) => state.nonce,
                    Err(err) => {
                        warn!(%address, error = %err, "failed to read sender nonce");
                        0
                    }
                }
            });
        if ready.is_empty() && !self.config.seal_empty_blocks {
            return Ok(None);
        }

        let latest = self.storage.get_latest_height()?;
        let parent = self.storage.get_block_by_height(latest)?;
        let height = latest + 1;
        let parent_hash = parent.map(|header| header.hash).unwrap_or([0u8; 32]);

        let mut stats = BlockStats::new(height);
        let mut executions: Vec<Execution> = Vec::with_capacity(ready.len());
        for tx in &ready {
            match self.executor.execute(&self.ledger, tx, height) {
                Ok(execution) => {
                    stats.record_execution(&execution);
                    executions.push(execution);
                }
                Err(ExecutionError::NonceMismatch { expected, got }) => {
                    debug!(tx = %tx.hash_hex(), expected, got, "deferring transaction");
                    stats.record_deferred();
                }
                Err(ExecutionError::Ledger(LedgerError::Storage(err))) => {
                    error!(tx = %tx.hash_hex(), error = %err, "ledger write failed; sealing partial block");
                    stats.record_deferred();
                    break;
                }
                Err(err) => {
                    warn!(tx = %tx.hash_hex(), error = %err, "dropping unexecutable transaction");
                    self.mempool.remove_transaction(&tx.hash);
                    stats.record_dropped(&tx.hash);
                }
            }
        }

        if executions.is_empty() && !self.config.seal_empty_blocks {
            metrics::gauge!("quill_mempool_size").set(self.mempool.size() as f64);
            debug!(
                deferred = stats.deferred,
                dropped = stats.dropped,
                "nothing applied; skipping block"
            );
            return Ok(None);
        }

        let reward = self.config.block_reward;
        if reward > 0 {
            self.ledger
                .apply_delta(self.config.coinbase, AccountDelta::credit(reward))?;
        }

        let block = UnsealedBlock {
            height,
            parent_hash,
            reward,
            executions,
            stats,
        };
        self.seal(block).map(Some)
    }

    /// Persist outcomes and the header of an applied block, then evict its
    /// transactions. On failure the block is kept for the next attempt and
    /// its transactions stay pooled.
    fn seal(&self, block: UnsealedBlock) -> Result<BlockSummary> {
        let header = match self.persist(&block) {
            Ok(header) => header,
            Err(err) => {
                error!(height = block.height, error = %err, "failed to persist block records");
                *self.unsealed.lock() = Some(block);
                return Err(err);
            }
        };
        let UnsealedBlock {
            height,
            executions,
            stats,
            ..
        } = block;

        let hashes: Vec<TxHash> = executions.iter().map(|e| e.receipt.tx_hash).collect();
        self.mempool.remove_transactions(&hashes);
        let senders: BTreeSet<Address> = executions.iter().map(|e| e.receipt.from).collect();
        for sender in senders {
            match self.ledger.get_state(&sender) {
                Ok(state) => {
                    let pruned = self.mempool.prune_stale(&sender, state.nonce);
                    if !pruned.is_empty() {
                        debug!(%sender, pruned = pruned.len(), "pruned stale pooled transactions");
                    }
                }
                Err(err) => warn!(%sender, error = %err, "failed to read sender nonce"),
            }
        }

        metrics::counter!("quill_transactions_applied_total", "status" => "success")
            .increment(stats.succeeded as u64);
        metrics::counter!("quill_transactions_applied_total", "status" => "failure")
            .increment(stats.failed as u64);
        metrics::gauge!("quill_block_height").set(height as f64);
        metrics::gauge!("quill_mempool_size").set(self.mempool.size() as f64);

        info!(
            height,
            hash = %header.hash_hex(),
            applied = stats.applied,
            failed = stats.failed,
            deferred = stats.deferred,
            dropped = stats.dropped,
            gas_used = stats.gas_used,
            "sealed block"
        );
        Ok(BlockSummary { header, stats })
    }

    fn persist(&self, block: &UnsealedBlock) -> Result<BlockHeader> {
        for execution in &block.executions {
            if !self
                .storage
                .record_outcome(&execution.receipt, &execution.events)?
            {
                debug!(
                    tx = %hex::encode(execution.receipt.tx_hash),
                    "outcome already recorded"
                );
            }
        }

        let hashes: Vec<TxHash> = block.executions.iter().map(|e| e.receipt.tx_hash).collect();
        let header = BlockHeader::seal(
            block.height,
            block.parent_hash,
            chrono::Utc::now().timestamp(),
            self.config.coinbase,
            &hashes,
            block.stats.gas_used,
            block.stats.total_fees,
            block.reward,
        );
        self.storage.store_block(&header)?;
        Ok(header)
    }
}

/// A block applied to the ledger whose records are not yet stored.
#[derive(Debug)]
struct UnsealedBlock {
    height: u64,
    parent_hash: [u8; 32],
    reward: Amount,
    executions: Vec<Execution>,
    stats: BlockStats,
}

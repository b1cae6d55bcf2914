//! # Quill Mempool
//!
//! Pending-transaction pool sitting between submission and block production.
//!
//! ## Features
//! - **Gas-price prioritization**
//! - **Nonce ordering** with future nonces queued per sender
//! - **Same-nonce replacement** at a strictly higher gas price
//! - **Automatic expiration**
//! - **Size limits** with lowest-price eviction
//! - **Thread-safe**
//!
//! Signature, chain and balance checks happen before a transaction reaches
//! the pool; the pool only deals with ordering and capacity.

use parking_lot::RwLock;
use quill_types::{Address, Amount, Transaction, TxHash};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::time::{Duration, Instant};
use thiserror::Error;

const DEFAULT_EXPIRATION: Duration = Duration::from_secs(300);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MempoolError {
    #[error("mempool full ({max} transactions) and gas price {offered} does not outbid the cheapest entry")]
    PoolFull { max: usize, offered: Amount },
    #[error("replacement gas price {offered} must exceed pooled gas price {existing}")]
    Underpriced { existing: Amount, offered: Amount },
}

/// Result of a successful [`Mempool::add_transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    /// Took the slot of a cheaper transaction with the same sender and nonce.
    Replaced(TxHash),
    /// Hash already pooled; nothing changed.
    AlreadyKnown,
}

/// Transaction metadata
#[derive(Debug, Clone)]
struct TransactionMeta {
    transaction: Transaction,
    added_at: Instant,
    gas_price: Amount,
}

/// Candidate for block inclusion
#[derive(Clone, Debug, PartialEq, Eq)]
struct BlockCandidate {
    gas_price: Amount,
    added_at: Instant,
    sender: Address,
    nonce: u64,
    tx_hash: TxHash,
}

impl Ord for BlockCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.gas_price
            .cmp(&other.gas_price)
            .then_with(|| other.added_at.cmp(&self.added_at))
            .then_with(|| self.tx_hash.cmp(&other.tx_hash))
    }
}

impl PartialOrd for BlockCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Thread-safe, gas-price-prioritized, nonce-ordered mempool
pub struct Mempool {
    transactions: RwLock<HashMap<TxHash, TransactionMeta>>,
    sender_nonces: RwLock<HashMap<Address, BTreeMap<u64, TxHash>>>,
    max_size: usize,
    expiration_duration: Duration,
    last_cleanup: RwLock<Instant>,
}

impl Mempool {
    pub fn new(max_size: usize) -> Self {
        Self::new_with_expiration(max_size, DEFAULT_EXPIRATION)
    }

    pub fn new_with_expiration(max_size: usize, expiration_duration: Duration) -> Self {
        Self {
            transactions: RwLock::new(HashMap::new()),
            sender_nonces: RwLock::new(HashMap::new()),
            max_size,
            expiration_duration,
            last_cleanup: RwLock::new(Instant::now()),
        }
    }

    /// Add a validated transaction, prioritised by its resolved gas price.
    pub fn add_transaction(
        &self,
        tx: Transaction,
        gas_price: Amount,
    ) -> Result<AddOutcome, MempoolError> {
        self.cleanup_expired_transactions();

        let tx_hash = tx.hash;
        let sender = tx.from;

        let mut transactions = self.transactions.write();
        let mut sender_nonces = self.sender_nonces.write();

        if transactions.contains_key(&tx_hash) {
            return Ok(AddOutcome::AlreadyKnown);
        }

        let replaced = Self::take_nonce_slot(
            &sender,
            tx.nonce,
            gas_price,
            &mut transactions,
            &mut sender_nonces,
        )?;

        if replaced.is_none()
            && transactions.len() >= self.max_size
            && !Self::make_space_for_transaction(&mut transactions, &mut sender_nonces, gas_price)
        {
            return Err(MempoolError::PoolFull {
                max: self.max_size,
                offered: gas_price,
            });
        }

        sender_nonces
            .entry(sender)
            .or_default()
            .insert(tx.nonce, tx_hash);
        transactions.insert(
            tx_hash,
            TransactionMeta {
                transaction: tx,
                added_at: Instant::now(),
                gas_price,
            },
        );

        Ok(match replaced {
            Some(old) => AddOutcome::Replaced(old),
            None => AddOutcome::Added,
        })
    }

    pub fn remove_transaction(&self, tx_hash: &TxHash) -> Option<Transaction> {
        let mut transactions = self.transactions.write();
        let mut sender_nonces = self.sender_nonces.write();
        Self::remove_locked(tx_hash, &mut transactions, &mut sender_nonces)
    }

    /// Remove a batch of transactions, e.g. after they were sealed in a block.
    pub fn remove_transactions(&self, hashes: &[TxHash]) -> usize {
        let mut transactions = self.transactions.write();
        let mut sender_nonces = self.sender_nonces.write();
        hashes
            .iter()
            .filter(|hash| Self::remove_locked(hash, &mut transactions, &mut sender_nonces).is_some())
            .count()
    }

    /// Drop every transaction from `sender` whose nonce is no longer
    /// applicable once the account reached `committed_nonce`.
    pub fn prune_stale(&self, sender: &Address, committed_nonce: u64) -> Vec<TxHash> {
        let mut transactions = self.transactions.write();
        let mut sender_nonces = self.sender_nonces.write();
        let Some(nonces) = sender_nonces.get_mut(sender) else {
            return Vec::new();
        };

        let stale: Vec<u64> = nonces.range(..=committed_nonce).map(|(n, _)| *n).collect();
        let mut removed = Vec::with_capacity(stale.len());
        for nonce in stale {
            if let Some(hash) = nonces.remove(&nonce) {
                transactions.remove(&hash);
                removed.push(hash);
            }
        }
        if nonces.is_empty() {
            sender_nonces.remove(sender);
        }
        removed
    }

    pub fn contains(&self, tx_hash: &TxHash) -> bool {
        self.transactions.read().contains_key(tx_hash)
    }

    pub fn get_transaction(&self, tx_hash: &TxHash) -> Option<Transaction> {
        self.transactions
            .read()
            .get(tx_hash)
            .map(|meta| meta.transaction.clone())
    }

    pub fn get_sender_transactions(&self, sender: &Address) -> Vec<Transaction> {
        let transactions = self.transactions.read();
        let sender_nonces = self.sender_nonces.read();

        if let Some(nonces) = sender_nonces.get(sender) {
            nonces
                .values()
                .filter_map(|h| transactions.get(h))
                .map(|meta| meta.transaction.clone())
                .collect()
        } else {
            Vec::new()
        }
    }

    /// Gas-price-prioritized selection for block building.
    ///
    /// Only nonce-contiguous runs starting at `account_nonce(sender) + 1` are
    /// eligible; transactions behind a gap stay pooled.
    pub fn ready_transactions<F>(&self, max_count: usize, account_nonce: F) -> Vec<Transaction>
    where
        F: Fn(&Address) -> u64,
    {
        if max_count == 0 {
            return Vec::new();
        }

        let transactions = self.transactions.read();
        let sender_nonces = self.sender_nonces.read();
        let mut heap = BinaryHeap::new();

        for (sender, nonces) in sender_nonces.iter() {
            let expected = account_nonce(sender).saturating_add(1);
            if let Some(tx_hash) = nonces.get(&expected) {
                if let Some(meta) = transactions.get(tx_hash) {
                    heap.push(BlockCandidate {
                        gas_price: meta.gas_price,
                        added_at: meta.added_at,
                        sender: *sender,
                        nonce: expected,
                        tx_hash: *tx_hash,
                    });
                }
            }
        }

        let mut selected = Vec::new();
        while selected.len() < max_count {
            let Some(candidate) = heap.pop() else { break };
            let Some(meta) = transactions.get(&candidate.tx_hash) else {
                continue;
            };
            selected.push(meta.transaction.clone());

            let next_nonce = candidate.nonce.saturating_add(1);
            let next = sender_nonces
                .get(&candidate.sender)
                .and_then(|nonces| nonces.get(&next_nonce))
                .and_then(|hash| transactions.get(hash).map(|meta| (hash, meta)));
            if let Some((next_hash, next_meta)) = next {
                heap.push(BlockCandidate {
                    gas_price: next_meta.gas_price,
                    added_at: next_meta.added_at,
                    sender: candidate.sender,
                    nonce: next_nonce,
                    tx_hash: *next_hash,
                });
            }
        }

        selected
    }

    pub fn size(&self) -> usize {
        self.transactions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&self) {
        self.transactions.write().clear();
        self.sender_nonces.write().clear();
    }

    fn remove_locked(
        tx_hash: &TxHash,
        transactions: &mut HashMap<TxHash, TransactionMeta>,
        sender_nonces: &mut HashMap<Address, BTreeMap<u64, TxHash>>,
    ) -> Option<Transaction> {
        let meta = transactions.remove(tx_hash)?;
        let sender = meta.transaction.from;
        if let Some(nonces) = sender_nonces.get_mut(&sender) {
            if nonces.get(&meta.transaction.nonce) == Some(tx_hash) {
                nonces.remove(&meta.transaction.nonce);
            }
            if nonces.is_empty() {
                sender_nonces.remove(&sender);
            }
        }
        Some(meta.transaction)
    }

    fn cleanup_expired_transactions(&self) {
        let now = Instant::now();
        let last_cleanup = *self.last_cleanup.read();
        let since = now.duration_since(last_cleanup);

        if since < CLEANUP_INTERVAL && since < self.expiration_duration {
            return;
        }

        let mut transactions = self.transactions.write();
        let mut sender_nonces = self.sender_nonces.write();
        let expired: Vec<TxHash> = transactions
            .iter()
            .filter(|(_, meta)| now.duration_since(meta.added_at) > self.expiration_duration)
            .map(|(hash, _)| *hash)
            .collect();

        for hash in &expired {
            Self::remove_locked(hash, &mut transactions, &mut sender_nonces);
        }
        if !expired.is_empty() {
            tracing::debug!(expired = expired.len(), "expired pooled transactions");
        }

        *self.last_cleanup.write() = now;
    }

    /// Free the `(sender, nonce)` slot for a new transaction. Returns the hash
    /// of the displaced transaction, if any.
    fn take_nonce_slot(
        sender: &Address,
        nonce: u64,
        new_gas_price: Amount,
        transactions: &mut HashMap<TxHash, TransactionMeta>,
        sender_nonces: &mut HashMap<Address, BTreeMap<u64, TxHash>>,
    ) -> Result<Option<TxHash>, MempoolError> {
        let Some(existing_hash) = sender_nonces.get(sender).and_then(|n| n.get(&nonce)).copied()
        else {
            return Ok(None);
        };

        if let Some(existing_meta) = transactions.get(&existing_hash) {
            if new_gas_price <= existing_meta.gas_price {
                return Err(MempoolError::Underpriced {
                    existing: existing_meta.gas_price,
                    offered: new_gas_price,
                });
            }
        }
        Self::remove_locked(&existing_hash, transactions, sender_nonces);
        Ok(Some(existing_hash))
    }

    fn make_space_for_transaction(
        transactions: &mut HashMap<TxHash, TransactionMeta>,
        sender_nonces: &mut HashMap<Address, BTreeMap<u64, TxHash>>,
        new_gas_price: Amount,
    ) -> bool {
        let cheapest = transactions
            .iter()
            .min_by_key(|(_, meta)| meta.gas_price)
            .map(|(hash, meta)| (*hash, meta.gas_price));

        match cheapest {
            Some((hash, price)) if price < new_gas_price => {
                Self::remove_locked(&hash, transactions, sender_nonces).is_some()
            }
            _ => false,
        }
    }

    /// Collect mempool diagnostics
    pub fn get_stats(&self) -> MempoolStats {
        let transactions = self.transactions.read();
        let now = Instant::now();
        let mut oldest_tx = now;
        let mut newest_tx: Option<Instant> = None;
        let mut highest_gas_price = 0;

        for meta in transactions.values() {
            oldest_tx = oldest_tx.min(meta.added_at);
            newest_tx = Some(newest_tx.map_or(meta.added_at, |n| n.max(meta.added_at)));
            highest_gas_price = highest_gas_price.max(meta.gas_price);
        }

        MempoolStats {
            size: transactions.len(),
            senders: self.sender_nonces.read().len(),
            highest_gas_price,
            oldest_tx_age: now.duration_since(oldest_tx),
            newest_tx_age: newest_tx.map_or(Duration::ZERO, |n| now.duration_since(n)),
        }
    }
}

/// Mempool statistics
#[derive(Debug, Clone)]
pub struct MempoolStats {
    pub size: usize,
    pub senders: usize,
    pub highest_gas_price: Amount,
    pub oldest_tx_age: Duration,
    pub newest_tx_age: Duration,
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use quill_types::SigningKey;

    const PRICE: Amount = 1_000_000;

    fn make_account(seed: u8) -> (SigningKey, Address) {
        let signing_key = SigningKey::from_bytes(&[seed; 32]);
        let address = Address::from_public_key(&signing_key.verifying_key());
        (signing_key, address)
    }

    fn signed_transaction(sender_seed: u8, recipient_seed: u8, value: Amount, nonce: u64) -> Transaction {
        let (key, from) = make_account(sender_seed);
        let (_, to) = make_account(recipient_seed);
        let mut tx = Transaction::new(100, from, to, value, nonce, PRICE, 20_000);
        tx.sign(&key).expect("transaction signing");
        tx
    }

    #[test]
    fn test_mempool_add_remove() {
        let mempool = Mempool::new(100);
        let tx = signed_transaction(1, 2, 1000, 1);
        assert_eq!(mempool.add_transaction(tx.clone(), PRICE), Ok(AddOutcome::Added));
        assert_eq!(mempool.size(), 1);
        assert_eq!(mempool.add_transaction(tx.clone(), PRICE), Ok(AddOutcome::AlreadyKnown));
        assert!(mempool.remove_transaction(&tx.hash).is_some());
        assert!(mempool.is_empty());
    }

    #[test]
    fn test_mempool_sender_transactions() {
        let mempool = Mempool::new(100);
        let tx1 = signed_transaction(1, 2, 1000, 1);
        let tx2 = signed_transaction(1, 3, 2000, 2);
        let sender = tx1.from;
        mempool.add_transaction(tx1, PRICE).unwrap();
        mempool.add_transaction(tx2, PRICE).unwrap();
        assert_eq!(mempool.get_sender_transactions(&sender).len(), 2);
    }

    #[test]
    fn test_mempool_gas_price_prioritization() {
        let mempool = Mempool::new(100);
        let cheap = signed_transaction(1, 3, 1000, 1);
        let rich = signed_transaction(2, 4, 2000, 1);
        mempool.add_transaction(cheap.clone(), PRICE).unwrap();
        mempool.add_transaction(rich.clone(), PRICE * 5).unwrap();
        let block_txs = mempool.ready_transactions(2, |_| 0);
        assert_eq!(block_txs[0].hash, rich.hash);
        assert_eq!(block_txs[1].hash, cheap.hash);
    }

    #[test]
    fn test_mempool_nonce_ordering() {
        let mempool = Mempool::new(100);
        let tx1 = signed_transaction(1, 2, 1000, 1);
        let tx2 = signed_transaction(1, 3, 2000, 2);
        let tx3 = signed_transaction(1, 4, 1500, 3);
        mempool.add_transaction(tx2.clone(), PRICE * 3).unwrap();
        mempool.add_transaction(tx1.clone(), PRICE).unwrap();
        mempool.add_transaction(tx3.clone(), PRICE * 2).unwrap();
        let nonces: Vec<_> = mempool
            .ready_transactions(3, |_| 0)
            .iter()
            .map(|tx| tx.nonce)
            .collect();
        assert_eq!(nonces, vec![1, 2, 3]);
    }

    #[test]
    fn test_future_nonces_wait_for_gap() {
        let mempool = Mempool::new(100);
        mempool.add_transaction(signed_transaction(1, 2, 1, 2), PRICE).unwrap();
        mempool.add_transaction(signed_transaction(1, 2, 1, 4), PRICE).unwrap();
        assert!(mempool.ready_transactions(10, |_| 0).is_empty());

        mempool.add_transaction(signed_transaction(1, 2, 1, 1), PRICE).unwrap();
        let nonces: Vec<_> = mempool
            .ready_transactions(10, |_| 0)
            .iter()
            .map(|tx| tx.nonce)
            .collect();
        assert_eq!(nonces, vec![1, 2]);
    }

    #[test]
    fn test_ready_respects_committed_nonce() {
        let mempool = Mempool::new(100);
        mempool.add_transaction(signed_transaction(1, 2, 1, 5), PRICE).unwrap();
        mempool.add_transaction(signed_transaction(1, 2, 1, 6), PRICE).unwrap();
        let ready = mempool.ready_transactions(10, |_| 4);
        assert_eq!(ready.len(), 2);
        assert!(mempool.ready_transactions(10, |_| 0).is_empty());
    }

    #[test]
    fn test_prune_stale_removes_consumed_nonces() {
        let mempool = Mempool::new(100);
        let tx1 = signed_transaction(1, 2, 1, 1);
        let tx2 = signed_transaction(1, 2, 1, 2);
        let tx3 = signed_transaction(1, 2, 1, 3);
        for tx in [&tx1, &tx2, &tx3] {
            mempool.add_transaction(tx.clone(), PRICE).unwrap();
        }
        let removed = mempool.prune_stale(&tx1.from, 2);
        assert_eq!(removed, vec![tx1.hash, tx2.hash]);
        assert!(mempool.contains(&tx3.hash));
        assert_eq!(mempool.size(), 1);
    }

    #[test]
    fn test_mempool_expiration() {
        let mempool = Mempool::new_with_expiration(100, Duration::from_millis(100));
        assert_eq!(
            mempool.add_transaction(signed_transaction(1, 2, 1000, 1), PRICE),
            Ok(AddOutcome::Added)
        );
        std::thread::sleep(Duration::from_millis(150));
        mempool.add_transaction(signed_transaction(3, 4, 1000, 1), PRICE).unwrap();
        assert_eq!(mempool.size(), 1);
    }

    #[test]
    fn test_mempool_stats() {
        let mempool = Mempool::new(100);
        mempool.add_transaction(signed_transaction(1, 2, 1000, 1), PRICE).unwrap();
        mempool.add_transaction(signed_transaction(3, 4, 2000, 1), PRICE * 2).unwrap();
        let stats = mempool.get_stats();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.senders, 2);
        assert_eq!(stats.highest_gas_price, PRICE * 2);
    }

    #[test]
    fn test_mempool_replaces_lower_price_for_same_nonce() {
        let mempool = Mempool::new(10);
        let low = signed_transaction(1, 2, 1000, 1);
        let high = signed_transaction(1, 3, 1000, 1);

        mempool.add_transaction(low.clone(), PRICE).unwrap();
        assert_eq!(
            mempool.add_transaction(high.clone(), PRICE * 2),
            Ok(AddOutcome::Replaced(low.hash))
        );
        assert!(mempool.get_transaction(&low.hash).is_none());
        assert!(mempool.get_transaction(&high.hash).is_some());
        assert_eq!(mempool.size(), 1);
    }

    #[test]
    fn test_mempool_rejects_equal_price_duplicate_nonce() {
        let mempool = Mempool::new(10);
        let first = signed_transaction(1, 2, 1000, 1);
        let second = signed_transaction(1, 3, 1000, 1);

        mempool.add_transaction(first.clone(), PRICE).unwrap();
        assert!(matches!(
            mempool.add_transaction(second, PRICE),
            Err(MempoolError::Underpriced { .. })
        ));
        assert!(mempool.contains(&first.hash));
    }

    #[test]
    fn test_full_pool_evicts_only_when_outbid() {
        let mempool = Mempool::new(1);
        let cheap = signed_transaction(1, 2, 1, 1);
        mempool.add_transaction(cheap.clone(), PRICE).unwrap();

        assert!(matches!(
            mempool.add_transaction(signed_transaction(2, 3, 1, 1), PRICE),
            Err(MempoolError::PoolFull { .. })
        ));

        let rich = signed_transaction(3, 4, 1, 1);
        mempool.add_transaction(rich.clone(), PRICE * 2).unwrap();
        assert!(!mempool.contains(&cheap.hash));
        assert!(mempool.contains(&rich.hash));
    }
}

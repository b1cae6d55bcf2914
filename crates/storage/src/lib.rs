use anyhow::Result;
use parking_lot::RwLock;
use quill_types::{AccountState, Address, BlockHeader, Event, Receipt, Transaction, TxHash};
use sled::transaction::{ConflictableTransactionResult, TransactionError};
use sled::{Db, Transactional, Tree};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

/// Storage errors
#[derive(thiserror::Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Corrupt value under key {0}")]
    CorruptValue(String),
    #[error("Receipt for {0} is not terminal and cannot be recorded")]
    NonTerminalReceipt(String),
}

/// Abstract storage trait
///
/// Receipts and their events form a write-once record per transaction hash:
/// the first `record_outcome` wins and both parts become visible together.
pub trait Storage {
    fn get_account(&self, address: &Address) -> Result<Option<AccountState>>;
    /// Persist all accounts in one atomic write.
    fn put_accounts(&self, accounts: &[AccountState]) -> Result<()>;
    fn get_all_accounts(&self) -> Result<Vec<AccountState>>;

    fn store_transaction(&self, tx: &Transaction) -> Result<()>;
    fn get_transaction(&self, hash: &TxHash) -> Result<Option<Transaction>>;
    fn get_transaction_count(&self) -> Result<u64>;

    /// Record a terminal receipt with its events. Returns `false` when an
    /// outcome for the hash already exists; nothing is written in that case.
    fn record_outcome(&self, receipt: &Receipt, events: &[Event]) -> Result<bool>;
    fn get_receipt(&self, hash: &TxHash) -> Result<Option<Receipt>>;
    /// Events for a recorded transaction; empty when none are recorded.
    fn get_events(&self, hash: &TxHash) -> Result<Vec<Event>>;

    fn store_block(&self, header: &BlockHeader) -> Result<()>;
    fn get_block_by_height(&self, height: u64) -> Result<Option<BlockHeader>>;
    fn get_latest_height(&self) -> Result<u64>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn ensure_terminal(receipt: &Receipt) -> Result<(), StorageError> {
    if receipt.status.is_terminal() {
        Ok(())
    } else {
        Err(StorageError::NonTerminalReceipt(hex::encode(receipt.tx_hash)))
    }
}

/// Sled-backed implementation
pub struct SledStorage {
    db: Db,
    blocks: Tree,
    transactions: Tree,
    accounts: Tree,
    receipts: Tree,
    events: Tree,
    metadata: Tree,
}

impl SledStorage {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let blocks = db.open_tree("blocks")?;
        let transactions = db.open_tree("transactions")?;
        let accounts = db.open_tree("accounts")?;
        let receipts = db.open_tree("receipts")?;
        let events = db.open_tree("events")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            transactions,
            accounts,
            receipts,
            events,
            metadata,
        })
    }
}

impl Storage for SledStorage {
    fn get_account(&self, address: &Address) -> Result<Option<AccountState>> {
        self.accounts
            .get(address.as_bytes())?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn put_accounts(&self, accounts: &[AccountState]) -> Result<()> {
        let mut batch = sled::Batch::default();
        for account in accounts {
            batch.insert(&account.address.as_bytes()[..], serde_json::to_vec(account)?);
        }
        self.accounts.apply_batch(batch)?;
        Ok(())
    }

    fn get_all_accounts(&self) -> Result<Vec<AccountState>> {
        self.accounts
            .iter()
            .map(|r| {
                let (_, v) = r?;
                Ok(serde_json::from_slice::<AccountState>(&v)?)
            })
            .collect()
    }

    fn store_transaction(&self, tx: &Transaction) -> Result<()> {
        let data = serde_json::to_vec(tx)?;
        self.transactions.insert(&tx.hash[..], data)?;
        Ok(())
    }

    fn get_transaction(&self, hash: &TxHash) -> Result<Option<Transaction>> {
        self.transactions
            .get(&hash[..])?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn get_transaction_count(&self) -> Result<u64> {
        Ok(self.transactions.len() as u64)
    }

    fn record_outcome(&self, receipt: &Receipt, events: &[Event]) -> Result<bool> {
        ensure_terminal(receipt)?;
        let key = receipt.tx_hash;
        let receipt_bytes = serde_json::to_vec(receipt)?;
        let event_bytes = serde_json::to_vec(events)?;

        let recorded = (&self.receipts, &self.events)
            .transaction(|(receipt_tree, event_tree)| -> ConflictableTransactionResult<bool, ()> {
                if receipt_tree.get(&key[..])?.is_some() {
                    return Ok(false);
                }
                receipt_tree.insert(&key[..], receipt_bytes.as_slice())?;
                event_tree.insert(&key[..], event_bytes.as_slice())?;
                Ok(true)
            })
            .map_err(|err: TransactionError<()>| match err {
                TransactionError::Storage(e) => StorageError::Database(e),
                TransactionError::Abort(()) => {
                    StorageError::CorruptValue(format!("aborted outcome {}", hex::encode(key)))
                }
            })?;

        if !recorded {
            tracing::debug!(tx = %hex::encode(key), "outcome already recorded");
        }
        Ok(recorded)
    }

    fn get_receipt(&self, hash: &TxHash) -> Result<Option<Receipt>> {
        self.receipts
            .get(&hash[..])?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn get_events(&self, hash: &TxHash) -> Result<Vec<Event>> {
        match self.events.get(&hash[..])? {
            Some(v) => Ok(serde_json::from_slice(&v)?),
            None => Ok(Vec::new()),
        }
    }

    fn store_block(&self, header: &BlockHeader) -> Result<()> {
        let key = header.height.to_be_bytes();
        self.blocks.insert(key, serde_json::to_vec(header)?)?;
        self.metadata.insert(b"latest_height", &key[..])?;
        Ok(())
    }

    fn get_block_by_height(&self, height: u64) -> Result<Option<BlockHeader>> {
        self.blocks
            .get(height.to_be_bytes())?
            .map(|v| serde_json::from_slice(&v))
            .transpose()
            .map_err(Into::into)
    }

    fn get_latest_height(&self) -> Result<u64> {
        match self.metadata.get(b"latest_height")? {
            Some(v) => {
                let bytes: [u8; 8] = v
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::CorruptValue("latest_height".into()))?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

/// In-memory testing backend
#[derive(Default)]
pub struct MemoryStorage {
    blocks: Arc<RwLock<BTreeMap<u64, BlockHeader>>>,
    txs: Arc<RwLock<HashMap<TxHash, Transaction>>>,
    accounts: Arc<RwLock<HashMap<Address, AccountState>>>,
    outcomes: Arc<RwLock<HashMap<TxHash, (Receipt, Vec<Event>)>>>,
}

impl Storage for MemoryStorage {
    fn get_account(&self, address: &Address) -> Result<Option<AccountState>> {
        Ok(self.accounts.read().get(address).copied())
    }

    fn put_accounts(&self, accounts: &[AccountState]) -> Result<()> {
        let mut guard = self.accounts.write();
        for account in accounts {
            guard.insert(account.address, *account);
        }
        Ok(())
    }

    fn get_all_accounts(&self) -> Result<Vec<AccountState>> {
        Ok(self.accounts.read().values().copied().collect())
    }

    fn store_transaction(&self, tx: &Transaction) -> Result<()> {
        self.txs.write().insert(tx.hash, tx.clone());
        Ok(())
    }

    fn get_transaction(&self, hash: &TxHash) -> Result<Option<Transaction>> {
        Ok(self.txs.read().get(hash).cloned())
    }

    fn get_transaction_count(&self) -> Result<u64> {
        Ok(self.txs.read().len() as u64)
    }

    fn record_outcome(&self, receipt: &Receipt, events: &[Event]) -> Result<bool> {
        ensure_terminal(receipt)?;
        let mut outcomes = self.outcomes.write();
        if outcomes.contains_key(&receipt.tx_hash) {
            return Ok(false);
        }
        outcomes.insert(receipt.tx_hash, (receipt.clone(), events.to_vec()));
        Ok(true)
    }

    fn get_receipt(&self, hash: &TxHash) -> Result<Option<Receipt>> {
        Ok(self.outcomes.read().get(hash).map(|(r, _)| r.clone()))
    }

    fn get_events(&self, hash: &TxHash) -> Result<Vec<Event>> {
        Ok(self
            .outcomes
            .read()
            .get(hash)
            .map(|(_, events)| events.clone())
            .unwrap_or_default())
    }

    fn store_block(&self, header: &BlockHeader) -> Result<()> {
        self.blocks.write().insert(header.height, header.clone());
        Ok(())
    }

    fn get_block_by_height(&self, height: u64) -> Result<Option<BlockHeader>> {
        Ok(self.blocks.read().get(&height).cloned())
    }

    fn get_latest_height(&self) -> Result<u64> {
        Ok(self.blocks.read().keys().next_back().copied().unwrap_or(0))
    }
}

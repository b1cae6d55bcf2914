//! Account ledger: balances and nonces with per-address exclusive mutation.
//!
//! Every mutation runs inside [`AccountLedger::transact`], which locks the
//! touched addresses in sorted order, stages all changes and publishes them
//! as one storage batch. A failing closure leaves no trace.

use parking_lot::Mutex;
use quill_storage::Storage;
use quill_types::{AccountState, Address, Amount};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient balance for {address}: available {available}, required {required}")]
    InsufficientBalance {
        address: Address,
        available: Amount,
        required: Amount,
    },
    #[error("balance overflow for {0}")]
    BalanceOverflow(Address),
    #[error("nonce overflow for {0}")]
    NonceOverflow(Address),
    #[error("address {0} was not locked for this update")]
    NotLocked(Address),
    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Change to one account. The debit is checked against the balance after
/// the credit is added.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountDelta {
    pub credit: Amount,
    pub debit: Amount,
    pub nonce_increment: u64,
}

impl AccountDelta {
    pub fn credit(amount: Amount) -> Self {
        Self {
            credit: amount,
            ..Self::default()
        }
    }

    pub fn debit(amount: Amount) -> Self {
        Self {
            debit: amount,
            ..Self::default()
        }
    }

    pub fn with_nonce_increment(mut self, increment: u64) -> Self {
        self.nonce_increment = increment;
        self
    }
}

pub struct AccountLedger {
    storage: Arc<dyn Storage + Send + Sync>,
    locks: Mutex<HashMap<Address, Arc<Mutex<()>>>>,
}

impl AccountLedger {
    pub fn new(storage: Arc<dyn Storage + Send + Sync>) -> Self {
        Self {
            storage,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage + Send + Sync> {
        &self.storage
    }

    /// Current state; unknown addresses read as the zero account.
    pub fn get_state(&self, address: &Address) -> Result<AccountState, LedgerError> {
        Ok(self
            .storage
            .get_account(address)?
            .unwrap_or_else(|| AccountState::empty(*address)))
    }

    /// Apply a single delta under the address lock.
    pub fn apply_delta(
        &self,
        address: Address,
        delta: AccountDelta,
    ) -> Result<AccountState, LedgerError> {
        self.transact(&[address], |txn| txn.apply(address, delta))
    }

    /// Run `f` with exclusive access to `addresses`.
    ///
    /// Changes staged through the [`LedgerTxn`] are committed atomically when
    /// `f` returns `Ok`, and discarded otherwise.
    pub fn transact<T, E, F>(&self, addresses: &[Address], f: F) -> Result<T, E>
    where
        F: FnOnce(&mut LedgerTxn<'_>) -> Result<T, E>,
        E: From<LedgerError>,
    {
        let mut ordered = addresses.to_vec();
        ordered.sort();
        ordered.dedup();

        let handles: Vec<Arc<Mutex<()>>> = ordered.iter().map(|a| self.lock_handle(a)).collect();
        let result = {
            let _guards: Vec<_> = handles.iter().map(|h| h.lock()).collect();
            let mut txn = LedgerTxn {
                ledger: self,
                locked: &ordered,
                staged: BTreeMap::new(),
            };
            f(&mut txn).and_then(|value| {
                txn.commit()?;
                Ok(value)
            })
        };
        drop(handles);
        self.release_locks(&ordered);
        result
    }

    /// Seed balances, typically at genesis.
    pub fn credit_genesis(&self, allocations: &[(Address, Amount)]) -> Result<(), LedgerError> {
        let addresses: Vec<Address> = allocations.iter().map(|(a, _)| *a).collect();
        self.transact(&addresses, |txn| {
            for (address, amount) in allocations {
                txn.apply(*address, AccountDelta::credit(*amount))?;
            }
            Ok::<_, LedgerError>(())
        })?;
        debug!(accounts = allocations.len(), "genesis allocations credited");
        Ok(())
    }

    /// Drop lock entries no other caller holds or waits on.
    fn release_locks(&self, addresses: &[Address]) {
        let mut locks = self.locks.lock();
        for address in addresses {
            if locks
                .get(address)
                .is_some_and(|handle| Arc::strong_count(handle) == 1)
            {
                locks.remove(address);
            }
        }
    }

    fn lock_handle(&self, address: &Address) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .lock()
                .entry(*address)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Staged view over a locked set of accounts.
pub struct LedgerTxn<'a> {
    ledger: &'a AccountLedger,
    locked: &'a [Address],
    staged: BTreeMap<Address, AccountState>,
}

impl LedgerTxn<'_> {
    /// State including changes staged so far.
    pub fn state(&mut self, address: &Address) -> Result<AccountState, LedgerError> {
        if self.locked.binary_search(address).is_err() {
            return Err(LedgerError::NotLocked(*address));
        }
        if let Some(state) = self.staged.get(address) {
            return Ok(*state);
        }
        let state = self.ledger.get_state(address)?;
        self.staged.insert(*address, state);
        Ok(state)
    }

    pub fn apply(
        &mut self,
        address: Address,
        delta: AccountDelta,
    ) -> Result<AccountState, LedgerError> {
        let mut state = self.state(&address)?;
        let funded = state
            .balance
            .checked_add(delta.credit)
            .ok_or(LedgerError::BalanceOverflow(address))?;
        state.balance = funded
            .checked_sub(delta.debit)
            .ok_or(LedgerError::InsufficientBalance {
                address,
                available: funded,
                required: delta.debit,
            })?;
        state.nonce = state
            .nonce
            .checked_add(delta.nonce_increment)
            .ok_or(LedgerError::NonceOverflow(address))?;
        self.staged.insert(address, state);
        Ok(state)
    }

    pub fn credit(&mut self, address: Address, amount: Amount) -> Result<AccountState, LedgerError> {
        self.apply(address, AccountDelta::credit(amount))
    }

    fn commit(self) -> Result<(), LedgerError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        let accounts: Vec<AccountState> = self.staged.into_values().collect();
        self.ledger.storage.put_accounts(&accounts)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use quill_storage::MemoryStorage;
    use std::thread;

    fn ledger() -> AccountLedger {
        AccountLedger::new(Arc::new(MemoryStorage::default()))
    }

    fn addr(seed: u8) -> Address {
        Address([seed; 32])
    }

    #[test]
    fn unknown_account_reads_as_zero() {
        let ledger = ledger();
        let state = ledger.get_state(&addr(1)).unwrap();
        assert_eq!(state, AccountState::empty(addr(1)));
        assert_eq!(state.next_nonce(), 1);
    }

    #[test]
    fn apply_delta_updates_balance_and_nonce() {
        let ledger = ledger();
        ledger.apply_delta(addr(1), AccountDelta::credit(100)).unwrap();
        let state = ledger
            .apply_delta(addr(1), AccountDelta::debit(40).with_nonce_increment(1))
            .unwrap();
        assert_eq!((state.balance, state.nonce), (60, 1));
        assert_eq!(ledger.get_state(&addr(1)).unwrap(), state);
    }

    #[test]
    fn overdraft_is_rejected_without_changes() {
        let ledger = ledger();
        ledger.apply_delta(addr(1), AccountDelta::credit(10)).unwrap();
        let err = ledger
            .apply_delta(addr(1), AccountDelta::debit(11).with_nonce_increment(1))
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        let state = ledger.get_state(&addr(1)).unwrap();
        assert_eq!((state.balance, state.nonce), (10, 0));
    }

    #[test]
    fn failed_transaction_discards_every_staged_change() {
        let ledger = ledger();
        ledger.apply_delta(addr(1), AccountDelta::credit(50)).unwrap();

        let result = ledger.transact(&[addr(1), addr(2)], |txn| {
            txn.apply(addr(1), AccountDelta::debit(30))?;
            txn.credit(addr(2), 30)?;
            txn.apply(addr(1), AccountDelta::debit(30))
        });
        assert!(result.is_err());
        assert_eq!(ledger.get_state(&addr(1)).unwrap().balance, 50);
        assert_eq!(ledger.get_state(&addr(2)).unwrap().balance, 0);
    }

    #[test]
    fn unlocked_address_cannot_be_touched() {
        let ledger = ledger();
        let err = ledger
            .transact(&[addr(1)], |txn| txn.credit(addr(2), 1))
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotLocked(_)));
    }

    #[test]
    fn same_address_deltas_accumulate() {
        let ledger = ledger();
        ledger
            .transact(&[addr(1), addr(1)], |txn| {
                txn.credit(addr(1), 5)?;
                txn.credit(addr(1), 7)
            })
            .unwrap();
        assert_eq!(ledger.get_state(&addr(1)).unwrap().balance, 12);
    }

    #[test]
    fn idle_addresses_leave_no_lock_entries() {
        let ledger = ledger();
        for seed in 0..=255u8 {
            ledger.apply_delta(addr(seed), AccountDelta::credit(1)).unwrap();
        }
        let _ = ledger.apply_delta(addr(1), AccountDelta::debit(10));
        assert!(ledger.locks.lock().is_empty());
        assert_eq!(ledger.get_state(&addr(255)).unwrap().balance, 1);
    }

    #[test]
    fn concurrent_transfers_conserve_supply() {
        let ledger = Arc::new(ledger());
        ledger
            .credit_genesis(&[(addr(1), 1_000), (addr(2), 1_000)])
            .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let (from, to) = if i % 2 == 0 { (addr(1), addr(2)) } else { (addr(2), addr(1)) };
                thread::spawn(move || {
                    for _ in 0..50 {
                        ledger
                            .transact(&[from, to], |txn| {
                                txn.apply(from, AccountDelta::debit(1).with_nonce_increment(1))?;
                                txn.credit(to, 1)
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert!(ledger.locks.lock().is_empty());
        let a = ledger.get_state(&addr(1)).unwrap();
        let b = ledger.get_state(&addr(2)).unwrap();
        assert_eq!(a.balance + b.balance, 2_000);
        assert_eq!(a.nonce + b.nonce, 400);
    }

    proptest! {
        #[test]
        fn transfers_never_create_or_destroy_value(
            start in 0u128..1_000_000,
            amounts in proptest::collection::vec(0u128..10_000, 1..20),
        ) {
            let ledger = ledger();
            ledger.credit_genesis(&[(addr(1), start)]).unwrap();
            for amount in amounts {
                let _ = ledger.transact(&[addr(1), addr(2)], |txn| {
                    txn.apply(addr(1), AccountDelta::debit(amount))?;
                    txn.credit(addr(2), amount)
                });
            }
            let total = ledger.get_state(&addr(1)).unwrap().balance
                + ledger.get_state(&addr(2)).unwrap().balance;
            prop_assert_eq!(total, start);
        }
    }
}

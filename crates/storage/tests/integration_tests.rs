//! Integration tests for storage backends (Sled and in-memory).
//! Covers accounts, transactions, write-once outcomes and block headers.

use quill_storage::{MemoryStorage, SledStorage, Storage};
use quill_types::{
    AccountState, Address, BlockHeader, Event, Receipt, SigningKey, Transaction, TxStatus,
};
use tempfile::TempDir;

/// Helper to create a signed test transaction
fn create_test_transaction(seed: u8, nonce: u64) -> Transaction {
    let key = SigningKey::from_bytes(&[seed; 32]);
    let from = Address::from_public_key(&key.verifying_key());
    let mut tx = Transaction::new(100, from, Address([0xEE; 32]), 1_000, nonce, 1_000_000, 20_000);
    tx.sign(&key).expect("sign");
    tx
}

/// Helper to create a terminal receipt for a transaction
fn create_test_receipt(tx: &Transaction, status: TxStatus, error: Option<&str>) -> Receipt {
    let mut receipt = Receipt::pending(tx);
    receipt.status = status;
    receipt.gas_used = 20_000;
    receipt.block_height = Some(1);
    receipt.error = error.map(str::to_string);
    receipt
}

fn create_test_account(seed: u8, balance: u128, nonce: u64) -> AccountState {
    AccountState {
        address: Address([seed; 32]),
        balance,
        nonce,
    }
}

fn exercise_backend<S: Storage>(storage: &S) {
    // accounts
    assert!(storage.get_account(&Address([1; 32])).unwrap().is_none());
    storage
        .put_accounts(&[create_test_account(1, 500, 0), create_test_account(2, 0, 3)])
        .unwrap();
    let stored = storage.get_account(&Address([1; 32])).unwrap().unwrap();
    assert_eq!(stored.balance, 500);
    assert_eq!(storage.get_all_accounts().unwrap().len(), 2);

    // transactions
    let tx = create_test_transaction(4, 1);
    storage.store_transaction(&tx).unwrap();
    assert_eq!(storage.get_transaction(&tx.hash).unwrap(), Some(tx.clone()));
    assert_eq!(storage.get_transaction_count().unwrap(), 1);

    // outcomes
    let receipt = create_test_receipt(&tx, TxStatus::Failure, Some("insufficient balance"));
    let events = vec![Event::transaction_result(&receipt)];
    assert!(storage.record_outcome(&receipt, &events).unwrap());
    assert!(!storage
        .record_outcome(&create_test_receipt(&tx, TxStatus::Success, None), &[])
        .unwrap());
    let stored = storage.get_receipt(&tx.hash).unwrap().unwrap();
    assert_eq!(stored.status, TxStatus::Failure);
    assert_eq!(storage.get_events(&tx.hash).unwrap(), events);

    // blocks
    assert_eq!(storage.get_latest_height().unwrap(), 0);
    let header = BlockHeader::seal(1, [0; 32], 1, Address([9; 32]), &[tx.hash], 20_000, 20_000_000_000, 7);
    storage.store_block(&header).unwrap();
    assert_eq!(storage.get_latest_height().unwrap(), 1);
    assert_eq!(storage.get_block_by_height(1).unwrap(), Some(header));
    assert!(storage.get_block_by_height(2).unwrap().is_none());
}

#[test]
fn memory_backend_behaves() {
    exercise_backend(&MemoryStorage::default());
}

#[test]
fn sled_backend_behaves() {
    let dir = TempDir::new().expect("tempdir");
    let storage = SledStorage::new(dir.path()).expect("open sled");
    exercise_backend(&storage);
}

#[test]
fn sled_state_survives_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let tx = create_test_transaction(5, 1);
    let receipt = create_test_receipt(&tx, TxStatus::Success, None);
    {
        let storage = SledStorage::new(dir.path()).expect("open sled");
        storage.put_accounts(&[create_test_account(3, 42, 1)]).unwrap();
        storage
            .record_outcome(&receipt, &[Event::transaction_result(&receipt)])
            .unwrap();
        storage.flush().unwrap();
    }

    let reopened = SledStorage::new(dir.path()).expect("reopen sled");
    let account = reopened.get_account(&Address([3; 32])).unwrap().unwrap();
    assert_eq!((account.balance, account.nonce), (42, 1));
    assert_eq!(reopened.get_receipt(&tx.hash).unwrap(), Some(receipt));
    assert_eq!(reopened.get_events(&tx.hash).unwrap().len(), 1);
}

#[test]
fn concurrent_writers_record_one_outcome() {
    use std::sync::Arc;
    use std::thread;

    let dir = TempDir::new().expect("tempdir");
    let storage = Arc::new(SledStorage::new(dir.path()).expect("open sled"));
    let tx = create_test_transaction(6, 1);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let storage = Arc::clone(&storage);
            let mut receipt = create_test_receipt(&tx, TxStatus::Success, None);
            receipt.gas_used = 20_000 + i;
            thread::spawn(move || storage.record_outcome(&receipt, &[]).unwrap())
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

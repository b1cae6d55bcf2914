use quill_executor::{
    BlockProducer, ChainConfig, LookupError, SubmitError, TxEngine, DEFAULT_BLOCK_REWARD,
    ERR_INSUFFICIENT_BALANCE,
};
use quill_mempool::Mempool;
use quill_storage::{SledStorage, Storage};
use quill_types::{parse_coins, Address, SigningKey, Transaction, TxStatus, UNITS_PER_COIN};
use rand_core::OsRng;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CHAIN_ID: u32 = 100;
const COINBASE: Address = Address([0xEE; 32]);

struct Harness {
    _dir: TempDir,
    engine: Arc<TxEngine>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(ChainConfig {
            chain_id: CHAIN_ID,
            coinbase: COINBASE,
            ..ChainConfig::default()
        })
    }

    fn with_config(config: ChainConfig) -> Self {
        let dir = TempDir::new().unwrap();
        let storage: Arc<dyn Storage + Send + Sync> =
            Arc::new(SledStorage::new(dir.path().join("db")).unwrap());
        let engine = TxEngine::new(config, storage, Arc::new(Mempool::new(10_000))).unwrap();
        Self {
            _dir: dir,
            engine: Arc::new(engine),
        }
    }

    fn funded_account(&self, coins: u128) -> SigningKey {
        let key = SigningKey::generate(&mut OsRng);
        let address = Address::from_public_key(&key.verifying_key());
        self.engine
            .ledger()
            .credit_genesis(&[(address, coins * UNITS_PER_COIN)])
            .unwrap();
        key
    }

    fn balance(&self, address: &Address) -> u128 {
        self.engine.account_state(address).unwrap().balance
    }
}

fn address_of(key: &SigningKey) -> Address {
    Address::from_public_key(&key.verifying_key())
}

fn transfer(key: &SigningKey, to: Address, value: u128, nonce: u64, gas_limit: u64) -> Transaction {
    let mut tx = Transaction::new(CHAIN_ID, address_of(key), to, value, nonce, 0, gas_limit);
    tx.sign(key).unwrap();
    tx
}

#[test]
fn transfer_confirms_with_expected_balances() {
    let h = Harness::new();
    h.engine.initialize_genesis(&[]).unwrap();
    let sender = h.funded_account(10);
    let to = address_of(&SigningKey::generate(&mut OsRng));

    let raw = transfer(&sender, to, UNITS_PER_COIN, 1, 0).to_base64().unwrap();
    let hash = h.engine.submit_raw(&raw).unwrap();
    h.engine.produce_block().unwrap().unwrap();

    let receipt = h.engine.receipt(&hash).unwrap();
    assert_eq!(receipt.status, TxStatus::Success);
    assert_eq!(receipt.gas_used, 20_000);
    assert_eq!(h.balance(&address_of(&sender)), 8_999_999_980_000_000_000);
    assert_eq!(h.balance(&to), UNITS_PER_COIN);

    let events = h.engine.events(&hash).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].topic, "chain.transactionResult");
    assert!(events[0].error.is_none());
}

#[test]
fn unaffordable_value_yields_failed_receipt_and_event_error() {
    let h = Harness::new();
    let sender = h.funded_account(10);
    let value = parse_coins("9.999999999999").unwrap();

    let hash = h
        .engine
        .submit(transfer(&sender, Address([1u8; 32]), value, 1, 0))
        .unwrap();
    h.engine.produce_block().unwrap().unwrap();

    let receipt = h.engine.receipt(&hash).unwrap();
    assert_eq!(receipt.status, TxStatus::Failure);
    assert_eq!(receipt.error.as_deref(), Some(ERR_INSUFFICIENT_BALANCE));
    let json = serde_json::to_value(&receipt).unwrap();
    assert!(json.get("status").is_none());

    let events = h.engine.events(&hash).unwrap();
    assert_eq!(events[0].error.as_deref(), Some(ERR_INSUFFICIENT_BALANCE));
    assert_eq!(h.balance(&address_of(&sender)), 9_999_999_980_000_000_000);
    assert_eq!(h.engine.account_state(&address_of(&sender)).unwrap().nonce, 1);
}

#[test]
fn exact_balance_boundary_drains_sender() {
    for gas_limit in [20_000u64, 400_000] {
        let h = Harness::new();
        let sender = h.funded_account(10);
        let value = parse_coins("9.99999998").unwrap();
        let hash = h
            .engine
            .submit(transfer(&sender, Address([2u8; 32]), value, 1, gas_limit))
            .unwrap();
        h.engine.produce_block().unwrap().unwrap();

        assert_eq!(h.engine.receipt(&hash).unwrap().status, TxStatus::Success);
        assert_eq!(h.balance(&address_of(&sender)), 0);
    }
}

#[test]
fn coinbase_receives_reward_plus_fees() {
    let h = Harness::new();
    let sender = h.funded_account(10);
    let before = h.balance(&COINBASE);

    h.engine
        .submit(transfer(&sender, Address([3u8; 32]), 1, 1, 0))
        .unwrap();
    h.engine.produce_block().unwrap().unwrap();

    let diff = h.balance(&COINBASE) - before;
    assert_eq!(diff / DEFAULT_BLOCK_REWARD, 1);
    assert_eq!(diff % DEFAULT_BLOCK_REWARD, 20_000_000_000);
}

#[test]
fn stale_and_distant_nonces_are_rejected() {
    let h = Harness::with_config(ChainConfig {
        chain_id: CHAIN_ID,
        coinbase: COINBASE,
        max_nonce_gap: 5,
        ..ChainConfig::default()
    });
    let sender = h.funded_account(10);
    h.engine
        .submit(transfer(&sender, Address([4u8; 32]), 1, 1, 0))
        .unwrap();
    h.engine.produce_block().unwrap().unwrap();

    let stale = h.engine.submit(transfer(&sender, Address([4u8; 32]), 2, 1, 0));
    assert!(matches!(stale, Err(SubmitError::InvalidNonce { expected: 2, .. })));

    let distant = h.engine.submit(transfer(&sender, Address([4u8; 32]), 1, 7, 0));
    assert!(matches!(
        distant,
        Err(SubmitError::InvalidNonce { max_allowed: 6, got: 7, .. })
    ));
}

#[test]
fn future_nonces_wait_for_the_gap_to_fill() {
    let h = Harness::new();
    let sender = h.funded_account(10);
    let to = Address([5u8; 32]);

    let third = h.engine.submit(transfer(&sender, to, 3, 3, 0)).unwrap();
    let second = h.engine.submit(transfer(&sender, to, 2, 2, 0)).unwrap();
    assert!(h.engine.produce_block().unwrap().is_none());
    assert_eq!(h.engine.receipt(&third).unwrap().status, TxStatus::Pending);

    let first = h.engine.submit(transfer(&sender, to, 1, 1, 0)).unwrap();
    let summary = h.engine.produce_block().unwrap().unwrap();
    assert_eq!(
        summary.header.tx_hashes,
        vec![hex::encode(first), hex::encode(second), hex::encode(third)]
    );
    assert_eq!(h.balance(&to), 6);
    assert_eq!(h.engine.account_state(&address_of(&sender)).unwrap().nonce, 3);
}

#[test]
fn forged_and_foreign_transactions_are_rejected() {
    let h = Harness::new();
    let sender = h.funded_account(10);

    let mut forged = transfer(&sender, Address([6u8; 32]), 1, 1, 0);
    forged.signature[10] ^= 0x01;
    assert!(matches!(
        h.engine.submit(forged),
        Err(SubmitError::InvalidSignature(_))
    ));

    let mut foreign = Transaction::new(1001, address_of(&sender), Address([6u8; 32]), 1, 1, 0, 0);
    foreign.sign(&sender).unwrap();
    assert!(matches!(
        h.engine.submit(foreign),
        Err(SubmitError::InvalidChainId { expected: CHAIN_ID, got: 1001 })
    ));

    let mut tampered = transfer(&sender, Address([6u8; 32]), 1, 1, 0);
    tampered.value = 2;
    assert!(matches!(
        h.engine.submit(tampered),
        Err(SubmitError::InvalidSignature(_))
    ));
    assert!(h.engine.mempool().is_empty());
}

#[test]
fn gas_must_be_covered_at_submission() {
    let h = Harness::new();
    let poor = SigningKey::generate(&mut OsRng);
    h.engine
        .ledger()
        .credit_genesis(&[(address_of(&poor), 10_000)])
        .unwrap();
    assert!(matches!(
        h.engine.submit(transfer(&poor, Address([7u8; 32]), 1, 1, 0)),
        Err(SubmitError::InsufficientFunds { .. })
    ));
}

#[test]
fn sender_drained_by_earlier_nonce_drops_later_one() {
    let h = Harness::new();
    let sender = SigningKey::generate(&mut OsRng);
    h.engine
        .ledger()
        .credit_genesis(&[(address_of(&sender), 30_000_000_000)])
        .unwrap();

    let first = h
        .engine
        .submit(transfer(&sender, Address([8u8; 32]), 10_000_000_000, 1, 0))
        .unwrap();
    let second = h
        .engine
        .submit(transfer(&sender, Address([8u8; 32]), 0, 2, 0))
        .unwrap();
    let summary = h.engine.produce_block().unwrap().unwrap();

    assert_eq!(summary.stats.dropped, 1);
    assert_eq!(h.engine.receipt(&first).unwrap().status, TxStatus::Success);
    assert!(matches!(h.engine.receipt(&second), Err(LookupError::NotFound)));
    assert_eq!(h.engine.account_state(&address_of(&sender)).unwrap().nonce, 1);
}

#[test]
fn state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("db");
    let key = SigningKey::generate(&mut OsRng);
    let sender = address_of(&key);
    let config = ChainConfig {
        coinbase: COINBASE,
        ..ChainConfig::default()
    };

    let hash = {
        let storage = Arc::new(SledStorage::new(&path).unwrap());
        let engine = TxEngine::new(config.clone(), storage.clone(), Arc::new(Mempool::new(16))).unwrap();
        engine
            .initialize_genesis(&[(sender, 10 * UNITS_PER_COIN)])
            .unwrap();
        let hash = engine
            .submit(transfer(&key, Address([9u8; 32]), UNITS_PER_COIN, 1, 0))
            .unwrap();
        engine.produce_block().unwrap().unwrap();
        storage.flush().unwrap();
        hash
    };

    let storage = Arc::new(SledStorage::new(&path).unwrap());
    let engine = TxEngine::new(config, storage, Arc::new(Mempool::new(16))).unwrap();
    assert!(!engine
        .initialize_genesis(&[(sender, 10 * UNITS_PER_COIN)])
        .unwrap());
    assert_eq!(engine.receipt(&hash).unwrap().status, TxStatus::Success);
    assert_eq!(
        engine.account_state(&sender).unwrap().balance,
        8_999_999_980_000_000_000
    );
    assert_eq!(engine.latest_block().unwrap().unwrap().height, 1);
}

#[tokio::test]
async fn producer_confirms_until_cancelled() {
    let h = Harness::with_config(ChainConfig {
        chain_id: CHAIN_ID,
        coinbase: COINBASE,
        block_interval: Duration::from_millis(20),
        ..ChainConfig::default()
    });
    let sender = h.funded_account(10);
    let hash = h
        .engine
        .submit(transfer(&sender, Address([10u8; 32]), 1, 1, 0))
        .unwrap();

    let shutdown = CancellationToken::new();
    let handle = BlockProducer::new(Arc::clone(&h.engine)).spawn(shutdown.clone());

    let mut confirmed = false;
    for _ in 0..100 {
        if h.engine.receipt(&hash).unwrap().status == TxStatus::Success {
            confirmed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(confirmed);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}

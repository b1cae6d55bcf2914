use crate::error::ExecutionError;
use quill_gas::{GasCharge, GasPolicy};
use quill_ledger::{AccountDelta, AccountLedger};
use quill_types::{Address, Amount, Event, Receipt, Transaction, TxHash, TxStatus};
use std::collections::HashMap;

/// Error recorded when the gas limit does not cover the intrinsic gas.
pub const ERR_OUT_OF_GAS: &str = "out of gas limit";
/// Error recorded when the sender cannot pay value plus gas.
pub const ERR_INSUFFICIENT_BALANCE: &str = "insufficient balance";

/// A transaction applied to the ledger, with the records to persist.
#[derive(Debug, Clone)]
pub struct Execution {
    pub receipt: Receipt,
    pub events: Vec<Event>,
    pub charge: GasCharge,
}

impl Execution {
    pub fn succeeded(&self) -> bool {
        self.receipt.status == TxStatus::Success
    }
}

/// Applies transfers and their gas charges against the ledger.
#[derive(Debug, Clone)]
pub struct Executor {
    gas: GasPolicy,
    coinbase: Address,
}

impl Executor {
    pub fn new(gas: GasPolicy, coinbase: Address) -> Self {
        Self { gas, coinbase }
    }

    pub fn gas_policy(&self) -> &GasPolicy {
        &self.gas
    }

    pub fn coinbase(&self) -> Address {
        self.coinbase
    }

    /// Apply `tx` as part of the block at `block_height`.
    ///
    /// Sender, recipient and coinbase are locked for the duration. On `Err`
    /// nothing was written and the nonce is untouched. On `Ok` the nonce was
    /// consumed and the gas fee moved to the coinbase, whether or not the
    /// value transfer itself succeeded.
    pub fn execute(
        &self,
        ledger: &AccountLedger,
        tx: &Transaction,
        block_height: u64,
    ) -> Result<Execution, ExecutionError> {
        let gas = self.gas.resolve_tx(tx);

        ledger.transact(&[tx.from, tx.to, self.coinbase], |txn| {
            let sender = txn.state(&tx.from)?;
            let expected = sender.next_nonce();
            if tx.nonce != expected {
                return Err(ExecutionError::NonceMismatch {
                    expected,
                    got: tx.nonce,
                });
            }

            let max_fee = self.gas.max_fee(gas)?;
            if sender.balance < max_fee {
                return Err(ExecutionError::Unaffordable {
                    available: sender.balance,
                    required: max_fee,
                });
            }

            let intrinsic = self.gas.intrinsic_gas(tx.data.len())?;
            let (charge, error) = if gas.gas_limit < intrinsic {
                (self.gas.penalty(gas)?, Some(ERR_OUT_OF_GAS))
            } else {
                let charge = self.gas.charge(intrinsic, gas)?;
                let total = tx
                    .value
                    .checked_add(charge.fee)
                    .ok_or(ExecutionError::Overflow)?;
                if sender.balance < total {
                    (charge, Some(ERR_INSUFFICIENT_BALANCE))
                } else {
                    (charge, None)
                }
            };

            let transferred: Amount = if error.is_none() { tx.value } else { 0 };
            txn.apply(
                tx.from,
                AccountDelta::debit(charge.fee + transferred).with_nonce_increment(1),
            )?;
            if transferred > 0 {
                txn.credit(tx.to, transferred)?;
            }
            txn.credit(self.coinbase, charge.reward)?;

            let receipt = Receipt {
                tx_hash: tx.hash,
                status: if error.is_none() {
                    TxStatus::Success
                } else {
                    TxStatus::Failure
                },
                chain_id: tx.chain_id,
                from: tx.from,
                to: tx.to,
                value: tx.value,
                nonce: tx.nonce,
                gas_price: gas.gas_price,
                gas_limit: gas.gas_limit,
                gas_used: charge.gas_used,
                block_height: Some(block_height),
                error: error.map(str::to_string),
            };
            let events = vec![Event::transaction_result(&receipt)];
            Ok(Execution {
                receipt,
                events,
                charge,
            })
        })
    }
}

/// Per-block execution tallies.
#[derive(Debug, Default, Clone)]
pub struct BlockStats {
    pub height: u64,
    pub applied: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Left in the pool, waiting for an earlier nonce.
    pub deferred: usize,
    /// Removed from the pool without being applied.
    pub dropped: usize,
    pub gas_used: u64,
    pub total_value: Amount,
    pub total_fees: Amount,
    pub failure_reasons: HashMap<String, usize>,
}

impl BlockStats {
    pub fn new(height: u64) -> Self {
        Self {
            height,
            ..Default::default()
        }
    }

    pub fn record_execution(&mut self, execution: &Execution) {
        self.applied += 1;
        self.gas_used = self.gas_used.saturating_add(execution.charge.gas_used);
        self.total_fees = self.total_fees.saturating_add(execution.charge.fee);
        if execution.succeeded() {
            self.succeeded += 1;
            self.total_value = self.total_value.saturating_add(execution.receipt.value);
        } else {
            self.failed += 1;
            let reason = execution.receipt.error.clone().unwrap_or_default();
            *self.failure_reasons.entry(reason).or_insert(0) += 1;
        }
    }

    pub fn record_deferred(&mut self) {
        self.deferred += 1;
    }

    pub fn record_dropped(&mut self, _hash: &TxHash) {
        self.dropped += 1;
    }
}

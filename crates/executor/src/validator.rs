use crate::error::SubmitError;
use quill_gas::{GasPolicy, ResolvedGas};
use quill_types::{AccountState, Transaction};

/// Submission-time checks. Nothing here mutates state.
#[derive(Debug, Clone)]
pub struct TxValidator {
    chain_id: u32,
    gas: GasPolicy,
    max_nonce_gap: u64,
}

impl TxValidator {
    pub fn new(chain_id: u32, gas: GasPolicy, max_nonce_gap: u64) -> Self {
        Self {
            chain_id,
            gas,
            max_nonce_gap,
        }
    }

    /// Chain id, hash, signature and gas bounds. Returns the gas parameters
    /// with defaults substituted.
    pub fn check_stateless(&self, tx: &Transaction) -> Result<ResolvedGas, SubmitError> {
        if tx.chain_id != self.chain_id {
            return Err(SubmitError::InvalidChainId {
                expected: self.chain_id,
                got: tx.chain_id,
            });
        }
        tx.verify().map_err(SubmitError::InvalidSignature)?;

        let gas = self.gas.resolve_tx(tx);
        self.gas.check_bounds(gas)?;
        Ok(gas)
    }

    /// Nonce window and gas affordability against the sender's committed
    /// state.
    ///
    /// Only `gas_limit * gas_price` has to be covered here; whether the value
    /// is affordable as well is decided at execution, where a shortfall
    /// produces a failed receipt.
    pub fn check_against_state(
        &self,
        tx: &Transaction,
        sender: &AccountState,
        gas: ResolvedGas,
    ) -> Result<(), SubmitError> {
        let expected = sender.next_nonce();
        let max_allowed = sender.nonce.saturating_add(self.max_nonce_gap);
        if tx.nonce < expected || tx.nonce > max_allowed {
            return Err(SubmitError::InvalidNonce {
                expected,
                max_allowed,
                got: tx.nonce,
            });
        }

        let required = self.gas.max_fee(gas)?;
        if sender.balance < required {
            return Err(SubmitError::InsufficientFunds {
                available: sender.balance,
                required,
            });
        }
        Ok(())
    }
}

use quill_types::{Amount, Transaction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_BASE_GAS: u64 = 20_000;
pub const DEFAULT_DATA_GAS_PER_BYTE: u64 = 1;
pub const DEFAULT_GAS_PRICE: Amount = 1_000_000;
pub const DEFAULT_MIN_GAS_PRICE: Amount = 1_000_000;
pub const DEFAULT_MAX_GAS_PRICE: Amount = 1_000_000_000_000;
pub const DEFAULT_GAS_LIMIT: u64 = 20_000;
pub const DEFAULT_MAX_GAS_LIMIT: u64 = 50_000_000_000;

/// Deterministic gas policy for value transfers.
///
/// Every unit of gas consumed is paid by the sender and credited in full to
/// the block's coinbase: `fee == reward == gas_used * gas_price`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasPolicy {
    /// Floor charged for any transaction.
    pub base_gas: u64,
    pub data_gas_per_byte: u64,
    /// Substituted when a transaction carries gas price 0.
    pub default_gas_price: Amount,
    /// Substituted when a transaction carries gas limit 0.
    pub default_gas_limit: u64,
    pub min_gas_price: Amount,
    pub max_gas_price: Amount,
    pub max_gas_limit: u64,
}

impl Default for GasPolicy {
    fn default() -> Self {
        Self {
            base_gas: DEFAULT_BASE_GAS,
            data_gas_per_byte: DEFAULT_DATA_GAS_PER_BYTE,
            default_gas_price: DEFAULT_GAS_PRICE,
            default_gas_limit: DEFAULT_GAS_LIMIT,
            min_gas_price: DEFAULT_MIN_GAS_PRICE,
            max_gas_price: DEFAULT_MAX_GAS_PRICE,
            max_gas_limit: DEFAULT_MAX_GAS_LIMIT,
        }
    }
}

/// Gas parameters after default substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedGas {
    pub gas_price: Amount,
    pub gas_limit: u64,
}

/// Result of metering one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GasCharge {
    pub gas_used: u64,
    pub gas_price: Amount,
    /// Debited from the sender.
    pub fee: Amount,
    /// Credited to the coinbase. Always equal to `fee`.
    pub reward: Amount,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GasError {
    #[error("gas policy misconfigured: {0}")]
    InvalidPolicy(&'static str),
    #[error("gas price {provided} outside [{min}, {max}]")]
    GasPriceOutOfRange {
        provided: Amount,
        min: Amount,
        max: Amount,
    },
    #[error("gas limit {provided} exceeds maximum {max}")]
    GasLimitTooHigh { provided: u64, max: u64 },
    #[error("gas used {used} below base gas {base}")]
    BelowBaseGas { used: u64, base: u64 },
    #[error("gas used {used} exceeds gas limit {limit}")]
    LimitExceeded { used: u64, limit: u64 },
    #[error("fee computation overflowed")]
    Overflow,
}

impl GasPolicy {
    pub fn validate(&self) -> Result<(), GasError> {
        if self.base_gas == 0 {
            return Err(GasError::InvalidPolicy("base gas must be positive"));
        }
        if self.min_gas_price == 0 || self.min_gas_price > self.max_gas_price {
            return Err(GasError::InvalidPolicy("gas price bounds are inconsistent"));
        }
        if !(self.min_gas_price..=self.max_gas_price).contains(&self.default_gas_price) {
            return Err(GasError::InvalidPolicy("default gas price outside bounds"));
        }
        if self.default_gas_limit == 0 || self.default_gas_limit > self.max_gas_limit {
            return Err(GasError::InvalidPolicy("default gas limit outside bounds"));
        }
        Ok(())
    }

    /// Substitute network defaults for the zero sentinels.
    pub fn resolve(&self, gas_price: Amount, gas_limit: u64) -> ResolvedGas {
        ResolvedGas {
            gas_price: if gas_price == 0 {
                self.default_gas_price
            } else {
                gas_price
            },
            gas_limit: if gas_limit == 0 {
                self.default_gas_limit
            } else {
                gas_limit
            },
        }
    }

    pub fn resolve_tx(&self, tx: &Transaction) -> ResolvedGas {
        self.resolve(tx.gas_price, tx.gas_limit)
    }

    /// Bounds check applied at submission time.
    ///
    /// A gas limit below the intrinsic cost is deliberately accepted here: it
    /// fails during execution and still pays for its limit.
    pub fn check_bounds(&self, gas: ResolvedGas) -> Result<(), GasError> {
        if gas.gas_price < self.min_gas_price || gas.gas_price > self.max_gas_price {
            return Err(GasError::GasPriceOutOfRange {
                provided: gas.gas_price,
                min: self.min_gas_price,
                max: self.max_gas_price,
            });
        }
        if gas.gas_limit > self.max_gas_limit {
            return Err(GasError::GasLimitTooHigh {
                provided: gas.gas_limit,
                max: self.max_gas_limit,
            });
        }
        Ok(())
    }

    /// Gas consumed by a transfer carrying `data_len` payload bytes.
    pub fn intrinsic_gas(&self, data_len: usize) -> Result<u64, GasError> {
        let data_gas = (data_len as u64)
            .checked_mul(self.data_gas_per_byte)
            .ok_or(GasError::Overflow)?;
        self.base_gas.checked_add(data_gas).ok_or(GasError::Overflow)
    }

    /// Upper bound the sender must be able to pay: `gas_limit * gas_price`.
    pub fn max_fee(&self, gas: ResolvedGas) -> Result<Amount, GasError> {
        (gas.gas_limit as Amount)
            .checked_mul(gas.gas_price)
            .ok_or(GasError::Overflow)
    }

    /// Meter a transaction that consumed `gas_used`.
    pub fn charge(&self, gas_used: u64, gas: ResolvedGas) -> Result<GasCharge, GasError> {
        if gas_used < self.base_gas {
            return Err(GasError::BelowBaseGas {
                used: gas_used,
                base: self.base_gas,
            });
        }
        if gas_used > gas.gas_limit {
            return Err(GasError::LimitExceeded {
                used: gas_used,
                limit: gas.gas_limit,
            });
        }
        let fee = (gas_used as Amount)
            .checked_mul(gas.gas_price)
            .ok_or(GasError::Overflow)?;
        Ok(GasCharge {
            gas_used,
            gas_price: gas.gas_price,
            fee,
            reward: fee,
        })
    }

    /// Charge for a transaction whose limit does not cover its intrinsic
    /// gas: the whole limit is consumed.
    pub fn penalty(&self, gas: ResolvedGas) -> Result<GasCharge, GasError> {
        let fee = self.max_fee(gas)?;
        Ok(GasCharge {
            gas_used: gas.gas_limit,
            gas_price: gas.gas_price,
            fee,
            reward: fee,
        })
    }
}

use crate::address::Address;
use crate::amount::{amount_string, hex_array, Amount};
use crate::transaction::{Transaction, TxHash};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Reserved topic for the execution outcome of a transaction.
pub const TOPIC_TRANSACTION_RESULT: &str = "chain.transactionResult";

/// Lifecycle status carried by a receipt.
///
/// Encoded numerically on the wire. `Failure` is the zero value and is left
/// out of JSON receipts entirely, so readers must treat a missing status as
/// failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TxStatus {
    #[default]
    Failure,
    Success,
    Pending,
}

impl TxStatus {
    pub fn code(self) -> u8 {
        match self {
            TxStatus::Failure => 0,
            TxStatus::Success => 1,
            TxStatus::Pending => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TxStatus::Failure),
            1 => Some(TxStatus::Success),
            2 => Some(TxStatus::Pending),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TxStatus::Failure)
    }

    /// Success and failure are terminal; pending is not.
    pub fn is_terminal(self) -> bool {
        !matches!(self, TxStatus::Pending)
    }
}

impl Serialize for TxStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for TxStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        TxStatus::from_code(code)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown transaction status {code}")))
    }
}

/// Execution receipt for a transaction.
///
/// Resulting balances are not embedded; query account state for those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    #[serde(with = "hex_array")]
    pub tx_hash: TxHash,
    #[serde(default, skip_serializing_if = "TxStatus::is_failure")]
    pub status: TxStatus,
    pub chain_id: u32,
    pub from: Address,
    pub to: Address,
    #[serde(with = "amount_string")]
    pub value: Amount,
    pub nonce: u64,
    #[serde(with = "amount_string")]
    pub gas_price: Amount,
    pub gas_limit: u64,
    pub gas_used: u64,
    /// Height of the sealing block; absent while pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_height: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Receipt {
    /// Receipt view for a transaction that has been accepted but not yet
    /// confirmed.
    pub fn pending(tx: &Transaction) -> Self {
        Self {
            tx_hash: tx.hash,
            status: TxStatus::Pending,
            chain_id: tx.chain_id,
            from: tx.from,
            to: tx.to,
            value: tx.value,
            nonce: tx.nonce,
            gas_price: tx.gas_price,
            gas_limit: tx.gas_limit,
            gas_used: 0,
            block_height: None,
            error: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == TxStatus::Pending
    }
}

/// Structured log entry emitted during execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    /// JSON-encoded payload.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Event {
    /// The `chain.transactionResult` event recorded for every applied
    /// transaction.
    pub fn transaction_result(receipt: &Receipt) -> Self {
        let data = serde_json::json!({
            "hash": hex::encode(receipt.tx_hash),
            "status": receipt.status.code(),
            "gas_used": receipt.gas_used.to_string(),
            "error": receipt.error.clone().unwrap_or_default(),
        });
        Self {
            topic: TOPIC_TRANSACTION_RESULT.to_string(),
            data: data.to_string(),
            error: receipt.error.clone(),
        }
    }
}

use crate::address::Address;
use crate::amount::{amount_string, Amount};
use serde::{Deserialize, Serialize};

/// Balance and nonce of a single account.
///
/// Accounts exist implicitly: an address that was never written reads as a
/// zero balance with nonce 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    pub address: Address,
    #[serde(with = "amount_string")]
    pub balance: Amount,
    /// Number of transactions applied from this account.
    pub nonce: u64,
}

impl AccountState {
    pub fn empty(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            nonce: 0,
        }
    }

    /// Nonce the next transaction from this account must carry.
    pub fn next_nonce(&self) -> u64 {
        self.nonce.saturating_add(1)
    }
}

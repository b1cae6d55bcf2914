pub mod account;
pub mod address;
pub mod amount;
pub mod block;
pub mod devnet;
pub mod receipt;
pub mod transaction;

pub use account::*;
pub use address::*;
pub use amount::{format_coins, parse_coins, Amount, AmountParseError, COIN_DECIMALS, UNITS_PER_COIN};
pub use block::*;
pub use receipt::*;
pub use transaction::*;

pub use ed25519_dalek::{SigningKey, VerifyingKey};

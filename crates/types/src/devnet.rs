//! Well-known development identities.
//!
//! The faucet key is public knowledge; it only exists so local tooling has
//! a funded account to draw from on a fresh devnet.

use crate::{Address, Amount, SigningKey, UNITS_PER_COIN};

pub const FAUCET_SEED: [u8; 32] = [0x51; 32];

/// Genesis balance granted to the faucet on devnet.
pub const FAUCET_BALANCE: Amount = 1_000_000 * UNITS_PER_COIN;

pub fn faucet_key() -> SigningKey {
    SigningKey::from_bytes(&FAUCET_SEED)
}

pub fn faucet_address() -> Address {
    Address::from_public_key(&faucet_key().verifying_key())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faucet_address_is_stable() {
        assert_eq!(faucet_address(), faucet_address());
        assert_ne!(faucet_address(), Address::ZERO);
    }
}

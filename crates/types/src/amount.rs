//! Coin denomination and the serde helpers shared by every amount-carrying type.
//!
//! Amounts are fixed-point integers in the smallest indivisible unit. JSON
//! renders them as decimal strings since they routinely exceed 2^53.

/// Amount in the smallest indivisible unit.
pub type Amount = u128;

/// Number of decimal places carried by one coin.
pub const COIN_DECIMALS: u32 = 18;

/// Conversion factor: 1 coin = 10^18 units.
pub const UNITS_PER_COIN: Amount = 10u128.pow(COIN_DECIMALS);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountParseError {
    #[error("amount is empty")]
    Empty,
    #[error("amount '{0}' is not a decimal number")]
    InvalidDigits(String),
    #[error("amount '{0}' has more than {COIN_DECIMALS} fractional digits")]
    TooPrecise(String),
    #[error("amount '{0}' overflows")]
    Overflow(String),
}

/// Parse a coin-denominated decimal such as `"9.99999998"` into units.
pub fn parse_coins(input: &str) -> Result<Amount, AmountParseError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AmountParseError::Empty);
    }

    let (whole, fraction) = match input.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (input, ""),
    };
    let digits_ok = |part: &str| part.chars().all(|c| c.is_ascii_digit());
    if (whole.is_empty() && fraction.is_empty()) || !digits_ok(whole) || !digits_ok(fraction) {
        return Err(AmountParseError::InvalidDigits(input.to_string()));
    }
    if fraction.len() > COIN_DECIMALS as usize {
        return Err(AmountParseError::TooPrecise(input.to_string()));
    }

    let overflow = || AmountParseError::Overflow(input.to_string());
    let whole_units = if whole.is_empty() {
        0
    } else {
        whole
            .parse::<u128>()
            .map_err(|_| overflow())?
            .checked_mul(UNITS_PER_COIN)
            .ok_or_else(overflow)?
    };
    let fraction_units = if fraction.is_empty() {
        0
    } else {
        let scale = 10u128.pow(COIN_DECIMALS - fraction.len() as u32);
        fraction.parse::<u128>().map_err(|_| overflow())? * scale
    };

    whole_units.checked_add(fraction_units).ok_or_else(overflow)
}

/// Render units as a coin-denominated decimal without trailing zeros.
pub fn format_coins(amount: Amount) -> String {
    let whole = amount / UNITS_PER_COIN;
    let fraction = amount % UNITS_PER_COIN;
    if fraction == 0 {
        return whole.to_string();
    }
    let fraction = format!("{:0width$}", fraction, width = COIN_DECIMALS as usize);
    format!("{}.{}", whole, fraction.trim_end_matches('0'))
}

/// `#[serde(with = "amount_string")]`: decimal string for human readable
/// formats, native `u128` for binary ones.
pub mod amount_string {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Text(String),
        Number(u64),
    }

    pub fn serialize<S>(value: &u128, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.collect_str(value)
        } else {
            serializer.serialize_u128(*value)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u128, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            match Repr::deserialize(deserializer)? {
                Repr::Text(text) => text.trim().parse::<u128>().map_err(D::Error::custom),
                Repr::Number(number) => Ok(number as u128),
            }
        } else {
            u128::deserialize(deserializer)
        }
    }
}

/// `#[serde(with = "hex_array")]`: hex string for human readable formats,
/// raw bytes for binary ones.
pub mod hex_array {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&hex::encode(bytes))
        } else {
            serde_bytes::Bytes::new(bytes).serialize(serializer)
        }
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = if deserializer.is_human_readable() {
            let text = String::deserialize(deserializer)?;
            hex::decode(text.trim_start_matches("0x")).map_err(D::Error::custom)?
        } else {
            serde_bytes::ByteBuf::deserialize(deserializer)?.into_vec()
        };
        raw.try_into()
            .map_err(|v: Vec<u8>| D::Error::invalid_length(v.len(), &"fixed-size byte array"))
    }
}

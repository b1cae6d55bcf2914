use anyhow::{anyhow, Context, Result};
use clap::ValueEnum;
use config::{Config, File as ConfigFile};
use quill_executor::{ChainConfig, DEFAULT_BLOCK_REWARD};
use quill_gas::GasPolicy;
use quill_types::{devnet, format_coins, parse_coins, Address, Amount};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum NetworkProfile {
    Devnet,
    Testnet,
}

#[derive(Clone, Copy, Debug)]
pub struct ProfileDefaults {
    pub name: &'static str,
    pub config_filename: &'static str,
    pub node_id: &'static str,
    pub chain_id: u32,
    pub rpc_host: &'static str,
    pub rpc_port: u16,
    pub data_dir: &'static str,
    pub block_interval_ms: u64,
    pub seal_empty_blocks: bool,
    pub fund_faucet: bool,
    pub log_level: &'static str,
    pub log_format: &'static str,
    pub prometheus_enabled: bool,
}

impl ProfileDefaults {
    fn config_path(&self) -> PathBuf {
        PathBuf::from("config").join(self.config_filename)
    }
}

impl NetworkProfile {
    pub fn defaults(&self) -> ProfileDefaults {
        match self {
            NetworkProfile::Devnet => ProfileDefaults {
                name: "devnet",
                config_filename: "devnet.toml",
                node_id: "quill-devnet-node",
                chain_id: 100,
                rpc_host: "127.0.0.1",
                rpc_port: 8_685,
                data_dir: "./data/devnet",
                block_interval_ms: 1_000,
                seal_empty_blocks: false,
                fund_faucet: true,
                log_level: "debug",
                log_format: "pretty",
                prometheus_enabled: true,
            },
            NetworkProfile::Testnet => ProfileDefaults {
                name: "testnet",
                config_filename: "testnet.toml",
                node_id: "quill-testnet-node",
                chain_id: 1_001,
                rpc_host: "0.0.0.0",
                rpc_port: 28_685,
                data_dir: "./data/testnet",
                block_interval_ms: 5_000,
                seal_empty_blocks: true,
                fund_faucet: false,
                log_level: "info",
                log_format: "json",
                prometheus_enabled: true,
            },
        }
    }
}

impl fmt::Display for NetworkProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.defaults().name)
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub profile: NetworkProfile,
    pub config_path: Option<PathBuf>,
    pub node_id: String,

    // Network
    pub rpc_host: String,
    pub rpc_port: u16,

    // Storage
    pub data_dir: String,
    pub db_path: String,

    // Chain
    pub chain_id: u32,
    pub coinbase: Address,
    pub block_reward: Amount,
    pub block_interval_ms: u64,
    pub max_transactions_per_block: usize,
    pub max_nonce_gap: u64,
    pub seal_empty_blocks: bool,
    pub genesis: Vec<(Address, Amount)>,

    // Gas
    pub gas: GasPolicy,

    // Mempool
    pub mempool_max_size: usize,
    pub mempool_expiration_secs: u64,

    // Observability
    pub prometheus_enabled: bool,
    pub log_level: String,
    pub log_format: String,
}

impl AppConfig {
    pub fn load(profile: NetworkProfile, config_path_override: Option<&str>) -> Result<Self> {
        let defaults = profile.defaults();
        let resolved_path = if let Some(path) = config_path_override {
            let path = PathBuf::from(path);
            if !path.exists() {
                anyhow::bail!(
                    "Configuration file {} not found (specified via --config)",
                    path.display()
                );
            }
            Some(path)
        } else {
            let path = defaults.config_path();
            path.exists().then_some(path)
        };

        let mut builder = Config::builder();
        if let Some(path) = &resolved_path {
            builder = builder.add_source(ConfigFile::from(path.as_path()));
        }
        builder = builder.add_source(config::Environment::with_prefix("QUILL"));
        let config = builder.build()?;

        let data_dir = get_string_value(&config, &["DATA_DIR", "storage.data_dir"])
            .unwrap_or_else(|| defaults.data_dir.to_string());
        let db_path = get_string_value(&config, &["DB_PATH", "storage.db_path"])
            .unwrap_or_else(|| format!("{data_dir}/db"));

        let coinbase = match get_string_value(&config, &["COINBASE", "chain.coinbase"]) {
            Some(raw) => Address::from_str(&raw).with_context(|| format!("invalid coinbase `{raw}`"))?,
            None => Address::ZERO,
        };

        let block_reward = match get_string_value(&config, &["BLOCK_REWARD", "chain.block_reward"]) {
            Some(raw) => parse_coins(&raw).with_context(|| format!("invalid block reward `{raw}`"))?,
            None => DEFAULT_BLOCK_REWARD,
        };

        let mut genesis = match get_string_value(&config, &["GENESIS", "genesis.allocations"]) {
            Some(raw) => parse_allocations(&raw)?,
            None => Vec::new(),
        };
        let fund_faucet = get_bool_value(&config, &["FUND_FAUCET", "genesis.fund_faucet"], defaults.fund_faucet);
        if fund_faucet {
            genesis.push((devnet::faucet_address(), devnet::FAUCET_BALANCE));
        }

        let gas_defaults = GasPolicy::default();
        let gas = GasPolicy {
            base_gas: get_u64(&config, &["BASE_GAS", "gas.base_gas"], gas_defaults.base_gas)?,
            data_gas_per_byte: get_u64(
                &config,
                &["DATA_GAS_PER_BYTE", "gas.data_gas_per_byte"],
                gas_defaults.data_gas_per_byte,
            )?,
            default_gas_price: get_u128(
                &config,
                &["DEFAULT_GAS_PRICE", "gas.default_price"],
                gas_defaults.default_gas_price,
            )?,
            default_gas_limit: get_u64(
                &config,
                &["DEFAULT_GAS_LIMIT", "gas.default_limit"],
                gas_defaults.default_gas_limit,
            )?,
            min_gas_price: get_u128(&config, &["MIN_GAS_PRICE", "gas.min_price"], gas_defaults.min_gas_price)?,
            max_gas_price: get_u128(&config, &["MAX_GAS_PRICE", "gas.max_price"], gas_defaults.max_gas_price)?,
            max_gas_limit: get_u64(&config, &["MAX_GAS_LIMIT", "gas.max_limit"], gas_defaults.max_gas_limit)?,
        };

        let chain_defaults = ChainConfig::default();
        Ok(Self {
            profile,
            config_path: resolved_path,
            node_id: get_string_value(&config, &["NODE_ID", "node.id"])
                .unwrap_or_else(|| defaults.node_id.to_string()),
            rpc_host: get_string_value(&config, &["RPC_HOST", "rpc.host"])
                .unwrap_or_else(|| defaults.rpc_host.to_string()),
            rpc_port: get_u64(&config, &["RPC_PORT", "rpc.port"], defaults.rpc_port as u64)?
                .try_into()
                .map_err(|_| anyhow!("RPC_PORT out of range"))?,
            data_dir,
            db_path,
            chain_id: get_u64(&config, &["CHAIN_ID", "chain.id"], defaults.chain_id as u64)?
                .try_into()
                .map_err(|_| anyhow!("CHAIN_ID out of range"))?,
            coinbase,
            block_reward,
            block_interval_ms: get_u64(
                &config,
                &["BLOCK_INTERVAL_MS", "chain.block_interval_ms"],
                defaults.block_interval_ms,
            )?,
            max_transactions_per_block: get_u64(
                &config,
                &["MAX_TRANSACTIONS_PER_BLOCK", "chain.max_transactions_per_block"],
                chain_defaults.max_transactions_per_block as u64,
            )? as usize,
            max_nonce_gap: get_u64(
                &config,
                &["MAX_NONCE_GAP", "chain.max_nonce_gap"],
                chain_defaults.max_nonce_gap,
            )?,
            seal_empty_blocks: get_bool_value(
                &config,
                &["SEAL_EMPTY_BLOCKS", "chain.seal_empty_blocks"],
                defaults.seal_empty_blocks,
            ),
            genesis,
            gas,
            mempool_max_size: get_u64(&config, &["MEMPOOL_MAX_SIZE", "mempool.max_size"], 100_000)? as usize,
            mempool_expiration_secs: get_u64(
                &config,
                &["MEMPOOL_EXPIRATION_SECS", "mempool.expiration_secs"],
                300,
            )?,
            prometheus_enabled: get_bool_value(
                &config,
                &["PROMETHEUS_ENABLED", "metrics.enabled"],
                defaults.prometheus_enabled,
            ),
            log_level: get_string_value(&config, &["LOG_LEVEL", "log.level"])
                .unwrap_or_else(|| defaults.log_level.to_string()),
            log_format: get_string_value(&config, &["LOG_FORMAT", "log.format"])
                .unwrap_or_else(|| defaults.log_format.to_string()),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            anyhow::bail!("NODE_ID must not be empty");
        }
        if self.data_dir.trim().is_empty() {
            anyhow::bail!("DATA_DIR must not be empty");
        }
        if self.db_path.trim().is_empty() {
            anyhow::bail!("DB_PATH must not be empty");
        }
        if self.rpc_port == 0 {
            anyhow::bail!("RPC_PORT must be greater than zero");
        }
        if self.block_interval_ms == 0 {
            anyhow::bail!("BLOCK_INTERVAL_MS must be greater than zero");
        }
        if self.max_transactions_per_block == 0 {
            anyhow::bail!("MAX_TRANSACTIONS_PER_BLOCK must be greater than zero");
        }
        if self.mempool_max_size == 0 {
            anyhow::bail!("MEMPOOL_MAX_SIZE must be greater than zero");
        }
        if !matches!(self.log_format.as_str(), "pretty" | "json") {
            anyhow::bail!("LOG_FORMAT must be 'pretty' or 'json'");
        }
        self.gas
            .validate()
            .map_err(|err| anyhow!("invalid gas configuration: {err}"))?;
        Ok(())
    }

    pub fn chain_config(&self) -> ChainConfig {
        ChainConfig {
            chain_id: self.chain_id,
            coinbase: self.coinbase,
            block_reward: self.block_reward,
            block_interval: Duration::from_millis(self.block_interval_ms),
            max_transactions_per_block: self.max_transactions_per_block,
            max_nonce_gap: self.max_nonce_gap,
            seal_empty_blocks: self.seal_empty_blocks,
            gas: self.gas.clone(),
        }
    }

    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc_host, self.rpc_port)
    }

    pub fn genesis_summary(&self) -> String {
        self.genesis
            .iter()
            .map(|(address, amount)| format!("{address}={}", format_coins(*amount)))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parse `address=coins` entries separated by commas.
pub fn parse_allocations(raw: &str) -> Result<Vec<(Address, Amount)>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (address, amount) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("genesis entry `{entry}` must be address=amount"))?;
            let address = Address::from_str(address.trim())
                .with_context(|| format!("invalid genesis address in `{entry}`"))?;
            let amount = parse_coins(amount.trim())
                .with_context(|| format!("invalid genesis amount in `{entry}`"))?;
            Ok((address, amount))
        })
        .collect()
}

fn get_string_value(config: &Config, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        config
            .get_string(key)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

fn get_bool_value(config: &Config, keys: &[&str], default: bool) -> bool {
    for key in keys {
        if let Ok(value) = config.get_bool(key) {
            return value;
        }
        if let Ok(raw) = config.get_string(key) {
            if let Ok(parsed) = raw.parse::<bool>() {
                return parsed;
            }
        }
    }
    default
}

fn get_u64(config: &Config, keys: &[&str], default: u64) -> Result<u64> {
    match get_string_value(config, keys) {
        Some(raw) => raw
            .replace('_', "")
            .parse()
            .with_context(|| format!("{} must be an unsigned integer, got `{raw}`", keys[0])),
        None => Ok(default),
    }
}

fn get_u128(config: &Config, keys: &[&str], default: u128) -> Result<u128> {
    match get_string_value(config, keys) {
        Some(raw) => raw
            .replace('_', "")
            .parse()
            .with_context(|| format!("{} must be an unsigned integer, got `{raw}`", keys[0])),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_config(name: &str) -> PathBuf {
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("config")
            .join(name)
    }

    #[test]
    fn devnet_profile_loads_fixture() {
        let path = fixture_config("devnet.toml");
        let config = AppConfig::load(NetworkProfile::Devnet, Some(path.to_str().unwrap())).unwrap();

        assert_eq!(config.profile, NetworkProfile::Devnet);
        assert_eq!(config.chain_id, 100);
        assert_eq!(config.rpc_port, 8_685);
        assert_eq!(config.block_reward, DEFAULT_BLOCK_REWARD);
        assert!(config
            .genesis
            .iter()
            .any(|(address, _)| *address == devnet::faucet_address()));
        config.validate().unwrap();
    }

    #[test]
    fn testnet_profile_uses_its_chain_id() {
        let path = fixture_config("testnet.toml");
        let config = AppConfig::load(NetworkProfile::Testnet, Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.chain_id, 1_001);
        assert!(config.seal_empty_blocks);
        assert!(config.genesis.is_empty());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = AppConfig::load(NetworkProfile::Devnet, Some("/nonexistent/quill.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn allocations_parse_coin_amounts() {
        let a = Address([1u8; 32]);
        let b = Address([2u8; 32]);
        let parsed = parse_allocations(&format!("{a}=10, {b}=0.5")).unwrap();
        assert_eq!(parsed, vec![(a, 10 * quill_types::UNITS_PER_COIN), (b, quill_types::UNITS_PER_COIN / 2)]);
        assert!(parse_allocations("q00=1").is_err());
        assert!(parse_allocations(&format!("{a}")).is_err());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let path = fixture_config("devnet.toml");
        let mut config = AppConfig::load(NetworkProfile::Devnet, Some(path.to_str().unwrap())).unwrap();
        config.rpc_port = 0;
        assert!(config.validate().unwrap_err().to_string().contains("RPC_PORT"));

        config.rpc_port = 8_685;
        config.log_format = "xml".into();
        assert!(config.validate().is_err());

        config.log_format = "json".into();
        config.gas.min_gas_price = 0;
        assert!(config.validate().unwrap_err().to_string().contains("gas"));
    }

    #[test]
    fn chain_config_carries_overrides() {
        let path = fixture_config("devnet.toml");
        let mut config = AppConfig::load(NetworkProfile::Devnet, Some(path.to_str().unwrap())).unwrap();
        config.block_interval_ms = 250;
        config.max_nonce_gap = 7;
        let chain = config.chain_config();
        assert_eq!(chain.block_interval, Duration::from_millis(250));
        assert_eq!(chain.max_nonce_gap, 7);
        assert_eq!(chain.coinbase, config.coinbase);
    }
}

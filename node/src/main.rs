use anyhow::{anyhow, Context, Result};
use clap::{value_parser, Arg, ArgAction, Command};
use fs2::FileExt;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use quill_executor::{BlockProducer, TxEngine};
use quill_mempool::Mempool;
use quill_rpc::{start_server, AppState};
use quill_storage::{SledStorage, Storage};
use quill_types::format_coins;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::net::{IpAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod settings;
mod version;

use settings::{AppConfig, NetworkProfile};
use version::{git_commit_hash, QUILL_VERSION};

fn load_config_with_overrides(matches: &clap::ArgMatches) -> Result<AppConfig> {
    // Check environment variable first, then fall back to CLI arg
    let profile = match std::env::var("QUILL_NETWORK") {
        Ok(env_network) => match env_network.to_lowercase().as_str() {
            "devnet" => NetworkProfile::Devnet,
            "testnet" => NetworkProfile::Testnet,
            _ => *matches
                .get_one::<NetworkProfile>("network")
                .unwrap_or(&NetworkProfile::Devnet),
        },
        Err(_) => *matches
            .get_one::<NetworkProfile>("network")
            .unwrap_or(&NetworkProfile::Devnet),
    };
    let config_path = matches
        .get_one::<String>("config")
        .map(|value| value.as_str());
    let mut config = AppConfig::load(profile, config_path)?;
    apply_overrides(matches, &mut config);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(matches: &clap::ArgMatches, config: &mut AppConfig) {
    if let Some(data_dir) = matches.get_one::<String>("data-dir") {
        config.data_dir = data_dir.clone();
        config.db_path = format!("{data_dir}/db");
    }

    if let Some(log_level) = matches.get_one::<String>("log-level") {
        config.log_level = log_level.clone();
    }

    if let Some(log_format) = matches.get_one::<String>("log-format") {
        config.log_format = log_format.clone();
    }

    if let Some(rpc_host) = matches.get_one::<String>("rpc-host") {
        config.rpc_host = rpc_host.clone();
    }

    if let Some(rpc_port) = matches.get_one::<u16>("rpc-port") {
        config.rpc_port = *rpc_port;
    }

    if let Some(interval) = matches.get_one::<u64>("block-interval-ms") {
        config.block_interval_ms = *interval;
    }

    if matches.get_flag("seal-empty-blocks") {
        config.seal_empty_blocks = true;
    }

    if matches.get_flag("disable-metrics") {
        config.prometheus_enabled = false;
    }
}

async fn check_status(config: &AppConfig, health_path: &str) -> Result<()> {
    let mut path = health_path.to_string();
    if !path.starts_with('/') {
        path = format!("/{path}");
    }
    let url = format!("http://{}:{}{}", config.rpc_host, config.rpc_port, path);
    let response = reqwest::Client::new().get(&url).send().await?;
    let status = response.status();
    let body = response.text().await?;
    println!("GET {url} -> {status}");
    println!("{body}");
    if status.is_success() {
        Ok(())
    } else {
        anyhow::bail!("Health check failed with status {status}")
    }
}

fn build_cli() -> Command {
    Command::new("quill-node")
        .version(QUILL_VERSION)
        .about("Quill transaction engine node")
        .disable_version_flag(true)
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .global(true),
        )
        .arg(
            Arg::new("data-dir")
                .short('d')
                .long("data-dir")
                .value_name("DIR")
                .help("Data directory")
                .global(true),
        )
        .arg(
            Arg::new("version_flag")
                .short('V')
                .long("version")
                .action(ArgAction::SetTrue)
                .help("Print detailed version information and exit")
                .global(true),
        )
        .arg(
            Arg::new("check")
                .long("check")
                .action(ArgAction::SetTrue)
                .help("Run configuration and environment self-checks, then exit")
                .global(true),
        )
        .arg(
            Arg::new("network")
                .long("network")
                .value_name("PROFILE")
                .value_parser(value_parser!(NetworkProfile))
                .default_value("devnet")
                .help("Select network profile (devnet, testnet). Can also be set via QUILL_NETWORK")
                .global(true),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .help("Override the log level")
                .global(true),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["pretty", "json"])
                .help("Select log output format")
                .global(true),
        )
        .arg(
            Arg::new("rpc-host")
                .long("rpc-host")
                .value_name("HOST")
                .help("Override RPC bind host (defaults to config value)")
                .global(true),
        )
        .arg(
            Arg::new("rpc-port")
                .long("rpc-port")
                .value_name("PORT")
                .value_parser(value_parser!(u16))
                .help("Override RPC port")
                .global(true),
        )
        .arg(
            Arg::new("block-interval-ms")
                .long("block-interval-ms")
                .value_name("MILLIS")
                .value_parser(value_parser!(u64))
                .help("Override the block production interval")
                .global(true),
        )
        .arg(
            Arg::new("seal-empty-blocks")
                .long("seal-empty-blocks")
                .action(ArgAction::SetTrue)
                .help("Seal blocks even when no transaction is ready")
                .global(true),
        )
        .arg(
            Arg::new("disable-metrics")
                .long("disable-metrics")
                .action(ArgAction::SetTrue)
                .help("Disable the Prometheus metrics endpoint")
                .global(true),
        )
        .subcommand(Command::new("start").about("Start the node using the provided configuration"))
        .subcommand(
            Command::new("status")
                .about("Check the /health endpoint for a running node")
                .arg(
                    Arg::new("health-path")
                        .long("health-path")
                        .value_name("PATH")
                        .default_value("/health")
                        .help("Health endpoint path to query"),
                ),
        )
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();

    if let Some(status_matches) = matches.subcommand_matches("status") {
        let config = load_config_with_overrides(status_matches)?;
        let health_path = status_matches
            .get_one::<String>("health-path")
            .map(|value| value.as_str())
            .unwrap_or("/health");
        check_status(&config, health_path).await?;
        return Ok(());
    }

    let start_matches = matches.subcommand_matches("start").unwrap_or(&matches);
    let config = load_config_with_overrides(start_matches)?;

    if start_matches.get_flag("version_flag") {
        print_version_info(&config);
        return Ok(());
    }

    fs::create_dir_all(&config.data_dir)?;
    if let Some(parent) = Path::new(&config.db_path).parent() {
        fs::create_dir_all(parent)?;
    }

    if start_matches.get_flag("check") {
        run_self_check(&config)?;
        return Ok(());
    }

    init_logging(&config)?;
    let prometheus_handle = init_metrics(&config);

    info!("Starting quill node: {}", config.node_id);
    info!("Network profile: {}", config.profile);
    info!("Chain ID: {}", config.chain_id);
    info!("Coinbase: {}", config.coinbase);
    info!("Block reward: {} coin", format_coins(config.block_reward));
    if let Some(path) = &config.config_path {
        info!("Config file: {}", path.display());
    } else {
        info!("Config file: (built-in defaults)");
    }
    info!("Data directory: {}", config.data_dir);

    if let Ok(ip) = config.rpc_host.parse::<IpAddr>() {
        if ip.is_unspecified() && config.profile == NetworkProfile::Devnet {
            warn!(
                "RPC host {} binds to all interfaces on devnet; the faucet key is public",
                config.rpc_host
            );
        }
    }

    let _data_dir_lock = DataDirLock::acquire(&config.data_dir, "node-runtime")?;

    let storage = Arc::new(SledStorage::new(&config.db_path)?);
    info!("Storage initialized at {}", config.db_path);

    let mempool = Arc::new(Mempool::new_with_expiration(
        config.mempool_max_size,
        Duration::from_secs(config.mempool_expiration_secs),
    ));
    let engine = Arc::new(
        TxEngine::new(config.chain_config(), storage.clone(), mempool)
            .context("failed to build transaction engine")?,
    );

    if engine.initialize_genesis(&config.genesis)? {
        info!(
            accounts = config.genesis.len(),
            allocations = %config.genesis_summary(),
            "Genesis block sealed"
        );
    } else {
        info!("Existing chain found; genesis skipped");
    }
    if let Some(latest) = engine.latest_block()? {
        info!("Chain tip at height {}", latest.height);
    }

    let shutdown = CancellationToken::new();
    let producer = BlockProducer::new(Arc::clone(&engine)).spawn(shutdown.clone());
    info!(
        "Block producer started (interval {} ms, seal empty blocks: {})",
        config.block_interval_ms, config.seal_empty_blocks
    );

    let mut state = AppState::new(Arc::clone(&engine), config.node_id.clone());
    if let Some(handle) = prometheus_handle {
        state = state.with_metrics(handle);
    }
    let rpc_addr = config.rpc_addr();
    let server = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = start_server(state, &rpc_addr, shutdown).await {
                error!("RPC server failed: {}", err);
            }
        })
    };
    info!("RPC server listening on {}", config.rpc_addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down quill node");
    shutdown.cancel();

    if let Err(err) = producer.await {
        warn!("Block producer task ended abnormally: {}", err);
    }
    if let Err(err) = server.await {
        warn!("RPC server task ended abnormally: {}", err);
    }
    storage.flush()?;
    info!("Quill node stopped");

    Ok(())
}

fn init_metrics(config: &AppConfig) -> Option<PrometheusHandle> {
    if !config.prometheus_enabled {
        info!("Prometheus metrics exporter disabled via configuration");
        return None;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            info!("Prometheus metrics exporter registered");
            describe_gauge!("quill_block_height", "Height of the latest sealed block");
            describe_gauge!(
                "quill_mempool_size",
                "Current number of transactions pending in the mempool"
            );
            describe_counter!(
                "quill_transactions_applied_total",
                "Transactions applied to the ledger, labelled by receipt status"
            );
            describe_counter!(
                "quill_submissions_rejected_total",
                "Submissions rejected before entering the mempool, labelled by reason"
            );
            Some(handle)
        }
        Err(err) => {
            warn!("Failed to install Prometheus metrics exporter: {}", err);
            None
        }
    }
}

fn init_logging(config: &AppConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    Ok(())
}

fn print_version_info(config: &AppConfig) {
    println!(
        "quill {} (commit {}) [{} / chain {}]",
        QUILL_VERSION,
        git_commit_hash(),
        config.profile,
        config.chain_id
    );
}

fn run_self_check(config: &AppConfig) -> Result<()> {
    println!("Running quill node self-check...");
    let mut issues = Vec::new();

    if let Err(err) = ensure_port_available(&config.rpc_host, config.rpc_port, "RPC") {
        issues.push(err);
    }

    if let Err(err) = ensure_storage_directory(&config.data_dir) {
        issues.push(err);
    }

    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.exists() {
            issues.push(format!(
                "Database directory {} does not exist",
                parent.display()
            ));
        }
    } else {
        issues.push(format!("DB_PATH '{}' is invalid", config.db_path));
    }

    if config.coinbase == quill_types::Address::ZERO {
        println!("note: COINBASE is unset; fees and rewards accrue to the zero address");
    }

    if issues.is_empty() {
        println!("OK");
        Ok(())
    } else {
        for issue in &issues {
            eprintln!("- {issue}");
        }
        anyhow::bail!("self-check failed")
    }
}

fn ensure_port_available(host: &str, port: u16, label: &str) -> Result<(), String> {
    let addr = format!("{host}:{port}");
    match TcpListener::bind(&addr) {
        Ok(listener) => drop(listener),
        Err(err) => {
            return Err(format!(
                "{label} port {addr} is not available for binding: {err}"
            ))
        }
    }
    Ok(())
}

fn ensure_storage_directory(path: &str) -> Result<(), String> {
    let dir = Path::new(path);
    if !dir.exists() {
        return Err(format!(
            "Storage directory {} does not exist; create it before starting the node",
            dir.display()
        ));
    }
    if !dir.is_dir() {
        return Err(format!("Storage path {} is not a directory", dir.display()));
    }

    let marker = dir.join(".quill_write_test");
    match OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&marker)
    {
        Ok(mut file) => {
            if let Err(err) = file.write_all(b"ok") {
                return Err(format!("Unable to write into {}: {}", dir.display(), err));
            }
        }
        Err(err) => {
            return Err(format!(
                "Unable to open {} for writing: {}",
                dir.display(),
                err
            ));
        }
    }
    let _ = fs::remove_file(&marker);
    Ok(())
}

/// Exclusive lock on the data directory for the lifetime of the process.
struct DataDirLock {
    path: PathBuf,
    file: File,
}

impl DataDirLock {
    fn acquire<P: AsRef<Path>>(data_dir: P, purpose: &str) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;
        let lock_path = dir.join(".quill.lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&lock_path)?;

        if let Err(err) = file.try_lock_exclusive() {
            return Err(anyhow!(
                "Data directory {} is locked by another process ({}). \
                 Stop the running node or remove {} if you are sure it is stale.",
                dir.display(),
                err,
                lock_path.display()
            ));
        }

        file.set_len(0)?;
        writeln!(
            &file,
            "pid={};purpose={};started={}",
            std::process::id(),
            purpose,
            chrono::Utc::now().to_rfc3339()
        )?;

        Ok(Self {
            path: lock_path,
            file,
        })
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_apply_to_config() {
        let matches = build_cli()
            .try_get_matches_from([
                "quill-node",
                "start",
                "--data-dir",
                "/tmp/quill-cli-test",
                "--rpc-port",
                "9999",
                "--block-interval-ms",
                "100",
                "--seal-empty-blocks",
                "--disable-metrics",
            ])
            .unwrap();
        let start = matches.subcommand_matches("start").unwrap();

        let mut config = AppConfig::load(NetworkProfile::Testnet, None).unwrap();
        apply_overrides(start, &mut config);

        assert_eq!(config.data_dir, "/tmp/quill-cli-test");
        assert_eq!(config.db_path, "/tmp/quill-cli-test/db");
        assert_eq!(config.rpc_port, 9_999);
        assert_eq!(config.block_interval_ms, 100);
        assert!(config.seal_empty_blocks);
        assert!(!config.prometheus_enabled);
    }

    #[test]
    fn data_dir_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let first = DataDirLock::acquire(dir.path(), "test").unwrap();
        let err = DataDirLock::acquire(dir.path(), "test")
            .err()
            .expect("second lock must fail");
        assert!(err.to_string().contains("locked"));
        let record = fs::read_to_string(dir.path().join(".quill.lock")).unwrap();
        assert!(record.starts_with(&format!("pid={};purpose=test", std::process::id())));
        drop(first);
        assert!(DataDirLock::acquire(dir.path(), "test").is_ok());
    }

    #[test]
    fn storage_directory_check_requires_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_storage_directory(dir.path().to_str().unwrap()).is_ok());
        let missing = dir.path().join("missing");
        assert!(ensure_storage_directory(missing.to_str().unwrap()).is_err());
    }
}

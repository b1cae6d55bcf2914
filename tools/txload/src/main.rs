use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use quill_sdk::{PollOutcome, Poller, QuillClient, SdkError};
use quill_types::{devnet, format_coins, parse_coins, Address, Amount, SigningKey, Transaction, TxStatus};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// RPC base URL (e.g. http://127.0.0.1:8685)
    #[arg(long, global = true, default_value = "http://127.0.0.1:8685")]
    rpc: String,

    /// Chain id to sign for
    #[arg(long, global = true, default_value_t = 100)]
    chain_id: u32,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Send one transfer and follow it to a receipt and its events.
    Transfer(TransferArgs),
    /// Single-sender load: rate-limited signed submissions with metrics.
    Run(RunArgs),
    /// Generate a JSON file with N random senders (signing keys + derived addresses).
    GenSenders(GenSendersArgs),
}

#[derive(Debug, Parser, Clone)]
struct KeyArgs {
    /// Signing key as hex (32 bytes / 64 hex chars). Defaults to the devnet faucet.
    #[arg(long)]
    signing_key_hex: Option<String>,

    /// Path to signing key file containing hex.
    #[arg(long)]
    signing_key_file: Option<PathBuf>,
}

#[derive(Debug, Parser)]
struct TransferArgs {
    #[command(flatten)]
    key: KeyArgs,

    /// Recipient address. If omitted, a random address is generated.
    #[arg(long)]
    to: Option<String>,

    /// Amount in coins (decimal, up to 18 places)
    #[arg(long, default_value = "0.01")]
    amount: String,

    /// Gas price in units; 0 selects the network default
    #[arg(long, default_value_t = 0)]
    gas_price: u128,

    /// Gas limit; 0 selects the network default
    #[arg(long, default_value_t = 0)]
    gas_limit: u64,

    /// Seconds between confirmation polls
    #[arg(long, default_value_t = 2)]
    poll_interval_secs: u64,

    /// Maximum confirmation polls before giving up
    #[arg(long, default_value_t = 20)]
    poll_attempts: u32,
}

#[derive(Debug, Parser, Clone)]
struct RunArgs {
    #[command(flatten)]
    key: KeyArgs,

    /// Target transactions per second
    #[arg(long)]
    tps: u32,

    /// Run duration (seconds)
    #[arg(long)]
    seconds: u64,

    /// Concurrent worker tasks submitting requests
    #[arg(long, default_value_t = 16)]
    concurrency: usize,

    /// Amount per transfer in units
    #[arg(long, default_value_t = 1_000u128)]
    amount: u128,

    /// Optional destination address. If omitted, a random address is generated.
    #[arg(long)]
    to: Option<String>,

    /// Starting nonce. If omitted, query the account and start at nonce+1.
    #[arg(long)]
    nonce_start: Option<u64>,

    /// Max in-flight queue depth (producer will drop if full).
    #[arg(long, default_value_t = 10_000)]
    max_queue: usize,

    /// After the run, poll the receipt of the last accepted transaction.
    #[arg(long)]
    confirm_last: bool,
}

#[derive(Debug, Parser)]
struct GenSendersArgs {
    /// Number of senders to generate
    #[arg(long)]
    count: usize,
    /// Output JSON path
    #[arg(long, default_value = "out/senders/senders.json")]
    out: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct Sender {
    signing_key_hex: String,
    address: String,
    #[serde(default)]
    nonce_start: u64,
}

fn decode_signing_key_hex(raw: &str) -> Result<SigningKey> {
    let normalized = raw.trim().trim_start_matches("0x");
    let bytes = hex::decode(normalized).context("decode signing key hex")?;
    let key_bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow!("signing key must be 32 bytes (64 hex chars)"))?;
    Ok(SigningKey::from_bytes(&key_bytes))
}

fn signing_key_from_args(args: &KeyArgs) -> Result<SigningKey> {
    if let Some(raw) = &args.signing_key_hex {
        return decode_signing_key_hex(raw);
    }
    if let Some(path) = &args.signing_key_file {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read signing key file {}", path.display()))?;
        return decode_signing_key_hex(&raw);
    }
    warn!("no signing key given; using the devnet faucet key");
    Ok(devnet::faucet_key())
}

fn recipient_from_arg(to: Option<&str>) -> Result<Address> {
    match to {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid recipient address `{raw}`")),
        None => {
            let key = SigningKey::generate(&mut OsRng);
            Ok(Address::from_public_key(&key.verifying_key()))
        }
    }
}

fn signed_transfer(
    key: &SigningKey,
    chain_id: u32,
    to: Address,
    value: Amount,
    nonce: u64,
    gas_price: Amount,
    gas_limit: u64,
) -> Result<Transaction> {
    let from = Address::from_public_key(&key.verifying_key());
    let mut tx = Transaction::new(chain_id, from, to, value, nonce, gas_price, gas_limit);
    tx.sign(key)?;
    Ok(tx)
}

#[derive(Default)]
struct Metrics {
    submitted: AtomicUsize,
    accepted: AtomicUsize,
    rejected: AtomicUsize,
    server_errors: AtomicUsize,
    client_errors: AtomicUsize,
    dropped_queue_full: AtomicUsize,
}

impl Metrics {
    fn record(&self, result: &Result<String, SdkError>) {
        let counter = match result {
            Ok(_) => &self.accepted,
            Err(SdkError::ServerError { status, .. }) if *status >= 500 => &self.server_errors,
            Err(SdkError::ServerError { .. }) => &self.rejected,
            Err(_) => &self.client_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Transfer(args) => transfer(&cli.rpc, cli.chain_id, args).await,
        Command::Run(args) => run(&cli.rpc, cli.chain_id, args).await,
        Command::GenSenders(args) => gen_senders(args),
    }
}

fn gen_senders(args: GenSendersArgs) -> Result<()> {
    let mut rng = OsRng;
    let mut out = Vec::with_capacity(args.count);
    for _ in 0..args.count {
        let sk = SigningKey::generate(&mut rng);
        out.push(Sender {
            signing_key_hex: hex::encode(sk.to_bytes()),
            address: Address::from_public_key(&sk.verifying_key()).to_string(),
            nonce_start: 1,
        });
    }
    if let Some(parent) = args.out.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(&args.out, serde_json::to_vec_pretty(&out)?)
        .with_context(|| format!("write {}", args.out.display()))?;
    println!("Wrote {} senders to {}", out.len(), args.out.display());
    Ok(())
}

async fn transfer(rpc: &str, chain_id: u32, args: TransferArgs) -> Result<()> {
    let client = QuillClient::new(rpc)?;
    let key = signing_key_from_args(&args.key)?;
    let from = Address::from_public_key(&key.verifying_key());
    let to = recipient_from_arg(args.to.as_deref())?;
    let value = parse_coins(&args.amount).with_context(|| format!("invalid amount `{}`", args.amount))?;

    let account = client.get_account_state(&from).await?;
    println!("From: {} (balance {} coin, nonce {})", from, format_coins(account.balance), account.nonce);
    println!("To: {}", to);

    let tx = signed_transfer(
        &key,
        chain_id,
        to,
        value,
        account.nonce + 1,
        args.gas_price,
        args.gas_limit,
    )?;
    let hash = client.send_raw_transaction(&tx).await?;
    println!("Submitted: {hash}");

    let poller = Poller::new(Duration::from_secs(args.poll_interval_secs), args.poll_attempts);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let receipt = match poller.wait_for_receipt(&client, &hash, &cancel).await? {
        PollOutcome::Confirmed(receipt) => receipt,
        PollOutcome::TimedOut { attempts } => {
            println!("No receipt after {attempts} attempts; the outcome is unknown");
            return Ok(());
        }
        PollOutcome::Cancelled => {
            println!("Cancelled while waiting for the receipt");
            return Ok(());
        }
    };
    println!(
        "Receipt: status={:?} block={:?} gas_used={} gas_price={}",
        receipt.status, receipt.block_height, receipt.gas_used, receipt.gas_price
    );

    if let PollOutcome::Confirmed(events) = poller.wait_for_events(&client, &hash, &cancel).await? {
        for event in &events.events {
            debug!(topic = %event.topic, data = %event.data, "event");
        }
        match (&events.event_error, receipt.status) {
            (Some(err), _) => println!("Execution failed: {err}"),
            (None, TxStatus::Success) => println!("Execution succeeded ({} events)", events.events.len()),
            (None, status) => println!("Execution finished with status {status:?}"),
        }
    }

    let after = client.get_account_state(&from).await?;
    println!("Sender balance now {} coin", format_coins(after.balance));
    Ok(())
}

async fn run(rpc: &str, chain_id: u32, args: RunArgs) -> Result<()> {
    if args.tps == 0 {
        return Err(anyhow!("--tps must be > 0"));
    }
    if args.seconds == 0 {
        return Err(anyhow!("--seconds must be > 0"));
    }
    let client = QuillClient::new(rpc)?;
    let key = Arc::new(signing_key_from_args(&args.key)?);
    let from = Address::from_public_key(&key.verifying_key());
    let to = recipient_from_arg(args.to.as_deref())?;

    let nonce_start = match args.nonce_start {
        Some(n) => n,
        None => match client.get_account_state(&from).await {
            Ok(account) => account.nonce + 1,
            Err(err) => {
                warn!("could not resolve nonce for {from}: {err}; starting at 1");
                1
            }
        },
    };
    let nonce = Arc::new(AtomicU64::new(nonce_start));
    let metrics = Arc::new(Metrics::default());
    let last_accepted = Arc::new(parking_lot::Mutex::new(None::<String>));

    let (tx, rx) = tokio::sync::mpsc::channel::<u64>(args.max_queue.max(1));
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    // Producer: tick at target TPS, enqueue nonces.
    let producer_metrics = Arc::clone(&metrics);
    let producer_nonce = Arc::clone(&nonce);
    let ticks_every = Duration::from_nanos(1_000_000_000u64 / u64::from(args.tps).max(1));
    let duration = Duration::from_secs(args.seconds);
    let start = Instant::now();
    let producer = tokio::spawn(async move {
        let mut interval = tokio::time::interval(ticks_every);
        while start.elapsed() < duration {
            interval.tick().await;
            let n = producer_nonce.fetch_add(1, Ordering::Relaxed);
            producer_metrics.submitted.fetch_add(1, Ordering::Relaxed);
            if tx.try_send(n).is_err() {
                producer_metrics.dropped_queue_full.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    let mut workers = Vec::with_capacity(args.concurrency.max(1));
    for _ in 0..args.concurrency.max(1) {
        let client = client.clone();
        let key = Arc::clone(&key);
        let metrics = Arc::clone(&metrics);
        let last_accepted = Arc::clone(&last_accepted);
        let rx = Arc::clone(&rx);
        let amount = args.amount;
        workers.push(tokio::spawn(async move {
            loop {
                let nonce = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(nonce) = nonce else { break };
                let result = match signed_transfer(&key, chain_id, to, amount, nonce, 0, 0) {
                    Ok(tx) => client.send_raw_transaction(&tx).await,
                    Err(err) => {
                        warn!("failed to sign nonce {nonce}: {err}");
                        continue;
                    }
                };
                metrics.record(&result);
                match result {
                    Ok(hash) => *last_accepted.lock() = Some(hash),
                    Err(err) => debug!(nonce, error = %err, "submission failed"),
                }
            }
        }));
    }

    let _ = producer.await;
    // Give workers a short drain window.
    tokio::time::sleep(Duration::from_millis(250)).await;
    for w in workers {
        w.abort();
    }

    let elapsed = start.elapsed().as_secs_f64().max(0.001);
    let accepted = metrics.accepted.load(Ordering::Relaxed);
    let accepted_tps = accepted as f64 / elapsed;
    let submitted = metrics.submitted.load(Ordering::Relaxed);
    let rejected = metrics.rejected.load(Ordering::Relaxed);
    let server_errors = metrics.server_errors.load(Ordering::Relaxed);
    let client_errors = metrics.client_errors.load(Ordering::Relaxed);
    let dropped = metrics.dropped_queue_full.load(Ordering::Relaxed);

    println!("RPC: {}", rpc);
    println!("From: {}", from);
    println!("To: {}", to);
    println!("nonce_start: {}", nonce_start);
    println!("target_tps: {}", args.tps);
    println!("duration_s: {}", args.seconds);
    println!("concurrency: {}", args.concurrency);
    println!("submitted: {}", submitted);
    println!("accepted: {}", accepted);
    println!("rejected: {}", rejected);
    println!("server_errors: {}", server_errors);
    println!("client_errors: {}", client_errors);
    println!("dropped_queue_full: {}", dropped);
    println!("accepted_tps: {:.2}", accepted_tps);
    // One-line summary for scripts/tee parsing.
    println!(
        "SUMMARY accepted_tps={:.2} rejected={} server_errors={} client_errors={} dropped_queue_full={}",
        accepted_tps, rejected, server_errors, client_errors, dropped
    );

    let last = last_accepted.lock().clone();
    if let (true, Some(hash)) = (args.confirm_last, last) {
        info!("waiting for receipt of {hash}");
        let outcome = Poller::default()
            .wait_for_receipt(&client, &hash, &CancellationToken::new())
            .await?;
        match outcome {
            PollOutcome::Confirmed(receipt) => println!(
                "last_receipt: status={:?} block={:?}",
                receipt.status, receipt.block_height
            ),
            PollOutcome::TimedOut { attempts } => println!("last_receipt: unknown after {attempts} attempts"),
            PollOutcome::Cancelled => println!("last_receipt: cancelled"),
        }
    }

    Ok(())
}

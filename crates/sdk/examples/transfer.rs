use quill_sdk::{PollOutcome, Poller, QuillClient};
use quill_types::{parse_coins, Address, SigningKey, Transaction};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let api = std::env::var("QUILL_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8685/".to_string());
    let secret = std::env::var("QUILL_SIGNING_KEY")
        .map_err(|_| "set QUILL_SIGNING_KEY (hex-encoded 32-byte secret) before running the example")?;
    let chain_id: u32 = std::env::var("QUILL_CHAIN_ID")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(100);

    let mut seed = [0u8; 32];
    hex::decode_to_slice(secret.trim(), &mut seed)?;
    let key = SigningKey::from_bytes(&seed);
    let from = Address::from_public_key(&key.verifying_key());
    let to: Address = match std::env::var("QUILL_TO_ADDRESS") {
        Ok(to) => to.parse()?,
        Err(_) => from,
    };

    let client = QuillClient::new(api)?;
    let account = client.get_account_state(&from).await?;
    println!("balance of {from}: {} (nonce {})", account.balance, account.nonce);

    let mut tx = Transaction::new(chain_id, from, to, parse_coins("0.01")?, account.nonce + 1, 0, 0);
    tx.sign(&key)?;
    let hash = client.send_raw_transaction(&tx).await?;
    println!("submitted {hash}");

    match Poller::default()
        .wait_for_receipt(&client, &hash, &CancellationToken::new())
        .await?
    {
        PollOutcome::Confirmed(receipt) => println!("confirmed: {receipt:?}"),
        PollOutcome::TimedOut { attempts } => println!("no receipt after {attempts} attempts"),
        PollOutcome::Cancelled => println!("cancelled"),
    }
    Ok(())
}

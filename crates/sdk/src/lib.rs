mod error;
pub mod poller;

pub use crate::error::SdkError;
pub use crate::poller::{PollOutcome, Poller};
use quill_types::amount::amount_string;
use quill_types::{Address, Amount, BlockHeader, Event, Receipt, Transaction};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Convenience HTTP client for a quill node's RPC interface.
#[derive(Clone)]
pub struct QuillClient {
    base_url: Url,
    http: Client,
}

impl QuillClient {
    /// Create a new client with the provided base URL (e.g. `http://127.0.0.1:8685/`).
    pub fn new(base_url: impl AsRef<str>) -> Result<Self, SdkError> {
        Self::with_http_client(
            base_url,
            Client::builder().timeout(Duration::from_secs(10)).build()?,
        )
    }

    /// Use an existing reqwest client (useful for custom TLS or timeouts).
    pub fn with_http_client(base_url: impl AsRef<str>, http: Client) -> Result<Self, SdkError> {
        let mut url = Url::parse(base_url.as_ref())
            .map_err(|_| SdkError::InvalidBaseUrl(base_url.as_ref().to_string()))?;
        if !url.path().ends_with('/') {
            let mut path = url.path().trim_end_matches('/').to_owned();
            path.push('/');
            url.set_path(&path);
        }
        Ok(Self {
            base_url: url,
            http,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn health(&self) -> Result<NodeHealth, SdkError> {
        self.get_json("health").await
    }

    /// Balance and nonce; unknown addresses report zero.
    pub async fn get_account_state(&self, address: &Address) -> Result<AccountInfo, SdkError> {
        let view: AccountView = self.get_json(&format!("account/{address}")).await?;
        let address = view
            .address
            .parse()
            .map_err(|err| SdkError::parse_error(format!("invalid address in response: {err}")))?;
        Ok(AccountInfo {
            address,
            balance: view.balance,
            nonce: view.nonce,
        })
    }

    /// Submit a signed transaction in its base64 wire encoding.
    pub async fn send_raw_transaction(&self, tx: &Transaction) -> Result<String, SdkError> {
        self.send_raw_encoded(&tx.to_base64()?).await
    }

    pub async fn send_raw_encoded(&self, data: &str) -> Result<String, SdkError> {
        let body = RawTransactionBody {
            data: data.to_string(),
        };
        let response: TxHashView = self.post_json("tx/raw", &body).await?;
        Ok(response.txhash)
    }

    /// Submit a signed transaction as JSON.
    pub async fn send_transaction(&self, tx: &Transaction) -> Result<String, SdkError> {
        let response: TxHashView = self.post_json("tx", tx).await?;
        Ok(response.txhash)
    }

    pub async fn get_transaction(&self, hash: &str) -> Result<Transaction, SdkError> {
        self.get_json(&format!("tx/{hash}")).await
    }

    /// Receipt for `hash`; status 2 while the transaction is still pooled.
    pub async fn get_transaction_receipt(&self, hash: &str) -> Result<Receipt, SdkError> {
        self.get_json(&format!("tx/{hash}/receipt")).await
    }

    /// Events of a confirmed transaction. Pending and unknown hashes are 404.
    pub async fn get_events_by_hash(&self, hash: &str) -> Result<EventsInfo, SdkError> {
        self.get_json(&format!("tx/{hash}/events")).await
    }

    pub async fn latest_block(&self) -> Result<BlockHeader, SdkError> {
        self.get_json("block/latest").await
    }

    pub async fn get_block(&self, height: u64) -> Result<BlockHeader, SdkError> {
        self.get_json(&format!("block/{height}")).await
    }

    async fn get_json<T>(&self, path: &str) -> Result<T, SdkError>
    where
        T: DeserializeOwned,
    {
        let url = self.base_url.join(path)?;
        let response = self.http.get(url).send().await?;
        Self::map_response(response).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, SdkError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.base_url.join(path)?;
        let response = self.http.post(url).json(body).send().await?;
        Self::map_response(response).await
    }

    async fn map_response<T>(response: Response) -> Result<T, SdkError>
    where
        T: DeserializeOwned,
    {
        if !response.status().is_success() {
            return Err(Self::map_api_error(response).await);
        }
        Ok(response.json::<T>().await?)
    }

    async fn map_api_error(response: Response) -> SdkError {
        let status = response.status().as_u16();
        let bytes = response.bytes().await.unwrap_or_default();
        if let Ok(api_error) = serde_json::from_slice::<ApiErrorResponse>(&bytes) {
            return SdkError::server_error(status, api_error.error);
        }
        let text = String::from_utf8_lossy(&bytes).to_string();
        SdkError::server_error(status, text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountInfo {
    pub address: Address,
    pub balance: Amount,
    pub nonce: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventsInfo {
    pub events: Vec<Event>,
    #[serde(rename = "eventError", default)]
    pub event_error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeHealth {
    pub status: String,
    pub node_id: String,
    pub version: String,
    pub chain_id: u32,
    pub latest_height: u64,
    pub mempool_size: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct AccountView {
    address: String,
    #[serde(with = "amount_string")]
    balance: Amount,
    nonce: u64,
}

#[derive(Debug, Serialize)]
struct RawTransactionBody {
    data: String,
}

#[derive(Debug, Deserialize)]
struct TxHashView {
    txhash: String,
}

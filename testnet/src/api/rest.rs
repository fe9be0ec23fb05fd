use async_trait::async_trait;
use log::{debug, trace, warn};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::sleep;
use url::Url;

use super::{ApiConnector, LedgerInfo, NodeApi, TransactionStatus};
use crate::error::{TestnetError, TestnetResult};
use crate::identity::{Account, AccountAddress};

const COIN_STORE: &str = "0x1::coin::CoinStore<0x1::aptos_coin::AptosCoin>";
const DKG_STATE: &str = "0x1::dkg::DKGState";
const TRANSFER_FUNCTION: &str = "0x1::aptos_account::transfer";
const MAX_GAS_AMOUNT: u64 = 200_000;
const GAS_UNIT_PRICE: u64 = 100;
const EXPIRATION_SECS: u64 = 60;

/// Configuration for REST client retries and timeouts
#[derive(Debug, Clone)]
pub struct RestClientConfig {
    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    /// Retries for reads; submissions are never resent by the client.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RestClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            connection_timeout: Duration::from_secs(3),
            max_retries: 2,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// REST client for one validator.
pub struct RestClient {
    client: Client,
    base_url: String,
    config: RestClientConfig,
}

#[derive(Debug, Deserialize)]
struct AccountResource {
    #[serde(deserialize_with = "super::u64_from_string_or_number")]
    sequence_number: u64,
}

#[derive(Debug, Deserialize)]
struct CoinStoreResource {
    data: CoinStoreData,
}

#[derive(Debug, Deserialize)]
struct CoinStoreData {
    coin: Coin,
}

#[derive(Debug, Deserialize)]
struct Coin {
    #[serde(deserialize_with = "super::u64_from_string_or_number")]
    value: u64,
}

#[derive(Debug, Deserialize)]
struct DkgStateResource {
    data: DkgStateData,
}

#[derive(Debug, Deserialize)]
struct DkgStateData {
    dealer_epoch_public_key: String,
}

#[derive(Debug, Deserialize)]
struct SubmittedTransaction {
    hash: String,
}

/// Reply of `GET /v1/transactions/by_hash/{hash}`.
#[derive(Debug, Deserialize)]
struct TransactionView {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    vm_status: Option<String>,
    #[serde(default)]
    version: Option<String>,
}

impl RestClient {
    pub fn new(address: &str) -> TestnetResult<Self> {
        Self::with_config(address, RestClientConfig::default())
    }

    /// Accepts `host:port` as well as full URLs.
    pub fn with_config(address: &str, config: RestClientConfig) -> TestnetResult<Self> {
        let url = if address.starts_with("http://") || address.starts_with("https://") {
            Url::parse(address)
        } else {
            Url::parse(&format!("http://{}", address))
        }
        .map_err(|e| TestnetError::config("api_url", format!("'{address}': {e}")))?;

        let client = Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connection_timeout)
            .build()
            .map_err(|e| TestnetError::Api {
                endpoint: address.to_string(),
                detail: format!("cannot build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            base_url: url.as_str().trim_end_matches('/').to_string(),
            config,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn api_error(&self, url: &str, detail: impl Into<String>) -> TestnetError {
        TestnetError::Api {
            endpoint: url.to_string(),
            detail: detail.into(),
        }
    }

    /// The node answered, but with a 404 where a resource was required.
    fn not_found(&self, path: &str, what: &str) -> TestnetError {
        self.api_error(
            &self.url(path),
            format!("HTTP {}: {what} not found", StatusCode::NOT_FOUND),
        )
    }

    /// GET with retries; `Ok(None)` on 404.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> TestnetResult<Option<T>> {
        let url = self.url(path);
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                debug!("Retrying GET {} (attempt {}/{})", url, attempt, self.config.max_retries);
                sleep(self.config.retry_delay).await;
            }

            match self.get_once(&url).await {
                Ok(value) => return Ok(value),
                Err((e, retryable)) => {
                    if !retryable {
                        debug!("Not retrying GET {}: {}", url, e);
                        return Err(e);
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| self.api_error(&url, "no attempt was made")))
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<Option<T>, (TestnetError, bool)> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| (self.transport_error(url, &e), true))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err((self.api_error(url, format!("HTTP {status}: {}", body.trim())), retryable));
        }

        response
            .json::<T>()
            .await
            .map(Some)
            .map_err(|e| (self.api_error(url, format!("unexpected response: {e}")), false))
    }

    async fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> TestnetResult<T> {
        let url = self.url(path);
        if log::log_enabled!(log::Level::Trace) {
            trace!("POST {} {}", url, body);
        }

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, &e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.api_error(&url, format!("HTTP {status}: {}", body.trim())));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| self.api_error(&url, format!("unexpected response: {e}")))
    }

    fn transport_error(&self, url: &str, e: &reqwest::Error) -> TestnetError {
        let detail = if e.is_timeout() {
            format!("request timeout after {:?}", self.config.request_timeout)
        } else if e.is_connect() {
            format!("connection failed: {e}")
        } else {
            format!("network error: {e}")
        };
        self.api_error(url, detail)
    }
}

/// Unsigned transfer request in the node's JSON submission format.
fn transfer_request(
    sender: &AccountAddress,
    sequence_number: u64,
    recipient: &AccountAddress,
    amount: u64,
    now_secs: u64,
) -> Value {
    json!({
        "sender": sender.to_hex_literal(),
        "sequence_number": sequence_number.to_string(),
        "max_gas_amount": MAX_GAS_AMOUNT.to_string(),
        "gas_unit_price": GAS_UNIT_PRICE.to_string(),
        "expiration_timestamp_secs": (now_secs + EXPIRATION_SECS).to_string(),
        "payload": {
            "type": "entry_function_payload",
            "function": TRANSFER_FUNCTION,
            "type_arguments": [],
            "arguments": [recipient.to_hex_literal(), amount.to_string()],
        },
    })
}

#[async_trait]
impl NodeApi for RestClient {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn ledger_info(&self) -> TestnetResult<LedgerInfo> {
        self.get_json("v1")
            .await?
            .ok_or_else(|| self.not_found("v1", "ledger info"))
    }

    async fn account_balance(&self, address: &AccountAddress) -> TestnetResult<u64> {
        let path = format!("v1/accounts/{}/resource/{}", address.to_hex_literal(), COIN_STORE);
        Ok(self
            .get_json::<CoinStoreResource>(&path)
            .await?
            .map_or(0, |store| store.data.coin.value))
    }

    async fn sequence_number(&self, address: &AccountAddress) -> TestnetResult<u64> {
        let path = format!("v1/accounts/{}", address.to_hex_literal());
        Ok(self
            .get_json::<AccountResource>(&path)
            .await?
            .map_or(0, |account| account.sequence_number))
    }

    async fn submit_transfer(
        &self,
        sender: &Account,
        recipient: &AccountAddress,
        amount: u64,
    ) -> TestnetResult<String> {
        let sequence_number = self.sequence_number(&sender.address).await?;
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut request = transfer_request(&sender.address, sequence_number, recipient, amount, now_secs);

        let signing_message: String = self
            .post_json("v1/transactions/encode_submission", &request)
            .await?;
        let message = hex::decode(signing_message.trim_start_matches("0x")).map_err(|e| {
            self.api_error(
                &self.url("v1/transactions/encode_submission"),
                format!("signing message is not hex: {e}"),
            )
        })?;

        let key = sender.key();
        request["signature"] = json!({
            "type": "ed25519_signature",
            "public_key": key.public_key_hex(),
            "signature": format!("0x{}", hex::encode(key.sign(&message))),
        });

        let submitted: SubmittedTransaction = self.post_json("v1/transactions", &request).await?;
        debug!(
            "Submitted transfer of {} from {} to {} (seq {}): {}",
            amount, sender.address, recipient, sequence_number, submitted.hash
        );
        Ok(submitted.hash)
    }

    async fn transaction_status(&self, hash: &str) -> TestnetResult<TransactionStatus> {
        let path = format!("v1/transactions/by_hash/{hash}");
        let Some(view) = self.get_json::<TransactionView>(&path).await? else {
            return Ok(TransactionStatus::Pending);
        };
        Ok(interpret(view))
    }

    async fn validator_group_pubkey(&self) -> TestnetResult<String> {
        let path = format!("v1/accounts/0x1/resource/{DKG_STATE}");
        self.get_json::<DkgStateResource>(&path)
            .await?
            .map(|state| state.data.dealer_epoch_public_key)
            .ok_or_else(|| self.not_found(&path, "DKG state"))
    }
}

fn interpret(view: TransactionView) -> TransactionStatus {
    if view.kind == "pending_transaction" {
        return TransactionStatus::Pending;
    }
    match view.success {
        Some(true) => TransactionStatus::Success {
            version: view.version.and_then(|v| v.parse().ok()).unwrap_or_default(),
        },
        Some(false) => TransactionStatus::Failed {
            vm_status: view.vm_status.unwrap_or_else(|| "unknown".to_string()),
        },
        None => {
            warn!("Transaction of type '{}' carries no outcome", view.kind);
            TransactionStatus::Pending
        }
    }
}

/// Connects [`RestClient`]s with a shared configuration.
#[derive(Debug, Clone, Default)]
pub struct RestConnector {
    config: RestClientConfig,
}

impl RestConnector {
    pub fn new(config: RestClientConfig) -> Self {
        Self { config }
    }
}

impl ApiConnector for RestConnector {
    fn connect(&self, base_url: &str) -> TestnetResult<Arc<dyn NodeApi>> {
        Ok(Arc::new(RestClient::with_config(base_url, self.config.clone())?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_without_scheme() {
        let client = RestClient::new("127.0.0.1:8080").unwrap();
        assert_eq!(client.base_url(), "http://127.0.0.1:8080");
        assert_eq!(client.url("/v1"), "http://127.0.0.1:8080/v1");
    }

    #[test]
    fn test_transfer_request_shape() {
        let sender = AccountAddress::CORE_RESOURCES;
        let recipient: AccountAddress = "0xb0b".parse().unwrap();
        let request = transfer_request(&sender, 7, &recipient, 100_000_000, 1_000);

        assert_eq!(request["sequence_number"], "7");
        assert_eq!(request["expiration_timestamp_secs"], "1060");
        assert_eq!(request["payload"]["function"], TRANSFER_FUNCTION);
        assert_eq!(request["payload"]["arguments"][0], recipient.to_hex_literal());
        // u64 amounts travel as strings.
        assert_eq!(request["payload"]["arguments"][1], "100000000");
    }

    #[test]
    fn test_transaction_views() {
        let pending: TransactionView =
            serde_json::from_value(json!({"type": "pending_transaction", "hash": "0x1"})).unwrap();
        assert_eq!(interpret(pending), TransactionStatus::Pending);

        let committed: TransactionView = serde_json::from_value(json!({
            "type": "user_transaction", "success": true,
            "vm_status": "Executed successfully", "version": "42"
        }))
        .unwrap();
        assert_eq!(interpret(committed), TransactionStatus::Success { version: 42 });

        let aborted: TransactionView = serde_json::from_value(json!({
            "type": "user_transaction", "success": false,
            "vm_status": "Move abort: EINSUFFICIENT_BALANCE", "version": "43"
        }))
        .unwrap();
        assert_eq!(
            interpret(aborted),
            TransactionStatus::Failed {
                vm_status: "Move abort: EINSUFFICIENT_BALANCE".to_string()
            }
        );
    }

    #[test]
    fn test_coin_store_parsing() {
        let store: CoinStoreResource = serde_json::from_value(json!({
            "type": COIN_STORE,
            "data": {"coin": {"value": "100000000"}, "frozen": false}
        }))
        .unwrap();
        assert_eq!(store.data.coin.value, 100_000_000);
    }

    #[test]
    fn test_dkg_state_parsing() {
        let state: DkgStateResource = serde_json::from_value(json!({
            "type": DKG_STATE,
            "data": {
                "dealer_epoch_public_key": "0xa1b2c3",
                "last_completed": {"vec": []},
                "in_progress": {"vec": []}
            }
        }))
        .unwrap();
        assert_eq!(state.data.dealer_epoch_public_key, "0xa1b2c3");

        let without_key = serde_json::from_value::<DkgStateResource>(json!({
            "type": DKG_STATE,
            "data": {"last_completed": {"vec": []}}
        }));
        assert!(without_key.is_err());
    }

    #[test]
    fn test_missing_resource_reads_as_http_error() {
        let client = RestClient::new("127.0.0.1:8080").unwrap();
        match client.not_found("v1", "ledger info") {
            TestnetError::Api { endpoint, detail } => {
                assert_eq!(endpoint, "http://127.0.0.1:8080/v1");
                assert_eq!(detail, "HTTP 404 Not Found: ledger info not found");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_node_is_api_error() {
        let config = RestClientConfig {
            max_retries: 0,
            connection_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(500),
            ..RestClientConfig::default()
        };
        // Port 1 is never served in CI containers.
        let client = RestClient::with_config("127.0.0.1:1", config).unwrap();
        let err = client.ledger_info().await.unwrap_err();
        assert!(matches!(err, TestnetError::Api { .. }));
        assert!(err.is_retryable());
    }
}

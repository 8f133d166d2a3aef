use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use hx_api_types::{Address, ChainId, ConnectorId};
use hx_connector::{
    ActivateOptions, Activation, Connector, ConnectorError, FederatedConfig, FederatedGrant,
    IdentityBroker, ProviderHandle, ProviderTransport, SessionRelay,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

pub const DEFAULT_CHAIN_ID: ChainId = ChainId(1);

/// JSON-RPC 2.0 over HTTP.
pub struct HttpTransport {
    endpoint: String,
    http: reqwest::Client,
    next_id: AtomicU64,
    close_url: Option<String>,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.into(),
            http,
            next_id: AtomicU64::new(1),
            close_url: None,
        }
    }

    /// `close` sends a DELETE here, used for relay-backed sessions.
    pub fn with_close_url(mut self, url: impl Into<String>) -> Self {
        self.close_url = Some(url.into());
        self
    }
}

// ── JSON-RPC wire types ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

fn decode_rpc_response(body: &str) -> Result<Value, ConnectorError> {
    let response: RpcResponse = serde_json::from_str(body)
        .map_err(|err| ConnectorError::Transport(format!("invalid rpc response: {err}")))?;
    if let Some(error) = response.error {
        return Err(ConnectorError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    Ok(response.result.unwrap_or(Value::Null))
}

fn transport_error(context: &str, err: reqwest::Error) -> ConnectorError {
    ConnectorError::Transport(format!("{context}: {err}"))
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ConnectorError> {
        let body = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|err| transport_error(method, err))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| transport_error(method, err))?;

        // Nodes often answer rpc errors with a 4xx/5xx and a JSON-RPC body.
        match decode_rpc_response(&text) {
            Err(ConnectorError::Transport(_)) if !status.is_success() => Err(
                ConnectorError::Transport(format!("{method} HTTP {status}: {text}")),
            ),
            decoded => decoded,
        }
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        let Some(url) = &self.close_url else {
            return Ok(());
        };
        let response = self
            .http
            .delete(url)
            .send()
            .await
            .map_err(|err| transport_error("close", err))?;
        if !response.status().is_success() {
            return Err(ConnectorError::Transport(format!(
                "close HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Read-only connector onto a public JSON-RPC endpoint. It never has an
/// account; it only gives the shell a chain id and a provider to read from.
pub struct NetworkConnector {
    urls: BTreeMap<ChainId, String>,
    default_chain: ChainId,
    http: reqwest::Client,
    active: Mutex<Option<ProviderHandle>>,
}

impl NetworkConnector {
    pub fn new(urls: BTreeMap<ChainId, String>, default_chain: ChainId, http: reqwest::Client) -> Self {
        Self {
            urls,
            default_chain,
            http,
            active: Mutex::new(None),
        }
    }

    pub fn chains(&self) -> Vec<ChainId> {
        self.urls.keys().copied().collect()
    }
}

/// Parses `1=https://a,4=https://b` into a chain → url table.
pub fn parse_network_urls(raw: &str) -> Result<BTreeMap<ChainId, String>> {
    let mut urls = BTreeMap::new();
    for entry in raw.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
        let Some((chain, url)) = entry.split_once('=') else {
            bail!("network url entry '{entry}' must look like <chain id>=<url>");
        };
        let chain: ChainId = chain
            .parse()
            .with_context(|| format!("network url entry '{entry}'"))?;
        let url = url.trim().trim_end_matches('/');
        if url.is_empty() {
            bail!("network url entry '{entry}' has an empty url");
        }
        urls.insert(chain, url.to_owned());
    }
    Ok(urls)
}

#[async_trait]
impl Connector for NetworkConnector {
    fn id(&self) -> ConnectorId {
        ConnectorId::Network
    }

    async fn activate(&self, options: ActivateOptions) -> Result<Activation, ConnectorError> {
        let chain_id = options.chain_id.unwrap_or(self.default_chain);
        let Some(url) = self.urls.get(&chain_id) else {
            return Err(ConnectorError::UnsupportedChain(format!(
                "no network endpoint configured for chain {chain_id}"
            )));
        };

        let transport = Arc::new(HttpTransport::new(url.clone(), self.http.clone()));
        let provider = ProviderHandle::new(ConnectorId::Network, transport);
        let reported = provider.chain_id().await?;
        if reported != chain_id {
            warn!(%chain_id, %reported, "network endpoint serves a different chain");
            return Err(ConnectorError::UnsupportedChain(format!(
                "endpoint for chain {chain_id} reports chain {reported}"
            )));
        }

        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = Some(provider.clone());
        Ok(Activation {
            account: None,
            chain_id,
            provider,
        })
    }

    async fn deactivate(&self) -> Result<(), ConnectorError> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner).take();
        Ok(())
    }

    async fn account(&self) -> Result<Address, ConnectorError> {
        Err(ConnectorError::NoAccount)
    }

    async fn provider(&self) -> Result<ProviderHandle, ConnectorError> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ConnectorError::NotActive)
    }
}

// ── WalletConnect relay ─────────────────────────────────────────────

/// Relay REST contract: `POST {endpoint}/sessions {"uri"}` blocks until the
/// wallet answers, `DELETE {endpoint}/sessions/{topic}` ends the session.
pub struct HttpSessionRelay {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpSessionRelay {
    pub fn new(endpoint: &str, http: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            http,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum PairResponse {
    Approved {
        topic: String,
        #[serde(default)]
        rpc_url: Option<String>,
    },
    Rejected {
        #[serde(default)]
        reason: Option<String>,
    },
    Expired,
}

#[async_trait]
impl SessionRelay for HttpSessionRelay {
    async fn pair(&self, uri: &str) -> Result<Arc<dyn ProviderTransport>, ConnectorError> {
        let url = format!("{}/sessions", self.endpoint);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "uri": uri }))
            .send()
            .await
            .map_err(|err| transport_error("walletconnect pair", err))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ConnectorError::Transport(format!(
                "walletconnect pair HTTP {status}: {text}"
            )));
        }

        let body: PairResponse = response
            .json()
            .await
            .map_err(|err| transport_error("walletconnect pair parse", err))?;

        match body {
            PairResponse::Approved { topic, rpc_url } => {
                debug!(%topic, "walletconnect session approved");
                let session_url = format!("{}/sessions/{topic}", self.endpoint);
                let rpc_url = rpc_url.unwrap_or_else(|| format!("{session_url}/rpc"));
                let transport =
                    HttpTransport::new(rpc_url, self.http.clone()).with_close_url(session_url);
                Ok(Arc::new(transport))
            }
            PairResponse::Rejected { reason } => Err(ConnectorError::UserRejected(
                reason.unwrap_or_else(|| "wallet rejected the session".to_owned()),
            )),
            PairResponse::Expired => Err(ConnectorError::StaleSession(uri.to_owned())),
        }
    }
}

// ── Federated identity broker ───────────────────────────────────────

/// Broker REST contract: `POST {endpoint}/authorize` runs the popup flow and
/// returns the grant, `POST {endpoint}/logout` ends it.
pub struct HttpIdentityBroker {
    endpoint: String,
    http: reqwest::Client,
}

impl HttpIdentityBroker {
    pub fn new(endpoint: &str, http: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            http,
        }
    }
}

#[derive(Debug, Serialize)]
struct AuthorizeRequest<'a> {
    client_id: &'a str,
    redirect_uri: &'a str,
    scope: &'a str,
}

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    sub: String,
    wallet_address: String,
    rpc_url: String,
}

#[derive(Debug, Deserialize)]
struct BrokerErrorResponse {
    error: String,
}

#[async_trait]
impl IdentityBroker for HttpIdentityBroker {
    async fn authorize(&self, config: &FederatedConfig) -> Result<FederatedGrant, ConnectorError> {
        let url = format!("{}/authorize", self.endpoint);
        let response = self
            .http
            .post(&url)
            .json(&AuthorizeRequest {
                client_id: &config.client_id,
                redirect_uri: &config.redirect_uri,
                scope: &config.scope,
            })
            .send()
            .await
            .map_err(|err| transport_error("federated authorize", err))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| transport_error("federated authorize", err))?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<BrokerErrorResponse>(&text) {
                if err.error == "access_denied" {
                    return Err(ConnectorError::UserRejected(err.error));
                }
            }
            return Err(ConnectorError::Transport(format!(
                "federated authorize HTTP {status}: {text}"
            )));
        }

        let body: AuthorizeResponse = serde_json::from_str(&text)
            .map_err(|err| ConnectorError::Transport(format!("federated authorize parse: {err}")))?;

        Ok(FederatedGrant {
            subject: body.sub,
            account: Address(body.wallet_address),
            transport: Arc::new(HttpTransport::new(body.rpc_url, self.http.clone())),
        })
    }

    async fn logout(&self, subject: &str) -> Result<(), ConnectorError> {
        let url = format!("{}/logout", self.endpoint);
        let response = self
            .http
            .post(&url)
            .json(&json!({ "sub": subject }))
            .send()
            .await
            .map_err(|err| transport_error("federated logout", err))?;
        if !response.status().is_success() {
            return Err(ConnectorError::Transport(format!(
                "federated logout HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

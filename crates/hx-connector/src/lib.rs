use async_trait::async_trait;
use hx_api_types::{Address, ChainId, ConnectorId, UnknownConnectorId};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub mod federated;
pub mod injected;
pub mod walletconnect;

pub use federated::{FederatedConfig, FederatedConnector, FederatedGrant, IdentityBroker};
pub use injected::InjectedConnector;
pub use walletconnect::{SessionRelay, WalletConnectConnector};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectorError {
    #[error("user rejected the request: {0}")]
    UserRejected(String),
    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),
    #[error("stale session: {0}")]
    StaleSession(String),
    #[error("connector is not active")]
    NotActive,
    #[error("connector has no account")]
    NoAccount,
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transport error: {0}")]
    Transport(String),
}

/// EIP-1193 style request channel to a wallet provider.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ConnectorError>;

    /// Reverse name lookup. Providers without a name service report `None`.
    async fn lookup_address(&self, _account: &Address) -> Result<Option<String>, ConnectorError> {
        Ok(None)
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(pub u64);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider-{}", self.0)
    }
}

static NEXT_PROVIDER_ID: AtomicU64 = AtomicU64::new(1);

/// A live provider produced by a connector activation. Identity is the
/// `ProviderId`, fresh for every handle.
#[derive(Clone)]
pub struct ProviderHandle {
    id: ProviderId,
    connector: ConnectorId,
    transport: Arc<dyn ProviderTransport>,
}

impl ProviderHandle {
    pub fn new(connector: ConnectorId, transport: Arc<dyn ProviderTransport>) -> Self {
        Self {
            id: ProviderId(NEXT_PROVIDER_ID.fetch_add(1, Ordering::Relaxed)),
            connector,
            transport,
        }
    }

    pub fn id(&self) -> ProviderId {
        self.id
    }

    pub fn connector(&self) -> ConnectorId {
        self.connector
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ConnectorError> {
        self.transport.request(method, params).await
    }

    pub async fn lookup_address(&self, account: &Address) -> Result<Option<String>, ConnectorError> {
        self.transport.lookup_address(account).await
    }

    pub async fn close(&self) -> Result<(), ConnectorError> {
        self.transport.close().await
    }

    pub async fn request_accounts(&self) -> Result<Vec<Address>, ConnectorError> {
        parse_accounts(self.request("eth_requestAccounts", json!([])).await?)
    }

    pub async fn accounts(&self) -> Result<Vec<Address>, ConnectorError> {
        parse_accounts(self.request("eth_accounts", json!([])).await?)
    }

    pub async fn chain_id(&self) -> Result<ChainId, ConnectorError> {
        let value = self.request("eth_chainId", json!([])).await?;
        parse_chain_id(&value)
    }

    pub async fn switch_chain(&self, chain_id: ChainId) -> Result<(), ConnectorError> {
        self.request(
            "wallet_switchEthereumChain",
            json!([{ "chainId": chain_id.to_hex() }]),
        )
        .await?;
        Ok(())
    }
}

impl fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("connector", &self.connector)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ProviderHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ProviderHandle {}

fn parse_accounts(value: Value) -> Result<Vec<Address>, ConnectorError> {
    let Value::Array(items) = value else {
        return Err(ConnectorError::Transport(format!(
            "expected account list, got {value}"
        )));
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::String(raw) if !raw.trim().is_empty() => Ok(Address(raw)),
            other => Err(ConnectorError::Transport(format!("invalid account entry {other}"))),
        })
        .collect()
}

/// Providers answer `eth_chainId` with a hex string; some older ones send a number.
pub fn parse_chain_id(value: &Value) -> Result<ChainId, ConnectorError> {
    match value {
        Value::String(raw) => raw
            .parse::<ChainId>()
            .map_err(|err| ConnectorError::Transport(err.to_string())),
        Value::Number(number) => number
            .as_u64()
            .map(ChainId)
            .ok_or_else(|| ConnectorError::Transport(format!("invalid chain id {number}"))),
        other => Err(ConnectorError::Transport(format!("invalid chain id {other}"))),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ActivateOptions {
    /// Chain the read-only network connector should attach to.
    pub chain_id: Option<ChainId>,
}

#[derive(Debug, Clone)]
pub struct Activation {
    pub account: Option<Address>,
    pub chain_id: ChainId,
    pub provider: ProviderHandle,
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn id(&self) -> ConnectorId;
    async fn activate(&self, options: ActivateOptions) -> Result<Activation, ConnectorError>;
    async fn deactivate(&self) -> Result<(), ConnectorError>;
    async fn account(&self) -> Result<Address, ConnectorError>;
    async fn provider(&self) -> Result<ProviderHandle, ConnectorError>;

    /// Whether a silent (no prompt) activation would succeed right now.
    async fn is_authorized(&self) -> bool {
        false
    }

    /// Session URI cached from an earlier pairing attempt, if the connector keeps one.
    fn pending_session_uri(&self) -> Option<String> {
        None
    }

    /// Drops the cached session URI, returning what was cleared.
    fn clear_pending_session(&self) -> Option<String> {
        None
    }
}

/// Fixed table of connectors assembled at startup.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<ConnectorId, Arc<dyn Connector>>,
}

impl ConnectorRegistry {
    pub fn register(&mut self, connector: Arc<dyn Connector>) {
        self.connectors.insert(connector.id(), connector);
    }

    /// User-selectable connectors in `ConnectorId` order. The read-only
    /// network connector is reachable through `get` but never listed.
    pub fn list(&self) -> Vec<ConnectorId> {
        self.connectors
            .keys()
            .copied()
            .filter(|id| *id != ConnectorId::Network)
            .collect()
    }

    pub fn get(&self, id: ConnectorId) -> Result<Arc<dyn Connector>, UnknownConnectorId> {
        self.connectors
            .get(&id)
            .cloned()
            .ok_or_else(|| UnknownConnectorId(id.as_str().to_owned()))
    }

    pub fn network(&self) -> Option<Arc<dyn Connector>> {
        self.connectors.get(&ConnectorId::Network).cloned()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;

    /// Transport answering from a fixed method table and recording calls.
    #[derive(Default)]
    pub struct ScriptedTransport {
        pub answers: Mutex<HashMap<String, Result<Value, ConnectorError>>>,
        pub calls: Mutex<Vec<String>>,
        pub closed: Mutex<bool>,
    }

    impl ScriptedTransport {
        pub fn wallet(account: &str, chain_hex: &str) -> Arc<Self> {
            let transport = Self::default();
            {
                let mut answers = lock(&transport.answers);
                answers.insert("eth_requestAccounts".into(), Ok(json!([account])));
                answers.insert("eth_accounts".into(), Ok(json!([account])));
                answers.insert("eth_chainId".into(), Ok(json!(chain_hex)));
            }
            Arc::new(transport)
        }

        pub fn answer(&self, method: &str, answer: Result<Value, ConnectorError>) {
            lock(&self.answers).insert(method.to_owned(), answer);
        }
    }

    #[async_trait]
    impl ProviderTransport for ScriptedTransport {
        async fn request(&self, method: &str, _params: Value) -> Result<Value, ConnectorError> {
            lock(&self.calls).push(method.to_owned());
            lock(&self.answers)
                .get(method)
                .cloned()
                .unwrap_or_else(|| Err(ConnectorError::Rpc {
                    code: -32601,
                    message: format!("method {method} not found"),
                }))
        }

        async fn close(&self) -> Result<(), ConnectorError> {
            *lock(&self.closed) = true;
            Ok(())
        }
    }

    /// Relay that pairs every URI onto the same transport unless told to fail.
    pub struct FixedRelay {
        pub transport: Arc<ScriptedTransport>,
        pub failure: Mutex<Option<ConnectorError>>,
        pub paired_uris: Mutex<Vec<String>>,
    }

    impl FixedRelay {
        pub fn new(transport: Arc<ScriptedTransport>) -> Self {
            Self {
                transport,
                failure: Mutex::new(None),
                paired_uris: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SessionRelay for FixedRelay {
        async fn pair(&self, uri: &str) -> Result<Arc<dyn ProviderTransport>, ConnectorError> {
            lock(&self.paired_uris).push(uri.to_owned());
            if let Some(err) = lock(&self.failure).take() {
                return Err(err);
            }
            Ok(self.transport.clone())
        }
    }
}

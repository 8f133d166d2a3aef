use async_trait::async_trait;
use hx_api_types::{Address, ConnectorId};
use rand::RngCore;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use crate::{ActivateOptions, Activation, Connector, ConnectorError, ProviderHandle, ProviderTransport, lock};

/// Pairs a WalletConnect session URI with a wallet and hands back the
/// request channel once the wallet approves.
#[async_trait]
pub trait SessionRelay: Send + Sync {
    async fn pair(&self, uri: &str) -> Result<Arc<dyn ProviderTransport>, ConnectorError>;
}

/// WalletConnect relay session.
///
/// The URI generated for a pairing attempt stays cached until a pairing
/// succeeds. If the user abandons the QR prompt, the next `activate` reuses
/// the cached URI, and the relay has already expired that session. Callers
/// must `clear_pending_session` before re-activating.
pub struct WalletConnectConnector {
    bridge: String,
    relay: Arc<dyn SessionRelay>,
    pending_session_uri: Mutex<Option<String>>,
    session: Mutex<Option<ProviderHandle>>,
}

impl WalletConnectConnector {
    pub fn new(bridge: impl Into<String>, relay: Arc<dyn SessionRelay>) -> Self {
        Self {
            bridge: bridge.into(),
            relay,
            pending_session_uri: Mutex::new(None),
            session: Mutex::new(None),
        }
    }
}

/// `wc:{topic}@1?bridge={bridge}&key={hex}` as WalletConnect v1 expects it.
pub fn new_session_uri(bridge: &str) -> String {
    let mut key = [0_u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    format!(
        "wc:{}@1?bridge={}&key={}",
        Uuid::new_v4(),
        encode_component(bridge),
        to_hex(&key)
    )
}

fn encode_component(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                output.push(byte as char)
            }
            _ => output.push_str(&format!("%{byte:02X}")),
        }
    }
    output
}

fn to_hex(input: &[u8]) -> String {
    let mut output = String::with_capacity(input.len() * 2);
    for byte in input {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

#[async_trait]
impl Connector for WalletConnectConnector {
    fn id(&self) -> ConnectorId {
        ConnectorId::WalletConnect
    }

    async fn activate(&self, _options: ActivateOptions) -> Result<Activation, ConnectorError> {
        let uri = lock(&self.pending_session_uri)
            .get_or_insert_with(|| new_session_uri(&self.bridge))
            .clone();
        debug!(%uri, "pairing walletconnect session");

        let transport = self.relay.pair(&uri).await?;
        let provider = ProviderHandle::new(ConnectorId::WalletConnect, transport);
        let account = provider
            .request_accounts()
            .await?
            .into_iter()
            .next()
            .ok_or(ConnectorError::NoAccount)?;
        let chain_id = provider.chain_id().await?;

        let current = {
            let mut pending = lock(&self.pending_session_uri);
            let current = pending.as_deref() == Some(uri.as_str());
            if current {
                *pending = None;
                *lock(&self.session) = Some(provider.clone());
            }
            current
        };
        if !current {
            // A newer pairing replaced this uri while the wallet was answering.
            debug!(%uri, "closing walletconnect session from a replaced pairing");
            if let Err(err) = provider.close().await {
                debug!(%uri, error = %err, "closing replaced walletconnect session failed");
            }
            return Err(ConnectorError::StaleSession(uri));
        }

        Ok(Activation {
            account: Some(account),
            chain_id,
            provider,
        })
    }

    async fn deactivate(&self) -> Result<(), ConnectorError> {
        let session = lock(&self.session).take();
        match session {
            Some(provider) => provider.close().await,
            None => Ok(()),
        }
    }

    async fn account(&self) -> Result<Address, ConnectorError> {
        let provider = self.provider().await?;
        provider
            .accounts()
            .await?
            .into_iter()
            .next()
            .ok_or(ConnectorError::NoAccount)
    }

    async fn provider(&self) -> Result<ProviderHandle, ConnectorError> {
        lock(&self.session).clone().ok_or(ConnectorError::NotActive)
    }

    fn pending_session_uri(&self) -> Option<String> {
        lock(&self.pending_session_uri).clone()
    }

    fn clear_pending_session(&self) -> Option<String> {
        lock(&self.pending_session_uri).take()
    }
}

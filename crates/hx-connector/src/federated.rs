use async_trait::async_trait;
use hx_api_types::{Address, ConnectorId};
use serde_json::Value;
use std::sync::{Arc, Mutex};

use crate::{ActivateOptions, Activation, Connector, ConnectorError, ProviderHandle, ProviderTransport, lock};

#[derive(Debug, Clone)]
pub struct FederatedConfig {
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: String,
}

/// Outcome of a completed identity popup.
pub struct FederatedGrant {
    /// Identity subject; for Unstoppable Domains this is the domain name.
    pub subject: String,
    pub account: Address,
    pub transport: Arc<dyn ProviderTransport>,
}

#[async_trait]
pub trait IdentityBroker: Send + Sync {
    async fn authorize(&self, config: &FederatedConfig) -> Result<FederatedGrant, ConnectorError>;
    async fn logout(&self, subject: &str) -> Result<(), ConnectorError>;
}

struct FederatedSession {
    subject: String,
    account: Address,
    provider: ProviderHandle,
}

/// Federated-identity login popup (Unstoppable Domains).
pub struct FederatedConnector {
    config: FederatedConfig,
    broker: Arc<dyn IdentityBroker>,
    session: Mutex<Option<FederatedSession>>,
}

impl FederatedConnector {
    pub fn new(config: FederatedConfig, broker: Arc<dyn IdentityBroker>) -> Self {
        Self {
            config,
            broker,
            session: Mutex::new(None),
        }
    }
}

/// Answers reverse lookups for the authorized account with the identity
/// subject, everything else goes to the wrapped transport.
struct SubjectNamedTransport {
    inner: Arc<dyn ProviderTransport>,
    account: Address,
    subject: String,
}

#[async_trait]
impl ProviderTransport for SubjectNamedTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, ConnectorError> {
        self.inner.request(method, params).await
    }

    async fn lookup_address(&self, account: &Address) -> Result<Option<String>, ConnectorError> {
        if account.0.eq_ignore_ascii_case(&self.account.0) {
            return Ok(Some(self.subject.clone()));
        }
        self.inner.lookup_address(account).await
    }

    async fn close(&self) -> Result<(), ConnectorError> {
        self.inner.close().await
    }
}

#[async_trait]
impl Connector for FederatedConnector {
    fn id(&self) -> ConnectorId {
        ConnectorId::Federated
    }

    async fn activate(&self, _options: ActivateOptions) -> Result<Activation, ConnectorError> {
        let grant = self.broker.authorize(&self.config).await?;
        let transport = Arc::new(SubjectNamedTransport {
            inner: grant.transport,
            account: grant.account.clone(),
            subject: grant.subject.clone(),
        });
        let provider = ProviderHandle::new(ConnectorId::Federated, transport);
        let chain_id = provider.chain_id().await?;

        *lock(&self.session) = Some(FederatedSession {
            subject: grant.subject,
            account: grant.account.clone(),
            provider: provider.clone(),
        });

        Ok(Activation {
            account: Some(grant.account),
            chain_id,
            provider,
        })
    }

    async fn deactivate(&self) -> Result<(), ConnectorError> {
        let session = lock(&self.session).take();
        let Some(session) = session else {
            return Ok(());
        };
        let closed = session.provider.close().await;
        self.broker.logout(&session.subject).await?;
        closed
    }

    async fn account(&self) -> Result<Address, ConnectorError> {
        lock(&self.session)
            .as_ref()
            .map(|session| session.account.clone())
            .ok_or(ConnectorError::NotActive)
    }

    async fn provider(&self) -> Result<ProviderHandle, ConnectorError> {
        lock(&self.session)
            .as_ref()
            .map(|session| session.provider.clone())
            .ok_or(ConnectorError::NotActive)
    }
}

use async_trait::async_trait;
use hx_api_types::{Address, ConnectorId};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::{ActivateOptions, Activation, Connector, ConnectorError, ProviderHandle, ProviderTransport, lock};

/// Browser-injected provider (the Metamask extension and lookalikes).
pub struct InjectedConnector {
    transport: Arc<dyn ProviderTransport>,
    active: Mutex<Option<ProviderHandle>>,
}

impl InjectedConnector {
    pub fn new(transport: Arc<dyn ProviderTransport>) -> Self {
        Self {
            transport,
            active: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Connector for InjectedConnector {
    fn id(&self) -> ConnectorId {
        ConnectorId::Injected
    }

    async fn activate(&self, _options: ActivateOptions) -> Result<Activation, ConnectorError> {
        let provider = ProviderHandle::new(ConnectorId::Injected, self.transport.clone());
        let account = provider
            .request_accounts()
            .await?
            .into_iter()
            .next()
            .ok_or(ConnectorError::NoAccount)?;
        let chain_id = provider.chain_id().await?;

        *lock(&self.active) = Some(provider.clone());
        Ok(Activation {
            account: Some(account),
            chain_id,
            provider,
        })
    }

    async fn deactivate(&self) -> Result<(), ConnectorError> {
        // The extension owns its own session; only our handle goes away.
        lock(&self.active).take();
        Ok(())
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
        lock(&self.active).clone().ok_or(ConnectorError::NotActive)
    }

    async fn is_authorized(&self) -> bool {
        let handle = ProviderHandle::new(ConnectorId::Injected, self.transport.clone());
        match handle.accounts().await {
            Ok(accounts) => !accounts.is_empty(),
            Err(err) => {
                debug!(error = %err, "injected authorization check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedTransport;
    use hx_api_types::ChainId;
    use serde_json::json;

    #[tokio::test]
    async fn activates_with_first_account() -> anyhow::Result<()> {
        let transport = ScriptedTransport::wallet("0xabc", "0x4");
        let connector = InjectedConnector::new(transport);

        assert_eq!(connector.provider().await.err(), Some(ConnectorError::NotActive));

        let activation = connector.activate(ActivateOptions::default()).await?;
        assert_eq!(activation.account, Some(Address("0xabc".to_owned())));
        assert_eq!(activation.chain_id, ChainId(4));
        assert_eq!(connector.provider().await?, activation.provider);
        assert_eq!(connector.account().await?, Address("0xabc".to_owned()));

        connector.deactivate().await?;
        assert_eq!(connector.account().await.err(), Some(ConnectorError::NotActive));
        Ok(())
    }

    #[tokio::test]
    async fn rejection_passes_through() {
        let transport = ScriptedTransport::wallet("0xabc", "0x1");
        transport.answer(
            "eth_requestAccounts",
            Err(ConnectorError::Rpc {
                code: 4001,
                message: "User rejected the request.".to_owned(),
            }),
        );
        let connector = InjectedConnector::new(transport);

        let err = connector.activate(ActivateOptions::default()).await.err();
        assert!(matches!(err, Some(ConnectorError::Rpc { code: 4001, .. })));
        assert!(connector.provider().await.is_err());
    }

    #[tokio::test]
    async fn authorized_only_with_exposed_accounts() {
        let transport = ScriptedTransport::wallet("0xabc", "0x1");
        let connector = InjectedConnector::new(transport.clone());
        assert!(connector.is_authorized().await);

        transport.answer("eth_accounts", Ok(json!([])));
        assert!(!connector.is_authorized().await);
    }
}

use anyhow::{Context, Result, bail};
use hx_api_types::ChainId;
use hx_connector::{
    ConnectorRegistry, FederatedConfig, FederatedConnector, InjectedConnector, WalletConnectConnector,
};
use hx_connector_http::{
    DEFAULT_CHAIN_ID, HttpIdentityBroker, HttpSessionRelay, HttpTransport, NetworkConnector,
    parse_network_urls,
};
use hx_session::RequiredChain;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_UAUTH_SCOPE: &str = "openid wallet";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WalletConnectSettings {
    pub bridge: String,
    pub relay_url: String,
}

#[derive(Debug, Clone)]
pub(crate) struct FederatedSettings {
    pub config: FederatedConfig,
    pub broker_url: String,
}

#[derive(Debug, Clone)]
pub(crate) struct ServiceConfig {
    pub bind_addr: SocketAddr,
    pub required_chain: RequiredChain,
    pub network_urls: BTreeMap<ChainId, String>,
    pub default_chain: ChainId,
    pub injected_rpc_url: Option<String>,
    pub walletconnect: Option<WalletConnectSettings>,
    pub federated: Option<FederatedSettings>,
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_owned())
                .filter(|value| !value.is_empty())
        };

        let bind_addr = var("HX_BIND_ADDR")
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_owned())
            .parse::<SocketAddr>()
            .context("HX_BIND_ADDR must be a socket address")?;

        let required_chain = match var("HX_REQUIRED_CHAIN_ID") {
            Some(raw) => RequiredChain::from_setting(&raw).context("HX_REQUIRED_CHAIN_ID")?,
            None => RequiredChain::default(),
        };

        let network_urls = match var("HX_NETWORK_URLS") {
            Some(raw) => parse_network_urls(&raw).context("HX_NETWORK_URLS")?,
            None => BTreeMap::new(),
        };
        let default_chain = match var("HX_DEFAULT_CHAIN_ID") {
            Some(raw) => raw.parse::<ChainId>().context("HX_DEFAULT_CHAIN_ID")?,
            None => DEFAULT_CHAIN_ID,
        };

        let walletconnect = match (var("HX_WALLETCONNECT_BRIDGE"), var("HX_WALLETCONNECT_RELAY_URL")) {
            (Some(bridge), Some(relay_url)) => Some(WalletConnectSettings { bridge, relay_url }),
            (None, None) => None,
            _ => bail!("HX_WALLETCONNECT_BRIDGE and HX_WALLETCONNECT_RELAY_URL must be set together"),
        };

        let federated = match (var("HX_UAUTH_CLIENT_ID"), var("HX_UAUTH_BROKER_URL")) {
            (Some(client_id), Some(broker_url)) => Some(FederatedSettings {
                config: FederatedConfig {
                    client_id,
                    redirect_uri: var("HX_UAUTH_REDIRECT_URI")
                        .context("HX_UAUTH_REDIRECT_URI is required when HX_UAUTH_CLIENT_ID is set")?,
                    scope: var("HX_UAUTH_SCOPE").unwrap_or_else(|| DEFAULT_UAUTH_SCOPE.to_owned()),
                },
                broker_url,
            }),
            (None, None) => None,
            _ => bail!("HX_UAUTH_CLIENT_ID and HX_UAUTH_BROKER_URL must be set together"),
        };

        Ok(Self {
            bind_addr,
            required_chain,
            network_urls,
            default_chain,
            injected_rpc_url: var("HX_INJECTED_RPC_URL"),
            walletconnect,
            federated,
        })
    }

    /// Registers one connector per configured backend.
    pub fn build_registry(&self, http: reqwest::Client) -> ConnectorRegistry {
        let mut registry = ConnectorRegistry::default();

        if let Some(url) = &self.injected_rpc_url {
            let transport = HttpTransport::new(url.clone(), http.clone());
            registry.register(Arc::new(InjectedConnector::new(Arc::new(transport))));
        }
        if let Some(settings) = &self.walletconnect {
            let relay = HttpSessionRelay::new(&settings.relay_url, http.clone());
            registry.register(Arc::new(WalletConnectConnector::new(
                settings.bridge.clone(),
                Arc::new(relay),
            )));
        }
        if let Some(settings) = &self.federated {
            let broker = HttpIdentityBroker::new(&settings.broker_url, http.clone());
            registry.register(Arc::new(FederatedConnector::new(
                settings.config.clone(),
                Arc::new(broker),
            )));
        }
        if !self.network_urls.is_empty() {
            let network = NetworkConnector::new(self.network_urls.clone(), self.default_chain, http);
            info!(chains = ?network.chains(), default_chain = %self.default_chain, "read-only network configured");
            registry.register(Arc::new(network));
        }

        info!(
            connectors = ?registry.list(),
            read_only = registry.network().is_some(),
            "connector registry ready"
        );
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hx_api_types::ConnectorId;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| ((*key).to_owned(), (*value).to_owned()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_settings() -> Result<()> {
        let config = ServiceConfig::from_lookup(lookup(&[]))?;
        assert_eq!(config.bind_addr, "0.0.0.0:8080".parse::<SocketAddr>()?);
        assert_eq!(config.required_chain, RequiredChain(None));
        assert_eq!(config.default_chain, ChainId(1));
        assert!(config.walletconnect.is_none());
        assert!(config.federated.is_none());
        assert!(config.build_registry(reqwest::Client::new()).list().is_empty());
        Ok(())
    }

    #[test]
    fn full_configuration_registers_every_connector() -> Result<()> {
        let config = ServiceConfig::from_lookup(lookup(&[
            ("HX_REQUIRED_CHAIN_ID", "chain=4"),
            ("HX_NETWORK_URLS", "1=https://mainnet.example,4=https://rinkeby.example"),
            ("HX_INJECTED_RPC_URL", "http://127.0.0.1:8545"),
            ("HX_WALLETCONNECT_BRIDGE", "https://bridge.walletconnect.org"),
            ("HX_WALLETCONNECT_RELAY_URL", "http://127.0.0.1:9100"),
            ("HX_UAUTH_CLIENT_ID", "shell-client"),
            ("HX_UAUTH_REDIRECT_URI", "http://localhost:3000"),
            ("HX_UAUTH_BROKER_URL", "http://127.0.0.1:9200"),
        ]))?;

        assert_eq!(config.required_chain, RequiredChain(Some(ChainId(4))));
        assert_eq!(config.network_urls.len(), 2);
        assert_eq!(
            config.federated.as_ref().map(|settings| settings.config.scope.as_str()),
            Some("openid wallet")
        );

        let registry = config.build_registry(reqwest::Client::new());
        assert_eq!(
            registry.list(),
            vec![ConnectorId::Injected, ConnectorId::WalletConnect, ConnectorId::Federated]
        );
        assert!(registry.network().is_some());
        Ok(())
    }

    #[test]
    fn malformed_settings_are_rejected() {
        assert!(ServiceConfig::from_lookup(lookup(&[("HX_REQUIRED_CHAIN_ID", "rinkeby")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup(&[("HX_REQUIRED_CHAIN_ID", "chain=rinkeby")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup(&[("HX_BIND_ADDR", "localhost")])).is_err());
        assert!(ServiceConfig::from_lookup(lookup(&[("HX_WALLETCONNECT_BRIDGE", "https://bridge")])).is_err());
        assert!(
            ServiceConfig::from_lookup(lookup(&[
                ("HX_UAUTH_CLIENT_ID", "shell-client"),
                ("HX_UAUTH_BROKER_URL", "http://127.0.0.1:9200"),
            ]))
            .is_err()
        );
    }
}

//! Display-name resolution for the active account.
//!
//! Every `resolve` call takes a generation ticket up front. A lookup only
//! publishes when its ticket is still the newest one, so a slow answer for
//! an account the user already switched away from is dropped.

use hx_api_types::{Address, ChainId};
use hx_connector::{ConnectorError, ProviderHandle, ProviderId};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::controller::ConnectionState;
use crate::lock;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisplayName {
    pub provider: Option<ProviderId>,
    pub account: Option<Address>,
    pub name: Option<String>,
}

impl DisplayName {
    /// Resolved name, or the shortened address when there is none.
    pub fn label(&self) -> Option<String> {
        self.name
            .clone()
            .or_else(|| self.account.as_ref().map(Address::short))
    }

    /// Label for `(provider, account)`; a result published for another key
    /// never leaks into it.
    pub fn label_for(&self, provider: Option<ProviderId>, account: Option<&Address>) -> Option<String> {
        let account = account?;
        if self.provider == provider && self.account.as_ref() == Some(account) {
            return self.label();
        }
        Some(account.short())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("name lookup failed: {0}")]
pub struct NameLookupFailure(pub ConnectorError);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Provider or account absent; nothing was looked up.
    NoName,
    Resolved(String),
    NotFound,
    /// Lookup failed; treated like `NotFound`.
    Absorbed(NameLookupFailure),
    /// A newer `resolve` started before this one finished.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

pub struct NameResolver {
    latest: Mutex<u64>,
    current: watch::Sender<DisplayName>,
}

impl Default for NameResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NameResolver {
    pub fn new() -> Self {
        let (current, _) = watch::channel(DisplayName::default());
        Self {
            latest: Mutex::new(0),
            current,
        }
    }

    pub fn current(&self) -> DisplayName {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DisplayName> {
        self.current.subscribe()
    }

    /// Invalidates every lookup still in flight.
    pub fn next_ticket(&self) -> Ticket {
        let mut latest = lock(&self.latest);
        *latest += 1;
        Ticket(*latest)
    }

    pub async fn resolve(&self, provider: Option<&ProviderHandle>, account: Option<&Address>) -> Resolution {
        let ticket = self.next_ticket();
        self.resolve_with(ticket, provider, account).await
    }

    pub async fn resolve_with(
        &self,
        ticket: Ticket,
        provider: Option<&ProviderHandle>,
        account: Option<&Address>,
    ) -> Resolution {
        let (Some(provider), Some(account)) = (provider, account) else {
            return if self.publish(ticket, DisplayName::default()) {
                Resolution::NoName
            } else {
                Resolution::Discarded
            };
        };

        let (name, resolution) = match provider.lookup_address(account).await {
            Ok(Some(name)) if !name.trim().is_empty() => (Some(name.clone()), Resolution::Resolved(name)),
            Ok(_) => (None, Resolution::NotFound),
            Err(err) => {
                debug!(%account, error = %err, "name lookup failed, falling back to address");
                (None, Resolution::Absorbed(NameLookupFailure(err)))
            }
        };

        let published = self.publish(
            ticket,
            DisplayName {
                provider: Some(provider.id()),
                account: Some(account.clone()),
                name,
            },
        );
        if !published {
            debug!(%account, "discarding name lookup for a superseded account");
            return Resolution::Discarded;
        }
        resolution
    }

    fn publish(&self, ticket: Ticket, value: DisplayName) -> bool {
        let latest = lock(&self.latest);
        if *latest != ticket.0 {
            return false;
        }
        self.current.send_replace(value);
        true
    }

    /// Re-resolves whenever the provider, account or chain id of the
    /// connection changes. Lookups run concurrently; tickets keep order.
    pub fn track(self: &Arc<Self>, mut states: watch::Receiver<ConnectionState>) -> JoinHandle<()> {
        let resolver = Arc::clone(self);
        tokio::spawn(async move {
            let mut last_key: Option<(Option<ProviderId>, Option<Address>, Option<ChainId>)> = None;
            loop {
                let (provider, account, chain_id) = {
                    let state = states.borrow_and_update();
                    (state.provider.clone(), state.account.clone(), state.chain_id)
                };
                let key = (provider.as_ref().map(ProviderHandle::id), account.clone(), chain_id);
                if last_key.as_ref() != Some(&key) {
                    last_key = Some(key);
                    let ticket = resolver.next_ticket();
                    let resolver = Arc::clone(&resolver);
                    tokio::spawn(async move {
                        resolver
                            .resolve_with(ticket, provider.as_ref(), account.as_ref())
                            .await;
                    });
                }
                if states.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

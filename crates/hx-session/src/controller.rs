//! Connection lifecycle: eager connect, user activation, teardown and
//! provider events, all funnelled through one owned `ConnectionState`.
//!
//! Every operation that may suspend takes an attempt token first. A result
//! is only written back while its token is still the latest, so a newer
//! `activate` (or a `deactivate`) supersedes anything still in flight.

use hx_api_types::{Address, ChainId, ConnectorId, ErrorView, Phase};
use hx_connector::{
    ActivateOptions, Activation, Connector, ConnectorError, ConnectorRegistry, ProviderHandle,
    ProviderId,
};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, classify};
use crate::lock;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub phase: Phase,
    pub connector: Option<ConnectorId>,
    pub account: Option<Address>,
    pub chain_id: Option<ChainId>,
    pub provider: Option<ProviderHandle>,
    pub error: Option<ConnectionError>,
}

impl ConnectionState {
    pub fn error_view(&self) -> Option<ErrorView> {
        self.error.as_ref().map(ConnectionError::view)
    }

    /// Where the state rests once nothing is in flight.
    fn settled_phase(&self) -> Phase {
        if self.error.is_some() {
            Phase::Errored
        } else if self.provider.is_some() {
            Phase::Connected
        } else {
            Phase::Disconnected
        }
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Events a live provider emits on its own.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(ChainId),
    Disconnected,
    Error(ConnectorError),
}

/// Notified when the connection settles: entering `Connected`, any attempt
/// finishing, or the recorded error changing. Used to cancel "connecting"
/// affordances.
pub trait SettleObserver: Send + Sync {
    fn settled(&self, state: &ConnectionState);
}

impl<F> SettleObserver for F
where
    F: Fn(&ConnectionState) + Send + Sync,
{
    fn settled(&self, state: &ConnectionState) {
        self(state)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EagerSkip {
    AlreadyAttempted,
    ErrorPresent,
    AlreadyConnected,
    /// A user activation was running or started while eager connect was.
    ActivationInFlight,
    NoNetworkConnector,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EagerOutcome {
    /// A previously authorized wallet reconnected without a prompt.
    Restored(ConnectorId),
    ReadOnly(ChainId),
    Skipped(EagerSkip),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Interactive,
    /// Failures leave no error behind.
    Silent,
}

#[derive(Debug, Default)]
struct Attempts {
    latest: u64,
    pending: Option<ConnectorId>,
    eager_attempted: bool,
}

pub struct ConnectionController {
    registry: Arc<ConnectorRegistry>,
    state: watch::Sender<ConnectionState>,
    attempts: Mutex<Attempts>,
    observers: Mutex<Vec<Arc<dyn SettleObserver>>>,
}

impl ConnectionController {
    pub fn new(registry: Arc<ConnectorRegistry>) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            registry,
            state,
            attempts: Mutex::new(Attempts::default()),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn add_settle_observer(&self, observer: Arc<dyn SettleObserver>) {
        lock(&self.observers).push(observer);
    }

    /// One-shot startup connection. Silently restores an authorized wallet,
    /// otherwise falls back to the read-only network connector for
    /// `required_chain`. Runs at most once per controller.
    ///
    /// Eager connect never supersedes a user activation: it stops with
    /// `EagerSkip::ActivationInFlight` as soon as any other attempt has
    /// started since it began.
    pub async fn eager_connect(&self, required_chain: Option<ChainId>) -> Result<EagerOutcome, ConnectionError> {
        let mut since = {
            let mut attempts = lock(&self.attempts);
            if attempts.eager_attempted {
                return Ok(EagerOutcome::Skipped(EagerSkip::AlreadyAttempted));
            }
            let state = self.state.borrow();
            if state.error.is_some() {
                return Ok(EagerOutcome::Skipped(EagerSkip::ErrorPresent));
            }
            if state.phase == Phase::Connected {
                return Ok(EagerOutcome::Skipped(EagerSkip::AlreadyConnected));
            }
            if state.phase == Phase::Connecting || attempts.pending.is_some() {
                return Ok(EagerOutcome::Skipped(EagerSkip::ActivationInFlight));
            }
            attempts.eager_attempted = true;
            attempts.latest
        };

        for id in self.registry.list() {
            let Ok(connector) = self.registry.get(id) else {
                continue;
            };
            if !connector.is_authorized().await {
                continue;
            }
            let Some(attempt) = self.begin_eager_attempt(id, since) else {
                debug!(connector = %id, "user activation started, abandoning eager connect");
                return Ok(EagerOutcome::Skipped(EagerSkip::ActivationInFlight));
            };
            info!(connector = %id, "restoring authorized wallet session");
            match self
                .drive_activation(attempt, id, connector, ActivateOptions::default(), Mode::Silent)
                .await
            {
                Ok(_) => return Ok(EagerOutcome::Restored(id)),
                Err(ConnectionError::Superseded) => return Err(ConnectionError::Superseded),
                Err(err) => {
                    debug!(connector = %id, error = %err, "silent reconnection failed");
                    since = attempt;
                    break;
                }
            }
        }

        let Some(network) = self.registry.network() else {
            return Ok(EagerOutcome::Skipped(EagerSkip::NoNetworkConnector));
        };
        let Some(attempt) = self.begin_eager_attempt(ConnectorId::Network, since) else {
            debug!("user activation started, skipping read-only fallback");
            return Ok(EagerOutcome::Skipped(EagerSkip::ActivationInFlight));
        };
        let options = ActivateOptions {
            chain_id: required_chain,
        };
        let state = self
            .drive_activation(attempt, ConnectorId::Network, network, options, Mode::Interactive)
            .await?;
        match state.chain_id {
            Some(chain_id) => Ok(EagerOutcome::ReadOnly(chain_id)),
            None => Err(ConnectionError::ProviderTransport(
                "network connector reported no chain".to_owned(),
            )),
        }
    }

    /// User-initiated activation. Supersedes any activation still in flight.
    pub async fn activate(&self, id: ConnectorId) -> Result<ConnectionState, ConnectionError> {
        let connector = self.registry.get(id)?;
        self.run_activation(id, connector, ActivateOptions::default(), Mode::Interactive)
            .await
    }

    async fn run_activation(
        &self,
        id: ConnectorId,
        connector: Arc<dyn Connector>,
        options: ActivateOptions,
        mode: Mode,
    ) -> Result<ConnectionState, ConnectionError> {
        let attempt = self.begin_attempt(Some(id), |state| state.phase = Phase::Connecting);
        self.drive_activation(attempt, id, connector, options, mode).await
    }

    async fn drive_activation(
        &self,
        attempt: u64,
        id: ConnectorId,
        connector: Arc<dyn Connector>,
        options: ActivateOptions,
        mode: Mode,
    ) -> Result<ConnectionState, ConnectionError> {
        debug!(connector = %id, attempt, "activation started");

        if id == ConnectorId::WalletConnect {
            if let Some(stale) = connector.clear_pending_session() {
                debug!(uri = %stale, "cleared cached walletconnect session uri");
            }
        }

        let mut outcome = connector.activate(options.clone()).await;
        let stale = matches!(&outcome, Err(ConnectorError::StaleSession(_)));
        if stale && self.is_current(attempt) {
            warn!(connector = %id, "walletconnect session expired, retrying with a fresh uri");
            connector.clear_pending_session();
            outcome = connector.activate(options).await;
        }

        match outcome {
            Ok(activation) => self.finish_success(attempt, id, connector, activation).await,
            Err(err) => self.finish_failure(attempt, id, classify(err), mode),
        }
    }

    async fn finish_success(
        &self,
        attempt: u64,
        id: ConnectorId,
        connector: Arc<dyn Connector>,
        activation: Activation,
    ) -> Result<ConnectionState, ConnectionError> {
        let mut replaced = None;
        let committed = self.commit_if(
            |attempts, _| attempts.latest == attempt,
            |state| {
                if state.connector.is_some_and(|previous| previous != id) {
                    replaced = state.connector;
                }
                state.phase = Phase::Connected;
                state.connector = Some(id);
                state.account = activation.account;
                state.chain_id = Some(activation.chain_id);
                state.provider = Some(activation.provider);
                state.error = None;
            },
        );

        if !committed {
            debug!(connector = %id, attempt, "late activation result dropped");
            let orphaned = {
                let attempts = lock(&self.attempts);
                attempts.pending != Some(id) && self.state.borrow().connector != Some(id)
            };
            if orphaned {
                self.teardown(id, &connector).await;
            }
            return Err(ConnectionError::Superseded);
        }

        self.release_pending(attempt);
        let state = self.state();
        info!(
            connector = %id,
            account = ?state.account,
            chain_id = ?state.chain_id,
            "wallet connected"
        );

        if let Some(previous) = replaced {
            if let Ok(previous_connector) = self.registry.get(previous) {
                self.teardown(previous, &previous_connector).await;
            }
        }
        Ok(state)
    }

    fn finish_failure(
        &self,
        attempt: u64,
        id: ConnectorId,
        err: ConnectionError,
        mode: Mode,
    ) -> Result<ConnectionState, ConnectionError> {
        let record = mode == Mode::Interactive && !matches!(err, ConnectionError::UserRejected(_));
        let committed = self.commit_if(
            |attempts, _| attempts.latest == attempt,
            |state| {
                if record {
                    state.phase = Phase::Errored;
                    state.error = Some(err.clone());
                } else {
                    state.phase = state.settled_phase();
                }
            },
        );
        if !committed {
            debug!(connector = %id, attempt, error = %err, "late activation failure dropped");
            return Err(ConnectionError::Superseded);
        }

        self.release_pending(attempt);
        match &err {
            ConnectionError::UserRejected(_) => info!(connector = %id, "connection request rejected by user"),
            _ if mode == Mode::Silent => debug!(connector = %id, error = %err, "silent activation failed"),
            _ => warn!(connector = %id, error = %err, "activation failed"),
        }
        Err(err)
    }

    /// Tears down the active connector and always ends `Disconnected`.
    /// Teardown failures are logged and otherwise ignored.
    pub async fn deactivate(&self) -> ConnectionState {
        self.disconnect(None).await;
        self.state()
    }

    async fn disconnect(&self, expected: Option<ProviderId>) -> bool {
        let mut previous = None;
        {
            let mut attempts = lock(&self.attempts);
            let current = self.state.borrow().provider.as_ref().map(ProviderHandle::id);
            if expected.is_some() && current != expected {
                return false;
            }
            attempts.latest += 1;
            attempts.pending = None;
            let (before, after) = self.apply(|state| {
                previous = state.connector;
                state.clear();
            });
            drop(attempts);
            self.notify(&before, &after);
        }

        if let Some(id) = previous {
            if let Ok(connector) = self.registry.get(id) {
                self.teardown(id, &connector).await;
            }
            info!(connector = %id, "wallet disconnected");
        }
        true
    }

    async fn teardown(&self, id: ConnectorId, connector: &Arc<dyn Connector>) {
        if let Err(err) = connector.deactivate().await {
            warn!(connector = %id, error = %err, "connector teardown failed");
        }
    }

    /// Routes an event from a live provider. Events from a provider that is
    /// no longer the active one are ignored. Returns whether it applied.
    pub async fn handle_provider_event(&self, provider: ProviderId, event: ProviderEvent) -> bool {
        match event {
            ProviderEvent::AccountsChanged(accounts) if accounts.is_empty() => {
                self.disconnect(Some(provider)).await
            }
            ProviderEvent::Disconnected => self.disconnect(Some(provider)).await,
            ProviderEvent::AccountsChanged(accounts) => {
                let account = accounts.into_iter().next();
                self.commit_for_provider(provider, |state| state.account = account)
            }
            ProviderEvent::ChainChanged(chain_id) => {
                self.commit_for_provider(provider, |state| state.chain_id = Some(chain_id))
            }
            ProviderEvent::Error(err) => {
                let err = classify(err);
                warn!(%provider, error = %err, "provider reported an error");
                self.commit_for_provider(provider, |state| {
                    state.phase = Phase::Errored;
                    state.error = Some(err);
                })
            }
        }
    }

    /// Asks the active wallet to move to `chain_id`.
    pub async fn request_chain_switch(&self, chain_id: ChainId) -> Result<ConnectionState, ConnectionError> {
        let provider = self
            .state
            .borrow()
            .provider
            .clone()
            .ok_or_else(|| ConnectionError::ProviderTransport("no active provider".to_owned()))?;

        provider.switch_chain(chain_id).await.map_err(|err| {
            let err = classify(err);
            info!(%chain_id, error = %err, "chain switch not performed");
            err
        })?;

        self.commit_for_provider(provider.id(), |state| state.chain_id = Some(chain_id));
        Ok(self.state())
    }

    fn begin_attempt(&self, pending: Option<ConnectorId>, update: impl FnOnce(&mut ConnectionState)) -> u64 {
        let mut attempts = lock(&self.attempts);
        attempts.latest += 1;
        attempts.pending = pending;
        let attempt = attempts.latest;
        let (before, after) = self.apply(update);
        drop(attempts);
        self.notify(&before, &after);
        attempt
    }

    /// Starts an eager attempt only if no other attempt began after `since`.
    fn begin_eager_attempt(&self, id: ConnectorId, since: u64) -> Option<u64> {
        let mut attempts = lock(&self.attempts);
        if attempts.latest != since || attempts.pending.is_some() {
            return None;
        }
        attempts.latest += 1;
        attempts.pending = Some(id);
        let attempt = attempts.latest;
        let (before, after) = self.apply(|state| state.phase = Phase::Connecting);
        drop(attempts);
        self.notify(&before, &after);
        Some(attempt)
    }

    fn release_pending(&self, attempt: u64) {
        let mut attempts = lock(&self.attempts);
        if attempts.latest == attempt {
            attempts.pending = None;
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        lock(&self.attempts).latest == attempt
    }

    fn commit_for_provider(&self, provider: ProviderId, update: impl FnOnce(&mut ConnectionState)) -> bool {
        self.commit_if(
            |_, state| state.provider.as_ref().map(ProviderHandle::id) == Some(provider),
            update,
        )
    }

    /// Applies `update` when `guard` holds, atomically with respect to
    /// other commits.
    fn commit_if(
        &self,
        guard: impl FnOnce(&Attempts, &ConnectionState) -> bool,
        update: impl FnOnce(&mut ConnectionState),
    ) -> bool {
        let attempts = lock(&self.attempts);
        let allowed = guard(&*attempts, &*self.state.borrow());
        if !allowed {
            return false;
        }
        let (before, after) = self.apply(update);
        drop(attempts);
        self.notify(&before, &after);
        true
    }

    fn apply(&self, update: impl FnOnce(&mut ConnectionState)) -> (ConnectionState, ConnectionState) {
        let before = self.state();
        self.state.send_modify(update);
        (before, self.state())
    }

    fn notify(&self, before: &ConnectionState, after: &ConnectionState) {
        let entered_connected = before.phase != Phase::Connected && after.phase == Phase::Connected;
        let left_connecting = before.phase == Phase::Connecting && after.phase != Phase::Connecting;
        let error_changed = before.error != after.error;
        if !entered_connected && !left_connecting && !error_changed {
            return;
        }
        let observers = lock(&self.observers).clone();
        for observer in observers {
            observer.settled(after);
        }
    }
}

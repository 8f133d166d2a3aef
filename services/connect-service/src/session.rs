use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use hx_api_types::{
    ConnectorId, ConnectorInfo, PairingResponse, ProviderEventBody, ProviderEventRequest,
    ProviderEventResponse, SessionSnapshot, ShellView, SwitchChainRequest,
};
use hx_connector::{ConnectorError, ProviderHandle, ProviderId};
use hx_session::{ConnectionController, ConnectionError, ConnectionState, NameResolver, ProviderEvent, RequiredChain};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::{ApiResult, conflict, not_found};

pub(crate) struct AppState {
    pub controller: Arc<ConnectionController>,
    pub names: Arc<NameResolver>,
    pub required_chain: RequiredChain,
    connecting: Arc<AtomicBool>,
}

impl AppState {
    /// Wires the connecting flag to the controller's settle notifications.
    pub fn new(controller: Arc<ConnectionController>, names: Arc<NameResolver>, required_chain: RequiredChain) -> Self {
        let connecting = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&connecting);
        controller.add_settle_observer(Arc::new(move |_: &ConnectionState| {
            flag.store(false, Ordering::SeqCst);
        }));
        Self {
            controller,
            names,
            required_chain,
            connecting,
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let session = self.controller.state();
        let provider = session.provider.as_ref().map(ProviderHandle::id);
        let gate = self.required_chain.verdict(session.chain_id);
        let error = session.error_view();
        let display_name = self.names.current().label_for(provider, session.account.as_ref());

        SessionSnapshot {
            phase: session.phase,
            view: ShellView::derive(error.is_some(), gate),
            account: session.account,
            chain_id: session.chain_id,
            connector: session.connector,
            provider_id: provider.map(|id| id.0),
            error,
            display_name,
            gate,
            connecting: self.connecting.load(Ordering::SeqCst),
        }
    }
}

pub(crate) async fn connectors(State(state): State<Arc<AppState>>) -> Json<Vec<ConnectorInfo>> {
    let listing = state
        .controller
        .registry()
        .list()
        .into_iter()
        .map(|id| ConnectorInfo {
            id,
            name: id.display_name().to_owned(),
        })
        .collect();
    Json(listing)
}

pub(crate) async fn session(State(state): State<Arc<AppState>>) -> Json<SessionSnapshot> {
    Json(state.snapshot())
}

pub(crate) async fn activate(
    State(state): State<Arc<AppState>>,
    Path(connector): Path<String>,
) -> ApiResult<SessionSnapshot> {
    let id: ConnectorId = connector.parse().map_err(not_found)?;
    state.connecting.store(true, Ordering::SeqCst);

    match state.controller.activate(id).await {
        Ok(_) => {}
        Err(err @ ConnectionError::UnknownConnector(_)) => {
            state.connecting.store(false, Ordering::SeqCst);
            return Err(not_found(err));
        }
        Err(err @ ConnectionError::Superseded) => return Err(conflict(err)),
        Err(err) => debug!(connector = %id, error = %err, "activation failure recorded in session"),
    }
    Ok(Json(state.snapshot()))
}

pub(crate) async fn deactivate(State(state): State<Arc<AppState>>) -> Json<SessionSnapshot> {
    state.controller.deactivate().await;
    state.connecting.store(false, Ordering::SeqCst);
    Json(state.snapshot())
}

pub(crate) async fn switch_chain(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SwitchChainRequest>,
) -> ApiResult<SessionSnapshot> {
    state
        .controller
        .request_chain_switch(request.chain_id)
        .await
        .map_err(conflict)?;
    Ok(Json(state.snapshot()))
}

pub(crate) async fn pairing(State(state): State<Arc<AppState>>) -> Json<PairingResponse> {
    let uri = state
        .controller
        .registry()
        .get(ConnectorId::WalletConnect)
        .ok()
        .and_then(|connector| connector.pending_session_uri());
    Json(PairingResponse { uri })
}

pub(crate) async fn provider_event(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ProviderEventRequest>,
) -> Json<ProviderEventResponse> {
    let provider = ProviderId(request.provider_id);
    let event = match request.body {
        ProviderEventBody::AccountsChanged { accounts } => ProviderEvent::AccountsChanged(accounts),
        ProviderEventBody::ChainChanged { chain_id } => ProviderEvent::ChainChanged(chain_id),
        ProviderEventBody::Disconnected => ProviderEvent::Disconnected,
        ProviderEventBody::Error { code: Some(code), message } => {
            ProviderEvent::Error(ConnectorError::Rpc { code, message })
        }
        ProviderEventBody::Error { code: None, message } => ProviderEvent::Error(ConnectorError::Transport(message)),
    };

    let applied = state.controller.handle_provider_event(provider, event).await;
    if !applied {
        info!(%provider, "ignoring event from an inactive provider");
    }
    Json(ProviderEventResponse {
        applied,
        session: state.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router;
    use async_trait::async_trait;
    use axum::{
        Router,
        body::{Body, to_bytes},
        http::Request,
    };
    use hx_api_types::{ChainId, GateVerdict, Phase};
    use hx_connector::{ConnectorRegistry, InjectedConnector, ProviderTransport};
    use serde_json::{Value, json};
    use std::sync::Mutex;
    use tower::ServiceExt;

    const ACCOUNT: &str = "0xABCDEF0000000000000000000000000000001234";

    /// Extension stand-in; `eth_requestAccounts` follows `approve`.
    struct ExtensionWallet {
        approve: bool,
        chain_id: Mutex<ChainId>,
    }

    #[async_trait]
    impl ProviderTransport for ExtensionWallet {
        async fn request(&self, method: &str, params: Value) -> Result<Value, ConnectorError> {
            match method {
                "eth_requestAccounts" if !self.approve => Err(ConnectorError::Rpc {
                    code: 4001,
                    message: "User rejected the request.".to_owned(),
                }),
                "eth_requestAccounts" | "eth_accounts" => Ok(json!([ACCOUNT])),
                "eth_chainId" => {
                    let chain_id = *self.chain_id.lock().unwrap();
                    Ok(json!(chain_id.to_hex()))
                }
                "wallet_switchEthereumChain" => {
                    let raw = params[0]["chainId"].as_str().unwrap_or_default();
                    *self.chain_id.lock().unwrap() = ChainId::from_hex(raw).unwrap();
                    Ok(Value::Null)
                }
                other => Err(ConnectorError::Transport(format!("{other} unsupported"))),
            }
        }

        async fn lookup_address(&self, _account: &hx_api_types::Address) -> Result<Option<String>, ConnectorError> {
            Ok(Some("alice.crypto".to_owned()))
        }
    }

    fn app(approve: bool, required: Option<ChainId>) -> (Router, Arc<AppState>) {
        let wallet = ExtensionWallet {
            approve,
            chain_id: Mutex::new(ChainId(1)),
        };
        let mut registry = ConnectorRegistry::default();
        registry.register(Arc::new(InjectedConnector::new(Arc::new(wallet))));

        let controller = Arc::new(ConnectionController::new(Arc::new(registry)));
        let state = Arc::new(AppState::new(
            controller,
            Arc::new(NameResolver::new()),
            RequiredChain(required),
        ));
        (router(Arc::clone(&state)), state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let body = body.map_or_else(Body::empty, |value| Body::from(value.to_string()));
        let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn lists_connectors_with_display_names() {
        let (app, _) = app(true, None);
        let (status, body) = call(&app, "GET", "/connectors", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([{ "id": "injected", "name": "Metamask" }]));
    }

    #[tokio::test]
    async fn activation_connects_and_gates_the_shell() {
        let (app, state) = app(true, Some(ChainId(4)));

        let (status, body) = call(&app, "GET", "/session", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "disconnected");
        assert_eq!(body["view"]["view"], "loading");

        let (status, body) = call(&app, "POST", "/session/activate/injected", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "connected");
        assert_eq!(body["account"], ACCOUNT);
        assert_eq!(body["chain_id"], 1);
        assert_eq!(body["display_name"], "0xABCD...1234");
        assert_eq!(body["connecting"], false);
        assert_eq!(
            state.snapshot().gate,
            GateVerdict::Blocked { required: ChainId(4) }
        );
        assert_eq!(state.snapshot().view, ShellView::SwitchChain { required: ChainId(4) });

        let (status, body) = call(&app, "POST", "/session/switch-chain", Some(json!({ "chain_id": 4 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["chain_id"], 4);
        assert_eq!(state.snapshot().view, ShellView::Content);
    }

    #[tokio::test]
    async fn resolved_name_is_shown_for_the_active_account() {
        let (app, state) = app(true, None);
        call(&app, "POST", "/session/activate/injected", None).await;

        let session = state.controller.state();
        state
            .names
            .resolve(session.provider.as_ref(), session.account.as_ref())
            .await;
        let (_, body) = call(&app, "GET", "/session", None).await;
        assert_eq!(body["display_name"], "alice.crypto");
    }

    #[tokio::test]
    async fn unknown_connector_is_not_found() {
        let (app, state) = app(true, None);
        let (status, _) = call(&app, "POST", "/session/activate/ledger", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // Known id, but not registered.
        let (status, _) = call(&app, "POST", "/session/activate/walletconnect", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(state.snapshot().phase, Phase::Disconnected);
        assert!(!state.snapshot().connecting);
    }

    #[tokio::test]
    async fn rejection_leaves_session_disconnected_without_error() {
        let (app, _) = app(false, None);
        let (status, body) = call(&app, "POST", "/session/activate/injected", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "disconnected");
        assert_eq!(body["error"], Value::Null);
        assert_eq!(body["connecting"], false);
    }

    #[tokio::test]
    async fn provider_events_and_deactivation() {
        let (app, state) = app(true, None);
        let (_, body) = call(&app, "POST", "/session/activate/injected", None).await;
        let provider_id = body["provider_id"].as_u64().unwrap();

        let (_, body) = call(
            &app,
            "POST",
            "/session/provider-event",
            Some(json!({ "provider_id": provider_id + 1000, "event": "chain_changed", "chain_id": 137 })),
        )
        .await;
        assert_eq!(body["applied"], false);

        let (_, body) = call(
            &app,
            "POST",
            "/session/provider-event",
            Some(json!({ "provider_id": provider_id, "event": "error", "code": null, "message": "socket closed" })),
        )
        .await;
        assert_eq!(body["applied"], true);
        assert_eq!(body["session"]["phase"], "errored");
        assert_eq!(body["session"]["error"]["kind"], "provider_transport");
        assert_eq!(body["session"]["view"]["view"], "error");

        let (status, body) = call(&app, "POST", "/session/deactivate", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["phase"], "disconnected");
        assert_eq!(state.controller.state(), ConnectionState::default());

        let (status, _) = call(&app, "POST", "/session/switch-chain", Some(json!({ "chain_id": 4 }))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn pairing_is_empty_without_walletconnect() {
        let (app, _) = app(true, None);
        let (status, body) = call(&app, "GET", "/session/pairing", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "uri": null }));
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Address(pub String);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `0xABCD...1234` form used when no display name is known.
    pub fn short(&self) -> String {
        shorten_hex(&self.0, 4)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ChainId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid chain id: {0:?}")]
pub struct InvalidChainId(pub String);

impl ChainId {
    pub fn from_hex(raw: &str) -> Result<Self, InvalidChainId> {
        let digits = raw
            .strip_prefix("0x")
            .or_else(|| raw.strip_prefix("0X"))
            .ok_or_else(|| InvalidChainId(raw.to_owned()))?;
        u64::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| InvalidChainId(raw.to_owned()))
    }

    pub fn to_hex(self) -> String {
        format!("0x{:x}", self.0)
    }
}

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Accepts decimal (`4`) and `0x`-prefixed hex (`0x4`).
impl FromStr for ChainId {
    type Err = InvalidChainId;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.starts_with("0x") || raw.starts_with("0X") {
            return Self::from_hex(raw);
        }
        raw.parse::<u64>()
            .map(Self)
            .map_err(|_| InvalidChainId(raw.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorId {
    Injected,
    #[serde(rename = "walletconnect")]
    WalletConnect,
    #[serde(rename = "uauth")]
    Federated,
    Network,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown connector: {0}")]
pub struct UnknownConnectorId(pub String);

impl ConnectorId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Injected => "injected",
            Self::WalletConnect => "walletconnect",
            Self::Federated => "uauth",
            Self::Network => "network",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Injected => "Metamask",
            Self::WalletConnect => "WalletConnect",
            Self::Federated => "Unstoppable Domains",
            Self::Network => "Network",
        }
    }
}

impl fmt::Display for ConnectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorId {
    type Err = UnknownConnectorId;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "injected" => Ok(Self::Injected),
            "walletconnect" => Ok(Self::WalletConnect),
            "uauth" | "federated" => Ok(Self::Federated),
            "network" => Ok(Self::Network),
            _ => Err(UnknownConnectorId(raw.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Errored,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UserRejected,
    UnsupportedChain,
    StaleSessionArtifact,
    ProviderTransport,
    UnknownConnector,
    Superseded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorView {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum GateVerdict {
    Ok,
    Blocked { required: ChainId },
    Unknown,
}

/// What the application shell should render for the current session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "view", rename_all = "snake_case")]
pub enum ShellView {
    Error,
    Loading,
    SwitchChain { required: ChainId },
    Content,
}

impl ShellView {
    pub fn derive(error_present: bool, verdict: GateVerdict) -> Self {
        if error_present {
            return Self::Error;
        }
        match verdict {
            GateVerdict::Unknown => Self::Loading,
            GateVerdict::Blocked { required } => Self::SwitchChain { required },
            GateVerdict::Ok => Self::Content,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorInfo {
    pub id: ConnectorId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub account: Option<Address>,
    pub chain_id: Option<ChainId>,
    pub connector: Option<ConnectorId>,
    pub provider_id: Option<u64>,
    pub error: Option<ErrorView>,
    pub display_name: Option<String>,
    pub gate: GateVerdict,
    pub view: ShellView,
    pub connecting: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchChainRequest {
    pub chain_id: ChainId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingResponse {
    pub uri: Option<String>,
}

/// Event pushed by an SDK bridge on behalf of a live provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProviderEventBody {
    AccountsChanged { accounts: Vec<Address> },
    ChainChanged { chain_id: ChainId },
    Disconnected,
    Error { code: Option<i64>, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEventRequest {
    pub provider_id: u64,
    #[serde(flatten)]
    pub body: ProviderEventBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEventResponse {
    pub applied: bool,
    pub session: SessionSnapshot,
}

/// Keeps the `0x` prefix plus `chars` digits at each end.
pub fn shorten_hex(hex: &str, chars: usize) -> String {
    let body_start = if hex.starts_with("0x") { 2 } else { 0 };
    if !hex.is_ascii() || hex.len() <= body_start + chars * 2 {
        return hex.to_owned();
    }
    format!(
        "{}...{}",
        &hex[..body_start + chars],
        &hex[hex.len() - chars..]
    )
}

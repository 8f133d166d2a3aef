use hx_api_types::{ErrorKind, ErrorView, UnknownConnectorId};
use hx_connector::ConnectorError;

/// EIP-1193 "user rejected request".
const RPC_USER_REJECTED: i64 = 4001;
/// EIP-1193 "chain disconnected" and the wallet_switchEthereumChain "unrecognized chain".
const RPC_CHAIN_DISCONNECTED: i64 = 4901;
const RPC_UNRECOGNIZED_CHAIN: i64 = 4902;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("request rejected in the wallet: {0}")]
    UserRejected(String),
    #[error("unsupported chain: {0}")]
    UnsupportedChain(String),
    #[error("stale walletconnect session: {0}")]
    StaleSessionArtifact(String),
    #[error("provider error: {0}")]
    ProviderTransport(String),
    #[error(transparent)]
    UnknownConnector(#[from] UnknownConnectorId),
    #[error("superseded by a newer request")]
    Superseded,
}

impl ConnectionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UserRejected(_) => ErrorKind::UserRejected,
            Self::UnsupportedChain(_) => ErrorKind::UnsupportedChain,
            Self::StaleSessionArtifact(_) => ErrorKind::StaleSessionArtifact,
            Self::ProviderTransport(_) => ErrorKind::ProviderTransport,
            Self::UnknownConnector(_) => ErrorKind::UnknownConnector,
            Self::Superseded => ErrorKind::Superseded,
        }
    }

    pub fn view(&self) -> ErrorView {
        ErrorView {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// The same connector may be activated again without changing anything.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::UserRejected(_) | Self::ProviderTransport(_) | Self::StaleSessionArtifact(_)
        )
    }
}

/// Maps whatever a connector or provider reported onto the error kinds the
/// shell distinguishes.
pub fn classify(err: ConnectorError) -> ConnectionError {
    match err {
        ConnectorError::UserRejected(message) => ConnectionError::UserRejected(message),
        ConnectorError::Rpc { code, message } if code == RPC_USER_REJECTED => {
            ConnectionError::UserRejected(message)
        }
        ConnectorError::UnsupportedChain(message) => ConnectionError::UnsupportedChain(message),
        ConnectorError::Rpc { code, message }
            if code == RPC_CHAIN_DISCONNECTED || code == RPC_UNRECOGNIZED_CHAIN =>
        {
            ConnectionError::UnsupportedChain(message)
        }
        ConnectorError::StaleSession(uri) => ConnectionError::StaleSessionArtifact(uri),
        other => ConnectionError::ProviderTransport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_connector_errors() {
        assert_eq!(
            classify(ConnectorError::Rpc {
                code: 4001,
                message: "User denied account authorization".to_owned()
            })
            .kind(),
            ErrorKind::UserRejected
        );
        assert_eq!(
            classify(ConnectorError::UserRejected("access_denied".to_owned())).kind(),
            ErrorKind::UserRejected
        );
        assert_eq!(
            classify(ConnectorError::Rpc {
                code: 4902,
                message: "Unrecognized chain ID".to_owned()
            })
            .kind(),
            ErrorKind::UnsupportedChain
        );
        assert_eq!(
            classify(ConnectorError::StaleSession("wc:abc@1".to_owned())),
            ConnectionError::StaleSessionArtifact("wc:abc@1".to_owned())
        );

        let transport = classify(ConnectorError::Transport("connection reset".to_owned()));
        assert_eq!(transport.kind(), ErrorKind::ProviderTransport);
        assert!(transport.is_retryable());
        assert_eq!(
            classify(ConnectorError::Rpc {
                code: -32000,
                message: "header not found".to_owned()
            })
            .kind(),
            ErrorKind::ProviderTransport
        );
        assert!(!ConnectionError::Superseded.is_retryable());
    }
}

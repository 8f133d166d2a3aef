use hx_api_types::{ChainId, GateVerdict, InvalidChainId};
use tracing::debug;

/// Query parameter carrying the chain the page was opened for.
pub const CHAIN_QUERY_PARAMETER: &str = "chain";

pub fn chain_gate(current: Option<ChainId>, required: Option<ChainId>) -> GateVerdict {
    match (current, required) {
        (None, _) => GateVerdict::Unknown,
        (Some(current), Some(required)) if current != required => GateVerdict::Blocked { required },
        _ => GateVerdict::Ok,
    }
}

fn chain_parameter(query: &str) -> Option<&str> {
    query
        .trim_start_matches('?')
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == CHAIN_QUERY_PARAMETER)
        .map(|(_, value)| value)
}

/// Required chain id, read once from external configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequiredChain(pub Option<ChainId>);

impl RequiredChain {
    /// Lenient parse of a page query (`?chain=4&...`). Malformed values
    /// count as no requirement.
    pub fn from_query(query: &str) -> Self {
        match chain_parameter(query).map(str::parse::<ChainId>) {
            Some(Ok(chain_id)) => Self(Some(chain_id)),
            Some(Err(err)) => {
                debug!(error = %err, "ignoring malformed chain query parameter");
                Self(None)
            }
            None => Self(None),
        }
    }

    /// Strict parse of a configuration value: empty, a chain id, or a query string.
    pub fn from_setting(raw: &str) -> Result<Self, InvalidChainId> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self(None));
        }
        let value = if raw.contains('=') {
            chain_parameter(raw).ok_or_else(|| InvalidChainId(raw.to_owned()))?
        } else {
            raw
        };
        value.parse().map(|chain_id| Self(Some(chain_id)))
    }

    pub fn chain_id(self) -> Option<ChainId> {
        self.0
    }

    pub fn verdict(self, current: Option<ChainId>) -> GateVerdict {
        chain_gate(current, self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_verdicts() {
        assert_eq!(chain_gate(None, Some(ChainId(1))), GateVerdict::Unknown);
        assert_eq!(chain_gate(None, None), GateVerdict::Unknown);
        assert_eq!(chain_gate(Some(ChainId(1)), Some(ChainId(1))), GateVerdict::Ok);
        assert_eq!(
            chain_gate(Some(ChainId(1)), Some(ChainId(4))),
            GateVerdict::Blocked { required: ChainId(4) }
        );
        assert_eq!(chain_gate(Some(ChainId(137)), None), GateVerdict::Ok);
    }

    #[test]
    fn required_chain_from_query() {
        assert_eq!(RequiredChain::from_query("?chain=4"), RequiredChain(Some(ChainId(4))));
        assert_eq!(
            RequiredChain::from_query("token=0xabc&chain=0x89"),
            RequiredChain(Some(ChainId(137)))
        );
        assert_eq!(RequiredChain::from_query("chain=rinkeby"), RequiredChain(None));
        assert_eq!(RequiredChain::from_query(""), RequiredChain(None));
    }

    #[test]
    fn required_chain_from_setting() {
        assert_eq!(RequiredChain::from_setting(" 4 "), Ok(RequiredChain(Some(ChainId(4)))));
        assert_eq!(RequiredChain::from_setting(""), Ok(RequiredChain(None)));
        assert_eq!(
            RequiredChain::from_setting("chain=1"),
            Ok(RequiredChain(Some(ChainId(1))))
        );
        assert!(RequiredChain::from_setting("mainnet").is_err());
        assert_eq!(
            RequiredChain::from_setting("chain=rinkeby"),
            Err(InvalidChainId("rinkeby".to_owned()))
        );
        assert_eq!(
            RequiredChain::from_setting("network=4"),
            Err(InvalidChainId("network=4".to_owned()))
        );
        assert_eq!(
            RequiredChain(Some(ChainId(4))).verdict(Some(ChainId(1))),
            GateVerdict::Blocked { required: ChainId(4) }
        );
    }
}

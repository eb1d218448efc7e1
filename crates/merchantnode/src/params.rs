use bitcoin::Network;
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use std::path::PathBuf;

pub const COIN: u64 = 100_000_000;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct NetworkParams {
    /// Network the node runs on
    pub network: Network,
    /// Well-known port of the main network
    pub default_port: u16,
    /// Exact collateral value, in satoshis
    pub collateral_amount: u64,
    /// Confirmations a collateral output needs before it can be announced
    pub min_confirmations: u32,
    /// Protocol version of this node; peers announcing anything older are ignored
    pub protocol_version: i32,
    /// Depth below the tip of the block a fresh ping references
    pub ping_block_depth: u32,
    /// Oldest block, counted from the tip, a ping may reference
    pub max_ping_block_age: u32,
}

pub static MAIN: Lazy<NetworkParams> = Lazy::new(|| NetworkParams {
    network: Network::Bitcoin,
    default_port: 62583,
    collateral_amount: 1000 * COIN,
    min_confirmations: 15,
    protocol_version: 70210,
    ping_block_depth: 12,
    max_ping_block_age: 24,
});

pub static TEST: Lazy<NetworkParams> = Lazy::new(|| NetworkParams {
    network: Network::Testnet,
    ..MAIN.clone()
});

pub static REGTEST: Lazy<NetworkParams> = Lazy::new(|| NetworkParams {
    network: Network::Regtest,
    min_confirmations: 1,
    ..MAIN.clone()
});

impl Default for NetworkParams {
    fn default() -> Self {
        REGTEST.clone()
    }
}

impl NetworkParams {
    pub fn is_main(&self) -> bool {
        self.network == Network::Bitcoin
    }

    /// Main network announcements must use the well-known port, every other
    /// network must stay off it.
    pub fn is_valid_port(&self, port: u16) -> bool {
        if self.is_main() {
            port == self.default_port
        } else {
            port != self.default_port
        }
    }
}

pub fn params_value_parser(s: &str) -> eyre::Result<NetworkParams, eyre::Error> {
    Ok(match s {
        "main" => MAIN.clone(),
        "test" => TEST.clone(),
        "regtest" | "dev" => REGTEST.clone(),
        _ => {
            let raw = std::fs::read_to_string(PathBuf::from(s))?;
            serde_json::from_str(&raw)?
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn port_rules_depend_on_network() {
        assert!(MAIN.is_valid_port(62583));
        assert!(!MAIN.is_valid_port(62584));
        assert!(!TEST.is_valid_port(62583));
        assert!(REGTEST.is_valid_port(19999));
    }

    #[test]
    fn should_parse_presets() {
        assert_eq!(params_value_parser("main").unwrap(), *MAIN);
        assert_eq!(params_value_parser("dev").unwrap(), *REGTEST);
        assert_eq!(params_value_parser("test").unwrap().network, Network::Testnet);
    }

    #[test]
    fn should_parse_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"network": "testnet", "minConfirmations": 6, "collateralAmount": 5000}}"#
        )
        .unwrap();

        let params = params_value_parser(file.path().to_str().unwrap()).unwrap();
        assert_eq!(params.network, Network::Testnet);
        assert_eq!(params.min_confirmations, 6);
        assert_eq!(params.collateral_amount, 5000);
        // unspecified fields fall back to the defaults
        assert_eq!(params.protocol_version, REGTEST.protocol_version);
        assert_eq!(params.max_ping_block_age, 24);
    }

    #[test]
    fn should_reject_missing_file() {
        assert!(params_value_parser("/nonexistent/params.json").is_err());
    }
}

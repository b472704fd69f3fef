//! Per-network parameters.

use std::fmt;

use crate::money::{Amount, COIN};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Some(Self::Mainnet),
            "test" | "testnet" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// Base58Check version byte of pay-to-pubkey(-hash) addresses.
    pub pubkey_hash_version: u8,
    /// Base58Check version byte of pay-to-script-hash addresses.
    pub script_hash_version: u8,
    /// Compact form of the difficulty-1 target.
    pub max_target_bits: u32,
    pub initial_subsidy: Amount,
    pub subsidy_halving_interval: u32,
    pub target_spacing_secs: u32,
    pub default_rpc_port: u16,
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => ChainParams {
            network,
            pubkey_hash_version: 38,
            script_hash_version: 5,
            max_target_bits: 0x1d00_ffff,
            initial_subsidy: 50 * COIN,
            subsidy_halving_interval: 840_000,
            target_spacing_secs: 90,
            default_rpc_port: 8332,
        },
        Network::Testnet => ChainParams {
            network,
            pubkey_hash_version: 111,
            script_hash_version: 196,
            max_target_bits: 0x1d00_ffff,
            initial_subsidy: 50 * COIN,
            subsidy_halving_interval: 840_000,
            target_spacing_secs: 90,
            default_rpc_port: 18332,
        },
        Network::Regtest => ChainParams {
            network,
            pubkey_hash_version: 111,
            script_hash_version: 196,
            max_target_bits: 0x207f_ffff,
            initial_subsidy: 50 * COIN,
            subsidy_halving_interval: 150,
            target_spacing_secs: 90,
            default_rpc_port: 18443,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_network_aliases() {
        assert_eq!(Network::parse("main"), Some(Network::Mainnet));
        assert_eq!(Network::parse("TESTNET"), Some(Network::Testnet));
        assert_eq!(Network::parse("regtest"), Some(Network::Regtest));
        assert_eq!(Network::parse("signet"), None);
    }
}

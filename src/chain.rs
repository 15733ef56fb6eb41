//! Per-chain static configuration
//!
//! Router addresses, wrapped-native and stablecoin tokens, block timing and
//! provider endpoints for every supported chain. Loaded once at startup and
//! immutable afterwards.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;

use ethers::types::Address;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A single RPC endpoint for a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcProviderConfig {
    /// Display name (alchemy, infura, public, ...)
    pub name: String,
    pub http_url: String,
    pub ws_url: Option<String>,
    /// Lower is preferred
    pub priority: u32,
    pub is_paid: bool,
    /// Requests per second budget for the token bucket
    pub max_rps: u32,
}

impl RpcProviderConfig {
    pub fn new(name: &str, http_url: &str, ws_url: Option<&str>, priority: u32, is_paid: bool) -> Self {
        Self {
            name: name.to_string(),
            http_url: http_url.to_string(),
            ws_url: ws_url.map(String::from),
            priority,
            is_paid,
            // Paid endpoints get a larger default budget; both are overridable.
            max_rps: if is_paid { 25 } else { 5 },
        }
    }
}

/// Static configuration for one chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub providers: Vec<RpcProviderConfig>,
    pub router_v2: Address,
    pub router_v3: Address,
    pub factory_v3: Address,
    pub weth: Address,
    pub usdc: Address,
    /// Additional stablecoins beyond USDC, used for pair classification
    pub stablecoins: HashSet<Address>,
    pub block_time_ms: u64,
    pub confirmations_required: u32,
    /// Whether a private relay endpoint exists for this chain
    pub relay_url: Option<String>,
    pub is_testnet: bool,
}

impl ChainConfig {
    /// All stablecoin addresses including USDC
    pub fn all_stablecoins(&self) -> HashSet<Address> {
        let mut set = self.stablecoins.clone();
        set.insert(self.usdc);
        set
    }

    pub fn is_stablecoin(&self, token: &Address) -> bool {
        *token == self.usdc || self.stablecoins.contains(token)
    }

    pub fn supports_relay(&self) -> bool {
        self.relay_url.is_some()
    }
}

/// Immutable registry of all configured chains
#[derive(Debug)]
pub struct ChainRegistry {
    chains: HashMap<u64, ChainConfig>,
}

impl ChainRegistry {
    /// Build the registry for the requested chain ids.
    ///
    /// Every target chain must be known and carry at least one provider.
    pub fn for_chains(target_chains: &[u64], testnet_mode: bool) -> Result<Self> {
        let available = builtin_chains(testnet_mode);
        let mut chains = HashMap::new();

        for chain_id in target_chains {
            let cfg = available
                .get(chain_id)
                .ok_or(Error::UnknownChain(*chain_id))?;
            if cfg.providers.is_empty() {
                return Err(Error::Config(format!(
                    "chain {} ({}) has no RPC providers configured",
                    chain_id, cfg.name
                )));
            }
            chains.insert(*chain_id, cfg.clone());
        }

        if chains.is_empty() {
            return Err(Error::Config("no target chains configured".into()));
        }

        Ok(Self { chains })
    }

    pub fn get(&self, chain_id: u64) -> Result<&ChainConfig> {
        self.chains.get(&chain_id).ok_or(Error::UnknownChain(chain_id))
    }

    pub fn chains(&self) -> impl Iterator<Item = &ChainConfig> {
        self.chains.values()
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        self.chains.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

fn addr(s: &str) -> Address {
    Address::from_str(s).expect("valid built-in address literal")
}

fn env_or(var: &str, fallback: &str) -> String {
    std::env::var(var).unwrap_or_else(|_| fallback.to_string())
}

/// Built-in chain tables.
///
/// Provider URLs prefer environment overrides (ALCHEMY_*_URL) and fall back
/// to public endpoints so the engine starts without any paid key.
fn builtin_chains(testnet_mode: bool) -> HashMap<u64, ChainConfig> {
    let mut map = HashMap::new();

    if testnet_mode {
        map.insert(
            11155111,
            ChainConfig {
                chain_id: 11155111,
                name: "sepolia".into(),
                providers: vec![
                    RpcProviderConfig::new(
                        "alchemy",
                        &env_or("ALCHEMY_SEPOLIA_URL", "https://eth-sepolia.g.alchemy.com/v2/demo"),
                        Some(&env_or(
                            "ALCHEMY_SEPOLIA_WS_URL",
                            "wss://eth-sepolia.g.alchemy.com/v2/demo",
                        )),
                        1,
                        true,
                    ),
                    RpcProviderConfig::new("public", "https://rpc.sepolia.org", None, 3, false),
                ],
                router_v2: addr("0xeE567Fe1712Faf6149d80dA1E6934E354124CfE3"),
                router_v3: addr("0x3bFA4769FB09eefC5a80d6E87c3B9C650f7Ae48E"),
                factory_v3: addr("0x0227628f3F023bb0B980b67D528571c95c6DaC1c"),
                weth: addr("0xfFf9976782d46CC05630D1f6eBAb18b2324d6B14"),
                usdc: addr("0x1c7D4B196Cb0C7B01d743Fbc6116a902379C7238"),
                stablecoins: HashSet::new(),
                block_time_ms: 12_000,
                confirmations_required: 1,
                relay_url: None,
                is_testnet: true,
            },
        );
        map.insert(
            84532,
            ChainConfig {
                chain_id: 84532,
                name: "base-sepolia".into(),
                providers: vec![
                    RpcProviderConfig::new(
                        "alchemy",
                        &env_or("ALCHEMY_BASE_SEPOLIA_URL", "https://base-sepolia.g.alchemy.com/v2/demo"),
                        Some(&env_or(
                            "ALCHEMY_BASE_SEPOLIA_WS_URL",
                            "wss://base-sepolia.g.alchemy.com/v2/demo",
                        )),
                        1,
                        true,
                    ),
                    RpcProviderConfig::new("public", "https://sepolia.base.org", None, 3, false),
                ],
                router_v2: addr("0x1689E7B1F10000AE47eBfE339a4f69dECd19F602"),
                router_v3: addr("0x94cC0AaC535CCDB3C01d6787D6413C739ae12bc4"),
                factory_v3: addr("0x4752ba5DBc23f44D87826276BF6Fd6b1C372aD24"),
                weth: addr("0x4200000000000000000000000000000000000006"),
                usdc: addr("0x036CbD53842c5426634e7929541eC2318f3dCF7e"),
                stablecoins: HashSet::new(),
                block_time_ms: 2_000,
                confirmations_required: 1,
                relay_url: None,
                is_testnet: true,
            },
        );
    } else {
        map.insert(
            1,
            ChainConfig {
                chain_id: 1,
                name: "ethereum".into(),
                providers: vec![
                    RpcProviderConfig::new(
                        "alchemy",
                        &env_or("ALCHEMY_ETH_URL", "https://eth-mainnet.g.alchemy.com/v2/demo"),
                        Some(&env_or(
                            "ALCHEMY_ETH_WS_URL",
                            "wss://eth-mainnet.g.alchemy.com/v2/demo",
                        )),
                        1,
                        true,
                    ),
                    RpcProviderConfig::new("ankr", "https://rpc.ankr.com/eth", None, 2, false),
                    RpcProviderConfig::new("public", "https://eth.llamarpc.com", None, 3, false),
                ],
                router_v2: addr("0x7a250d5630B4cF539739dF2C5dAcb4c659F2488D"),
                router_v3: addr("0xE592427A0AEce92De3Edee1F18E0157C05861564"),
                factory_v3: addr("0x1F98431c8aD98523631AE4a59f267346ea31F984"),
                weth: addr("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2"),
                usdc: addr("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
                stablecoins: [
                    addr("0xdAC17F958D2ee523a2206206994597C13D831ec7"), // USDT
                    addr("0x6B175474E89094C44Da98b954EedeAC495271d0F"), // DAI
                    addr("0x853d955aCEf822Db058eb8505911ED77F175b99e"), // FRAX
                ]
                .into_iter()
                .collect(),
                block_time_ms: 12_000,
                confirmations_required: 2,
                relay_url: Some(env_or("RELAY_ETH_URL", "https://relay.flashbots.net")),
                is_testnet: false,
            },
        );
        map.insert(
            8453,
            ChainConfig {
                chain_id: 8453,
                name: "base".into(),
                providers: vec![
                    RpcProviderConfig::new(
                        "alchemy",
                        &env_or("ALCHEMY_BASE_URL", "https://base-mainnet.g.alchemy.com/v2/demo"),
                        Some(&env_or(
                            "ALCHEMY_BASE_WS_URL",
                            "wss://base-mainnet.g.alchemy.com/v2/demo",
                        )),
                        1,
                        true,
                    ),
                    RpcProviderConfig::new("public", "https://mainnet.base.org", None, 3, false),
                ],
                router_v2: addr("0x4752ba5DBc23f44D87826276BF6Fd6b1C372aD24"),
                router_v3: addr("0x2626664c2603336E57B271c5C0b26F421741e481"),
                factory_v3: addr("0x33128a8fC17869897dcE68Ed026d694621f6FDfD"),
                weth: addr("0x4200000000000000000000000000000000000006"),
                usdc: addr("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913"),
                stablecoins: [
                    addr("0xd9aAEc86B65D86f6A7B5B1b0c42FFA531710b6CA"), // USDbC
                ]
                .into_iter()
                .collect(),
                block_time_ms: 2_000,
                confirmations_required: 3,
                relay_url: None,
                is_testnet: false,
            },
        );
        map.insert(
            42161,
            ChainConfig {
                chain_id: 42161,
                name: "arbitrum".into(),
                providers: vec![
                    RpcProviderConfig::new(
                        "alchemy",
                        &env_or("ALCHEMY_ARB_URL", "https://arb-mainnet.g.alchemy.com/v2/demo"),
                        Some(&env_or(
                            "ALCHEMY_ARB_WS_URL",
                            "wss://arb-mainnet.g.alchemy.com/v2/demo",
                        )),
                        1,
                        true,
                    ),
                    RpcProviderConfig::new("public", "https://arb1.arbitrum.io/rpc", None, 3, false),
                ],
                router_v2: addr("0x4752ba5DBc23f44D87826276BF6Fd6b1C372aD24"),
                router_v3: addr("0xE592427A0AEce92De3Edee1F18E0157C05861564"),
                factory_v3: addr("0x1F98431c8aD98523631AE4a59f267346ea31F984"),
                weth: addr("0x82aF49447D8a07e3bd95BD0d56f35241523fBab1"),
                usdc: addr("0xaf88d065e77c8cC2239327C5EDb3A432268e5831"),
                stablecoins: [
                    addr("0xFd086bC7CD5C481DCC9C85ebE478A1C0b69FCbb9"), // USDT
                    addr("0xDA10009cBd5D07dd0CeCc66161FC93D7c9000da1"), // DAI
                ]
                .into_iter()
                .collect(),
                block_time_ms: 250,
                confirmations_required: 5,
                relay_url: None,
                is_testnet: false,
            },
        );
    }

    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_registry() {
        let registry = ChainRegistry::for_chains(&[1, 8453], false).unwrap();
        assert_eq!(registry.len(), 2);

        let eth = registry.get(1).unwrap();
        assert_eq!(eth.name, "ethereum");
        assert!(eth.supports_relay());
        assert!(eth.providers.len() >= 2);

        let base = registry.get(8453).unwrap();
        assert!(!base.supports_relay());
        assert_eq!(base.block_time_ms, 2_000);
    }

    #[test]
    fn test_unknown_chain_rejected() {
        let err = ChainRegistry::for_chains(&[99999], false).unwrap_err();
        assert!(matches!(err, Error::UnknownChain(99999)));
    }

    #[test]
    fn test_testnet_mode_switches_tables() {
        let registry = ChainRegistry::for_chains(&[11155111], true).unwrap();
        assert!(registry.get(11155111).unwrap().is_testnet);
        // Mainnet chains are not available in testnet mode
        assert!(ChainRegistry::for_chains(&[1], true).is_err());
    }

    #[test]
    fn test_stablecoin_classification() {
        let registry = ChainRegistry::for_chains(&[1], false).unwrap();
        let eth = registry.get(1).unwrap();
        assert!(eth.is_stablecoin(&eth.usdc));
        let usdt = addr("0xdAC17F958D2ee523a2206206994597C13D831ec7");
        assert!(eth.is_stablecoin(&usdt));
        assert!(!eth.is_stablecoin(&eth.weth));
    }

    #[test]
    fn test_paid_provider_rate_budget() {
        let paid = RpcProviderConfig::new("a", "http://x", None, 1, true);
        let free = RpcProviderConfig::new("b", "http://y", None, 2, false);
        assert!(paid.max_rps > free.max_rps);
    }
}

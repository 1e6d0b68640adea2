/// Daemon configuration from environment variables
///
/// Network, Esplora endpoint, data directory, chain list and the session
/// timing knobs. Defaults to Signet.

use custody_session::{ChainConfig, IdleTimeout, SessionConfig};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::WalletError;

/// One entry of the optional chains file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ChainEntry {
    pub symbol: String,
    pub chain_id: u64,
    /// "bitcoin", "testnet", "signet" or "regtest"
    pub network: String,
    /// Esplora base URL for this chain, overriding `ESPLORA_URL`
    #[serde(default)]
    pub esplora_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChainsFile {
    #[serde(default)]
    chains: Vec<ChainEntry>,
}

#[derive(Clone, Debug)]
pub struct WalletConfig {
    pub bind_address: String,
    /// Directory holding the JSON namespaces and the encrypted seeds
    pub data_dir: PathBuf,
    /// Network of the default chain when no chains file is given
    pub bitcoin_network: bitcoin::Network,
    pub esplora_url: String,
    pub chains: Vec<ChainEntry>,
    pub idle_timeout: IdleTimeout,
    pub stale_threshold: Duration,
    pub oracle_timeout: Duration,
    /// Empty means any origin
    pub allowed_origins: Vec<String>,
}

impl WalletConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BIND_ADDRESS`: listen address (default `0.0.0.0:3000`)
    /// - `WALLET_DATA_DIR`: storage directory (default `./wallet-data`)
    /// - `BITCOIN_NETWORK`: "signet" (default), "regtest", "testnet" or "mainnet"
    /// - `ESPLORA_URL`: Esplora API endpoint (network-specific default)
    /// - `CHAINS_FILE`: optional TOML file with `[[chains]]` entries
    /// - `IDLE_TIMEOUT_MINUTES`: minutes or "never" (default 15)
    /// - `STALE_THRESHOLD_SECS`: balance staleness threshold (default 300)
    /// - `ORACLE_TIMEOUT_SECS`: per-balance fetch timeout (default 10)
    /// - `ALLOWED_ORIGINS`: comma-separated CORS origins (default any)
    ///
    /// # Examples
    ///
    /// ```bash
    /// # Signet with defaults
    /// cargo run -p custody-wallet
    ///
    /// # Regtest against a local Esplora
    /// BITCOIN_NETWORK=regtest ESPLORA_URL=http://localhost:3002 cargo run -p custody-wallet
    /// ```
    pub fn from_env() -> Result<Self, WalletError> {
        let defaults = Self::default();

        let bind_address = env::var("BIND_ADDRESS").unwrap_or(defaults.bind_address);

        let data_dir = env::var("WALLET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        log::info!("Wallet data directory: {}", data_dir.display());

        let network_str = env::var("BITCOIN_NETWORK")
            .unwrap_or_else(|_| "signet".to_string())
            .to_lowercase();
        let bitcoin_network = match parse_network(&network_str) {
            Some(network) => network,
            None => {
                log::warn!("Unknown network '{}', defaulting to Signet", network_str);
                bitcoin::Network::Signet
            }
        };
        log::info!("Using {} network", bitcoin_network);

        let esplora_url = env::var("ESPLORA_URL")
            .unwrap_or_else(|_| default_esplora_url(bitcoin_network).to_string());
        log::info!("Esplora URL: {}", esplora_url);

        let chains = match env::var("CHAINS_FILE") {
            Ok(path) => {
                let chains = load_chains_file(Path::new(&path))?;
                log::info!("Loaded {} chain(s) from {}", chains.len(), path);
                chains
            }
            Err(_) => vec![default_chain(bitcoin_network)],
        };

        let idle_timeout = match env::var("IDLE_TIMEOUT_MINUTES") {
            Ok(value) => IdleTimeout::parse(&value).ok_or_else(|| {
                WalletError::Config(format!("IDLE_TIMEOUT_MINUTES: invalid value '{}'", value))
            })?,
            Err(_) => defaults.idle_timeout,
        };
        log::info!("Idle timeout: {:?}", idle_timeout);

        let stale_threshold = secs_var("STALE_THRESHOLD_SECS")?.unwrap_or(defaults.stale_threshold);
        let oracle_timeout = secs_var("ORACLE_TIMEOUT_SECS")?.unwrap_or(defaults.oracle_timeout);

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .map(|origins| split_origins(&origins))
            .unwrap_or_default();

        Ok(Self {
            bind_address,
            data_dir,
            bitcoin_network,
            esplora_url,
            chains,
            idle_timeout,
            stale_threshold,
            oracle_timeout,
            allowed_origins,
        })
    }

    /// Core session configuration for the configured chains.
    pub fn session_config(&self) -> SessionConfig {
        let chains = self
            .chains
            .iter()
            .map(|entry| ChainConfig {
                symbol: entry.symbol.clone(),
                chain_id: entry.chain_id,
                rpc_url: entry.esplora_url.clone(),
            })
            .collect();

        SessionConfig {
            chains,
            stale_threshold: self.stale_threshold,
            idle_timeout: self.idle_timeout,
            oracle_timeout: self.oracle_timeout,
            ..SessionConfig::default()
        }
    }

    /// Symbol to network table for the address deriver.
    pub fn chain_networks(&self) -> Result<Vec<(String, bitcoin::Network)>, WalletError> {
        self.chains
            .iter()
            .map(|entry| {
                parse_network(&entry.network)
                    .map(|network| (entry.symbol.clone(), network))
                    .ok_or_else(|| {
                        WalletError::Config(format!(
                            "chain {}: unknown network '{}'",
                            entry.symbol, entry.network
                        ))
                    })
            })
            .collect()
    }
}

impl Default for WalletConfig {
    /// Default configuration (Signet)
    fn default() -> Self {
        let session = SessionConfig::default();
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            data_dir: PathBuf::from("./wallet-data"),
            bitcoin_network: bitcoin::Network::Signet,
            esplora_url: default_esplora_url(bitcoin::Network::Signet).to_string(),
            chains: vec![default_chain(bitcoin::Network::Signet)],
            idle_timeout: session.idle_timeout,
            stale_threshold: session.stale_threshold,
            oracle_timeout: session.oracle_timeout,
            allowed_origins: Vec::new(),
        }
    }
}

pub fn parse_network(value: &str) -> Option<bitcoin::Network> {
    match value.trim().to_lowercase().as_str() {
        "bitcoin" | "mainnet" => Some(bitcoin::Network::Bitcoin),
        "testnet" => Some(bitcoin::Network::Testnet),
        "signet" | "" => Some(bitcoin::Network::Signet),
        "regtest" => Some(bitcoin::Network::Regtest),
        _ => None,
    }
}

fn default_esplora_url(network: bitcoin::Network) -> &'static str {
    match network {
        bitcoin::Network::Bitcoin => "https://mempool.space/api",
        bitcoin::Network::Testnet => "https://mempool.space/testnet/api",
        bitcoin::Network::Regtest => "http://localhost:3002",
        _ => "https://mempool.space/signet/api",
    }
}

fn default_chain(network: bitcoin::Network) -> ChainEntry {
    let (symbol, chain_id) = match network {
        bitcoin::Network::Bitcoin => ("BTC", 0),
        bitcoin::Network::Testnet => ("TBTC", 1),
        bitcoin::Network::Regtest => ("RBTC", 3),
        _ => ("SBTC", 2),
    };
    ChainEntry {
        symbol: symbol.to_string(),
        chain_id,
        network: network.to_string(),
        esplora_url: None,
    }
}

fn load_chains_file(path: &Path) -> Result<Vec<ChainEntry>, WalletError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| WalletError::Config(format!("{}: {}", path.display(), e)))?;
    parse_chains(&contents)
}

pub fn parse_chains(contents: &str) -> Result<Vec<ChainEntry>, WalletError> {
    let file: ChainsFile =
        toml::from_str(contents).map_err(|e| WalletError::Config(e.to_string()))?;
    if file.chains.is_empty() {
        return Err(WalletError::Config("chains file lists no chains".into()));
    }
    Ok(file.chains)
}

fn secs_var(name: &str) -> Result<Option<Duration>, WalletError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| WalletError::Config(format!("{}: invalid value '{}'", name, value))),
        Err(_) => Ok(None),
    }
}

fn split_origins(origins: &str) -> Vec<String> {
    origins
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_signet() {
        let config = WalletConfig::default();
        assert!(matches!(config.bitcoin_network, bitcoin::Network::Signet));
        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.chains[0].symbol, "SBTC");
        assert_eq!(
            config.chain_networks().unwrap(),
            vec![("SBTC".to_string(), bitcoin::Network::Signet)]
        );
    }

    #[test]
    fn test_parse_chains_file() {
        let chains = parse_chains(
            r#"
            [[chains]]
            symbol = "BTC"
            chain_id = 0
            network = "bitcoin"

            [[chains]]
            symbol = "TBTC"
            chain_id = 1
            network = "testnet"
            esplora_url = "http://localhost:3002"
            "#,
        )
        .unwrap();
        assert_eq!(chains.len(), 2);
        assert_eq!(chains[1].esplora_url.as_deref(), Some("http://localhost:3002"));

        let config = WalletConfig {
            chains,
            ..Default::default()
        };
        let session = config.session_config();
        assert_eq!(session.chain_symbols(), vec!["BTC", "TBTC"]);
        assert_eq!(session.chain("BTC").unwrap().rpc_url, None);
        assert_eq!(
            session.chain("TBTC").unwrap().rpc_url.as_deref(),
            Some("http://localhost:3002")
        );
    }

    #[test]
    fn test_empty_or_bad_chains_file_rejected() {
        assert!(parse_chains("").is_err());
        assert!(parse_chains("[[chains]]\nsymbol = 3").is_err());

        let config = WalletConfig {
            chains: vec![ChainEntry {
                symbol: "XYZ".into(),
                chain_id: 9,
                network: "moon".into(),
                esplora_url: None,
            }],
            ..Default::default()
        };
        assert!(matches!(
            config.chain_networks(),
            Err(WalletError::Config(_))
        ));
    }

    #[test]
    fn test_split_origins() {
        assert_eq!(
            split_origins(" https://a.example, ,https://b.example "),
            vec!["https://a.example", "https://b.example"]
        );
        assert!(split_origins("").is_empty());
    }
}

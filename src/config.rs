/// Session configuration
///
/// Chains to derive, staleness threshold, idle lock timeout and the
/// per-call timeouts applied to every external collaborator.

use std::time::Duration;

use crate::types::ChainConfig;

/// Idle auto-lock window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleTimeout {
    Minutes(u32),
    Never,
}

impl IdleTimeout {
    /// `Never` maps to `Duration::MAX`; the idle timer treats an
    /// unrepresentable deadline as "no deadline".
    pub fn as_duration(&self) -> Duration {
        match self {
            IdleTimeout::Minutes(m) => Duration::from_secs(u64::from(*m) * 60),
            IdleTimeout::Never => Duration::MAX,
        }
    }

    /// Parse "never" or a number of minutes.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("never") {
            return Some(IdleTimeout::Never);
        }
        value.parse::<u32>().ok().map(IdleTimeout::Minutes)
    }
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Chains derived for every account index
    pub chains: Vec<ChainConfig>,
    /// Age after which the cached balances are flagged stale
    pub stale_threshold: Duration,
    pub idle_timeout: IdleTimeout,
    /// Per (address, chain) balance fetch
    pub oracle_timeout: Duration,
    /// Per device transport call
    pub device_timeout: Duration,
    /// Per PIN verification (may run a slow KDF)
    pub pin_timeout: Duration,
}

impl SessionConfig {
    pub fn with_chains(chains: Vec<ChainConfig>) -> Self {
        Self {
            chains,
            ..Default::default()
        }
    }

    pub fn chain_symbols(&self) -> Vec<String> {
        self.chains.iter().map(|c| c.symbol.clone()).collect()
    }

    pub fn chain(&self, symbol: &str) -> Option<&ChainConfig> {
        self.chains.iter().find(|c| c.symbol == symbol)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            chains: vec![ChainConfig::new("BTC", 0)],
            stale_threshold: Duration::from_secs(5 * 60),
            idle_timeout: IdleTimeout::Minutes(15),
            oracle_timeout: Duration::from_secs(10),
            device_timeout: Duration::from_secs(30),
            pin_timeout: Duration::from_secs(30),
        }
    }
}

use async_trait::async_trait;
use bitcoin::amount::{Amount, Denomination};
use custody_session::{BalanceOracle, SessionError};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

#[derive(Debug, Default, Deserialize)]
struct TxoStats {
    #[serde(default)]
    funded_txo_sum: u64,
    #[serde(default)]
    spent_txo_sum: u64,
}

/// Subset of Esplora's `GET /address/:address` response.
#[derive(Debug, Deserialize)]
struct AddressInfo {
    #[serde(default)]
    chain_stats: TxoStats,
    #[serde(default)]
    mempool_stats: TxoStats,
}

impl AddressInfo {
    /// Confirmed plus pending balance in satoshis.
    fn balance_sats(&self) -> u64 {
        let funded = self.chain_stats.funded_txo_sum + self.mempool_stats.funded_txo_sum;
        let spent = self.chain_stats.spent_txo_sum + self.mempool_stats.spent_txo_sum;
        funded.saturating_sub(spent)
    }
}

/// Decimal BTC string without trailing zeros ("1.5", "0.00001", "0").
pub fn format_btc(sats: u64) -> String {
    let formatted = Amount::from_sat(sats).to_string_in(Denomination::Bitcoin);
    if !formatted.contains('.') {
        return formatted;
    }
    formatted
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

/// Balance oracle backed by an Esplora HTTP API.
pub struct EsploraOracle {
    client: Client,
    base_url: String,
}

impl EsploraOracle {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl BalanceOracle for EsploraOracle {
    async fn get_balance(
        &self,
        address: &str,
        _chain_id: u64,
        chain_symbol: &str,
        rpc_url_override: Option<&str>,
    ) -> Result<String, SessionError> {
        let base = rpc_url_override.unwrap_or(&self.base_url);
        let url = format!("{}/address/{}", base.trim_end_matches('/'), address);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SessionError::Network(format!("{}: {}", chain_symbol, e)))?;

        // Esplora answers 404 for addresses it has never seen
        if response.status() == StatusCode::NOT_FOUND {
            return Ok("0".to_string());
        }
        if !response.status().is_success() {
            return Err(SessionError::Network(format!(
                "{}: Esplora returned {} for {}",
                chain_symbol,
                response.status(),
                address
            )));
        }

        let info: AddressInfo = response
            .json()
            .await
            .map_err(|e| SessionError::Network(format!("{}: bad response: {}", chain_symbol, e)))?;

        let balance = format_btc(info.balance_sats());
        log::debug!("{} balance for {}: {}", chain_symbol, address, balance);
        Ok(balance)
    }
}

#![allow(dead_code)]

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use custody_session::BackendCoordinator;
use custody_wallet::{
    api::server,
    config::ChainEntry,
    manager,
    storage::KdfParams,
    WalletConfig,
};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

pub const PIN: &str = "1234";
pub const ABANDON: &str = "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// In-process stand-in for an Esplora `/address/:address` endpoint.
#[derive(Default)]
pub struct FakeEsplora {
    balances: Mutex<HashMap<String, u64>>,
    failing: Mutex<HashSet<String>>,
    hits: AtomicUsize,
}

impl FakeEsplora {
    pub fn set_balance(&self, address: &str, sats: u64) {
        self.balances
            .lock()
            .unwrap()
            .insert(address.to_string(), sats);
    }

    pub fn fail_address(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

async fn address_handler(
    State(chain): State<Arc<FakeEsplora>>,
    Path(address): Path<String>,
) -> Response {
    chain.hits.fetch_add(1, Ordering::SeqCst);
    if chain.failing.lock().unwrap().contains(&address) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "backend unavailable").into_response();
    }
    let sats = chain.balances.lock().unwrap().get(&address).copied();
    match sats {
        Some(sats) => Json(json!({
            "address": address,
            "chain_stats": {"funded_txo_sum": sats, "spent_txo_sum": 0, "tx_count": 1},
            "mempool_stats": {"funded_txo_sum": 0, "spent_txo_sum": 0, "tx_count": 0}
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, "Address not found").into_response(),
    }
}

/// Serves `app` on an ephemeral local port and returns its base URL.
pub async fn spawn_app(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

pub async fn spawn_fake_esplora() -> (Arc<FakeEsplora>, String) {
    let chain = Arc::new(FakeEsplora::default());
    let app = Router::new()
        .route("/address/:address", get(address_handler))
        .with_state(chain.clone());
    let url = spawn_app(app).await;
    (chain, url)
}

/// Signet-only daemon configuration rooted at `data_dir`.
pub fn signet_config(data_dir: &std::path::Path, esplora_url: &str) -> WalletConfig {
    WalletConfig {
        data_dir: data_dir.to_path_buf(),
        esplora_url: esplora_url.to_string(),
        chains: vec![ChainEntry {
            symbol: "SBTC".into(),
            chain_id: 2,
            network: "signet".into(),
            esplora_url: None,
        }],
        ..WalletConfig::default()
    }
}

/// A running daemon backed by files under a temp dir.
pub struct Daemon {
    pub url: String,
    pub coordinator: BackendCoordinator,
    pub esplora: Arc<FakeEsplora>,
    pub client: reqwest::Client,
    pub data_dir: tempfile::TempDir,
}

impl Daemon {
    pub async fn start() -> Self {
        init_logging();
        let data_dir = tempfile::tempdir().unwrap();
        let (esplora, esplora_url) = spawn_fake_esplora().await;
        let config = signet_config(data_dir.path(), &esplora_url);

        let coordinator = manager::build_coordinator(&config, KdfParams::TESTING).unwrap();
        coordinator.initialize().await.unwrap();
        let app = server::router(coordinator.clone(), &config).unwrap();
        let url = spawn_app(app).await;

        Self {
            url,
            coordinator,
            esplora,
            client: reqwest::Client::new(),
            data_dir,
        }
    }

    pub async fn get(&self, path: &str) -> (StatusCode, serde_json::Value) {
        let response = self
            .client
            .get(format!("{}{}", self.url, path))
            .send()
            .await
            .unwrap();
        read(response).await
    }

    pub async fn post(&self, path: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = self
            .client
            .post(format!("{}{}", self.url, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        read(response).await
    }

    pub async fn put(&self, path: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let response = self
            .client
            .put(format!("{}{}", self.url, path))
            .json(&body)
            .send()
            .await
            .unwrap();
        read(response).await
    }

    pub async fn delete(&self, path: &str) -> (StatusCode, serde_json::Value) {
        let response = self
            .client
            .delete(format!("{}{}", self.url, path))
            .send()
            .await
            .unwrap();
        read(response).await
    }
}

async fn read(response: reqwest::Response) -> (StatusCode, serde_json::Value) {
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    let body = response.json().await.unwrap_or(serde_json::Value::Null);
    (status, body)
}

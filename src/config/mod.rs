use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use alloy_primitives::{address, Address};
use referral_tracker::{BackfillPlan, ChunkFailure, ExhaustionPolicy, TrackerSettings};
use serde::{Deserialize, Serialize};

use crate::error::CliError;

pub const POLYGON_CHAIN_ID: u64 = 137;
/// Native USDC on Polygon PoS.
pub const USDC_TOKEN: Address = address!("3c499c542cEF5E3811e1192ce70d8cC03d5c3359");
/// ReferPay minting contract; pays referral rewards in USDC.
pub const REFERPAY_CONTRACT: Address = address!("19C1d81A794411a85666754839B865cBFb61f724");
pub const RPC_URL_ENV: &str = "REFERPAY_RPC_URL";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub token: Address,
    pub payout_source: Address,
    pub cache_file: PathBuf,
    pub poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub rpc_retries: u32,
    pub backfill_budget_secs: u64,
    pub debounce_ms: u64,
    pub cache_ttl_secs: u64,
    pub chunk_failure: ChunkFailure,
    pub exhaustion: ExhaustionPolicy,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://polygon-rpc.com".to_string(),
            chain_id: POLYGON_CHAIN_ID,
            token: USDC_TOKEN,
            payout_source: REFERPAY_CONTRACT,
            cache_file: PathBuf::from("referpay-cache.json"),
            poll_interval_ms: 4_000,
            request_timeout_secs: 30,
            rpc_retries: 3,
            backfill_budget_secs: 300,
            debounce_ms: 500,
            cache_ttl_secs: 300,
            chunk_failure: ChunkFailure::Skip,
            exhaustion: ExhaustionPolicy::KeepLastKnown,
        }
    }
}

impl AppConfig {
    /// Defaults, overlaid with the JSON file at `path` if given. Missing keys
    /// keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, CliError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let bytes = fs::read(path).map_err(|source| CliError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| CliError::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(RPC_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.rpc_url = url.trim().to_string();
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn tracker_settings(&self) -> TrackerSettings {
        let mut settings = TrackerSettings::new(self.token, self.payout_source);
        settings.debounce_ms = self.debounce_ms;
        settings.cache_ttl_ms = self.cache_ttl_secs.saturating_mul(1_000);
        settings.exhaustion = self.exhaustion;
        settings.plan = BackfillPlan::default()
            .with_chunk_failure(self.chunk_failure)
            .with_time_budget_ms(self.backfill_budget_secs.saturating_mul(1_000));
        settings
    }
}

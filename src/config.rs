//! Configuration management for the points relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub token_sync: TokenSyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: String,
    pub rpc_urls: Vec<String>,
    /// Env var holding this chain's signing key, overrides `wallet.private_key_env`
    pub signing_key_env: Option<String>,
    /// Contract addresses by role (`token`, `cross_chain`, `points`, ...)
    #[serde(default)]
    pub contracts: HashMap<String, String>,
    pub enabled: bool,
}

impl ChainConfig {
    /// Look up a contract address by role
    pub fn contract(&self, role: &str) -> Option<&str> {
        self.contracts
            .get(role)
            .map(String::as_str)
            .filter(|a| !a.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: Option<String>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: Some("RELAYER_PRIVATE_KEY".to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub contract_invoke_interval_secs: u64,
    pub token_sync_interval_secs: u64,
    pub max_concurrent_per_tick: usize,
    /// Failed workflows stop retrying once this many retries happened; unlimited when absent
    pub max_retry_count: Option<u32>,
    pub rpc_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            contract_invoke_interval_secs: 10,
            token_sync_interval_secs: 30,
            max_concurrent_per_tick: 32,
            max_retry_count: None,
            rpc_timeout_secs: 15,
        }
    }
}

impl SchedulerConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub enabled: bool,
    pub chain_id: String,
    /// Role of the settlement contract in the chain's `contracts` table
    pub contract: String,
    pub method: String,
    pub biz_type: String,
    pub action_name: String,
    pub batch_size: usize,
    pub page_size: usize,
    pub interval_secs: u64,
    pub lease_ttl_secs: u64,
    /// Past days re-checked every tick, so dates missed while down are settled
    pub lookback_days: u32,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            chain_id: String::new(),
            contract: "points".to_string(),
            method: "BatchSettle".to_string(),
            biz_type: "points-settle".to_string(),
            action_name: "Settle".to_string(),
            batch_size: 10,
            page_size: 500,
            interval_secs: 3600,
            lease_ttl_secs: 1800,
            lookback_days: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TokenSyncConfig {
    pub enabled: bool,
    pub source_chain_id: String,
    pub target_chain_id: String,
    /// First height scanned when no watermark is stored yet
    pub start_height: u64,
    /// Maximum number of heights scanned per tick
    pub search_window: u64,
}

impl Default for TokenSyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source_chain_id: String::new(),
            target_chain_id: String::new(),
            start_height: 1,
            search_window: 1000,
        }
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("POINTS_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from a specific file
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        // At least one chain must be enabled
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
        }

        if self.scheduler.contract_invoke_interval_secs == 0
            || self.scheduler.token_sync_interval_secs == 0
        {
            anyhow::bail!("Scheduler intervals must be greater than zero");
        }
        if self.scheduler.max_concurrent_per_tick == 0 {
            anyhow::bail!("scheduler.max_concurrent_per_tick must be greater than zero");
        }

        if self.settlement.enabled {
            if !(1..=100).contains(&self.settlement.batch_size) {
                anyhow::bail!(
                    "settlement.batch_size must be between 1 and 100, got {}",
                    self.settlement.batch_size
                );
            }
            if self.settlement.page_size == 0 {
                anyhow::bail!("settlement.page_size must be greater than zero");
            }
            if self.settlement.lookback_days == 0 {
                anyhow::bail!("settlement.lookback_days must be greater than zero");
            }
            let chain = self
                .get_chain_by_id(&self.settlement.chain_id)
                .with_context(|| {
                    format!("Settlement chain {} is not configured", self.settlement.chain_id)
                })?;
            if chain.contract(&self.settlement.contract).is_none() {
                tracing::warn!(
                    "Chain {} has no '{}' contract - settlement workflows will fail to submit",
                    chain.chain_id,
                    self.settlement.contract
                );
            }
        }

        if self.token_sync.enabled {
            for chain_id in [
                &self.token_sync.source_chain_id,
                &self.token_sync.target_chain_id,
            ] {
                if self.get_chain_by_id(chain_id).is_none() {
                    anyhow::bail!("Token sync chain {} is not configured", chain_id);
                }
            }
            if self.token_sync.source_chain_id == self.token_sync.target_chain_id {
                anyhow::bail!("Token sync source and target chains must differ");
            }
            if self.token_sync.search_window == 0 {
                anyhow::bail!("token_sync.search_window must be greater than zero");
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get enabled chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: &str) -> Option<&ChainConfig> {
        self.chains
            .values()
            .find(|c| c.enabled && c.chain_id == chain_id)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures<'_>| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}

//! Configuration management for the HTLC coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Environment variable pointing at the configuration file
pub const CONFIG_ENV: &str = "HTLC_COORDINATOR_CONFIG";

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub swap: SwapPolicyConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    pub poll_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub health_check_interval_secs: u64,
    /// System identifier attached to settlement instructions
    #[serde(default = "default_system_id")]
    pub settlement_system_id: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub backend: StorageBackend,
    #[serde(default)]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_connections")]
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

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChainBackend {
    /// JSON-RPC endpoints
    Rpc,
    /// In-process chain, for local development
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub backend: ChainBackend,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    pub escrow_contract_address: String,
    pub deployer_address: String,
    pub confirmation_blocks: u64,
    #[serde(default = "default_log_batch_size")]
    pub log_batch_size: u64,
    /// Genesis validators for the memory backend
    #[serde(default)]
    pub validators: Vec<String>,
    /// Block interval of the memory backend
    #[serde(default = "default_block_time_ms")]
    pub block_time_ms: u64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub private_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            private_key_env: "COORDINATOR_PRIVATE_KEY".to_string(),
        }
    }
}

/// Expiry rules applied when a swap is negotiated
#[derive(Debug, Clone, Deserialize)]
pub struct SwapPolicyConfig {
    /// Minimum distance between the current height and either expiry
    pub min_expiry_delta_blocks: u64,
    /// Minimum `T_A - T_B`
    pub min_expiry_gap_blocks: u64,
    /// Blocks before expiry after which a release is no longer attempted
    pub claim_margin_blocks: u64,
}

impl Default for SwapPolicyConfig {
    fn default() -> Self {
        Self {
            min_expiry_delta_blocks: 10,
            min_expiry_gap_blocks: 10,
            claim_margin_blocks: 2,
        }
    }
}

fn default_system_id() -> String {
    "htlc-coordinator".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_log_batch_size() -> u64 {
    1000
}

fn default_block_time_ms() -> u64 {
    1000
}

impl Settings {
    /// Load settings from the file named by `HTLC_COORDINATOR_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    /// Parse settings from TOML text
    pub fn parse(config_str: &str) -> Result<Self> {
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().len() < 2 {
            anyhow::bail!("At least two chains must be enabled for a swap");
        }

        for (name, chain) in self.enabled_chains() {
            if chain.backend == ChainBackend::Rpc && chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            if chain.escrow_contract_address.is_empty() || chain.deployer_address.is_empty() {
                anyhow::bail!("Chain {} has no escrow deployment configured", name);
            }
            if chain.log_batch_size == 0 {
                anyhow::bail!("Chain {} has a zero log batch size", name);
            }
            if chain.backend == ChainBackend::Memory && chain.block_time_ms == 0 {
                anyhow::bail!("Chain {} has a zero block time", name);
            }
        }

        if self.database.backend == StorageBackend::Postgres && self.database.url.is_empty() {
            anyhow::bail!("Postgres storage selected but no database url configured");
        }

        if self.coordinator.retry_delay_ms > self.coordinator.max_retry_delay_ms {
            anyhow::bail!("retry_delay_ms must not exceed max_retry_delay_ms");
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by chain ID
    pub fn get_chain_by_id(&self, chain_id: u64) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.chain_id == chain_id)
    }
}

lazy_static! {
    static ref ENV_VAR: Regex = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

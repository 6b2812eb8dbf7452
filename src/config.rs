//! Configuration management for the bridge relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use crate::asset::ChainKind;
use crate::role::Role;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
    #[serde(default)]
    pub multisig: MultisigConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub role: Role,
    #[serde(default)]
    pub network: Network,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.starts_with("memory://")
    }
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
    pub kind: ChainKind,
    #[serde(default)]
    pub client: ClientKind,
    pub rpc_urls: Vec<String>,
    #[serde(default)]
    pub contract_address: String,
    /// Gateway used to build transactions for EVM chains
    #[serde(default)]
    pub builder_url: Option<String>,
    pub confirm_number: u64,
    #[serde(default)]
    pub start_block_height: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_recipient_len")]
    pub max_recipient_len: usize,
    #[serde(default)]
    pub assets: Vec<AssetRuleConfig>,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    Evm,
    #[default]
    Gateway,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssetRuleConfig {
    pub address: String,
    #[serde(default = "zero")]
    pub minimal_amount: String,
    #[serde(default = "zero")]
    pub bridge_fee_in: String,
    #[serde(default = "zero")]
    pub bridge_fee_out: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultisigHostConfig {
    pub name: String,
    pub url: String,
    /// Signer key hash, as reported in logs
    pub address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MultisigConfig {
    pub threshold: usize,
    pub hosts: Vec<MultisigHostConfig>,
    pub collector_key_hashes: Vec<String>,
    pub round_interval_ms: u64,
    pub private_key: Option<String>,
}

impl Default for MultisigConfig {
    fn default() -> Self {
        Self {
            threshold: 0,
            hosts: Vec::new(),
            collector_key_hashes: Vec::new(),
            round_interval_ms: 3000,
            private_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    pub batch_number: usize,
    pub max_wait_secs: u64,
    pub commit_timeout_secs: u64,
    pub status_poll_interval_ms: u64,
    pub owner_lock_hash: String,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_number: 100,
            max_wait_secs: 60,
            commit_timeout_secs: 200,
            status_poll_interval_ms: 1000,
            owner_lock_hash: String::new(),
        }
    }
}

fn default_retry_interval_ms() -> u64 {
    3000
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_batch_size() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    5000
}

fn default_max_recipient_len() -> usize {
    1024
}

fn zero() -> String {
    "0".to_string()
}

impl Settings {
    /// Load settings from the file named by `FORCE_BRIDGE_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("FORCE_BRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        for (name, chain) in &self.chains {
            if chain.enabled {
                if chain.rpc_urls.is_empty() {
                    anyhow::bail!("Chain {} has no RPC URLs configured", name);
                }
                if chain.client == ClientKind::Evm && chain.contract_address.is_empty() {
                    anyhow::bail!("EVM chain {} has no contract address", name);
                }
                if chain.batch_size == 0 {
                    anyhow::bail!("Chain {} batch_size must be positive", name);
                }
            }
        }

        let mut kinds: Vec<_> = self.enabled_chains().iter().map(|(_, c)| c.kind).collect();
        kinds.sort();
        kinds.dedup();
        if kinds.len() != self.enabled_chains().len() {
            anyhow::bail!("Each chain kind may be configured only once");
        }

        match self.relayer.role {
            Role::Collector => {
                let m = &self.multisig;
                if m.threshold == 0 || m.threshold > m.hosts.len() {
                    anyhow::bail!(
                        "multisig threshold {} invalid for {} hosts",
                        m.threshold,
                        m.hosts.len()
                    );
                }
                if m.private_key.is_none() {
                    anyhow::bail!("collector role requires multisig.private_key");
                }
            }
            Role::Verifier => {
                if self.multisig.private_key.is_none() {
                    anyhow::bail!("verifier role requires multisig.private_key");
                }
                if self.multisig.collector_key_hashes.is_empty() {
                    anyhow::bail!("verifier role requires multisig.collector_key_hashes");
                }
            }
            Role::Watcher => {}
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Get chain config by kind
    pub fn chain(&self, kind: ChainKind) -> Option<&ChainConfig> {
        self.chains.values().find(|c| c.enabled && c.kind == kind)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

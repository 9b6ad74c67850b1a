//! Configuration module for the agent host node.
//!
//! Configuration is read from a JSON file whose path comes from the `--config`
//! CLI flag or the `CONFIG` environment variable. Secret-bearing string fields
//! accept `$VAR` / `${VAR}` references resolved against the process
//! environment at load time. The wallet signing key is never part of the file;
//! it is read from `AGENT_NODE_PRIVATE_KEY`.

use alloy_primitives::Address;
use alloy_signer_local::PrivateKeySigner;
use clap::Parser;
use serde::Deserialize;
use std::fs;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

/// Environment variable holding the node's wallet private key (0x-prefixed hex).
pub const ENV_PRIVATE_KEY: &str = "AGENT_NODE_PRIVATE_KEY";

/// CLI arguments for the agent host node.
#[derive(Parser, Debug)]
#[command(name = "agent-host")]
#[command(about = "Committee node for on-chain agent workloads")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Node configuration.
///
/// Fields use serde defaults so a minimal file only needs the contract
/// address and RPC endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Control-plane HTTP port.
    #[serde(default = "config_defaults::port")]
    port: u16,
    /// Directory for workload image tarballs.
    #[serde(default = "config_defaults::cache_dir")]
    cache_dir: PathBuf,
    /// First host port handed to a workload container; increments per start.
    #[serde(default = "config_defaults::start_port")]
    start_port: u16,
    /// Container runtime to request from Docker; `None` uses the daemon default.
    #[serde(default)]
    runtime: Option<String>,
    /// Entry-point contract. Registry and committee addresses are resolved
    /// from it on startup.
    somnia_agents_contract: Address,
    /// HTTP(S) RPC endpoint. The WebSocket endpoint is derived from it.
    rpc_url: Url,
    /// Sandbox bridge network identity.
    #[serde(default)]
    sandbox_network: SandboxNetworkConfig,
    /// Forward-proxy listen port on the sandbox gateway.
    #[serde(default = "config_defaults::sandbox_proxy_port")]
    sandbox_proxy_port: u16,
    /// Apply packet-filter egress rules.
    #[serde(default)]
    enable_firewall: bool,
    /// Inference proxy settings.
    #[serde(default)]
    llm_proxy: LlmProxyConfig,
    /// Skip the inference determinism check. Development only.
    #[serde(default, rename = "disableLLMValidation")]
    disable_llm_validation: bool,
    /// Heartbeat period, seconds.
    #[serde(default = "config_defaults::committee_interval")]
    committee_interval: u64,
    /// HTTP endpoint for receipt archival. `None` disables uploads.
    #[serde(default)]
    receipts_service_url: Option<Url>,
    /// Bearer token for non-metrics control endpoints. `None` leaves them open.
    #[serde(default)]
    api_key: Option<LiteralOrEnv<String>>,
    /// Listener dispatch concurrency cap.
    #[serde(default = "config_defaults::max_concurrent_requests")]
    max_concurrent_requests: usize,
    /// Optional rotating log file.
    #[serde(default)]
    log_file: Option<PathBuf>,
    /// On-disk budget for rotated log files, bytes.
    #[serde(default = "config_defaults::max_log_file_size")]
    max_log_file_size: u64,
    /// Fixed gas limit applied to every submitted transaction.
    #[serde(default = "config_defaults::gas_limit")]
    gas_limit: u64,
    /// Fixed gas price applied to every submitted transaction, wei.
    #[serde(default = "config_defaults::gas_price_wei")]
    gas_price_wei: u128,
    /// Lifetime of a cached workload version probe, seconds.
    #[serde(default = "config_defaults::version_cache_ttl")]
    version_cache_ttl: u64,
}

/// Identity of the sandbox bridge network.
///
/// IPAM is explicit so the gateway address seen from inside containers is
/// deterministic across restarts; both proxies bind to it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxNetworkConfig {
    #[serde(default = "sandbox_defaults::name")]
    pub name: String,
    #[serde(default = "sandbox_defaults::subnet")]
    pub subnet: String,
    #[serde(default = "sandbox_defaults::gateway")]
    pub gateway: String,
}

impl Default for SandboxNetworkConfig {
    fn default() -> Self {
        Self {
            name: sandbox_defaults::name(),
            subnet: sandbox_defaults::subnet(),
            gateway: sandbox_defaults::gateway(),
        }
    }
}

mod sandbox_defaults {
    pub fn name() -> String {
        "agent-sandbox".to_string()
    }
    pub fn subnet() -> String {
        "172.28.0.0/24".to_string()
    }
    pub fn gateway() -> String {
        "172.28.0.1".to_string()
    }
}

/// Inference proxy settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmProxyConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "llm_proxy_defaults::port")]
    pub port: u16,
    #[serde(default)]
    pub upstream_url: Option<Url>,
    #[serde(default)]
    pub api_key: Option<LiteralOrEnv<String>>,
}

impl Default for LlmProxyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: llm_proxy_defaults::port(),
            upstream_url: None,
            api_key: None,
        }
    }
}

mod llm_proxy_defaults {
    pub fn port() -> u16 {
        8742
    }
}

mod config_defaults {
    use std::path::PathBuf;

    pub fn port() -> u16 {
        8080
    }
    pub fn cache_dir() -> PathBuf {
        PathBuf::from("/var/cache/agent-host")
    }
    pub fn start_port() -> u16 {
        9100
    }
    pub fn sandbox_proxy_port() -> u16 {
        8741
    }
    pub fn committee_interval() -> u64 {
        60
    }
    pub fn max_concurrent_requests() -> usize {
        8
    }
    pub fn max_log_file_size() -> u64 {
        256 * 1024 * 1024
    }
    pub fn gas_limit() -> u64 {
        5_000_000
    }
    pub fn gas_price_wei() -> u128 {
        10_000_000_000
    }
    pub fn version_cache_ttl() -> u64 {
        30
    }
}

impl Config {
    /// Loads configuration from the file named by `--config` / `CONFIG`.
    pub fn load() -> Result<Self, ConfigError> {
        let args = CliArgs::parse();
        Self::from_file(&args.config)
    }

    /// Loads configuration from an explicit path.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let config: Config = serde_json::from_str(&contents)?;
        Ok(config)
    }

    /// Reads and validates the wallet signing key from the environment.
    pub fn signing_key_from_env() -> Result<PrivateKeySigner, ConfigError> {
        let raw = std::env::var(ENV_PRIVATE_KEY).map_err(|_| ConfigError::MissingKey)?;
        PrivateKeySigner::from_str(raw.trim()).map_err(|e| ConfigError::InvalidKey(e.to_string()))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn cache_dir(&self) -> &std::path::Path {
        &self.cache_dir
    }

    pub fn start_port(&self) -> u16 {
        self.start_port
    }

    pub fn runtime(&self) -> Option<&str> {
        self.runtime.as_deref()
    }

    pub fn somnia_agents_contract(&self) -> Address {
        self.somnia_agents_contract
    }

    pub fn rpc_url(&self) -> &Url {
        &self.rpc_url
    }

    pub fn sandbox_network(&self) -> &SandboxNetworkConfig {
        &self.sandbox_network
    }

    pub fn sandbox_proxy_port(&self) -> u16 {
        self.sandbox_proxy_port
    }

    pub fn enable_firewall(&self) -> bool {
        self.enable_firewall
    }

    pub fn llm_proxy(&self) -> &LlmProxyConfig {
        &self.llm_proxy
    }

    pub fn disable_llm_validation(&self) -> bool {
        self.disable_llm_validation
    }

    pub fn committee_interval(&self) -> Duration {
        Duration::from_secs(self.committee_interval)
    }

    pub fn receipts_service_url(&self) -> Option<&Url> {
        self.receipts_service_url.as_ref()
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|k| k.as_str())
    }

    pub fn max_concurrent_requests(&self) -> usize {
        self.max_concurrent_requests
    }

    pub fn log_file(&self) -> Option<&std::path::Path> {
        self.log_file.as_deref()
    }

    pub fn max_log_file_size(&self) -> u64 {
        self.max_log_file_size
    }

    pub fn gas_limit(&self) -> u64 {
        self.gas_limit
    }

    pub fn gas_price_wei(&self) -> u128 {
        self.gas_price_wei
    }

    pub fn version_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.version_cache_ttl)
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {}: {}", .0.display(), .1)]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Environment variable {ENV_PRIVATE_KEY} is not set")]
    MissingKey,
    #[error("Environment variable {ENV_PRIVATE_KEY} does not hold a valid private key: {0}")]
    InvalidKey(String),
}

/// A transparent wrapper that resolves environment variables during
/// deserialization.
///
/// Supports both literal values and environment variable references:
/// - Literal: `"super-secret"`
/// - Simple env var: `"$API_KEY"`
/// - Braced env var: `"${API_KEY}"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl LiteralOrEnv<String> {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> LiteralOrEnv<T> {
    /// Parse environment variable syntax from a string.
    /// Returns the variable name if the string matches `$VAR` or `${VAR}` syntax.
    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if s.starts_with("${") && s.ends_with('}') {
            Some(s[2..s.len() - 1].to_string())
        } else if s.starts_with('$') && s.len() > 1 {
            let var_name = &s[1..];
            if var_name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                Some(var_name.to_string())
            } else {
                None
            }
        } else {
            None
        }
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        let value = if let Some(var_name) = Self::parse_env_var_syntax(&s) {
            std::env::var(&var_name).map_err(|_| {
                serde::de::Error::custom(format!(
                    "Environment variable '{}' not found (referenced as '{}')",
                    var_name, s
                ))
            })?
        } else {
            s
        };

        let parsed = value
            .parse::<T>()
            .map_err(|e| serde::de::Error::custom(format!("Failed to parse value: {}", e)))?;

        Ok(LiteralOrEnv(parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "somniaAgentsContract": "0x1111111111111111111111111111111111111111",
            "rpcUrl": "https://rpc.example.test"
        })
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config: Config = serde_json::from_value(minimal()).unwrap();
        assert_eq!(config.port(), 8080);
        assert_eq!(config.start_port(), 9100);
        assert_eq!(config.sandbox_network().name, "agent-sandbox");
        assert_eq!(config.sandbox_network().gateway, "172.28.0.1");
        assert_eq!(config.committee_interval(), Duration::from_secs(60));
        assert_eq!(config.version_cache_ttl(), Duration::from_secs(30));
        assert!(!config.enable_firewall());
        assert!(!config.llm_proxy().enabled);
        assert!(config.api_key().is_none());
    }

    #[test]
    fn missing_contract_is_an_error() {
        let result: Result<Config, _> =
            serde_json::from_value(serde_json::json!({ "rpcUrl": "https://rpc.example.test" }));
        assert!(result.is_err());
    }

    #[test]
    fn literal_api_key_passes_through() {
        let mut value = minimal();
        value["apiKey"] = serde_json::json!("plain-token");
        let config: Config = serde_json::from_value(value).unwrap();
        assert_eq!(config.api_key(), Some("plain-token"));
    }

    #[test]
    fn env_reference_resolves() {
        // SAFETY: test-only env mutation, no concurrent readers of this name.
        unsafe { std::env::set_var("AGENT_HOST_TEST_KEY", "resolved-token") };
        let mut value = minimal();
        value["apiKey"] = serde_json::json!("$AGENT_HOST_TEST_KEY");
        let config: Config = serde_json::from_value(value).unwrap();
        assert_eq!(config.api_key(), Some("resolved-token"));
    }

    #[test]
    fn env_reference_missing_is_an_error() {
        let mut value = minimal();
        value["apiKey"] = serde_json::json!("${AGENT_HOST_DEFINITELY_UNSET}");
        let result: Result<Config, _> = serde_json::from_value(value);
        assert!(result.is_err());
    }

    #[test]
    fn braced_and_plain_syntax_parse() {
        assert_eq!(
            LiteralOrEnv::<String>::parse_env_var_syntax("${HOME}"),
            Some("HOME".to_string())
        );
        assert_eq!(
            LiteralOrEnv::<String>::parse_env_var_syntax("$HOME"),
            Some("HOME".to_string())
        );
        assert_eq!(LiteralOrEnv::<String>::parse_env_var_syntax("plain"), None);
        assert_eq!(
            LiteralOrEnv::<String>::parse_env_var_syntax("$not-a-var"),
            None
        );
    }
}

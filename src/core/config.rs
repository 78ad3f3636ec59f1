//! Configuration management for the gateway.
//!
//! This module handles loading and parsing configuration from YAML files,
//! with support for environment variable expansion, and validates the
//! cross-references between providers, keys and model aliases.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::fs;
use std::net::SocketAddr;

/// Placeholder written over secrets when a config is exposed through the admin API.
pub const REDACTED: &str = "***";

/// Main gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Config schema version (required)
    pub version: String,

    /// Server configuration (listen address, admin key)
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging sinks and Prometheus exposure
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Config and runtime (usage store) storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Upstream providers with their key pools
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Client-facing model name -> `<provider-id>:<upstream-model>`
    #[serde(default)]
    pub model_aliases: BTreeMap<String, String>,

    /// Key selection policy
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Client API keys accepted by the gateway (empty = no authentication)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub client_keys: Vec<ClientKeyConfig>,

    /// Provider used when neither an alias nor a prefix pattern matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_provider: Option<String>,
}

/// Server-specific configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, either `host:port` or `:port`
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Bearer token guarding `/admin/v1/*` (admin API disabled when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_api_key: Option<String>,

    /// Gateway name reported as `owned_by` in model listings
    #[serde(default = "default_gateway_name")]
    pub name: String,

    /// Default upstream timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_api_key: None,
            name: default_gateway_name(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl ServerConfig {
    /// Parse the listen address. A bare `:port` binds all interfaces.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let listen = self.listen.trim();
        let full = if listen.starts_with(':') {
            format!("0.0.0.0{}", listen)
        } else {
            listen.to_string()
        };
        full.parse::<SocketAddr>()
            .with_context(|| format!("Invalid listen address: {}", self.listen))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub file: FileLogConfig,

    #[serde(default)]
    pub prometheus: PrometheusConfig,

    /// Enabled sinks: `console`, `json`, `file`
    #[serde(default)]
    pub providers: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: FileLogConfig::default(),
            prometheus: PrometheusConfig::default(),
            providers: Vec::new(),
        }
    }
}

/// Size-rotated log file sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileLogConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_log_path")]
    pub path: String,

    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    #[serde(default = "default_max_backups")]
    pub max_backups: u32,
}

impl Default for FileLogConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_log_path(),
            max_size_mb: default_max_size_mb(),
            max_backups: default_max_backups(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrometheusConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_metrics_endpoint(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub config: ConfigStorage,

    #[serde(default)]
    pub runtime: RuntimeStorage,
}

/// Where the configuration itself lives. Only `file` is supported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigStorage {
    #[serde(rename = "type", default = "default_config_storage_type")]
    pub storage_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl Default for ConfigStorage {
    fn default() -> Self {
        Self {
            storage_type: default_config_storage_type(),
            path: None,
        }
    }
}

/// Usage store backend selection and connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStorage {
    #[serde(rename = "type", default)]
    pub store_type: StoreType,

    /// Host:port or URL of the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    /// Full connection URL; takes precedence over `addr`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    #[serde(default = "default_table_usage")]
    pub table_usage: String,

    #[serde(default = "default_table_cache")]
    pub table_cache: String,

    #[serde(default = "default_table_history")]
    pub table_history: String,

    #[serde(default = "default_table_metrics")]
    pub table_metrics: String,
}

impl Default for RuntimeStorage {
    fn default() -> Self {
        Self {
            store_type: StoreType::default(),
            addr: None,
            url: None,
            password: None,
            api_key: None,
            database: None,
            table_usage: default_table_usage(),
            table_cache: default_table_cache(),
            table_history: default_table_history(),
            table_metrics: default_table_metrics(),
        }
    }
}

impl RuntimeStorage {
    /// Connection target: `url` if set, otherwise `addr`.
    pub fn endpoint(&self) -> Option<&str> {
        self.url.as_deref().or(self.addr.as_deref())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    #[default]
    Memory,
    Redis,
    #[serde(alias = "postgres", alias = "sqlite", alias = "sql")]
    Sql,
    #[serde(alias = "mongo")]
    Mongodb,
    #[serde(alias = "dynamo")]
    Dynamodb,
    #[serde(alias = "influx")]
    Influxdb,
    Http,
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Memory => "memory",
            Self::Redis => "redis",
            Self::Sql => "sql",
            Self::Mongodb => "mongodb",
            Self::Dynamodb => "dynamodb",
            Self::Influxdb => "influxdb",
            Self::Http => "http",
        };
        f.write_str(name)
    }
}

/// Upstream protocol family of a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Openai,
    Anthropic,
    #[serde(alias = "google")]
    Gemini,
    Cohere,
    Mistral,
    Together,
    Openrouter,
    Huggingface,
    #[serde(alias = "xai")]
    Grok,
    Replicate,
    Voyage,
    Custom,
}

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Cohere => "cohere",
            Self::Mistral => "mistral",
            Self::Together => "together",
            Self::Openrouter => "openrouter",
            Self::Huggingface => "huggingface",
            Self::Grok => "grok",
            Self::Replicate => "replicate",
            Self::Voyage => "voyage",
            Self::Custom => "custom",
        }
    }

    /// Public API base used when a provider has no `base_url`.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::Openai => Some("https://api.openai.com/v1"),
            Self::Anthropic => Some("https://api.anthropic.com"),
            Self::Gemini => Some("https://generativelanguage.googleapis.com"),
            Self::Cohere => Some("https://api.cohere.com"),
            Self::Mistral => Some("https://api.mistral.ai/v1"),
            Self::Together => Some("https://api.together.xyz/v1"),
            Self::Openrouter => Some("https://openrouter.ai/api/v1"),
            Self::Huggingface => Some("https://router.huggingface.co/v1"),
            Self::Grok => Some("https://api.x.ai/v1"),
            Self::Replicate => Some("https://api.replicate.com"),
            Self::Voyage => Some("https://api.voyageai.com/v1"),
            Self::Custom => None,
        }
    }

    /// Upstream timeout in seconds when the provider doesn't override it.
    pub fn default_timeout_secs(&self) -> u64 {
        match self {
            Self::Replicate => 60,
            _ => 30,
        }
    }

    /// Client model name prefixes routed to this provider type when no alias matches.
    pub fn model_prefixes(&self) -> &'static [&'static str] {
        match self {
            Self::Openai => &["gpt-", "o1", "o3", "o4", "chatgpt-", "text-embedding-"],
            Self::Anthropic => &["claude-"],
            Self::Gemini => &["gemini-", "text-embedding-004"],
            Self::Cohere => &["embed-", "command-"],
            Self::Mistral => &["mistral-", "open-mistral", "codestral-", "ministral-", "pixtral-"],
            Self::Grok => &["grok-"],
            Self::Voyage => &["voyage-"],
            Self::Together
            | Self::Openrouter
            | Self::Huggingface
            | Self::Replicate
            | Self::Custom => &[],
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a single upstream provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider id (referenced by aliases)
    pub id: String,

    /// Upstream type tag
    #[serde(rename = "name", alias = "type")]
    pub provider_type: ProviderType,

    /// Base URL override for the provider's API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Default upstream model
    #[serde(default, alias = "default_model", skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Upstream timeout override in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Static model list for providers without a listing endpoint
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,

    /// Ordered upstream credential pool
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

impl ProviderConfig {
    pub fn base_url(&self) -> Option<String> {
        self.base_url
            .clone()
            .or_else(|| self.provider_type.default_base_url().map(str::to_string))
            .map(|url| url.trim_end_matches('/').to_string())
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
            .unwrap_or_else(|| self.provider_type.default_timeout_secs())
    }

    pub fn key(&self, key_id: &str) -> Option<&KeyConfig> {
        self.keys.iter().find(|k| k.id == key_id)
    }
}

/// One upstream credential.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyConfig {
    pub id: String,

    pub secret: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_req_per_min: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_tokens_per_min: Option<u32>,

    #[serde(default)]
    pub pricing: Pricing,
}

// Secrets stay out of Debug output so they can't leak through logs.
impl fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyConfig")
            .field("id", &self.id)
            .field("secret", &REDACTED)
            .field("limit_req_per_min", &self.limit_req_per_min)
            .field("limit_tokens_per_min", &self.limit_tokens_per_min)
            .field("pricing", &self.pricing)
            .finish()
    }
}

impl KeyConfig {
    /// Combined price per 1000 tokens (input + output).
    pub fn unit_cost(&self) -> f64 {
        self.pricing.input_token_cost + self.pricing.output_token_cost
    }

    /// Cost of a request with the given token counts.
    pub fn cost_for(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 / 1000.0) * self.pricing.input_token_cost
            + (output_tokens as f64 / 1000.0) * self.pricing.output_token_cost
    }
}

/// Price per 1000 tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    #[serde(default)]
    pub input_token_cost: f64,

    #[serde(default)]
    pub output_token_cost: f64,

    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for Pricing {
    fn default() -> Self {
        Self {
            input_token_cost: 0.0,
            output_token_cost: 0.0,
            currency: default_currency(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    RoundRobin,
    LeastError,
    Hybrid,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastError => "least_error",
            Self::Hybrid => "hybrid",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub strategy: Strategy,

    #[serde(default)]
    pub cost_first: bool,

    #[serde(default)]
    pub hybrid_weights: HybridWeights,
}

/// Non-negative weights of the hybrid score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridWeights {
    #[serde(default)]
    pub token_ratio: f64,

    #[serde(default)]
    pub req_ratio: f64,

    #[serde(default)]
    pub error_score: f64,

    #[serde(default)]
    pub latency: f64,

    #[serde(default)]
    pub cost_ratio: f64,
}

impl Default for HybridWeights {
    fn default() -> Self {
        Self {
            token_ratio: 0.0,
            req_ratio: 1.0,
            error_score: 0.0,
            latency: 0.0,
            cost_ratio: 0.0,
        }
    }
}

/// A client API key accepted by the gateway.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientKeyConfig {
    /// Human-readable name used in logs and metric tags
    pub name: String,

    pub key: String,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Allowed client model names (`*` suffix wildcard); empty allows all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_models: Vec<String>,
}

impl fmt::Debug for ClientKeyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientKeyConfig")
            .field("name", &self.name)
            .field("key", &REDACTED)
            .field("enabled", &self.enabled)
            .field("allowed_models", &self.allowed_models)
            .finish()
    }
}

fn default_listen() -> String {
    ":8080".to_string()
}

fn default_gateway_name() -> String {
    "llm-gateway".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_path() -> String {
    "logs/gateway.log".to_string()
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_max_backups() -> u32 {
    5
}

fn default_metrics_endpoint() -> String {
    "/metrics".to_string()
}

fn default_config_storage_type() -> String {
    "file".to_string()
}

fn default_table_usage() -> String {
    "usage_metrics".to_string()
}

fn default_table_cache() -> String {
    "cache".to_string()
}

fn default_table_history() -> String {
    "usage_history".to_string()
}

fn default_table_metrics() -> String {
    "metrics".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_enabled() -> bool {
    true
}

/// Resolve the config file path: `CONFIG_PATH` wins over the CLI flag.
pub fn resolve_config_path(cli_path: &str) -> String {
    std::env::var("CONFIG_PATH")
        .ok()
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| cli_path.to_string())
}

impl GatewayConfig {
    /// Load configuration from a YAML file and apply environment overrides.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use llm_gateway::core::config::GatewayConfig;
    ///
    /// let config = GatewayConfig::load("config.yaml").expect("Failed to load config");
    /// ```
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse YAML content after expanding `${VAR}` references.
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: GatewayConfig = serde_yaml::from_str(&expanded)?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// `PORT` overrides `server.listen`, bound as `:$PORT`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(port_str) = std::env::var("PORT") {
            if let Ok(port) = port_str.trim().parse::<u16>() {
                self.server.listen = format!(":{}", port);
            }
        }
    }

    /// Check cross-references and value ranges.
    pub fn validate(&self) -> Result<()> {
        if self.version.trim().is_empty() {
            bail!("version is required");
        }

        self.server.socket_addr()?;

        let mut provider_ids = HashSet::new();
        for provider in &self.providers {
            if provider.id.trim().is_empty() {
                bail!("provider id must not be empty");
            }
            if provider.id.contains(':') {
                bail!("provider id '{}' must not contain ':'", provider.id);
            }
            if !provider_ids.insert(provider.id.as_str()) {
                bail!("duplicate provider id '{}'", provider.id);
            }
            if provider.keys.is_empty() {
                bail!("provider '{}' has no keys", provider.id);
            }
            if provider.base_url().is_none() {
                bail!(
                    "provider '{}' of type {} requires base_url",
                    provider.id,
                    provider.provider_type
                );
            }

            let mut key_ids = HashSet::new();
            for key in &provider.keys {
                if key.id.trim().is_empty() {
                    bail!("provider '{}' has a key with an empty id", provider.id);
                }
                if !key_ids.insert(key.id.as_str()) {
                    bail!("duplicate key id '{}' in provider '{}'", key.id, provider.id);
                }
                if key.pricing.input_token_cost < 0.0 || key.pricing.output_token_cost < 0.0 {
                    bail!("key '{}' in provider '{}' has negative pricing", key.id, provider.id);
                }
            }
        }

        for (alias, target) in &self.model_aliases {
            let Some((provider_id, _model)) = target.split_once(':') else {
                bail!(
                    "model alias '{}' must map to '<provider-id>:<model>', got '{}'",
                    alias,
                    target
                );
            };
            if !provider_ids.contains(provider_id) {
                bail!(
                    "model alias '{}' references unknown provider '{}'",
                    alias,
                    provider_id
                );
            }
        }

        if let Some(default_provider) = &self.default_provider {
            if !provider_ids.contains(default_provider.as_str()) {
                bail!("default_provider '{}' is not a configured provider", default_provider);
            }
        }

        let w = &self.policy.hybrid_weights;
        for (name, value) in [
            ("token_ratio", w.token_ratio),
            ("req_ratio", w.req_ratio),
            ("error_score", w.error_score),
            ("latency", w.latency),
            ("cost_ratio", w.cost_ratio),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                bail!("hybrid weight {} must be a non-negative number", name);
            }
        }

        let mut client_names = HashSet::new();
        for client in &self.client_keys {
            if client.key.is_empty() {
                bail!("client key '{}' has an empty key", client.name);
            }
            if !client_names.insert(client.name.as_str()) {
                bail!("duplicate client key name '{}'", client.name);
            }
        }

        if self.storage.config.storage_type != "file" {
            bail!(
                "unsupported config storage type '{}'",
                self.storage.config.storage_type
            );
        }

        Ok(())
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Copy of the config with every secret replaced by [`REDACTED`].
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.server.admin_api_key.is_some() {
            config.server.admin_api_key = Some(REDACTED.to_string());
        }
        if config.storage.runtime.password.is_some() {
            config.storage.runtime.password = Some(REDACTED.to_string());
        }
        if config.storage.runtime.api_key.is_some() {
            config.storage.runtime.api_key = Some(REDACTED.to_string());
        }
        for provider in &mut config.providers {
            for key in &mut provider.keys {
                key.secret = REDACTED.to_string();
            }
        }
        for client in &mut config.client_keys {
            client.key = REDACTED.to_string();
        }
        config
    }
}

static ENV_VAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\$\{([^}:]+)(?::-?([^}]*))?\}"#).expect("env var pattern is valid")
});

/// Expand environment variables in configuration content.
///
/// Supports patterns: ${VAR}, ${VAR:-default}, ${VAR:default}
fn expand_env_vars(content: &str) -> String {
    ENV_VAR_RE
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
version: "1"
server:
  listen: "127.0.0.1:9090"
  admin_api_key: admin-secret
providers:
  - id: openai
    name: openai
    model: gpt-4o-mini
    keys:
      - id: k1
        secret: sk-one
        limit_req_per_min: 60
        pricing:
          input_token_cost: 0.5
          output_token_cost: 1.5
          currency: USD
      - id: k2
        secret: sk-two
  - id: claude
    type: anthropic
    keys:
      - id: a1
        secret: sk-ant
model_aliases:
  gpt-4o: openai:gpt-4o
  sonnet: claude:claude-3-5-sonnet-latest
policy:
  strategy: hybrid
  cost_first: true
  hybrid_weights:
    req_ratio: 1.0
    error_score: 5.0
"#;

    fn write_temp(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    #[test]
    fn test_expand_env_vars() {
        unsafe {
            std::env::set_var("GW_TEST_VAR", "test_value");
        }
        assert_eq!(expand_env_vars("secret: ${GW_TEST_VAR}"), "secret: test_value");
        unsafe {
            std::env::remove_var("GW_TEST_VAR");
        }
    }

    #[test]
    fn test_expand_env_vars_with_default() {
        unsafe {
            std::env::remove_var("GW_MISSING_VAR");
        }
        assert_eq!(
            expand_env_vars("secret: ${GW_MISSING_VAR:-fallback}"),
            "secret: fallback"
        );
        assert_eq!(
            expand_env_vars("secret: ${GW_MISSING_VAR:fallback}"),
            "secret: fallback"
        );
        assert_eq!(expand_env_vars("secret: ${GW_MISSING_VAR:-}"), "secret: ");
    }

    #[test]
    #[serial]
    fn test_load_config_from_file() {
        unsafe {
            std::env::remove_var("PORT");
        }
        let temp_file = write_temp(SAMPLE);
        let config = GatewayConfig::load(temp_file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.version, "1");
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].provider_type, ProviderType::Openai);
        assert_eq!(config.providers[1].provider_type, ProviderType::Anthropic);
        assert_eq!(config.providers[0].keys[0].limit_req_per_min, Some(60));
        assert_eq!(config.providers[0].keys[1].pricing, Pricing::default());
        assert_eq!(config.policy.strategy, Strategy::Hybrid);
        assert!(config.policy.cost_first);
        assert_eq!(config.policy.hybrid_weights.error_score, 5.0);
        assert_eq!(config.server.listen, "127.0.0.1:9090");
        config.validate().unwrap();
    }

    #[test]
    #[serial]
    fn test_port_env_override() {
        unsafe {
            std::env::set_var("PORT", "9999");
        }
        let temp_file = write_temp(SAMPLE);
        let config = GatewayConfig::load(temp_file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.server.listen, ":9999");
        assert_eq!(
            config.server.socket_addr().unwrap(),
            "0.0.0.0:9999".parse::<SocketAddr>().unwrap()
        );
        unsafe {
            std::env::remove_var("PORT");
        }
    }

    #[test]
    #[serial]
    fn test_config_path_env_wins() {
        unsafe {
            std::env::set_var("CONFIG_PATH", "/etc/gateway.yaml");
        }
        assert_eq!(resolve_config_path("config.yaml"), "/etc/gateway.yaml");
        unsafe {
            std::env::remove_var("CONFIG_PATH");
        }
        assert_eq!(resolve_config_path("config.yaml"), "config.yaml");
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(GatewayConfig::load("nonexistent_file.yaml").is_err());
    }

    #[test]
    fn test_missing_version_fails_to_parse() {
        assert!(GatewayConfig::from_yaml("providers: []").is_err());
    }

    #[test]
    fn test_unknown_provider_type_fails_to_parse() {
        let yaml = r#"
version: "1"
providers:
  - id: x
    name: not-a-provider
    keys: [{id: k, secret: s}]
"#;
        assert!(GatewayConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = GatewayConfig::from_yaml(SAMPLE).unwrap();
        let yaml = config.to_yaml().unwrap();
        let parsed = GatewayConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_validate_rejects_alias_to_unknown_provider() {
        let mut config = GatewayConfig::from_yaml(SAMPLE).unwrap();
        config
            .model_aliases
            .insert("ghost".to_string(), "nowhere:model".to_string());
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("unknown provider 'nowhere'"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_duplicate_key_ids() {
        let mut config = GatewayConfig::from_yaml(SAMPLE).unwrap();
        let dup = config.providers[0].keys[0].clone();
        config.providers[0].keys.push(dup);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_key_pool() {
        let mut config = GatewayConfig::from_yaml(SAMPLE).unwrap();
        config.providers[1].keys.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_weight() {
        let mut config = GatewayConfig::from_yaml(SAMPLE).unwrap();
        config.policy.hybrid_weights.latency = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_custom_provider_requires_base_url() {
        let yaml = r#"
version: "1"
providers:
  - id: local
    name: custom
    keys: [{id: k, secret: s}]
"#;
        let config = GatewayConfig::from_yaml(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let config = GatewayConfig::from_yaml(SAMPLE).unwrap();
        let redacted = config.redacted();
        assert_eq!(redacted.providers[0].keys[0].secret, REDACTED);
        assert_eq!(redacted.server.admin_api_key.as_deref(), Some(REDACTED));
        assert!(!redacted.to_yaml().unwrap().contains("sk-one"));
    }

    #[test]
    fn test_key_debug_hides_secret() {
        let config = GatewayConfig::from_yaml(SAMPLE).unwrap();
        let debug = format!("{:?}", config.providers[0].keys[0]);
        assert!(!debug.contains("sk-one"));
    }

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.listen, ":8080");
        assert_eq!(server.name, "llm-gateway");
        assert_eq!(StorageConfig::default().runtime.table_usage, "usage_metrics");
        assert_eq!(ProviderType::Replicate.default_timeout_secs(), 60);
        assert_eq!(ProviderType::Openai.default_timeout_secs(), 30);
    }

    #[test]
    fn test_key_cost() {
        let config = GatewayConfig::from_yaml(SAMPLE).unwrap();
        let key = &config.providers[0].keys[0];
        assert_eq!(key.unit_cost(), 2.0);
        assert!((key.cost_for(1000, 2000) - 3.5).abs() < 1e-9);
    }
}

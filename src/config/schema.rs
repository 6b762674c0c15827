use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// AI text-generation provider settings (OpenAI-compatible API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible chat completions API.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// API key. When unset, AI generation is disabled and follow-up text
    /// falls back to canned messages.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    /// Per-request timeout. Generous but finite: job locks are renewed while
    /// a call is in flight, so minutes-long generations are tolerated.
    #[serde(default = "default_provider_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Upper bound on provider-declared tool-call rounds per job.
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
}

fn default_api_url() -> String {
    "https://api.openai.com/v1".into()
}

fn default_model() -> String {
    "gpt-4o-mini".into()
}

fn default_temperature() -> f64 {
    0.7
}

fn default_provider_timeout_secs() -> u64 {
    60
}

fn default_max_tool_iterations() -> usize {
    4
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            request_timeout_secs: default_provider_timeout_secs(),
            max_tool_iterations: default_max_tool_iterations(),
        }
    }
}

/// Message buffer + AI dispatch queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Debounce interval for coalescing inbound message bursts per contact.
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Max AI jobs in flight per process.
    #[serde(default = "default_dispatch_concurrent")]
    pub max_concurrent: usize,
    /// Delivery attempts per job before the owning buffer is marked failed.
    #[serde(default = "default_dispatch_attempts")]
    pub max_attempts: u32,
    /// Base backoff (ms) between job retry attempts; doubles per attempt.
    #[serde(default = "default_dispatch_backoff_ms")]
    pub backoff_ms: u64,
    /// Job lock lease; renewed at half-lease while a job is in flight.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,
    /// Bound on the queue-add path so a store outage degrades to the
    /// synchronous fallback instead of hanging the webhook handler.
    #[serde(default = "default_enqueue_timeout_ms")]
    pub enqueue_timeout_ms: u64,
    /// Worker polling cadence in seconds.
    #[serde(default = "default_dispatch_poll_secs")]
    pub poll_secs: u64,
}

fn default_debounce_ms() -> u64 {
    10_000
}

fn default_dispatch_concurrent() -> usize {
    4
}

fn default_dispatch_attempts() -> u32 {
    3
}

fn default_dispatch_backoff_ms() -> u64 {
    1_000
}

fn default_lock_lease_secs() -> u64 {
    120
}

fn default_enqueue_timeout_ms() -> u64 {
    3_000
}

fn default_dispatch_poll_secs() -> u64 {
    2
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_concurrent: default_dispatch_concurrent(),
            max_attempts: default_dispatch_attempts(),
            backoff_ms: default_dispatch_backoff_ms(),
            lock_lease_secs: default_lock_lease_secs(),
            enqueue_timeout_ms: default_enqueue_timeout_ms(),
            poll_secs: default_dispatch_poll_secs(),
        }
    }
}

/// Reminder worker + inactivity scanner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUpWorkerConfig {
    /// Due-reminder polling cadence in seconds.
    #[serde(default = "default_followup_poll_secs")]
    pub poll_secs: u64,
    /// Reminders executed concurrently per poll cycle.
    #[serde(default = "default_followup_concurrent")]
    pub max_concurrent: usize,
    /// Inactivity scan cadence in seconds.
    #[serde(default = "default_scan_interval_secs")]
    pub scan_interval_secs: u64,
    /// Max due reminders pulled per poll cycle.
    #[serde(default = "default_followup_batch")]
    pub max_batch: usize,
}

fn default_followup_poll_secs() -> u64 {
    30
}

fn default_followup_concurrent() -> usize {
    2
}

fn default_scan_interval_secs() -> u64 {
    300
}

fn default_followup_batch() -> usize {
    50
}

impl Default for FollowUpWorkerConfig {
    fn default() -> Self {
        Self {
            poll_secs: default_followup_poll_secs(),
            max_concurrent: default_followup_concurrent(),
            scan_interval_secs: default_scan_interval_secs(),
            max_batch: default_followup_batch(),
        }
    }
}

/// Inbound webhook ingress settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
}

fn default_gateway_host() -> String {
    "127.0.0.1".into()
}

fn default_gateway_port() -> u16 {
    8686
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
        }
    }
}

/// Daemon component restart behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Initial backoff for component restarts.
    #[serde(default = "default_component_backoff_secs")]
    pub component_initial_backoff_secs: u64,
    /// Max backoff for component restarts.
    #[serde(default = "default_component_backoff_max_secs")]
    pub component_max_backoff_secs: u64,
    /// Timeout for channel send calls.
    #[serde(default = "default_channel_timeout_secs")]
    pub channel_timeout_secs: u64,
}

fn default_component_backoff_secs() -> u64 {
    2
}

fn default_component_backoff_max_secs() -> u64 {
    60
}

fn default_channel_timeout_secs() -> u64 {
    30
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            component_initial_backoff_secs: default_component_backoff_secs(),
            component_max_backoff_secs: default_component_backoff_max_secs(),
            channel_timeout_secs: default_channel_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database and runtime state.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(skip)]
    pub config_path: PathBuf,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub followup: FollowUpWorkerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

fn chasqui_dir() -> PathBuf {
    UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().join(".chasqui"))
}

fn default_workspace_dir() -> PathBuf {
    chasqui_dir().join("workspace")
}

impl Default for Config {
    fn default() -> Self {
        let dir = chasqui_dir();
        Self {
            workspace_dir: dir.join("workspace"),
            config_path: dir.join("config.toml"),
            provider: ProviderConfig::default(),
            dispatch: DispatchConfig::default(),
            followup: FollowUpWorkerConfig::default(),
            gateway: GatewayConfig::default(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path` (or the default `~/.chasqui/config.toml`).
    /// A missing file yields defaults; the workspace directory is created.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = match path {
            Some(p) => expand_path(&p),
            None => chasqui_dir().join("config.toml"),
        };

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            toml::from_str::<Config>(&raw)
                .with_context(|| format!("Invalid config TOML: {}", path.display()))?
        } else {
            Config::default()
        };
        config.config_path = path;
        config.workspace_dir = expand_path(&config.workspace_dir);

        std::fs::create_dir_all(&config.workspace_dir).with_context(|| {
            format!(
                "Failed to create workspace dir: {}",
                config.workspace_dir.display()
            )
        })?;

        Ok(config)
    }

    /// Write the current configuration to `config_path` as TOML.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }
        let raw = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&self.config_path, raw)
            .with_context(|| format!("Failed to write config: {}", self.config_path.display()))
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(raw.as_ref()).into_owned())
}

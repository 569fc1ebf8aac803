use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::breaker::BreakerConfig;
use crate::limiter::{LimiterConfig, ServiceTier};
use crate::orchestrator::OrchestratorConfig;
use crate::recovery::RecoveryConfig;
use crate::remote::client::{ClientConfig, ConfirmationMode, PollConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub remote: RemoteConfig,
    #[serde(default)]
    pub scan: Option<ScanConfig>,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub breaker: BreakerSection,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub recovery: RecoverySection,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub confirmation: ConfirmationConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RemoteConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Target store, e.g. `fileSearchStores/my-docs-1a2b`.
    pub store_name: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_object_ttl_hours")]
    pub object_ttl_hours: u64,
}

fn default_base_url() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}
fn default_request_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}
fn default_object_ttl_hours() -> u64 {
    48
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.pdf".to_string(),
    ]
}
fn default_max_file_bytes() -> u64 {
    100 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct LimitsConfig {
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default = "default_max_upload_concurrency")]
    pub max_upload_concurrency: usize,
    #[serde(default = "default_ramp_successes")]
    pub ramp_successes: u32,
    #[serde(default = "default_poll_concurrency")]
    pub poll_concurrency: usize,
    #[serde(default = "default_cohort_size")]
    pub cohort_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_max_passes")]
    pub max_passes: u32,
    /// Pause between passes when work was requeued.
    #[serde(default = "default_pass_delay_secs")]
    pub pass_delay_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            tier: default_tier(),
            max_upload_concurrency: default_max_upload_concurrency(),
            ramp_successes: default_ramp_successes(),
            poll_concurrency: default_poll_concurrency(),
            cohort_size: default_cohort_size(),
            max_attempts: default_max_attempts(),
            max_passes: default_max_passes(),
            pass_delay_secs: default_pass_delay_secs(),
        }
    }
}

fn default_tier() -> String {
    "tier1".to_string()
}
fn default_max_upload_concurrency() -> usize {
    8
}
fn default_ramp_successes() -> u32 {
    10
}
fn default_poll_concurrency() -> usize {
    20
}
fn default_cohort_size() -> usize {
    150
}
fn default_max_attempts() -> i64 {
    5
}
fn default_max_passes() -> u32 {
    20
}
fn default_pass_delay_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct BreakerSection {
    #[serde(default = "default_window")]
    pub window: usize,
    #[serde(default = "default_rate_threshold")]
    pub rate_threshold: f64,
    #[serde(default = "default_consecutive_threshold")]
    pub consecutive_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_max_cooldown_secs")]
    pub max_cooldown_secs: u64,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            window: default_window(),
            rate_threshold: default_rate_threshold(),
            consecutive_threshold: default_consecutive_threshold(),
            cooldown_secs: default_cooldown_secs(),
            max_cooldown_secs: default_max_cooldown_secs(),
        }
    }
}

fn default_window() -> usize {
    100
}
fn default_rate_threshold() -> f64 {
    0.05
}
fn default_consecutive_threshold() -> u32 {
    3
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_max_cooldown_secs() -> u64 {
    1200
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_poll_initial_secs")]
    pub initial_secs: u64,
    #[serde(default = "default_poll_max_secs")]
    pub max_secs: u64,
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,
    #[serde(default = "default_activation_timeout_secs")]
    pub activation_timeout_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_secs: default_poll_initial_secs(),
            max_secs: default_poll_max_secs(),
            operation_timeout_secs: default_operation_timeout_secs(),
            activation_timeout_secs: default_activation_timeout_secs(),
        }
    }
}

fn default_poll_initial_secs() -> u64 {
    5
}
fn default_poll_max_secs() -> u64 {
    60
}
fn default_operation_timeout_secs() -> u64 {
    3600
}
fn default_activation_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecoverySection {
    #[serde(default = "default_recovery_deadline_secs")]
    pub deadline_secs: u64,
    #[serde(default = "default_expiry_margin_secs")]
    pub expiry_margin_secs: u64,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            deadline_secs: default_recovery_deadline_secs(),
            expiry_margin_secs: default_expiry_margin_secs(),
        }
    }
}

fn default_recovery_deadline_secs() -> u64 {
    3 * 3600
}
fn default_expiry_margin_secs() -> u64 {
    3600
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

fn default_stale_after_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConfirmationConfig {
    #[serde(default = "default_confirmation_mode")]
    pub mode: String,
    #[serde(default = "default_visible_timeout_secs")]
    pub visible_timeout_secs: u64,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            mode: default_confirmation_mode(),
            visible_timeout_secs: default_visible_timeout_secs(),
        }
    }
}

fn default_confirmation_mode() -> String {
    "operation".to_string()
}
fn default_visible_timeout_secs() -> u64 {
    120
}

impl Config {
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            window: self.breaker.window,
            rate_threshold: self.breaker.rate_threshold,
            consecutive_threshold: self.breaker.consecutive_threshold,
            cooldown: Duration::from_secs(self.breaker.cooldown_secs),
            max_cooldown: Duration::from_secs(self.breaker.max_cooldown_secs),
        }
    }

    pub fn limiter_config(&self) -> Result<LimiterConfig> {
        let tier: ServiceTier = self.limits.tier.parse()?;
        Ok(LimiterConfig {
            base_interval: tier.base_interval(),
            min_concurrency: 1,
            max_concurrency: self.limits.max_upload_concurrency,
            ramp_successes: self.limits.ramp_successes,
        })
    }

    pub fn client_config(&self) -> Result<ClientConfig> {
        let confirmation = match self.confirmation.mode.as_str() {
            "operation" => ConfirmationMode::Operation,
            "visible" => ConfirmationMode::Visible {
                timeout: Duration::from_secs(self.confirmation.visible_timeout_secs),
            },
            other => anyhow::bail!(
                "Unknown confirmation mode: '{}'. Must be operation or visible.",
                other
            ),
        };
        Ok(ClientConfig {
            max_retries: self.remote.max_retries,
            retry_base: Duration::from_secs(1),
            retry_cap: Duration::from_secs(32),
            poll: PollConfig {
                initial: Duration::from_secs(self.polling.initial_secs),
                max: Duration::from_secs(self.polling.max_secs),
                operation_timeout: Duration::from_secs(self.polling.operation_timeout_secs),
                activation_timeout: Duration::from_secs(self.polling.activation_timeout_secs),
            },
            confirmation,
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            cohort_size: self.limits.cohort_size,
            max_upload_concurrency: self.limits.max_upload_concurrency,
            poll_concurrency: self.limits.poll_concurrency,
            max_attempts: self.limits.max_attempts,
            max_passes: self.limits.max_passes,
            pass_delay: Duration::from_secs(self.limits.pass_delay_secs),
            limit: None,
            scan_root: self.scan.as_ref().map(|s| s.root.clone()),
            max_file_bytes: self
                .scan
                .as_ref()
                .map(|s| s.max_file_bytes)
                .unwrap_or_else(default_max_file_bytes),
        }
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            deadline: Duration::from_secs(self.recovery.deadline_secs),
            expiry_margin: Duration::from_secs(self.recovery.expiry_margin_secs),
            max_attempts: self.limits.max_attempts,
            concurrency: self.limits.poll_concurrency,
            object_ttl: Duration::from_secs(self.remote.object_ttl_hours * 3600),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.remote.store_name.trim().is_empty() {
        anyhow::bail!("remote.store_name must not be empty");
    }
    if !config.remote.store_name.starts_with("fileSearchStores/") {
        anyhow::bail!(
            "remote.store_name must look like 'fileSearchStores/<id>', got '{}'",
            config.remote.store_name
        );
    }
    if config.remote.object_ttl_hours == 0 {
        anyhow::bail!("remote.object_ttl_hours must be > 0");
    }

    let limits = &config.limits;
    if limits.cohort_size == 0 || limits.cohort_size > 1000 {
        anyhow::bail!("limits.cohort_size must be in [1, 1000]");
    }
    if limits.max_upload_concurrency == 0 {
        anyhow::bail!("limits.max_upload_concurrency must be > 0");
    }
    if limits.poll_concurrency == 0 {
        anyhow::bail!("limits.poll_concurrency must be > 0");
    }
    if limits.max_attempts < 1 {
        anyhow::bail!("limits.max_attempts must be >= 1");
    }
    if limits.max_passes == 0 {
        anyhow::bail!("limits.max_passes must be > 0");
    }
    limits.tier.parse::<ServiceTier>()?;

    let breaker = &config.breaker;
    if breaker.window == 0 {
        anyhow::bail!("breaker.window must be > 0");
    }
    if !(breaker.rate_threshold > 0.0 && breaker.rate_threshold < 1.0) {
        anyhow::bail!("breaker.rate_threshold must be in (0.0, 1.0)");
    }
    if breaker.consecutive_threshold == 0 {
        anyhow::bail!("breaker.consecutive_threshold must be > 0");
    }
    if breaker.max_cooldown_secs < breaker.cooldown_secs {
        anyhow::bail!("breaker.max_cooldown_secs must be >= breaker.cooldown_secs");
    }

    let polling = &config.polling;
    if polling.initial_secs == 0 {
        anyhow::bail!("polling.initial_secs must be > 0");
    }
    if polling.initial_secs > polling.max_secs {
        anyhow::bail!("polling.initial_secs must be <= polling.max_secs");
    }

    match config.confirmation.mode.as_str() {
        "operation" | "visible" => {}
        other => anyhow::bail!(
            "Unknown confirmation mode: '{}'. Must be operation or visible.",
            other
        ),
    }

    Ok(())
}

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ai_reply_module::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_CONTEXT_MESSAGES, DEFAULT_FALLBACK_REPLY};
use serde::Deserialize;
use tracing::warn;

use crate::channel::Platform;

pub const DEFAULT_SUPERVISOR_DEPARTMENT: &str = "supervisors";
pub const DEFAULT_BASE_WAIT_MINUTES: i64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read router config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse router config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid channel name in config: {0}")]
    UnknownChannel(String),
    #[error("invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Fully resolved settings, handed to services and jobs instead of read from globals.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub routing: RoutingConfig,
    pub dispatch: DispatchConfig,
    pub ai: AiConfig,
    pub escalation: EscalationConfig,
    pub channels: HashMap<String, ChannelSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub confidence_threshold: f64,
    pub context_messages: usize,
    pub exit_keywords: Vec<String>,
    pub escalation_ack: String,
    pub flow_aborted_reply: String,
    pub flow_completed_reply: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Zero workers means jobs run inline on the submitting thread.
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub lease_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub service_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_secs: u64,
    pub fallback_reply: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub base_wait_minutes: HashMap<String, i64>,
    pub default_base_wait_minutes: i64,
    pub supervisor_department: String,
    pub inactivity_hours: i64,
    pub sweep_interval_secs: u64,
}

/// Per-channel credentials and policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub enabled: bool,
    /// Signing secret (app secret, auth token, consumer secret...).
    pub secret: Option<String>,
    /// Token echoed back during hub.challenge subscription handshakes.
    pub verify_token: Option<String>,
    pub access_token: Option<String>,
    /// Own account/page/bot id, used to drop echoes of our own sends.
    pub account_id: Option<String>,
    pub api_base_url: Option<String>,
    /// Public URL the platform signs (Twilio).
    pub webhook_url: Option<String>,
    /// Phone number or handle outbound messages are sent from (SMS).
    pub sender_address: Option<String>,
    /// Accept unsigned webhooks when no secret is configured.
    pub allow_unsigned: bool,
    /// Platform policy: every message goes to a human.
    pub human_only: bool,
    pub send_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9200,
            max_body_bytes: 5 * 1024 * 1024,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("data").join("inbox.db"),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            context_messages: DEFAULT_CONTEXT_MESSAGES,
            exit_keywords: vec!["0".to_string(), "exit".to_string(), "stop".to_string()],
            escalation_ack: "Thanks, we've passed your message to our support team.".to_string(),
            flow_aborted_reply: "No problem, we've stopped here. Thanks for your time.".to_string(),
            flow_completed_reply: "Thank you for your feedback!".to_string(),
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 256,
            max_attempts: 5,
            retry_backoff_ms: 200,
            lease_secs: 120,
        }
    }
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            service_url: None,
            api_key: None,
            model: None,
            timeout_secs: 20,
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
        }
    }
}

impl Default for EscalationConfig {
    fn default() -> Self {
        let base_wait_minutes = [
            ("customer_support", 15),
            ("technical_support", 30),
            ("billing_support", 20),
            ("claims_support", 20),
            ("customer_relations", 10),
            (DEFAULT_SUPERVISOR_DEPARTMENT, 5),
        ]
        .into_iter()
        .map(|(name, minutes)| (name.to_string(), minutes))
        .collect();
        Self {
            base_wait_minutes,
            default_base_wait_minutes: DEFAULT_BASE_WAIT_MINUTES,
            supervisor_department: DEFAULT_SUPERVISOR_DEPARTMENT.to_string(),
            inactivity_hours: 24,
            sweep_interval_secs: 300,
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            secret: None,
            verify_token: None,
            access_token: None,
            account_id: None,
            api_base_url: None,
            webhook_url: None,
            sender_address: None,
            allow_unsigned: false,
            human_only: false,
            send_timeout_secs: 15,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            routing: RoutingConfig::default(),
            dispatch: DispatchConfig::default(),
            ai: AiConfig::default(),
            escalation: EscalationConfig::default(),
            channels: HashMap::new(),
        }
    }
}

impl EscalationConfig {
    pub fn base_wait_for(&self, department: &str) -> i64 {
        self.base_wait_minutes
            .get(department)
            .copied()
            .unwrap_or(self.default_base_wait_minutes)
    }
}

impl ChannelSettings {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs.max(1))
    }

    pub(crate) fn secret(&self) -> Option<&str> {
        self.secret.as_deref().map(str::trim).filter(|v| !v.is_empty())
    }
}

impl RouterConfig {
    /// Loads `.env`, the TOML file (if any), then applies env overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = match resolve_config_path() {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: RouterConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let threshold = self.routing.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid {
                key: "routing.confidence_threshold",
                reason: format!("{} is outside 0.0..=1.0", threshold),
            });
        }
        if self.routing.context_messages == 0 {
            return Err(ConfigError::Invalid {
                key: "routing.context_messages",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "dispatch.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        for name in self.channels.keys() {
            name.parse::<Platform>()
                .map_err(|_| ConfigError::UnknownChannel(name.clone()))?;
        }
        Ok(())
    }

    /// Settings for one platform; channels missing from the file get defaults.
    pub fn channel(&self, platform: Platform) -> ChannelSettings {
        self.channels
            .iter()
            .find(|(name, _)| name.parse::<Platform>().ok() == Some(platform))
            .map(|(_, settings)| settings.clone())
            .unwrap_or_default()
    }

    pub fn set_channel(&mut self, platform: Platform, settings: ChannelSettings) {
        self.channels.retain(|name, _| name.parse::<Platform>().ok() != Some(platform));
        self.channels.insert(platform.as_str().to_string(), settings);
    }

    pub fn ai_timeout(&self) -> Duration {
        Duration::from_secs(self.ai.timeout_secs.max(1))
    }

    /// Channels running in tolerant mode (unsigned webhooks accepted).
    pub fn tolerant_channels(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|platform| {
                let settings = self.channel(*platform);
                settings.enabled && settings.allow_unsigned && settings.secret().is_none()
            })
            .collect()
    }

    fn apply_env_overrides(&mut self) {
        if let Some(host) = env_string("GATEWAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env_string("GATEWAY_PORT").and_then(|v| v.parse::<u16>().ok()) {
            self.server.port = port;
        }
        if let Some(path) = env_string("ROUTER_DB_PATH") {
            self.storage.db_path = PathBuf::from(path);
        }
        if let Some(workers) = env_string("DISPATCH_WORKERS").and_then(|v| v.parse().ok()) {
            self.dispatch.workers = workers;
        }
        if let Some(threshold) =
            env_string("AI_CONFIDENCE_THRESHOLD").and_then(|v| v.parse::<f64>().ok())
        {
            self.routing.confidence_threshold = threshold;
        }
        if let Some(url) = env_string("AI_SERVICE_URL") {
            self.ai.service_url = Some(url);
        }
        if let Some(key) = env_string("AI_SERVICE_KEY") {
            self.ai.api_key = Some(key);
        }

        for platform in Platform::ALL {
            let prefix = platform.as_str().to_ascii_uppercase();
            let mut settings = self.channel(platform);
            let mut touched = false;
            let mut apply = |suffix: &str, slot: &mut Option<String>| {
                if let Some(value) = env_string(&format!("{}_{}", prefix, suffix)) {
                    *slot = Some(value);
                    touched = true;
                }
            };
            apply("SECRET", &mut settings.secret);
            apply("APP_SECRET", &mut settings.secret);
            apply("VERIFY_TOKEN", &mut settings.verify_token);
            apply("ACCESS_TOKEN", &mut settings.access_token);
            apply("ACCOUNT_ID", &mut settings.account_id);
            apply("API_BASE_URL", &mut settings.api_base_url);
            apply("WEBHOOK_URL", &mut settings.webhook_url);
            apply("SENDER_ADDRESS", &mut settings.sender_address);
            if let Some(flag) = env_string(&format!("{}_ALLOW_UNSIGNED", prefix)) {
                settings.allow_unsigned = parse_bool(&flag);
                touched = true;
            }
            if touched {
                self.set_channel(platform, settings);
            }
        }
    }
}

pub fn resolve_config_path() -> Option<PathBuf> {
    if let Some(path) = env_string("ROUTER_CONFIG_PATH") {
        return Some(PathBuf::from(path));
    }
    let cwd = env::current_dir().ok()?;
    let direct = cwd.join("router.toml");
    if direct.exists() {
        return Some(direct);
    }
    warn!("ROUTER_CONFIG_PATH not set and router.toml not found; using defaults");
    None
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

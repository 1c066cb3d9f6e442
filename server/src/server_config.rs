use config::{Config, ConfigError};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::{env, path::Path, result::Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub customer_name: String,
    /// Skip the AI service entirely and emit placeholder reports.
    #[serde(default)]
    pub skip_analysis: bool,
    /// Queue only the master report, no account-specific emails.
    #[serde(default)]
    pub master_report_only: bool,
    #[serde(default)]
    pub excluded_services: Vec<String>,
    /// JSON file with the health-event batch for each run. Stands in
    /// for the provider's health feed, which is resolved upstream.
    #[serde(default)]
    pub events_file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowConfig {
    /// Cron expression for the periodic analysis run.
    pub schedule: String,
    pub ttl_days: i64,
    /// Redelivery ceiling for analysis tasks and notification messages.
    pub max_retries: u32,
    pub completion_poll_interval_secs: u64,
    pub completion_poll_max_attempts: u32,
    #[serde(default)]
    pub cleanup_after_dispatch: bool,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RateLimitConfig {
    pub window_secs: i64,
    pub max_calls_per_window: u32,
    /// Ceiling reduction applied on each upstream throttle event.
    pub backoff_decrement: u32,
    /// The ceiling never drops below this.
    pub min_calls_per_window: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AiConfig {
    pub endpoint: String,
    pub key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub top_p: f64,
    /// Attempts inside one task before falling back to a placeholder.
    pub call_max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub from: String,
    pub default_recipients: Vec<String>,
    /// Optional CC applied to account-specific emails.
    #[serde(default)]
    pub account_cc: Option<String>,
    pub smtp_host: String,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QueueConfig {
    pub dedup_window_secs: u64,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    pub use_organization: bool,
    pub use_custom: bool,
    #[serde(default)]
    pub organization_file: Option<String>,
    #[serde(default)]
    pub custom_file: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub settings: Settings,
    pub workflow: WorkflowConfig,
    pub rate_limit: RateLimitConfig,
    pub ai: AiConfig,
    pub email: EmailConfig,
    pub queues: QueueConfig,
    pub mapping: MappingConfig,
}

impl ServerConfig {
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("HEALTHWATCH").separator("__"))
            .build()?;

        builder.try_deserialize()
    }
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Server Config:\n{:?}\n\nWorkflow: {:?}\n\nRate limit: {:?}\n\nAI: model={} endpoint={}\n\nEmail: from={} default_recipients={:?}\n\nQueues: {:?}\n\nMapping: {:?}",
            self.settings,
            self.workflow,
            self.rate_limit,
            self.ai.model,
            self.ai.endpoint,
            self.email.from,
            self.email.default_recipients,
            self.queues,
            self.mapping,
        )
    }
}

lazy_static! {
    pub static ref cfg: ServerConfig = {
        let root = env::var("APP_DIR").unwrap_or_else(|_| {
            let dir =
                env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR or APP_DIR is required");
            let dir = Path::new(&dir).parent().unwrap().display().to_string();
            format!("{}/config", dir)
        });
        let path = format!("{root}/config.toml");
        ServerConfig::from_file(&path).expect("config.toml is required")
    };
}

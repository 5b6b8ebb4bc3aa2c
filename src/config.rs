//! uvclink runtime configuration handling

use crate::error::{Error, Result};
use crate::format::{DEFAULT_PREFERRED_WIDTHS, FormatCatalog, NegotiationPolicy, ResolutionCandidate};
use crate::permission::PermissionPolicy;
use crate::plugin::StartFlags;
use crate::pump::PumpPolicy;
use crate::session::{NegotiationPlan, SessionPolicy};
use crate::slots::ManagerConfig;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration structure persisted to disk or environment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UvclinkConfig {
    /// Slot table sizing and discovery
    pub slots: SlotOptions,
    /// Authorization polling
    pub permission: PermissionOptions,
    /// Device open and format selection
    pub session: SessionOptions,
    /// Mode negotiation
    pub negotiation: NegotiationOptions,
    /// Frame pump tuning
    pub pump: PumpOptions,
    /// Logging configuration
    pub logging: LoggingOptions,
    /// Daemon loop timing
    pub daemon: DaemonOptions,
}

impl UvclinkConfig {
    /// Load configuration from an explicit path or fall back to discovered defaults.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = explicit_path {
            Self::from_file(path)?
        } else if let Some(path) = Self::discover_file()? {
            tracing::info!("Using configuration file: {}", path.display());
            Self::from_file(&path)?
        } else {
            tracing::debug!("No uvclink.toml / uvclink.yaml found, using defaults");
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn discover_file() -> Result<Option<PathBuf>> {
        let cwd =
            env::current_dir().map_err(|e| Error::Config(format!("Failed to read cwd: {e}")))?;
        let local = ["uvclink.toml", "uvclink.yaml", "uvclink.yml"]
            .iter()
            .map(|name| cwd.join(name))
            .find(|path| path.exists());
        if local.is_some() {
            return Ok(local);
        }

        Ok(env::var_os("XDG_CONFIG_HOME").and_then(|xdg| {
            let base = PathBuf::from(xdg).join("uvclink");
            ["config.toml", "config.yaml"]
                .iter()
                .map(|name| base.join(name))
                .find(|path| path.exists())
        }))
    }

    /// Read configuration from a concrete file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {e}", path.display())))?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        match extension.as_str() {
            "toml" => Self::from_toml(&contents)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display()))),
            "yaml" | "yml" => serde_yaml::from_str(&contents).map_err(|e| {
                Error::Config(format!("Failed to parse YAML {}: {e}", path.display()))
            }),
            other => Err(Error::Config(format!(
                "Unsupported config format '{other}', expected toml/yaml"
            ))),
        }
    }

    /// Parse a TOML document
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(format!("Failed to parse TOML: {e}")))
    }

    fn apply_env_overrides(&mut self) {
        self.slots.apply_env_overrides();
        self.permission.apply_env_overrides();
        self.session.apply_env_overrides();
        self.negotiation.apply_env_overrides();
        self.pump.apply_env_overrides();
        self.logging.apply_env_overrides();
        self.daemon.apply_env_overrides();
    }

    /// Resolve and validate the settings consumed by the slot manager.
    pub fn manager_config(&self) -> Result<ManagerConfig> {
        if self.slots.max_slots == 0 {
            return Err(Error::Config("slots.max_slots must be at least 1".into()));
        }
        if self.permission.max_polls == 0 {
            return Err(Error::Config("permission.max_polls must be at least 1".into()));
        }
        if self.session.open_attempts == 0 {
            return Err(Error::Config("session.open_attempts must be at least 1".into()));
        }
        if self.pump.error_ceiling == 0 {
            return Err(Error::Config("pump.error_ceiling must be at least 1".into()));
        }

        let candidates = self.negotiation.resolved_candidates();
        if candidates.is_empty() {
            return Err(Error::Config("negotiation.candidates must not be empty".into()));
        }
        for candidate in &candidates {
            candidate.validate()?;
        }

        let preferred_widths = self
            .session
            .preferred_widths
            .clone()
            .unwrap_or_else(|| DEFAULT_PREFERRED_WIDTHS.to_vec());

        Ok(ManagerConfig {
            max_slots: self.slots.max_slots,
            stagger: Duration::from_millis(self.slots.stagger_ms),
            discovery_attempts: self.slots.discovery_attempts.max(1),
            discovery_interval: Duration::from_millis(self.slots.discovery_interval_ms),
            permission: PermissionPolicy {
                poll_interval: Duration::from_millis(self.permission.poll_interval_ms),
                max_polls: self.permission.max_polls,
                rerequest_every: self.permission.rerequest_every,
            },
            session: SessionPolicy {
                open_attempts: self.session.open_attempts,
                open_backoff_unit: Duration::from_millis(self.session.open_backoff_unit_ms),
                settle_delay: Duration::from_millis(self.session.settle_delay_ms),
                close_stale_handle: self.session.close_stale_handle,
                catalog: FormatCatalog::new(preferred_widths),
                negotiation: NegotiationPlan {
                    policy: self.negotiation.policy,
                    candidates,
                    settle: Duration::from_millis(self.negotiation.candidate_settle_ms),
                    flags: self.negotiation.flags,
                },
                pump: PumpPolicy {
                    error_ceiling: self.pump.error_ceiling,
                    retry_delay: Duration::from_millis(self.pump.retry_delay_ms),
                    log_every: self.pump.log_every,
                },
            },
        })
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}

/// Slot table sizing and startup discovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotOptions {
    /// Number of capture slots
    pub max_slots: usize,
    /// Pause between slot setups during the initial fill
    pub stagger_ms: u64,
    /// Enumeration rounds before the initial fill gives up
    pub discovery_attempts: u32,
    /// Pause between enumeration rounds
    pub discovery_interval_ms: u64,
}

impl Default for SlotOptions {
    fn default() -> Self {
        Self {
            max_slots: 2,
            stagger_ms: 1_000,
            discovery_attempts: 10,
            discovery_interval_ms: 1_000,
        }
    }
}

impl SlotOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(slots) = env_parse("UVCLINK_MAX_SLOTS") {
            self.max_slots = slots;
        }
        if let Some(stagger) = env_parse("UVCLINK_STAGGER_MS") {
            self.stagger_ms = stagger;
        }
        if let Some(attempts) = env_parse("UVCLINK_DISCOVERY_ATTEMPTS") {
            self.discovery_attempts = attempts;
        }
    }
}

/// Authorization polling schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionOptions {
    /// Wait between grant polls
    pub poll_interval_ms: u64,
    /// Polls before a device is reported as not authorized
    pub max_polls: u32,
    /// Re-issue the request after every n-th unsuccessful poll (0 disables)
    pub rerequest_every: u32,
}

impl Default for PermissionOptions {
    fn default() -> Self {
        let policy = PermissionPolicy::default();
        Self {
            poll_interval_ms: policy.poll_interval.as_millis() as u64,
            max_polls: policy.max_polls,
            rerequest_every: policy.rerequest_every,
        }
    }
}

impl PermissionOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(interval) = env_parse("UVCLINK_PERMISSION_POLL_MS") {
            self.poll_interval_ms = interval;
        }
        if let Some(polls) = env_parse("UVCLINK_PERMISSION_MAX_POLLS") {
            self.max_polls = polls;
        }
    }
}

/// Device open and format selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Open attempts per setup
    pub open_attempts: u32,
    /// Linear open backoff unit
    pub open_backoff_unit_ms: u64,
    /// Wait after device preparation
    pub settle_delay_ms: u64,
    /// Close a leftover native handle before opening
    pub close_stale_handle: bool,
    /// Preferred MJPEG widths, most wanted first
    pub preferred_widths: Option<Vec<u32>>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            open_attempts: 3,
            open_backoff_unit_ms: 1_000,
            settle_delay_ms: 1_000,
            close_stale_handle: true,
            preferred_widths: None,
        }
    }
}

impl SessionOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(attempts) = env_parse("UVCLINK_OPEN_ATTEMPTS") {
            self.open_attempts = attempts;
        }
        if let Some(settle) = env_parse("UVCLINK_SETTLE_DELAY_MS") {
            self.settle_delay_ms = settle;
        }
        if let Some(close) = env_flag("UVCLINK_CLOSE_STALE_HANDLE") {
            self.close_stale_handle = close;
        }
        if let Ok(widths) = env::var("UVCLINK_PREFERRED_WIDTHS") {
            let parsed: Vec<u32> = widths
                .split(',')
                .filter_map(|w| w.trim().parse().ok())
                .collect();
            if !parsed.is_empty() {
                self.preferred_widths = Some(parsed);
            }
        }
    }
}

/// Mode negotiation table and pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationOptions {
    /// How the candidate table is walked
    pub policy: NegotiationPolicy,
    /// Wait after each rejected candidate
    pub candidate_settle_ms: u64,
    /// Explicit candidate table; the policy's default table when absent
    pub candidates: Option<Vec<ResolutionCandidate>>,
    /// Pass-through start flags
    pub flags: StartFlags,
}

impl Default for NegotiationOptions {
    fn default() -> Self {
        Self {
            policy: NegotiationPolicy::default(),
            candidate_settle_ms: 300,
            candidates: None,
            flags: StartFlags::default(),
        }
    }
}

impl NegotiationOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(policy) = env::var("UVCLINK_NEGOTIATION_POLICY") {
            match policy.parse::<NegotiationPolicy>() {
                Ok(parsed) => self.policy = parsed,
                Err(err) => tracing::warn!("{err}"),
            }
        }
        if let Some(settle) = env_parse("UVCLINK_CANDIDATE_SETTLE_MS") {
            self.candidate_settle_ms = settle;
        }
    }

    /// Configured table, or the policy default
    pub fn resolved_candidates(&self) -> Vec<ResolutionCandidate> {
        self.candidates
            .clone()
            .unwrap_or_else(|| self.policy.default_candidates())
    }
}

/// Frame pump tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpOptions {
    /// Consecutive failed frames that end the pump
    pub error_ceiling: u32,
    /// Wait after a failed frame
    pub retry_delay_ms: u64,
    /// Emit a progress log every n committed frames
    pub log_every: u64,
}

impl Default for PumpOptions {
    fn default() -> Self {
        Self {
            error_ceiling: 10,
            retry_delay_ms: 100,
            log_every: 60,
        }
    }
}

impl PumpOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(ceiling) = env_parse("UVCLINK_FRAME_ERROR_CEILING") {
            self.error_ceiling = ceiling;
        }
        if let Some(delay) = env_parse("UVCLINK_FRAME_RETRY_MS") {
            self.retry_delay_ms = delay;
        }
    }
}

/// Daemon loop timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonOptions {
    /// Seconds between reconcile passes
    pub reconcile_interval_secs: u64,
    /// Seconds between status reports
    pub status_interval_secs: u64,
}

impl Default for DaemonOptions {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: 5,
            status_interval_secs: 10,
        }
    }
}

impl DaemonOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(interval) = env_parse::<u64>("UVCLINK_RECONCILE_INTERVAL") {
            self.reconcile_interval_secs = interval.max(1);
        }
        if let Some(interval) = env_parse::<u64>("UVCLINK_STATUS_INTERVAL") {
            self.status_interval_secs = interval.max(1);
        }
    }
}

/// Structured logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingOptions {
    /// Default log level (overridable via `UVCLINK_LOG_LEVEL`)
    pub level: String,
    /// Optional log file path for teeing structured logs
    pub file: Option<PathBuf>,
    /// Force ANSI colors in stdout logging
    pub color: bool,
    /// Enable periodic metrics summaries over tracing
    pub metrics: bool,
    /// Interval in seconds for emitting aggregated metrics when enabled
    pub metrics_interval_secs: u64,
    /// Optional log rotation strategy applied to `file`
    pub rotation: Option<LogRotation>,
    /// Optional bind address for exposing runtime metrics over HTTP (e.g., "127.0.0.1:9910")
    pub metrics_endpoint: Option<String>,
    /// Output format for the metrics endpoint (`json` or `prometheus`)
    pub metrics_format: MetricsFormat,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            color: true,
            metrics: false,
            metrics_interval_secs: 60,
            rotation: None,
            metrics_endpoint: None,
            metrics_format: MetricsFormat::Json,
        }
    }
}

impl LoggingOptions {
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(level) = env::var("UVCLINK_LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(file) = env::var("UVCLINK_LOG_FILE") {
            self.file = Some(PathBuf::from(file));
        }
        if let Some(color) = env_flag("UVCLINK_LOG_COLOR") {
            self.color = color;
        }
        if let Some(metrics) = env_flag("UVCLINK_LOG_METRICS") {
            self.metrics = metrics;
        }
        if let Some(interval) = env_parse::<u64>("UVCLINK_LOG_METRICS_INTERVAL") {
            self.metrics_interval_secs = interval.max(5);
        }
        if let Ok(rotation) = env::var("UVCLINK_LOG_ROTATION") {
            if let Ok(parsed) = rotation.parse::<LogRotation>() {
                self.rotation = Some(parsed);
            }
        }
        if let Ok(endpoint) = env::var("UVCLINK_METRICS_ENDPOINT") {
            self.metrics_endpoint = Some(endpoint);
        }
        if let Ok(format) = env::var("UVCLINK_METRICS_FORMAT") {
            if let Ok(parsed) = format.parse::<MetricsFormat>() {
                self.metrics_format = parsed;
            }
        }
    }
}

/// Supported log rotation policies for file sinks
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// Rotate log files once per hour
    Hourly,
    /// Rotate log files once per day
    Daily,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            other => Err(format!("Unknown log rotation '{other}'")),
        }
    }
}

/// Supported serialization formats for the metrics endpoint
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricsFormat {
    /// Emit metrics as structured JSON
    Json,
    /// Emit metrics in Prometheus text exposition format
    Prometheus,
}

impl FromStr for MetricsFormat {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "prometheus" => Ok(Self::Prometheus),
            _ => Err(format!(
                "Unsupported metrics format '{value}', expected 'json' or 'prometheus'"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve() {
        let manager = UvclinkConfig::default().manager_config().unwrap();
        assert_eq!(manager.max_slots, 2);
        assert_eq!(manager.stagger, Duration::from_secs(1));
        assert_eq!(manager.discovery_attempts, 10);
        assert_eq!(manager.permission, PermissionPolicy::default());
        assert_eq!(manager.session, SessionPolicy::default());
    }

    #[test]
    fn test_toml_sections() {
        let config = UvclinkConfig::from_toml(
            r#"
            [slots]
            max_slots = 4

            [negotiation]
            policy = "descending"
            candidate_settle_ms = 50

            [[negotiation.candidates]]
            width = 1280
            height = 720
            fps = 15
            format_selector = 9
            bandwidth = 0.5

            [pump]
            error_ceiling = 3
            "#,
        )
        .unwrap();

        let manager = config.manager_config().unwrap();
        assert_eq!(manager.max_slots, 4);
        let plan = &manager.session.negotiation;
        assert_eq!(plan.policy, NegotiationPolicy::Descending);
        assert_eq!(plan.settle, Duration::from_millis(50));
        assert_eq!(plan.candidates, vec![ResolutionCandidate::new(1280, 720, 15, 9, 0.5)]);
        assert_eq!(manager.session.pump.error_ceiling, 3);
    }

    #[test]
    fn test_policy_default_table_follows_policy() {
        let config = UvclinkConfig::from_toml("[negotiation]\npolicy = \"descending\"\n").unwrap();
        let manager = config.manager_config().unwrap();
        assert_eq!(
            manager.session.negotiation.candidates,
            NegotiationPolicy::Descending.default_candidates()
        );
    }

    #[test]
    fn test_rejects_out_of_range_bandwidth() {
        let mut config = UvclinkConfig::default();
        config.negotiation.candidates = Some(vec![ResolutionCandidate::new(640, 480, 30, 8, 1.5)]);
        assert!(matches!(config.manager_config(), Err(Error::Config(_))));

        config.negotiation.candidates = Some(vec![ResolutionCandidate::new(640, 480, 30, 8, 0.0)]);
        assert!(matches!(config.manager_config(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_zero_slots() {
        let mut config = UvclinkConfig::default();
        config.slots.max_slots = 0;
        assert!(matches!(config.manager_config(), Err(Error::Config(_))));
    }

    #[test]
    fn test_yaml_file() {
        let dir = env::temp_dir().join(format!("uvclink-config-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("uvclink.yaml");
        fs::write(&path, "slots:\n  max_slots: 3\nlogging:\n  metrics_format: prometheus\n").unwrap();

        let config = UvclinkConfig::from_file(&path).unwrap();
        assert_eq!(config.slots.max_slots, 3);
        assert_eq!(config.logging.metrics_format, MetricsFormat::Prometheus);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_unknown_extension_rejected() {
        let err = UvclinkConfig::from_file(Path::new("/nonexistent/uvclink.ini")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}

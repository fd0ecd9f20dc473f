use chrono_tz::Tz;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ScanlogConfig {
    pub device: DeviceConfig,
    pub server: ServerConfig,
    pub sync: SyncConfig,
    pub storage: StorageConfig,
    pub reader: ReaderConfig,
    pub dashboard: DashboardConfig,
    pub logging: LoggingConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DeviceConfig {
    /// Identity sent in the X-Device-Id header and stamped on every record
    #[serde(default = "default_device_id")]
    pub id: String,

    /// Human readable device name
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Physical location stamped on every record
    #[serde(default = "default_device_location")]
    pub location: String,

    /// Device type reported on registration
    #[serde(default = "default_device_type")]
    pub device_type: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    /// Base URL of the remote attendance API
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Bearer credential
    #[serde(default)]
    pub api_key: String,

    /// Per-request timeout in seconds (batch requests get twice this)
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Records wait for the periodic drain
    Batch,
    /// Each record is also sent as soon as it is stored
    Immediate,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Batch => write!(f, "batch"),
            SyncMode::Immediate => write!(f, "immediate"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_sync_mode")]
    pub mode: SyncMode,

    /// Records per batch request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds between periodic drains
    #[serde(default = "default_sync_interval")]
    pub interval_seconds: u64,

    /// Periodic drains are skipped while fewer records than this are pending
    #[serde(default = "default_min_records_for_sync")]
    pub min_records_for_sync: usize,

    /// Pause between consecutive batch requests in one drain
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StorageConfig {
    /// Path of the durable record file
    #[serde(default = "default_storage_path")]
    pub path: String,

    /// Capacity; the oldest record is evicted beyond this
    #[serde(default = "default_max_records")]
    pub max_records: usize,

    /// Remove synced records after a drain that synced something
    #[serde(default = "default_cleanup_after_sync")]
    pub cleanup_after_sync: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ReaderConfig {
    /// "stdin" or a path to a line-oriented card source
    #[serde(default = "default_reader_source")]
    pub source: String,

    /// Repeated reads of the same card inside this window are ignored
    #[serde(default = "default_debounce_seconds")]
    pub debounce_seconds: u64,

    /// Request shutdown when the card source reaches end of input
    #[serde(default)]
    pub exit_on_eof: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DashboardConfig {
    #[serde(default = "default_dashboard_enabled")]
    pub enabled: bool,

    /// IP address to bind to
    #[serde(default = "default_dashboard_ip")]
    pub ip: String,

    /// Port to listen on
    #[serde(default = "default_dashboard_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct LoggingConfig {
    /// Directory for a daily rolling log file; console only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SystemConfig {
    /// IANA timezone for human facing timestamps
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

/// Effective sync policy handed to the orchestrator, with durations resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub mode: SyncMode,
    pub batch_size: usize,
    pub interval: Duration,
    pub min_records_for_sync: usize,
    pub chunk_delay: Duration,
    pub cleanup_after_sync: bool,
}

impl SyncSettings {
    pub fn from_config(config: &ScanlogConfig) -> Self {
        Self {
            mode: config.sync.mode,
            batch_size: config.sync.batch_size,
            interval: Duration::from_secs(config.sync.interval_seconds),
            min_records_for_sync: config.sync.min_records_for_sync,
            chunk_delay: Duration::from_millis(config.sync.chunk_delay_ms),
            cleanup_after_sync: config.storage.cleanup_after_sync,
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&ScanlogConfig::default())
    }
}

impl ScanlogConfig {
    /// Load configuration from default sources (file + environment variables)
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_file("scanlog.toml")
    }

    /// Load configuration from a specific file path
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("device.id", default_device_id())?
            .set_default("device.name", default_device_name())?
            .set_default("device.location", default_device_location())?
            .set_default("device.device_type", default_device_type())?
            .set_default("server.api_url", default_api_url())?
            .set_default("server.api_key", "")?
            .set_default("server.timeout_seconds", default_timeout_seconds())?
            .set_default("sync.mode", default_sync_mode().to_string())?
            .set_default("sync.batch_size", default_batch_size() as i64)?
            .set_default("sync.interval_seconds", default_sync_interval())?
            .set_default(
                "sync.min_records_for_sync",
                default_min_records_for_sync() as i64,
            )?
            .set_default("sync.chunk_delay_ms", default_chunk_delay_ms())?
            .set_default("storage.path", default_storage_path())?
            .set_default("storage.max_records", default_max_records() as i64)?
            .set_default("storage.cleanup_after_sync", default_cleanup_after_sync())?
            .set_default("reader.source", default_reader_source())?
            .set_default("reader.debounce_seconds", default_debounce_seconds())?
            .set_default("reader.exit_on_eof", false)?
            .set_default("dashboard.enabled", default_dashboard_enabled())?
            .set_default("dashboard.ip", default_dashboard_ip())?
            .set_default("dashboard.port", default_dashboard_port())?
            .set_default("logging.file_prefix", default_log_file_prefix())?
            .set_default("system.timezone", default_timezone())?
            // Add configuration file (optional)
            .add_source(File::with_name(&path_str).required(false))
            // Environment overrides, e.g. SCANLOG__SYNC__BATCH_SIZE=20
            .add_source(
                Environment::with_prefix("SCANLOG")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ScanlogConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config.redacted());

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.id.trim().is_empty() {
            return Err(ConfigError::Message(
                "Device id must not be empty".to_string(),
            ));
        }

        if self.server.api_url.trim().is_empty() {
            return Err(ConfigError::Message(
                "Server api_url must not be empty".to_string(),
            ));
        }

        if self.server.timeout_seconds == 0 {
            return Err(ConfigError::Message(
                "Server timeout_seconds must be greater than 0".to_string(),
            ));
        }

        if self.sync.batch_size == 0 {
            return Err(ConfigError::Message(
                "Sync batch_size must be greater than 0".to_string(),
            ));
        }

        if self.sync.interval_seconds == 0 {
            return Err(ConfigError::Message(
                "Sync interval_seconds must be greater than 0".to_string(),
            ));
        }

        if self.sync.min_records_for_sync == 0 {
            return Err(ConfigError::Message(
                "Sync min_records_for_sync must be greater than 0".to_string(),
            ));
        }

        if self.storage.max_records == 0 {
            return Err(ConfigError::Message(
                "Storage max_records must be greater than 0".to_string(),
            ));
        }

        self.timezone()?;

        Ok(())
    }

    /// Parsed display timezone
    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.system.timezone.parse::<Tz>().map_err(|e| {
            ConfigError::Message(format!(
                "Unknown timezone '{}': {}",
                self.system.timezone, e
            ))
        })
    }

    /// Copy of the configuration that is safe to log or serve
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.server.api_key = mask_secret(&self.server.api_key);
        copy
    }
}

/// Keep only the last eight characters of a secret
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() > 8 {
        let tail: String = chars[chars.len() - 8..].iter().collect();
        format!("***{}", tail)
    } else {
        "***HIDDEN***".to_string()
    }
}

impl Default for ScanlogConfig {
    fn default() -> Self {
        Self {
            device: DeviceConfig {
                id: default_device_id(),
                name: default_device_name(),
                location: default_device_location(),
                device_type: default_device_type(),
            },
            server: ServerConfig {
                api_url: default_api_url(),
                api_key: String::new(),
                timeout_seconds: default_timeout_seconds(),
            },
            sync: SyncConfig {
                mode: default_sync_mode(),
                batch_size: default_batch_size(),
                interval_seconds: default_sync_interval(),
                min_records_for_sync: default_min_records_for_sync(),
                chunk_delay_ms: default_chunk_delay_ms(),
            },
            storage: StorageConfig {
                path: default_storage_path(),
                max_records: default_max_records(),
                cleanup_after_sync: default_cleanup_after_sync(),
            },
            reader: ReaderConfig {
                source: default_reader_source(),
                debounce_seconds: default_debounce_seconds(),
                exit_on_eof: false,
            },
            dashboard: DashboardConfig {
                enabled: default_dashboard_enabled(),
                ip: default_dashboard_ip(),
                port: default_dashboard_port(),
            },
            logging: LoggingConfig {
                directory: None,
                file_prefix: default_log_file_prefix(),
            },
            system: SystemConfig {
                timezone: default_timezone(),
            },
        }
    }
}

// Default value functions
fn default_device_id() -> String {
    "edge-001".to_string()
}
fn default_device_name() -> String {
    "Edge Reader".to_string()
}
fn default_device_location() -> String {
    "Main Entrance".to_string()
}
fn default_device_type() -> String {
    "ATLAS_EDGE".to_string()
}

fn default_api_url() -> String {
    "http://localhost:3000/api".to_string()
}
fn default_timeout_seconds() -> u64 {
    10
}

fn default_sync_mode() -> SyncMode {
    SyncMode::Batch
}
fn default_batch_size() -> usize {
    50
}
fn default_sync_interval() -> u64 {
    300
}
fn default_min_records_for_sync() -> usize {
    1
}
fn default_chunk_delay_ms() -> u64 {
    500
}

fn default_storage_path() -> String {
    "data/offline_records.json".to_string()
}
fn default_max_records() -> usize {
    10_000
}
fn default_cleanup_after_sync() -> bool {
    true
}

fn default_reader_source() -> String {
    "stdin".to_string()
}
fn default_debounce_seconds() -> u64 {
    2
}

fn default_dashboard_enabled() -> bool {
    true
}
fn default_dashboard_ip() -> String {
    "0.0.0.0".to_string()
}
fn default_dashboard_port() -> u16 {
    8080
}

fn default_log_file_prefix() -> String {
    "scanlog.log".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ScanlogConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sync.mode, SyncMode::Batch);
        assert_eq!(config.sync.batch_size, 50);
        assert_eq!(config.storage.max_records, 10_000);
        assert!(config.storage.cleanup_after_sync);
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[device]
id = "gate-7"

[sync]
mode = "immediate"
batch_size = 20

[storage]
max_records = 3
"#
        )
        .unwrap();

        let config = ScanlogConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.device.id, "gate-7");
        assert_eq!(config.device.location, "Main Entrance");
        assert_eq!(config.sync.mode, SyncMode::Immediate);
        assert_eq!(config.sync.batch_size, 20);
        assert_eq!(config.sync.interval_seconds, 300);
        assert_eq!(config.storage.max_records, 3);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = ScanlogConfig::load_from_file("/nonexistent/scanlog-test.toml").unwrap();
        assert_eq!(config.server.timeout_seconds, 10);
        assert_eq!(config.reader.source, "stdin");
    }

    #[test]
    fn test_config_validation() {
        let mut config = ScanlogConfig::default();

        config.sync.batch_size = 0;
        assert!(config.validate().is_err());
        config.sync.batch_size = 10;

        config.storage.max_records = 0;
        assert!(config.validate().is_err());
        config.storage.max_records = 5;

        config.system.timezone = "Mars/Olympus".to_string();
        assert!(config.validate().is_err());
        config.system.timezone = "Europe/Berlin".to_string();

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sync_settings_from_config() {
        let mut config = ScanlogConfig::default();
        config.sync.chunk_delay_ms = 0;
        config.storage.cleanup_after_sync = false;

        let settings = SyncSettings::from_config(&config);
        assert_eq!(settings.interval, Duration::from_secs(300));
        assert_eq!(settings.chunk_delay, Duration::ZERO);
        assert!(!settings.cleanup_after_sync);
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("short"), "***HIDDEN***");
        assert_eq!(mask_secret("abcdefgh12345678"), "***12345678");

        let mut config = ScanlogConfig::default();
        config.server.api_key = "secret-token-value".to_string();
        assert_eq!(config.redacted().server.api_key, "***en-value");
    }

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let rendered = toml::to_string_pretty(&ScanlogConfig::default()).unwrap();
        let parsed: ScanlogConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.device.id, "edge-001");
        assert_eq!(parsed.sync.mode, SyncMode::Batch);
    }
}

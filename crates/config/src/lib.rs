#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Typed configuration for the counter-acquisition core: device/channel
//! topology, the writer target, and logging, loaded from JSON with an
//! environment-variable overlay and validated all at once rather than
//! failing on the first bad field.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use validator::Validate;

/// Width and endianness of the registers backing one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    /// A single 16-bit register.
    UInt16,
    /// Two registers, low word first.
    UInt32LowHigh,
    /// Two registers, high word first.
    UInt32HighLow,
}

impl DataType {
    /// The number of holding registers this data type occupies.
    pub fn register_count(self) -> u8 {
        match self {
            DataType::UInt16 => 1,
            DataType::UInt32LowHigh | DataType::UInt32HighLow => 2,
        }
    }
}

/// How to read and interpret one counter channel of a device.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ChannelConfig {
    /// 0-based, unique within the owning device.
    pub channel_number: u16,
    /// Human-readable name, used in tags and logs.
    pub name: String,
    /// Modbus holding-register start address.
    pub start_register: u16,
    /// Number of registers this channel spans; must match `data_type`.
    #[validate(range(min = 1, max = 2))]
    pub register_count: u8,
    /// How the raw registers decode into a counter value.
    pub data_type: DataType,
    /// Multiplier applied to the decoded, overflow-adjusted value. Must be
    /// `> 0.0` and `<= 1000.0`; checked in `validate` rather than via a
    /// derive attribute since the lower bound is exclusive.
    pub scale_factor: f64,
    /// Additive offset applied after scaling.
    #[serde(default)]
    pub offset: f64,
    /// Number of decimal places `processed_value` is rounded to.
    #[validate(range(min = 0, max = 10))]
    pub decimal_places: u8,
    /// Lower bound of a plausible processed value.
    pub min_value: f64,
    /// Upper bound of a plausible processed value.
    pub max_value: f64,
    /// Optional ceiling on `|rate_per_second|` before quality degrades to
    /// `Uncertain`.
    #[serde(default)]
    pub max_change_rate: Option<f64>,
    /// Whether this channel is polled at all.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Arbitrary tags merged with the device's tags on every `Reading`.
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// Network endpoint, poll cadence, and channel list for one device.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeviceConfig {
    /// Stable, unique identifier across the whole configuration.
    pub device_id: String,
    /// Modbus/TCP host.
    pub host: String,
    /// Modbus/TCP port.
    pub port: u16,
    /// Modbus unit identifier sent in the MBAP header.
    pub unit_id: u8,
    /// Per-call I/O deadline.
    pub timeout_ms: u64,
    /// Target interval between poll ticks.
    #[validate(range(min = 100))]
    pub poll_interval_ms: u64,
    /// Maximum read attempts within a single tick before the channel's
    /// frame is marked `Bad`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base backoff between retries within a tick; doubled per attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Whether a worker is started for this device.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ordered channels read from this device.
    #[validate(nested)]
    pub channels: Vec<ChannelConfig>,
    /// Tags merged into every channel's tags on this device.
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

/// Connection details for an InfluxDB line-protocol writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfluxWriterConfig {
    /// Base URL of the InfluxDB HTTP API.
    pub url: String,
    /// Auth token.
    pub token: String,
    /// Organisation name.
    pub org: String,
    /// Destination bucket.
    pub bucket: String,
    /// Measurement name; defaults to `counter_data`.
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

fn default_measurement() -> String {
    "counter_data".to_string()
}

/// Connection details for a TimescaleDB row-set writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimescaleWriterConfig {
    /// `postgres://` connection string.
    pub dsn: String,
    /// Destination table; defaults to `counter_readings`.
    #[serde(default = "default_table")]
    pub table: String,
}

fn default_table() -> String {
    "counter_readings".to_string()
}

/// Which write target is active for this process. Exactly one at a time,
/// per the deployment's choice (never both InfluxDB and TimescaleDB).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterConfig {
    /// Write line protocol over HTTP to InfluxDB.
    Influx(InfluxWriterConfig),
    /// Write row sets to TimescaleDB.
    Timescale(TimescaleWriterConfig),
    /// Discard every batch; used in dry-run and tests.
    Null,
}

/// Batching, retry, and dead-letter-queue knobs for the writer (C6), shared
/// by whichever write target is active.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct WriterSettings {
    /// Flush once the buffer holds this many readings.
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1))]
    pub batch_size: usize,
    /// Flush once the oldest buffered reading is at least this old, even if
    /// `batch_size` has not been reached.
    #[serde(default = "default_flush_interval_ms")]
    #[validate(range(min = 1))]
    pub flush_interval_ms: u64,
    /// Retries attempted for a transient (network or 5xx) write failure
    /// before the batch is spilled to the dead-letter queue.
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Base retry delay; doubled per attempt, capped at 10s.
    #[serde(default = "default_retry_delay_ms")]
    #[validate(range(min = 1))]
    pub retry_delay_ms: u64,
    /// Directory dead-letter segments are written under.
    #[serde(default = "default_dlq_directory")]
    pub dlq_directory: String,
    /// Maximum size of one dead-letter segment file before it is rotated.
    #[serde(default = "default_dlq_segment_size_bytes")]
    #[validate(range(min = 1))]
    pub dlq_segment_size_bytes: u64,
    /// Maximum number of rotated segments retained; the oldest is dropped
    /// (with a logged warning) once the limit is exceeded.
    #[serde(default = "default_dlq_max_segments")]
    #[validate(range(min = 1))]
    pub dlq_max_segments: usize,
    /// How often the background task probes `is_healthy()` to decide
    /// whether to re-drain the dead-letter queue.
    #[serde(default = "default_health_probe_interval_ms")]
    #[validate(range(min = 1))]
    pub health_probe_interval_ms: u64,
}

fn default_batch_size() -> usize {
    500
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_max_retry_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_dlq_directory() -> String {
    "dlq".to_string()
}

fn default_dlq_segment_size_bytes() -> u64 {
    64 * 1024 * 1024
}

fn default_dlq_max_segments() -> usize {
    16
}

fn default_health_probe_interval_ms() -> u64 {
    5_000
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            dlq_directory: default_dlq_directory(),
            dlq_segment_size_bytes: default_dlq_segment_size_bytes(),
            dlq_max_segments: default_dlq_max_segments(),
            health_probe_interval_ms: default_health_probe_interval_ms(),
        }
    }
}

/// Output format and minimum level for structured logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable text, suitable for a terminal.
    Text,
    /// Newline-delimited JSON, suitable for log aggregation.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"info"`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: default_log_level(),
        }
    }
}

/// The whole process configuration, as loaded from the JSON config source
/// named in the external interface.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RootConfig {
    /// Every configured device, enabled or not.
    #[validate(nested)]
    pub devices: Vec<DeviceConfig>,
    /// InfluxDB writer settings, if this deployment writes to InfluxDB.
    #[serde(default)]
    pub influxdb: Option<InfluxWriterConfig>,
    /// TimescaleDB writer settings, if this deployment writes to
    /// TimescaleDB.
    #[serde(default)]
    pub timescaledb: Option<TimescaleWriterConfig>,
    /// Batching, retry, and dead-letter-queue settings for the writer.
    #[serde(default)]
    #[validate(nested)]
    pub writer_settings: WriterSettings,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Run with a simulated transport instead of real Modbus/TCP sockets.
    #[serde(default)]
    pub demo_mode: bool,
}

impl RootConfig {
    /// Resolves the `influxdb`/`timescaledb` fields into a single writer
    /// target. Returns `WriterConfig::Null` when neither is configured
    /// (e.g. dry-run); callers that require a live writer should reject
    /// that case explicitly.
    pub fn writer(&self) -> WriterConfig {
        match (&self.influxdb, &self.timescaledb) {
            (Some(influx), _) => WriterConfig::Influx(influx.clone()),
            (None, Some(timescale)) => WriterConfig::Timescale(timescale.clone()),
            (None, None) => WriterConfig::Null,
        }
    }
}

/// One validation failure, identified by a dotted path so operators can
/// locate the offending field without parsing a message string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigIssue {
    /// Dotted path to the offending field, e.g. `devices[1].channels[0]`.
    pub path: String,
    /// Human-readable description of the failure.
    pub message: String,
}

impl ConfigIssue {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read.
    #[error("could not read configuration file `{file}`: {source}")]
    Io {
        /// Path that was read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The config file was not valid JSON.
    #[error("could not parse configuration file `{file}`: {source}")]
    Parse {
        /// Path that was parsed.
        file: String,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },

    /// One or more fields failed validation. Every issue found is
    /// returned together rather than only the first.
    #[error("{} configuration issue(s) found", .0.len())]
    Invalid(Vec<ConfigIssue>),
}

/// Loads, overlays, and validates a configuration file in one step.
///
/// Environment overrides are layered onto the parsed JSON document before
/// validation, following the `ADAM_<DEVICE_ID>_<FIELD>` convention.
pub fn load_and_validate(path: &Path) -> Result<RootConfig, Error> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Io {
        file: path.display().to_string(),
        source,
    })?;

    let mut config: RootConfig = serde_json::from_str(&raw).map_err(|source| Error::Parse {
        file: path.display().to_string(),
        source,
    })?;

    apply_env_overrides(&mut config, std::env::vars());

    let issues = validate(&config);
    if issues.is_empty() {
        Ok(config)
    } else {
        Err(Error::Invalid(issues))
    }
}

/// Applies `ADAM_<DEVICE_ID>_<FIELD>` environment overrides onto an
/// already-parsed configuration. Device IDs are matched case-sensitively
/// after upper-casing and replacing non-alphanumeric characters with `_`,
/// so `device_id = "line-1"` is addressed as `ADAM_LINE_1_POLL_INTERVAL_MS`.
pub fn apply_env_overrides(config: &mut RootConfig, vars: impl Iterator<Item = (String, String)>) {
    let overrides: Vec<(String, String)> = vars
        .filter(|(key, _)| key.starts_with("ADAM_"))
        .collect();

    for device in &mut config.devices {
        let slug = env_slug(&device.device_id);
        let prefix = format!("ADAM_{slug}_");

        for (key, value) in &overrides {
            let Some(field) = key.strip_prefix(&prefix) else {
                continue;
            };

            match field {
                "POLL_INTERVAL_MS" => apply_parsed(&mut device.poll_interval_ms, value, key),
                "TIMEOUT_MS" => apply_parsed(&mut device.timeout_ms, value, key),
                "MAX_RETRIES" => apply_parsed(&mut device.max_retries, value, key),
                "RETRY_BACKOFF_MS" => apply_parsed(&mut device.retry_backoff_ms, value, key),
                "ENABLED" => apply_parsed(&mut device.enabled, value, key),
                _ => {}
            }
        }
    }
}

fn env_slug(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn apply_parsed<T: std::str::FromStr>(target: &mut T, value: &str, key: &str) {
    match value.parse() {
        Ok(parsed) => *target = parsed,
        Err(_) => tracing::warn!(env_var = %key, value = %value, "ignoring override with unparsable value"),
    }
}

/// Runs every cross-field check named in the configuration and validation
/// contract, returning every failure found rather than stopping at the
/// first one.
pub fn validate(config: &RootConfig) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    if let Err(errors) = config.validate() {
        for (field, field_errors) in errors.field_errors() {
            for error in field_errors {
                issues.push(ConfigIssue::new(
                    field.to_string(),
                    error
                        .message
                        .as_ref()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| format!("failed `{}` validation", error.code)),
                ));
            }
        }
    }

    let mut seen_device_ids = HashSet::new();
    for (device_index, device) in config.devices.iter().enumerate() {
        let device_path = format!("devices[{device_index}]");

        if !seen_device_ids.insert(device.device_id.clone()) {
            issues.push(ConfigIssue::new(
                device_path.clone(),
                format!("duplicate device_id `{}`", device.device_id),
            ));
        }

        if device.timeout_ms > device.poll_interval_ms {
            issues.push(ConfigIssue::new(
                format!("{device_path}.timeout_ms"),
                format!(
                    "timeout_ms ({}) must be <= poll_interval_ms ({})",
                    device.timeout_ms, device.poll_interval_ms
                ),
            ));
        }

        let mut seen_channel_numbers = HashSet::new();
        for (channel_index, channel) in device.channels.iter().enumerate() {
            let channel_path = format!("{device_path}.channels[{channel_index}]");

            if !seen_channel_numbers.insert(channel.channel_number) {
                issues.push(ConfigIssue::new(
                    channel_path.clone(),
                    format!("duplicate channel_number {}", channel.channel_number),
                ));
            }

            let expected_register_count = channel.data_type.register_count();
            if channel.register_count != expected_register_count {
                issues.push(ConfigIssue::new(
                    format!("{channel_path}.register_count"),
                    format!(
                        "register_count {} does not match data_type {:?} (expected {})",
                        channel.register_count, channel.data_type, expected_register_count
                    ),
                ));
            }

            if !(channel.scale_factor > 0.0 && channel.scale_factor <= 1000.0) {
                issues.push(ConfigIssue::new(
                    format!("{channel_path}.scale_factor"),
                    format!(
                        "scale_factor ({}) must be > 0 and <= 1000",
                        channel.scale_factor
                    ),
                ));
            }

            if !(channel.min_value < channel.max_value) {
                issues.push(ConfigIssue::new(
                    format!("{channel_path}.min_value"),
                    format!(
                        "min_value ({}) must be < max_value ({})",
                        channel.min_value, channel.max_value
                    ),
                ));
            }
        }
    }

    match (&config.influxdb, &config.timescaledb) {
        (Some(_), Some(_)) => issues.push(ConfigIssue::new(
            "writer",
            "only one of `influxdb` or `timescaledb` may be configured",
        )),
        (Some(influx), None) => validate_influx(influx, &mut issues),
        (None, Some(timescale)) => validate_timescale(timescale, &mut issues),
        (None, None) => {}
    }

    validate_writer_settings(&config.writer_settings, &mut issues);

    issues
}

fn validate_writer_settings(settings: &WriterSettings, issues: &mut Vec<ConfigIssue>) {
    if settings.batch_size == 0 {
        issues.push(ConfigIssue::new("writer_settings.batch_size", "must be >= 1"));
    }
    if settings.flush_interval_ms == 0 {
        issues.push(ConfigIssue::new("writer_settings.flush_interval_ms", "must be >= 1"));
    }
    if settings.retry_delay_ms == 0 {
        issues.push(ConfigIssue::new("writer_settings.retry_delay_ms", "must be >= 1"));
    }
    if settings.dlq_segment_size_bytes == 0 {
        issues.push(ConfigIssue::new("writer_settings.dlq_segment_size_bytes", "must be >= 1"));
    }
    if settings.dlq_max_segments == 0 {
        issues.push(ConfigIssue::new("writer_settings.dlq_max_segments", "must be >= 1"));
    }
    if settings.dlq_directory.trim().is_empty() {
        issues.push(ConfigIssue::new("writer_settings.dlq_directory", "must not be empty"));
    }
}

fn validate_influx(influx: &InfluxWriterConfig, issues: &mut Vec<ConfigIssue>) {
    if !(influx.url.starts_with("http://") || influx.url.starts_with("https://")) {
        issues.push(ConfigIssue::new(
            "influxdb.url",
            format!("scheme must be http or https, got `{}`", influx.url),
        ));
    }
    if influx.org.is_empty() {
        issues.push(ConfigIssue::new("influxdb.org", "must not be empty"));
    }
    if influx.bucket.is_empty() {
        issues.push(ConfigIssue::new("influxdb.bucket", "must not be empty"));
    }
    if influx.token.is_empty() {
        issues.push(ConfigIssue::new("influxdb.token", "must not be empty"));
    }
}

fn validate_timescale(timescale: &TimescaleWriterConfig, issues: &mut Vec<ConfigIssue>) {
    if timescale.dsn.is_empty() {
        issues.push(ConfigIssue::new("timescaledb.dsn", "must not be empty"));
    } else if !timescale.dsn.starts_with("postgres://") && !timescale.dsn.starts_with("postgresql://") {
        issues.push(ConfigIssue::new(
            "timescaledb.dsn",
            "must be a postgres:// or postgresql:// connection string",
        ));
    }

    if !is_valid_sql_identifier(&timescale.table) {
        issues.push(ConfigIssue::new(
            "timescaledb.table",
            format!(
                "`{}` is not a valid table name; must start with a letter or underscore and contain only \
                 ASCII letters, digits, and underscores",
                timescale.table
            ),
        ));
    }
}

/// Whether `name` is safe to interpolate directly into an unquoted SQL
/// identifier position (the hypertable name in `timescale`'s batched
/// `INSERT`). Deliberately stricter than Postgres's own identifier rules
/// (no quoting support, ASCII only) since this is a config value, not a
/// user-supplied string that ever needs escaping.
fn is_valid_sql_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The result of comparing two configurations for hot-reload: which
/// devices were added, updated (by `device_id`, new config supplied), or
/// removed. Used by the supervisor to apply the minimal set of pool
/// operations rather than restarting every worker on every reload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigDiff {
    /// Devices present in the new configuration but absent from the old.
    pub added: Vec<DeviceConfig>,
    /// Devices present in both, with a changed `DeviceConfig`.
    pub updated: Vec<DeviceConfig>,
    /// Device IDs present in the old configuration but absent from the
    /// new one.
    pub removed: Vec<String>,
}

impl ConfigDiff {
    /// Whether this diff would change anything about the running pool.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Computes the minimal add/update/remove set to move a running pool from
/// `old` to `new`. Comparison uses `PartialEq` on the serialised form of
/// each `DeviceConfig` rather than a hand-written field-by-field diff, so
/// adding a field to `DeviceConfig` can't silently go uncompared.
pub fn diff(old: &RootConfig, new: &RootConfig) -> ConfigDiff {
    let old_by_id: HashMap<&str, &DeviceConfig> =
        old.devices.iter().map(|d| (d.device_id.as_str(), d)).collect();
    let new_by_id: HashMap<&str, &DeviceConfig> =
        new.devices.iter().map(|d| (d.device_id.as_str(), d)).collect();

    let mut result = ConfigDiff::default();

    for device in &new.devices {
        match old_by_id.get(device.device_id.as_str()) {
            None => result.added.push(device.clone()),
            Some(previous) => {
                if !device_configs_equal(previous, device) {
                    result.updated.push(device.clone());
                }
            }
        }
    }

    for device_id in old_by_id.keys() {
        if !new_by_id.contains_key(device_id) {
            result.removed.push((*device_id).to_string());
        }
    }

    result
}

fn device_configs_equal(a: &DeviceConfig, b: &DeviceConfig) -> bool {
    serde_json::to_value(a).ok() == serde_json::to_value(b).ok()
}

// Configuration for the saga coordinator and its background workers

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::repository::SagaDefinition;

/// Errors raised while loading or validating configuration.
///
/// These are fatal at startup and never retried.
#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("failed to read configuration file: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to parse YAML configuration: {0}")]
	Yaml(#[from] serde_yaml::Error),

	#[error("failed to parse JSON configuration: {0}")]
	Json(#[from] serde_json::Error),

	#[error("unknown saga log backend '{0}' (expected file, none or distributedlog)")]
	UnknownLogBackend(String),

	#[error("saga log backend '{backend}' requires '{field}'")]
	MissingField {
		backend: &'static str,
		field: &'static str,
	},

	#[error("invalid value for '{field}': {message}")]
	InvalidValue { field: &'static str, message: String },

	#[error(
		"invalid recovery interval [{min}, {max}] seconds: both must be within [1, 86400] and min <= max"
	)]
	InvalidRecoveryInterval { min: u64, max: u64 },
}

/// Saga log backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogBackend {
	File,
	None,
	DistributedLog,
}

impl FromStr for LogBackend {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"file" => Ok(LogBackend::File),
			"none" => Ok(LogBackend::None),
			"distributedlog" => Ok(LogBackend::DistributedLog),
			other => Err(ConfigError::UnknownLogBackend(other.to_string())),
		}
	}
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SagaConfig {
	#[serde(default)]
	pub saga_log: SagaLogConfig,
	#[serde(default)]
	pub pool: PoolConfig,
	#[serde(default)]
	pub watchdog: WatchdogConfig,
	#[serde(default)]
	pub recovery_trigger: RecoveryTriggerConfig,
	/// Saga definitions registered at startup
	#[serde(default)]
	pub sagas: Vec<SagaDefinition>,
}

impl SagaConfig {
	/// Load configuration from a YAML or JSON file, chosen by extension.
	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let content = fs_err::read_to_string(path)?;
		let config: SagaConfig = match path.extension().and_then(|ext| ext.to_str()) {
			Some("json") => serde_json::from_str(&content)?,
			_ => serde_yaml::from_str(&content)?,
		};
		config.validate()?;
		Ok(config)
	}

	pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
		let config: SagaConfig = serde_yaml::from_str(content)?;
		config.validate()?;
		Ok(config)
	}

	/// Check everything that can be checked without touching the filesystem.
	pub fn validate(&self) -> Result<(), ConfigError> {
		self.saga_log.backend()?;
		self.pool.validate()?;
		self.watchdog.validate()?;
		self.recovery_trigger.validate()?;
		Ok(())
	}
}

/// Saga log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SagaLogConfig {
	/// Backend name: `file`, `none` or `distributedlog`
	#[serde(rename = "type")]
	pub kind: String,
	/// Active log file (file backend)
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub path: Option<PathBuf>,
	/// Entries per active file before rotation; non-positive selects the default
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub rotation_threshold: Option<i64>,
	/// Remote saga log base URL (distributedlog backend)
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub url: Option<String>,
}

impl Default for SagaLogConfig {
	fn default() -> Self {
		Self {
			kind: "none".to_string(),
			path: None,
			rotation_threshold: None,
			url: None,
		}
	}
}

impl SagaLogConfig {
	pub fn backend(&self) -> Result<LogBackend, ConfigError> {
		self.kind.parse()
	}
}

/// Sizing of the saga execution thread pool.
///
/// The coordinator's concurrency ceiling is derived from these values.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PoolConfig {
	#[serde(default = "default_core_size")]
	pub core_size: usize,
	#[serde(default = "default_max_size")]
	pub max_size: usize,
	#[serde(default = "default_queue_capacity")]
	pub queue_capacity: usize,
	/// Idle time after which threads above the core size retire
	#[serde(default = "default_keep_alive", with = "serde_dur")]
	pub keep_alive: Duration,
}

fn default_core_size() -> usize {
	8
}

fn default_max_size() -> usize {
	32
}

fn default_queue_capacity() -> usize {
	32
}

fn default_keep_alive() -> Duration {
	Duration::from_secs(60)
}

impl Default for PoolConfig {
	fn default() -> Self {
		Self {
			core_size: default_core_size(),
			max_size: default_max_size(),
			queue_capacity: default_queue_capacity(),
			keep_alive: default_keep_alive(),
		}
	}
}

impl PoolConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.max_size == 0 {
			return Err(ConfigError::InvalidValue {
				field: "pool.maxSize",
				message: "must be at least 1".to_string(),
			});
		}
		if self.core_size > self.max_size {
			return Err(ConfigError::InvalidValue {
				field: "pool.coreSize",
				message: format!(
					"core size {} exceeds max size {}",
					self.core_size, self.max_size
				),
			});
		}
		if self.keep_alive.is_zero() {
			return Err(ConfigError::InvalidValue {
				field: "pool.keepAlive",
				message: "must be positive".to_string(),
			});
		}
		Ok(())
	}

	/// Maximum number of concurrently handed-off sagas.
	pub fn permit_ceiling(&self) -> usize {
		((self.max_size + self.queue_capacity) / 2).max(1)
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WatchdogConfig {
	#[serde(default = "default_watchdog_enabled")]
	pub enabled: bool,
	#[serde(default = "default_watchdog_interval", with = "serde_dur")]
	pub interval: Duration,
}

fn default_watchdog_enabled() -> bool {
	true
}

fn default_watchdog_interval() -> Duration {
	Duration::from_secs(1)
}

impl Default for WatchdogConfig {
	fn default() -> Self {
		Self {
			enabled: default_watchdog_enabled(),
			interval: default_watchdog_interval(),
		}
	}
}

impl WatchdogConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.interval.is_zero() {
			return Err(ConfigError::InvalidValue {
				field: "watchdog.interval",
				message: "must be positive".to_string(),
			});
		}
		Ok(())
	}
}

/// Bounds of the randomized cluster-wide recovery interval, in seconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecoveryTriggerConfig {
	#[serde(default = "default_interval_min_sec")]
	pub interval_min_sec: u64,
	#[serde(default = "default_interval_max_sec")]
	pub interval_max_sec: u64,
}

fn default_interval_min_sec() -> u64 {
	60
}

fn default_interval_max_sec() -> u64 {
	300
}

impl Default for RecoveryTriggerConfig {
	fn default() -> Self {
		Self {
			interval_min_sec: default_interval_min_sec(),
			interval_max_sec: default_interval_max_sec(),
		}
	}
}

pub const MAX_RECOVERY_INTERVAL_SEC: u64 = 86_400;

impl RecoveryTriggerConfig {
	pub fn validate(&self) -> Result<(), ConfigError> {
		let (min, max) = (self.interval_min_sec, self.interval_max_sec);
		let in_range = |v: u64| (1..=MAX_RECOVERY_INTERVAL_SEC).contains(&v);
		if !in_range(min) || !in_range(max) || min > max {
			return Err(ConfigError::InvalidRecoveryInterval { min, max });
		}
		Ok(())
	}
}

/// Parse a duration string like "500ms", "30s", "5m" or "1h". Bare numbers are seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
	let s = s.trim();
	let invalid = |message: String| ConfigError::InvalidValue {
		field: "duration",
		message,
	};
	if s.is_empty() {
		return Err(invalid("empty duration string".into()));
	}

	let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
		(num, "ms")
	} else if let Some(num) = s.strip_suffix('s') {
		(num, "s")
	} else if let Some(num) = s.strip_suffix('m') {
		(num, "m")
	} else if let Some(num) = s.strip_suffix('h') {
		(num, "h")
	} else {
		(s, "s")
	};

	let num: u64 = num_str
		.parse()
		.map_err(|_| invalid(format!("invalid duration number: {}", num_str)))?;

	Ok(match unit {
		"ms" => Duration::from_millis(num),
		"m" => Duration::from_secs(num * 60),
		"h" => Duration::from_secs(num * 60 * 60),
		_ => Duration::from_secs(num),
	})
}

mod serde_dur {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&format!("{}ms", duration.as_millis()))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		let raw = String::deserialize(deserializer)?;
		super::parse_duration(&raw).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	#[test]
	fn test_parse_duration() {
		assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
		assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
		assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
		assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
		assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
		assert!(parse_duration("").is_err());
		assert!(parse_duration("-5s").is_err());
	}

	#[test]
	fn test_full_yaml_config() {
		let config = SagaConfig::from_yaml(
			r#"
sagaLog:
  type: file
  path: /var/lib/sagas/saga.log
  rotationThreshold: 500
pool:
  coreSize: 4
  maxSize: 10
  queueCapacity: 6
  keepAlive: 30s
watchdog:
  interval: 250ms
recoveryTrigger:
  intervalMinSec: 10
  intervalMaxSec: 20
sagas:
  - name: demo
    steps:
      - id: persist
        adapter: store.put
        compensate: store.delete
"#,
		)
		.unwrap();

		assert_eq!(config.saga_log.backend().unwrap(), LogBackend::File);
		assert_eq!(config.saga_log.rotation_threshold, Some(500));
		assert_eq!(config.pool.permit_ceiling(), 8);
		assert_eq!(config.pool.keep_alive, Duration::from_secs(30));
		assert!(config.watchdog.enabled);
		assert_eq!(config.watchdog.interval, Duration::from_millis(250));
		assert_eq!(config.recovery_trigger.interval_min_sec, 10);
		assert_eq!(config.sagas.len(), 1);
	}

	#[test]
	fn test_defaults() {
		let config = SagaConfig::from_yaml("{}").unwrap();
		assert_eq!(config.saga_log.backend().unwrap(), LogBackend::None);
		assert_eq!(config.pool.permit_ceiling(), 32);
		assert_eq!(config.watchdog.interval, Duration::from_secs(1));
		assert_eq!(config.recovery_trigger.interval_max_sec, 300);
	}

	#[test]
	fn test_unknown_backend_rejected() {
		assert_matches!(
			SagaConfig::from_yaml("sagaLog: { type: kafka }"),
			Err(ConfigError::UnknownLogBackend(name)) if name == "kafka"
		);
	}

	#[test]
	fn test_recovery_interval_validation() {
		let valid = RecoveryTriggerConfig {
			interval_min_sec: 1,
			interval_max_sec: MAX_RECOVERY_INTERVAL_SEC,
		};
		assert!(valid.validate().is_ok());

		for (min, max) in [(0, 10), (10, 5), (1, MAX_RECOVERY_INTERVAL_SEC + 1)] {
			let config = RecoveryTriggerConfig {
				interval_min_sec: min,
				interval_max_sec: max,
			};
			assert_matches!(
				config.validate(),
				Err(ConfigError::InvalidRecoveryInterval { .. })
			);
		}
	}

	#[test]
	fn test_permit_ceiling_never_zero() {
		let pool = PoolConfig {
			core_size: 1,
			max_size: 1,
			queue_capacity: 0,
			keep_alive: Duration::from_secs(1),
		};
		assert_eq!(pool.permit_ceiling(), 1);
	}

	#[test]
	fn test_core_size_above_max_rejected() {
		assert_matches!(
			SagaConfig::from_yaml("pool: { coreSize: 8, maxSize: 4 }"),
			Err(ConfigError::InvalidValue { field: "pool.coreSize", .. })
		);
	}
}

//! Saga execution log.
//!
//! Every saga run records its lifecycle in a [`SagaLog`]: a Start entry when the
//! run is handed off, one entry per completed graph node, and an End entry when
//! the run reaches a terminal state. Runs with a Start entry and no End entry
//! are incomplete and get re-driven by recovery.
//!
//! Three backends are available:
//! - [`FileSagaLog`]: durable, rotating, crash-recoverable
//! - [`NoopSagaLog`]: durability intentionally disabled
//! - [`RemoteSagaLog`]: forwards writes to a remote saga log service

mod entry;
mod file;
mod noop;
mod remote;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::info;

pub use entry::{END_NODE_ID, START_NODE_ID, SagaLogEntry};
pub use file::{DEFAULT_ROTATION_THRESHOLD, FileSagaLog};
pub use noop::NoopSagaLog;
pub use remote::RemoteSagaLog;

use crate::config::{ConfigError, LogBackend, SagaLogConfig};

/// Incomplete sagas grouped by execution id, then node id, in encounter order.
pub type IncompleteSagas = IndexMap<String, IndexMap<String, Vec<SagaLogEntry>>>;

/// Acknowledgement returned by a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogId(pub String);

impl fmt::Display for LogId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

/// Error type for saga log operations.
///
/// Every variant is fatal to the operation that raised it. Callers must not
/// swallow these: a failed write fails the surrounding saga handoff.
#[derive(Debug, thiserror::Error)]
pub enum SagaLogError {
	#[error("saga log i/o failed: {0}")]
	Io(#[from] std::io::Error),

	#[error("corrupt saga log entry at {}:{line}: {message}", .path.display())]
	Corrupt {
		path: PathBuf,
		line: usize,
		message: String,
	},

	#[error("failed to encode saga log entry: {0}")]
	Encode(#[from] serde_json::Error),

	#[error("invalid saga log path '{}'", .0.display())]
	InvalidPath(PathBuf),

	#[error("malformed saga log archive name '{0}'")]
	InvalidArchiveName(String),

	#[error("saga log is closed")]
	Closed,

	#[error("saga log stopped accepting writes after a failed write: {0}")]
	Poisoned(String),

	#[error("'{0}' is not supported by this saga log backend")]
	Unsupported(&'static str),

	#[error("remote saga log request failed: {0}")]
	Remote(String),

	#[error("saga log task failed: {0}")]
	Task(String),

	#[error(transparent)]
	Config(#[from] ConfigError),
}

/// Append-only log of saga lifecycle events.
#[async_trait]
pub trait SagaLog: Send + Sync {
	/// Append an entry. Durable backends only return once the entry is persisted.
	async fn write(&self, entry: SagaLogEntry) -> Result<LogId, SagaLogError>;

	/// All entries for an execution id, in write order.
	///
	/// The file backend only searches its active file; history that was
	/// rotated away is not visible here.
	async fn read_entries(&self, execution_id: &str) -> Result<Vec<SagaLogEntry>, SagaLogError>;

	/// Incomplete sagas known to this log.
	///
	/// Backends without recovery support return [`SagaLogError::Unsupported`].
	async fn read_incomplete_sagas(&self) -> Result<IncompleteSagas, SagaLogError> {
		Err(SagaLogError::Unsupported("read_incomplete_sagas"))
	}
}

/// Build the saga log selected by configuration.
///
/// Opening a file log replays its incomplete sagas, so this performs blocking
/// file I/O and should run during startup.
pub fn open_saga_log(config: &SagaLogConfig) -> Result<Arc<dyn SagaLog>, SagaLogError> {
	let log: Arc<dyn SagaLog> = match config.backend()? {
		LogBackend::File => {
			let path = config
				.path
				.clone()
				.ok_or(ConfigError::MissingField {
					backend: "file",
					field: "path",
				})?;
			let threshold = config.rotation_threshold.unwrap_or(0);
			Arc::new(FileSagaLog::open(path, threshold)?)
		},
		LogBackend::None => Arc::new(NoopSagaLog),
		LogBackend::DistributedLog => {
			let url = config.url.clone().ok_or(ConfigError::MissingField {
				backend: "distributedlog",
				field: "url",
			})?;
			Arc::new(RemoteSagaLog::new(url)?)
		},
	};
	info!(backend = %config.kind, "saga log initialized");
	Ok(log)
}

/// Run blocking saga log work off the async executor threads.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T, SagaLogError>
where
	T: Send + 'static,
	F: FnOnce() -> Result<T, SagaLogError> + Send + 'static,
{
	tokio::task::spawn_blocking(work)
		.await
		.map_err(|e| SagaLogError::Task(e.to_string()))?
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;

	use super::*;

	fn log_config(kind: &str) -> SagaLogConfig {
		SagaLogConfig {
			kind: kind.to_string(),
			path: None,
			rotation_threshold: None,
			url: None,
		}
	}

	#[tokio::test]
	async fn test_open_none_backend() {
		let log = open_saga_log(&log_config("none")).unwrap();
		let ack = log.write(SagaLogEntry::start("e1", "demo", "{}")).await.unwrap();
		assert_eq!(ack.to_string(), "none");
		assert_matches!(
			log.read_incomplete_sagas().await,
			Err(SagaLogError::Unsupported(_))
		);
	}

	#[test]
	fn test_open_unknown_backend() {
		assert_matches!(
			open_saga_log(&log_config("kafka")).err(),
			Some(SagaLogError::Config(ConfigError::UnknownLogBackend(name))) if name == "kafka"
		);
	}

	#[test]
	fn test_open_file_backend_requires_path() {
		assert_matches!(
			open_saga_log(&log_config("file")).err(),
			Some(SagaLogError::Config(ConfigError::MissingField { field: "path", .. }))
		);
	}

	#[test]
	fn test_open_file_backend() {
		let dir = tempfile::tempdir().unwrap();
		let mut config = log_config("file");
		config.path = Some(dir.path().join("saga.log"));
		config.rotation_threshold = Some(-1);

		open_saga_log(&config).unwrap();
		assert!(dir.path().join("saga.log").exists());
	}

	#[test]
	fn test_open_remote_backend_requires_url() {
		assert_matches!(
			open_saga_log(&log_config("distributedlog")).err(),
			Some(SagaLogError::Config(ConfigError::MissingField { field: "url", .. }))
		);
	}
}

// Saga log that forwards every write to a remote saga log service

use async_trait::async_trait;
use tracing::debug;

use super::{LogId, SagaLog, SagaLogEntry, SagaLogError};
use crate::config::ConfigError;

const SAGA_LOG_RESOURCE: &str = "sagalog-1";

/// Forwards writes as `PUT <base>/sagalog-1` with the serialized entry as body.
///
/// The response body is returned verbatim as the write's [`LogId`]. Reading
/// entries back and recovery are not supported by this backend.
#[derive(Debug, Clone)]
pub struct RemoteSagaLog {
	client: reqwest::Client,
	url: String,
}

impl RemoteSagaLog {
	/// Create a proxy for the saga log service at `base_url`.
	pub fn new(base_url: impl Into<String>) -> Result<Self, ConfigError> {
		let base_url = base_url.into();
		if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
			return Err(ConfigError::InvalidValue {
				field: "sagaLog.url",
				message: format!("unsupported URL scheme: {base_url}"),
			});
		}
		let url = format!("{}/{}", base_url.trim_end_matches('/'), SAGA_LOG_RESOURCE);
		Ok(Self {
			client: reqwest::Client::new(),
			url,
		})
	}

	pub fn url(&self) -> &str {
		&self.url
	}
}

#[async_trait]
impl SagaLog for RemoteSagaLog {
	async fn write(&self, entry: SagaLogEntry) -> Result<LogId, SagaLogError> {
		let body = entry.to_line()?;
		let response = self
			.client
			.put(&self.url)
			.header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
			.body(body)
			.send()
			.await
			.map_err(|e| SagaLogError::Remote(format!("PUT {} failed: {}", self.url, e)))?;

		let status = response.status();
		if !status.is_success() {
			return Err(SagaLogError::Remote(format!(
				"PUT {} returned status {}",
				self.url, status
			)));
		}

		let body = response
			.text()
			.await
			.map_err(|e| SagaLogError::Remote(format!("failed to read response body: {}", e)))?;
		debug!(execution_id = %entry.execution_id, node_id = %entry.node_id, "saga log entry forwarded");
		Ok(LogId(body))
	}

	async fn read_entries(&self, _execution_id: &str) -> Result<Vec<SagaLogEntry>, SagaLogError> {
		Err(SagaLogError::Unsupported("read_entries"))
	}
}

#[cfg(test)]
mod tests {
	use assert_matches::assert_matches;
	use wiremock::matchers::{body_string, header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	#[test]
	fn test_url_building() {
		let log = RemoteSagaLog::new("http://sagalog:8080/").unwrap();
		assert_eq!(log.url(), "http://sagalog:8080/sagalog-1");
	}

	#[test]
	fn test_rejects_unsupported_scheme() {
		assert!(RemoteSagaLog::new("ftp://sagalog").is_err());
	}

	#[tokio::test]
	async fn test_write_puts_serialized_entry() {
		let server = MockServer::start().await;
		let entry = SagaLogEntry::start("e1", "demo", "{}");

		Mock::given(method("PUT"))
			.and(path("/sagalog-1"))
			.and(header("content-type", "application/octet-stream"))
			.and(body_string(entry.to_line().unwrap()))
			.respond_with(ResponseTemplate::new(201).set_body_string(r#"{"logid":"42"}"#))
			.expect(1)
			.mount(&server)
			.await;

		let log = RemoteSagaLog::new(server.uri()).unwrap();
		let ack = log.write(entry).await.unwrap();
		assert_eq!(ack.0, r#"{"logid":"42"}"#);
	}

	#[tokio::test]
	async fn test_non_success_status_fails_write() {
		let server = MockServer::start().await;
		Mock::given(method("PUT"))
			.respond_with(ResponseTemplate::new(503))
			.mount(&server)
			.await;

		let log = RemoteSagaLog::new(server.uri()).unwrap();
		assert_matches!(
			log.write(SagaLogEntry::end("e1")).await,
			Err(SagaLogError::Remote(message)) if message.contains("503")
		);
	}

	#[tokio::test]
	async fn test_reads_are_unsupported() {
		let log = RemoteSagaLog::new("http://localhost:1").unwrap();
		assert_matches!(
			log.read_entries("e1").await,
			Err(SagaLogError::Unsupported(_))
		);
		assert_matches!(
			log.read_incomplete_sagas().await,
			Err(SagaLogError::Unsupported(_))
		);
	}
}

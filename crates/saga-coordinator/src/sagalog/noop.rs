use async_trait::async_trait;

use super::{LogId, SagaLog, SagaLogEntry, SagaLogError};

/// Saga log used when durability is intentionally disabled.
///
/// Accepts every write and never has anything to recover.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSagaLog;

#[async_trait]
impl SagaLog for NoopSagaLog {
	async fn write(&self, _entry: SagaLogEntry) -> Result<LogId, SagaLogError> {
		Ok(LogId("none".to_string()))
	}

	async fn read_entries(&self, _execution_id: &str) -> Result<Vec<SagaLogEntry>, SagaLogError> {
		Ok(Vec::new())
	}
}

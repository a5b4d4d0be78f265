//! End-to-end crash and recovery scenarios against a real file saga log.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use saga_coordinator::config::PoolConfig;
use saga_coordinator::{
	ActionError, ActionRouter, CompletionHook, FileSagaLog, HandoffRequest, LaunchError,
	LinearSagaExecutor, SagaDefinition, SagaExecutionCoordinator, SagaExecutor,
	SagaHandoffControl, SagaLog, SagaLogEntry, SagaRepository, SagaStep, SagaThreadPool,
};
use serde_json::{Value, json};
use tokio::runtime::Handle;

fn repository() -> Arc<SagaRepository> {
	Arc::new(SagaRepository::with_sagas([SagaDefinition::new(
		"demo",
		vec![
			SagaStep::new("persist", "store.put").with_compensation("store.delete"),
			SagaStep::new("publish", "events.publish"),
		],
	)]))
}

fn pool_config() -> PoolConfig {
	PoolConfig {
		core_size: 2,
		max_size: 4,
		queue_capacity: 4,
		keep_alive: Duration::from_secs(1),
	}
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
	tokio::time::timeout(Duration::from_secs(10), async {
		while !condition() {
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
	})
	.await
	.expect("condition not reached in time");
}

/// Records every launch and completes runs immediately.
#[derive(Default)]
struct RecordingExecutor {
	calls: Mutex<Vec<(String, Value, bool)>>,
}

impl SagaExecutor for RecordingExecutor {
	fn execute_saga(
		&self,
		execution_id: &str,
		saga: Arc<SagaDefinition>,
		input: Value,
		is_recovery: bool,
		on_complete: CompletionHook,
	) -> Result<SagaHandoffControl, LaunchError> {
		self
			.calls
			.lock()
			.unwrap()
			.push((execution_id.to_string(), input, is_recovery));
		let (mut signals, control) = SagaHandoffControl::channel(execution_id, &saga.name);
		signals.handoff_done();
		on_complete.fire();
		signals.complete(Ok(json!({})));
		Ok(control)
	}
}

/// Router that counts adapter invocations.
#[derive(Default)]
struct CountingRouter {
	calls: Mutex<Vec<String>>,
}

impl CountingRouter {
	fn calls(&self) -> Vec<String> {
		self.calls.lock().unwrap().clone()
	}
}

#[async_trait]
impl ActionRouter for CountingRouter {
	async fn execute_action(
		&self,
		adapter: &str,
		input: Value,
		_timeout: Option<Duration>,
	) -> Result<Value, ActionError> {
		self.calls.lock().unwrap().push(adapter.to_string());
		Ok(json!({ "adapter": adapter, "input": input }))
	}
}

#[tokio::test]
async fn test_crash_before_end_is_recovered_once() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("saga.log");

	{
		let log = FileSagaLog::open(&path, 0).unwrap();
		log
			.write(SagaLogEntry::start("e1", "demo", "{}"))
			.await
			.unwrap();
		// crash: the writer is dropped before End e1
	}

	let log = FileSagaLog::open(&path, 0).unwrap();
	assert_eq!(log.snapshot_open_saga_execution_ids(), vec!["e1"]);

	let executor = Arc::new(RecordingExecutor::default());
	let coordinator = SagaExecutionCoordinator::new(
		Arc::new(log),
		repository(),
		executor.clone(),
		&pool_config(),
	);
	assert_eq!(coordinator.recover_incomplete_sagas().await.unwrap(), 1);

	let calls = executor.calls.lock().unwrap().clone();
	assert_eq!(calls, vec![("e1".to_string(), json!({}), true)]);
	coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recovered_run_resumes_after_logged_steps() {
	let dir = tempfile::tempdir().unwrap();
	let path = dir.path().join("saga.log");

	{
		let log = FileSagaLog::open(&path, 0).unwrap();
		log
			.write(SagaLogEntry::start("e1", "demo", r#"{"id":"b1"}"#))
			.await
			.unwrap();
		log
			.write(SagaLogEntry::node(
				"e1",
				"persist",
				Some(r#"{"stored":true}"#.to_string()),
			))
			.await
			.unwrap();
	}

	let log = Arc::new(FileSagaLog::open(&path, 0).unwrap());
	let router = Arc::new(CountingRouter::default());
	let pool = SagaThreadPool::new(&pool_config());
	let executor = Arc::new(LinearSagaExecutor::new(
		log.clone(),
		router.clone(),
		pool.clone(),
		Handle::current(),
	));
	let coordinator =
		SagaExecutionCoordinator::new(log.clone(), repository(), executor, &pool_config());

	assert_eq!(coordinator.recover_incomplete_sagas().await.unwrap(), 1);
	wait_for(|| coordinator.observer().completed() == 1).await;

	assert_eq!(router.calls(), vec!["events.publish"]);
	assert!(log.snapshot_open_saga_execution_ids().is_empty());

	// a second pass over the clean log finds nothing
	assert_eq!(coordinator.recover_incomplete_sagas().await.unwrap(), 0);
	coordinator.shutdown().await;
	pool.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handoffs_settle_with_balanced_permits() {
	let dir = tempfile::tempdir().unwrap();
	let log = Arc::new(FileSagaLog::open(dir.path().join("saga.log"), 4).unwrap());
	let router = Arc::new(CountingRouter::default());
	let pool = SagaThreadPool::new(&pool_config());
	let executor = Arc::new(LinearSagaExecutor::new(
		log.clone(),
		router.clone(),
		pool.clone(),
		Handle::current(),
	));
	let coordinator = Arc::new(SagaExecutionCoordinator::new(
		log.clone(),
		repository(),
		executor,
		&pool_config(),
	));

	let mut handoffs = Vec::new();
	for i in 0..12 {
		let coordinator = coordinator.clone();
		handoffs.push(tokio::spawn(async move {
			coordinator
				.handoff(HandoffRequest {
					sync: i % 2 == 0,
					saga_name: "demo".to_string(),
					namespace: "library".to_string(),
					entity: "Book".to_string(),
					id: format!("b{i}"),
					version: Utc::now(),
					data: json!({ "n": i }),
				})
				.await
		}));
	}
	for handoff in handoffs {
		handoff.await.unwrap().unwrap();
	}

	wait_for(|| coordinator.observer().completed() == 12).await;
	let stats = coordinator.stats();
	assert_eq!(stats.permits_acquired, 12);
	assert_eq!(stats.permits_released, 12);
	assert_eq!(stats.in_flight, 0);
	assert_eq!(router.calls().len(), 24);

	// small threshold: the log rotated along the way, nothing stays open
	assert!(!log.archive_paths().unwrap().is_empty());
	assert!(log.snapshot_open_saga_execution_ids().is_empty());
	assert!(log.read_all_incomplete_sagas().unwrap().is_empty());

	coordinator.shutdown().await;
	pool.shutdown();
}

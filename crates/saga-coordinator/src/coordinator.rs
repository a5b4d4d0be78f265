//! Saga execution coordinator.
//!
//! Accepts new saga requests, bounds the number of runs in flight with
//! permits, launches runs through the [`SagaExecutor`] and hands them to the
//! [`SagasObserver`]. Also re-drives incomplete runs found in the saga log at
//! boot and, through [`ClusterRecovery`], periodically afterwards.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::executor::{CompletionHook, LaunchError, SagaExecutor, SagaRunFailure};
use crate::observer::SagasObserver;
use crate::recovery::ClusterRecovery;
use crate::repository::SagaRepository;
use crate::sagalog::{IncompleteSagas, START_NODE_ID, SagaLog, SagaLogEntry, SagaLogError};
use crate::watchdog::ThreadPoolWatchDog;

#[derive(Debug, Error)]
pub enum CoordinatorError {
	#[error("saga '{0}' is not registered")]
	UnknownSaga(String),

	#[error("interrupted while waiting for a saga permit")]
	Interrupted,

	#[error(transparent)]
	Launch(#[from] LaunchError),

	#[error("saga handoff failed: {0}")]
	Handoff(SagaRunFailure),

	#[error(transparent)]
	Run(SagaRunFailure),

	#[error(transparent)]
	Log(#[from] SagaLogError),
}

/// Cluster-wide discovery of incomplete sagas.
#[async_trait]
pub trait ClusterSagaSource: Send + Sync {
	async fn incomplete_sagas(&self) -> Result<IncompleteSagas, SagaLogError>;
}

/// A request to start a saga for one document write.
#[derive(Debug, Clone)]
pub struct HandoffRequest {
	/// Wait for the whole run instead of only its durable start
	pub sync: bool,
	pub saga_name: String,
	pub namespace: String,
	pub entity: String,
	pub id: String,
	pub version: DateTime<Utc>,
	pub data: Value,
}

impl HandoffRequest {
	fn input(&self) -> Value {
		json!({
			"namespace": self.namespace,
			"entity": self.entity,
			"id": self.id,
			"version": self.version,
			"data": self.data,
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandoffResult {
	pub execution_id: String,
	/// Run output; only present for synchronous handoffs
	pub output: Option<Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorStats {
	pub permits_acquired: u64,
	pub permits_released: u64,
	pub runs_started: u64,
	pub runs_recovered: u64,
	pub in_flight: usize,
}

#[derive(Default)]
struct Counters {
	permits_acquired: AtomicU64,
	permits_released: AtomicU64,
	runs_started: AtomicU64,
	runs_recovered: AtomicU64,
}

/// Execution ids with a live run in this process.
#[derive(Default)]
struct RunTracker {
	in_flight: Mutex<HashSet<String>>,
	counters: Counters,
}

impl RunTracker {
	/// Track a run. `None` if a run with this id is already live.
	fn track(
		self: &Arc<Self>,
		execution_id: &str,
		permit: Option<OwnedSemaphorePermit>,
	) -> Option<Arc<RunGuard>> {
		if !self.in_flight.lock().insert(execution_id.to_string()) {
			return None;
		}
		Some(Arc::new(RunGuard {
			execution_id: execution_id.to_string(),
			permit: Mutex::new(permit),
			finished: AtomicBool::new(false),
			tracker: Arc::clone(self),
		}))
	}
}

/// Releases a run's permit and in-flight slot exactly once.
struct RunGuard {
	execution_id: String,
	permit: Mutex<Option<OwnedSemaphorePermit>>,
	finished: AtomicBool,
	tracker: Arc<RunTracker>,
}

impl RunGuard {
	fn finish(&self) {
		if self.finished.swap(true, Ordering::AcqRel) {
			return;
		}
		self.tracker.in_flight.lock().remove(&self.execution_id);
		if let Some(permit) = self.permit.lock().take() {
			drop(permit);
			self
				.tracker
				.counters
				.permits_released
				.fetch_add(1, Ordering::AcqRel);
		}
	}

	fn completion_hook(self: &Arc<Self>) -> CompletionHook {
		let guard = Arc::clone(self);
		CompletionHook::new(move || guard.finish())
	}
}

enum Recovery {
	Launched,
	InFlight,
	Ended,
}

pub struct SagaExecutionCoordinator {
	log: Arc<dyn SagaLog>,
	repository: Arc<SagaRepository>,
	executor: Arc<dyn SagaExecutor>,
	observer: SagasObserver,
	permits: Arc<Semaphore>,
	tracker: Arc<RunTracker>,
	cluster_source: Option<Arc<dyn ClusterSagaSource>>,
	watchdog: Mutex<Option<ThreadPoolWatchDog>>,
}

impl SagaExecutionCoordinator {
	/// Build a coordinator. Must be called inside a tokio runtime, which hosts
	/// the observer.
	pub fn new(
		log: Arc<dyn SagaLog>,
		repository: Arc<SagaRepository>,
		executor: Arc<dyn SagaExecutor>,
		pool: &PoolConfig,
	) -> Self {
		let ceiling = pool.permit_ceiling();
		info!(permits = ceiling, "saga coordinator created");
		Self {
			log,
			repository,
			executor,
			observer: SagasObserver::spawn(),
			permits: Arc::new(Semaphore::new(ceiling)),
			tracker: Arc::new(RunTracker::default()),
			cluster_source: None,
			watchdog: Mutex::new(None),
		}
	}

	pub fn with_cluster_source(mut self, source: Arc<dyn ClusterSagaSource>) -> Self {
		self.cluster_source = Some(source);
		self
	}

	/// Hand the pool watchdog to the coordinator, which stops it on shutdown.
	pub fn with_watchdog(self, watchdog: ThreadPoolWatchDog) -> Self {
		*self.watchdog.lock() = Some(watchdog);
		self
	}

	pub fn observer(&self) -> &SagasObserver {
		&self.observer
	}

	/// Start a saga run.
	///
	/// Returns once the run's start is durable, or once the run finished when
	/// `request.sync` is set. In async mode a failure after a successful
	/// handoff is only reported by the observer.
	pub async fn handoff(&self, request: HandoffRequest) -> Result<HandoffResult, CoordinatorError> {
		let saga = self
			.repository
			.get(&request.saga_name)
			.ok_or_else(|| CoordinatorError::UnknownSaga(request.saga_name.clone()))?;
		let input = request.input();
		let execution_id = Uuid::new_v4().to_string();

		let permit = Arc::clone(&self.permits)
			.acquire_owned()
			.await
			.map_err(|_| CoordinatorError::Interrupted)?;
		self
			.tracker
			.counters
			.permits_acquired
			.fetch_add(1, Ordering::AcqRel);

		let Some(guard) = self.tracker.track(&execution_id, Some(permit)) else {
			// track() already dropped the permit
			self
				.tracker
				.counters
				.permits_released
				.fetch_add(1, Ordering::AcqRel);
			return Err(CoordinatorError::Launch(LaunchError::Failed(format!(
				"execution id {execution_id} already in flight"
			))));
		};

		let control = match self.executor.execute_saga(
			&execution_id,
			saga,
			input,
			false,
			guard.completion_hook(),
		) {
			Ok(control) => control,
			Err(e) => {
				guard.finish();
				return Err(e.into());
			},
		};
		self
			.tracker
			.counters
			.runs_started
			.fetch_add(1, Ordering::AcqRel);
		debug!(saga = %request.saga_name, execution_id = %execution_id, "saga run launched");
		self.observer.register_saga(&control);

		if request.sync {
			let output = control.completion().await.map_err(CoordinatorError::Run)?;
			Ok(HandoffResult {
				execution_id,
				output: Some(output),
			})
		} else {
			control.handoff().await.map_err(CoordinatorError::Handoff)?;
			Ok(HandoffResult {
				execution_id,
				output: None,
			})
		}
	}

	/// Re-drive incomplete runs found in the local saga log.
	///
	/// Returns the number of runs launched. Logs without recovery support
	/// recover nothing.
	pub async fn recover_incomplete_sagas(&self) -> Result<usize, CoordinatorError> {
		let incomplete = match self.log.read_incomplete_sagas().await {
			Ok(incomplete) => incomplete,
			Err(SagaLogError::Unsupported(_)) => {
				warn!("configured saga log does not support recovery, skipping");
				return Ok(0);
			},
			Err(e) => return Err(e.into()),
		};
		Ok(self.recover(incomplete).await)
	}

	/// Re-drive incomplete runs found anywhere in the cluster.
	///
	/// Falls back to the local saga log without a cluster source.
	pub async fn recover_cluster_incomplete_sagas(&self) -> Result<usize, CoordinatorError> {
		match &self.cluster_source {
			Some(source) => {
				let incomplete = source.incomplete_sagas().await?;
				Ok(self.recover(incomplete).await)
			},
			None => self.recover_incomplete_sagas().await,
		}
	}

	async fn recover(&self, incomplete: IncompleteSagas) -> usize {
		let total = incomplete.len();
		let mut recovered = 0;
		for (execution_id, nodes) in &incomplete {
			let start = nodes.get(START_NODE_ID).and_then(|entries| entries.first());
			match self.recover_one(execution_id, start).await {
				Ok(Recovery::Launched) => recovered += 1,
				Ok(Recovery::InFlight) => debug!(execution_id = %execution_id, "saga run already in flight, not recovering"),
				Ok(Recovery::Ended) => debug!(execution_id = %execution_id, "saga run ended since the scan, not recovering"),
				Err(reason) => warn!(execution_id = %execution_id, reason = %reason, "skipping incomplete saga"),
			}
		}
		if total > 0 {
			info!(recovered, found = total, "incomplete sagas recovered");
		}
		recovered
	}

	async fn recover_one(&self, execution_id: &str, start: Option<&SagaLogEntry>) -> Result<Recovery, String> {
		let start = start.ok_or("no start entry")?;
		let saga_name = start.saga_name.as_deref().ok_or("start entry has no saga name")?;
		let saga = self
			.repository
			.get(saga_name)
			.ok_or_else(|| format!("saga '{saga_name}' is not registered"))?;
		let input = match start.json_data.as_deref() {
			Some(json) => serde_json::from_str(json).map_err(|e| format!("unreadable input: {e}"))?,
			None => Value::Null,
		};

		let Some(guard) = self.tracker.track(execution_id, None) else {
			return Ok(Recovery::InFlight);
		};
		// A live run writes End before leaving the in-flight set, so once
		// tracked, the log tells whether it finished after the scan.
		match self.has_ended(execution_id).await {
			Ok(false) => {},
			Ok(true) => {
				guard.finish();
				return Ok(Recovery::Ended);
			},
			Err(e) => {
				guard.finish();
				return Err(format!("unreadable entries: {e}"));
			},
		}

		match self
			.executor
			.execute_saga(execution_id, saga, input, true, guard.completion_hook())
		{
			Ok(control) => {
				self
					.tracker
					.counters
					.runs_recovered
					.fetch_add(1, Ordering::AcqRel);
				info!(saga = %saga_name, execution_id = %execution_id, "recovering saga run");
				self.observer.register_saga(&control);
				Ok(Recovery::Launched)
			},
			Err(e) => {
				guard.finish();
				Err(e.to_string())
			},
		}
	}

	async fn has_ended(&self, execution_id: &str) -> Result<bool, SagaLogError> {
		match self.log.read_entries(execution_id).await {
			Ok(entries) => Ok(entries.iter().any(SagaLogEntry::is_end)),
			Err(SagaLogError::Unsupported(_)) => Ok(false),
			Err(e) => Err(e),
		}
	}

	pub fn stats(&self) -> CoordinatorStats {
		let counters = &self.tracker.counters;
		CoordinatorStats {
			permits_acquired: counters.permits_acquired.load(Ordering::Acquire),
			permits_released: counters.permits_released.load(Ordering::Acquire),
			runs_started: counters.runs_started.load(Ordering::Acquire),
			runs_recovered: counters.runs_recovered.load(Ordering::Acquire),
			in_flight: self.tracker.in_flight.lock().len(),
		}
	}

	/// Stop the watchdog and the observer. Runs in flight are not cancelled.
	pub async fn shutdown(&self) {
		let watchdog = self.watchdog.lock().take();
		if let Some(watchdog) = watchdog {
			tokio::task::spawn_blocking(move || watchdog.stop())
				.await
				.unwrap_or_else(|e| warn!(error = %e, "failed to stop saga pool watchdog"));
		}
		self.permits.close();
		self.observer.shutdown().await;
		info!("saga coordinator shut down");
	}
}

#[async_trait]
impl ClusterRecovery for SagaExecutionCoordinator {
	async fn recover_cluster_incomplete_sagas(&self) -> Result<usize, CoordinatorError> {
		SagaExecutionCoordinator::recover_cluster_incomplete_sagas(self).await
	}
}

#[cfg(test)]
#[path = "coordinator_tests.rs"]
mod tests;

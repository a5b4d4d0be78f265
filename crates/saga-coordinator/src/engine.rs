//! In-process saga engine.
//!
//! Runs a saga's steps in order on the [`SagaThreadPool`], logging each
//! lifecycle event to the [`SagaLog`]. If a step fails, previously completed
//! steps are compensated in reverse order.
//!
//! On a recovery run the Start entry already exists. Steps whose node entry is
//! already in the log are not re-executed; their logged output is reused.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::executor::{
	CompletionHook, HandoffSignals, LaunchError, SagaExecutor, SagaHandoffControl, SagaRunFailure,
};
use crate::pool::SagaThreadPool;
use crate::repository::{SagaDefinition, SagaStep};
use crate::sagalog::{END_NODE_ID, START_NODE_ID, SagaLog, SagaLogEntry, SagaLogError};

/// Errors returned by adapters.
#[derive(Debug, Error)]
pub enum ActionError {
	#[error("adapter '{adapter}' failed: {message}")]
	Failed { adapter: String, message: String },

	#[error("adapter '{adapter}' timed out after {duration:?}")]
	Timeout { adapter: String, duration: Duration },

	#[error("unknown adapter '{0}'")]
	UnknownAdapter(String),
}

/// Trait for routing and executing step adapters.
///
/// Implementors perform the actual side effect of a step: storing a document,
/// publishing an event, and so on.
#[async_trait]
pub trait ActionRouter: Send + Sync {
	async fn execute_action(
		&self,
		adapter: &str,
		input: Value,
		timeout: Option<Duration>,
	) -> Result<Value, ActionError>;
}

/// [`SagaExecutor`] that runs steps sequentially on a bounded thread pool.
pub struct LinearSagaExecutor {
	log: Arc<dyn SagaLog>,
	router: Arc<dyn ActionRouter>,
	pool: SagaThreadPool,
	runtime: Handle,
}

impl LinearSagaExecutor {
	/// `runtime` drives each run's async work from the pool's worker threads.
	pub fn new(
		log: Arc<dyn SagaLog>,
		router: Arc<dyn ActionRouter>,
		pool: SagaThreadPool,
		runtime: Handle,
	) -> Self {
		Self {
			log,
			router,
			pool,
			runtime,
		}
	}

	pub fn pool(&self) -> &SagaThreadPool {
		&self.pool
	}
}

impl SagaExecutor for LinearSagaExecutor {
	fn execute_saga(
		&self,
		execution_id: &str,
		saga: Arc<SagaDefinition>,
		input: Value,
		is_recovery: bool,
		on_complete: CompletionHook,
	) -> Result<SagaHandoffControl, LaunchError> {
		let (signals, control) = SagaHandoffControl::channel(execution_id, &saga.name);
		let run = SagaRun {
			log: Arc::clone(&self.log),
			router: Arc::clone(&self.router),
			saga,
			execution_id: execution_id.to_string(),
			input,
			is_recovery,
		};
		let runtime = self.runtime.clone();
		self
			.pool
			.submit(move || runtime.block_on(run.drive(signals, on_complete)))?;
		Ok(control)
	}
}

#[derive(Default)]
struct LoggedRun {
	outputs: HashMap<String, Value>,
	ended: bool,
}

struct SagaRun {
	log: Arc<dyn SagaLog>,
	router: Arc<dyn ActionRouter>,
	saga: Arc<SagaDefinition>,
	execution_id: String,
	input: Value,
	is_recovery: bool,
}

impl SagaRun {
	async fn drive(self, mut signals: HandoffSignals, on_complete: CompletionHook) {
		let start = Instant::now();
		let result = self.run(&mut signals).await;
		match &result {
			Ok(_) => info!(
				saga = %self.saga.name,
				execution_id = %self.execution_id,
				duration = ?start.elapsed(),
				"saga run completed"
			),
			Err(failure) => warn!(
				saga = %self.saga.name,
				execution_id = %self.execution_id,
				error = %failure,
				"saga run failed"
			),
		}
		// Release before resolving, so a caller waiting on completion observes
		// the released permit
		on_complete.fire();
		signals.complete(result);
	}

	async fn run(&self, signals: &mut HandoffSignals) -> Result<Value, SagaRunFailure> {
		let logged = if self.is_recovery {
			let logged = self.logged_outputs().await?;
			if logged.ended {
				// Finished before this recovery got to it; nothing to drive or log.
				signals.handoff_done();
				info!(
					saga = %self.saga.name,
					execution_id = %self.execution_id,
					"saga run already ended, not re-driving"
				);
				let outputs = self
					.saga
					.steps
					.iter()
					.filter_map(|step| {
						let output = logged.outputs.get(&step.id)?;
						Some((step.id.clone(), output.clone()))
					})
					.collect();
				return Ok(Value::Object(outputs));
			}
			logged.outputs
		} else {
			let input_json = serde_json::to_string(&self.input)
				.map_err(|e| SagaRunFailure::at_node(START_NODE_ID, e.to_string()))?;
			self
				.write(
					START_NODE_ID,
					SagaLogEntry::start(&self.execution_id, &self.saga.name, input_json),
				)
				.await?;
			HashMap::new()
		};
		signals.handoff_done();

		info!(
			saga = %self.saga.name,
			execution_id = %self.execution_id,
			recovery = self.is_recovery,
			step_count = self.saga.steps.len(),
			"starting saga run"
		);

		let mut outputs: IndexMap<String, Value> = IndexMap::new();
		for (idx, step) in self.saga.steps.iter().enumerate() {
			if let Some(output) = logged.get(&step.id) {
				debug!(step_id = %step.id, "step already logged, skipping");
				outputs.insert(step.id.clone(), output.clone());
				continue;
			}

			debug!(step_id = %step.id, step_index = idx, "executing step");
			let result = execute_with_timeout(
				self.router.as_ref(),
				&step.adapter,
				self.input.clone(),
				step.timeout,
			)
			.await;

			match result {
				Ok(output) => {
					let json = serde_json::to_string(&output)
						.map_err(|e| SagaRunFailure::at_node(&step.id, e.to_string()))?;
					self
						.write(
							&step.id,
							SagaLogEntry::node(&self.execution_id, &step.id, Some(json)),
						)
						.await?;
					outputs.insert(step.id.clone(), output);
				},
				Err(e) => {
					error!(
						step_id = %step.id,
						error = %e,
						"step failed, starting compensation"
					);
					self.compensate(&self.saga.steps[..idx], &outputs).await;
					self
						.write(END_NODE_ID, SagaLogEntry::end(&self.execution_id))
						.await?;
					return Err(SagaRunFailure::at_node(&step.id, e.to_string()));
				},
			}
		}

		self
			.write(END_NODE_ID, SagaLogEntry::end(&self.execution_id))
			.await?;
		Ok(Value::Object(outputs.into_iter().collect()))
	}

	async fn write(&self, node_id: &str, entry: SagaLogEntry) -> Result<(), SagaRunFailure> {
		self
			.log
			.write(entry)
			.await
			.map(|_| ())
			.map_err(|e| SagaRunFailure::at_node(node_id, e.to_string()))
	}

	/// What this execution already logged.
	async fn logged_outputs(&self) -> Result<LoggedRun, SagaRunFailure> {
		let entries = match self.log.read_entries(&self.execution_id).await {
			Ok(entries) => entries,
			Err(SagaLogError::Unsupported(_)) => Vec::new(),
			Err(e) => return Err(SagaRunFailure::at_node(START_NODE_ID, e.to_string())),
		};

		let mut logged = LoggedRun::default();
		for entry in entries {
			if entry.is_end() {
				logged.ended = true;
				continue;
			}
			if entry.is_start() {
				continue;
			}
			let output = match entry.json_data.as_deref() {
				Some(json) => serde_json::from_str(json)
					.map_err(|e| SagaRunFailure::at_node(&entry.node_id, e.to_string()))?,
				None => Value::Null,
			};
			logged.outputs.insert(entry.node_id, output);
		}
		Ok(logged)
	}

	/// Compensate completed steps in reverse order.
	async fn compensate(&self, completed_steps: &[SagaStep], outputs: &IndexMap<String, Value>) {
		info!(
			step_count = completed_steps.len(),
			"starting compensation for completed steps"
		);

		for step in completed_steps.iter().rev() {
			let Some(adapter) = &step.compensate else {
				debug!(step_id = %step.id, "step has no compensation, skipping");
				continue;
			};

			// The step's own output is the compensation input
			let input = outputs.get(&step.id).cloned().unwrap_or(Value::Null);
			match execute_with_timeout(self.router.as_ref(), adapter, input, step.timeout).await {
				Ok(_) => info!(step_id = %step.id, "compensation succeeded"),
				Err(e) => error!(
					step_id = %step.id,
					error = %e,
					"compensation failed (continuing with remaining compensations)"
				),
			}
		}
	}
}

/// Execute an adapter, failing with [`ActionError::Timeout`] once `timeout` elapses.
async fn execute_with_timeout(
	router: &dyn ActionRouter,
	adapter: &str,
	input: Value,
	timeout: Option<Duration>,
) -> Result<Value, ActionError> {
	match timeout {
		Some(duration) => {
			tokio::time::timeout(duration, router.execute_action(adapter, input, Some(duration)))
				.await
				.map_err(|_| ActionError::Timeout {
					adapter: adapter.to_string(),
					duration,
				})?
		},
		None => router.execute_action(adapter, input, None).await,
	}
}

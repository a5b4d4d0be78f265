//! Boundary to the saga execution engine.
//!
//! The coordinator never looks inside a run. It launches one through
//! [`SagaExecutor::execute_saga`] and gets back a [`SagaHandoffControl`] with
//! two shared futures: `handoff` resolves once the run's Start entry is durable,
//! `completion` once the run reached a terminal state.

use std::fmt;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::pool::PoolError;
use crate::repository::SagaDefinition;

/// Failure of a single saga run, as seen through its handoff or completion future.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
	"saga run failed{}: {message}",
	.node_id.as_deref().map(|n| format!(" at node '{n}'")).unwrap_or_default()
)]
pub struct SagaRunFailure {
	/// Node the run failed at, if it got that far
	pub node_id: Option<String>,
	pub message: String,
}

impl SagaRunFailure {
	pub fn new(message: impl Into<String>) -> Self {
		Self {
			node_id: None,
			message: message.into(),
		}
	}

	pub fn at_node(node_id: impl Into<String>, message: impl Into<String>) -> Self {
		Self {
			node_id: Some(node_id.into()),
			message: message.into(),
		}
	}

	fn abandoned() -> Self {
		Self::new("saga run was dropped before signalling")
	}
}

/// Errors raised while launching a run, before any handle exists.
#[derive(Debug, Error)]
pub enum LaunchError {
	#[error("saga run rejected: {0}")]
	Pool(#[from] PoolError),

	#[error("failed to launch saga run: {0}")]
	Failed(String),
}

pub type HandoffFuture = Shared<BoxFuture<'static, Result<(), SagaRunFailure>>>;
pub type CompletionFuture = Shared<BoxFuture<'static, Result<Value, SagaRunFailure>>>;

/// Handle to a launched saga run.
#[derive(Clone)]
pub struct SagaHandoffControl {
	execution_id: String,
	saga_name: String,
	handoff: HandoffFuture,
	completion: CompletionFuture,
}

impl SagaHandoffControl {
	/// Create a handle together with the signals that resolve it.
	pub fn channel(
		execution_id: impl Into<String>,
		saga_name: impl Into<String>,
	) -> (HandoffSignals, SagaHandoffControl) {
		let (handoff_tx, handoff_rx) = oneshot::channel();
		let (completion_tx, completion_rx) = oneshot::channel();

		let handoff = handoff_rx
			.map(|received| received.unwrap_or_else(|_| Err(SagaRunFailure::abandoned())))
			.boxed()
			.shared();
		let completion = completion_rx
			.map(|received| received.unwrap_or_else(|_| Err(SagaRunFailure::abandoned())))
			.boxed()
			.shared();

		let signals = HandoffSignals {
			handoff: Some(handoff_tx),
			completion: Some(completion_tx),
		};
		let control = SagaHandoffControl {
			execution_id: execution_id.into(),
			saga_name: saga_name.into(),
			handoff,
			completion,
		};
		(signals, control)
	}

	pub fn execution_id(&self) -> &str {
		&self.execution_id
	}

	pub fn saga_name(&self) -> &str {
		&self.saga_name
	}

	/// Resolves once the run's first log write is durable.
	pub fn handoff(&self) -> HandoffFuture {
		self.handoff.clone()
	}

	/// Resolves once the run completed or failed.
	pub fn completion(&self) -> CompletionFuture {
		self.completion.clone()
	}
}

impl fmt::Debug for SagaHandoffControl {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SagaHandoffControl")
			.field("execution_id", &self.execution_id)
			.field("saga_name", &self.saga_name)
			.finish_non_exhaustive()
	}
}

/// Producer side of a [`SagaHandoffControl`], owned by the running saga.
///
/// Dropping it without signalling resolves both futures with a failure.
#[derive(Debug)]
pub struct HandoffSignals {
	handoff: Option<oneshot::Sender<Result<(), SagaRunFailure>>>,
	completion: Option<oneshot::Sender<Result<Value, SagaRunFailure>>>,
}

impl HandoffSignals {
	/// The run's Start entry is durable.
	pub fn handoff_done(&mut self) {
		if let Some(tx) = self.handoff.take() {
			let _ = tx.send(Ok(()));
		}
	}

	/// The run reached a terminal state. A run that fails before handoff also
	/// fails its handoff future.
	pub fn complete(mut self, result: Result<Value, SagaRunFailure>) {
		if let Some(tx) = self.handoff.take() {
			let _ = tx.send(result.as_ref().map(|_| ()).map_err(Clone::clone));
		}
		if let Some(tx) = self.completion.take() {
			let _ = tx.send(result);
		}
	}
}

/// Callback the executor runs once when a run is terminal.
///
/// Consumed by [`fire`](CompletionHook::fire). If the executor drops the hook
/// instead, the callback runs on drop, so a lost run can never leak whatever
/// the callback releases.
pub struct CompletionHook {
	callback: Option<Box<dyn FnOnce() + Send>>,
}

impl CompletionHook {
	pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
		Self {
			callback: Some(Box::new(callback)),
		}
	}

	pub fn noop() -> Self {
		Self { callback: None }
	}

	pub fn fire(mut self) {
		if let Some(callback) = self.callback.take() {
			callback();
		}
	}
}

impl Drop for CompletionHook {
	fn drop(&mut self) {
		if let Some(callback) = self.callback.take() {
			callback();
		}
	}
}

impl fmt::Debug for CompletionHook {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("CompletionHook")
			.field("armed", &self.callback.is_some())
			.finish()
	}
}

/// The saga execution engine, as consumed by the coordinator.
pub trait SagaExecutor: Send + Sync {
	/// Launch a run of `saga`.
	///
	/// On recovery (`is_recovery`) the run's Start entry already exists and must
	/// not be written again. `on_complete` must be fired (or dropped) once the
	/// run is terminal. An `Err` means no run was launched.
	fn execute_saga(
		&self,
		execution_id: &str,
		saga: Arc<SagaDefinition>,
		input: Value,
		is_recovery: bool,
		on_complete: CompletionHook,
	) -> Result<SagaHandoffControl, LaunchError>;
}

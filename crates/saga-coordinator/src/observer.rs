// Fan-in of saga run completions into a single logging worker

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::executor::{SagaHandoffControl, SagaRunFailure};

struct Settled {
	execution_id: String,
	saga_name: String,
	result: Result<Value, SagaRunFailure>,
}

/// Watches every registered run until it completes and logs the outcome.
///
/// Runs continue regardless of the observer; it only reports on them.
pub struct SagasObserver {
	registrations: mpsc::UnboundedSender<BoxFuture<'static, Settled>>,
	shutdown: CancellationToken,
	worker: Mutex<Option<JoinHandle<()>>>,
	completed: Arc<AtomicU64>,
	failed: Arc<AtomicU64>,
}

impl SagasObserver {
	/// Spawn the observer worker on the current tokio runtime.
	pub fn spawn() -> Self {
		let (registrations, rx) = mpsc::unbounded_channel();
		let shutdown = CancellationToken::new();
		let completed = Arc::new(AtomicU64::new(0));
		let failed = Arc::new(AtomicU64::new(0));

		let worker = tokio::spawn(observe(
			rx,
			shutdown.clone(),
			completed.clone(),
			failed.clone(),
		));

		Self {
			registrations,
			shutdown,
			worker: Mutex::new(Some(worker)),
			completed,
			failed,
		}
	}

	/// Start watching a run. Callable from any thread.
	pub fn register_saga(&self, control: &SagaHandoffControl) {
		let execution_id = control.execution_id().to_string();
		let saga_name = control.saga_name().to_string();
		let watched = control
			.completion()
			.map(move |result| Settled {
				execution_id,
				saga_name,
				result,
			})
			.boxed();
		if self.registrations.send(watched).is_err() {
			debug!(
				execution_id = %control.execution_id(),
				"observer is shut down, run not watched"
			);
		}
	}

	/// Runs that completed successfully.
	pub fn completed(&self) -> u64 {
		self.completed.load(Ordering::Acquire)
	}

	/// Runs that ended in failure.
	pub fn failed(&self) -> u64 {
		self.failed.load(Ordering::Acquire)
	}

	/// Stop the worker and wait for it to exit.
	pub async fn shutdown(&self) {
		self.shutdown.cancel();
		let worker = self.worker.lock().take();
		if let Some(worker) = worker
			&& let Err(e) = worker.await
		{
			error!(error = %e, "saga observer worker failed");
		}
	}
}

impl Drop for SagasObserver {
	fn drop(&mut self) {
		self.shutdown.cancel();
	}
}

async fn observe(
	mut registrations: mpsc::UnboundedReceiver<BoxFuture<'static, Settled>>,
	shutdown: CancellationToken,
	completed: Arc<AtomicU64>,
	failed: Arc<AtomicU64>,
) {
	let mut pending = FuturesUnordered::new();
	loop {
		tokio::select! {
			_ = shutdown.cancelled() => break,
			Some(watched) = registrations.recv() => pending.push(watched),
			Some(settled) = pending.next(), if !pending.is_empty() => {
				let Settled { execution_id, saga_name, result } = settled;
				match result {
					Ok(_) => {
						completed.fetch_add(1, Ordering::AcqRel);
						trace!(saga = %saga_name, execution_id = %execution_id, "saga completed");
					},
					Err(cause) => {
						failed.fetch_add(1, Ordering::AcqRel);
						error!(
							saga = %saga_name,
							execution_id = %execution_id,
							error = %cause,
							"saga failed"
						);
					},
				}
			},
		}
	}
	debug!(pending = pending.len(), "saga observer stopped");
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use serde_json::json;

	use super::*;

	async fn wait_for(mut condition: impl FnMut() -> bool) {
		tokio::time::timeout(Duration::from_secs(5), async {
			while !condition() {
				tokio::time::sleep(Duration::from_millis(5)).await;
			}
		})
		.await
		.unwrap();
	}

	#[tokio::test]
	async fn test_counts_outcomes() {
		let observer = SagasObserver::spawn();

		let (ok, ok_control) = SagaHandoffControl::channel("e1", "demo");
		let (bad, bad_control) = SagaHandoffControl::channel("e2", "demo");
		let (_pending, pending_control) = SagaHandoffControl::channel("e3", "demo");
		observer.register_saga(&ok_control);
		observer.register_saga(&bad_control);
		observer.register_saga(&pending_control);

		ok.complete(Ok(json!({})));
		bad.complete(Err(SagaRunFailure::at_node("persist", "boom")));

		wait_for(|| observer.completed() == 1 && observer.failed() == 1).await;
		observer.shutdown().await;
	}

	#[tokio::test]
	async fn test_register_from_other_thread() {
		let observer = Arc::new(SagasObserver::spawn());
		let (signals, control) = SagaHandoffControl::channel("e1", "demo");

		let registering = observer.clone();
		std::thread::spawn(move || registering.register_saga(&control))
			.join()
			.unwrap();
		signals.complete(Ok(json!(null)));

		wait_for(|| observer.completed() == 1).await;
		observer.shutdown().await;
	}

	#[tokio::test]
	async fn test_shutdown_with_pending_runs() {
		let observer = SagasObserver::spawn();
		let (_signals, control) = SagaHandoffControl::channel("e1", "demo");
		observer.register_saga(&control);

		tokio::time::timeout(Duration::from_secs(5), observer.shutdown())
			.await
			.unwrap();
		// registering after shutdown is harmless
		observer.register_saga(&control);
		assert_eq!(observer.completed(), 0);
	}
}

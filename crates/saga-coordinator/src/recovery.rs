//! Periodic cluster-wide recovery of incomplete sagas.
//!
//! Each cycle sleeps a random interval drawn uniformly from
//! `[interval_min_sec, interval_max_sec]`, so nodes of a cluster do not all
//! recover at the same moment.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::{ConfigError, RecoveryTriggerConfig};
use crate::coordinator::CoordinatorError;

/// Recovers incomplete sagas found anywhere in the cluster.
#[async_trait]
pub trait ClusterRecovery: Send + Sync + 'static {
	/// Returns the number of runs re-driven.
	async fn recover_cluster_incomplete_sagas(&self) -> Result<usize, CoordinatorError>;
}

pub struct SagaRecoveryTrigger {
	stop: CancellationToken,
	timer: Mutex<Option<JoinHandle<()>>>,
	cycles: Arc<AtomicU64>,
}

impl SagaRecoveryTrigger {
	/// Validate the interval bounds and start the timer task on the current runtime.
	///
	/// Recovery itself runs on `recovery_runtime`.
	pub fn start(
		config: &RecoveryTriggerConfig,
		target: Arc<dyn ClusterRecovery>,
		recovery_runtime: Handle,
	) -> Result<Self, ConfigError> {
		config.validate()?;
		let (min, max) = (config.interval_min_sec, config.interval_max_sec);

		let stop = CancellationToken::new();
		let cycles = Arc::new(AtomicU64::new(0));

		let timer = {
			let stop = stop.clone();
			let cycles = cycles.clone();
			tokio::spawn(async move {
				info!(
					interval_min_sec = min,
					interval_max_sec = max,
					"starting saga recovery trigger"
				);

				loop {
					let delay = next_delay(min, max);
					tokio::select! {
						_ = stop.cancelled() => break,
						_ = tokio::time::sleep(delay) => {},
					}
					if stop.is_cancelled() {
						break;
					}

					// A cycle that started runs to completion even if stopped meanwhile
					let target = Arc::clone(&target);
					let recovery = recovery_runtime
						.spawn(async move { target.recover_cluster_incomplete_sagas().await });
					match recovery.await {
						Ok(Ok(recovered)) => debug!(recovered, "cluster saga recovery cycle done"),
						Ok(Err(e)) => error!(error = %e, "cluster saga recovery failed"),
						Err(e) => error!(error = %e, "cluster saga recovery task aborted"),
					}
					cycles.fetch_add(1, Ordering::AcqRel);
				}
				debug!("saga recovery trigger stopped");
			})
		};

		Ok(Self {
			stop,
			timer: Mutex::new(Some(timer)),
			cycles,
		})
	}

	/// Stop scheduling new cycles. A cycle already in flight completes.
	pub fn stop(&self) {
		self.stop.cancel();
	}

	/// Completed recovery cycles, successful or not.
	pub fn cycles(&self) -> u64 {
		self.cycles.load(Ordering::Acquire)
	}

	/// Wait for the timer task to exit. Only returns after [`stop`](Self::stop).
	pub async fn join(&self) {
		let timer = self.timer.lock().take();
		if let Some(timer) = timer
			&& let Err(e) = timer.await
		{
			error!(error = %e, "saga recovery trigger task failed");
		}
	}
}

impl Drop for SagaRecoveryTrigger {
	fn drop(&mut self) {
		self.stop.cancel();
	}
}

fn next_delay(min_sec: u64, max_sec: u64) -> Duration {
	Duration::from_secs(rand::rng().random_range(min_sec..=max_sec))
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use assert_matches::assert_matches;

	use super::*;

	/// Fails on the first call, panics on the second, succeeds afterwards.
	#[derive(Default)]
	struct FlakyRecovery {
		calls: AtomicUsize,
	}

	#[async_trait]
	impl ClusterRecovery for FlakyRecovery {
		async fn recover_cluster_incomplete_sagas(&self) -> Result<usize, CoordinatorError> {
			match self.calls.fetch_add(1, Ordering::SeqCst) {
				0 => Err(CoordinatorError::Interrupted),
				1 => panic!("recovery blew up"),
				_ => Ok(1),
			}
		}
	}

	fn interval(min: u64, max: u64) -> RecoveryTriggerConfig {
		RecoveryTriggerConfig {
			interval_min_sec: min,
			interval_max_sec: max,
		}
	}

	#[test]
	fn test_delay_within_bounds() {
		for _ in 0..100 {
			let delay = next_delay(3, 7);
			assert!(delay >= Duration::from_secs(3) && delay <= Duration::from_secs(7));
		}
		assert_eq!(next_delay(5, 5), Duration::from_secs(5));
	}

	#[tokio::test]
	async fn test_invalid_interval_rejected() {
		let target = Arc::new(FlakyRecovery::default());
		for (min, max) in [(0, 5), (6, 5), (1, 86_401)] {
			assert_matches!(
				SagaRecoveryTrigger::start(&interval(min, max), target.clone(), Handle::current()).err(),
				Some(ConfigError::InvalidRecoveryInterval { .. })
			);
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_failures_never_stop_the_trigger() {
		let target = Arc::new(FlakyRecovery::default());
		let trigger =
			SagaRecoveryTrigger::start(&interval(1, 2), target.clone(), Handle::current()).unwrap();

		while trigger.cycles() < 4 {
			tokio::time::sleep(Duration::from_millis(500)).await;
		}
		assert!(target.calls.load(Ordering::SeqCst) >= 4);

		trigger.stop();
		trigger.join().await;
		let calls = target.calls.load(Ordering::SeqCst);
		tokio::time::sleep(Duration::from_secs(10)).await;
		assert_eq!(target.calls.load(Ordering::SeqCst), calls);
	}

	#[tokio::test(start_paused = true)]
	async fn test_stop_before_first_cycle() {
		let target = Arc::new(FlakyRecovery::default());
		let trigger =
			SagaRecoveryTrigger::start(&interval(60, 60), target.clone(), Handle::current()).unwrap();
		trigger.stop();
		trigger.join().await;
		assert_eq!(trigger.cycles(), 0);
		assert_eq!(target.calls.load(Ordering::SeqCst), 0);
	}
}

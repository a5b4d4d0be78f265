//! Starvation detection for the saga execution pool.
//!
//! Runs on a dedicated OS thread so it keeps sampling even when every pool
//! worker and every runtime thread is blocked. When the pool stops making
//! progress while it could still grow, the watchdog submits no-op tasks: once
//! the queue overflows the pool is forced to spawn new workers, which frees
//! capacity for runs waiting on queued work.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::pool::{PoolSnapshot, SagaThreadPool};

/// True when two consecutive samples show a saturated pool that could grow
/// but made no progress.
pub fn possible_deadlock(prev: &PoolSnapshot, cur: &PoolSnapshot) -> bool {
	cur.active_count > 0
		&& cur.active_count == cur.pool_size
		&& cur.pool_size < cur.max_pool_size
		&& cur.active_count == prev.active_count
		&& cur.completed_task_count == prev.completed_task_count
}

/// Number of no-op tasks that frees roughly half the remaining pool capacity.
fn empty_tasks_to_submit(snapshot: &PoolSnapshot) -> usize {
	(snapshot.max_pool_size - snapshot.pool_size) / 2 + snapshot.queue_remaining_capacity
}

pub struct ThreadPoolWatchDog {
	stop: Sender<()>,
	worker: Mutex<Option<JoinHandle<()>>>,
	resolution_attempts: Arc<AtomicU64>,
}

impl ThreadPoolWatchDog {
	pub fn start(pool: SagaThreadPool, interval: Duration) -> std::io::Result<Self> {
		let (stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
		let resolution_attempts = Arc::new(AtomicU64::new(0));

		let attempts = resolution_attempts.clone();
		let worker = thread::Builder::new()
			.name("saga-pool-watchdog".to_string())
			.spawn(move || {
				let mut prev = pool.snapshot();
				loop {
					match stop_rx.recv_timeout(interval) {
						Err(RecvTimeoutError::Timeout) => {},
						Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
					}
					let cur = pool.snapshot();
					if possible_deadlock(&prev, &cur) {
						resolve(&pool, &cur);
						attempts.fetch_add(1, Ordering::AcqRel);
					}
					prev = cur;
				}
				debug!("saga pool watchdog stopped");
			})?;

		info!(interval = ?interval, "saga pool watchdog started");
		Ok(Self {
			stop,
			worker: Mutex::new(Some(worker)),
			resolution_attempts,
		})
	}

	/// How many times the watchdog intervened.
	pub fn resolution_attempts(&self) -> u64 {
		self.resolution_attempts.load(Ordering::Acquire)
	}

	/// Signal the watchdog and wait for its thread, at most one interval.
	pub fn stop(&self) {
		let _ = self.stop.try_send(());
		if let Some(worker) = self.worker.lock().take()
			&& worker.join().is_err()
		{
			warn!("saga pool watchdog thread panicked");
		}
	}
}

impl Drop for ThreadPoolWatchDog {
	fn drop(&mut self) {
		let _ = self.stop.try_send(());
	}
}

fn resolve(pool: &SagaThreadPool, snapshot: &PoolSnapshot) {
	let to_submit = empty_tasks_to_submit(snapshot);
	warn!(
		active = snapshot.active_count,
		pool_size = snapshot.pool_size,
		max_pool_size = snapshot.max_pool_size,
		to_submit,
		"saga pool made no progress, submitting empty tasks"
	);
	for _ in 0..to_submit {
		if let Err(e) = pool.submit(|| {}) {
			debug!(error = %e, "empty task not accepted");
			break;
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Instant;

	use super::*;
	use crate::config::PoolConfig;

	fn snapshot(active: usize, pool_size: usize, completed: u64) -> PoolSnapshot {
		PoolSnapshot {
			active_count: active,
			pool_size,
			max_pool_size: 8,
			completed_task_count: completed,
			queue_remaining_capacity: 4,
		}
	}

	#[test]
	fn test_detects_stalled_saturated_pool() {
		let prev = snapshot(2, 2, 10);
		assert!(possible_deadlock(&prev, &snapshot(2, 2, 10)));
	}

	#[test]
	fn test_progress_is_not_deadlock() {
		let prev = snapshot(2, 2, 10);
		// completed tasks advanced
		assert!(!possible_deadlock(&prev, &snapshot(2, 2, 11)));
		// idle worker
		assert!(!possible_deadlock(&prev, &snapshot(1, 2, 10)));
		// nothing running
		assert!(!possible_deadlock(&snapshot(0, 0, 0), &snapshot(0, 0, 0)));
		// active count changed
		assert!(!possible_deadlock(&snapshot(3, 3, 10), &snapshot(2, 2, 10)));
	}

	#[test]
	fn test_pool_at_max_is_not_deadlock() {
		let full = PoolSnapshot {
			max_pool_size: 2,
			..snapshot(2, 2, 10)
		};
		assert!(!possible_deadlock(&full, &full));
	}

	#[test]
	fn test_empty_task_count() {
		assert_eq!(empty_tasks_to_submit(&snapshot(2, 2, 0)), 3 + 4);
	}

	#[test]
	fn test_watchdog_grows_stalled_pool() {
		let pool = SagaThreadPool::new(&PoolConfig {
			core_size: 1,
			max_size: 4,
			queue_capacity: 2,
			keep_alive: Duration::from_secs(5),
		});
		let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(1);
		pool
			.submit(move || {
				let _ = release_rx.recv();
			})
			.unwrap();

		let watchdog = ThreadPoolWatchDog::start(pool.clone(), Duration::from_millis(20)).unwrap();
		let deadline = Instant::now() + Duration::from_secs(5);
		while watchdog.resolution_attempts() == 0 {
			assert!(Instant::now() < deadline, "watchdog never intervened");
			thread::sleep(Duration::from_millis(10));
		}
		// (4 - 1) / 2 + 2 empty tasks: two fill the queue, the third adds a worker
		assert!(pool.snapshot().pool_size >= 2);

		watchdog.stop();
		release_tx.send(()).unwrap();
		pool.shutdown();
	}
}

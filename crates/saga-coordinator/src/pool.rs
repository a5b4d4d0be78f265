//! Bounded OS-thread pool that saga runs execute on.
//!
//! Sizing follows the classic core/max/queue model the permit ceiling and the
//! watchdog are derived from:
//!
//! 1. below `core_size` workers, a submit spawns a new worker for the task
//! 2. otherwise the task goes into a bounded queue (`queue_capacity == 0` is a
//!    pure hand-off to an idle worker)
//! 3. if the queue is full and the pool is below `max_size`, a new worker is
//!    spawned for the task
//! 4. otherwise the task is rejected
//!
//! Workers above `core_size` retire after `keep_alive` without work.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::PoolConfig;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
pub enum PoolError {
	#[error("saga pool is saturated ({pool_size} workers, queue full)")]
	Rejected { pool_size: usize },

	#[error("saga pool is shut down")]
	Shutdown,

	#[error("failed to spawn saga pool worker: {0}")]
	Spawn(#[from] std::io::Error),
}

/// Point-in-time view of the pool, as sampled by the watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolSnapshot {
	pub active_count: usize,
	pub pool_size: usize,
	pub max_pool_size: usize,
	pub completed_task_count: u64,
	pub queue_remaining_capacity: usize,
}

#[derive(Clone)]
pub struct SagaThreadPool {
	inner: Arc<PoolInner>,
}

struct PoolInner {
	core_size: usize,
	max_size: usize,
	queue_capacity: usize,
	keep_alive: Duration,
	receiver: Receiver<Task>,
	state: Mutex<PoolState>,
	active: AtomicUsize,
	completed: AtomicU64,
	next_worker_id: AtomicUsize,
}

struct PoolState {
	// None once shut down; dropping it lets idle workers drain and exit
	sender: Option<Sender<Task>>,
	pool_size: usize,
	handles: Vec<JoinHandle<()>>,
}

impl SagaThreadPool {
	pub fn new(config: &PoolConfig) -> Self {
		let (sender, receiver) = crossbeam_channel::bounded(config.queue_capacity);
		Self {
			inner: Arc::new(PoolInner {
				core_size: config.core_size,
				max_size: config.max_size.max(1),
				queue_capacity: config.queue_capacity,
				keep_alive: config.keep_alive,
				receiver,
				state: Mutex::new(PoolState {
					sender: Some(sender),
					pool_size: 0,
					handles: Vec::new(),
				}),
				active: AtomicUsize::new(0),
				completed: AtomicU64::new(0),
				next_worker_id: AtomicUsize::new(0),
			}),
		}
	}

	/// Run `task` on the pool, or reject it when the pool cannot take more work.
	pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
	where
		F: FnOnce() + Send + 'static,
	{
		let task: Task = Box::new(task);
		let mut state = self.inner.state.lock();
		let Some(sender) = state.sender.clone() else {
			return Err(PoolError::Shutdown);
		};

		if state.pool_size < self.inner.core_size {
			return self.spawn_worker(&mut state, task);
		}

		let task = match sender.try_send(task) {
			Ok(()) => {
				// All workers may have retired between checks
				if state.pool_size == 0 {
					self.spawn_idle_worker(&mut state)?;
				}
				return Ok(());
			},
			Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => task,
		};

		if state.pool_size < self.inner.max_size {
			return self.spawn_worker(&mut state, task);
		}
		Err(PoolError::Rejected {
			pool_size: state.pool_size,
		})
	}

	pub fn snapshot(&self) -> PoolSnapshot {
		let state = self.inner.state.lock();
		let queued = self.inner.receiver.len();
		PoolSnapshot {
			active_count: self.inner.active.load(Ordering::Acquire),
			pool_size: state.pool_size,
			max_pool_size: self.inner.max_size,
			completed_task_count: self.inner.completed.load(Ordering::Acquire),
			queue_remaining_capacity: self.inner.queue_capacity.saturating_sub(queued),
		}
	}

	pub fn max_pool_size(&self) -> usize {
		self.inner.max_size
	}

	/// Stop accepting work and wait for queued and running tasks to finish.
	pub fn shutdown(&self) {
		let handles = {
			let mut state = self.inner.state.lock();
			state.sender = None;
			std::mem::take(&mut state.handles)
		};
		let current = thread::current().id();
		for handle in handles {
			if handle.thread().id() == current {
				continue;
			}
			if handle.join().is_err() {
				warn!("saga pool worker exited abnormally");
			}
		}
		debug!("saga pool shut down");
	}

	fn spawn_worker(&self, state: &mut PoolState, first: Task) -> Result<(), PoolError> {
		self.spawn(state, Some(first))
	}

	fn spawn_idle_worker(&self, state: &mut PoolState) -> Result<(), PoolError> {
		self.spawn(state, None)
	}

	fn spawn(&self, state: &mut PoolState, first: Option<Task>) -> Result<(), PoolError> {
		let id = self.inner.next_worker_id.fetch_add(1, Ordering::Relaxed);
		let inner = Arc::clone(&self.inner);
		let handle = thread::Builder::new()
			.name(format!("saga-pool-{id}"))
			.spawn(move || inner.run_worker(first))?;
		state.pool_size += 1;
		state.handles.retain(|h| !h.is_finished());
		state.handles.push(handle);
		Ok(())
	}
}

impl PoolInner {
	fn run_worker(&self, mut first: Option<Task>) {
		while let Some(task) = first.take().or_else(|| self.next_task()) {
			self.active.fetch_add(1, Ordering::AcqRel);
			let result = panic::catch_unwind(AssertUnwindSafe(task));
			self.active.fetch_sub(1, Ordering::AcqRel);
			self.completed.fetch_add(1, Ordering::AcqRel);
			if result.is_err() {
				warn!("saga pool task panicked");
			}
		}
	}

	/// Wait for the next task. `None` means this worker retires; the pool size
	/// has already been decremented.
	fn next_task(&self) -> Option<Task> {
		loop {
			match self.receiver.recv_timeout(self.keep_alive) {
				Ok(task) => return Some(task),
				Err(RecvTimeoutError::Timeout) => {
					let mut state = self.state.lock();
					if state.sender.is_none() && self.receiver.is_empty() {
						state.pool_size -= 1;
						return None;
					}
					// submit() enqueues under this lock, so an empty queue here
					// cannot strand a task
					if state.pool_size > self.core_size && self.receiver.is_empty() {
						state.pool_size -= 1;
						debug!(pool_size = state.pool_size, "idle saga pool worker retired");
						return None;
					}
				},
				Err(RecvTimeoutError::Disconnected) => {
					self.state.lock().pool_size -= 1;
					return None;
				},
			}
		}
	}
}

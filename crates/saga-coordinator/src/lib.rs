//! Saga durability and orchestration.
//!
//! A write that touches several persistence or notification targets becomes a
//! saga: an ordered set of compensable steps. This crate keeps every started
//! saga either completed or recoverable after a crash:
//!
//! - [`sagalog`]: the append-only, rotating, crash-recoverable execution log
//! - [`coordinator`]: bounded-concurrency handoff of runs to a [`SagaExecutor`]
//!   and recovery of incomplete runs
//! - [`observer`]: asynchronous fan-in of run completions
//! - [`watchdog`]: starvation detection for the execution pool
//! - [`recovery`]: jittered periodic cluster-wide recovery
//!
//! # Example configuration
//!
//! ```yaml
//! sagaLog:
//!   type: file
//!   path: ./data/saga.log
//! pool:
//!   coreSize: 8
//!   maxSize: 32
//!   queueCapacity: 32
//! sagas:
//!   - name: store-and-publish
//!     steps:
//!       - id: persist
//!         adapter: store.put
//!         compensate: store.delete
//!       - id: publish
//!         adapter: events.publish
//! ```

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod executor;
pub mod observer;
pub mod pool;
pub mod recovery;
pub mod repository;
pub mod sagalog;
pub mod watchdog;

pub use config::{ConfigError, SagaConfig};
pub use coordinator::{
	ClusterSagaSource, CoordinatorError, CoordinatorStats, HandoffRequest, HandoffResult,
	SagaExecutionCoordinator,
};
pub use engine::{ActionError, ActionRouter, LinearSagaExecutor};
pub use executor::{
	CompletionHook, HandoffSignals, LaunchError, SagaExecutor, SagaHandoffControl, SagaRunFailure,
};
pub use observer::SagasObserver;
pub use pool::{PoolError, PoolSnapshot, SagaThreadPool};
pub use recovery::{ClusterRecovery, SagaRecoveryTrigger};
pub use repository::{SagaDefinition, SagaRepository, SagaStep};
pub use sagalog::{
	FileSagaLog, LogId, NoopSagaLog, RemoteSagaLog, SagaLog, SagaLogEntry, SagaLogError,
	open_saga_log,
};
pub use watchdog::{ThreadPoolWatchDog, possible_deadlock};

//! Saga node
//!
//! Runs the saga coordinator as a standalone process: opens the configured
//! saga log, recovers incomplete sagas left by a previous process, and keeps
//! recovering cluster-wide until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use saga_coordinator::{
	ActionError, ActionRouter, LinearSagaExecutor, SagaConfig, SagaExecutionCoordinator,
	SagaRecoveryTrigger, SagaRepository, SagaThreadPool, ThreadPoolWatchDog, open_saga_log,
};
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "saga-node")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Durable saga coordinator", long_about = None)]
struct Args {
	/// Configuration file (YAML, or JSON with a .json extension)
	#[arg(short, long)]
	config: PathBuf,
}

/// Placeholder adapters: every step echoes its input.
struct EchoRouter;

#[async_trait]
impl ActionRouter for EchoRouter {
	async fn execute_action(
		&self,
		adapter: &str,
		input: Value,
		_timeout: Option<Duration>,
	) -> Result<Value, ActionError> {
		debug!(adapter, "echo adapter invoked");
		Ok(json!({ "adapter": adapter, "input": input }))
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt().with_env_filter(filter).init();

	let config = SagaConfig::from_file(&args.config)
		.with_context(|| format!("failed to load {}", args.config.display()))?;

	let log = open_saga_log(&config.saga_log).context("failed to open saga log")?;
	let repository = Arc::new(SagaRepository::with_sagas(config.sagas.clone()));

	let pool = SagaThreadPool::new(&config.pool);
	let executor = Arc::new(LinearSagaExecutor::new(
		log.clone(),
		Arc::new(EchoRouter),
		pool.clone(),
		Handle::current(),
	));

	let mut coordinator = SagaExecutionCoordinator::new(log, repository, executor, &config.pool);
	if config.watchdog.enabled {
		let watchdog = ThreadPoolWatchDog::start(pool.clone(), config.watchdog.interval)
			.context("failed to start saga pool watchdog")?;
		coordinator = coordinator.with_watchdog(watchdog);
	}
	let coordinator = Arc::new(coordinator);

	let recovered = coordinator
		.recover_incomplete_sagas()
		.await
		.context("boot recovery failed")?;
	info!(recovered, "boot recovery done");

	let trigger = SagaRecoveryTrigger::start(
		&config.recovery_trigger,
		coordinator.clone(),
		Handle::current(),
	)?;

	tokio::signal::ctrl_c()
		.await
		.context("failed to listen for ctrl-c")?;
	info!("shutting down");

	trigger.stop();
	trigger.join().await;
	coordinator.shutdown().await;
	tokio::task::spawn_blocking(move || pool.shutdown()).await?;
	Ok(())
}

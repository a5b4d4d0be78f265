//! Saga definitions and the registry the coordinator resolves them from.
//!
//! A saga definition names an ordered list of steps. Each step invokes an
//! adapter (a persistence or notification target) and may name a compensating
//! adapter that undoes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// A saga graph definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaDefinition {
	/// Name recorded in the Start entry of every run of this saga
	pub name: String,

	/// Steps, executed in order
	pub steps: Vec<SagaStep>,
}

/// A single step in a saga.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaStep {
	/// Node id, unique within the saga; used for the step's log entries
	pub id: String,

	/// Adapter executed in the forward direction
	pub adapter: String,

	/// Adapter executed on failure, in reverse step order
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub compensate: Option<String>,

	/// Per-step timeout
	#[serde(
		default,
		skip_serializing_if = "Option::is_none",
		with = "serde_dur_option"
	)]
	pub timeout: Option<Duration>,
}

impl SagaDefinition {
	pub fn new(name: impl Into<String>, steps: Vec<SagaStep>) -> Self {
		Self {
			name: name.into(),
			steps,
		}
	}
}

impl SagaStep {
	pub fn new(id: impl Into<String>, adapter: impl Into<String>) -> Self {
		Self {
			id: id.into(),
			adapter: adapter.into(),
			compensate: None,
			timeout: None,
		}
	}

	pub fn with_compensation(mut self, adapter: impl Into<String>) -> Self {
		self.compensate = Some(adapter.into());
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}
}

/// Registry of saga definitions, looked up by name.
#[derive(Debug, Default)]
pub struct SagaRepository {
	sagas: RwLock<HashMap<String, Arc<SagaDefinition>>>,
}

impl SagaRepository {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_sagas(sagas: impl IntoIterator<Item = SagaDefinition>) -> Self {
		let repository = Self::new();
		for saga in sagas {
			repository.register(saga);
		}
		repository
	}

	/// Register a saga, replacing any previous definition with the same name.
	pub fn register(&self, saga: SagaDefinition) -> Arc<SagaDefinition> {
		let saga = Arc::new(saga);
		info!(saga = %saga.name, steps = saga.steps.len(), "saga registered");
		self
			.sagas
			.write()
			.insert(saga.name.clone(), Arc::clone(&saga));
		saga
	}

	pub fn get(&self, name: &str) -> Option<Arc<SagaDefinition>> {
		self.sagas.read().get(name).cloned()
	}

	/// Registered saga names, sorted.
	pub fn names(&self) -> Vec<String> {
		let mut names: Vec<String> = self.sagas.read().keys().cloned().collect();
		names.sort();
		names
	}
}

mod serde_dur_option {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(
		duration: &Option<Duration>,
		serializer: S,
	) -> Result<S::Ok, S::Error> {
		match duration {
			Some(d) => serializer.serialize_str(&format!("{}ms", d.as_millis())),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(
		deserializer: D,
	) -> Result<Option<Duration>, D::Error> {
		let raw = Option::<String>::deserialize(deserializer)?;
		raw
			.map(|s| crate::config::parse_duration(&s).map_err(serde::de::Error::custom))
			.transpose()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_saga_deserialize_with_compensation() {
		let json = r#"{
			"name": "store-and-publish",
			"steps": [
				{ "id": "persist", "adapter": "store.put", "compensate": "store.delete" },
				{ "id": "publish", "adapter": "events.publish", "timeout": "5s" }
			]
		}"#;

		let saga: SagaDefinition = serde_json::from_str(json).unwrap();
		assert_eq!(saga.name, "store-and-publish");
		assert_eq!(saga.steps.len(), 2);
		assert_eq!(saga.steps[0].compensate.as_deref(), Some("store.delete"));
		assert_eq!(saga.steps[1].compensate, None);
		assert_eq!(saga.steps[1].timeout, Some(Duration::from_secs(5)));
	}

	#[test]
	fn test_register_and_lookup() {
		let repository = SagaRepository::with_sagas([
			SagaDefinition::new("b", vec![SagaStep::new("n1", "x")]),
			SagaDefinition::new("a", vec![]),
		]);

		assert_eq!(repository.names(), vec!["a", "b"]);
		assert_eq!(repository.get("b").unwrap().steps[0].adapter, "x");
		assert!(repository.get("missing").is_none());
	}

	#[test]
	fn test_register_replaces_definition() {
		let repository = SagaRepository::new();
		repository.register(SagaDefinition::new("demo", vec![]));
		repository.register(SagaDefinition::new(
			"demo",
			vec![SagaStep::new("n1", "x").with_compensation("y")],
		));

		assert_eq!(repository.get("demo").unwrap().steps.len(), 1);
	}
}

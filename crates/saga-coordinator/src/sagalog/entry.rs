//! Saga log entries and their single-line encoding.

use serde::{Deserialize, Serialize};

/// Node id of the entry that opens a saga execution.
pub const START_NODE_ID: &str = "S";
/// Node id of the entry that marks a saga execution as finished.
pub const END_NODE_ID: &str = "E";

/// One lifecycle event of one saga execution.
///
/// Entries are encoded as a single line of compact JSON, so a log file is an
/// ordered sequence of lines. Compact JSON never contains a raw newline, which
/// keeps the encoding safe for any payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaLogEntry {
	/// Identifies the saga run this entry belongs to
	pub execution_id: String,
	/// Graph node id; `S` and `E` are reserved for the run boundaries
	pub node_id: String,
	/// Saga definition name, carried by the Start entry
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub saga_name: Option<String>,
	/// Opaque node input or output
	#[serde(default, rename = "data", skip_serializing_if = "Option::is_none")]
	pub json_data: Option<String>,
}

impl SagaLogEntry {
	pub fn start(
		execution_id: impl Into<String>,
		saga_name: impl Into<String>,
		json_data: impl Into<String>,
	) -> Self {
		Self {
			execution_id: execution_id.into(),
			node_id: START_NODE_ID.to_string(),
			saga_name: Some(saga_name.into()),
			json_data: Some(json_data.into()),
		}
	}

	pub fn end(execution_id: impl Into<String>) -> Self {
		Self {
			execution_id: execution_id.into(),
			node_id: END_NODE_ID.to_string(),
			saga_name: None,
			json_data: None,
		}
	}

	pub fn node(
		execution_id: impl Into<String>,
		node_id: impl Into<String>,
		json_data: Option<String>,
	) -> Self {
		Self {
			execution_id: execution_id.into(),
			node_id: node_id.into(),
			saga_name: None,
			json_data,
		}
	}

	pub fn is_start(&self) -> bool {
		self.node_id == START_NODE_ID
	}

	pub fn is_end(&self) -> bool {
		self.node_id == END_NODE_ID
	}

	/// Encode as one log line, without the trailing newline.
	pub fn to_line(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}

	pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(line)
	}
}

impl std::fmt::Display for SagaLogEntry {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{} {}", self.execution_id, self.node_id)?;
		if let Some(name) = &self.saga_name {
			write!(f, " {name}")?;
		}
		if let Some(data) = &self.json_data {
			write!(f, " {data}")?;
		}
		Ok(())
	}
}

//! Durable, rotating saga log backed by line-oriented files.
//!
//! The log owns one active file plus zero or more archives named
//! `<basename>.<N>.log` next to it, where `<basename>` is the active file name
//! without its `.log` suffix and the highest `N` is the most recent archive.
//!
//! When the active file reaches the rotation threshold it is archived and a
//! fresh active file is started. Sagas still open in the archive are replayed
//! into the new active file, so the active file alone always holds every
//! incomplete saga. Opening a log performs the same rotation, which is how a
//! restarted process recovers the sagas a crash left behind.

use std::collections::BTreeSet;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::entry::SagaLogEntry;
use super::{IncompleteSagas, LogId, SagaLog, SagaLogError, run_blocking};

pub const DEFAULT_ROTATION_THRESHOLD: usize = 10_000;

const LOG_SUFFIX: &str = ".log";

/// File-backed saga log.
///
/// All file handles and in-memory indexes sit behind a single mutex: writes,
/// rotations and reads are totally ordered. Clones share the same log.
#[derive(Clone)]
pub struct FileSagaLog {
	state: Arc<Mutex<FileLogState>>,
}

struct FileLogState {
	active_path: PathBuf,
	dir: PathBuf,
	basename: String,
	writer: Option<fs_err::File>,
	closed: bool,
	/// Set when a failed write could not be rolled back
	poisoned: Option<String>,
	entries_in_active: usize,
	rotation_threshold: usize,
	rotating: bool,
	open_sagas: BTreeSet<String>,
}

impl FileSagaLog {
	/// Open the log at `path`, recovering incomplete sagas left by a previous
	/// process.
	///
	/// A non-positive `rotation_threshold` selects
	/// [`DEFAULT_ROTATION_THRESHOLD`].
	pub fn open(path: impl Into<PathBuf>, rotation_threshold: i64) -> Result<Self, SagaLogError> {
		let active_path = path.into();
		let file_name = active_path
			.file_name()
			.and_then(|name| name.to_str())
			.ok_or_else(|| SagaLogError::InvalidPath(active_path.clone()))?;
		let basename = file_name
			.strip_suffix(LOG_SUFFIX)
			.unwrap_or(file_name)
			.to_string();
		if basename.is_empty() {
			return Err(SagaLogError::InvalidPath(active_path));
		}
		let dir = match active_path.parent() {
			Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
			_ => PathBuf::from("."),
		};
		fs_err::create_dir_all(&dir)?;

		let rotation_threshold = if rotation_threshold <= 0 {
			DEFAULT_ROTATION_THRESHOLD
		} else {
			rotation_threshold as usize
		};

		let mut state = FileLogState {
			active_path,
			dir,
			basename,
			writer: None,
			closed: false,
			poisoned: None,
			entries_in_active: 0,
			rotation_threshold,
			rotating: false,
			open_sagas: BTreeSet::new(),
		};
		state.rotate()?;
		info!(
			path = %state.active_path.display(),
			rotation_threshold = state.rotation_threshold,
			open_sagas = state.open_sagas.len(),
			"file saga log opened"
		);

		Ok(Self {
			state: Arc::new(Mutex::new(state)),
		})
	}

	/// Append an entry and sync it to disk.
	pub fn append(&self, entry: &SagaLogEntry) -> Result<LogId, SagaLogError> {
		self.state.lock().append(entry)
	}

	/// Entries for `execution_id` found in the active file.
	pub fn entries_for(&self, execution_id: &str) -> Result<Vec<SagaLogEntry>, SagaLogError> {
		let state = self.state.lock();
		let entries = read_entries_from(&state.active_path)?;
		Ok(
			entries
				.into_iter()
				.filter(|entry| entry.execution_id == execution_id)
				.collect(),
		)
	}

	/// Point-in-time, sorted copy of the execution ids with no End entry yet.
	pub fn snapshot_open_saga_execution_ids(&self) -> Vec<String> {
		self.state.lock().open_sagas.iter().cloned().collect()
	}

	/// Incomplete sagas in the active file, grouped by execution id then node id.
	pub fn read_all_incomplete_sagas(&self) -> Result<IncompleteSagas, SagaLogError> {
		let state = self.state.lock();
		read_incomplete_from(&state.active_path)
	}

	/// Close the active file. Later writes fail with [`SagaLogError::Closed`].
	pub fn close(&self) {
		let mut state = self.state.lock();
		state.writer = None;
		state.closed = true;
		debug!(path = %state.active_path.display(), "file saga log closed");
	}

	/// Current rotation threshold. Doubles when replay alone fills the log.
	pub fn rotation_threshold(&self) -> usize {
		self.state.lock().rotation_threshold
	}

	pub fn active_path(&self) -> PathBuf {
		self.state.lock().active_path.clone()
	}

	/// Archive files, oldest first.
	pub fn archive_paths(&self) -> Result<Vec<PathBuf>, SagaLogError> {
		let state = self.state.lock();
		Ok(
			state
				.archive_indices()?
				.into_iter()
				.map(|index| state.archive_path(index))
				.collect(),
		)
	}
}

impl FileLogState {
	fn append(&mut self, entry: &SagaLogEntry) -> Result<LogId, SagaLogError> {
		if let Some(reason) = &self.poisoned {
			return Err(SagaLogError::Poisoned(reason.clone()));
		}
		if self.closed {
			return Err(SagaLogError::Closed);
		}

		let mut line = entry.to_line()?;
		line.push('\n');
		self.write_line(line.as_bytes())?;

		self.entries_in_active += 1;
		let id = LogId(format!(
			"{}:{}",
			self.active_path.display(),
			self.entries_in_active
		));

		if entry.is_start() {
			self.open_sagas.insert(entry.execution_id.clone());
		} else if entry.is_end() {
			self.open_sagas.remove(&entry.execution_id);
		}

		if self.entries_in_active >= self.rotation_threshold {
			if self.rotating {
				// Replayed backlog alone fills the active file.
				self.rotation_threshold = self.rotation_threshold.saturating_mul(2);
				warn!(
					rotation_threshold = self.rotation_threshold,
					"incomplete saga backlog exceeds rotation threshold, doubling threshold"
				);
			} else {
				self.rotate()?;
			}
		}

		Ok(id)
	}

	/// Append one line durably. A partially written line is cut off again, so
	/// the next append never lands on it.
	fn write_line(&mut self, line: &[u8]) -> Result<(), SagaLogError> {
		let writer = self.writer.as_mut().ok_or(SagaLogError::Closed)?;
		let offset = writer.metadata()?.len();
		let Err(e) = writer.write_all(line).and_then(|()| writer.sync_data()) else {
			return Ok(());
		};
		self.discard_partial_write(offset);
		Err(e.into())
	}

	fn discard_partial_write(&mut self, offset: u64) {
		let Some(writer) = self.writer.as_mut() else {
			return;
		};
		if let Err(e) = writer.set_len(offset).and_then(|()| writer.sync_data()) {
			error!(
				path = %self.active_path.display(),
				error = %e,
				"failed to roll back partial saga log write, refusing further writes"
			);
			self.writer = None;
			self.poisoned = Some(e.to_string());
		}
	}

	fn rotate(&mut self) -> Result<(), SagaLogError> {
		self.rotating = true;
		let result = self.rotate_and_replay();
		self.rotating = false;
		result
	}

	fn rotate_and_replay(&mut self) -> Result<(), SagaLogError> {
		self.writer = None;
		let source = match self.archive_active_file() {
			Ok(source) => source,
			Err(e) => {
				// The active file was not moved; keep appending to it.
				self.writer = Some(open_append(&self.active_path)?);
				return Err(e);
			},
		};

		self.writer = Some(open_append(&self.active_path)?);
		self.entries_in_active = 0;
		self.open_sagas.clear();

		let Some(source) = source else {
			return Ok(());
		};

		let incomplete = read_incomplete_from(&source)?;
		let replay: Vec<SagaLogEntry> = incomplete
			.into_values()
			.flat_map(|nodes| nodes.into_values().flatten())
			.collect();
		debug!(
			source = %source.display(),
			entries = replay.len(),
			"replaying incomplete sagas into active saga log"
		);
		for entry in &replay {
			self.append(entry)?;
		}
		Ok(())
	}

	/// Decide what the next active file is replayed from.
	///
	/// A non-empty active file is moved to the next archive index. An empty or
	/// missing active file is not archived; the newest existing archive (if
	/// any) is the replay source instead.
	fn archive_active_file(&self) -> Result<Option<PathBuf>, SagaLogError> {
		let newest = self.archive_indices()?.last().copied();
		let active_empty = match fs_err::metadata(&self.active_path) {
			Ok(metadata) => metadata.len() == 0,
			Err(e) if e.kind() == ErrorKind::NotFound => true,
			Err(e) => return Err(e.into()),
		};

		match (active_empty, newest) {
			(true, None) => Ok(None),
			(true, Some(index)) => Ok(Some(self.archive_path(index))),
			(false, newest) => {
				let archive = self.archive_path(newest.map_or(1, |index| index + 1));
				fs_err::rename(&self.active_path, &archive)?;
				info!(archive = %archive.display(), "rotated saga log");
				Ok(Some(archive))
			},
		}
	}

	fn archive_path(&self, index: u32) -> PathBuf {
		self
			.dir
			.join(format!("{}.{}{}", self.basename, index, LOG_SUFFIX))
	}

	fn archive_indices(&self) -> Result<Vec<u32>, SagaLogError> {
		let mut indices = Vec::new();
		for dir_entry in fs_err::read_dir(&self.dir)? {
			let file_name = dir_entry?.file_name();
			let Some(file_name) = file_name.to_str() else {
				continue;
			};
			if let Some(index) = parse_archive_index(file_name, &self.basename)? {
				indices.push(index);
			}
		}
		indices.sort_unstable();
		Ok(indices)
	}
}

/// Archive index encoded in `file_name`, if it names an archive of `basename`.
///
/// Files that carry the archive prefix and suffix but no positive integer in
/// between are rejected rather than skipped.
fn parse_archive_index(file_name: &str, basename: &str) -> Result<Option<u32>, SagaLogError> {
	let Some(rest) = file_name
		.strip_prefix(basename)
		.and_then(|rest| rest.strip_prefix('.'))
	else {
		return Ok(None);
	};
	let Some(index) = rest.strip_suffix(LOG_SUFFIX) else {
		return Ok(None);
	};
	match index.parse::<u32>() {
		Ok(index) if index > 0 => Ok(Some(index)),
		_ => Err(SagaLogError::InvalidArchiveName(file_name.to_string())),
	}
}

fn open_append(path: &Path) -> Result<fs_err::File, SagaLogError> {
	Ok(
		fs_err::OpenOptions::new()
			.create(true)
			.append(true)
			.open(path)?,
	)
}

fn read_entries_from(path: &Path) -> Result<Vec<SagaLogEntry>, SagaLogError> {
	let content = match fs_err::read(path) {
		Ok(content) => content,
		Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
		Err(e) => return Err(e.into()),
	};
	let segments: Vec<&[u8]> = content.split(|byte| *byte == b'\n').collect();
	// The segment after the final newline is empty unless the last write was torn
	let last = segments.len() - 1;

	let mut entries = Vec::with_capacity(segments.len());
	for (idx, segment) in segments.iter().enumerate() {
		if segment.trim_ascii().is_empty() {
			continue;
		}
		let decoded = std::str::from_utf8(segment)
			.map_err(|e| e.to_string())
			.and_then(|line| SagaLogEntry::from_line(line).map_err(|e| e.to_string()));
		match decoded {
			Ok(entry) => entries.push(entry),
			Err(message) if idx == last => {
				warn!(
					path = %path.display(),
					line = idx + 1,
					error = %message,
					"ignoring torn trailing saga log entry"
				);
			},
			Err(message) => {
				return Err(SagaLogError::Corrupt {
					path: path.to_path_buf(),
					line: idx + 1,
					message,
				});
			},
		}
	}
	Ok(entries)
}

fn read_incomplete_from(path: &Path) -> Result<IncompleteSagas, SagaLogError> {
	let mut sagas = IncompleteSagas::new();
	for entry in read_entries_from(path)? {
		if entry.is_end() {
			sagas.shift_remove(&entry.execution_id);
			continue;
		}
		sagas
			.entry(entry.execution_id.clone())
			.or_default()
			.entry(entry.node_id.clone())
			.or_default()
			.push(entry);
	}
	Ok(sagas)
}

#[async_trait]
impl SagaLog for FileSagaLog {
	async fn write(&self, entry: SagaLogEntry) -> Result<LogId, SagaLogError> {
		let log = self.clone();
		run_blocking(move || log.append(&entry)).await
	}

	async fn read_entries(&self, execution_id: &str) -> Result<Vec<SagaLogEntry>, SagaLogError> {
		let log = self.clone();
		let execution_id = execution_id.to_string();
		run_blocking(move || log.entries_for(&execution_id)).await
	}

	async fn read_incomplete_sagas(&self) -> Result<IncompleteSagas, SagaLogError> {
		let log = self.clone();
		run_blocking(move || log.read_all_incomplete_sagas()).await
	}
}

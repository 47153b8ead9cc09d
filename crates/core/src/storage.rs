//! Durable per-origin key/value storage.
//!
//! Every tab of an origin reads and writes the same store without
//! coordination; the last write wins.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::Result;

/// Key holding the persisted auto-refresh protection flag (`"true"`/`"false"`).
pub const PREVENT_AUTO_REFRESH_KEY: &str = "preventAutoRefresh";

pub trait KeyValueStore: Send + Sync + fmt::Debug {
	fn get(&self, key: &str) -> Result<Option<String>>;
	fn set(&self, key: &str, value: &str) -> Result<()>;
	fn remove(&self, key: &str) -> Result<()>;
}

/// In-memory store; clones share the same map, like tabs of one origin.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
	entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}
}

impl KeyValueStore for MemoryStore {
	fn get(&self, key: &str) -> Result<Option<String>> {
		Ok(self.entries.lock().get(key).cloned())
	}

	fn set(&self, key: &str, value: &str) -> Result<()> {
		self.entries.lock().insert(key.to_string(), value.to_string());
		Ok(())
	}

	fn remove(&self, key: &str) -> Result<()> {
		self.entries.lock().remove(key);
		Ok(())
	}
}

/// A JSON object file of string values.
///
/// The file is re-read on every access so writers in other processes are
/// observed. An unreadable or corrupt file reads as empty and is replaced by
/// the next write.
#[derive(Debug, Clone)]
pub struct FileStore {
	path: PathBuf,
}

impl FileStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn read(&self) -> BTreeMap<String, String> {
		let Ok(content) = fs::read_to_string(&self.path) else {
			return BTreeMap::new();
		};
		serde_json::from_str(&content).unwrap_or_else(|err| {
			warn!(target = "tabguard.storage", path = %self.path.display(), error = %err, "store file is corrupt, treating as empty");
			BTreeMap::new()
		})
	}

	fn write(&self, entries: &BTreeMap<String, String>) -> Result<()> {
		if let Some(parent) = self.path.parent() {
			if !parent.as_os_str().is_empty() {
				fs::create_dir_all(parent)?;
			}
		}
		let json = serde_json::to_string_pretty(entries)?;
		fs::write(&self.path, json)?;
		Ok(())
	}
}

impl KeyValueStore for FileStore {
	fn get(&self, key: &str) -> Result<Option<String>> {
		Ok(self.read().remove(key))
	}

	fn set(&self, key: &str, value: &str) -> Result<()> {
		let mut entries = self.read();
		entries.insert(key.to_string(), value.to_string());
		self.write(&entries)
	}

	fn remove(&self, key: &str) -> Result<()> {
		let mut entries = self.read();
		if entries.remove(key).is_some() {
			self.write(&entries)?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn memory_store_clones_share_entries() {
		let tab_a = MemoryStore::new();
		let tab_b = tab_a.clone();
		tab_a.set("k", "v").unwrap();
		assert_eq!(tab_b.get("k").unwrap().as_deref(), Some("v"));
		tab_b.remove("k").unwrap();
		assert_eq!(tab_a.get("k").unwrap(), None);
	}

	#[test]
	fn file_store_persists_across_instances() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("origin").join("store.json");

		FileStore::new(&path).set(PREVENT_AUTO_REFRESH_KEY, "false").unwrap();
		let reopened = FileStore::new(&path);
		assert_eq!(reopened.get(PREVENT_AUTO_REFRESH_KEY).unwrap().as_deref(), Some("false"));
	}

	#[test]
	fn corrupt_file_reads_as_empty_and_is_replaced() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("store.json");
		fs::write(&path, "{not json").unwrap();

		let store = FileStore::new(&path);
		assert_eq!(store.get("anything").unwrap(), None);
		store.set("a", "1").unwrap();
		assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
	}

	#[test]
	fn removing_missing_key_does_not_create_file() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("store.json");
		FileStore::new(&path).remove("nope").unwrap();
		assert!(!path.exists());
	}
}

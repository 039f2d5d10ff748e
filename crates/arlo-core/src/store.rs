// ── Key-path state store ──
//
// Nested JSON mapping addressed by key paths such as `["CAM1",
// "batteryLevel"]`. One mutex serializes every read and write. Saving
// writes a versioned snapshot to a temp file in the state directory and
// atomically renames it over the state file.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::StorageError;

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u64 = 1;

/// The persisted form of the store.
#[derive(Debug, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// Format version for compatibility checking.
    pub version: u64,
    pub saved_at: DateTime<Utc>,
    pub state: Value,
}

struct Inner {
    root: Map<String, Value>,
    /// Bumped on every change to `root`.
    generation: u64,
    /// Generation last written to disk.
    saved_generation: u64,
}

impl Inner {
    fn is_dirty(&self) -> bool {
        self.generation != self.saved_generation
    }
}

/// Shared, lock-protected key-path store.
pub struct StateStore {
    inner: Mutex<Inner>,
    /// `None` when state saving is off.
    file: Option<PathBuf>,
    /// Serializes concurrent `save` calls so an older snapshot never
    /// lands after a newer one.
    save_lock: Mutex<()>,
    durable_writes: AtomicU64,
}

impl StateStore {
    /// A store that persists to `file`, or lives only in memory when `None`.
    pub fn new(file: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                root: Map::new(),
                generation: 0,
                saved_generation: 0,
            }),
            file,
            save_lock: Mutex::new(()),
            durable_writes: AtomicU64::new(0),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(None)
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Reads ────────────────────────────────────────────────────────

    /// Value at `path`, or `None` if any segment is missing.
    pub fn get_value(&self, path: &[&str]) -> Option<Value> {
        let inner = self.lock();
        lookup(&inner.root, path).cloned()
    }

    /// Value at `path` decoded as `T`, or `default` when missing or of
    /// another shape.
    pub fn get<T: DeserializeOwned>(&self, path: &[&str], default: T) -> T {
        self.get_value(path)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(default)
    }

    /// Whether there are changes not yet written to disk.
    pub fn is_dirty(&self) -> bool {
        self.lock().is_dirty()
    }

    /// Number of snapshots written to disk by this store.
    pub fn durable_writes(&self) -> u64 {
        self.durable_writes.load(Ordering::Relaxed)
    }

    // ── Writes ───────────────────────────────────────────────────────

    /// Store `value` at `path`, creating intermediate objects.
    ///
    /// Returns whether the stored value changed; only a change marks the
    /// store dirty.
    pub fn set(&self, path: &[&str], value: impl Into<Value>) -> bool {
        let mut inner = self.lock();
        let changed = insert(&mut inner.root, path, value.into());
        if changed {
            inner.generation += 1;
        }
        changed
    }

    /// Apply several attributes below `prefix` under one lock acquisition.
    ///
    /// Returns the keys whose values changed, in the order given.
    pub fn set_many<I, K>(&self, prefix: &[&str], props: I) -> Vec<String>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut inner = self.lock();
        let mut changed = Vec::new();
        for (key, value) in props {
            let key = key.into();
            let mut path: Vec<&str> = prefix.to_vec();
            path.push(&key);
            if insert(&mut inner.root, &path, value) {
                changed.push(key);
            }
        }
        if !changed.is_empty() {
            inner.generation += 1;
        }
        changed
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Write a snapshot if saving is on and there are unsaved changes.
    ///
    /// Returns whether a file was written. A clean store performs no I/O.
    pub fn save(&self) -> Result<bool, StorageError> {
        let Some(path) = self.file.as_deref() else {
            return Ok(false);
        };

        let _saving = self.save_lock.lock().unwrap_or_else(PoisonError::into_inner);

        let (snapshot, generation) = {
            let inner = self.lock();
            if !inner.is_dirty() {
                return Ok(false);
            }
            let snapshot = StateSnapshot {
                version: SNAPSHOT_VERSION,
                saved_at: Utc::now(),
                state: Value::Object(inner.root.clone()),
            };
            (snapshot, inner.generation)
        };

        write_atomically(path, &snapshot)?;

        let mut inner = self.lock();
        inner.saved_generation = inner.saved_generation.max(generation);
        drop(inner);

        self.durable_writes.fetch_add(1, Ordering::Relaxed);
        debug!(path = %path.display(), "state saved");
        Ok(true)
    }

    /// Merge the saved snapshot into memory.
    ///
    /// Returns whether a snapshot was found. Loaded values do not count as
    /// unsaved changes.
    pub fn load(&self) -> Result<bool, StorageError> {
        let Some(path) = self.file.as_deref() else {
            return Ok(false);
        };

        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no saved state");
                return Ok(false);
            }
            Err(source) => {
                return Err(StorageError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let snapshot: StateSnapshot =
            serde_json::from_slice(&raw).map_err(|e| StorageError::Corrupt {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(StorageError::IncompatibleVersion {
                found: snapshot.version,
                expected: SNAPSHOT_VERSION,
            });
        }

        let Value::Object(state) = snapshot.state else {
            return Err(StorageError::Corrupt {
                path: path.to_path_buf(),
                message: "state is not an object".into(),
            });
        };

        let mut inner = self.lock();
        merge(&mut inner.root, state);
        inner.saved_generation = inner.generation;
        drop(inner);

        info!(path = %path.display(), saved_at = %snapshot.saved_at, "state loaded");
        Ok(true)
    }
}

// ── Tree helpers ─────────────────────────────────────────────────────

fn lookup<'a>(root: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    let mut node = root.get(*first)?;
    for key in rest {
        node = node.as_object()?.get(*key)?;
    }
    Some(node)
}

/// Insert `value` at `path`, replacing non-object intermediates.
fn insert(root: &mut Map<String, Value>, path: &[&str], value: Value) -> bool {
    let Some((last, parents)) = path.split_last() else {
        return false;
    };

    let mut node = root;
    for key in parents {
        let slot = node
            .entry((*key).to_owned())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        let Value::Object(map) = slot else {
            return false;
        };
        node = map;
    }

    if node.get(*last) == Some(&value) {
        return false;
    }
    node.insert((*last).to_owned(), value);
    true
}

/// Deep-merge `from` into `into`; leaves of `from` win.
fn merge(into: &mut Map<String, Value>, from: Map<String, Value>) {
    for (key, value) in from {
        let Value::Object(incoming) = value else {
            into.insert(key, value);
            continue;
        };
        if let Some(Value::Object(existing)) = into.get_mut(&key) {
            merge(existing, incoming);
            continue;
        }
        into.insert(key, Value::Object(incoming));
    }
}

fn write_atomically(path: &Path, snapshot: &StateSnapshot) -> Result<(), StorageError> {
    use std::io::Write;

    let io_err = |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(io_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(io_err)?;
    serde_json::to_writer_pretty(&mut tmp, snapshot).map_err(StorageError::Encode)?;
    tmp.flush().map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}

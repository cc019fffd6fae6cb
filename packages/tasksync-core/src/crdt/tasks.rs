/// CRDT task list backed by a Loro document.
///
/// Tasks live in the root movable list `tasks`, one map container per task
/// with `id`, `text` and `done` keys. Loro's import is commutative,
/// associative and idempotent, and causally incomplete updates are parked as
/// pending until their dependencies arrive.
use std::collections::HashSet;
use std::path::Path;

use loro::{
    Container, ExportMode, LoroDoc, LoroMap, LoroMovableList, ValueOrContainer, VersionVector,
};

use super::{loro_err, DocumentError};
use crate::types::Task;

const TASKS_KEY: &str = "tasks";

/// Outcome of merging a remote update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeOutcome {
    /// The operation log grew.
    pub changed: bool,
    /// Part of the update waits for operations this replica has not seen.
    pub pending: bool,
}

pub struct TaskDocument {
    doc: LoroDoc,
}

impl std::fmt::Debug for TaskDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDocument")
            .field("peer_id", &self.doc.peer_id())
            .field("tasks", &self.len())
            .finish()
    }
}

// ── Helpers for reading Loro values ──────────────────────────────────────────

fn read_string(voc: &ValueOrContainer) -> Option<String> {
    voc.as_value()
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn read_bool(voc: &ValueOrContainer) -> Option<bool> {
    voc.as_value().and_then(|v| v.as_bool()).copied()
}

fn get_string(map: &LoroMap, key: &str) -> String {
    map.get(key)
        .and_then(|v| read_string(&v))
        .unwrap_or_default()
}

fn get_bool(map: &LoroMap, key: &str) -> bool {
    map.get(key).and_then(|v| read_bool(&v)).unwrap_or(false)
}

fn get_map_at(list: &LoroMovableList, index: usize) -> Option<LoroMap> {
    match list.get(index)? {
        ValueOrContainer::Container(Container::Map(m)) => Some(m),
        _ => None,
    }
}

fn read_task(map: &LoroMap) -> Task {
    Task {
        id: get_string(map, "id"),
        text: get_string(map, "text"),
        done: get_bool(map, "done"),
    }
}

/// Random Loro peer id. 0, 1 and `u64::MAX` are avoided.
pub fn random_peer_id() -> u64 {
    let uuid = uuid::Uuid::new_v4();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&uuid.as_bytes()[..8]);
    match u64::from_le_bytes(bytes) {
        raw @ (0 | 1) => raw + 2,
        u64::MAX => u64::MAX - 1,
        raw => raw,
    }
}

impl TaskDocument {
    /// Empty document with a fresh random peer id.
    pub fn new() -> Result<Self, DocumentError> {
        Self::with_peer_id(random_peer_id())
    }

    pub fn with_peer_id(peer_id: u64) -> Result<Self, DocumentError> {
        let doc = LoroDoc::new();
        doc.set_peer_id(peer_id).map_err(loro_err)?;
        Ok(Self { doc })
    }

    fn tasks_list(&self) -> LoroMovableList {
        self.doc.get_movable_list(TASKS_KEY)
    }

    fn find_task_map(&self, id: &str) -> Option<LoroMap> {
        let list = self.tasks_list();
        (0..list.len())
            .filter_map(|i| get_map_at(&list, i))
            .find(|m| get_string(m, "id") == id)
    }

    pub fn peer_id(&self) -> u64 {
        self.doc.peer_id()
    }

    // ── Mutations ────────────────────────────────────────────────────────────

    /// Append a new task with a fresh id and `done = false`.
    pub fn create_task(&mut self, text: &str) -> Result<Task, DocumentError> {
        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.to_string(),
            done: false,
        };
        let map: LoroMap = self
            .tasks_list()
            .push_container(LoroMap::new())
            .map_err(loro_err)?;
        map.insert("id", task.id.as_str()).map_err(loro_err)?;
        map.insert("text", task.text.as_str()).map_err(loro_err)?;
        map.insert("done", task.done).map_err(loro_err)?;
        self.doc.commit();
        Ok(task)
    }

    /// Flip `done` for the task with `id`. Returns the new value, or `None`
    /// when the id is not known locally (nothing is written).
    pub fn toggle_task(&mut self, id: &str) -> Result<Option<bool>, DocumentError> {
        let Some(map) = self.find_task_map(id) else {
            return Ok(None);
        };
        let done = !get_bool(&map, "done");
        map.insert("done", done).map_err(loro_err)?;
        self.doc.commit();
        Ok(Some(done))
    }

    /// Integrate updates produced by another replica.
    pub fn merge(&mut self, updates: &[u8]) -> Result<MergeOutcome, DocumentError> {
        let before = self.doc.oplog_vv();
        let status = self
            .doc
            .import(updates)
            .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        Ok(MergeOutcome {
            changed: self.doc.oplog_vv() != before,
            pending: status.pending.is_some(),
        })
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    /// Materialized task list in list order.
    ///
    /// Maps whose `id` field has not arrived are skipped, and a duplicated id
    /// keeps its first position.
    pub fn snapshot(&self) -> Vec<Task> {
        let list = self.tasks_list();
        let mut seen = HashSet::new();
        let mut tasks = Vec::with_capacity(list.len());
        for i in 0..list.len() {
            let Some(map) = get_map_at(&list, i) else {
                continue;
            };
            let task = read_task(&map);
            if task.id.is_empty() || !seen.insert(task.id.clone()) {
                continue;
            }
            tasks.push(task);
        }
        tasks
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.find_task_map(id).map(|m| read_task(&m))
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Sync Primitives ─────────────────────────────────────────────────

    /// Current operation-log version vector.
    pub fn version(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    pub fn encoded_version(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }

    /// True when this document holds operations beyond `vv`.
    pub fn is_ahead_of(&self, vv: &VersionVector) -> bool {
        !vv.includes_vv(&self.doc.oplog_vv())
    }

    pub fn export_updates_since(&self, vv: &VersionVector) -> Result<Vec<u8>, DocumentError> {
        self.doc
            .export(ExportMode::updates(vv))
            .map_err(loro_err)
    }

    /// Export everything a peer with the encoded version vector is missing.
    ///
    /// `None` means the peer already has every local operation. An empty or
    /// undecodable vector is treated as "knows nothing".
    pub fn export_missing_for(&self, encoded_vv: &[u8]) -> Result<Option<Vec<u8>>, DocumentError> {
        let remote = if encoded_vv.is_empty() {
            VersionVector::default()
        } else {
            match VersionVector::decode(encoded_vv) {
                Ok(vv) => vv,
                Err(e) => {
                    log::debug!(
                        target: "tasksync.crdt",
                        "Undecodable version vector ({}), exporting everything",
                        e
                    );
                    VersionVector::default()
                }
            }
        };
        if !self.is_ahead_of(&remote) {
            return Ok(None);
        }
        self.export_updates_since(&remote).map(Some)
    }

    pub fn export_all(&self) -> Result<Vec<u8>, DocumentError> {
        self.doc.export(ExportMode::all_updates()).map_err(loro_err)
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Export CRDT state as bytes (snapshot).
    pub fn save(&self) -> Result<Vec<u8>, DocumentError> {
        self.doc.export(ExportMode::Snapshot).map_err(loro_err)
    }

    /// Load a document from snapshot bytes. A fresh peer id is assigned so
    /// the reloaded replica never reuses operation ids.
    pub fn load(bytes: &[u8]) -> Result<Self, DocumentError> {
        let doc = LoroDoc::from_snapshot(bytes)
            .map_err(|e| DocumentError::InvalidUpdate(e.to_string()))?;
        doc.set_peer_id(random_peer_id()).map_err(loro_err)?;
        Ok(Self { doc })
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), DocumentError> {
        let bytes = self.save()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, DocumentError> {
        let bytes = std::fs::read(path)?;
        Self::load(&bytes)
    }
}

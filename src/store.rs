//! Persistent bus_id -> client_id assignment map, write-through to disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ids::{BusId, ClientId};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to write assignments to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AssignmentRecord {
    assign_all_client_id: ClientId,
    device_assignments: HashMap<BusId, ClientId>,
}

/// Durable mapping from bus ID to desired client owner, plus the single
/// `assign_all` fallback client. Every mutator flushes to disk before
/// returning.
pub struct AssignmentStore {
    path: PathBuf,
    record: AssignmentRecord,
}

impl AssignmentStore {
    /// Loads from `path`. A missing file is not an error: the store
    /// starts empty. A malformed file logs a warning and also starts
    /// empty, leaving the bad file on disk for inspection.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let record = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("malformed assignments file {}: {e}", path.display());
                    AssignmentRecord::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AssignmentRecord::default(),
            Err(e) => {
                log::warn!("failed to read assignments file {}: {e}", path.display());
                AssignmentRecord::default()
            }
        };
        Self { path, record }
    }

    pub fn get(&self, bus_id: &BusId) -> Option<&ClientId> {
        self.record.device_assignments.get(bus_id)
    }

    pub fn set(&mut self, bus_id: BusId, client_id: ClientId) -> Result<(), StoreError> {
        self.record.device_assignments.insert(bus_id, client_id);
        self.flush()
    }

    pub fn remove(&mut self, bus_id: &BusId) -> Result<(), StoreError> {
        self.record.device_assignments.remove(bus_id);
        self.flush()
    }

    pub fn clear_all(&mut self) -> Result<(), StoreError> {
        self.record.device_assignments.clear();
        self.record.assign_all_client_id = ClientId::none();
        self.flush()
    }

    pub fn get_assign_all(&self) -> &ClientId {
        &self.record.assign_all_client_id
    }

    pub fn set_assign_all(&mut self, client_id: ClientId) -> Result<(), StoreError> {
        self.record.assign_all_client_id = client_id;
        self.flush()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BusId, &ClientId)> {
        self.record.device_assignments.iter()
    }

    fn flush(&self) -> Result<(), StoreError> {
        let tmp_path = tmp_path_for(&self.path);
        let json = serde_json::to_string(&self.record).expect("assignment record is serializable");
        std::fs::write(&tmp_path, json).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })?;
        std::fs::rename(&tmp_path, &self.path).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.json");
        let store = AssignmentStore::load(&path);
        assert!(store.get_assign_all().is_none());
        assert_eq!(store.iter().count(), 0);
    }

    #[test]
    fn malformed_file_starts_empty_and_is_left_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.json");
        std::fs::write(&path, "not json").unwrap();
        let store = AssignmentStore::load(&path);
        assert_eq!(store.iter().count(), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "not json");
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.json");
        {
            let mut store = AssignmentStore::load(&path);
            store.set(BusId::new("1-1"), ClientId::new("catc")).unwrap();
            store.set_assign_all(ClientId::new("dogd")).unwrap();
        }
        let reloaded = AssignmentStore::load(&path);
        assert_eq!(reloaded.get(&BusId::new("1-1")), Some(&ClientId::new("catc")));
        assert_eq!(reloaded.get_assign_all(), &ClientId::new("dogd"));
    }

    #[test]
    fn tmp_file_does_not_linger_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("assignments.json");
        let mut store = AssignmentStore::load(&path);
        store.set(BusId::new("1-1"), ClientId::new("catc")).unwrap();
        assert!(!tmp_path_for(&path).exists());
    }
}

//! Flat JSON files for processed IDs, pending approvals, pending deliveries and cancellations.
//!
//! Every save goes through a temp file in the same directory followed by a rename, so a crash
//! never leaves a half-written document behind.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{BotError, Result};
use crate::model::{CancelledOrder, Order, PendingDelivery};

/// Processed lists are truncated once they grow past this many entries...
pub const PRUNE_THRESHOLD: usize = 500;
/// ...down to the most recent this many.
pub const PRUNE_KEEP: usize = 200;

pub const PROCESSED_ORDERS_FILE: &str = "processed-orders.json";
pub const PROCESSED_CANCELS_FILE: &str = "processed-cancels.json";
pub const PENDING_ORDERS_FILE: &str = "pending-orders.json";
pub const PENDING_DELIVERY_FILE: &str = "pending-delivery.json";
pub const CANCELLED_ORDERS_FILE: &str = "cancelled-orders.json";

pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let store_err = |source: std::io::Error| BotError::Store {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(store_err)?;

    let mut temp_file = tempfile::NamedTempFile::new_in(dir).map_err(store_err)?;
    temp_file.write_all(data).map_err(store_err)?;
    temp_file.flush().map_err(store_err)?;
    temp_file.persist(path).map_err(|e| store_err(e.error))?;
    Ok(())
}

pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    atomic_write(path, json.as_bytes())
}

/// A JSON document backed by one file, loaded eagerly and saved on demand.
#[derive(Debug)]
pub struct JsonFile<T> {
    path: PathBuf,
    value: T,
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    /// Missing or unreadable files start out empty; a corrupt file is logged, not fatal.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let value = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Corrupt store, starting empty");
                T::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => T::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable store, starting empty");
                T::default()
            }
        };
        Self { path, value }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn save(&self) -> Result<()> {
        atomic_write_json(&self.path, &self.value)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Append-only list of handled IDs with a size cap.
#[derive(Debug)]
pub struct ProcessedIds {
    file: JsonFile<Vec<String>>,
}

impl ProcessedIds {
    pub fn load(path: impl Into<PathBuf>) -> Self {
        Self {
            file: JsonFile::load(path),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.file.get().iter().any(|known| known == id)
    }

    pub fn push(&mut self, id: impl Into<String>) -> Result<()> {
        self.file.get_mut().push(id.into());
        self.file.save()
    }

    pub fn len(&self) -> usize {
        self.file.get().len()
    }

    pub fn is_empty(&self) -> bool {
        self.file.get().is_empty()
    }

    /// Keeps the newest [`PRUNE_KEEP`] IDs once the list exceeds [`PRUNE_THRESHOLD`].
    /// Returns whether anything was dropped.
    pub fn prune(&mut self) -> Result<bool> {
        let len = self.file.get().len();
        if len <= PRUNE_THRESHOLD {
            return Ok(false);
        }
        self.file.get_mut().drain(..len - PRUNE_KEEP);
        self.file.save()?;
        tracing::info!(
            path = %self.file.path().display(),
            before = len,
            after = PRUNE_KEEP,
            "Pruned processed list"
        );
        Ok(true)
    }
}

/// Everything the intake pipeline persists, opened from one data directory.
#[derive(Debug)]
pub struct IntakeStores {
    pub pending: JsonFile<BTreeMap<String, Order>>,
    pub processed: ProcessedIds,
    pub processed_cancels: ProcessedIds,
    pub deliveries: JsonFile<Vec<PendingDelivery>>,
    pub cancelled: JsonFile<Vec<CancelledOrder>>,
}

impl IntakeStores {
    pub fn open(data_dir: &Path) -> Self {
        Self {
            pending: JsonFile::load(data_dir.join(PENDING_ORDERS_FILE)),
            processed: ProcessedIds::load(data_dir.join(PROCESSED_ORDERS_FILE)),
            processed_cancels: ProcessedIds::load(data_dir.join(PROCESSED_CANCELS_FILE)),
            deliveries: JsonFile::load(data_dir.join(PENDING_DELIVERY_FILE)),
            cancelled: JsonFile::load(data_dir.join(CANCELLED_ORDERS_FILE)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sample_order;
    use tempfile::tempdir;

    #[test]
    fn json_file_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/pending.json");

        let mut file: JsonFile<BTreeMap<String, Order>> = JsonFile::load(&path);
        assert!(file.get().is_empty());
        file.get_mut().insert("1".into(), sample_order("1"));
        file.save().unwrap();

        let reopened: JsonFile<BTreeMap<String, Order>> = JsonFile::load(&path);
        assert_eq!(reopened.get().get("1"), Some(&sample_order("1")));
    }

    #[test]
    fn corrupt_file_loads_as_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("processed.json");
        fs::write(&path, "{ not json").unwrap();

        let ids = ProcessedIds::load(&path);
        assert!(ids.is_empty());
    }

    #[test]
    fn prune_waits_for_threshold() {
        let dir = tempdir().unwrap();
        let mut ids = ProcessedIds::load(dir.path().join("p.json"));
        for i in 0..PRUNE_THRESHOLD {
            ids.file.get_mut().push(i.to_string());
        }
        assert!(!ids.prune().unwrap());
        assert_eq!(ids.len(), PRUNE_THRESHOLD);
    }

    #[test]
    fn prune_keeps_most_recent_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("p.json");
        let mut ids = ProcessedIds::load(&path);
        for i in 0..=PRUNE_THRESHOLD {
            ids.file.get_mut().push(i.to_string());
        }

        assert!(ids.prune().unwrap());
        assert_eq!(ids.len(), PRUNE_KEEP);
        assert!(ids.contains(&PRUNE_THRESHOLD.to_string()));
        assert!(!ids.contains("0"));

        let reopened = ProcessedIds::load(&path);
        assert_eq!(reopened.len(), PRUNE_KEEP);
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        atomic_write_json(&path, &vec!["a", "b"]).unwrap();

        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(fs::read_to_string(&path).unwrap().contains("\"a\""));
    }
}

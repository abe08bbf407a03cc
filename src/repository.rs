use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::model::{normalize_rel_path, FileId, FileRecord};

const SNAPSHOT_VERSION: u32 = 1;

pub type SharedRepository = Arc<Mutex<FileRepository>>;

/// Lock a shared repository. A poisoned lock still holds consistent data
/// because every mutation goes through `update`, so recover the guard.
pub fn lock(repo: &SharedRepository) -> MutexGuard<'_, FileRepository> {
    match repo.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    #[serde(default = "default_version")]
    version: u32,
    next_id: FileId,
    records: Vec<FileRecord>,
}

fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

#[derive(Debug, Default)]
pub struct FileRepository {
    snapshot_path: Option<PathBuf>,
    next_id: FileId,
    records: BTreeMap<FileId, FileRecord>,
    by_path: HashMap<String, FileId>,
    by_remote_id: HashMap<String, BTreeSet<FileId>>,
}

impl FileRepository {
    pub fn in_memory() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    pub fn open(snapshot_path: &Path) -> Result<Self> {
        let mut repo = Self::in_memory();
        repo.snapshot_path = Some(snapshot_path.to_path_buf());
        let raw = match fs::read(snapshot_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(repo),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", snapshot_path.display()))
            }
        };
        let snapshot: Snapshot = serde_json::from_slice(&raw)
            .with_context(|| format!("decode snapshot {}", snapshot_path.display()))?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported snapshot version {} in {}",
                snapshot.version,
                snapshot_path.display()
            );
        }
        for rec in snapshot.records {
            repo.next_id = repo.next_id.max(rec.id + 1);
            repo.index(&rec);
            repo.records.insert(rec.id, rec);
        }
        repo.next_id = repo.next_id.max(snapshot.next_id);
        Ok(repo)
    }

    pub fn into_shared(self) -> SharedRepository {
        Arc::new(Mutex::new(self))
    }

    pub fn snapshot_path(&self) -> Option<&Path> {
        self.snapshot_path.as_deref()
    }

    pub fn create(&mut self, relative_path: &str, is_folder: bool) -> Result<FileId> {
        let id = self.next_id;
        let rec = FileRecord::new(id, relative_path, is_folder);
        self.insert(rec)
    }

    /// Insert a fully built record, assigning it a fresh id.
    pub fn insert(&mut self, mut rec: FileRecord) -> Result<FileId> {
        rec.relative_path = normalize_rel_path(&rec.relative_path);
        if self.by_path.contains_key(&rec.relative_path) {
            anyhow::bail!("path already tracked: {}", rec.relative_path);
        }
        rec.id = self.next_id;
        self.next_id += 1;
        self.index(&rec);
        let id = rec.id;
        self.records.insert(id, rec);
        Ok(id)
    }

    pub fn get(&self, id: FileId) -> Option<&FileRecord> {
        self.records.get(&id)
    }

    /// Mutate one record in place; indexes follow path and remote id changes.
    pub fn update<T>(&mut self, id: FileId, f: impl FnOnce(&mut FileRecord) -> T) -> Option<T> {
        let mut rec = self.records.remove(&id)?;
        self.unindex(&rec);
        let out = f(&mut rec);
        rec.id = id;
        rec.relative_path = normalize_rel_path(&rec.relative_path);
        self.index(&rec);
        self.records.insert(id, rec);
        Some(out)
    }

    pub fn find_by_path(&self, relative_path: &str) -> Option<&FileRecord> {
        let key = normalize_rel_path(relative_path);
        self.by_path.get(&key).and_then(|id| self.records.get(id))
    }

    pub fn find_by_remote_id(&self, remote_id: Option<&str>) -> Option<&FileRecord> {
        let ids = self.by_remote_id.get(remote_id?)?;
        ids.iter().next().and_then(|id| self.records.get(id))
    }

    /// Every holder of a remote id. More than one only while a remote rename
    /// is split into delete-of-old and create-of-new.
    pub fn find_all_by_remote_id(&self, remote_id: &str) -> Vec<FileId> {
        self.by_remote_id
            .get(remote_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn all(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> Vec<FileId> {
        self.records.keys().copied().collect()
    }

    pub fn filter(&self, predicate: impl Fn(&FileRecord) -> bool) -> Vec<FileRecord> {
        self.records
            .values()
            .filter(|rec| predicate(rec))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn delete(&mut self, id: FileId) -> Option<FileRecord> {
        let rec = self.records.remove(&id)?;
        self.unindex(&rec);
        Some(rec)
    }

    /// Flush the full table to the snapshot file (temp file + rename).
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.snapshot_path.as_deref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            next_id: self.next_id,
            records: self.records.values().cloned().collect(),
        };
        let data = serde_json::to_vec_pretty(&snapshot).context("encode snapshot")?;

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "snapshot.json".to_string());
        let tmp = path.with_file_name(format!(".{name}.tmp-{}", uuid::Uuid::new_v4()));
        let mut file =
            fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
        file.write_all(&data)
            .and_then(|_| file.sync_all())
            .with_context(|| format!("write {}", tmp.display()))?;
        drop(file);
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("rename snapshot to {}", path.display()));
        }
        Ok(())
    }

    fn index(&mut self, rec: &FileRecord) {
        self.by_path.insert(rec.relative_path.clone(), rec.id);
        if let Some(remote_id) = &rec.remote_id {
            self.by_remote_id
                .entry(remote_id.clone())
                .or_default()
                .insert(rec.id);
        }
    }

    fn unindex(&mut self, rec: &FileRecord) {
        if self.by_path.get(&rec.relative_path) == Some(&rec.id) {
            self.by_path.remove(&rec.relative_path);
        }
        if let Some(remote_id) = &rec.remote_id {
            if let Some(ids) = self.by_remote_id.get_mut(remote_id) {
                ids.remove(&rec.id);
                if ids.is_empty() {
                    self.by_remote_id.remove(remote_id);
                }
            }
        }
    }
}

/// Snapshot file for one project on one backend.
pub fn snapshot_path(state_dir: &Path, backend: &str, project_id: &str) -> PathBuf {
    let mut hasher = Sha1::new();
    hasher.update(format!("{backend}|{project_id}"));
    let digest = format!("{:x}", hasher.finalize());
    state_dir.join("snapshots").join(format!("{digest}.json"))
}

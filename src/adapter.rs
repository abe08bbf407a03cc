use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::backend::Backend;
use crate::filters::SyncIgnoreList;
use crate::model::{parent_path, FileId, FileRecord, RemoteEntry};
use crate::repository::{lock, SharedRepository};
use crate::telemetry::TransferStats;

/// Primitive operation a sync task applies to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateLocalFolder,
    Download,
    DeleteLocal,
    CreateRemoteFolder,
    Upload,
    UpdateRemote,
    DeleteRemote,
}

impl Operation {
    pub fn is_delete(self) -> bool {
        matches!(self, Operation::DeleteLocal | Operation::DeleteRemote)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::CreateLocalFolder => "create-local-folder",
            Operation::Download => "download",
            Operation::DeleteLocal => "delete-local",
            Operation::CreateRemoteFolder => "create-remote-folder",
            Operation::Upload => "upload",
            Operation::UpdateRemote => "update-remote",
            Operation::DeleteRemote => "delete-remote",
        };
        f.write_str(name)
    }
}

/// Backend calls plus local disk I/O, addressed by repository handle.
/// Records are re-read from the repository after every await.
#[derive(Clone)]
pub struct FileAdapter {
    backend: Arc<dyn Backend>,
    repo: SharedRepository,
    project_dir: PathBuf,
    filters: SyncIgnoreList,
    stats: Arc<TransferStats>,
}

impl FileAdapter {
    pub fn new(
        backend: Arc<dyn Backend>,
        repo: SharedRepository,
        project_dir: &Path,
        filters: SyncIgnoreList,
    ) -> Self {
        Self {
            backend,
            repo,
            project_dir: project_dir.to_path_buf(),
            filters,
            stats: Arc::new(TransferStats::default()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn repo(&self) -> &SharedRepository {
        &self.repo
    }

    pub fn filters(&self) -> &SyncIgnoreList {
        &self.filters
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }

    pub fn local_path(&self, relative_path: &str) -> PathBuf {
        local_path(&self.project_dir, relative_path)
    }

    pub async fn load_file_list(&self) -> Result<Vec<RemoteEntry>> {
        let listing = self.backend.load_file_list().await.context("load file list")?;
        Ok(listing
            .into_iter()
            .map(|mut e| {
                e.relative_path = crate::model::normalize_rel_path(&e.relative_path);
                e
            })
            .filter(|e| !e.relative_path.is_empty())
            .filter(|e| !self.filters.should_ignore(&e.relative_path, e.is_folder))
            .collect())
    }

    pub async fn apply(&self, op: Operation, id: FileId) -> Result<()> {
        let res = match op {
            Operation::CreateLocalFolder => self.create_local_folder(id).await,
            Operation::Download => self.download(id).await,
            Operation::DeleteLocal => self.delete_local(id).await,
            Operation::CreateRemoteFolder => self.create_remote_folder(id).await,
            Operation::Upload => self.upload(id).await,
            Operation::UpdateRemote => self.update_remote(id).await,
            Operation::DeleteRemote => self.delete_remote(id).await,
        };
        if let Err(err) = &res {
            self.stats.set_last_error(format!("{op}: {err:#}"));
        }
        res
    }

    pub async fn download(&self, id: FileId) -> Result<()> {
        let rec = self.record(id)?;
        let remote_id = require_remote_id(&rec)?;
        let bytes = self.backend.download(&remote_id, &rec.url).await?;
        self.stats.on_recv(bytes.len() as u64);

        let target = self.local_path(&rec.relative_path);
        self.set_watcher_synced(id, false);
        let written = write_atomic(&target, &bytes).await;
        let hash = format!("{:x}", md5::compute(&bytes));
        lock(&self.repo).update(id, |r| {
            r.watcher_synced = true;
            if written.is_ok() {
                r.local_revision = r.remote_revision.clone();
                r.local_hash = Some(hash);
            }
        });
        written
    }

    pub async fn create_local_folder(&self, id: FileId) -> Result<()> {
        let rec = self.record(id)?;
        let target = self.local_path(&rec.relative_path);
        if target.is_file() {
            anyhow::bail!("{} exists locally as a file", rec.relative_path);
        }
        self.set_watcher_synced(id, false);
        let created = tokio::fs::create_dir_all(&target)
            .await
            .with_context(|| format!("mkdir {}", target.display()));
        lock(&self.repo).update(id, |r| {
            r.watcher_synced = true;
            if created.is_ok() {
                r.local_revision = r.remote_revision.clone();
            }
        });
        created
    }

    pub async fn create_remote_folder(&self, id: FileId) -> Result<()> {
        let rec = self.record(id)?;
        let parent = self.parent_remote_id(&rec.relative_path)?;
        let entry = self
            .backend
            .create_remote(&rec.relative_path, parent.as_deref())
            .await?;
        self.stats.on_operation();
        self.adopt(id, &entry, None);
        Ok(())
    }

    pub async fn upload(&self, id: FileId) -> Result<()> {
        let rec = self.record(id)?;
        let source = self.local_path(&rec.relative_path);
        let content = tokio::fs::read(&source)
            .await
            .with_context(|| format!("read {}", source.display()))?;
        let parent = self.parent_remote_id(&rec.relative_path)?;
        let size = content.len() as u64;
        let hash = format!("{:x}", md5::compute(&content));
        let entry = self
            .backend
            .upload(&rec.relative_path, content, parent.as_deref())
            .await?;
        self.stats.on_send(size);
        self.adopt(id, &entry, Some(hash));
        Ok(())
    }

    pub async fn update_remote(&self, id: FileId) -> Result<()> {
        let rec = self.record(id)?;
        let remote_id = require_remote_id(&rec)?;
        let source = self.local_path(&rec.relative_path);
        let content = tokio::fs::read(&source)
            .await
            .with_context(|| format!("read {}", source.display()))?;
        let size = content.len() as u64;
        let hash = format!("{:x}", md5::compute(&content));
        let entry = self.backend.update_remote(&remote_id, content).await?;
        self.stats.on_send(size);
        self.adopt(id, &entry, Some(hash));
        Ok(())
    }

    pub async fn delete_remote(&self, id: FileId) -> Result<()> {
        let rec = self.record(id)?;
        let remote_id = require_remote_id(&rec)?;
        self.backend.delete_remote(&remote_id).await?;
        self.stats.on_operation();
        lock(&self.repo).delete(id);
        Ok(())
    }

    pub async fn delete_local(&self, id: FileId) -> Result<()> {
        let rec = self.record(id)?;
        let target = self.local_path(&rec.relative_path);
        self.set_watcher_synced(id, false);
        let removed = if rec.is_folder {
            self.remove_folder(&target).await
        } else {
            match tokio::fs::remove_file(&target).await {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err).with_context(|| format!("remove {}", target.display())),
            }
        };
        if let Err(err) = removed {
            self.set_watcher_synced(id, true);
            return Err(err);
        }
        self.stats.on_operation();
        lock(&self.repo).delete(id);
        Ok(())
    }

    /// Children are deleted before their folder, so only ignored leftovers
    /// may still be inside. Anything else keeps the folder in place.
    async fn remove_folder(&self, target: &Path) -> Result<()> {
        match tokio::fs::remove_dir(target).await {
            Ok(()) => return Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(_) => {}
        }
        let mut entries = tokio::fs::read_dir(target)
            .await
            .with_context(|| format!("read dir {}", target.display()))?;
        let mut kept = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("read dir {}", target.display()))?
        {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !self.filters.should_ignore_abs(&entry.path(), is_dir) {
                kept.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        if !kept.is_empty() {
            kept.sort();
            anyhow::bail!(
                "folder {} still holds untracked entries: {}",
                target.display(),
                kept.join(", ")
            );
        }
        tokio::fs::remove_dir_all(target)
            .await
            .with_context(|| format!("remove {}", target.display()))
    }

    fn record(&self, id: FileId) -> Result<FileRecord> {
        lock(&self.repo)
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("file record {id} no longer exists"))
    }

    fn set_watcher_synced(&self, id: FileId, value: bool) {
        lock(&self.repo).update(id, |r| r.watcher_synced = value);
    }

    fn adopt(&self, id: FileId, entry: &RemoteEntry, hash: Option<String>) {
        lock(&self.repo).update(id, |r| {
            r.adopt_remote(entry);
            r.local_revision = entry.remote_revision.clone();
            if hash.is_some() {
                r.local_hash = hash;
            }
        });
    }

    /// Remote id of the folder containing `relative_path`; `None` at the root.
    fn parent_remote_id(&self, relative_path: &str) -> Result<Option<String>> {
        let Some(parent) = parent_path(relative_path) else {
            return Ok(None);
        };
        let repo = lock(&self.repo);
        match repo.find_by_path(parent) {
            Some(rec) if rec.remote_id.is_some() => Ok(rec.remote_id.clone()),
            Some(_) => anyhow::bail!("parent folder {parent} is not created remotely yet"),
            None => anyhow::bail!("parent folder {parent} is not tracked"),
        }
    }
}

pub fn local_path(project_dir: &Path, relative_path: &str) -> PathBuf {
    let mut p = project_dir.to_path_buf();
    for part in relative_path.split('/').filter(|s| !s.is_empty()) {
        p.push(part);
    }
    p
}

fn require_remote_id(rec: &FileRecord) -> Result<String> {
    rec.remote_id
        .clone()
        .ok_or_else(|| anyhow::anyhow!("{} has no remote id", rec.relative_path))
}

/// Write through a hidden temp file in the same directory, then rename.
async fn write_atomic(target: &Path, bytes: &[u8]) -> Result<()> {
    let dir = target
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent for {}", target.display()))?;
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("mkdir {}", dir.display()))?;
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{name}.tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    if let Err(err) = tokio::fs::rename(&tmp, target).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(err).with_context(|| format!("rename into {}", target.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DirBackend;
    use crate::model::Change;
    use crate::repository::FileRepository;
    use crate::watcher::{apply_local_event, LocalEventKind};

    fn setup(name: &str) -> (FileAdapter, Arc<DirBackend>, SharedRepository, PathBuf) {
        let tmp = std::env::temp_dir().join(format!("treesync-rs-adapter-{name}"));
        let _ = std::fs::remove_dir_all(&tmp);
        let project = tmp.join("project");
        std::fs::create_dir_all(&project).unwrap();
        let backend = Arc::new(DirBackend::open(&tmp.join("remote"), "p").unwrap());
        let repo = FileRepository::in_memory().into_shared();
        let filters = SyncIgnoreList::load(&project, &[]).unwrap();
        let adapter = FileAdapter::new(backend.clone(), repo.clone(), &project, filters);
        (adapter, backend, repo, project)
    }

    #[tokio::test]
    async fn upload_then_download_roundtrip_updates_revisions() {
        let (adapter, _backend, repo, project) = setup("roundtrip");
        std::fs::write(project.join("main.tex"), "v1").unwrap();
        let id = lock(&repo).create("main.tex", false).unwrap();
        adapter.upload(id).await.unwrap();
        let rec = lock(&repo).get(id).cloned().unwrap();
        assert!(rec.remote_id.is_some());
        assert_eq!(rec.local_revision, rec.remote_revision);
        assert_eq!(rec.local_hash, Some(format!("{:x}", md5::compute(b"v1"))));

        std::fs::remove_file(project.join("main.tex")).unwrap();
        lock(&repo).update(id, |r| r.watcher_synced = true);
        adapter.download(id).await.unwrap();
        assert_eq!(std::fs::read_to_string(project.join("main.tex")).unwrap(), "v1");
        assert!(lock(&repo).get(id).unwrap().watcher_synced);
        assert_eq!(adapter.stats().snapshot().bytes_recv_total, 2);
    }

    #[tokio::test]
    async fn download_leaves_later_edits_visible() {
        let (adapter, backend, repo, project) = setup("watch-after-download");
        let entry = backend.upload("main.tex", b"theirs".to_vec(), None).await.unwrap();
        let id = lock(&repo).insert(entry.to_record(0)).unwrap();
        adapter.download(id).await.unwrap();

        let own = format!("{:x}", md5::compute(b"theirs"));
        let mut guard = lock(&repo);
        assert!(!apply_local_event(
            &mut guard,
            "main.tex",
            LocalEventKind::Modified,
            false,
            Some(own)
        ));
        assert!(apply_local_event(
            &mut guard,
            "main.tex",
            LocalEventKind::Modified,
            false,
            Some("edited".to_string())
        ));
        assert_eq!(guard.get(id).unwrap().local_change, Change::Update);
        drop(guard);
        assert_eq!(std::fs::read_to_string(project.join("main.tex")).unwrap(), "theirs");
    }

    #[tokio::test]
    async fn folder_delete_keeps_untracked_content() {
        let (adapter, _backend, repo, project) = setup("rmdir");
        std::fs::create_dir_all(project.join("a")).unwrap();
        std::fs::write(project.join("a/notes.tex"), "mine").unwrap();
        let id = lock(&repo).create("a", true).unwrap();

        let err = adapter.delete_local(id).await.unwrap_err();
        assert!(err.to_string().contains("notes.tex"), "{err:#}");
        assert!(project.join("a/notes.tex").is_file());
        assert!(lock(&repo).get(id).unwrap().watcher_synced);

        std::fs::remove_file(project.join("a/notes.tex")).unwrap();
        std::fs::write(project.join("a/.DS_Store"), "junk").unwrap();
        adapter.delete_local(id).await.unwrap();
        assert!(!project.join("a").exists());
        assert!(lock(&repo).get(id).is_none());
    }

    #[tokio::test]
    async fn remote_folder_links_parent() {
        let (adapter, backend, repo, project) = setup("folders");
        std::fs::create_dir_all(project.join("a/b")).unwrap();
        let a = lock(&repo).create("a", true).unwrap();
        let b = lock(&repo).create("a/b", true).unwrap();

        let err = adapter.create_remote_folder(b).await.unwrap_err();
        assert!(err.to_string().contains("not created remotely"));

        adapter.create_remote_folder(a).await.unwrap();
        adapter.create_remote_folder(b).await.unwrap();
        assert_eq!(backend.load_file_list().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn deletes_tolerate_missing_local_files_and_drop_records() {
        let (adapter, _backend, repo, _project) = setup("deletes");
        let id = lock(&repo).create("gone.tex", false).unwrap();
        lock(&repo).update(id, |r| r.local_change = Change::No);
        adapter.delete_local(id).await.unwrap();
        assert!(lock(&repo).get(id).is_none());

        let err = adapter.apply(Operation::Download, id).await.unwrap_err();
        assert!(err.to_string().contains("no longer exists"));
        assert!(!adapter.stats().snapshot().last_error.is_empty());
    }

    #[tokio::test]
    async fn create_local_folder_is_idempotent() {
        let (adapter, _backend, repo, project) = setup("mkdir");
        std::fs::create_dir_all(project.join("figs")).unwrap();
        let id = lock(&repo).create("figs", true).unwrap();
        adapter.create_local_folder(id).await.unwrap();
        adapter.create_local_folder(id).await.unwrap();
        assert!(project.join("figs").is_dir());
    }

    #[tokio::test]
    async fn listing_drops_ignored_entries() {
        let (adapter, backend, _repo, _project) = setup("listing");
        backend.upload("main.tex", b"x".to_vec(), None).await.unwrap();
        backend.upload(".DS_Store", b"x".to_vec(), None).await.unwrap();
        let listing = adapter.load_file_list().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].relative_path, "main.tex");
    }
}

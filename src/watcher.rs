use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use walkdir::WalkDir;

use crate::events::{Events, SyncEvent};
use crate::filters::SyncIgnoreList;
use crate::logging;
use crate::model::{normalize_rel_path, Change, FileRecord};
use crate::repository::{lock, FileRepository, SharedRepository};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEventKind {
    Created,
    Modified,
    Removed,
}

/// Record one local change. Returns whether the repository changed.
///
/// While `watcher_synced` is down the engine is writing the path and the
/// event is its own. A content hash equal to `local_hash` is not a change.
pub fn apply_local_event(
    repo: &mut FileRepository,
    relative_path: &str,
    kind: LocalEventKind,
    is_dir: bool,
    content_hash: Option<String>,
) -> bool {
    let rel = normalize_rel_path(relative_path);
    if rel.is_empty() {
        return false;
    }
    let existing = repo.find_by_path(&rel).cloned();
    match (kind, existing) {
        (LocalEventKind::Removed, None) => false,
        (LocalEventKind::Removed, Some(rec)) => {
            if !rec.watcher_synced {
                repo.update(rec.id, |r| r.watcher_synced = true);
                return false;
            }
            mark_removed(repo, &rec);
            true
        }
        (_, None) => {
            let mut rec = FileRecord::new(0, &rel, is_dir);
            rec.local_change = Change::Create;
            rec.watcher_synced = true;
            rec.refresh_location();
            match repo.insert(rec) {
                Ok(_) => true,
                Err(err) => {
                    logging::error(format!("track local file {rel}: {err:#}"));
                    false
                }
            }
        }
        (_, Some(rec)) => {
            if !rec.watcher_synced {
                repo.update(rec.id, |r| r.watcher_synced = true);
                return false;
            }
            if rec.is_folder {
                return false;
            }
            if content_hash.is_some() && content_hash == rec.local_hash {
                return false;
            }
            let next = match rec.local_change {
                Change::No => Change::Update,
                Change::Delete if rec.remote_id.is_some() => Change::Update,
                Change::Delete => Change::Create,
                Change::Create | Change::Update => return false,
            };
            repo.update(rec.id, |r| {
                r.local_change = next;
                r.refresh_location();
            });
            true
        }
    }
}

// Records that never reached the remote are dropped instead.
fn mark_removed(repo: &mut FileRepository, rec: &FileRecord) {
    let prefix = format!("{}/", rec.relative_path);
    let affected = repo.filter(|r| r.id == rec.id || r.relative_path.starts_with(&prefix));
    for r in affected {
        if r.remote_id.is_none() && r.local_change == Change::Create {
            repo.delete(r.id);
            continue;
        }
        repo.update(r.id, |r| {
            r.local_change = Change::Delete;
            r.refresh_location();
        });
    }
}

/// Bring the repository up to date with the disk after the process was down.
/// Returns the number of records that changed.
pub fn scan_local(
    repo: &mut FileRepository,
    project_dir: &Path,
    filters: &SyncIgnoreList,
) -> Result<usize> {
    let mut changed = 0;
    let mut seen = HashSet::new();

    let walker = WalkDir::new(project_dir)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !filters.should_ignore_abs(e.path(), e.file_type().is_dir()));
    for entry in walker {
        let entry = entry.with_context(|| format!("scan {}", project_dir.display()))?;
        let is_dir = entry.file_type().is_dir();
        if !is_dir && !entry.file_type().is_file() {
            continue;
        }
        let rel = relative_to(project_dir, entry.path())?;
        seen.insert(rel.clone());

        let Some(rec) = repo.find_by_path(&rel).cloned() else {
            apply_local_event(repo, &rel, LocalEventKind::Created, is_dir, None);
            changed += 1;
            continue;
        };
        if rec.is_folder || rec.local_change == Change::Create || rec.local_change == Change::Update
        {
            continue;
        }
        let hash = hash_file(entry.path())?;
        let edited = rec.local_hash.as_ref().is_some_and(|h| *h != hash);
        if edited || rec.local_change == Change::Delete {
            repo.update(rec.id, |r| r.watcher_synced = true);
            if apply_local_event(repo, &rel, LocalEventKind::Modified, false, Some(hash)) {
                changed += 1;
            }
        }
    }

    let vanished = repo.filter(|r| !seen.contains(&r.relative_path));
    for rec in vanished {
        if repo.get(rec.id).is_none() || rec.local_change == Change::Delete {
            continue;
        }
        if rec.remote_id.is_none() && rec.local_change == Change::Create {
            repo.delete(rec.id);
            changed += 1;
        } else if rec.local_revision.is_some() || rec.local_hash.is_some() {
            repo.update(rec.id, |r| {
                r.local_change = Change::Delete;
                r.refresh_location();
            });
            changed += 1;
        }
    }
    Ok(changed)
}

fn relative_to(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .with_context(|| format!("strip prefix {}", path.display()))?;
    Ok(normalize_rel_path(&rel.to_string_lossy()))
}

fn hash_file(path: &Path) -> Result<String> {
    let data = std::fs::read(path).with_context(|| format!("read {}", path.display()))?;
    Ok(format!("{:x}", md5::compute(data)))
}

pub async fn watch_project(
    project_dir: PathBuf,
    repo: SharedRepository,
    filters: SyncIgnoreList,
    events: Events,
    sync_kick: Arc<tokio::sync::Notify>,
) -> Result<()> {
    let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(256);
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = event_tx.blocking_send(res);
        },
        notify::Config::default(),
    )?;
    watcher
        .watch(&project_dir, RecursiveMode::Recursive)
        .with_context(|| format!("watch {}", project_dir.display()))?;

    let debounce = Duration::from_millis(50);
    let mut pending: HashSet<PathBuf> = HashSet::new();

    while let Some(res) = event_rx.recv().await {
        ingest_event_paths(&mut pending, res);

        let timer = tokio::time::sleep(debounce);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => break,
                next = event_rx.recv() => {
                    match next {
                        None => break,
                        Some(res) => ingest_event_paths(&mut pending, res),
                    }
                }
            }
        }

        let mut paths: Vec<PathBuf> = pending.drain().collect();
        paths.sort();
        let mut touched = Vec::new();
        for path in paths {
            match observe_path(&project_dir, &repo, &filters, &path).await {
                Ok(changed) => touched.extend(changed),
                Err(err) => logging::warn(format!("watch {}: {err:#}", path.display())),
            }
        }
        if touched.is_empty() {
            continue;
        }
        if let Err(err) = lock(&repo).save() {
            logging::error(format!("persist file repository: {err:#}"));
        }
        for path in touched {
            events.emit(SyncEvent::ChangeDetected { path });
        }
        sync_kick.notify_one();
    }

    Ok(())
}

fn ingest_event_paths(pending: &mut HashSet<PathBuf>, res: notify::Result<notify::Event>) {
    let event = match res {
        Ok(ev) => ev,
        Err(err) => {
            logging::warn(format!("notify error: {err:?}"));
            return;
        }
    };
    match event.kind {
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
            pending.extend(event.paths);
        }
        _ => {}
    }
}

// A directory that appears with content (moved in) reports its children.
async fn observe_path(
    project_dir: &Path,
    repo: &SharedRepository,
    filters: &SyncIgnoreList,
    path: &Path,
) -> Result<Vec<String>> {
    let rel = relative_to(project_dir, path)?;
    if rel.is_empty() {
        return Ok(Vec::new());
    }
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => Some(meta),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
        Err(err) => return Err(err).with_context(|| format!("stat {}", path.display())),
    };

    let Some(meta) = meta else {
        let changed =
            apply_local_event(&mut lock(repo), &rel, LocalEventKind::Removed, false, None);
        return Ok(if changed { vec![rel] } else { Vec::new() });
    };

    let is_dir = meta.is_dir();
    if filters.should_ignore(&rel, is_dir) {
        return Ok(Vec::new());
    }
    let hash = if is_dir {
        None
    } else {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("read {}", path.display()))?;
        Some(format!("{:x}", md5::compute(data)))
    };

    let mut touched = Vec::new();
    let mut repo = lock(repo);
    let kind = if repo.find_by_path(&rel).is_some() {
        LocalEventKind::Modified
    } else {
        LocalEventKind::Created
    };
    if apply_local_event(&mut repo, &rel, kind, is_dir, hash) {
        touched.push(rel.clone());
    }
    if is_dir && kind == LocalEventKind::Created {
        let children = WalkDir::new(path)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !filters.should_ignore_abs(e.path(), e.file_type().is_dir()))
            .filter_map(|e| e.ok());
        for child in children {
            let child_rel = relative_to(project_dir, child.path())?;
            let child_dir = child.file_type().is_dir();
            if repo.find_by_path(&child_rel).is_none()
                && apply_local_event(
                    &mut repo,
                    &child_rel,
                    LocalEventKind::Created,
                    child_dir,
                    None,
                )
            {
                touched.push(child_rel);
            }
        }
    }
    Ok(touched)
}

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::adapter::{FileAdapter, Operation};
use crate::conflict::{is_cancelled, ConflictResolver};
use crate::events::{Events, SyncEvent};
use crate::filters::SyncIgnoreList;
use crate::logging;
use crate::model::{
    Change, ChangeLocation, FileId, FileRecord, RemoteEntry, SyncMode, SyncResult,
};
use crate::repository::{lock, FileRepository, SharedRepository};
use crate::runner::Reconciler;
use crate::scheduler::{create_priority, delete_priority, Task, TaskOutcome, TaskScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Run(Operation),
    Settle,
    Forget,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedOp {
    pub id: FileId,
    pub op: Operation,
    pub relative_path: String,
    pub priority: i64,
}

pub fn resolve_action(rec: &FileRecord, side: SyncMode) -> Action {
    match side {
        SyncMode::Pull => match rec.remote_change {
            Change::Create if rec.is_folder && rec.local_change == Change::Create => Action::Settle,
            Change::Create | Change::Update if rec.is_folder => {
                Action::Run(Operation::CreateLocalFolder)
            }
            Change::Create | Change::Update => Action::Run(Operation::Download),
            Change::Delete if rec.local_change == Change::Delete => Action::Forget,
            Change::Delete => Action::Run(Operation::DeleteLocal),
            Change::No => Action::Skip,
        },
        SyncMode::Push => {
            let remote_deleted = rec.remote_change == Change::Delete;
            let remote_exists = rec.remote_change == Change::Create
                || (rec.remote_id.is_some() && !remote_deleted);
            let recreate = if rec.is_folder {
                Operation::CreateRemoteFolder
            } else {
                Operation::Upload
            };
            match rec.local_change {
                Change::Create if rec.is_folder && remote_exists => Action::Settle,
                Change::Create if remote_exists => Action::Run(Operation::UpdateRemote),
                Change::Create => Action::Run(recreate),
                Change::Update if remote_deleted || rec.remote_id.is_none() => {
                    Action::Run(recreate)
                }
                Change::Update if rec.is_folder => Action::Settle,
                Change::Update => Action::Run(Operation::UpdateRemote),
                Change::Delete if remote_deleted || rec.remote_id.is_none() => Action::Forget,
                Change::Delete => Action::Run(Operation::DeleteRemote),
                Change::No => Action::Skip,
            }
        }
    }
}

pub fn diff_remote(repo: &mut FileRepository, listing: &[RemoteEntry], filters: &SyncIgnoreList) {
    for id in repo.ids() {
        let ignored = repo
            .get(id)
            .map(|r| filters.should_ignore(&r.relative_path, r.is_folder))
            .unwrap_or(false);
        if ignored {
            repo.delete(id);
            continue;
        }
        repo.update(id, |r| {
            r.remote_change = Change::No;
            r.change_location = ChangeLocation::No;
        });
    }

    for entry in listing {
        let mut placed = false;
        for id in repo.find_all_by_remote_id(&entry.remote_id) {
            let Some(holder) = repo.get(id).cloned() else {
                continue;
            };
            repo.update(id, |r| {
                r.remote_revision = entry.remote_revision.clone();
                r.url = entry.url.clone();
            });

            if holder.relative_path == entry.relative_path {
                placed = true;
                repo.update(id, |r| {
                    if r.local_revision.is_none() && r.remote_revision.is_some() {
                        // Never applied locally yet.
                        r.remote_change = Change::Create;
                    } else if r.local_revision != r.remote_revision {
                        r.remote_change = Change::Update;
                    }
                });
                continue;
            }

            // Remote rename: the holder's path is gone remotely.
            match holder.local_change {
                Change::No => {
                    repo.update(id, |r| r.remote_change = Change::Delete);
                }
                Change::Delete => {
                    repo.delete(id);
                }
                Change::Create | Change::Update => {
                    logging::warn_kv(
                        "remote rename over local change, keeping local copy as new file",
                        &[
                            ("path", &holder.relative_path),
                            ("renamed_to", &entry.relative_path),
                            ("local_change", &format!("{:?}", holder.local_change)),
                        ],
                    );
                    repo.update(id, |r| r.detach_remote());
                }
            }
        }
        if !placed {
            place_remote_entry(repo, entry);
        }
    }

    let listed: HashSet<&str> = listing.iter().map(|e| e.remote_id.as_str()).collect();
    for id in repo.ids() {
        repo.update(id, |r| {
            if let Some(remote_id) = r.remote_id.as_deref() {
                if !listed.contains(remote_id) {
                    r.remote_change = Change::Delete;
                }
            }
            r.refresh_location();
        });
    }
}

// A local record at the entry's path makes it a create/create collision.
fn place_remote_entry(repo: &mut FileRepository, entry: &RemoteEntry) {
    let occupant = repo.find_by_path(&entry.relative_path).map(|r| r.id);
    match occupant {
        Some(id) => {
            repo.update(id, |r| {
                r.remote_change = Change::Create;
                if r.local_change != Change::Delete {
                    r.local_change = Change::Create;
                }
                r.adopt_remote(entry);
            });
        }
        None => {
            let mut rec = entry.to_record(0);
            rec.remote_change = Change::Create;
            if let Err(err) = repo.insert(rec) {
                logging::error(format!("track remote entry {}: {err:#}", entry.relative_path));
            }
        }
    }
}

/// Records changed on both sides are skipped when no mode was elected.
pub fn plan_operations(repo: &mut FileRepository, mode: Option<SyncMode>) -> Vec<PlannedOp> {
    let mut planned = Vec::new();
    for id in repo.ids() {
        let Some(rec) = repo.get(id).cloned() else {
            continue;
        };
        let side = match rec.change_location {
            ChangeLocation::No => continue,
            ChangeLocation::Local => SyncMode::Push,
            ChangeLocation::Remote => SyncMode::Pull,
            ChangeLocation::Both => match mode {
                Some(mode) => mode,
                None => continue,
            },
        };
        match resolve_action(&rec, side) {
            Action::Run(op) => {
                let priority = if op.is_delete() {
                    delete_priority(&rec.relative_path)
                } else {
                    create_priority(&rec.relative_path)
                };
                planned.push(PlannedOp {
                    id,
                    op,
                    relative_path: rec.relative_path,
                    priority,
                });
            }
            Action::Settle => {
                repo.update(id, |r| r.settle());
            }
            Action::Forget => {
                repo.delete(id);
            }
            Action::Skip => {}
        }
    }
    keep_live_folders(&mut planned);
    planned
}

// A folder delete must not take pending creates or updates below it along;
// the folder is recreated on the side that deleted it instead.
fn keep_live_folders(planned: &mut [PlannedOp]) {
    let live: Vec<String> = planned
        .iter()
        .filter(|p| !p.op.is_delete())
        .map(|p| p.relative_path.clone())
        .collect();
    for p in planned.iter_mut() {
        let revive = match p.op {
            Operation::DeleteLocal => Operation::CreateRemoteFolder,
            Operation::DeleteRemote => Operation::CreateLocalFolder,
            _ => continue,
        };
        let prefix = format!("{}/", p.relative_path);
        if !live.iter().any(|path| path.starts_with(&prefix)) {
            continue;
        }
        logging::warn_kv(
            "folder delete would drop pending changes below it, recreating",
            &[("path", &p.relative_path), ("instead_of", &p.op.to_string())],
        );
        p.op = revive;
        p.priority = create_priority(&p.relative_path);
    }
}

fn persist(repo: &FileRepository) {
    if let Err(err) = repo.save() {
        logging::error(format!("persist file repository: {err:#}"));
    }
}

pub struct SyncEngine {
    adapter: FileAdapter,
    resolver: Arc<dyn ConflictResolver>,
    events: Events,
    scheduler: TaskScheduler,
}

impl SyncEngine {
    pub fn new(adapter: FileAdapter, resolver: Arc<dyn ConflictResolver>, events: Events) -> Self {
        Self {
            adapter,
            resolver,
            events,
            scheduler: TaskScheduler::new(),
        }
    }

    pub fn adapter(&self) -> &FileAdapter {
        &self.adapter
    }

    pub fn repo(&self) -> &SharedRepository {
        self.adapter.repo()
    }

    pub async fn reconcile(&self) -> SyncResult {
        let listing = match self.adapter.load_file_list().await {
            Ok(listing) => listing,
            Err(err) => {
                logging::error(format!("load remote file list: {err:#}"));
                return SyncResult::failed(vec![format!("{err:#}")]);
            }
        };

        let conflicts = {
            let mut repo = lock(self.repo());
            diff_remote(&mut repo, &listing, self.adapter.filters());
            persist(&repo);
            repo.filter(|r| r.change_location == ChangeLocation::Both)
        };

        let mode = if conflicts.is_empty() {
            None
        } else {
            match self.resolver.decide_sync_mode(&conflicts).await {
                Ok(mode) => Some(mode),
                Err(err) => {
                    if !is_cancelled(&err) {
                        logging::error(format!("conflict resolution failed: {err:#}"));
                    }
                    return SyncResult::unresolved_conflict();
                }
            }
        };

        let planned = {
            let mut repo = lock(self.repo());
            let planned = plan_operations(&mut repo, mode);
            persist(&repo);
            planned
        };
        logging::info_kv(
            "reconcile planned",
            &[
                ("remote_entries", &listing.len().to_string()),
                ("conflicts", &conflicts.len().to_string()),
                ("tasks", &planned.len().to_string()),
            ],
        );

        let tasks: Vec<Task<'_>> = planned.iter().map(|p| self.task(p)).collect();
        let outcomes = self.scheduler.run(tasks).await;
        persist(&lock(self.repo()));

        let errors: Vec<String> = outcomes
            .into_iter()
            .filter(|o| !o.success)
            .map(|o| o.message)
            .collect();
        if errors.is_empty() {
            SyncResult::ok()
        } else {
            for message in &errors {
                self.events.emit(SyncEvent::Error {
                    message: message.clone(),
                });
            }
            SyncResult::failed(errors)
        }
    }

    fn task<'a>(&'a self, planned: &PlannedOp) -> Task<'a> {
        let id = planned.id;
        let op = planned.op;
        let label = format!("{op} {}", planned.relative_path);
        Task::new(label.clone(), planned.priority, async move {
            match self.adapter.apply(op, id).await {
                Ok(()) => {
                    lock(self.repo()).update(id, |r| r.settle());
                    TaskOutcome::ok(label)
                }
                Err(err) => TaskOutcome::failed(format!("{label}: {err:#}")),
            }
        })
    }
}

#[async_trait]
impl Reconciler for SyncEngine {
    async fn reconcile(&self) -> SyncResult {
        SyncEngine::reconcile(self).await
    }
}

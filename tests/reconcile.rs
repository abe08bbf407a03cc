use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use treesync::adapter::{FileAdapter, Operation};
use treesync::backend::{Backend, CompileOutcome, DirBackend, ProjectInfo};
use treesync::conflict::{ConflictResolver, FixedResolver};
use treesync::diff::{diff_remote, plan_operations, SyncEngine};
use treesync::events::Events;
use treesync::filters::SyncIgnoreList;
use treesync::model::{Change, ChangeLocation, FileRecord, RemoteEntry, SyncMode};
use treesync::repository::{lock, FileRepository};
use treesync::watcher;

struct Fixture {
    project: PathBuf,
    remote: Arc<DirBackend>,
    engine: SyncEngine,
}

fn fixture(name: &str, resolver: Arc<dyn ConflictResolver>) -> Fixture {
    fixture_with(name, resolver, |remote| remote as Arc<dyn Backend>)
}

fn fixture_with(
    name: &str,
    resolver: Arc<dyn ConflictResolver>,
    wrap: impl FnOnce(Arc<DirBackend>) -> Arc<dyn Backend>,
) -> Fixture {
    let root = std::env::temp_dir().join(format!("treesync-rs-reconcile-{name}"));
    let _ = std::fs::remove_dir_all(&root);
    let project = root.join("project");
    std::fs::create_dir_all(&project).unwrap();
    let remote = Arc::new(DirBackend::open(&root.join("remote"), "proj").unwrap());

    let repo = FileRepository::in_memory().into_shared();
    let filters = SyncIgnoreList::load(&project, &[]).unwrap();
    let adapter = FileAdapter::new(wrap(remote.clone()), repo, &project, filters);
    Fixture {
        project,
        remote,
        engine: SyncEngine::new(adapter, resolver, Events::new()),
    }
}

impl Fixture {
    fn scan(&self) -> usize {
        let adapter = self.engine.adapter();
        watcher::scan_local(
            &mut lock(self.engine.repo()),
            adapter.project_dir(),
            adapter.filters(),
        )
        .unwrap()
    }

    fn write(&self, rel: &str, content: &str) {
        let path = self.project.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.project.join(rel)).unwrap()
    }

    fn records(&self) -> Vec<FileRecord> {
        lock(self.engine.repo()).all().cloned().collect()
    }

    fn record(&self, rel: &str) -> Option<FileRecord> {
        lock(self.engine.repo()).find_by_path(rel).cloned()
    }

    fn operations(&self) -> u64 {
        self.engine.adapter().stats().snapshot().operations_total
    }

    async fn remote_entry(&self, rel: &str) -> Option<RemoteEntry> {
        self.remote
            .load_file_list()
            .await
            .unwrap()
            .into_iter()
            .find(|e| e.relative_path == rel)
    }

    async fn plan(&self) -> Vec<(Operation, String, i64)> {
        let adapter = self.engine.adapter();
        let listing = adapter.load_file_list().await.unwrap();
        let mut repo = lock(self.engine.repo());
        diff_remote(&mut repo, &listing, adapter.filters());
        plan_operations(&mut repo, None)
            .into_iter()
            .map(|p| (p.op, p.relative_path, p.priority))
            .collect()
    }
}

fn resolver(mode: Option<SyncMode>) -> Arc<dyn ConflictResolver> {
    Arc::new(FixedResolver(mode))
}

/// Resolver that records what it was asked and what the disk looked like.
struct Recording {
    mode: SyncMode,
    project: PathBuf,
    seen: Mutex<Vec<(Vec<FileRecord>, Option<String>)>>,
    watched_path: String,
}

#[async_trait]
impl ConflictResolver for Recording {
    async fn decide_sync_mode(&self, conflicts: &[FileRecord]) -> Result<SyncMode> {
        let on_disk = std::fs::read_to_string(self.project.join(&self.watched_path)).ok();
        self.seen
            .lock()
            .unwrap()
            .push((conflicts.to_vec(), on_disk));
        Ok(self.mode)
    }
}

async fn seed_remote(remote: &DirBackend, files: &[(&str, &str)]) {
    for (rel, content) in files {
        let parent = match rel.rsplit_once('/') {
            Some((dir, _)) => {
                let existing = remote
                    .load_file_list()
                    .await
                    .unwrap()
                    .into_iter()
                    .find(|e| e.relative_path == dir);
                Some(match existing {
                    Some(e) => e.remote_id,
                    None => remote.create_remote(dir, None).await.unwrap().remote_id,
                })
            }
            None => None,
        };
        remote
            .upload(rel, content.as_bytes().to_vec(), parent.as_deref())
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn fully_synced_tree_runs_no_tasks() {
    let fx = fixture("noop", resolver(None));
    seed_remote(&fx.remote, &[("main.tex", "hello"), ("figs/a.png", "png")]).await;
    assert!(fx.engine.reconcile().await.success);
    let ops = fx.operations();
    let before = fx.records();

    assert_eq!(fx.scan(), 0);
    let result = fx.engine.reconcile().await;
    assert!(result.success && !result.conflict && result.errors.is_empty());
    assert_eq!(fx.operations(), ops);
    assert_eq!(fx.records(), before);
}

#[tokio::test]
async fn local_create_is_uploaded() {
    let fx = fixture("scenario-a", resolver(None));
    fx.write("new.tex", "fresh");
    fx.scan();

    let plan = fx.plan().await;
    assert_eq!(plan, vec![(Operation::Upload, "new.tex".to_string(), 0)]);

    let result = fx.engine.reconcile().await;
    assert!(result.success, "{result:?}");
    let rec = fx.record("new.tex").unwrap();
    assert_eq!(rec.local_change, Change::No);
    assert_eq!(rec.change_location, ChangeLocation::No);
    assert!(rec.remote_id.is_some());
    assert!(fx.remote_entry("new.tex").await.is_some());
}

#[tokio::test]
async fn remote_delete_removes_local_copy() {
    let fx = fixture("scenario-b", resolver(None));
    seed_remote(&fx.remote, &[("old.tex", "bye"), ("keep.tex", "stay")]).await;
    assert!(fx.engine.reconcile().await.success);
    assert_eq!(fx.read("old.tex"), "bye");

    let entry = fx.remote_entry("old.tex").await.unwrap();
    fx.remote.delete_remote(&entry.remote_id).await.unwrap();

    let plan = fx.plan().await;
    assert_eq!(plan, vec![(Operation::DeleteLocal, "old.tex".to_string(), 0)]);

    assert!(fx.engine.reconcile().await.success);
    assert!(fx.record("old.tex").is_none());
    assert!(!fx.project.join("old.tex").exists());
    assert!(fx.record("keep.tex").is_some());
}

#[tokio::test]
async fn identical_folder_rename_on_both_sides_converges() {
    let recording = Arc::new(Recording {
        mode: SyncMode::Pull,
        project: PathBuf::new(),
        seen: Mutex::new(Vec::new()),
        watched_path: String::new(),
    });
    let fx = fixture("scenario-c", recording.clone());
    seed_remote(&fx.remote, &[("images/a.png", "A"), ("images/b.png", "B")]).await;
    assert!(fx.engine.reconcile().await.success);
    assert_eq!(fx.records().len(), 3);

    fx.remote.rename_path("images", "renamed_images").unwrap();
    std::fs::rename(fx.project.join("images"), fx.project.join("renamed_images")).unwrap();
    fx.scan();

    let result = fx.engine.reconcile().await;
    assert!(result.success, "{result:?}");

    let seen = recording.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let mut conflicted: Vec<&str> = seen[0].0.iter().map(|r| r.relative_path.as_str()).collect();
    conflicted.sort();
    assert_eq!(
        conflicted,
        vec!["renamed_images", "renamed_images/a.png", "renamed_images/b.png"]
    );
    assert!(seen[0]
        .0
        .iter()
        .all(|r| r.change_location == ChangeLocation::Both));

    let mut paths: Vec<String> = fx.records().into_iter().map(|r| r.relative_path).collect();
    paths.sort();
    assert_eq!(
        paths,
        vec!["renamed_images", "renamed_images/a.png", "renamed_images/b.png"]
    );
    for rec in fx.records() {
        assert_eq!(rec.change_location, ChangeLocation::No);
        let holders = lock(fx.engine.repo()).find_all_by_remote_id(rec.remote_id.as_deref().unwrap());
        assert_eq!(holders.len(), 1);
    }
    assert_eq!(fx.read("renamed_images/a.png"), "A");
}

#[tokio::test]
async fn remote_folder_rename_moves_local_tree() {
    let fx = fixture("remote-rename", resolver(None));
    seed_remote(&fx.remote, &[("images/a.png", "A")]).await;
    assert!(fx.engine.reconcile().await.success);

    fx.remote.rename_path("images", "pictures").unwrap();
    let result = fx.engine.reconcile().await;
    assert!(result.success, "{result:?}");

    assert!(!fx.project.join("images").exists());
    assert_eq!(fx.read("pictures/a.png"), "A");
    let mut paths: Vec<String> = fx.records().into_iter().map(|r| r.relative_path).collect();
    paths.sort();
    assert_eq!(paths, vec!["pictures", "pictures/a.png"]);
}

#[tokio::test]
async fn same_file_created_on_both_sides_push_overwrites_remote() {
    let fx = fixture("scenario-d", resolver(Some(SyncMode::Push)));
    fx.write("dup.tex", "local words");
    fx.scan();
    let first = fx
        .remote
        .upload("dup.tex", b"remote words".to_vec(), None)
        .await
        .unwrap();

    {
        let adapter = fx.engine.adapter();
        let listing = adapter.load_file_list().await.unwrap();
        let mut repo = lock(fx.engine.repo());
        diff_remote(&mut repo, &listing, adapter.filters());
        let rec = repo.find_by_path("dup.tex").unwrap();
        assert_eq!(rec.change_location, ChangeLocation::Both);
        assert_eq!(rec.local_change, Change::Create);
        assert_eq!(rec.remote_change, Change::Create);
    }

    let result = fx.engine.reconcile().await;
    assert!(result.success, "{result:?}");

    let entry = fx.remote_entry("dup.tex").await.unwrap();
    assert_eq!(entry.remote_id, first.remote_id);
    assert_ne!(entry.remote_revision, first.remote_revision);
    let content = fx.remote.download(&entry.remote_id, &entry.url).await.unwrap();
    assert_eq!(content, b"local words".to_vec());
    let rec = fx.record("dup.tex").unwrap();
    assert_eq!(rec.remote_revision, entry.remote_revision);
    assert_eq!(rec.local_revision, entry.remote_revision);
}

struct Offline;

#[async_trait]
impl Backend for Offline {
    fn kind(&self) -> &'static str {
        "offline"
    }
    async fn validate_token(&self) -> Result<()> {
        anyhow::bail!("offline")
    }
    async fn load_project_info(&self) -> Result<ProjectInfo> {
        anyhow::bail!("offline")
    }
    async fn load_file_list(&self) -> Result<Vec<RemoteEntry>> {
        anyhow::bail!("network unreachable")
    }
    async fn upload(&self, _: &str, _: Vec<u8>, _: Option<&str>) -> Result<RemoteEntry> {
        anyhow::bail!("offline")
    }
    async fn create_remote(&self, _: &str, _: Option<&str>) -> Result<RemoteEntry> {
        anyhow::bail!("offline")
    }
    async fn download(&self, _: &str, _: &str) -> Result<Vec<u8>> {
        anyhow::bail!("offline")
    }
    async fn update_remote(&self, _: &str, _: Vec<u8>) -> Result<RemoteEntry> {
        anyhow::bail!("offline")
    }
    async fn delete_remote(&self, _: &str) -> Result<()> {
        anyhow::bail!("offline")
    }
    async fn compile_project(&self) -> Result<CompileOutcome> {
        anyhow::bail!("offline")
    }
}

#[tokio::test]
async fn offline_listing_leaves_repository_untouched() {
    let fx = fixture_with("scenario-e", resolver(Some(SyncMode::Push)), |_| {
        Arc::new(Offline) as Arc<dyn Backend>
    });
    fx.write("draft.tex", "x");
    fx.write("figs/plot.png", "y");
    fx.scan();
    let before = fx.records();

    let result = fx.engine.reconcile().await;
    assert!(!result.success);
    assert!(!result.conflict);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].contains("network unreachable"));
    assert_eq!(fx.records(), before);
    assert_eq!(fx.operations(), 0);
}

#[tokio::test]
async fn update_conflict_asks_resolver_before_any_task() {
    let watched = "main.tex".to_string();
    let fx_name = "update-conflict";
    let project = std::env::temp_dir()
        .join(format!("treesync-rs-reconcile-{fx_name}"))
        .join("project");
    let recording = Arc::new(Recording {
        mode: SyncMode::Pull,
        project,
        seen: Mutex::new(Vec::new()),
        watched_path: watched,
    });
    let fx = fixture(fx_name, recording.clone());
    seed_remote(&fx.remote, &[("main.tex", "v1"), ("other.tex", "o1")]).await;
    assert!(fx.engine.reconcile().await.success);

    fx.write("main.tex", "local edit");
    assert_eq!(fx.scan(), 1);
    let main = fx.remote_entry("main.tex").await.unwrap();
    fx.remote
        .update_remote(&main.remote_id, b"remote edit".to_vec())
        .await
        .unwrap();
    let other = fx.remote_entry("other.tex").await.unwrap();
    fx.remote
        .update_remote(&other.remote_id, b"o2".to_vec())
        .await
        .unwrap();
    let ops_before = fx.operations();

    let result = fx.engine.reconcile().await;
    assert!(result.success, "{result:?}");

    let seen = recording.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (conflicts, on_disk) = &seen[0];
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].relative_path, "main.tex");
    assert_eq!(conflicts[0].local_change, Change::Update);
    assert_eq!(conflicts[0].remote_change, Change::Update);
    assert_eq!(on_disk.as_deref(), Some("local edit"));

    assert_eq!(fx.operations(), ops_before + 2);
    assert_eq!(fx.read("main.tex"), "remote edit");
    assert_eq!(fx.read("other.tex"), "o2");
}

#[tokio::test]
async fn unresolved_conflict_keeps_state_for_retry() {
    let fx = fixture("unresolved", resolver(None));
    seed_remote(&fx.remote, &[("main.tex", "v1")]).await;
    assert!(fx.engine.reconcile().await.success);

    fx.write("main.tex", "mine");
    fx.scan();
    let main = fx.remote_entry("main.tex").await.unwrap();
    fx.remote
        .update_remote(&main.remote_id, b"theirs".to_vec())
        .await
        .unwrap();

    let result = fx.engine.reconcile().await;
    assert!(!result.success);
    assert!(result.conflict);
    assert!(result.errors.is_empty());
    assert_eq!(
        fx.record("main.tex").unwrap().change_location,
        ChangeLocation::Both
    );
    assert_eq!(fx.read("main.tex"), "mine");
}

/// Directory store whose uploads can be switched off.
struct Flaky {
    inner: Arc<DirBackend>,
    uploads_fail: AtomicBool,
}

#[async_trait]
impl Backend for Flaky {
    fn kind(&self) -> &'static str {
        "flaky"
    }
    async fn validate_token(&self) -> Result<()> {
        self.inner.validate_token().await
    }
    async fn load_project_info(&self) -> Result<ProjectInfo> {
        self.inner.load_project_info().await
    }
    async fn load_file_list(&self) -> Result<Vec<RemoteEntry>> {
        self.inner.load_file_list().await
    }
    async fn upload(
        &self,
        rel: &str,
        content: Vec<u8>,
        parent: Option<&str>,
    ) -> Result<RemoteEntry> {
        if self.uploads_fail.load(Ordering::SeqCst) {
            anyhow::bail!("quota exceeded");
        }
        self.inner.upload(rel, content, parent).await
    }
    async fn create_remote(&self, rel: &str, parent: Option<&str>) -> Result<RemoteEntry> {
        self.inner.create_remote(rel, parent).await
    }
    async fn download(&self, remote_id: &str, url: &str) -> Result<Vec<u8>> {
        self.inner.download(remote_id, url).await
    }
    async fn update_remote(&self, remote_id: &str, content: Vec<u8>) -> Result<RemoteEntry> {
        self.inner.update_remote(remote_id, content).await
    }
    async fn delete_remote(&self, remote_id: &str) -> Result<()> {
        self.inner.delete_remote(remote_id).await
    }
    async fn compile_project(&self) -> Result<CompileOutcome> {
        self.inner.compile_project().await
    }
}

#[tokio::test]
async fn failed_task_is_reported_and_retried_next_pass() {
    let flaky: Arc<Mutex<Option<Arc<Flaky>>>> = Arc::new(Mutex::new(None));
    let slot = flaky.clone();
    let fx = fixture_with("flaky", resolver(None), move |remote| {
        let backend = Arc::new(Flaky {
            inner: remote,
            uploads_fail: AtomicBool::new(true),
        });
        *slot.lock().unwrap() = Some(backend.clone());
        backend as Arc<dyn Backend>
    });
    let flaky = flaky.lock().unwrap().clone().unwrap();

    fx.write("docs/a.tex", "a");
    fx.write("b.tex", "b");
    fx.scan();

    let result = fx.engine.reconcile().await;
    assert!(!result.success);
    assert!(!result.conflict);
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors.iter().all(|e| e.contains("quota exceeded")));
    // The folder went through; only the file uploads failed.
    assert_eq!(fx.record("docs").unwrap().local_change, Change::No);
    assert_eq!(fx.record("b.tex").unwrap().local_change, Change::Create);
    assert!(fx
        .engine
        .adapter()
        .stats()
        .snapshot()
        .last_error
        .contains("quota exceeded"));

    flaky.uploads_fail.store(false, Ordering::SeqCst);
    let retry = fx.engine.reconcile().await;
    assert!(retry.success, "{retry:?}");
    assert!(fx.remote_entry("docs/a.tex").await.is_some());
    assert!(fx.remote_entry("b.tex").await.is_some());
}

#[tokio::test]
async fn local_delete_is_pushed_deepest_first() {
    let fx = fixture("local-delete", resolver(None));
    seed_remote(&fx.remote, &[("a/b/c.tex", "c")]).await;
    assert!(fx.engine.reconcile().await.success);
    assert_eq!(fx.records().len(), 3);

    std::fs::remove_dir_all(fx.project.join("a")).unwrap();
    fx.scan();
    let mut plan = fx.plan().await;
    plan.sort_by_key(|(_, _, priority)| -priority);
    let order: Vec<(Operation, &str)> = plan.iter().map(|(op, p, _)| (*op, p.as_str())).collect();
    assert_eq!(
        order,
        vec![
            (Operation::DeleteRemote, "a/b/c.tex"),
            (Operation::DeleteRemote, "a/b"),
            (Operation::DeleteRemote, "a"),
        ]
    );

    let result = fx.engine.reconcile().await;
    assert!(result.success, "{result:?}");
    assert!(fx.records().is_empty());
    assert!(fx.remote.load_file_list().await.unwrap().is_empty());
}

#[tokio::test]
async fn remote_folder_delete_keeps_new_local_child() {
    let fx = fixture("remote-folder-delete", resolver(None));
    seed_remote(&fx.remote, &[("a/b.tex", "b")]).await;
    assert!(fx.engine.reconcile().await.success);

    let folder = fx.remote_entry("a").await.unwrap();
    fx.remote.delete_remote(&folder.remote_id).await.unwrap();
    fx.write("a/new.tex", "unsynced");
    assert_eq!(fx.scan(), 1);

    let plan = fx.plan().await;
    assert!(plan.contains(&(Operation::CreateRemoteFolder, "a".to_string(), 0)));
    assert!(!plan.iter().any(|(op, p, _)| *op == Operation::DeleteLocal && p == "a"));

    let result = fx.engine.reconcile().await;
    assert!(result.success, "{result:?}");
    assert_eq!(fx.read("a/new.tex"), "unsynced");
    assert!(!fx.project.join("a/b.tex").exists());
    assert!(fx.remote_entry("a/new.tex").await.is_some());
    assert!(fx.remote_entry("a/b.tex").await.is_none());
    let rec = fx.record("a/new.tex").unwrap();
    assert_eq!(rec.change_location, ChangeLocation::No);
    assert!(rec.remote_id.is_some());

    assert_eq!(fx.scan(), 0);
    assert!(fx.engine.reconcile().await.success);
    assert_eq!(fx.read("a/new.tex"), "unsynced");
}

#[tokio::test]
async fn local_folder_delete_keeps_new_remote_child() {
    let fx = fixture("local-folder-delete", resolver(None));
    seed_remote(&fx.remote, &[("a/b.tex", "b")]).await;
    assert!(fx.engine.reconcile().await.success);

    std::fs::remove_dir_all(fx.project.join("a")).unwrap();
    fx.scan();
    seed_remote(&fx.remote, &[("a/new.tex", "theirs")]).await;

    let result = fx.engine.reconcile().await;
    assert!(result.success, "{result:?}");
    assert_eq!(fx.read("a/new.tex"), "theirs");
    assert!(fx.remote_entry("a/new.tex").await.is_some());
    assert!(fx.remote_entry("a/b.tex").await.is_none());
    assert!(!fx.project.join("a/b.tex").exists());
    assert_eq!(fx.record("a").unwrap().change_location, ChangeLocation::No);
}

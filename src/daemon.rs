use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Notify;

use crate::adapter::FileAdapter;
use crate::backend::{self, Backend};
use crate::config::Config;
use crate::conflict::{ConflictResolver, FixedResolver};
use crate::diff::SyncEngine;
use crate::events::Events;
use crate::filters::SyncIgnoreList;
use crate::model::{FileRecord, SyncMode, SyncResult};
use crate::repository::{lock, snapshot_path, FileRepository, SharedRepository};
use crate::runner::SyncRunner;
use crate::telemetry::TransferStatsSnapshot;
use crate::watcher;
use crate::workspace::{ensure_state_layout, StateLock};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Overrides `conflict_mode` from the config.
    pub mode: Option<SyncMode>,
    pub log_to_stdout: bool,
    pub sync_interval: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            mode: None,
            log_to_stdout: true,
            sync_interval: Duration::from_secs(30),
        }
    }
}

/// Everything one project needs for a sync session, wired once from the
/// config. Holds the state-dir lock for its whole lifetime.
pub struct Session {
    cfg: Config,
    opts: SessionOptions,
    engine: Arc<SyncEngine>,
    runner: SyncRunner,
    events: Events,
    _lock: StateLock,
}

impl Session {
    pub fn open(cfg: Config, opts: SessionOptions) -> Result<Self> {
        let resolver: Arc<dyn ConflictResolver> =
            Arc::new(FixedResolver(opts.mode.or(cfg.conflict_mode)));
        Self::open_with_resolver(cfg, opts, resolver)
    }

    pub fn open_with_resolver(
        cfg: Config,
        opts: SessionOptions,
        resolver: Arc<dyn ConflictResolver>,
    ) -> Result<Self> {
        let state_dir = cfg.state_dir();
        ensure_state_layout(&state_dir)?;
        let state_lock = StateLock::acquire(&state_dir)?;

        let log_path = crate::logging::log_file_path(&state_dir);
        crate::logging::init_log_file(&log_path, opts.log_to_stdout)?;
        crate::logging::info_kv(
            "session start",
            &[
                ("version", env!("CARGO_PKG_VERSION")),
                ("project", &cfg.project_id),
                ("backend", &cfg.backend),
                ("project_dir", &cfg.project_dir.display().to_string()),
            ],
        );

        std::fs::create_dir_all(&cfg.project_dir)
            .with_context(|| format!("create {}", cfg.project_dir.display()))?;
        let backend = backend::connect(&cfg)?;
        let snapshot = snapshot_path(&state_dir, backend.kind(), &cfg.project_id);
        let repo = FileRepository::open(&snapshot)?.into_shared();
        let filters = SyncIgnoreList::load(&cfg.project_dir, &cfg.ignore)?;
        for source in filters.sources() {
            crate::logging::info_kv(
                "ignore patterns",
                &[
                    ("origin", &source.origin),
                    ("lines", &source.lines.len().to_string()),
                ],
            );
        }

        let events = Events::new();
        let adapter = FileAdapter::new(backend, repo, &cfg.project_dir, filters);
        let engine = Arc::new(SyncEngine::new(adapter, resolver, events.clone()));
        let runner = SyncRunner::new(engine.clone(), events.clone());

        Ok(Self {
            cfg,
            opts,
            engine,
            runner,
            events,
            _lock: state_lock,
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn events(&self) -> &Events {
        &self.events
    }

    pub fn runner(&self) -> &SyncRunner {
        &self.runner
    }

    pub fn repo(&self) -> &SharedRepository {
        self.engine.repo()
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        self.engine.adapter().backend()
    }

    pub fn transfer_stats(&self) -> TransferStatsSnapshot {
        self.engine.adapter().stats().snapshot()
    }

    /// Records with a pending change on either side.
    pub fn pending_changes(&self) -> Vec<FileRecord> {
        lock(self.repo()).filter(|r| {
            r.local_change != crate::model::Change::No
                || r.remote_change != crate::model::Change::No
        })
    }

    /// Pick up edits made while no watcher was running.
    pub fn scan_local(&self) -> Result<usize> {
        let adapter = self.engine.adapter();
        let mut repo = lock(self.repo());
        let changed = watcher::scan_local(&mut repo, adapter.project_dir(), adapter.filters())?;
        if changed > 0 {
            crate::logging::info_kv("local scan", &[("changed", &changed.to_string())]);
            repo.save()?;
        }
        Ok(changed)
    }

    pub async fn sync_once(&self) -> Result<SyncResult> {
        self.scan_local()?;
        Ok(self.runner.run().await)
    }

    /// Watch the project and sync on every local change, on a timer for
    /// remote changes, until `shutdown` is notified.
    pub async fn run_watch(&self, shutdown: Arc<Notify>) -> Result<()> {
        self.scan_local()?;
        let adapter = self.engine.adapter();
        let sync_kick = Arc::new(Notify::new());
        let watch_task = tokio::spawn(watcher::watch_project(
            adapter.project_dir().to_path_buf(),
            self.repo().clone(),
            adapter.filters().clone(),
            self.events.clone(),
            sync_kick.clone(),
        ));

        loop {
            let result = self.runner.run().await;
            if result.conflict {
                crate::logging::warn("conflicts pending, waiting for a sync mode");
            }
            for err in &result.errors {
                crate::logging::error(format!("sync error: {err}"));
            }

            tokio::select! {
                _ = tokio::time::sleep(self.opts.sync_interval) => {}
                _ = sync_kick.notified() => {}
                _ = shutdown.notified() => break,
            }
        }

        watch_task.abort();
        match watch_task.await {
            Ok(Err(err)) => crate::logging::error(format!("watcher stopped: {err:#}")),
            Ok(Ok(())) | Err(_) => {}
        }
        crate::logging::info("session stop");
        Ok(())
    }
}

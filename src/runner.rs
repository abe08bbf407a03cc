use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;

use crate::events::{Events, SyncEvent};
use crate::logging;
use crate::model::SyncResult;

#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self) -> SyncResult;
}

enum RunState {
    Idle,
    Running,
    /// A run is in flight and one follow-up is queued; every caller that
    /// arrived meanwhile shares its result.
    RunningWithPending {
        tx: watch::Sender<Option<SyncResult>>,
    },
}

struct Inner {
    reconciler: Arc<dyn Reconciler>,
    state: Mutex<RunState>,
    events: Events,
}

/// Single-flight reconciliation: at most one pass at a time, and callers
/// arriving during a pass are coalesced into one follow-up pass.
#[derive(Clone)]
pub struct SyncRunner {
    inner: Arc<Inner>,
}

enum Entry {
    Execute,
    Wait(watch::Receiver<Option<SyncResult>>),
}

impl SyncRunner {
    pub fn new(reconciler: Arc<dyn Reconciler>, events: Events) -> Self {
        Self {
            inner: Arc::new(Inner {
                reconciler,
                state: Mutex::new(RunState::Idle),
                events,
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        !matches!(*self.inner.lock_state(), RunState::Idle)
    }

    /// Result of a pass that started at or after this call.
    pub async fn run(&self) -> SyncResult {
        let entry = {
            let mut state = self.inner.lock_state();
            match &*state {
                RunState::Idle => {
                    *state = RunState::Running;
                    Entry::Execute
                }
                RunState::Running => {
                    let (tx, rx) = watch::channel(None);
                    *state = RunState::RunningWithPending { tx };
                    Entry::Wait(rx)
                }
                RunState::RunningWithPending { tx } => Entry::Wait(tx.subscribe()),
            }
        };

        match entry {
            Entry::Execute => {
                let _guard = RunGuard(self.inner.clone());
                self.inner.execute().await
            }
            Entry::Wait(mut rx) => match rx.wait_for(|v| v.is_some()).await {
                Ok(result) => (*result).clone().unwrap_or_else(stopped),
                Err(_) => stopped(),
            },
        }
    }
}

fn stopped() -> SyncResult {
    SyncResult::failed(vec!["sync runner stopped".to_string()])
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        match self.state.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn execute(&self) -> SyncResult {
        let started = Instant::now();
        let result = self.reconciler.reconcile().await;
        logging::info_kv(
            "sync finished",
            &[
                ("success", &result.success.to_string()),
                ("conflict", &result.conflict.to_string()),
                ("errors", &result.errors.len().to_string()),
                ("elapsed_ms", &started.elapsed().as_millis().to_string()),
            ],
        );
        self.events.emit(SyncEvent::SyncFinished(result.clone()));
        result
    }

    /// Leave the current run: back to idle, or start the queued follow-up.
    fn finish(self: &Arc<Self>) {
        let mut state = self.lock_state();
        let previous = std::mem::replace(&mut *state, RunState::Idle);
        let RunState::RunningWithPending { tx } = previous else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // Dropping `tx` wakes the waiters with an error.
            logging::warn("no runtime left for the queued sync run");
            return;
        };
        *state = RunState::Running;
        drop(state);

        let inner = self.clone();
        handle.spawn(async move {
            let _guard = RunGuard(inner.clone());
            let result = inner.execute().await;
            tx.send_replace(Some(result));
        });
    }
}

/// Runs `finish` however the owning run ends, including cancellation.
struct RunGuard(Arc<Inner>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.finish();
    }
}

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Counters for data moved by the file adapter.
#[derive(Default, Debug)]
pub struct TransferStats {
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    operations: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl TransferStats {
    pub fn on_send(&self, n: u64) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn on_recv(&self, n: u64) {
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv.fetch_add(n, Ordering::Relaxed);
    }

    pub fn on_operation(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_last_error(&self, err: impl ToString) {
        if let Ok(mut g) = self.last_error.lock() {
            *g = Some(err.to_string());
        }
    }

    pub fn snapshot(&self) -> TransferStatsSnapshot {
        let last_error = self
            .last_error
            .lock()
            .ok()
            .and_then(|g| g.clone())
            .unwrap_or_default();
        TransferStatsSnapshot {
            bytes_sent_total: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv_total: self.bytes_recv.load(Ordering::Relaxed),
            operations_total: self.operations.load(Ordering::Relaxed),
            last_error,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferStatsSnapshot {
    pub bytes_sent_total: u64,
    pub bytes_recv_total: u64,
    pub operations_total: u64,
    pub last_error: String,
}

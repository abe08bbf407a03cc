use anyhow::Result;
use async_trait::async_trait;

use crate::model::{FileRecord, SyncMode};

/// The pass was cancelled instead of choosing a sync mode.
#[derive(Debug)]
pub struct SyncCancelled;

impl std::fmt::Display for SyncCancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conflict resolution cancelled")
    }
}

impl std::error::Error for SyncCancelled {}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<SyncCancelled>())
}

/// Picks one mode for every record changed on both sides.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn decide_sync_mode(&self, conflicts: &[FileRecord]) -> Result<SyncMode>;
}

/// Non-interactive resolver: always the configured mode, or cancel when none is set.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedResolver(pub Option<SyncMode>);

#[async_trait]
impl ConflictResolver for FixedResolver {
    async fn decide_sync_mode(&self, conflicts: &[FileRecord]) -> Result<SyncMode> {
        match self.0 {
            Some(mode) => {
                crate::logging::info_kv(
                    "resolving conflicts",
                    &[("mode", &mode.to_string()), ("files", &conflicts.len().to_string())],
                );
                Ok(mode)
            }
            None => {
                let paths: Vec<&str> = conflicts.iter().map(|r| r.relative_path.as_str()).collect();
                crate::logging::warn(format!(
                    "unresolved conflicts, rerun with --mode push|pull: {}",
                    paths.join(", ")
                ));
                Err(SyncCancelled.into())
            }
        }
    }
}

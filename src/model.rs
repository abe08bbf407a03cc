use std::fmt;

use serde::{Deserialize, Serialize};

pub type FileId = u64;

/// Pending mutation on one side of the sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Change {
    #[default]
    No,
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChangeLocation {
    #[default]
    No,
    Local,
    Remote,
    Both,
}

impl ChangeLocation {
    pub fn derive(local: Change, remote: Change) -> Self {
        match (local, remote) {
            (Change::No, Change::No) => ChangeLocation::No,
            (Change::No, _) => ChangeLocation::Remote,
            (_, Change::No) => ChangeLocation::Local,
            _ => ChangeLocation::Both,
        }
    }
}

/// Opaque revision token. Only ever compared for equality.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Revision {
    Number(i64),
    Text(String),
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::Number(n) => write!(f, "{n}"),
            Revision::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Push,
    Pull,
}

impl std::str::FromStr for SyncMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "push" => Ok(SyncMode::Push),
            "pull" => Ok(SyncMode::Pull),
            other => anyhow::bail!("invalid sync mode {other:?}, expected push or pull"),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Push => f.write_str("push"),
            SyncMode::Pull => f.write_str("pull"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: FileId,
    pub is_folder: bool,
    pub relative_path: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub remote_id: Option<String>,
    #[serde(default)]
    pub remote_revision: Option<Revision>,
    #[serde(default)]
    pub local_revision: Option<Revision>,
    #[serde(default)]
    pub local_change: Change,
    #[serde(default)]
    pub remote_change: Change,
    #[serde(default)]
    pub change_location: ChangeLocation,
    #[serde(default)]
    pub watcher_synced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_hash: Option<String>,
}

impl FileRecord {
    pub fn new(id: FileId, relative_path: &str, is_folder: bool) -> Self {
        Self {
            id,
            is_folder,
            relative_path: normalize_rel_path(relative_path),
            url: String::new(),
            remote_id: None,
            remote_revision: None,
            local_revision: None,
            local_change: Change::No,
            remote_change: Change::No,
            change_location: ChangeLocation::No,
            watcher_synced: false,
            local_hash: None,
        }
    }

    pub fn refresh_location(&mut self) {
        self.change_location = ChangeLocation::derive(self.local_change, self.remote_change);
    }

    pub fn adopt_remote(&mut self, entry: &RemoteEntry) {
        self.remote_id = Some(entry.remote_id.clone());
        self.remote_revision = entry.remote_revision.clone();
        self.url = entry.url.clone();
    }

    /// Drop every link to the remote copy so the record is uploaded as a new file.
    pub fn detach_remote(&mut self) {
        self.remote_id = None;
        self.remote_revision = None;
        self.url.clear();
        self.local_change = Change::Create;
    }

    /// Both sides agree: clear pending changes and pin the local revision.
    pub fn settle(&mut self) {
        self.local_change = Change::No;
        self.remote_change = Change::No;
        self.change_location = ChangeLocation::No;
        self.local_revision = self.remote_revision.clone();
    }

    pub fn depth(&self) -> usize {
        path_depth(&self.relative_path)
    }
}

/// One row of the remote listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub relative_path: String,
    #[serde(default)]
    pub is_folder: bool,
    pub remote_id: String,
    #[serde(default)]
    pub remote_revision: Option<Revision>,
    #[serde(default)]
    pub url: String,
}

impl RemoteEntry {
    pub fn to_record(&self, id: FileId) -> FileRecord {
        let mut rec = FileRecord::new(id, &self.relative_path, self.is_folder);
        rec.adopt_remote(self);
        rec
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SyncResult {
    pub success: bool,
    pub conflict: bool,
    pub errors: Vec<String>,
}

impl SyncResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            conflict: false,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<String>) -> Self {
        Self {
            success: false,
            conflict: false,
            errors,
        }
    }

    pub fn unresolved_conflict() -> Self {
        Self {
            success: false,
            conflict: true,
            errors: Vec::new(),
        }
    }
}

pub fn normalize_rel_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect::<Vec<_>>()
        .join("/")
}

pub fn path_depth(rel: &str) -> usize {
    rel.split('/').filter(|p| !p.is_empty()).count()
}

pub fn parent_path(rel: &str) -> Option<&str> {
    let trimmed = rel.trim_end_matches('/');
    trimmed.rfind('/').map(|idx| &trimmed[..idx])
}

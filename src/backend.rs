use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::model::{normalize_rel_path, RemoteEntry, Revision};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub root_folder_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileOutcome {
    pub success: bool,
    #[serde(default)]
    pub log: String,
    #[serde(default)]
    pub output_url: Option<String>,
}

/// Remote file store. `parent` arguments carry the remote id of the
/// containing folder, `None` for the project root.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn validate_token(&self) -> Result<()>;

    async fn load_project_info(&self) -> Result<ProjectInfo>;

    async fn load_file_list(&self) -> Result<Vec<RemoteEntry>>;

    async fn upload(
        &self,
        relative_path: &str,
        content: Vec<u8>,
        parent: Option<&str>,
    ) -> Result<RemoteEntry>;

    /// Create a folder.
    async fn create_remote(&self, relative_path: &str, parent: Option<&str>)
        -> Result<RemoteEntry>;

    async fn download(&self, remote_id: &str, url: &str) -> Result<Vec<u8>>;

    async fn update_remote(&self, remote_id: &str, content: Vec<u8>) -> Result<RemoteEntry>;

    async fn delete_remote(&self, remote_id: &str) -> Result<()>;

    async fn compile_project(&self) -> Result<CompileOutcome>;
}

/// Pick the backend implementation named by the config. Called once per session.
pub fn connect(cfg: &Config) -> Result<Arc<dyn Backend>> {
    match cfg.backend.as_str() {
        "http" => {
            let server_url = cfg
                .server_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("server_url is required for the http backend"))?;
            let client = crate::http::ApiClient::new(
                server_url,
                &cfg.project_id,
                cfg.access_token.as_deref(),
            )?;
            Ok(Arc::new(client))
        }
        "dir" => {
            let remote_dir = cfg
                .remote_dir
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("remote_dir is required for the dir backend"))?;
            Ok(Arc::new(DirBackend::open(remote_dir, &cfg.project_id)?))
        }
        other => anyhow::bail!("unknown backend {other:?}"),
    }
}

const MANIFEST_FILE: &str = "manifest.json";
const TREE_DIR: &str = "tree";

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    next_id: u64,
    revision: i64,
    entries: BTreeMap<String, ManifestEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    path: String,
    is_folder: bool,
    revision: i64,
}

impl Manifest {
    fn find_path(&self, rel: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(_, e)| e.path == rel)
            .map(|(id, _)| id.as_str())
    }

    fn bump(&mut self) -> i64 {
        self.revision += 1;
        self.revision
    }
}

/// Remote store kept in a plain directory: file contents under `tree/`,
/// identities and revisions in `manifest.json`. Ids survive renames, so it
/// behaves like a real remote for rename detection.
#[derive(Debug)]
pub struct DirBackend {
    root: PathBuf,
    project_id: String,
    lock: Mutex<()>,
}

impl DirBackend {
    pub fn open(root: &Path, project_id: &str) -> Result<Self> {
        fs::create_dir_all(root.join(TREE_DIR))
            .with_context(|| format!("create remote store {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            project_id: project_id.to_string(),
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Move an entry (and everything below it for folders) keeping remote ids.
    pub fn rename_path(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize_rel_path(from);
        let to = normalize_rel_path(to);
        self.with_manifest(|manifest| {
            if manifest.find_path(&from).is_none() {
                anyhow::bail!("rename source not found: {from}");
            }
            if manifest.find_path(&to).is_some() {
                anyhow::bail!("rename target already exists: {to}");
            }
            let prefix = format!("{from}/");
            for entry in manifest.entries.values_mut() {
                if entry.path == from {
                    entry.path = to.clone();
                } else if let Some(rest) = entry.path.strip_prefix(&prefix) {
                    entry.path = format!("{to}/{rest}");
                }
            }
            let target = self.content_path(&to);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(self.content_path(&from), &target)
                .with_context(|| format!("rename {from} -> {to}"))?;
            Ok(())
        })
    }

    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    fn content_path(&self, rel: &str) -> PathBuf {
        let mut p = self.root.join(TREE_DIR);
        for part in rel.split('/').filter(|s| !s.is_empty()) {
            p.push(part);
        }
        p
    }

    fn url_for(&self, remote_id: &str) -> String {
        format!("dir://{}/{remote_id}", self.project_id)
    }

    fn entry(&self, remote_id: &str, e: &ManifestEntry) -> RemoteEntry {
        RemoteEntry {
            relative_path: e.path.clone(),
            is_folder: e.is_folder,
            remote_id: remote_id.to_string(),
            remote_revision: Some(Revision::Number(e.revision)),
            url: self.url_for(remote_id),
        }
    }

    /// Load, mutate and store the manifest under the store lock. The
    /// manifest is re-read every time so edits by another handle on the same
    /// directory are picked up.
    fn with_manifest<T>(&self, f: impl FnOnce(&mut Manifest) -> Result<T>) -> Result<T> {
        let _guard = match self.lock.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let path = self.manifest_path();
        let mut manifest: Manifest = match fs::read(&path) {
            Ok(raw) => serde_json::from_slice(&raw).context("decode remote manifest")?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Manifest {
                next_id: 1,
                ..Manifest::default()
            },
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        let out = f(&mut manifest)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&manifest)?)
            .with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("rename {}", path.display()))?;
        Ok(out)
    }

    fn check_parent(manifest: &Manifest, rel: &str, parent: Option<&str>) -> Result<()> {
        let expected = crate::model::parent_path(rel);
        match (expected, parent) {
            (None, None) => Ok(()),
            (Some(dir), Some(pid)) => match manifest.entries.get(pid) {
                Some(e) if e.is_folder && e.path == dir => Ok(()),
                _ => anyhow::bail!("parent folder {dir} does not match remote id {pid}"),
            },
            (Some(dir), None) => anyhow::bail!("parent folder {dir} does not exist remotely"),
            (None, Some(pid)) => anyhow::bail!("unexpected parent {pid} for top-level {rel}"),
        }
    }

    fn insert_entry(
        &self,
        manifest: &mut Manifest,
        rel: &str,
        is_folder: bool,
        parent: Option<&str>,
    ) -> Result<(String, ManifestEntry)> {
        if manifest.find_path(rel).is_some() {
            anyhow::bail!("{rel} already exists remotely");
        }
        Self::check_parent(manifest, rel, parent)?;
        let id = format!("{}-{}", self.project_id, manifest.next_id);
        manifest.next_id += 1;
        let entry = ManifestEntry {
            path: rel.to_string(),
            is_folder,
            revision: manifest.bump(),
        };
        manifest.entries.insert(id.clone(), entry.clone());
        Ok((id, entry))
    }
}

#[async_trait]
impl Backend for DirBackend {
    fn kind(&self) -> &'static str {
        "dir"
    }

    async fn validate_token(&self) -> Result<()> {
        if !self.root.is_dir() {
            anyhow::bail!("remote store {} is not reachable", self.root.display());
        }
        Ok(())
    }

    async fn load_project_info(&self) -> Result<ProjectInfo> {
        self.validate_token().await?;
        let name = self
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.project_id.clone());
        Ok(ProjectInfo {
            id: self.project_id.clone(),
            name,
            root_folder_id: None,
        })
    }

    async fn load_file_list(&self) -> Result<Vec<RemoteEntry>> {
        self.validate_token().await?;
        self.with_manifest(|manifest| {
            Ok(manifest
                .entries
                .iter()
                .map(|(id, e)| self.entry(id, e))
                .collect())
        })
    }

    async fn upload(
        &self,
        relative_path: &str,
        content: Vec<u8>,
        parent: Option<&str>,
    ) -> Result<RemoteEntry> {
        let rel = normalize_rel_path(relative_path);
        self.with_manifest(|manifest| {
            let (id, entry) = self.insert_entry(manifest, &rel, false, parent)?;
            let target = self.content_path(&rel);
            if let Some(dir) = target.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&target, &content).with_context(|| format!("write {}", target.display()))?;
            Ok(self.entry(&id, &entry))
        })
    }

    async fn create_remote(
        &self,
        relative_path: &str,
        parent: Option<&str>,
    ) -> Result<RemoteEntry> {
        let rel = normalize_rel_path(relative_path);
        self.with_manifest(|manifest| {
            let (id, entry) = self.insert_entry(manifest, &rel, true, parent)?;
            let target = self.content_path(&rel);
            fs::create_dir_all(&target).with_context(|| format!("mkdir {}", target.display()))?;
            Ok(self.entry(&id, &entry))
        })
    }

    async fn download(&self, remote_id: &str, _url: &str) -> Result<Vec<u8>> {
        let path = self.with_manifest(|manifest| match manifest.entries.get(remote_id) {
            Some(e) if !e.is_folder => Ok(e.path.clone()),
            Some(_) => anyhow::bail!("{remote_id} is a folder"),
            None => anyhow::bail!("remote file {remote_id} not found"),
        })?;
        let target = self.content_path(&path);
        fs::read(&target).with_context(|| format!("read {}", target.display()))
    }

    async fn update_remote(&self, remote_id: &str, content: Vec<u8>) -> Result<RemoteEntry> {
        self.with_manifest(|manifest| {
            let revision = manifest.bump();
            let entry = match manifest.entries.get_mut(remote_id) {
                Some(e) if !e.is_folder => {
                    e.revision = revision;
                    e.clone()
                }
                Some(_) => anyhow::bail!("{remote_id} is a folder"),
                None => anyhow::bail!("remote file {remote_id} not found"),
            };
            let target = self.content_path(&entry.path);
            fs::write(&target, &content).with_context(|| format!("write {}", target.display()))?;
            Ok(self.entry(remote_id, &entry))
        })
    }

    async fn delete_remote(&self, remote_id: &str) -> Result<()> {
        self.with_manifest(|manifest| {
            let entry = manifest
                .entries
                .remove(remote_id)
                .ok_or_else(|| anyhow::anyhow!("remote file {remote_id} not found"))?;
            let prefix = format!("{}/", entry.path);
            manifest.entries.retain(|_, e| !e.path.starts_with(&prefix));
            let target = self.content_path(&entry.path);
            let res = if entry.is_folder {
                fs::remove_dir_all(&target)
            } else {
                fs::remove_file(&target)
            };
            match res {
                Ok(()) => Ok(()),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(err) => Err(err).with_context(|| format!("remove {}", target.display())),
            }
        })
    }

    async fn compile_project(&self) -> Result<CompileOutcome> {
        let files = self.load_file_list().await?;
        let mut listing: Vec<String> = files
            .iter()
            .filter(|e| !e.is_folder)
            .map(|e| {
                let rev = e
                    .remote_revision
                    .as_ref()
                    .map(|r| r.to_string())
                    .unwrap_or_default();
                format!("{} {rev}", e.relative_path)
            })
            .collect();
        listing.sort();
        let digest = md5::compute(listing.join("\n").as_bytes());
        Ok(CompileOutcome {
            success: true,
            log: format!("{} files, digest {:x}", listing.len(), digest),
            output_url: None,
        })
    }
}

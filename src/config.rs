use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::model::SyncMode;

pub const ACCESS_TOKEN_ENV: &str = "TREESYNC_ACCESS_TOKEN";
pub const STATE_DIR_NAME: &str = ".treesync";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub project_id: String,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub server_url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub remote_dir: Option<PathBuf>,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default)]
    pub ignore: Vec<String>,
    #[serde(default)]
    pub conflict_mode: Option<SyncMode>,
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

fn default_backend() -> String {
    "http".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = serde_json::from_str(&data).context("parse config json")?;
        cfg.config_path = Some(path.to_path_buf());
        if let Ok(token) = std::env::var(ACCESS_TOKEN_ENV) {
            if !token.trim().is_empty() {
                cfg.access_token = Some(token.trim().to_string());
            }
        }
        cfg.normalize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Directory holding snapshots, logs and the workspace lock.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.project_dir.join(STATE_DIR_NAME))
    }

    fn normalize(&mut self) -> Result<()> {
        self.backend = self.backend.trim().to_lowercase();
        self.project_id = self.project_id.trim().to_string();
        if let Some(base) = self.config_path.as_deref().and_then(Path::parent) {
            self.project_dir = absolutize(base, &self.project_dir);
            self.remote_dir = self.remote_dir.as_deref().map(|d| absolutize(base, d));
            self.state_dir = self.state_dir.as_deref().map(|d| absolutize(base, d));
        }
        if let Some(url) = &self.server_url {
            self.server_url = Some(url.trim_end_matches('/').to_string());
        }
        self.ignore = self
            .ignore
            .iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        validate_project_id(&self.project_id)?;
        match self.backend.as_str() {
            "http" => {
                let url = self
                    .server_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("server_url is required for the http backend"))?;
                validate_url(url).context("server_url")?;
            }
            "dir" => {
                if self.remote_dir.is_none() {
                    anyhow::bail!("remote_dir is required for the dir backend");
                }
            }
            other => anyhow::bail!("unknown backend {other:?}, expected http or dir"),
        }
        Ok(())
    }
}

fn absolutize(base: &Path, p: &Path) -> PathBuf {
    let joined = if p.is_relative() {
        base.join(p)
    } else {
        p.to_path_buf()
    };
    std::fs::canonicalize(&joined).unwrap_or(joined)
}

fn validate_url(raw: &str) -> Result<()> {
    let url = Url::parse(raw)?;
    if url.scheme() != "http" && url.scheme() != "https" {
        anyhow::bail!("url must be http or https");
    }
    Ok(())
}

fn validate_project_id(id: &str) -> Result<()> {
    static PATTERN: once_cell::sync::Lazy<Regex> = once_cell::sync::Lazy::new(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("project id pattern")
    });
    if PATTERN.is_match(id) {
        Ok(())
    } else {
        anyhow::bail!("invalid project_id: {id:?}")
    }
}

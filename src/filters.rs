use std::{
    fs,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use ignore::gitignore::{Gitignore, GitignoreBuilder};

pub const USER_IGNORE_FILE: &str = ".treesyncignore";

const SYSTEM_IGNORE_LINES: &[&str] = &[
    // sync engine state
    ".treesync/",
    ".treesyncignore",
    "**/.*.tmp-*", // download temp files
    // editors
    ".vscode",
    ".idea",
    "*.swp",
    "*~",
    // version control
    ".git",
    // OS-specific
    ".DS_Store",
    "Thumbs.db",
];

/// One source of ignore patterns, in the order it was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternSource {
    pub origin: String,
    pub lines: Vec<String>,
}

/// Ignore matcher for a project. Built once per session from the system
/// defaults, the user's ignore file and the config's extra patterns, in that
/// order, then passed by value to everything that needs it.
#[derive(Clone, Debug)]
pub struct SyncIgnoreList {
    base_dir: PathBuf,
    sources: Vec<PatternSource>,
    ignore: Gitignore,
}

impl SyncIgnoreList {
    pub fn load(base_dir: &Path, extra: &[String]) -> Result<Self> {
        let mut sources = vec![PatternSource {
            origin: "system".to_string(),
            lines: SYSTEM_IGNORE_LINES.iter().map(|l| l.to_string()).collect(),
        }];

        let ignore_path = base_dir.join(USER_IGNORE_FILE);
        if ignore_path.exists() {
            sources.push(PatternSource {
                origin: ignore_path.display().to_string(),
                lines: read_ignore_file(&ignore_path)?,
            });
        }
        if !extra.is_empty() {
            sources.push(PatternSource {
                origin: "config".to_string(),
                lines: extra.to_vec(),
            });
        }
        Self::from_sources(base_dir, sources)
    }

    pub fn from_sources(base_dir: &Path, sources: Vec<PatternSource>) -> Result<Self> {
        let mut builder = GitignoreBuilder::new(base_dir);
        for source in &sources {
            for line in &source.lines {
                builder
                    .add_line(None, line)
                    .with_context(|| format!("add {} ignore line: {line}", source.origin))?;
            }
        }
        let ignore = builder.build().context("build ignore matcher")?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            sources,
            ignore,
        })
    }

    pub fn sources(&self) -> &[PatternSource] {
        &self.sources
    }

    pub fn should_ignore_abs(&self, abs_path: &Path, is_dir: bool) -> bool {
        let rel = abs_path.strip_prefix(&self.base_dir).unwrap_or(abs_path);
        self.should_ignore_rel(rel, is_dir)
    }

    pub fn should_ignore_rel(&self, rel_path: &Path, is_dir: bool) -> bool {
        if rel_path.as_os_str().is_empty() {
            return false;
        }
        self.ignore
            .matched_path_or_any_parents(rel_path, is_dir)
            .is_ignore()
    }

    pub fn should_ignore(&self, relative_path: &str, is_dir: bool) -> bool {
        self.should_ignore_rel(Path::new(relative_path), is_dir)
    }
}

fn read_ignore_file(path: &Path) -> Result<Vec<String>> {
    let file =
        fs::File::open(path).with_context(|| format!("open ignore file {}", path.display()))?;
    let mut out = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.contains('\0') {
            continue;
        }
        out.push(trimmed.to_string());
    }
    Ok(out)
}

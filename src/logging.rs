use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use chrono::SecondsFormat;

static SINK: OnceLock<LogSink> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
        })
    }
}

/// Install the process-wide log file. The first session wins; later calls
/// keep the existing sink.
pub fn init_log_file(path: &Path, mirror_to_stdout: bool) -> Result<()> {
    if SINK.get().is_none() {
        let _ = SINK.set(LogSink::create(path, mirror_to_stdout)?);
    }
    Ok(())
}

pub fn log_file_path(state_dir: &Path) -> PathBuf {
    state_dir.join("logs").join("treesync.log")
}

pub fn info(msg: impl AsRef<str>) {
    emit(Level::Info, msg.as_ref(), &[]);
}

pub fn warn(msg: impl AsRef<str>) {
    emit(Level::Warn, msg.as_ref(), &[]);
}

pub fn error(msg: impl AsRef<str>) {
    emit(Level::Error, msg.as_ref(), &[]);
}

pub fn info_kv(msg: &str, fields: &[(&str, &str)]) {
    emit(Level::Info, msg, fields);
}

pub fn warn_kv(msg: &str, fields: &[(&str, &str)]) {
    emit(Level::Warn, msg, fields);
}

fn emit(level: Level, msg: &str, fields: &[(&str, &str)]) {
    if let Some(sink) = SINK.get() {
        sink.write(level, msg, fields);
    }
}

struct LogSink {
    file: Mutex<File>,
    mirror_to_stdout: bool,
}

impl LogSink {
    // Truncated at session start.
    fn create(path: &Path, mirror_to_stdout: bool) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
            mirror_to_stdout,
        })
    }

    fn write(&self, level: Level, msg: &str, fields: &[(&str, &str)]) {
        let ts = chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = file_line(&ts, level, msg, fields);
        if let Ok(mut f) = self.file.lock() {
            let _ = f.write_all(line.as_bytes());
            let _ = f.flush();
        }
        if self.mirror_to_stdout {
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(console_line(&ts, level, msg, fields).as_bytes());
            let _ = out.flush();
        }
    }
}

// time=... level=... msg="..." key=value
fn file_line(ts: &str, level: Level, msg: &str, fields: &[(&str, &str)]) -> String {
    let mut line = format!("time={ts} level={level} msg={}", quoted(msg));
    for (key, value) in fields {
        line.push(' ');
        line.push_str(key);
        line.push('=');
        if needs_quotes(value) {
            line.push_str(&quoted(value));
        } else {
            line.push_str(value);
        }
    }
    line.push('\n');
    line
}

fn console_line(ts: &str, level: Level, msg: &str, fields: &[(&str, &str)]) -> String {
    let mut line = format!("{ts} {level:<5} {msg}");
    for (key, value) in fields {
        line.push_str(&format!(" {key}={value}"));
    }
    line.push('\n');
    line
}

fn needs_quotes(value: &str) -> bool {
    value.is_empty() || value.contains(|c: char| c.is_whitespace() || c == '"' || c == '=')
}

fn quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' | '"' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

use std::fs;
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

const LOCK_FILE: &str = "treesync.lock";
const STATE_SUBDIRS: [&str; 2] = ["snapshots", "logs"];

#[derive(Debug)]
pub struct StateLockedError {
    pub holder_pid: Option<u32>,
}

impl std::fmt::Display for StateLockedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.holder_pid {
            Some(pid) => write!(f, "project state is locked by treesync process {pid}"),
            None => write!(f, "project state is locked by another treesync process"),
        }
    }
}

impl std::error::Error for StateLockedError {}

pub fn ensure_state_layout(state_dir: &Path) -> Result<()> {
    for sub in STATE_SUBDIRS {
        let dir = state_dir.join(sub);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    }
    Ok(())
}

/// Exclusive hold on a state directory for the life of a session. The lock
/// file carries the holder's pid for the error shown to a second process.
#[derive(Debug)]
pub struct StateLock {
    file: fs::File,
    path: PathBuf,
}

impl StateLock {
    pub fn acquire(state_dir: &Path) -> Result<Self> {
        fs::create_dir_all(state_dir)
            .with_context(|| format!("create {}", state_dir.display()))?;
        let path = state_dir.join(LOCK_FILE);
        let mut file = open_lock_file(&path)?;
        if !sys::try_exclusive(&file).context("lock state dir")? {
            return Err(StateLockedError {
                holder_pid: read_pid(&mut file),
            }
            .into());
        }

        file.set_len(0).context("truncate lock file")?;
        write!(file, "{}", std::process::id()).context("write lock file")?;
        file.flush().context("flush lock file")?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
        sys::release(&self.file);
    }
}

fn read_pid(file: &mut fs::File) -> Option<u32> {
    let mut raw = String::new();
    file.rewind().ok()?;
    file.read_to_string(&mut raw).ok()?;
    raw.trim().parse().ok()
}

pub fn is_locked(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<StateLockedError>())
}

#[cfg(unix)]
fn open_lock_file(path: &Path) -> Result<fs::File> {
    fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open {}", path.display()))
}

// No flock here: creating the file is the lock.
#[cfg(windows)]
fn open_lock_file(path: &Path) -> Result<fs::File> {
    match fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(f) => Ok(f),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            let holder_pid = fs::read_to_string(path)
                .ok()
                .and_then(|raw| raw.trim().parse().ok());
            Err(StateLockedError { holder_pid }.into())
        }
        Err(e) => Err(e).with_context(|| format!("open {}", path.display())),
    }
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::os::fd::AsRawFd;

    extern "C" {
        fn flock(fd: i32, operation: i32) -> i32;
    }

    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    const LOCK_UN: i32 = 8;
    // EWOULDBLOCK: 11 on Linux, 35 on macOS.
    const WOULD_BLOCK: [i32; 2] = [11, 35];

    /// `Ok(false)` when another process holds the lock.
    pub fn try_exclusive(file: &File) -> std::io::Result<bool> {
        if unsafe { flock(file.as_raw_fd(), LOCK_EX | LOCK_NB) } == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        let busy = err.kind() == std::io::ErrorKind::WouldBlock
            || err.raw_os_error().is_some_and(|code| WOULD_BLOCK.contains(&code));
        if busy {
            Ok(false)
        } else {
            Err(err)
        }
    }

    pub fn release(file: &File) {
        unsafe {
            flock(file.as_raw_fd(), LOCK_UN);
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;

    pub fn try_exclusive(_file: &File) -> std::io::Result<bool> {
        Ok(true)
    }

    pub fn release(_file: &File) {}
}

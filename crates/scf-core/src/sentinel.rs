use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};

/// Restart coordination file shared by the endpoint and the watchdog: a
/// clean endpoint exit with this file present means "respawn me".
pub const SENTINEL_FILE: &str = ".scf-restart";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartSentinel {
    pub requested_at: String,
    pub reason: String,
}

pub fn sentinel_path(dir: &Path) -> PathBuf {
    dir.join(SENTINEL_FILE)
}

pub fn write_sentinel(dir: &Path, reason: &str) -> io::Result<PathBuf> {
    let sentinel = RestartSentinel {
        requested_at: Utc::now().to_rfc3339(),
        reason: reason.to_string(),
    };
    let path = sentinel_path(dir);
    let contents = serde_json::to_string(&sentinel)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    std::fs::write(&path, contents)?;
    Ok(path)
}

pub fn read_sentinel(dir: &Path) -> Option<RestartSentinel> {
    let contents = std::fs::read_to_string(sentinel_path(dir)).ok()?;
    serde_json::from_str(&contents).ok()
}

pub fn remove_sentinel(dir: &Path) -> io::Result<()> {
    let path = sentinel_path(dir);
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

use crate::config::write_atomic_text_file;
use crate::error::Result;
use crate::session::{ActiveSession, GitBaseline, Location};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Run record kept on the remote host so a later session can reconnect to a
/// container it did not start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub container: String,
    pub repo: String,
    pub user: String,
    pub password: String,
    pub port: u16,
    #[serde(rename = "useVolumes")]
    pub use_volumes: bool,
    pub timestamp: String,
}

impl RunMetadata {
    pub fn new(
        container: &str,
        repo: &str,
        user: &str,
        password: &str,
        port: u16,
        use_volumes: bool,
    ) -> Self {
        Self {
            container: container.to_string(),
            repo: repo.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            port,
            use_volumes,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

pub fn remote_metadata_path(metadata_dir: &str, container: &str) -> String {
    format!("{}/{}.json", metadata_dir.trim_end_matches('/'), container)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub container: String,
    pub repo: String,
    pub location: Location,
    pub active: ActiveSession,
    pub use_volumes: bool,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub synthpop_dir: Option<String>,
    #[serde(default)]
    pub git_baseline: Option<GitBaseline>,
    pub started_at: String,
}

pub fn session_record_path(state_dir: &Path, container: &str) -> PathBuf {
    state_dir.join(format!("{container}.json"))
}

pub fn write_session_record(state_dir: &Path, record: &SessionRecord) -> Result<()> {
    fs::create_dir_all(state_dir)?;
    let path = session_record_path(state_dir, &record.container);
    let body = serde_json::to_string_pretty(record)?;
    write_atomic_text_file(&path, &format!("{body}\n"), Some(0o600))
}

/// Unparseable records are treated as absent; the live container is the
/// source of truth.
pub fn load_session_record(state_dir: &Path, container: &str) -> Option<SessionRecord> {
    let path = session_record_path(state_dir, container);
    if !path.exists() {
        return None;
    }
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "session record unreadable");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(record) => Some(record),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "session record is corrupt");
            None
        }
    }
}

pub fn clear_session_record(state_dir: &Path, container: &str) -> Result<()> {
    let path = session_record_path(state_dir, container);
    if path.exists() {
        fs::remove_file(path)?;
    }
    Ok(())
}

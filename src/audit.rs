//! Audit trail of firewall changes
//!
//! Every privileged operation appends one JSON object per line to
//! `audit.log` in the state directory. Lines are written with a single
//! append, so a crash never leaves half a record behind.
//!
//! ```json
//! {"timestamp":"2026-01-05T10:00:00Z","euid":0,"event":"apply","ports":["22/tcp"],"success":true,"error":null}
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

/// What happened, with the data specific to that kind of change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditAction {
    Apply { ports: Vec<String> },
    Reset,
    Snapshot { path: PathBuf, sha256: String },
    Restore { path: PathBuf },
    Persist { backend: Option<String> },
}

/// One line of the audit log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Effective uid of the process that made the change
    pub euid: u32,
    #[serde(flatten)]
    pub action: AuditAction,
    pub success: bool,
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn now(action: AuditAction, success: bool, error: Option<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            euid: nix::unistd::geteuid().as_raw(),
            action,
            success,
            error,
        }
    }
}

/// Append-only JSON-lines file
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    /// The log in the XDG state directory, if one can be resolved
    pub fn in_state_dir() -> Option<Self> {
        crate::utils::get_state_dir().map(|dir| Self::at(dir.join("audit.log")))
    }

    pub fn at(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends `event` as one line.
    pub async fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_all().await
    }
}

/// Records an action in the state-directory log. Failures only warn.
pub async fn record(action: AuditAction, success: bool, error: Option<String>) {
    let Some(log) = AuditLog::in_state_dir() else {
        return;
    };

    if let Err(e) = log.append(&AuditEvent::now(action, success, error)).await {
        warn!("Failed to write audit log {:?}: {e}", log.path());
    }
}

pub async fn log_apply(ports: &[String], success: bool, error: Option<String>) {
    let action = AuditAction::Apply {
        ports: ports.to_vec(),
    };
    record(action, success, error).await;
}

pub async fn log_reset(success: bool, error: Option<String>) {
    record(AuditAction::Reset, success, error).await;
}

/// Records the pre-change backup; only successful backups are logged.
pub async fn log_snapshot(path: &Path, checksum: &str) {
    let action = AuditAction::Snapshot {
        path: path.to_path_buf(),
        sha256: checksum.to_string(),
    };
    record(action, true, None).await;
}

pub async fn log_restore(path: &Path, success: bool, error: Option<String>) {
    let action = AuditAction::Restore {
        path: path.to_path_buf(),
    };
    record(action, success, error).await;
}

pub async fn log_persist(backend: Option<String>, success: bool, error: Option<String>) {
    record(AuditAction::Persist { backend }, success, error).await;
}

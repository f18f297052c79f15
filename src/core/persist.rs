//! Boot persistence for the applied ruleset
//!
//! Distributions disagree on how iptables rules survive a reboot. portwall
//! probes for a mechanism in a fixed priority order:
//!
//! 1. [`PersistenceBackend::HelperTool`]: `netfilter-persistent save`
//! 2. [`PersistenceBackend::StateFile`]: write `iptables-save` output to
//!    `/etc/iptables/rules.v4`
//! 3. [`PersistenceBackend::ServiceManager`]: `service iptables save`
//!
//! Persistence is best-effort. When nothing is found, or the chosen backend
//! fails, the applied rules stay live until the next reboot and the caller
//! reports the ruleset as volatile.

use crate::core::error::Error;
use crate::core::filter::PacketFilter;
use crate::elevation::{Program, binary_exists, create_command};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tracing::{info, warn};

/// Directory whose presence enables the state-file backend
pub const IPTABLES_STATE_DIR: &str = "/etc/iptables";

/// Versioned save file read at boot by iptables-persistent
pub const IPTABLES_STATE_FILE: &str = "/etc/iptables/rules.v4";

/// Directory whose presence marks a RHEL-style `service iptables save` setup
pub const SYSCONFIG_DIR: &str = "/etc/sysconfig";

/// Errors from the persistence step. Never fatal to an apply.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error(
        "no persistence mechanism found (tried netfilter-persistent, /etc/iptables/rules.v4, service iptables save); rules will revert on reboot"
    )]
    Unavailable,

    #[error("persisting via {backend} failed: {source}")]
    Failed {
        backend: PersistenceBackend,
        #[source]
        source: Box<Error>,
    },
}

/// A mechanism that makes the current ruleset survive a reboot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceBackend {
    /// `netfilter-persistent save`
    HelperTool,
    /// Direct write of `iptables-save` output to a file read at boot
    StateFile { path: PathBuf },
    /// The init system's `service iptables save`
    ServiceManager,
}

impl fmt::Display for PersistenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceBackend::HelperTool => write!(f, "netfilter-persistent save"),
            PersistenceBackend::StateFile { path } => write!(f, "{}", path.display()),
            PersistenceBackend::ServiceManager => write!(f, "service iptables save"),
        }
    }
}

/// Host capabilities persistence detection depends on
pub trait Probe {
    fn has_binary(&self, name: &str) -> bool;
    fn has_dir(&self, path: &Path) -> bool;
}

/// Probes the real host
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProbe;

impl Probe for HostProbe {
    fn has_binary(&self, name: &str) -> bool {
        binary_exists(name)
    }

    fn has_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

impl PersistenceBackend {
    /// Picks the first available backend in priority order.
    pub fn detect(probe: &impl Probe) -> Option<Self> {
        if probe.has_binary(&Program::NetfilterPersistent.binary()) {
            return Some(PersistenceBackend::HelperTool);
        }

        if probe.has_dir(Path::new(IPTABLES_STATE_DIR)) {
            return Some(PersistenceBackend::StateFile {
                path: PathBuf::from(IPTABLES_STATE_FILE),
            });
        }

        if probe.has_binary(&Program::Service.binary()) && probe.has_dir(Path::new(SYSCONFIG_DIR))
        {
            return Some(PersistenceBackend::ServiceManager);
        }

        None
    }

    /// Saves the current ruleset through this backend.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the helper exits non-zero or the state
    /// file cannot be written.
    pub async fn save<F: PacketFilter>(&self, filter: &mut F) -> crate::Result<()> {
        match self {
            PersistenceBackend::HelperTool => {
                run_save_command(Program::NetfilterPersistent, &["save"]).await
            }
            PersistenceBackend::StateFile { path } => {
                // The boot loader restores every table, not just filter
                let rules = filter.save_all().await?;
                write_state_file(path, &rules)
            }
            PersistenceBackend::ServiceManager => {
                run_save_command(Program::Service, &["iptables", "save"]).await
            }
        }
    }
}

async fn run_save_command(program: Program, args: &[&str]) -> crate::Result<()> {
    let command_line = format!("{} {}", program.binary(), args.join(" "));
    info!("Persisting rules via {command_line}");

    let output = create_command(program, args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::OsCall {
            command: command_line.clone(),
            message: e.to_string(),
            stderr: None,
            exit_code: None,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(Error::OsCall {
            command: command_line,
            message: stderr.clone(),
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }
}

/// Atomically replaces the state file: temp file in the same directory, then rename.
fn write_state_file(path: &Path, rules: &str) -> crate::Result<()> {
    use std::io::Write;

    let dir = path
        .parent()
        .ok_or_else(|| Error::Internal(format!("{} has no parent directory", path.display())))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(rules.as_bytes())?;
    tmp.as_file().sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        // Boot-time loaders read this as root; 0644 matches iptables-persistent
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))?;
    }

    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    info!("Rules written to {:?}", path);
    Ok(())
}

/// Makes the current ruleset survive a reboot, if the host supports it.
///
/// # Errors
///
/// - `PersistError::Unavailable` when no mechanism is found
/// - `PersistError::Failed` when the detected mechanism fails
///
/// Callers downgrade both to a warning.
pub async fn persist<F: PacketFilter>(
    filter: &mut F,
    probe: &impl Probe,
) -> Result<PersistenceBackend, PersistError> {
    let Some(backend) = PersistenceBackend::detect(probe) else {
        warn!("No persistence mechanism available");
        return Err(PersistError::Unavailable);
    };

    info!("Using persistence backend: {backend}");
    match backend.save(filter).await {
        Ok(()) => Ok(backend),
        Err(e) => {
            warn!("Persistence via {backend} failed: {e}");
            Err(PersistError::Failed {
                backend,
                source: Box::new(e),
            })
        }
    }
}

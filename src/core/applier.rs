//! Rule application
//!
//! [`RuleApplier`] owns a [`PacketFilter`] and drives it through one of the
//! terminal states of an invocation:
//!
//! - `RESET_STATE`: all policies `ACCEPT`, no rules, no custom chains
//! - `PREVIEW`: nothing touched
//! - `BACKUP -> APPLY_DENY_DEFAULT -> ALLOW_CORE -> ALLOW_LISTED_PORTS`,
//!   followed by optional persistence
//! - `RESTORED`: a saved snapshot fed back through `iptables-restore`
//!
//! Any failing call aborts the sequence on the spot. Nothing is rolled back;
//! the pre-change backup is the recovery path.

use crate::core::error::Result;
use crate::core::filter::PacketFilter;
use crate::core::firewall::{Chain, FirewallPolicy, PolicyStep, PortSpec, Protocol, Target};
use crate::core::memory::MemoryFilter;
use crate::core::snapshot::{self, SnapshotInfo};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Where pre-change snapshots go
#[derive(Debug, Clone)]
pub struct BackupSettings {
    /// Fixed backup path overwritten on every apply
    pub path: PathBuf,
    /// Directory for timestamped copies, if any
    pub archive_dir: Option<PathBuf>,
    pub retention: usize,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from(snapshot::DEFAULT_BACKUP_PATH),
            archive_dir: None,
            retention: snapshot::DEFAULT_RETENTION,
        }
    }
}

/// Outcome of a successful apply
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub backup: SnapshotInfo,
    pub archived: Option<PathBuf>,
    pub rules_added: usize,
}

/// Result of a dry run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub ports: Vec<PortSpec>,
    /// End state in `iptables-save` format
    pub rules_text: String,
}

/// Applies firewall policies through an injected packet filter
pub struct RuleApplier<F: PacketFilter> {
    filter: F,
    backup: BackupSettings,
    last_backup: Option<SnapshotInfo>,
}

impl<F: PacketFilter> RuleApplier<F> {
    pub fn new(filter: F, backup: BackupSettings) -> Self {
        Self {
            filter,
            backup,
            last_backup: None,
        }
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    pub fn filter_mut(&mut self) -> &mut F {
        &mut self.filter
    }

    /// Backup taken by the most recent apply, even if that apply then failed
    pub fn last_backup(&self) -> Option<&SnapshotInfo> {
        self.last_backup.as_ref()
    }

    /// Snapshots the current table, then applies `policy`.
    ///
    /// # Errors
    ///
    /// Returns the first failing call. Steps after it are not attempted and
    /// steps before it stay in effect.
    pub async fn apply_deny_by_default(&mut self, policy: &FirewallPolicy) -> Result<ApplyReport> {
        let (backup, archived) = self.take_backup().await?;

        info!(
            "Applying deny-by-default policy with {} listed port(s)",
            policy.ports.len()
        );
        apply_steps(&mut self.filter, policy).await?;
        info!("Policy applied");

        Ok(ApplyReport {
            backup,
            archived,
            rules_added: policy.rule_count(),
        })
    }

    async fn take_backup(&mut self) -> Result<(SnapshotInfo, Option<PathBuf>)> {
        let current = self.filter.save().await?;
        let backup = snapshot::write_backup(&current, &self.backup.path)?;
        self.last_backup = Some(backup.clone());

        let archived = match &self.backup.archive_dir {
            Some(dir) => match snapshot::archive_snapshot(&current, dir, self.backup.retention) {
                Ok(path) => Some(path),
                Err(e) => {
                    // Fixed backup is already on disk
                    warn!("Failed to archive snapshot in {:?}: {e}", dir);
                    None
                }
            },
            None => None,
        };

        Ok((backup, archived))
    }

    /// Opens the firewall completely.
    ///
    /// Policies switch to `ACCEPT` before the flush.
    pub async fn reset(&mut self) -> Result<()> {
        info!("Resetting firewall to fully open state");
        for chain in [Chain::Input, Chain::Forward, Chain::Output] {
            self.filter.set_default_policy(chain, Target::Accept).await?;
        }
        self.filter.flush_all_chains().await?;
        info!("Firewall reset");
        Ok(())
    }

    /// Previews `policy` without touching the owned filter.
    #[allow(clippy::unused_self)]
    pub async fn dry_run(&self, policy: &FirewallPolicy) -> Result<Preview> {
        preview(policy).await
    }

    /// Replaces the table with the snapshot stored at `path`.
    ///
    /// The file must be a valid filter table that only the current user can
    /// write, and must match its checksum sidecar when one exists.
    pub async fn restore(&mut self, path: &Path) -> Result<()> {
        let text = snapshot::load_verified_snapshot(path)?;
        info!(
            "Restoring snapshot {:?} (sha256 {})",
            path,
            snapshot::compute_checksum(&text)
        );
        self.filter.restore(&text).await
    }
}

/// Issues the policy's steps one by one, stopping at the first failure.
pub async fn apply_steps<F: PacketFilter>(filter: &mut F, policy: &FirewallPolicy) -> Result<()> {
    for step in policy.steps() {
        debug!("Step: {step:?}");
        match step {
            PolicyStep::Flush => filter.flush().await?,
            PolicyStep::SetPolicy(chain, target) => {
                filter.set_default_policy(chain, target).await?;
            }
            PolicyStep::Accept(rule) => filter.add_accept_rule(rule).await?,
        }
    }
    Ok(())
}

/// Builds a dry-run preview by replaying `policy` against a fresh in-memory table.
pub async fn preview(policy: &FirewallPolicy) -> Result<Preview> {
    let mut scratch = MemoryFilter::new();
    apply_steps(&mut scratch, policy).await?;
    let rules_text = scratch.save().await?;

    Ok(Preview {
        ports: policy.ports.clone(),
        rules_text,
    })
}

/// Returns the SSH control-channel port when the policy would cut it off.
///
/// `ssh_connection` is the value of `SSH_CONNECTION`, if set. Only the
/// situation is reported; the policy is applied as requested either way.
pub fn control_channel_port(policy: &FirewallPolicy, ssh_connection: Option<&str>) -> Option<PortSpec> {
    let port = crate::validators::ssh_server_port(ssh_connection?)?;
    if policy.allows_tcp(port) {
        None
    } else {
        Some(PortSpec::new(port, Protocol::Tcp))
    }
}

//! Packet filter control surface
//!
//! [`PacketFilter`] is the capability the applier drives. [`IptablesFilter`]
//! implements it against the live kernel by running `iptables`,
//! `iptables-save` and `iptables-restore`. Tests and dry runs use
//! [`crate::core::memory::MemoryFilter`] instead.

use crate::core::error::{Error, Result};
use crate::core::firewall::{AcceptRule, Chain, Target};
use crate::elevation::{Program, create_command};
use std::process::Stdio;
use tracing::{debug, error, info};

/// Operations on the machine-wide `filter` table.
///
/// Every method is a single blocking step. Implementations must not batch or
/// reorder calls: the caller relies on each call having taken effect before
/// the next one is issued.
#[allow(async_fn_in_trait)]
pub trait PacketFilter {
    /// Flushes every rule in the built-in chains and zeroes counters
    async fn flush(&mut self) -> Result<()>;

    /// Flushes every rule and deletes all user-defined chains
    async fn flush_all_chains(&mut self) -> Result<()>;

    async fn set_default_policy(&mut self, chain: Chain, target: Target) -> Result<()>;

    async fn add_accept_rule(&mut self, rule: AcceptRule) -> Result<()>;

    /// Returns the current `filter` table in `iptables-save` format. Never mutates.
    async fn save(&mut self) -> Result<String>;

    /// Returns every table (`filter`, `nat`, `mangle`, ...) in
    /// `iptables-save` format, as boot-time loaders expect. Never mutates.
    async fn save_all(&mut self) -> Result<String>;

    /// Replaces the table with a previously saved one
    async fn restore(&mut self, rules: &str) -> Result<()>;
}

/// The live iptables `filter` table
#[derive(Debug, Default)]
pub struct IptablesFilter;

impl IptablesFilter {
    pub fn new() -> Self {
        Self
    }

    async fn iptables(&self, args: &[&str]) -> Result<()> {
        let command_line = format!("{} {}", Program::Iptables.binary(), args.join(" "));
        debug!("Running {command_line}");

        let output = create_command(Program::Iptables, args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(&command_line, &e))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("{command_line} failed: {stderr}");
            Err(Error::OsCall {
                command: command_line,
                message: stderr.clone(),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }

    async fn iptables_save(&self, args: &[&str]) -> Result<String> {
        let command_line = std::iter::once(Program::IptablesSave.binary())
            .chain(args.iter().map(ToString::to_string))
            .collect::<Vec<_>>()
            .join(" ");
        debug!("Running {command_line}");

        let output = create_command(Program::IptablesSave, args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| spawn_error(&command_line, &e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("{command_line} failed: {stderr}");
            Err(Error::OsCall {
                command: command_line,
                message: stderr.clone(),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }
}

fn spawn_error(command_line: &str, e: &std::io::Error) -> Error {
    error!("Failed to spawn {command_line}: {e}");
    Error::OsCall {
        command: command_line.to_string(),
        message: e.to_string(),
        stderr: None,
        exit_code: None,
    }
}

impl PacketFilter for IptablesFilter {
    async fn flush(&mut self) -> Result<()> {
        self.iptables(&["-F"]).await?;
        self.iptables(&["-Z"]).await
    }

    async fn flush_all_chains(&mut self) -> Result<()> {
        self.iptables(&["-F"]).await?;
        self.iptables(&["-X"]).await
    }

    async fn set_default_policy(&mut self, chain: Chain, target: Target) -> Result<()> {
        let chain = chain.to_string();
        let target = target.to_string();
        self.iptables(&["-P", &chain, &target]).await
    }

    async fn add_accept_rule(&mut self, rule: AcceptRule) -> Result<()> {
        let args = rule.append_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.iptables(&args).await
    }

    async fn save(&mut self) -> Result<String> {
        self.iptables_save(&["-t", "filter"]).await
    }

    async fn save_all(&mut self) -> Result<String> {
        self.iptables_save(&[]).await
    }

    async fn restore(&mut self, rules: &str) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let command_line = Program::IptablesRestore.binary();
        info!("Restoring ruleset via {command_line}");

        let no_args: [&str; 0] = [];
        let mut child = create_command(Program::IptablesRestore, &no_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| spawn_error(&command_line, &e))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(rules.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;

        if output.status.success() {
            info!("Restore successful");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("Restore failed: {stderr}");
            Err(Error::OsCall {
                command: command_line,
                message: stderr.clone(),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }
}

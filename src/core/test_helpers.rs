//! Shared test utilities for core module tests
//!
//! This module is only compiled in test mode.

use crate::core::applier::BackupSettings;
use crate::core::firewall::{FirewallPolicy, PortSpec, Protocol};
use std::path::Path;
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("PORTWALL_IPTABLES", "/usr/sbin/iptables-legacy");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("PORTWALL_IPTABLES");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// Builds a policy from `(port, protocol)` pairs.
pub fn policy_of(ports: &[(u16, Protocol)]) -> FirewallPolicy {
    FirewallPolicy::new(
        ports
            .iter()
            .map(|(port, protocol)| PortSpec::new(*port, *protocol))
            .collect(),
    )
}

/// Backup settings that write into a test-owned directory.
pub fn backup_settings(dir: &Path) -> BackupSettings {
    BackupSettings {
        path: dir.join("backup.rules"),
        archive_dir: Some(dir.join("snapshots")),
        retention: 5,
    }
}

/// Writes an executable `/bin/sh` script, standing in for a system binary.
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// `iptables-save` stand-in: the filter table for `-t filter`, and a nat
/// table ahead of it when called without arguments.
pub const FAKE_SAVE_SCRIPT: &str = r#"if [ "$#" -eq 0 ]; then
  echo '*nat'
  echo ':POSTROUTING ACCEPT [0:0]'
  echo '-A POSTROUTING -o eth0 -j MASQUERADE'
  echo 'COMMIT'
fi
echo '*filter'
echo ':INPUT ACCEPT [0:0]'
echo 'COMMIT'"#;

//! Privilege checks and command construction for system operations
//!
//! portwall never escalates on its own. Every mutating operation requires the
//! process to already run as root, and refuses otherwise.
//!
//! Only a fixed set of programs can be run:
//!
//! - **iptables**, **iptables-save**, **iptables-restore**: packet filter control
//! - **netfilter-persistent**: persistence helper (Debian/Ubuntu)
//! - **service**: service-manager save (RHEL-style `service iptables save`)
//!
//! # Environment Variables
//!
//! - `PORTWALL_IPTABLES`: Path of the `iptables` binary. The save and restore
//!   companions are derived from it (`${PORTWALL_IPTABLES}-save`, `-restore`).
//! - `PORTWALL_TEST_NO_ELEVATION`: Skip the root check (for testing only).
//!
//! # Security
//!
//! - Commands are constructed without shell interpolation
//! - Audit logging tracks all privileged operations (via caller)

use tokio::process::Command;

/// Error type for privilege checks
#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// Effective uid is not 0
    #[error("portwall must be run as root (effective uid is {0})")]
    NotRoot(u32),
}

impl From<ElevationError> for crate::core::error::Error {
    fn from(e: ElevationError) -> Self {
        crate::core::error::Error::Privilege(e.to_string())
    }
}

/// Programs portwall is allowed to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    Iptables,
    IptablesSave,
    IptablesRestore,
    NetfilterPersistent,
    Service,
}

impl Program {
    /// Resolves the binary name or path, honouring `PORTWALL_IPTABLES`.
    pub fn binary(self) -> String {
        let iptables = std::env::var("PORTWALL_IPTABLES")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "iptables".to_string());

        match self {
            Program::Iptables => iptables,
            Program::IptablesSave => format!("{iptables}-save"),
            Program::IptablesRestore => format!("{iptables}-restore"),
            Program::NetfilterPersistent => "netfilter-persistent".to_string(),
            Program::Service => "service".to_string(),
        }
    }
}

/// Fails unless the process runs with effective uid 0.
///
/// # Errors
///
/// Returns `ElevationError::NotRoot` for unprivileged processes.
pub fn require_root() -> Result<(), ElevationError> {
    if std::env::var("PORTWALL_TEST_NO_ELEVATION").is_ok() {
        return Ok(());
    }

    let euid = nix::unistd::geteuid();
    if euid.is_root() {
        Ok(())
    } else {
        Err(ElevationError::NotRoot(euid.as_raw()))
    }
}

/// Checks if a binary exists in PATH
///
/// Names containing a `/` are checked as paths directly.
pub fn binary_exists(name: &str) -> bool {
    if name.contains('/') {
        return std::path::Path::new(name).is_file();
    }

    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let full_path = dir.join(name);
                if full_path.is_file() {
                    Some(full_path)
                } else {
                    None
                }
            })
        })
        .is_some()
}

/// Creates a command for one of the whitelisted programs.
///
/// Arguments are passed directly without shell interpretation.
pub fn create_command<S: AsRef<std::ffi::OsStr>>(program: Program, args: &[S]) -> Command {
    let mut cmd = Command::new(program.binary());
    cmd.args(args);
    cmd.kill_on_drop(true);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::ENV_VAR_MUTEX;

    #[test]
    fn test_binary_exists() {
        // sh should exist on all Unix systems
        assert!(binary_exists("sh"));
        assert!(binary_exists("/bin/sh"));
        // This should not exist
        assert!(!binary_exists("portwall_nonexistent_binary_xyz"));
        assert!(!binary_exists("/nonexistent/portwall_binary"));
    }

    #[test]
    fn test_program_binary_override() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var("PORTWALL_IPTABLES", "/usr/sbin/iptables-legacy");
        }
        let save = Program::IptablesSave.binary();
        let restore = Program::IptablesRestore.binary();
        unsafe {
            std::env::remove_var("PORTWALL_IPTABLES");
        }

        assert_eq!(save, "/usr/sbin/iptables-legacy-save");
        assert_eq!(restore, "/usr/sbin/iptables-legacy-restore");
        assert_eq!(Program::Iptables.binary(), "iptables");
        assert_eq!(Program::Service.binary(), "service");
    }

    #[test]
    fn test_require_root_test_mode() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::set_var("PORTWALL_TEST_NO_ELEVATION", "1");
        }
        let result = require_root();
        unsafe {
            std::env::remove_var("PORTWALL_TEST_NO_ELEVATION");
        }

        assert!(result.is_ok());
    }

    #[test]
    fn test_require_root_matches_euid() {
        let _guard = ENV_VAR_MUTEX.lock().unwrap();

        unsafe {
            std::env::remove_var("PORTWALL_TEST_NO_ELEVATION");
        }
        let result = require_root();

        if nix::unistd::geteuid().is_root() {
            assert!(result.is_ok());
        } else {
            assert!(matches!(result, Err(ElevationError::NotRoot(_))));
        }
    }

    #[test]
    fn test_not_root_becomes_privilege_error() {
        let err: crate::core::error::Error = ElevationError::NotRoot(1000).into();
        assert!(matches!(err, crate::core::error::Error::Privilege(_)));
        assert_eq!(err.exit_code(), 1);
    }
}

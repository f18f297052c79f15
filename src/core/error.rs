use thiserror::Error;

/// Core error types for portwall
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Process is not running with root privileges
    #[error("Privilege error: {0}")]
    Privilege(String),

    /// Malformed flag or port specification
    #[error("Invalid {field}: {message}")]
    Argument { field: String, message: String },

    /// An iptables (or persistence helper) invocation failed
    #[error("{command} failed: {message}")]
    OsCall {
        command: String,
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Snapshot operation failed
    #[error("Snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn argument(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Argument {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    ///
    /// Privilege and argument errors exit with 1. A failed external command
    /// propagates its own status when it fits in an exit code.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::OsCall {
                exit_code: Some(code),
                ..
            } => u8::try_from(*code).ok().filter(|c| *c != 0).unwrap_or(1),
            _ => 1,
        }
    }

    /// Whether the error happened before anything on the system was touched.
    pub fn is_pre_mutation(&self) -> bool {
        matches!(self, Error::Privilege(_) | Error::Argument { .. })
    }

    /// Hints for a failed external command.
    ///
    /// Uses the command's stderr, or the spawn error when it never ran.
    pub fn translation(&self) -> Option<ErrorTranslation> {
        match self {
            Error::OsCall {
                message, stderr, ..
            } => Some(IptablesErrorPattern::match_error(
                stderr.as_deref().unwrap_or(message),
            )),
            _ => None,
        }
    }
}

/// Snapshot-specific errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Snapshot corrupted: {0}")]
    Corrupted(String),

    #[error("Snapshot checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Refusing to use snapshot {path}: {reason}")]
    Untrusted { path: String, reason: String },

    #[error("Snapshot not found: {0}")]
    NotFound(String),

    #[error("Snapshot is empty")]
    Empty,
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Database of iptables error patterns and their translations
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches an error message against known patterns and returns a user-friendly translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        // Permission errors
        if lower.contains("permission denied")
            || lower.contains("operation not permitted")
            || lower.contains("you must be root")
        {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run portwall as root, e.g. sudo portwall")
                .with_suggestion("Check if CAP_NET_ADMIN capability is available");
        }

        // conntrack match unavailable
        if lower.contains("conntrack") {
            return ErrorTranslation::new("Connection tracking match is unavailable")
                .with_suggestion("Load the module: sudo modprobe nf_conntrack")
                .with_suggestion("Check kernel modules: lsmod | grep conntrack");
        }

        // Missing iptables
        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S iptables  (Arch)")
                .with_suggestion("Or point PORTWALL_IPTABLES at the binary");
        }

        // Concurrent rule mutation
        if lower.contains("xtables lock") || lower.contains("resource temporarily unavailable") {
            return ErrorTranslation::new("Another process is holding the xtables lock")
                .with_suggestion("Another firewall manager may be modifying rules right now")
                .with_suggestion(
                    "Check for conflicting managers: sudo systemctl status firewalld ufw",
                )
                .with_suggestion("Wait a moment and try again");
        }

        // Unknown chain/target/match
        if lower.contains("no chain/target/match")
            || lower.contains("couldn't load target")
            || lower.contains("couldn't load match")
        {
            return ErrorTranslation::new("iptables does not know a chain, target or match")
                .with_suggestion("The kernel may lack the required netfilter module")
                .with_suggestion("Check kernel modules: lsmod | grep -E 'ip_tables|xt_'");
        }

        // Port errors
        if lower.contains("invalid port") || (lower.contains("port") && lower.contains("range")) {
            return ErrorTranslation::new("Invalid port")
                .with_suggestion("Port numbers must be between 1 and 65535")
                .with_suggestion("Use PORT/PROTOCOL, e.g. 22/tcp or 53/udp");
        }

        // iptables-restore line errors
        if lower.contains("line") && lower.contains("failed") {
            return ErrorTranslation::new("Snapshot could not be restored")
                .with_suggestion("The snapshot file may be truncated or hand-edited")
                .with_suggestion("Check it with: iptables-restore --test < FILE");
        }

        // Generic fallback
        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Verify iptables is working: sudo iptables -S")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

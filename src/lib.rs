//! portwall - deny-by-default iptables policy for a listed set of ports
//!
//! Flushes the IPv4 `filter` table, drops inbound and forwarded traffic by
//! default, and accepts only loopback, established/related connections and
//! the listed `PORT/PROTOCOL` services.
//!
//! # Architecture
//!
//! - [`core`] - Policy model, packet filter capability, rule application
//! - [`audit`] - Security audit logging for all privileged operations
//! - [`validators`] - Port spec parsing and validation
//! - [`elevation`] - Root check and whitelisted command construction
//! - [`config`] - Optional configuration file
//! - [`utils`] - Utility functions (XDG directories)
//!
//! # Safety Features
//!
//! - Pre-change snapshot written before any mutation
//! - Loopback and established/related allowances precede listed ports
//! - SHA-256 snapshot checksums
//! - Warning when the current SSH session's port is not in the list

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::{FirewallPolicy, PortSpec, Protocol};

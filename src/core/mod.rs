//! Core firewall management functionality
//!
//! This module contains the core types and logic for applying a
//! deny-by-default iptables policy. It provides:
//!
//! - [`firewall`]: Policy data structures and rule generation
//! - [`filter`]: The packet filter capability and its iptables implementation
//! - [`memory`]: In-memory packet filter for previews and tests
//! - [`applier`]: Apply, reset, dry-run and restore
//! - [`snapshot`]: Pre-change backups and checksums
//! - [`persist`]: Boot persistence backends
//! - [`error`]: Error types for firewall operations

pub mod applier;
pub mod error;
pub mod filter;
pub mod firewall;
pub mod memory;
pub mod persist;
pub mod snapshot;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;

//! Input validation and parsing for portwall
//!
//! Every value taken from the command line or the config file passes through
//! here before anything touches the packet filter.

use crate::core::error::{Error, Result};
use crate::core::firewall::{PortSpec, Protocol};

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> std::result::Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Parses one `PORT/PROTOCOL` entry such as `22/tcp`.
///
/// # Examples
///
/// ```
/// use portwall::validators::parse_port_spec;
/// use portwall::core::firewall::Protocol;
///
/// let spec = parse_port_spec("9100/tcp").unwrap();
/// assert_eq!(spec.port, 9100);
/// assert_eq!(spec.protocol, Protocol::Tcp);
///
/// assert!(parse_port_spec("9100").is_err());
/// assert!(parse_port_spec("9100/sctp").is_err());
/// ```
///
/// # Errors
///
/// Returns `Error::Argument` if:
/// - The entry does not have exactly two `/`-separated fields
/// - The port is not a number in 1..=65535
/// - The protocol is not `tcp` or `udp`
pub fn parse_port_spec(raw: &str) -> Result<PortSpec> {
    let fields: Vec<&str> = raw.split('/').collect();
    let [port, protocol] = fields.as_slice() else {
        return Err(Error::argument(
            "port spec",
            format!("'{raw}' must have the form PORT/PROTOCOL"),
        ));
    };

    // u16::from_str also takes a leading '+'
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::argument(
            "port",
            format!("'{port}' in '{raw}' is not a valid port"),
        ));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::argument("port", format!("'{port}' in '{raw}' is not a valid port")))?;
    let port = validate_port(port).map_err(|msg| Error::argument("port", format!("{msg} ('{raw}')")))?;

    let protocol: Protocol = protocol.parse().map_err(|_| {
        Error::argument(
            "protocol",
            format!("'{protocol}' in '{raw}' is not supported (use tcp or udp)"),
        )
    })?;

    Ok(PortSpec::new(port, protocol))
}

/// Parses a sequence of `PORT/PROTOCOL` entries, preserving order.
///
/// # Errors
///
/// Fails on the first malformed entry.
pub fn parse_port_specs<S: AsRef<str>>(raw: &[S]) -> Result<Vec<PortSpec>> {
    raw.iter().map(|s| parse_port_spec(s.as_ref())).collect()
}

/// Parses the comma-separated form accepted by `--ports`.
///
/// Whitespace around entries is ignored and empty entries are skipped, so
/// `"22/tcp, 80/tcp,"` yields two specs and `""` yields none.
///
/// # Errors
///
/// Fails on the first malformed entry.
pub fn parse_port_list(raw: &str) -> Result<Vec<PortSpec>> {
    let entries: Vec<&str> = raw
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .collect();
    parse_port_specs(&entries)
}

/// Extracts the server-side port from an `SSH_CONNECTION` value.
///
/// The variable holds `client_ip client_port server_ip server_port`.
pub fn ssh_server_port(ssh_connection: &str) -> Option<u16> {
    ssh_connection
        .split_whitespace()
        .nth(3)
        .and_then(|port| port.parse().ok())
        .filter(|port| *port != 0)
}

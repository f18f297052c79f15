//! Firewall policy data structures and iptables rule generation
//!
//! This module defines the data model for a deny-by-default policy and turns
//! it into the ordered sequence of operations that realises it.
//!
//! # Policy Structure
//!
//! A [`FirewallPolicy`] is an ordered list of [`PortSpec`]s plus two fixed
//! allowances:
//! - loopback traffic in both directions
//! - inbound traffic belonging to established or related connections
//!
//! Inbound and forwarded traffic default to `DROP`, outbound to `ACCEPT`.
//!
//! # Example
//!
//! ```
//! use portwall::core::firewall::{FirewallPolicy, PolicyStep, PortSpec, Protocol};
//!
//! let policy = FirewallPolicy::new(vec![PortSpec::new(22, Protocol::Tcp)]);
//! let steps = policy.steps();
//! assert_eq!(steps[0], PolicyStep::Flush);
//! assert_eq!(steps.len(), 8);
//! ```

use std::fmt;

/// Ports allowed when neither `--ports` nor the config file names any.
///
/// SSH, HTTP, HTTPS and the node exporter metrics endpoint.
pub const DEFAULT_PORTS: &str = "22/tcp,80/tcp,443/tcp,9100/tcp";

/// Transport protocol of an allowed service
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
)]
pub enum Protocol {
    /// Transmission Control Protocol
    #[strum(serialize = "tcp")]
    Tcp,
    /// User Datagram Protocol
    #[strum(serialize = "udp")]
    Udp,
}

impl Protocol {
    /// Returns lowercase protocol name as iptables spells it
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

/// A single allowed inbound service, e.g. `22/tcp`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortSpec {
    pub port: u16,
    pub protocol: Protocol,
}

impl PortSpec {
    pub const fn new(port: u16, protocol: Protocol) -> Self {
        Self { port, protocol }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.protocol)
    }
}

/// Built-in chain of the iptables `filter` table
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
)]
pub enum Chain {
    #[strum(serialize = "INPUT")]
    Input,
    #[strum(serialize = "FORWARD")]
    Forward,
    #[strum(serialize = "OUTPUT")]
    Output,
}

/// Default policy target for a built-in chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum Target {
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
}

/// An accept rule portwall knows how to add
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AcceptRule {
    /// `-A INPUT -i lo -j ACCEPT`
    LoopbackIn,
    /// `-A OUTPUT -o lo -j ACCEPT`
    LoopbackOut,
    /// `-A INPUT -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT`
    EstablishedRelated,
    /// `-A INPUT -p <proto> -m <proto> --dport <port> -j ACCEPT`
    Port(PortSpec),
}

impl AcceptRule {
    pub const fn chain(self) -> Chain {
        match self {
            AcceptRule::LoopbackOut => Chain::Output,
            AcceptRule::LoopbackIn | AcceptRule::EstablishedRelated | AcceptRule::Port(_) => {
                Chain::Input
            }
        }
    }

    /// Match arguments between the chain name and `-j ACCEPT`
    pub fn match_args(self) -> Vec<String> {
        match self {
            AcceptRule::LoopbackIn => vec!["-i".into(), "lo".into()],
            AcceptRule::LoopbackOut => vec!["-o".into(), "lo".into()],
            AcceptRule::EstablishedRelated => vec![
                "-m".into(),
                "conntrack".into(),
                "--ctstate".into(),
                "ESTABLISHED,RELATED".into(),
            ],
            AcceptRule::Port(spec) => vec![
                "-p".into(),
                spec.protocol.as_str().into(),
                "-m".into(),
                spec.protocol.as_str().into(),
                "--dport".into(),
                spec.port.to_string(),
            ],
        }
    }

    /// Full `iptables` argument vector that appends this rule
    pub fn append_args(self) -> Vec<String> {
        let mut args = vec!["-A".to_string(), self.chain().to_string()];
        args.extend(self.match_args());
        args.extend(["-j".to_string(), "ACCEPT".to_string()]);
        args
    }

    /// Parses the argument form produced by [`AcceptRule::append_args`].
    ///
    /// Accepts the `-A CHAIN ...` lines found in `iptables-save` output. Returns
    /// `None` for any rule portwall did not generate.
    pub fn from_rule_line(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        match tokens.as_slice() {
            ["-A", "INPUT", "-i", "lo", "-j", "ACCEPT"] => Some(AcceptRule::LoopbackIn),
            ["-A", "OUTPUT", "-o", "lo", "-j", "ACCEPT"] => Some(AcceptRule::LoopbackOut),
            ["-A", "INPUT", "-m", "conntrack", "--ctstate", state, "-j", "ACCEPT"]
                if matches!(*state, "ESTABLISHED,RELATED" | "RELATED,ESTABLISHED") =>
            {
                Some(AcceptRule::EstablishedRelated)
            }
            ["-A", "INPUT", "-p", proto, "-m", m, "--dport", port, "-j", "ACCEPT"]
                if proto == m =>
            {
                let protocol = proto.parse::<Protocol>().ok()?;
                let port = port.parse::<u16>().ok().filter(|p| *p != 0)?;
                Some(AcceptRule::Port(PortSpec::new(port, protocol)))
            }
            _ => None,
        }
    }
}

impl fmt::Display for AcceptRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.append_args().join(" "))
    }
}

/// One operation against the packet filter, in the order it must happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyStep {
    /// Flush all rules and zero counters
    Flush,
    SetPolicy(Chain, Target),
    Accept(AcceptRule),
}

/// A deny-by-default policy admitting only the listed services
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallPolicy {
    pub ports: Vec<PortSpec>,
}

impl FirewallPolicy {
    pub fn new(ports: Vec<PortSpec>) -> Self {
        Self { ports }
    }

    /// The exact operation sequence realising this policy.
    ///
    /// Flush comes first so stale rules cannot survive. Loopback and
    /// established/related allowances precede the listed ports.
    pub fn steps(&self) -> Vec<PolicyStep> {
        let mut steps = Vec::with_capacity(self.ports.len() + 7);
        steps.push(PolicyStep::Flush);
        steps.push(PolicyStep::SetPolicy(Chain::Input, Target::Drop));
        steps.push(PolicyStep::SetPolicy(Chain::Forward, Target::Drop));
        steps.push(PolicyStep::SetPolicy(Chain::Output, Target::Accept));
        steps.push(PolicyStep::Accept(AcceptRule::LoopbackIn));
        steps.push(PolicyStep::Accept(AcceptRule::LoopbackOut));
        steps.push(PolicyStep::Accept(AcceptRule::EstablishedRelated));
        steps.extend(
            self.ports
                .iter()
                .map(|spec| PolicyStep::Accept(AcceptRule::Port(*spec))),
        );
        steps
    }

    /// Number of accept rules the policy adds (fixed allowances included)
    pub fn rule_count(&self) -> usize {
        self.ports.len() + 3
    }

    /// Whether the policy admits inbound TCP traffic on `port`
    pub fn allows_tcp(&self, port: u16) -> bool {
        self.ports
            .iter()
            .any(|spec| spec.protocol == Protocol::Tcp && spec.port == port)
    }

    /// Renders the end state in `iptables-save` format.
    pub fn to_rules_text(&self) -> String {
        let rules: Vec<AcceptRule> = self
            .steps()
            .into_iter()
            .filter_map(|step| match step {
                PolicyStep::Accept(rule) => Some(rule),
                _ => None,
            })
            .collect();
        render_save_text(
            [
                (Chain::Input, Target::Drop),
                (Chain::Forward, Target::Drop),
                (Chain::Output, Target::Accept),
            ],
            &[],
            &rules,
        )
    }
}

/// Renders a `filter` table in `iptables-save` format.
///
/// Counters are always written as `[0:0]`; portwall never reads them back.
pub fn render_save_text(
    policies: [(Chain, Target); 3],
    custom_chains: &[String],
    rules: &[AcceptRule],
) -> String {
    use std::fmt::Write;

    let mut out = String::from("*filter\n");
    for (chain, target) in policies {
        let _ = writeln!(out, ":{chain} {target} [0:0]");
    }
    for name in custom_chains {
        let _ = writeln!(out, ":{name} - [0:0]");
    }
    for rule in rules {
        let _ = writeln!(out, "{rule}");
    }
    out.push_str("COMMIT\n");
    out
}

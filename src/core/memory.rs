//! In-memory packet filter
//!
//! [`MemoryFilter`] models the `filter` table closely enough to answer "would
//! this packet get through?". It records every call made against it, so tests
//! can assert on call order, and it can be told to fail on a given call.
//!
//! Dry runs replay the policy against a fresh `MemoryFilter` and print the
//! result, which keeps the preview identical to what a real apply produces.

use crate::core::error::{Error, Result};
use crate::core::filter::PacketFilter;
use crate::core::firewall::{AcceptRule, Chain, Protocol, Target, render_save_text};
use std::collections::BTreeMap;
use tracing::warn;

/// A call made against a [`MemoryFilter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterCall {
    Flush,
    FlushAllChains,
    SetDefaultPolicy(Chain, Target),
    AddAcceptRule(AcceptRule),
    Save,
    SaveAll,
    Restore,
}

/// Connection-tracking state of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Established,
    Related,
}

/// A packet as seen by one chain of the filter table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub chain: Chain,
    pub loopback: bool,
    pub protocol: Protocol,
    pub dport: u16,
    pub state: ConnState,
}

impl Packet {
    /// A new inbound connection attempt on a non-loopback interface
    pub fn inbound(protocol: Protocol, dport: u16) -> Self {
        Self {
            chain: Chain::Input,
            loopback: false,
            protocol,
            dport,
            state: ConnState::New,
        }
    }

    /// A new outbound connection attempt on a non-loopback interface
    pub fn outbound(protocol: Protocol, dport: u16) -> Self {
        Self {
            chain: Chain::Output,
            ..Self::inbound(protocol, dport)
        }
    }

    pub fn forwarded(protocol: Protocol, dport: u16) -> Self {
        Self {
            chain: Chain::Forward,
            ..Self::inbound(protocol, dport)
        }
    }

    pub fn on_loopback(mut self) -> Self {
        self.loopback = true;
        self
    }

    pub fn with_state(mut self, state: ConnState) -> Self {
        self.state = state;
        self
    }
}

/// In-memory `filter` table
#[derive(Debug, Clone)]
pub struct MemoryFilter {
    policies: BTreeMap<Chain, Target>,
    rules: Vec<AcceptRule>,
    custom_chains: Vec<String>,
    /// Packet counter, zeroed by `flush`
    counters: u64,
    calls: Vec<FilterCall>,
    fail_on_call: Option<usize>,
}

impl Default for MemoryFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFilter {
    /// A pristine table: all policies `ACCEPT`, no rules.
    pub fn new() -> Self {
        Self {
            policies: BTreeMap::from([
                (Chain::Input, Target::Accept),
                (Chain::Forward, Target::Accept),
                (Chain::Output, Target::Accept),
            ]),
            rules: Vec::new(),
            custom_chains: Vec::new(),
            counters: 0,
            calls: Vec::new(),
            fail_on_call: None,
        }
    }

    /// Makes the `n`th call (zero-based) fail with an `OsCall` error.
    pub fn failing_on_call(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    /// Adds a user-defined chain, as another tool might have left behind.
    pub fn with_custom_chain(mut self, name: impl Into<String>) -> Self {
        self.custom_chains.push(name.into());
        self
    }

    /// Adds a rule without recording a call.
    pub fn with_rule(mut self, rule: AcceptRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn with_counters(mut self, packets: u64) -> Self {
        self.counters = packets;
        self
    }

    pub fn calls(&self) -> &[FilterCall] {
        &self.calls
    }

    pub fn rules(&self) -> &[AcceptRule] {
        &self.rules
    }

    pub fn custom_chains(&self) -> &[String] {
        &self.custom_chains
    }

    pub fn counters(&self) -> u64 {
        self.counters
    }

    pub fn policy(&self, chain: Chain) -> Target {
        self.policies.get(&chain).copied().unwrap_or(Target::Accept)
    }

    /// Whether every built-in chain accepts and no rule or custom chain exists
    pub fn is_fully_open(&self) -> bool {
        self.policies.values().all(|t| *t == Target::Accept)
            && self.rules.is_empty()
            && self.custom_chains.is_empty()
    }

    /// Evaluates a packet against the chain it traverses.
    ///
    /// Rules are tried in order; the first match accepts. Otherwise the
    /// chain's default policy decides.
    pub fn admits(&self, packet: &Packet) -> bool {
        let matched = self
            .rules
            .iter()
            .filter(|rule| rule.chain() == packet.chain)
            .any(|rule| match rule {
                AcceptRule::LoopbackIn | AcceptRule::LoopbackOut => packet.loopback,
                AcceptRule::EstablishedRelated => {
                    matches!(packet.state, ConnState::Established | ConnState::Related)
                }
                AcceptRule::Port(spec) => {
                    spec.protocol == packet.protocol && spec.port == packet.dport
                }
            });

        matched || self.policy(packet.chain) == Target::Accept
    }

    /// Listed ports currently reachable by new inbound connections
    pub fn accepted_ports(&self) -> Vec<(u16, Protocol)> {
        self.rules
            .iter()
            .filter_map(|rule| match rule {
                AcceptRule::Port(spec) => Some((spec.port, spec.protocol)),
                _ => None,
            })
            .collect()
    }

    fn render(&self) -> String {
        render_save_text(
            [
                (Chain::Input, self.policy(Chain::Input)),
                (Chain::Forward, self.policy(Chain::Forward)),
                (Chain::Output, self.policy(Chain::Output)),
            ],
            &self.custom_chains,
            &self.rules,
        )
    }

    fn record(&mut self, call: FilterCall) -> Result<()> {
        let index = self.calls.len();
        let desc = format!("{call:?}");
        self.calls.push(call);

        if self.fail_on_call == Some(index) {
            return Err(Error::OsCall {
                command: format!("memory {desc}"),
                message: "injected failure".to_string(),
                stderr: None,
                exit_code: Some(4),
            });
        }
        Ok(())
    }
}

impl PacketFilter for MemoryFilter {
    async fn flush(&mut self) -> Result<()> {
        self.record(FilterCall::Flush)?;
        self.rules.clear();
        self.counters = 0;
        Ok(())
    }

    async fn flush_all_chains(&mut self) -> Result<()> {
        self.record(FilterCall::FlushAllChains)?;
        self.rules.clear();
        self.custom_chains.clear();
        Ok(())
    }

    async fn set_default_policy(&mut self, chain: Chain, target: Target) -> Result<()> {
        self.record(FilterCall::SetDefaultPolicy(chain, target))?;
        self.policies.insert(chain, target);
        Ok(())
    }

    async fn add_accept_rule(&mut self, rule: AcceptRule) -> Result<()> {
        self.record(FilterCall::AddAcceptRule(rule))?;
        self.rules.push(rule);
        Ok(())
    }

    async fn save(&mut self) -> Result<String> {
        self.record(FilterCall::Save)?;
        Ok(self.render())
    }

    /// Only the filter table is modelled, so this matches `save`.
    async fn save_all(&mut self) -> Result<String> {
        self.record(FilterCall::SaveAll)?;
        Ok(self.render())
    }

    async fn restore(&mut self, rules: &str) -> Result<()> {
        self.record(FilterCall::Restore)?;

        let mut policies = BTreeMap::new();
        let mut custom_chains = Vec::new();
        let mut parsed = Vec::new();

        for line in rules.lines().map(str::trim) {
            if let Some(decl) = line.strip_prefix(':') {
                let mut parts = decl.split_whitespace();
                let (Some(name), Some(policy)) = (parts.next(), parts.next()) else {
                    continue;
                };
                match (name.parse::<Chain>(), policy.parse::<Target>()) {
                    (Ok(chain), Ok(target)) => {
                        policies.insert(chain, target);
                    }
                    _ => custom_chains.push(name.to_string()),
                }
            } else if line.starts_with("-A ") {
                match AcceptRule::from_rule_line(line) {
                    Some(rule) => parsed.push(rule),
                    None => warn!("Ignoring rule the in-memory filter cannot model: {line}"),
                }
            }
        }

        self.policies.extend(policies);
        self.custom_chains = custom_chains;
        self.rules = parsed;
        Ok(())
    }
}

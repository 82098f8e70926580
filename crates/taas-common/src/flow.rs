//! OpenFlow rule representation.
//!
//! Rules are kept structurally (table, priority, match fields, action text)
//! so strict deletes can compare exact matches, and render to the
//! `ovs-ofctl` flow syntax on demand.

use std::collections::BTreeMap;
use std::fmt;

use itertools::Itertools;

/// Destination-MAC match selecting broadcast and multicast frames.
pub const BCMC_DL_DST: &str = "01:00:00:00:00:00/01:00:00:00:00:00";

/// Match fields of a rule. Field order is canonical (sorted by name).
///
/// A field with an empty value renders as a bare keyword (`ip`, `arp`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowMatch {
    fields: BTreeMap<String, String>,
}

impl FlowMatch {
    /// Creates an empty (match-all) match.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an arbitrary `key=value` field.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn in_port(self, port: impl fmt::Display) -> Self {
        self.field("in_port", port.to_string())
    }

    pub fn dl_vlan(self, vlan: u16) -> Self {
        self.field("dl_vlan", vlan.to_string())
    }

    pub fn dl_dst(self, mac: impl Into<String>) -> Self {
        self.field("dl_dst", mac)
    }

    pub fn tun_id(self, id: u16) -> Self {
        self.field("tun_id", id.to_string())
    }

    /// Broadcast/multicast destination on `vlan`.
    pub fn bcmc(vlan: u16) -> Self {
        Self::new().dl_vlan(vlan).dl_dst(BCMC_DL_DST)
    }

    /// Returns the value of `key`, if matched on.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Returns true if the match has no fields (matches every packet).
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns true if every field of `self` appears with the same value in
    /// `other`. Loose-delete semantics.
    pub fn is_subset_of(&self, other: &FlowMatch) -> bool {
        self.fields
            .iter()
            .all(|(k, v)| other.fields.get(k) == Some(v))
    }
}

impl fmt::Display for FlowMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .fields
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .join(",");
        f.write_str(&rendered)
    }
}

/// A single flow-table rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowRule {
    pub table: u8,
    pub priority: u16,
    pub matches: FlowMatch,
    pub actions: String,
}

impl FlowRule {
    pub fn new(table: u8, priority: u16, matches: FlowMatch, actions: impl Into<String>) -> Self {
        Self {
            table,
            priority,
            matches,
            actions: actions.into(),
        }
    }

    /// `table=..,priority=..[,match]` without actions, as used by strict
    /// deletes.
    pub fn match_spec(&self) -> String {
        match_spec(self.table, Some(self.priority), &self.matches)
    }

    /// Full `ovs-ofctl add-flow` argument.
    pub fn spec(&self) -> String {
        format!("{},actions={}", self.match_spec(), self.actions)
    }

    /// Parses one line of `ovs-ofctl dump-flows` output.
    ///
    /// Counters and timers are dropped. Returns `None` for header lines and
    /// anything without an `actions=` clause.
    pub fn parse_dump_line(line: &str) -> Option<FlowRule> {
        let line = line.trim();
        let (head, actions) = line.split_once(" actions=")?;

        let mut table = 0u8;
        let mut priority = 32768u16;
        let mut matches = FlowMatch::new();

        for token in head.split([',', ' ']).map(str::trim).filter(|t| !t.is_empty()) {
            let (key, value) = token.split_once('=').unwrap_or((token, ""));
            match key {
                "table" => table = value.parse().ok()?,
                "priority" => priority = value.parse().ok()?,
                "cookie" | "duration" | "n_packets" | "n_bytes" | "idle_age" | "hard_age"
                | "idle_timeout" | "hard_timeout" | "reset_counts" => {}
                _ => matches = matches.field(key, value),
            }
        }

        Some(FlowRule::new(table, priority, matches, actions.trim()))
    }
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec())
    }
}

/// Renders a rule selector: `table=T[,priority=P][,match]`.
pub fn match_spec(table: u8, priority: Option<u16>, matches: &FlowMatch) -> String {
    let mut spec = format!("table={}", table);
    if let Some(priority) = priority {
        spec.push_str(&format!(",priority={}", priority));
    }
    if !matches.is_empty() {
        spec.push(',');
        spec.push_str(&matches.to_string());
    }
    spec
}

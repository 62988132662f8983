use crate::bitmap::RuleMask;
use crate::error::{Error, Result};
use crate::rule::{Action, ConntrackState, Direction, IpPrefix};
use std::{collections::BTreeMap, fmt};

/// Every kind of program that can be placed in the pipeline.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum ModuleKind {
    Conntrack,
    IpSrc,
    IpDst,
    L4Proto,
    PortSrc,
    PortDst,
    TcpFlags,
    Bitscan,
    Action,
    DefaultAction,
    Forwarder,
    Parser,
}

impl ModuleKind {
    /// The match modules in pipeline order, most selective and cheapest
    /// first. Changing the order changes the compiled pipelines.
    pub const FILTERS: [ModuleKind; 7] = [
        ModuleKind::Conntrack,
        ModuleKind::IpSrc,
        ModuleKind::IpDst,
        ModuleKind::L4Proto,
        ModuleKind::PortSrc,
        ModuleKind::PortDst,
        ModuleKind::TcpFlags,
    ];

    pub fn is_filter(&self) -> bool {
        Self::FILTERS.contains(self)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Conntrack => "conntrack_match",
            Self::IpSrc => "ip_src_lookup",
            Self::IpDst => "ip_dst_lookup",
            Self::L4Proto => "l4proto_lookup",
            Self::PortSrc => "port_src_lookup",
            Self::PortDst => "port_dst_lookup",
            Self::TcpFlags => "tcpflags_lookup",
            Self::Bitscan => "bitscan",
            Self::Action => "action",
            Self::DefaultAction => "default_action",
            Self::Forwarder => "chain_forwarder",
            Self::Parser => "parser",
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Registry key. Shared modules have no direction.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ModuleKey {
    pub kind: ModuleKind,
    pub direction: Option<Direction>,
}

impl ModuleKey {
    pub fn chain(kind: ModuleKind, direction: Direction) -> Self {
        Self {
            kind,
            direction: Some(direction),
        }
    }

    pub fn shared(kind: ModuleKind) -> Self {
        Self {
            kind,
            direction: None,
        }
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.direction {
            Some(dir) => write!(f, "{}/{}", dir, self.kind),
            None => write!(f, "{}", self.kind),
        }
    }
}

/// First module of a generation, the forwarder jumps here.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct EntryPoint {
    pub kind: ModuleKind,
    pub position: u32,
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.kind, self.position)
    }
}

/// Value to rules table for one match dimension.
///
/// `entries` only holds the rules constraining the dimension. The rules
/// that don't are in `wildcard` and the module must let them pass
/// whatever the packet value is.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct FieldTable<K: Ord> {
    pub entries: BTreeMap<K, RuleMask>,
    pub wildcard: RuleMask,
}

impl<K: Ord> FieldTable<K> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            wildcard: RuleMask::new(),
        }
    }

    pub fn add(&mut self, key: K, rule_id: u32) {
        self.entries.entry(key).or_default().set(rule_id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rules passing when the packet value matches exactly `key` or when
    /// the packet has no such value.
    pub fn lookup_exact(&self, key: Option<&K>) -> RuleMask {
        let mut mask = self.wildcard.clone();
        if let Some(m) = key.and_then(|k| self.entries.get(k)) {
            mask.union_with(m);
        }
        mask
    }
}

impl<K: Ord> Default for FieldTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// The table loaded in a match module, one variant per dimension family.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum MatchTable {
    Conntrack(FieldTable<ConntrackState>),
    Ip(FieldTable<IpPrefix>),
    L4Proto(FieldTable<u8>),
    Port(FieldTable<u16>),
    /// Keyed by the raw value of the TCP flags byte.
    TcpFlags(FieldTable<u8>),
}

impl MatchTable {
    pub fn len(&self) -> usize {
        match self {
            Self::Conntrack(t) => t.entries.len(),
            Self::Ip(t) => t.entries.len(),
            Self::L4Proto(t) => t.entries.len(),
            Self::Port(t) => t.entries.len(),
            Self::TcpFlags(t) => t.entries.len(),
        }
    }

    pub fn wildcard(&self) -> &RuleMask {
        match self {
            Self::Conntrack(t) => &t.wildcard,
            Self::Ip(t) => &t.wildcard,
            Self::L4Proto(t) => &t.wildcard,
            Self::Port(t) => &t.wildcard,
            Self::TcpFlags(t) => &t.wildcard,
        }
    }
}

/// Packets and bytes.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct Counter {
    pub packets: u64,
    pub bytes: u64,
}

impl Counter {
    pub fn new(packets: u64, bytes: u64) -> Self {
        Self { packets, bytes }
    }

    pub fn add(&mut self, other: Counter) {
        self.packets = self.packets.saturating_add(other.packets);
        self.bytes = self.bytes.saturating_add(other.bytes);
    }
}

fn unsupported<T>(kind: ModuleKind, op: &str) -> Result<T> {
    Err(Error::invalid_state(format!(
        "{} module doesn't support {}",
        kind, op
    )))
}

/// One program instance placed in the pipeline.
///
/// Only the operations that make sense for the module kind are
/// implemented, the others fail with [Error::InvalidState]. Dropping the
/// handle unloads the program and releases its resources.
pub trait Module: Send {
    fn kind(&self) -> ModuleKind;

    fn position(&self) -> u32;

    /// Loads the value to rules table of a match module.
    fn update_map(&mut self, _table: &MatchTable) -> Result<()> {
        unsupported(self.kind(), "map updates")
    }

    /// Sets the action taken for `rule_id` by the action module.
    fn update_table_value(&mut self, _rule_id: u32, _action: Action) -> Result<()> {
        unsupported(self.kind(), "action table updates")
    }

    /// Sets the action taken when no rule of `direction` matches.
    fn update_default(&mut self, _direction: Direction, _action: Action) -> Result<()> {
        unsupported(self.kind(), "default action updates")
    }

    /// Resets the counters of `rule_id`.
    fn flush_counters(&mut self, _rule_id: u32) -> Result<()> {
        unsupported(self.kind(), "counters")
    }

    /// Resets the default action counters of `direction`.
    fn flush_default_counters(&mut self, _direction: Direction) -> Result<()> {
        unsupported(self.kind(), "default counters")
    }

    /// Counters of `rule_id` accumulated since the last fetch or flush.
    fn fetch_counters(&mut self, _rule_id: u32) -> Result<Counter> {
        unsupported(self.kind(), "counters")
    }

    /// Default action counters of `direction` since the last fetch or flush.
    fn fetch_default_counters(&mut self, _direction: Direction) -> Result<Counter> {
        unsupported(self.kind(), "default counters")
    }

    /// Points the forwarder hop `slot` of `direction` to `target`.
    fn update_hop(&mut self, _slot: u32, _target: EntryPoint, _direction: Direction) -> Result<()> {
        unsupported(self.kind(), "hops")
    }

    /// Makes the latest updates effective.
    fn reload(&mut self) -> Result<()>;
}

/// Creates the pipeline modules.
pub trait Dataplane: Send + Sync {
    /// Loads a module of `kind` at `position`. Shared modules get no
    /// direction.
    fn load(
        &self,
        kind: ModuleKind,
        position: u32,
        direction: Option<Direction>,
    ) -> Result<Box<dyn Module>>;
}

/// The only forwarder hop used by the chains.
pub const CHAIN_HOP: u32 = 1;

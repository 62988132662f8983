//! In memory dataplane. It keeps the modules loaded by the chains and
//! walks them the same way the programs do, so a compiled chain can be
//! checked without loading anything in the kernel.

use crate::bitmap::RuleMask;
use crate::compiler::NO_CHAIN_ENTRY;
use crate::error::{Error, Result};
use crate::module::{Counter, Dataplane, EntryPoint, MatchTable, Module, ModuleKind};
use crate::rule::{Action, ConntrackState, Direction};
use std::{
    collections::{BTreeMap, BTreeSet},
    net::Ipv4Addr,
    sync::{Arc, Mutex, MutexGuard},
};
use zon_fw_common::TcpFlags;

/// Packet metadata as extracted by the parser.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub l4proto: u8,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
    pub tcpflags: Option<TcpFlags>,
    pub conntrack: ConntrackState,
    pub len: u64,
}

impl Default for Packet {
    fn default() -> Self {
        Self {
            src: Ipv4Addr::UNSPECIFIED,
            dst: Ipv4Addr::UNSPECIFIED,
            l4proto: 0,
            sport: None,
            dport: None,
            tcpflags: None,
            conntrack: ConntrackState::New,
            len: 64,
        }
    }
}

/// Outcome of [SimDataplane::classify]. `rule` is None when the default
/// action was taken.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub action: Action,
    pub rule: Option<u32>,
}

struct Stage {
    handle: u64,
    kind: ModuleKind,
    direction: Option<Direction>,
    table: Option<MatchTable>,
    actions: BTreeMap<u32, Action>,
    counters: BTreeMap<u32, Counter>,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    stages: BTreeMap<u32, Stage>,
    hops: BTreeMap<Direction, EntryPoint>,
    pending_hops: BTreeMap<Direction, EntryPoint>,
    defaults: BTreeMap<Direction, Action>,
    pending_defaults: BTreeMap<Direction, Action>,
    default_counters: BTreeMap<Direction, Counter>,
    reloads: BTreeMap<ModuleKind, usize>,
    loads: usize,
    fail_load: BTreeSet<ModuleKind>,
    fail_reload: BTreeSet<ModuleKind>,
}

/// Cloning gives another handle to the same dataplane.
#[derive(Clone, Default)]
pub struct SimDataplane {
    state: Arc<Mutex<SimState>>,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

impl SimDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        lock(&self.state)
    }

    /// Number of reloads of all the modules of `kind`.
    pub fn reloads(&self, kind: ModuleKind) -> usize {
        self.state().reloads.get(&kind).copied().unwrap_or_default()
    }

    /// Number of modules loaded so far, unloaded ones included.
    pub fn loads(&self) -> usize {
        self.state().loads
    }

    pub fn fail_load(&self, kind: ModuleKind, fail: bool) {
        let mut st = self.state();
        if fail {
            st.fail_load.insert(kind);
        } else {
            st.fail_load.remove(&kind);
        }
    }

    pub fn fail_reload(&self, kind: ModuleKind, fail: bool) {
        let mut st = self.state();
        if fail {
            st.fail_reload.insert(kind);
        } else {
            st.fail_reload.remove(&kind);
        }
    }

    /// Loaded modules by position.
    pub fn positions(&self) -> Vec<(u32, ModuleKind, Option<Direction>)> {
        self.state()
            .stages
            .iter()
            .map(|(pos, s)| (*pos, s.kind, s.direction))
            .collect()
    }

    /// The entry point currently used by the forwarder for `direction`.
    pub fn hop(&self, direction: Direction) -> Option<EntryPoint> {
        self.state().hops.get(&direction).copied()
    }

    pub fn default_action(&self, direction: Direction) -> Option<Action> {
        self.state().defaults.get(&direction).copied()
    }

    /// Walks the pipeline of `direction` with `packet` and updates the
    /// counters of the rule or default action taken.
    pub fn classify(&self, direction: Direction, packet: &Packet) -> Result<Verdict> {
        let mut st = self.state();
        let mut position = st
            .hops
            .get(&direction)
            .map_or(NO_CHAIN_ENTRY.position, |e| e.position);
        let mut mask: Option<RuleMask> = None;

        let winner = loop {
            let stage = st.stages.get(&position).ok_or_else(|| {
                Error::invalid_state(format!("no module at position {}", position))
            })?;
            match stage.kind {
                kind if kind.is_filter() => {
                    let table = stage.table.as_ref().ok_or_else(|| {
                        Error::invalid_state(format!("{} at {} has no table", kind, position))
                    })?;
                    let passed = lookup(kind, table, packet);
                    mask = Some(match mask {
                        None => passed,
                        Some(mut m) => {
                            m.intersect_with(&passed);
                            m
                        }
                    });
                    position += 1;
                }
                ModuleKind::Bitscan => position += 1,
                ModuleKind::Action => {
                    let id = match &mask {
                        Some(m) => m.lowest(),
                        None => stage.actions.keys().next().copied(),
                    };
                    break id.and_then(|id| stage.actions.get(&id).map(|a| (position, id, *a)));
                }
                ModuleKind::DefaultAction => break None,
                kind => {
                    return Err(Error::invalid_state(format!(
                        "unexpected {} at position {}",
                        kind, position
                    )))
                }
            }
        };

        let len = packet.len;
        match winner {
            Some((position, id, action)) => {
                if let Some(stage) = st.stages.get_mut(&position) {
                    stage
                        .counters
                        .entry(id)
                        .or_default()
                        .add(Counter::new(1, len));
                }
                Ok(Verdict {
                    action,
                    rule: Some(id),
                })
            }
            None => {
                let action = st.defaults.get(&direction).copied().unwrap_or_default();
                st.default_counters
                    .entry(direction)
                    .or_default()
                    .add(Counter::new(1, len));
                Ok(Verdict { action, rule: None })
            }
        }
    }
}

fn lookup(kind: ModuleKind, table: &MatchTable, packet: &Packet) -> RuleMask {
    match (kind, table) {
        (ModuleKind::Conntrack, MatchTable::Conntrack(t)) => t.lookup_exact(Some(&packet.conntrack)),
        (ModuleKind::IpSrc | ModuleKind::IpDst, MatchTable::Ip(t)) => {
            let ip = if kind == ModuleKind::IpSrc {
                packet.src
            } else {
                packet.dst
            };
            let mut mask = t.wildcard.clone();
            for (_, m) in t.entries.iter().filter(|(p, _)| p.contains(ip)) {
                mask.union_with(m);
            }
            mask
        }
        (ModuleKind::L4Proto, MatchTable::L4Proto(t)) => t.lookup_exact(Some(&packet.l4proto)),
        (ModuleKind::PortSrc, MatchTable::Port(t)) => t.lookup_exact(packet.sport.as_ref()),
        (ModuleKind::PortDst, MatchTable::Port(t)) => t.lookup_exact(packet.dport.as_ref()),
        (ModuleKind::TcpFlags, MatchTable::TcpFlags(t)) => {
            t.lookup_exact(packet.tcpflags.map(|f| f.bits()).as_ref())
        }
        _ => RuleMask::new(),
    }
}

fn table_fits(kind: ModuleKind, table: &MatchTable) -> bool {
    matches!(
        (kind, table),
        (ModuleKind::Conntrack, MatchTable::Conntrack(_))
            | (ModuleKind::IpSrc | ModuleKind::IpDst, MatchTable::Ip(_))
            | (ModuleKind::L4Proto, MatchTable::L4Proto(_))
            | (ModuleKind::PortSrc | ModuleKind::PortDst, MatchTable::Port(_))
            | (ModuleKind::TcpFlags, MatchTable::TcpFlags(_))
    )
}

impl Dataplane for SimDataplane {
    fn load(
        &self,
        kind: ModuleKind,
        position: u32,
        direction: Option<Direction>,
    ) -> Result<Box<dyn Module>> {
        let mut st = self.state();
        if st.fail_load.contains(&kind) {
            return Err(Error::reload(kind, "load failure injected"));
        }
        if let Some(busy) = st.stages.get(&position) {
            return Err(Error::invalid_state(format!(
                "position {} already used by {}",
                position, busy.kind
            )));
        }
        st.next_handle += 1;
        st.loads += 1;
        let handle = st.next_handle;
        st.stages.insert(
            position,
            Stage {
                handle,
                kind,
                direction,
                table: None,
                actions: BTreeMap::new(),
                counters: BTreeMap::new(),
            },
        );
        Ok(Box::new(SimModule {
            handle,
            kind,
            position,
            state: self.state.clone(),
        }))
    }
}

struct SimModule {
    handle: u64,
    kind: ModuleKind,
    position: u32,
    state: Arc<Mutex<SimState>>,
}

impl SimModule {
    fn require_kind(&self, kind: ModuleKind, op: &str) -> Result<()> {
        if self.kind == kind {
            Ok(())
        } else {
            Err(Error::invalid_state(format!(
                "{} module doesn't support {}",
                self.kind, op
            )))
        }
    }

    fn with_stage<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Stage) -> T,
    {
        let mut st = lock(&self.state);
        match st.stages.get_mut(&self.position) {
            Some(stage) if stage.handle == self.handle => Ok(f(stage)),
            _ => Err(Error::invalid_state(format!(
                "{} at {} is not loaded",
                self.kind, self.position
            ))),
        }
    }
}

impl Module for SimModule {
    fn kind(&self) -> ModuleKind {
        self.kind
    }

    fn position(&self) -> u32 {
        self.position
    }

    fn update_map(&mut self, table: &MatchTable) -> Result<()> {
        if !table_fits(self.kind, table) {
            return Err(Error::invalid_state(format!(
                "{} module can't load this table",
                self.kind
            )));
        }
        self.with_stage(|stage| stage.table = Some(table.clone()))
    }

    fn update_table_value(&mut self, rule_id: u32, action: Action) -> Result<()> {
        self.require_kind(ModuleKind::Action, "action table updates")?;
        self.with_stage(|stage| {
            stage.actions.insert(rule_id, action);
        })
    }

    fn update_default(&mut self, direction: Direction, action: Action) -> Result<()> {
        self.require_kind(ModuleKind::DefaultAction, "default action updates")?;
        lock(&self.state).pending_defaults.insert(direction, action);
        Ok(())
    }

    fn flush_counters(&mut self, rule_id: u32) -> Result<()> {
        self.require_kind(ModuleKind::Action, "counters")?;
        self.with_stage(|stage| {
            stage.counters.remove(&rule_id);
        })
    }

    fn flush_default_counters(&mut self, direction: Direction) -> Result<()> {
        self.require_kind(ModuleKind::DefaultAction, "default counters")?;
        lock(&self.state).default_counters.remove(&direction);
        Ok(())
    }

    fn fetch_counters(&mut self, rule_id: u32) -> Result<Counter> {
        self.require_kind(ModuleKind::Action, "counters")?;
        self.with_stage(|stage| stage.counters.remove(&rule_id).unwrap_or_default())
    }

    fn fetch_default_counters(&mut self, direction: Direction) -> Result<Counter> {
        self.require_kind(ModuleKind::DefaultAction, "default counters")?;
        Ok(lock(&self.state)
            .default_counters
            .remove(&direction)
            .unwrap_or_default())
    }

    fn update_hop(&mut self, _slot: u32, target: EntryPoint, direction: Direction) -> Result<()> {
        self.require_kind(ModuleKind::Forwarder, "hops")?;
        lock(&self.state).pending_hops.insert(direction, target);
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        let mut st = lock(&self.state);
        *st.reloads.entry(self.kind).or_default() += 1;
        if st.fail_reload.contains(&self.kind) {
            return Err(Error::reload(self.kind, "reload failure injected"));
        }
        match self.kind {
            ModuleKind::Forwarder => {
                let pending = std::mem::take(&mut st.pending_hops);
                st.hops.extend(pending);
            }
            ModuleKind::DefaultAction => {
                let pending = std::mem::take(&mut st.pending_defaults);
                st.defaults.extend(pending);
            }
            _ => {}
        }
        Ok(())
    }
}

impl Drop for SimModule {
    fn drop(&mut self) {
        let mut st = lock(&self.state);
        if st
            .stages
            .get(&self.position)
            .map_or(false, |s| s.handle == self.handle)
        {
            st.stages.remove(&self.position);
        }
    }
}

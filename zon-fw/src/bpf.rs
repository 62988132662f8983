//! Dataplane made of XDP programs chained with tail calls.
//!
//! Every module is a separate program instance loaded from the same
//! object file with its position and direction patched in. The programs
//! jump to each other through the pinned `ZFWX_PIPELINE` program table,
//! the parser being the only one attached to the interface.

use crate::bitmap::RuleMask;
use crate::error::{Error, Result};
use crate::helpers;
use crate::logging;
use crate::module::{Counter, Dataplane, EntryPoint, FieldTable, MatchTable, Module, ModuleKind};
use crate::prog::Prog;
use crate::rule::{Action, Direction, IpPrefix};
use crate::runvars::RunVars;
use anyhow::Context;
use aya::{
    maps::{
        lpm_trie::{Key, LpmTrie},
        Array, HashMap, Map, PerCpuArray, PerCpuValues, ProgramArray,
    },
    programs::{Xdp, XdpFlags},
    util::nr_cpus,
    Ebpf, EbpfLoader, Pod,
};
use log::{debug, info, warn};
use std::{
    fmt::Display,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};
use zon_fw_common::{globals, maps, RuleBitmap, RuleCounters, HOPS_PER_DIRECTION, MAX_RULES};

/// Loads the modules of the firewall attached to one interface.
pub struct AyaDataplane {
    ifname: String,
    object: Vec<u8>,
    pin_path: PathBuf,
    flags: XdpFlags,
    live: Arc<AtomicUsize>,
}

impl AyaDataplane {
    pub fn new<P: AsRef<Path>>(
        ifname: &str,
        object: P,
        flags: XdpFlags,
    ) -> std::result::Result<Self, anyhow::Error> {
        helpers::ifindex(ifname)?;
        let object = object.as_ref();
        let bytes = std::fs::read(object)
            .context(format!("Can't read eBPF object {}", object.display()))?;
        let pin_path = helpers::maps_bpffs(ifname)?;

        info!(
            "[{}] Using {} ({} bytes), maps pinned at {}",
            ifname,
            object.display(),
            bytes.len(),
            pin_path.display()
        );

        Ok(Self {
            ifname: ifname.to_string(),
            object: bytes,
            pin_path,
            flags,
            live: Arc::new(AtomicUsize::new(0)),
        })
    }
}

impl Dataplane for AyaDataplane {
    fn load(
        &self,
        kind: ModuleKind,
        position: u32,
        direction: Option<Direction>,
    ) -> Result<Box<dyn Module>> {
        let dir = direction.map_or(globals::SHARED_DIRECTION, |d| d.index());
        let mut ebpf = EbpfLoader::new()
            .map_pin_path(&self.pin_path)
            .set_global(globals::MODULE_POSITION, &position, true)
            .set_global(globals::MODULE_DIRECTION, &dir, true)
            .load(&self.object)
            .map_err(|e| Error::reload(kind, e))?;

        logging::attach_ebpf_logger(&mut ebpf, kind.name());

        xdp(&mut ebpf, kind)?
            .load()
            .map_err(|e| Error::reload(kind, e))?;

        let link = match kind {
            ModuleKind::Parser => Some(Prog::new(&self.ifname).map_err(|e| Error::reload(kind, e))?),
            _ => None,
        };

        self.live.fetch_add(1, Ordering::AcqRel);
        let mut module = AyaModule {
            kind,
            position,
            ebpf,
            link,
            flags: self.flags,
            attached: false,
            pending_hops: vec![],
            pending_defaults: vec![],
            live: self.live.clone(),
            registered: false,
        };
        module.register()?;

        debug!(
            "[{}] Loaded {} at position {}",
            self.ifname, kind, position
        );
        Ok(Box::new(module))
    }
}

struct AyaModule {
    kind: ModuleKind,
    position: u32,
    ebpf: Ebpf,
    /// Parser only
    link: Option<Prog>,
    flags: XdpFlags,
    attached: bool,
    /// Forwarder only, (index, position)
    pending_hops: Vec<(u32, u32)>,
    /// Default action only
    pending_defaults: Vec<(Direction, Action)>,
    live: Arc<AtomicUsize>,
    registered: bool,
}

fn xdp(ebpf: &mut Ebpf, kind: ModuleKind) -> Result<&mut Xdp> {
    ebpf.program_mut(kind.name())
        .ok_or_else(|| Error::reload(kind, "no such program in the object"))?
        .try_into()
        .map_err(|e| Error::reload(kind, e))
}

fn map_mut<'a>(ebpf: &'a mut Ebpf, kind: ModuleKind, name: &str) -> Result<&'a mut Map> {
    ebpf.map_mut(name)
        .ok_or_else(|| Error::reload(kind, format!("no map {}", name)))
}

fn map_error<E: Display>(kind: ModuleKind, name: &'static str) -> impl Fn(E) -> Error {
    move |e| Error::reload(kind, format!("map {}, {}", name, e))
}

fn bitmap(kind: ModuleKind, mask: &RuleMask) -> Result<RuleBitmap> {
    mask.to_bitmap().ok_or_else(|| {
        Error::invalid_state(format!("{} rule ids exceed {}", kind, MAX_RULES))
    })
}

fn zeroed(kind: ModuleKind) -> Result<PerCpuValues<RuleCounters>> {
    let cpus = nr_cpus().map_err(|(msg, e)| Error::reload(kind, format!("{}, {}", msg, e)))?;
    PerCpuValues::try_from(vec![RuleCounters::default(); cpus]).map_err(|e| Error::reload(kind, e))
}

fn sum(values: &PerCpuValues<RuleCounters>) -> Counter {
    values.iter().fold(Counter::default(), |mut total, c| {
        total.add(Counter::new(c.packets, c.bytes));
        total
    })
}

/// The trie returns only the longest matching prefix, so each entry
/// carries the rules of every shorter prefix containing it.
pub(crate) fn lpm_entries(table: &FieldTable<IpPrefix>) -> Vec<(IpPrefix, RuleMask)> {
    table
        .entries
        .keys()
        .map(|prefix| {
            let mut mask = RuleMask::new();
            for (_, m) in table
                .entries
                .iter()
                .filter(|(other, _)| other.len <= prefix.len && other.contains(prefix.addr))
            {
                mask.union_with(m);
            }
            (*prefix, mask)
        })
        .collect()
}

impl AyaModule {
    /// Places the program in the tail call table at its position.
    fn register(&mut self) -> Result<()> {
        let (kind, position) = (self.kind, self.position);
        let fd = xdp(&mut self.ebpf, kind)?
            .fd()
            .map_err(|e| Error::reload(kind, e))?
            .try_clone()
            .map_err(|e| Error::reload(kind, e))?;
        let map = map_mut(&mut self.ebpf, kind, maps::PIPELINE)?;
        let mut table = ProgramArray::try_from(map).map_err(map_error(kind, maps::PIPELINE))?;
        table
            .set(position, &fd, 0)
            .map_err(map_error(kind, maps::PIPELINE))?;
        self.registered = true;
        Ok(())
    }

    fn fill_hash<K: Pod, I>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, RuleMask)>,
    {
        let kind = self.kind;
        let map = map_mut(&mut self.ebpf, kind, maps::MATCH)?;
        let mut map: HashMap<_, K, RuleBitmap> =
            HashMap::try_from(map).map_err(map_error(kind, maps::MATCH))?;
        for (key, mask) in entries {
            map.insert(key, bitmap(kind, &mask)?, 0)
                .map_err(map_error(kind, maps::MATCH))?;
        }
        Ok(())
    }

    fn fill_lpm(&mut self, table: &FieldTable<IpPrefix>) -> Result<()> {
        let kind = self.kind;
        let map = map_mut(&mut self.ebpf, kind, maps::MATCH)?;
        let mut trie: LpmTrie<_, [u8; 4], RuleBitmap> =
            LpmTrie::try_from(map).map_err(map_error(kind, maps::MATCH))?;
        for (prefix, mask) in lpm_entries(table) {
            let key = Key::new(prefix.len as u32, prefix.addr.octets());
            trie.insert(&key, bitmap(kind, &mask)?, 0)
                .map_err(map_error(kind, maps::MATCH))?;
        }
        Ok(())
    }

    fn fill_flags(&mut self, table: &FieldTable<u8>) -> Result<()> {
        let kind = self.kind;
        let map = map_mut(&mut self.ebpf, kind, maps::MATCH)?;
        let mut flags: Array<_, RuleBitmap> =
            Array::try_from(map).map_err(map_error(kind, maps::MATCH))?;
        for (combo, mask) in &table.entries {
            flags
                .set(*combo as u32, bitmap(kind, mask)?, 0)
                .map_err(map_error(kind, maps::MATCH))?;
        }
        Ok(())
    }

    fn set_wildcard(&mut self, mask: &RuleMask) -> Result<()> {
        let kind = self.kind;
        let map = map_mut(&mut self.ebpf, kind, maps::WILDCARD)?;
        let mut wildcard: Array<_, RuleBitmap> =
            Array::try_from(map).map_err(map_error(kind, maps::WILDCARD))?;
        wildcard
            .set(0, bitmap(kind, mask)?, 0)
            .map_err(map_error(kind, maps::WILDCARD))
    }

    fn counters(&mut self, name: &'static str, index: u32, reset: bool) -> Result<Counter> {
        let kind = self.kind;
        let map = map_mut(&mut self.ebpf, kind, name)?;
        let mut counters: PerCpuArray<_, RuleCounters> =
            PerCpuArray::try_from(map).map_err(map_error(kind, name))?;
        let total = if reset {
            Counter::default()
        } else {
            sum(&counters.get(&index, 0).map_err(map_error(kind, name))?)
        };
        counters
            .set(index, zeroed(kind)?, 0)
            .map_err(map_error(kind, name))?;
        Ok(total)
    }

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

    fn write_hops(&mut self) -> Result<()> {
        let kind = self.kind;
        let hops = std::mem::take(&mut self.pending_hops);
        let map = map_mut(&mut self.ebpf, kind, maps::HOPS)?;
        let mut map: Array<_, u32> = Array::try_from(map).map_err(map_error(kind, maps::HOPS))?;
        for (index, position) in hops {
            map.set(index, position, 0)
                .map_err(map_error(kind, maps::HOPS))?;
        }
        Ok(())
    }

    fn write_defaults(&mut self) -> Result<()> {
        let kind = self.kind;
        let defaults = std::mem::take(&mut self.pending_defaults);
        let map = map_mut(&mut self.ebpf, kind, maps::DEFAULT)?;
        let mut map: Array<_, u8> = Array::try_from(map).map_err(map_error(kind, maps::DEFAULT))?;
        for (direction, action) in defaults {
            map.set(direction.index(), action.code(), 0)
                .map_err(map_error(kind, maps::DEFAULT))?;
        }
        Ok(())
    }

    fn publish_runvars(&mut self) -> Result<()> {
        let kind = self.kind;
        let live = self.live.load(Ordering::Acquire);
        let mut runvars = RunVars::new(&mut self.ebpf).map_err(|e| Error::reload(kind, e))?;
        runvars.set_defaults();
        if !runvars.set_nr_modules(live) {
            return Err(Error::reload(kind, "can't publish the number of modules"));
        }
        debug!("Runvars version {}, {} modules", runvars.version(), live);
        Ok(())
    }

    fn attach(&mut self) -> Result<()> {
        let kind = self.kind;
        if self.attached {
            return Ok(());
        }
        if let Some(link) = self.link.as_mut() {
            let program = xdp(&mut self.ebpf, kind)?;
            link.attach(program, self.flags)
                .map_err(|e| Error::reload(kind, e))?;
            info!("[{}] Parser attached", link.ifname());
        }
        self.attached = true;
        Ok(())
    }
}

impl Module for AyaModule {
    fn kind(&self) -> ModuleKind {
        self.kind
    }

    fn position(&self) -> u32 {
        self.position
    }

    fn update_map(&mut self, table: &MatchTable) -> Result<()> {
        if !self.kind.is_filter() {
            return Err(Error::invalid_state(format!(
                "{} module doesn't support map updates",
                self.kind
            )));
        }
        match table {
            MatchTable::Conntrack(t) => self.fill_hash(
                t.entries
                    .iter()
                    .map(|(state, mask)| (state.code(), mask.clone())),
            )?,
            MatchTable::Ip(t) => self.fill_lpm(t)?,
            MatchTable::L4Proto(t) => {
                self.fill_hash(t.entries.iter().map(|(proto, mask)| (*proto, mask.clone())))?
            }
            // The programs read the ports in network byte order.
            MatchTable::Port(t) => self.fill_hash(
                t.entries
                    .iter()
                    .map(|(port, mask)| (port.to_be(), mask.clone())),
            )?,
            MatchTable::TcpFlags(t) => self.fill_flags(t)?,
        }
        self.set_wildcard(table.wildcard())
    }

    fn update_table_value(&mut self, rule_id: u32, action: Action) -> Result<()> {
        self.require_kind(ModuleKind::Action, "action table updates")?;
        let kind = self.kind;
        let map = map_mut(&mut self.ebpf, kind, maps::ACTIONS)?;
        let mut actions: Array<_, u8> =
            Array::try_from(map).map_err(map_error(kind, maps::ACTIONS))?;
        actions
            .set(rule_id, action.code(), 0)
            .map_err(map_error(kind, maps::ACTIONS))
    }

    fn update_default(&mut self, direction: Direction, action: Action) -> Result<()> {
        self.require_kind(ModuleKind::DefaultAction, "default action updates")?;
        self.pending_defaults.push((direction, action));
        Ok(())
    }

    fn flush_counters(&mut self, rule_id: u32) -> Result<()> {
        self.require_kind(ModuleKind::Action, "counters")?;
        self.counters(maps::COUNTERS, rule_id, true).map(|_| ())
    }

    fn flush_default_counters(&mut self, direction: Direction) -> Result<()> {
        self.require_kind(ModuleKind::DefaultAction, "default counters")?;
        self.counters(maps::DEFAULT_COUNTERS, direction.index(), true)
            .map(|_| ())
    }

    fn fetch_counters(&mut self, rule_id: u32) -> Result<Counter> {
        self.require_kind(ModuleKind::Action, "counters")?;
        self.counters(maps::COUNTERS, rule_id, false)
    }

    fn fetch_default_counters(&mut self, direction: Direction) -> Result<Counter> {
        self.require_kind(ModuleKind::DefaultAction, "default counters")?;
        self.counters(maps::DEFAULT_COUNTERS, direction.index(), false)
    }

    fn update_hop(&mut self, slot: u32, target: EntryPoint, direction: Direction) -> Result<()> {
        self.require_kind(ModuleKind::Forwarder, "hops")?;
        if slot >= HOPS_PER_DIRECTION {
            return Err(Error::invalid_state(format!("no forwarder hop {}", slot)));
        }
        self.pending_hops
            .push((direction.index() * HOPS_PER_DIRECTION + slot, target.position));
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        match self.kind {
            ModuleKind::Forwarder => self.write_hops()?,
            ModuleKind::DefaultAction => self.write_defaults()?,
            ModuleKind::Parser => {
                self.publish_runvars()?;
                self.attach()?;
            }
            _ => {}
        }
        self.register()
    }
}

impl Drop for AyaModule {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        if !self.registered {
            return;
        }
        let (kind, position) = (self.kind, self.position);
        let table = map_mut(&mut self.ebpf, kind, maps::PIPELINE).and_then(|map| {
            ProgramArray::try_from(map).map_err(map_error(kind, maps::PIPELINE))
        });
        match table.and_then(|mut t| {
            t.clear_index(&position)
                .map_err(map_error(kind, maps::PIPELINE))
        }) {
            Ok(()) => debug!("Unloaded {} from position {}", kind, position),
            Err(e) => warn!("Can't release position {} of {}, {}", position, kind, e),
        }
    }
}

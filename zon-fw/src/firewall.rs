use crate::chain::Chain;
use crate::compiler::{Generation, NO_CHAIN_ENTRY};
use crate::error::{Error, Result};
use crate::module::{Counter, Dataplane, ModuleKey, ModuleKind, CHAIN_HOP};
use crate::registry::Programs;
use crate::rule::{Action, Direction, MatchFields, Rule};
use log::{error, info};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex, MutexGuard,
};
use zon_fw_common::{DEFAULT_ACTION_POSITION, FORWARDER_POSITION, PARSER_POSITION};

/// State of a firewall instance used by both chains.
pub struct Shared {
    name: String,
    dataplane: Box<dyn Dataplane>,
    programs: Mutex<Programs>,
    interactive: AtomicBool,
    conntrack_active: AtomicBool,
}

impl Shared {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dataplane(&self) -> &dyn Dataplane {
        self.dataplane.as_ref()
    }

    /// Locks the module registry. The guard must be held across a whole
    /// chain update.
    pub fn programs(&self) -> Result<MutexGuard<'_, Programs>> {
        self.programs
            .lock()
            .map_err(|_| Error::invalid_state("programs lock poisoned"))
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive.load(Ordering::Acquire)
    }

    pub fn is_conntrack_active(&self) -> bool {
        self.conntrack_active.load(Ordering::Acquire)
    }
}

/// A firewall instance: the shared parser, forwarder and default action
/// modules plus one chain for each direction.
pub struct Firewall {
    shared: Shared,
    ingress: Mutex<Chain>,
    egress: Mutex<Chain>,
}

impl Firewall {
    /// Loads the shared modules. Until the first chain update the forwarder
    /// sends every packet to the default action, drop for both directions.
    pub fn new<S: AsRef<str>>(
        name: S,
        dataplane: Box<dyn Dataplane>,
        interactive: bool,
    ) -> Result<Self> {
        let name = name.as_ref().to_string();
        let mut programs = Programs::new();

        let parser = dataplane.load(ModuleKind::Parser, PARSER_POSITION, None)?;
        let mut forwarder = dataplane.load(ModuleKind::Forwarder, FORWARDER_POSITION, None)?;
        let mut default_action =
            dataplane.load(ModuleKind::DefaultAction, DEFAULT_ACTION_POSITION, None)?;

        for direction in Direction::ALL {
            default_action.update_default(direction, Action::default())?;
            forwarder.update_hop(CHAIN_HOP, NO_CHAIN_ENTRY, direction)?;
        }
        default_action.reload()?;
        forwarder.reload()?;

        programs.insert(ModuleKey::shared(ModuleKind::Parser), parser);
        programs.insert(ModuleKey::shared(ModuleKind::Forwarder), forwarder);
        programs.insert(ModuleKey::shared(ModuleKind::DefaultAction), default_action);
        programs.shared_mut(ModuleKind::Parser)?.reload()?;

        info!(
            "[{}] Firewall ready in {} mode",
            name,
            if interactive { "interactive" } else { "batch" }
        );

        Ok(Self {
            shared: Shared {
                name,
                dataplane,
                programs: Mutex::new(programs),
                interactive: AtomicBool::new(interactive),
                conntrack_active: AtomicBool::new(false),
            },
            ingress: Mutex::new(Chain::new(Direction::Ingress)),
            egress: Mutex::new(Chain::new(Direction::Egress)),
        })
    }

    pub fn name(&self) -> &str {
        self.shared.name()
    }

    pub fn is_interactive(&self) -> bool {
        self.shared.is_interactive()
    }

    /// In batch mode the chains are compiled only by [Firewall::apply_rules].
    pub fn set_interactive(&self, interactive: bool) {
        self.shared.interactive.store(interactive, Ordering::Release);
    }

    pub fn is_conntrack_active(&self) -> bool {
        self.shared.is_conntrack_active()
    }

    pub fn set_conntrack_active(&self, active: bool) {
        self.shared.conntrack_active.store(active, Ordering::Release);
    }

    fn chain(&self, direction: Direction) -> Result<MutexGuard<'_, Chain>> {
        let chain = match direction {
            Direction::Ingress => &self.ingress,
            Direction::Egress => &self.egress,
        };
        chain
            .lock()
            .map_err(|_| Error::invalid_state(format!("{} chain lock poisoned", direction)))
    }

    pub fn append(
        &self,
        direction: Direction,
        fields: MatchFields,
        action: Option<Action>,
        description: &str,
    ) -> Result<u32> {
        self.chain(direction)?
            .append(&self.shared, fields, action, description)
    }

    pub fn insert(&self, direction: Direction, rule: Rule) -> Result<()> {
        self.chain(direction)?.insert(&self.shared, rule)
    }

    pub fn replace(
        &self,
        direction: Direction,
        id: u32,
        fields: MatchFields,
        action: Action,
        description: &str,
    ) -> Result<()> {
        self.chain(direction)?
            .replace(&self.shared, id, fields, action, description)
    }

    pub fn remove(&self, direction: Direction, id: u32) -> Result<()> {
        self.chain(direction)?.remove(&self.shared, id)
    }

    pub fn clear(&self, direction: Direction) -> Result<()> {
        self.chain(direction)?.clear(&self.shared)
    }

    pub fn rule(&self, direction: Direction, id: u32) -> Result<Rule> {
        self.chain(direction)?.get(id).cloned()
    }

    /// Present rules followed by the default policy.
    pub fn rules(&self, direction: Direction) -> Result<Vec<Rule>> {
        Ok(self.chain(direction)?.list())
    }

    pub fn default_action(&self, direction: Direction) -> Result<Action> {
        Ok(self.chain(direction)?.default_action())
    }

    pub fn set_default_action(&self, direction: Direction, action: Action) -> Result<()> {
        self.chain(direction)?
            .set_default_action(&self.shared, action)
    }

    /// Compiles the chain if it changed. Failures are logged and reported
    /// as false, the previous pipeline stays in place.
    pub fn apply_rules(&self, direction: Direction) -> bool {
        match self
            .chain(direction)
            .and_then(|mut chain| chain.apply_rules(&self.shared))
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "[{}] Can't apply the {} chain rules, {}",
                    self.name(),
                    direction,
                    e
                );
                false
            }
        }
    }

    pub fn apply_all(&self) -> bool {
        Direction::ALL
            .iter()
            .fold(true, |ok, dir| self.apply_rules(*dir) && ok)
    }

    pub fn counters(&self, direction: Direction, id: u32) -> Result<Counter> {
        self.chain(direction)?.counters(&self.shared, id)
    }

    /// Counters of all rules, the last entry is the default action.
    pub fn all_counters(&self, direction: Direction) -> Result<Vec<(u32, Counter)>> {
        self.chain(direction)?.all_counters(&self.shared)
    }

    pub fn reset_counters(&self, direction: Direction) -> bool {
        match self
            .chain(direction)
            .and_then(|mut chain| chain.reset_counters(&self.shared))
        {
            Ok(()) => true,
            Err(e) => {
                error!(
                    "[{}] Flushing {} counters error, {}",
                    self.name(),
                    direction,
                    e
                );
                false
            }
        }
    }

    pub fn generation(&self, direction: Direction) -> Result<Option<Generation>> {
        Ok(self.chain(direction)?.generation().cloned())
    }

    pub fn is_dirty(&self, direction: Direction) -> Result<bool> {
        Ok(self.chain(direction)?.is_dirty())
    }

    /// Registered modules of a chain sorted by position.
    pub fn layout(&self, direction: Direction) -> Result<Vec<(ModuleKind, u32)>> {
        Ok(self.shared.programs()?.layout(direction))
    }

    pub fn nr_modules(&self) -> Result<usize> {
        Ok(self.shared.programs()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::EntryPoint;
    use crate::rule::fields_from_pairs;
    use crate::sim::{Packet, SimDataplane, Verdict};
    use std::net::Ipv4Addr;
    use zon_fw_common::{TcpFlags, MAX_RULES};

    fn firewall(interactive: bool) -> (SimDataplane, Firewall) {
        let sim = SimDataplane::new();
        let fw = Firewall::new("fw0", Box::new(sim.clone()), interactive).unwrap();
        (sim, fw)
    }

    fn fields(pairs: &[(&str, &str)]) -> MatchFields {
        fields_from_pairs(pairs.iter().copied()).unwrap()
    }

    fn from(src: [u8; 4], len: u64) -> Packet {
        Packet {
            src: Ipv4Addr::from(src),
            len,
            ..Default::default()
        }
    }

    fn kinds(layout: &[(ModuleKind, u32)]) -> Vec<ModuleKind> {
        layout.iter().map(|(k, _)| *k).collect()
    }

    #[test]
    fn new_firewall_defaults_to_drop() {
        let (sim, fw) = firewall(true);
        assert_eq!(fw.nr_modules().unwrap(), 3);
        assert_eq!(sim.hop(Direction::Ingress), Some(NO_CHAIN_ENTRY));
        assert_eq!(sim.hop(Direction::Egress), Some(NO_CHAIN_ENTRY));
        assert!(fw.generation(Direction::Ingress).unwrap().is_none());

        let verdict = sim
            .classify(Direction::Ingress, &Packet::default())
            .unwrap();
        assert_eq!(
            verdict,
            Verdict {
                action: Action::Drop,
                rule: None
            }
        );
    }

    #[test]
    fn one_module_per_constrained_field_in_order() {
        let (_sim, fw) = firewall(false);
        fw.append(
            Direction::Ingress,
            fields(&[("tcpflags", "SYN"), ("dport", "22"), ("l4proto", "tcp")]),
            Some(Action::Forward),
            "",
        )
        .unwrap();
        fw.append(
            Direction::Ingress,
            fields(&[("dst", "192.168.1.0/24"), ("ct", "established")]),
            Some(Action::Forward),
            "",
        )
        .unwrap();
        assert!(fw.apply_rules(Direction::Ingress));

        let layout = fw.layout(Direction::Ingress).unwrap();
        assert_eq!(
            kinds(&layout),
            vec![
                ModuleKind::Conntrack,
                ModuleKind::IpDst,
                ModuleKind::L4Proto,
                ModuleKind::PortDst,
                ModuleKind::TcpFlags,
                ModuleKind::Bitscan,
                ModuleKind::Action,
            ]
        );
        let positions = layout.iter().map(|(_, p)| *p).collect::<Vec<_>>();
        assert_eq!(positions, (3..10).collect::<Vec<_>>());

        let generation = fw.generation(Direction::Ingress).unwrap().unwrap();
        assert_eq!(generation.entry.kind, ModuleKind::Conntrack);
        assert_eq!(generation.rules, 2);
        assert!(fw.layout(Direction::Egress).unwrap().is_empty());
    }

    #[test]
    fn no_constraints_compiles_bitscan_and_action() {
        let (sim, fw) = firewall(true);
        fw.append(Direction::Egress, MatchFields::default(), Some(Action::Log), "")
            .unwrap();
        let generation = fw.generation(Direction::Egress).unwrap().unwrap();
        assert_eq!(
            generation.entry,
            EntryPoint {
                kind: ModuleKind::Bitscan,
                position: 21
            }
        );
        assert_eq!(kinds(&generation.layout), vec![ModuleKind::Bitscan, ModuleKind::Action]);

        let verdict = sim.classify(Direction::Egress, &Packet::default()).unwrap();
        assert_eq!(verdict.action, Action::Log);
        assert_eq!(verdict.rule, Some(0));
    }

    #[test]
    fn end_to_end_lowest_rule_wins() {
        let (sim, fw) = firewall(true);
        fw.append(
            Direction::Ingress,
            fields(&[("src", "10.0.0.1")]),
            Some(Action::Forward),
            "admin",
        )
        .unwrap();
        fw.append(Direction::Ingress, MatchFields::default(), None, "")
            .unwrap();

        // Two compilations, the second one used the other slot.
        let layout = fw.layout(Direction::Ingress).unwrap();
        assert_eq!(
            layout,
            vec![
                (ModuleKind::IpSrc, 12),
                (ModuleKind::Bitscan, 13),
                (ModuleKind::Action, 14)
            ]
        );
        let occupied = sim
            .positions()
            .into_iter()
            .map(|(pos, _, _)| pos)
            .collect::<Vec<_>>();
        assert_eq!(occupied, vec![0, 1, 2, 12, 13, 14]);

        let admin = sim
            .classify(Direction::Ingress, &from([10, 0, 0, 1], 100))
            .unwrap();
        assert_eq!(admin.action, Action::Forward);
        assert_eq!(admin.rule, Some(0));

        let other = sim
            .classify(Direction::Ingress, &from([10, 0, 0, 2], 100))
            .unwrap();
        assert_eq!(other.action, Action::Drop);
        assert_eq!(other.rule, Some(1));

        // Egress is still served by the default action.
        let egress = sim
            .classify(Direction::Egress, &from([10, 0, 0, 1], 100))
            .unwrap();
        assert_eq!(egress.rule, None);
    }

    #[test]
    fn tcp_flags_and_ports() {
        let (sim, fw) = firewall(true);
        fw.append(
            Direction::Ingress,
            fields(&[("l4proto", "tcp"), ("dport", "22"), ("tcpflags", "SYN !ACK")]),
            Some(Action::Forward),
            "ssh",
        )
        .unwrap();

        let mut syn = Packet {
            l4proto: 6,
            sport: Some(40000),
            dport: Some(22),
            tcpflags: Some(TcpFlags::SYN),
            ..Default::default()
        };
        assert_eq!(
            sim.classify(Direction::Ingress, &syn).unwrap().rule,
            Some(0)
        );

        syn.tcpflags = Some(TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(sim.classify(Direction::Ingress, &syn).unwrap().rule, None);

        syn.tcpflags = Some(TcpFlags::SYN);
        syn.dport = Some(23);
        assert_eq!(sim.classify(Direction::Ingress, &syn).unwrap().rule, None);
    }

    #[test]
    fn apply_twice_is_idempotent() {
        let (sim, fw) = firewall(false);
        fw.append(Direction::Ingress, fields(&[("sport", "53")]), Some(Action::Forward), "")
            .unwrap();
        assert!(fw.is_dirty(Direction::Ingress).unwrap());
        assert!(fw.apply_rules(Direction::Ingress));
        assert!(!fw.is_dirty(Direction::Ingress).unwrap());

        let first = fw.generation(Direction::Ingress).unwrap().unwrap();
        let loads = sim.loads();
        let reloads = [ModuleKind::Parser, ModuleKind::Forwarder].map(|k| sim.reloads(k));

        assert!(fw.apply_rules(Direction::Ingress));
        let second = fw.generation(Direction::Ingress).unwrap().unwrap();
        assert_eq!(first.entry, second.entry);
        assert_eq!(first.layout, second.layout);
        assert_eq!(sim.loads(), loads);
        assert_eq!(
            [ModuleKind::Parser, ModuleKind::Forwarder].map(|k| sim.reloads(k)),
            reloads
        );
    }

    #[test]
    fn batch_mode_defers_compilation() {
        let (sim, fw) = firewall(false);
        assert!(!fw.is_interactive());
        fw.append(Direction::Ingress, fields(&[("src", "10.0.0.0/8")]), Some(Action::Forward), "")
            .unwrap();
        assert!(fw.generation(Direction::Ingress).unwrap().is_none());
        assert_eq!(
            sim.classify(Direction::Ingress, &from([10, 1, 1, 1], 60))
                .unwrap()
                .rule,
            None
        );
        assert!(!fw.reset_counters(Direction::Ingress));

        assert!(fw.apply_all());
        assert_eq!(
            sim.classify(Direction::Ingress, &from([10, 1, 1, 1], 60))
                .unwrap()
                .rule,
            Some(0)
        );
        // The empty egress chain gets its own pipeline.
        assert_eq!(
            kinds(&fw.layout(Direction::Egress).unwrap()),
            vec![ModuleKind::Bitscan, ModuleKind::Action]
        );
        assert_eq!(
            sim.classify(Direction::Egress, &from([10, 1, 1, 1], 60))
                .unwrap(),
            Verdict {
                action: Action::Drop,
                rule: None
            }
        );
    }

    #[test]
    fn counters_are_monotonic_across_generations() {
        let (sim, fw) = firewall(true);
        fw.append(Direction::Ingress, fields(&[("src", "10.0.0.1")]), Some(Action::Forward), "")
            .unwrap();
        for _ in 0..2 {
            sim.classify(Direction::Ingress, &from([10, 0, 0, 1], 100))
                .unwrap();
        }
        assert_eq!(
            fw.counters(Direction::Ingress, 0).unwrap(),
            Counter::new(2, 200)
        );
        // A fetch doesn't lose anything.
        assert_eq!(
            fw.counters(Direction::Ingress, 0).unwrap(),
            Counter::new(2, 200)
        );

        sim.classify(Direction::Ingress, &from([10, 0, 0, 1], 100))
            .unwrap();
        fw.append(Direction::Ingress, fields(&[("src", "10.0.0.2")]), Some(Action::Drop), "")
            .unwrap();
        sim.classify(Direction::Ingress, &from([10, 0, 0, 1], 50))
            .unwrap();
        assert_eq!(
            fw.counters(Direction::Ingress, 0).unwrap(),
            Counter::new(4, 350)
        );
        assert_eq!(fw.counters(Direction::Ingress, 1).unwrap(), Counter::default());

        sim.classify(Direction::Ingress, &from([172, 16, 0, 1], 64))
            .unwrap();
        let all = fw.all_counters(Direction::Ingress).unwrap();
        assert_eq!(
            all,
            vec![
                (0, Counter::new(4, 350)),
                (1, Counter::default()),
                (2, Counter::new(1, 64))
            ]
        );
    }

    #[test]
    fn remove_shifts_rules_and_counters() {
        let (sim, fw) = firewall(true);
        for (src, action) in [
            ("10.0.0.1", Action::Forward),
            ("10.0.0.2", Action::Drop),
            ("10.0.0.3", Action::Log),
        ] {
            fw.append(Direction::Ingress, fields(&[("src", src)]), Some(action), src)
                .unwrap();
        }
        sim.classify(Direction::Ingress, &from([10, 0, 0, 2], 10))
            .unwrap();
        for _ in 0..3 {
            sim.classify(Direction::Ingress, &from([10, 0, 0, 3], 10))
                .unwrap();
        }

        fw.remove(Direction::Ingress, 1).unwrap();
        let rules = fw.rules(Direction::Ingress).unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[1].id, 1);
        assert_eq!(rules[1].description, "10.0.0.3");
        assert_eq!(rules[1].action, Action::Log);
        assert_eq!(rules[2].description, "Default Policy");
        assert_eq!(rules[2].id, 2);

        assert_eq!(
            fw.counters(Direction::Ingress, 1).unwrap(),
            Counter::new(3, 30)
        );
        assert!(matches!(
            fw.counters(Direction::Ingress, 2),
            Err(Error::InvalidState(_))
        ));

        // Traffic of the moved rule is counted at its new position.
        let verdict = sim
            .classify(Direction::Ingress, &from([10, 0, 0, 3], 10))
            .unwrap();
        assert_eq!(verdict.rule, Some(1));
        assert_eq!(
            fw.counters(Direction::Ingress, 1).unwrap(),
            Counter::new(4, 40)
        );

        // Adding the removed rule back doesn't restore its counters.
        let id = fw
            .append(
                Direction::Ingress,
                fields(&[("src", "10.0.0.2")]),
                Some(Action::Drop),
                "10.0.0.2",
            )
            .unwrap();
        assert_eq!(id, 2);
        assert_eq!(fw.counters(Direction::Ingress, id).unwrap(), Counter::default());
    }

    #[test]
    fn remove_in_batch_mode_keeps_counters_in_place() {
        let (sim, fw) = firewall(false);
        for src in ["10.0.0.1", "10.0.0.2"] {
            fw.append(Direction::Ingress, fields(&[("src", src)]), Some(Action::Forward), "")
                .unwrap();
        }
        assert!(fw.apply_rules(Direction::Ingress));
        sim.classify(Direction::Ingress, &from([10, 0, 0, 2], 10))
            .unwrap();

        fw.remove(Direction::Ingress, 0).unwrap();
        // The live pipeline still has the old ids, nothing is read from it.
        sim.classify(Direction::Ingress, &from([10, 0, 0, 1], 10))
            .unwrap();
        assert_eq!(
            fw.counters(Direction::Ingress, 0).unwrap(),
            Counter::new(1, 10)
        );
    }

    #[test]
    fn remove_in_batch_mode_still_counts_lower_rules() {
        let (sim, fw) = firewall(false);
        for src in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            fw.append(Direction::Ingress, fields(&[("src", src)]), Some(Action::Forward), "")
                .unwrap();
        }
        assert!(fw.apply_rules(Direction::Ingress));
        sim.classify(Direction::Ingress, &from([10, 0, 0, 1], 10))
            .unwrap();

        fw.remove(Direction::Ingress, 1).unwrap();
        // Rule 0 keeps its position in the live pipeline
        sim.classify(Direction::Ingress, &from([10, 0, 0, 1], 20))
            .unwrap();
        sim.classify(Direction::Ingress, &from([10, 0, 0, 3], 40))
            .unwrap();
        assert_eq!(
            fw.counters(Direction::Ingress, 0).unwrap(),
            Counter::new(2, 30)
        );
        assert_eq!(fw.counters(Direction::Ingress, 1).unwrap(), Counter::default());

        assert!(fw.apply_rules(Direction::Ingress));
        assert_eq!(
            fw.counters(Direction::Ingress, 0).unwrap(),
            Counter::new(2, 30)
        );
        sim.classify(Direction::Ingress, &from([10, 0, 0, 3], 40))
            .unwrap();
        assert_eq!(
            fw.counters(Direction::Ingress, 1).unwrap(),
            Counter::new(1, 40)
        );
    }

    #[test]
    fn reset_counters_keeps_the_store_aligned() {
        let (sim, fw) = firewall(true);
        fw.insert(
            Direction::Ingress,
            Rule::new(2, fields(&[("dport", "80")]), Action::Forward),
        )
        .unwrap();
        fw.remove(Direction::Ingress, 2).unwrap();
        assert!(fw.reset_counters(Direction::Ingress));

        fw.insert(
            Direction::Ingress,
            Rule::new(0, fields(&[("src", "10.0.0.1")]), Action::Log),
        )
        .unwrap();
        fw.replace(Direction::Ingress, 0, fields(&[("src", "10.0.0.2")]), Action::Forward, "")
            .unwrap();
        sim.classify(Direction::Ingress, &from([10, 0, 0, 2], 100))
            .unwrap();
        assert_eq!(
            fw.counters(Direction::Ingress, 0).unwrap(),
            Counter::new(1, 100)
        );

        assert!(fw.reset_counters(Direction::Ingress));
        assert_eq!(fw.counters(Direction::Ingress, 0).unwrap(), Counter::default());
        fw.remove(Direction::Ingress, 0).unwrap();
        assert!(matches!(
            fw.counters(Direction::Ingress, 0),
            Err(Error::NotFound(0))
        ));
        assert!(matches!(
            fw.counters(Direction::Ingress, 1),
            Err(Error::InvalidState(_))
        ));
    }

    #[test]
    fn default_action_noop_does_not_reload() {
        let (sim, fw) = firewall(true);
        let reloads = sim.reloads(ModuleKind::DefaultAction);
        fw.set_default_action(Direction::Ingress, Action::Drop)
            .unwrap();
        assert_eq!(sim.reloads(ModuleKind::DefaultAction), reloads);

        fw.set_default_action(Direction::Ingress, Action::Forward)
            .unwrap();
        assert_eq!(sim.reloads(ModuleKind::DefaultAction), reloads + 1);
        assert_eq!(fw.default_action(Direction::Ingress).unwrap(), Action::Forward);
        assert_eq!(sim.default_action(Direction::Ingress), Some(Action::Forward));
        assert_eq!(sim.default_action(Direction::Egress), Some(Action::Drop));

        let verdict = sim.classify(Direction::Ingress, &Packet::default()).unwrap();
        assert_eq!(verdict.action, Action::Forward);

        let rules = fw.rules(Direction::Ingress).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, Action::Forward);
    }

    #[test]
    fn default_action_reload_failure_keeps_old_value() {
        let (sim, fw) = firewall(true);
        sim.fail_reload(ModuleKind::DefaultAction, true);
        assert!(matches!(
            fw.set_default_action(Direction::Egress, Action::Log),
            Err(Error::Reload { .. })
        ));
        assert_eq!(fw.default_action(Direction::Egress).unwrap(), Action::Drop);
        assert_eq!(sim.default_action(Direction::Egress), Some(Action::Drop));

        // The next reload of the shared module must not publish the rejected value
        sim.fail_reload(ModuleKind::DefaultAction, false);
        fw.set_default_action(Direction::Ingress, Action::Forward)
            .unwrap();
        assert_eq!(sim.default_action(Direction::Ingress), Some(Action::Forward));
        assert_eq!(sim.default_action(Direction::Egress), Some(Action::Drop));
        let verdict = sim.classify(Direction::Egress, &Packet::default()).unwrap();
        assert_eq!(verdict.action, Action::Drop);

        fw.set_default_action(Direction::Egress, Action::Log).unwrap();
        assert_eq!(sim.default_action(Direction::Egress), Some(Action::Log));
    }

    #[test]
    fn reload_failure_keeps_previous_generation() {
        let (sim, fw) = firewall(true);
        fw.append(Direction::Ingress, fields(&[("src", "10.0.0.1")]), Some(Action::Forward), "")
            .unwrap();
        let before = fw.generation(Direction::Ingress).unwrap().unwrap();

        sim.fail_reload(ModuleKind::Parser, true);
        let res = fw.append(Direction::Ingress, fields(&[("dport", "80")]), Some(Action::Log), "");
        assert!(matches!(res, Err(Error::Reload { .. })));
        assert!(fw.is_dirty(Direction::Ingress).unwrap());

        let after = fw.generation(Direction::Ingress).unwrap().unwrap();
        assert_eq!(after.entry, before.entry);
        assert_eq!(after.slot, before.slot);
        assert_eq!(sim.hop(Direction::Ingress), Some(before.entry));
        assert_eq!(fw.layout(Direction::Ingress).unwrap(), before.layout);
        assert_eq!(sim.positions().len(), 3 + before.layout.len());

        let verdict = sim
            .classify(Direction::Ingress, &from([10, 0, 0, 1], 10))
            .unwrap();
        assert_eq!(verdict.rule, Some(0));

        sim.fail_reload(ModuleKind::Parser, false);
        assert!(fw.apply_rules(Direction::Ingress));
        let fixed = fw.generation(Direction::Ingress).unwrap().unwrap();
        assert_eq!(fixed.rules, 2);
        assert_ne!(fixed.slot, before.slot);
    }

    #[test]
    fn load_failure_leaves_no_partial_pipeline() {
        let (sim, fw) = firewall(false);
        fw.append(Direction::Ingress, fields(&[("src", "10.0.0.1")]), Some(Action::Forward), "")
            .unwrap();
        sim.fail_load(ModuleKind::Action, true);
        assert!(!fw.apply_rules(Direction::Ingress));
        assert_eq!(sim.positions().len(), 3);
        assert_eq!(sim.hop(Direction::Ingress), Some(NO_CHAIN_ENTRY));

        sim.fail_load(ModuleKind::Action, false);
        assert!(fw.apply_rules(Direction::Ingress));
        assert_eq!(fw.generation(Direction::Ingress).unwrap().unwrap().slot, 0);
    }

    #[test]
    fn lookup_errors() {
        let (_sim, fw) = firewall(false);
        assert!(matches!(
            fw.rule(Direction::Ingress, 5),
            Err(Error::NotFound(5))
        ));
        assert!(matches!(
            fw.remove(Direction::Ingress, 0),
            Err(Error::NotFound(0))
        ));
        assert!(matches!(
            fw.replace(Direction::Ingress, 0, MatchFields::default(), Action::Log, ""),
            Err(Error::NotFound(0))
        ));

        fw.insert(
            Direction::Ingress,
            Rule::new(3, fields(&[("dport", "443")]), Action::Forward),
        )
        .unwrap();
        assert_eq!(fw.rules(Direction::Ingress).unwrap().len(), 2);
        assert!(matches!(
            fw.counters(Direction::Ingress, 1),
            Err(Error::NotFound(1))
        ));
        assert!(matches!(
            fw.counters(Direction::Ingress, 4),
            Err(Error::InvalidState(_))
        ));
        assert!(matches!(
            fw.insert(
                Direction::Ingress,
                Rule::new(MAX_RULES, MatchFields::default(), Action::Drop)
            ),
            Err(Error::InvalidRule(_))
        ));
    }

    #[test]
    fn replace_and_clear() {
        let (sim, fw) = firewall(true);
        fw.append(Direction::Ingress, fields(&[("src", "10.0.0.1")]), Some(Action::Forward), "a")
            .unwrap();
        fw.append(Direction::Ingress, fields(&[("src", "10.0.0.2")]), Some(Action::Forward), "b")
            .unwrap();
        fw.replace(
            Direction::Ingress,
            0,
            fields(&[("src", "10.0.0.9")]),
            Action::Log,
            "c",
        )
        .unwrap();

        let rule = fw.rule(Direction::Ingress, 0).unwrap();
        assert_eq!(rule.description, "c");
        assert_eq!(
            sim.classify(Direction::Ingress, &from([10, 0, 0, 9], 10))
                .unwrap(),
            Verdict {
                action: Action::Log,
                rule: Some(0)
            }
        );
        assert_eq!(
            sim.classify(Direction::Ingress, &from([10, 0, 0, 1], 10))
                .unwrap()
                .rule,
            None
        );

        fw.clear(Direction::Ingress).unwrap();
        assert_eq!(fw.rules(Direction::Ingress).unwrap().len(), 1);
        assert_eq!(
            kinds(&fw.layout(Direction::Ingress).unwrap()),
            vec![ModuleKind::Bitscan, ModuleKind::Action]
        );
        // Default counters survive a clear.
        let all = fw.all_counters(Direction::Ingress).unwrap();
        assert_eq!(all, vec![(0, Counter::new(1, 10))]);

        assert!(fw.reset_counters(Direction::Ingress));
        let all = fw.all_counters(Direction::Ingress).unwrap();
        assert_eq!(all, vec![(0, Counter::default())]);
    }
}

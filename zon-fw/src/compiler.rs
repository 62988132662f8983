//! Translates the rules of a chain into a pipeline of modules and swaps
//! it with the one currently serving the chain.

use crate::error::Result;
use crate::extract::extract;
use crate::module::{Dataplane, EntryPoint, Module, ModuleKey, ModuleKind, CHAIN_HOP};
use crate::registry::Programs;
use crate::rule::{Direction, Rule};
use chrono::{DateTime, Local};
use log::{debug, error, info};
use zon_fw_common::{chain_base_position, DEFAULT_ACTION_POSITION};

/// Where the forwarder sends the packets of a chain that has no
/// generation installed yet.
pub const NO_CHAIN_ENTRY: EntryPoint = EntryPoint {
    kind: ModuleKind::DefaultAction,
    position: DEFAULT_ACTION_POSITION,
};

/// Built but not yet reachable modules of a chain.
pub struct Pipeline {
    pub direction: Direction,
    pub entry: EntryPoint,
    modules: Vec<Box<dyn Module>>,
}

impl Pipeline {
    pub fn layout(&self) -> Vec<(ModuleKind, u32)> {
        self.modules
            .iter()
            .map(|m| (m.kind(), m.position()))
            .collect()
    }
}

/// Summary of the installed generation of a chain.
#[derive(Clone, Debug)]
pub struct Generation {
    pub entry: EntryPoint,
    pub layout: Vec<(ModuleKind, u32)>,
    pub slot: u32,
    pub rules: usize,
    pub installed_at: DateTime<Local>,
}


/// Loads the modules needed by `rules` starting at the base position of
/// `slot`. Nothing is reachable from the forwarder yet, on error the
/// modules loaded so far are dropped.
pub fn build(
    dataplane: &dyn Dataplane,
    direction: Direction,
    slot: u32,
    rules: &[&Rule],
) -> Result<Pipeline> {
    let mut position = chain_base_position(direction.index(), slot);
    let mut entry: Option<EntryPoint> = None;
    let mut modules: Vec<Box<dyn Module>> = vec![];

    for kind in ModuleKind::FILTERS {
        let table = match extract(kind, rules) {
            Some(table) => table,
            None => continue,
        };
        let mut module = dataplane.load(kind, position, Some(direction))?;
        module.update_map(&table)?;
        debug!(
            "[{}] {} at {} with {} values, {} wildcard rules",
            direction,
            kind,
            position,
            table.len(),
            table.wildcard().len()
        );
        entry.get_or_insert(EntryPoint { kind, position });
        modules.push(module);
        position += 1;
    }

    let bitscan = dataplane.load(ModuleKind::Bitscan, position, Some(direction))?;
    let entry = *entry.get_or_insert(EntryPoint {
        kind: ModuleKind::Bitscan,
        position,
    });
    modules.push(bitscan);
    position += 1;

    let mut action = dataplane.load(ModuleKind::Action, position, Some(direction))?;
    for rule in rules {
        action.update_table_value(rule.id, rule.action)?;
    }
    modules.push(action);

    Ok(Pipeline {
        direction,
        entry,
        modules,
    })
}

/// Redirects the forwarder to the pipeline, reloads the forwarder and the
/// parser and only then replaces the modules of the previous generation.
///
/// On failure the forwarder is pointed back to `previous` and the new
/// modules are dropped, the previous generation keeps serving.
pub fn install(
    programs: &mut Programs,
    pipeline: Pipeline,
    slot: u32,
    rules: usize,
    previous: EntryPoint,
) -> Result<Generation> {
    let direction = pipeline.direction;
    programs.shared_mut(ModuleKind::Forwarder)?;
    programs.shared_mut(ModuleKind::Parser)?;

    if let Err(e) = switch_hop(programs, direction, pipeline.entry) {
        error!(
            "[{}] Can't switch to the new pipeline, restore {}, {}",
            direction, previous, e
        );
        if let Err(e) = restore_hop(programs, direction, previous) {
            error!("[{}] Can't restore the previous pipeline, {}", direction, e);
        }
        return Err(e);
    }

    let retired = programs.retire(direction);
    debug!("[{}] Unloaded {} modules of the old chain", direction, retired);

    let layout = pipeline.layout();
    let Pipeline { entry, modules, .. } = pipeline;
    for module in modules {
        programs.insert(ModuleKey::chain(module.kind(), direction), module);
    }

    info!(
        "[{}] Pipeline with {} modules installed at {}",
        direction,
        layout.len(),
        entry
    );

    Ok(Generation {
        entry,
        layout,
        slot,
        rules,
        installed_at: Local::now(),
    })
}

fn switch_hop(programs: &mut Programs, direction: Direction, target: EntryPoint) -> Result<()> {
    let forwarder = programs.shared_mut(ModuleKind::Forwarder)?;
    forwarder.update_hop(CHAIN_HOP, target, direction)?;
    forwarder.reload()?;
    // The number of modules changed
    programs.shared_mut(ModuleKind::Parser)?.reload()
}

fn restore_hop(programs: &mut Programs, direction: Direction, target: EntryPoint) -> Result<()> {
    let forwarder = programs.shared_mut(ModuleKind::Forwarder)?;
    forwarder.update_hop(CHAIN_HOP, target, direction)?;
    forwarder.reload()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{fields_from_pairs, Action};
    use crate::sim::SimDataplane;
    use zon_fw_common::{MAX_POSITIONS, NR_MODULES};

    fn rule(id: u32, pairs: &[(&str, &str)]) -> Rule {
        Rule {
            id,
            fields: fields_from_pairs(pairs.iter().copied()).unwrap(),
            action: Action::Forward,
            description: String::new(),
        }
    }

    #[test]
    fn generation_ranges_do_not_overlap() {
        let mut ranges = vec![];
        for direction in Direction::ALL {
            for slot in 0..2 {
                let base = chain_base_position(direction.index(), slot);
                assert!(base > DEFAULT_ACTION_POSITION);
                assert!(base + NR_MODULES <= MAX_POSITIONS);
                ranges.push(base..base + NR_MODULES);
            }
        }
        for (i, a) in ranges.iter().enumerate() {
            for b in ranges.iter().skip(i + 1) {
                assert!(a.end <= b.start || b.end <= a.start);
            }
        }
    }

    #[test]
    fn build_places_modules_from_slot_base() {
        let sim = SimDataplane::new();
        let rules = [rule(0, &[("src", "10.0.0.0/8"), ("dport", "22")])];
        let refs = rules.iter().collect::<Vec<_>>();
        let pipeline = build(&sim, Direction::Egress, 1, &refs).unwrap();
        let base = chain_base_position(Direction::Egress.index(), 1);
        assert_eq!(
            pipeline.layout(),
            vec![
                (ModuleKind::IpSrc, base),
                (ModuleKind::PortDst, base + 1),
                (ModuleKind::Bitscan, base + 2),
                (ModuleKind::Action, base + 3),
            ]
        );
        assert_eq!(
            pipeline.entry,
            EntryPoint {
                kind: ModuleKind::IpSrc,
                position: base
            }
        );
    }

    #[test]
    fn failed_build_unloads_partial_pipeline() {
        let sim = SimDataplane::new();
        sim.fail_load(ModuleKind::Action, true);
        let rules = [rule(0, &[("proto", "udp")])];
        let refs = rules.iter().collect::<Vec<_>>();
        assert!(build(&sim, Direction::Ingress, 0, &refs).is_err());
        assert!(sim.positions().is_empty());
    }
}

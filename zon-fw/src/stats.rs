use crate::firewall::Firewall;
use crate::info::InfoTable;
use crate::module::Counter;
use crate::rule::{Direction, Rule};
use std::collections::BTreeMap;

/// Rules of a chain with their cumulative counters, the default policy
/// last.
pub fn counters_table(fw: &Firewall, direction: Direction) -> Result<InfoTable, anyhow::Error> {
    let counters = fw
        .all_counters(direction)?
        .into_iter()
        .collect::<BTreeMap<_, _>>();
    let mut table = rule_table();

    for rule in fw.rules(direction)? {
        let counter = counters.get(&rule.id).copied().unwrap_or_default();
        table.push_row(rule_row(rule, counter));
    }
    Ok(table)
}

pub fn rule_table() -> InfoTable {
    InfoTable::new(vec!["id", "match", "action", "packets", "bytes", "description"])
}

pub fn rule_row(rule: Rule, counter: Counter) -> Vec<String> {
    vec![
        rule.id.to_string(),
        rule.fields.to_string().trim_end().to_string(),
        rule.action.to_string(),
        counter.packets.to_string(),
        counter.bytes.to_string(),
        rule.description,
    ]
}

/// Zeroes the counters of both chains, e.g. to print per interval values.
pub fn reset_all(fw: &Firewall) -> bool {
    Direction::ALL
        .iter()
        .fold(true, |ok, dir| fw.reset_counters(*dir) && ok)
}

pub fn print_all(fw: &Firewall) {
    for direction in Direction::ALL {
        match counters_table(fw, direction) {
            Ok(table) => table.print(&format!("[{}] {} chain", fw.name(), direction)),
            Err(e) => log::error!(
                "[{}] Failed to get the {} counters, {}",
                fw.name(),
                direction,
                e
            ),
        }
    }
}

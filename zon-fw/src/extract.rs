//! Builds the value to rules tables of the match modules from the
//! present rules of a chain.

use crate::module::{FieldTable, MatchTable, ModuleKind};
use crate::rule::Rule;
use zon_fw_common::TcpFlags;

/// Generic extractor over one optional field of the rules.
fn field_table<K, F>(rules: &[&Rule], field: F) -> FieldTable<K>
where
    K: Ord,
    F: Fn(&Rule) -> Option<K>,
{
    let mut table = FieldTable::new();
    for rule in rules {
        match field(rule) {
            Some(key) => table.add(key, rule.id),
            None => table.wildcard.set(rule.id),
        }
    }
    table
}

pub fn conntrack_from_rules(rules: &[&Rule]) -> Option<MatchTable> {
    let table = field_table(rules, |r| r.fields.conntrack);
    (!table.is_empty()).then(|| MatchTable::Conntrack(table))
}

pub fn ip_src_from_rules(rules: &[&Rule]) -> Option<MatchTable> {
    let table = field_table(rules, |r| r.fields.src);
    (!table.is_empty()).then(|| MatchTable::Ip(table))
}

pub fn ip_dst_from_rules(rules: &[&Rule]) -> Option<MatchTable> {
    let table = field_table(rules, |r| r.fields.dst);
    (!table.is_empty()).then(|| MatchTable::Ip(table))
}

pub fn l4proto_from_rules(rules: &[&Rule]) -> Option<MatchTable> {
    let table = field_table(rules, |r| r.fields.l4proto);
    (!table.is_empty()).then(|| MatchTable::L4Proto(table))
}

pub fn port_src_from_rules(rules: &[&Rule]) -> Option<MatchTable> {
    let table = field_table(rules, |r| r.fields.sport);
    (!table.is_empty()).then(|| MatchTable::Port(table))
}

pub fn port_dst_from_rules(rules: &[&Rule]) -> Option<MatchTable> {
    let table = field_table(rules, |r| r.fields.dport);
    (!table.is_empty()).then(|| MatchTable::Port(table))
}

/// Every one of the 256 flag combinations gets the rules accepting it, so
/// the module can do a direct lookup with the flags byte of the packet.
pub fn flags_from_rules(rules: &[&Rule]) -> Option<MatchTable> {
    let mut table = FieldTable::new();
    let mut constrained = false;
    for rule in rules {
        match &rule.fields.tcpflags {
            Some(fm) => {
                constrained = true;
                for combo in 0..=u8::MAX {
                    if fm.accepts(TcpFlags::from_bits_retain(combo)) {
                        table.add(combo, rule.id);
                    }
                }
            }
            None => table.wildcard.set(rule.id),
        }
    }
    (constrained && !table.is_empty()).then(|| MatchTable::TcpFlags(table))
}

/// Runs the extractor of a match module kind, `None` for the other kinds
/// or when no rule constrains the dimension.
pub fn extract(kind: ModuleKind, rules: &[&Rule]) -> Option<MatchTable> {
    match kind {
        ModuleKind::Conntrack => conntrack_from_rules(rules),
        ModuleKind::IpSrc => ip_src_from_rules(rules),
        ModuleKind::IpDst => ip_dst_from_rules(rules),
        ModuleKind::L4Proto => l4proto_from_rules(rules),
        ModuleKind::PortSrc => port_src_from_rules(rules),
        ModuleKind::PortDst => port_dst_from_rules(rules),
        ModuleKind::TcpFlags => flags_from_rules(rules),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{fields_from_pairs, Action, ConntrackState, IpPrefix};

    fn rule(id: u32, pairs: &[(&str, &str)]) -> Rule {
        Rule::new(
            id,
            fields_from_pairs(pairs.iter().copied()).unwrap(),
            Action::Forward,
        )
    }

    fn ids(mask: &crate::bitmap::RuleMask) -> Vec<u32> {
        mask.iter().collect()
    }

    #[test]
    fn no_constraint_no_table() {
        let rules = [rule(0, &[]), rule(1, &[("dport", "80")])];
        let refs = rules.iter().collect::<Vec<_>>();
        for kind in ModuleKind::FILTERS {
            let table = extract(kind, &refs);
            assert_eq!(table.is_some(), kind == ModuleKind::PortDst, "{}", kind);
        }
        assert!(extract(ModuleKind::Bitscan, &refs).is_none());
        assert!(extract(ModuleKind::IpSrc, &[]).is_none());
    }

    #[test]
    fn same_value_shares_entry() {
        let rules = [
            rule(0, &[("src", "10.0.0.1")]),
            rule(2, &[("src", "10.0.0.0/8")]),
            rule(3, &[("src", "10.1.2.3/8")]),
            rule(4, &[("dst", "10.0.0.1")]),
        ];
        let refs = rules.iter().collect::<Vec<_>>();
        let table = match ip_src_from_rules(&refs) {
            Some(MatchTable::Ip(t)) => t,
            other => panic!("unexpected table {:?}", other),
        };
        assert_eq!(table.entries.len(), 2);
        let net8: IpPrefix = "10.0.0.0/8".parse().unwrap();
        assert_eq!(ids(&table.entries[&net8]), vec![2, 3]);
        assert_eq!(ids(&table.wildcard), vec![4]);
    }

    #[test]
    fn conntrack_and_protocols() {
        let rules = [
            rule(0, &[("ct", "established")]),
            rule(1, &[("ct", "new"), ("l4proto", "tcp")]),
            rule(5, &[("l4proto", "udp"), ("sport", "53")]),
        ];
        let refs = rules.iter().collect::<Vec<_>>();
        match conntrack_from_rules(&refs) {
            Some(MatchTable::Conntrack(t)) => {
                assert_eq!(ids(&t.entries[&ConntrackState::New]), vec![1]);
                assert_eq!(ids(&t.wildcard), vec![5]);
            }
            other => panic!("unexpected table {:?}", other),
        }
        match l4proto_from_rules(&refs) {
            Some(MatchTable::L4Proto(t)) => {
                assert_eq!(ids(&t.entries[&6]), vec![1]);
                assert_eq!(ids(&t.entries[&17]), vec![5]);
                assert_eq!(ids(&t.wildcard), vec![0]);
            }
            other => panic!("unexpected table {:?}", other),
        }
        match port_src_from_rules(&refs) {
            Some(MatchTable::Port(t)) => assert_eq!(ids(&t.entries[&53]), vec![5]),
            other => panic!("unexpected table {:?}", other),
        }
    }

    #[test]
    fn flags_cover_all_combinations() {
        let rules = [
            rule(0, &[("tcpflags", "SYN !ACK")]),
            rule(1, &[("tcpflags", "ACK")]),
            rule(2, &[]),
        ];
        let refs = rules.iter().collect::<Vec<_>>();
        let table = match flags_from_rules(&refs) {
            Some(MatchTable::TcpFlags(t)) => t,
            other => panic!("unexpected table {:?}", other),
        };
        let syn = TcpFlags::SYN.bits();
        let synack = (TcpFlags::SYN | TcpFlags::ACK).bits();
        assert_eq!(ids(&table.entries[&syn]), vec![0]);
        assert_eq!(ids(&table.entries[&synack]), vec![1]);
        assert!(!table.entries.contains_key(&0));
        assert_eq!(ids(&table.wildcard), vec![2]);
        // SYN set and ACK clear: 64 combinations, ACK set: 128 combinations
        assert_eq!(table.entries.len(), 64 + 128);
    }
}

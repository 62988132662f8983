use crate::error::Error;
use crate::protocols::{parse_l4proto, Protocol};
use crate::rule::{fields_from_pairs, parse_port, MatchFields};
use crate::sim::Packet;
use std::{fmt, net::Ipv4Addr};
use zon_fw_common::TcpFlags;

pub const SRC: &str = "src";
pub const DST: &str = "dst";
pub const PROTO: &str = "proto";
pub const SPORT: &str = "sport";
pub const DPORT: &str = "dport";
pub const FLAGS: &str = "flags";
pub const CT: &str = "ct";
pub const LEN: &str = "len";

fn parse_ip(key: &str, value: &str) -> Result<Ipv4Addr, Error> {
    value
        .parse::<Ipv4Addr>()
        .map_err(|e| Error::InvalidRule(format!("invalid {} '{}', {}", key, value, e)))
}

/// Flag names separated by `|`, `,` or spaces, e.g. `syn|ack`.
pub fn parse_tcp_flags(value: &str) -> Result<TcpFlags, Error> {
    value
        .split(['|', ',', ' '])
        .filter(|t| !t.is_empty())
        .try_fold(TcpFlags::empty(), |flags, name| {
            TcpFlags::from_name(&name.to_ascii_uppercase())
                .map(|f| flags | f)
                .ok_or_else(|| Error::InvalidRule(format!("unknown tcp flag '{}'", name)))
        })
}

/// Rule match fields from `key=value` arguments.
pub fn fields_from_option_args(args: &[String]) -> Result<MatchFields, Error> {
    let pairs = args
        .iter()
        .map(|arg| {
            arg.split_once('=')
                .ok_or_else(|| Error::InvalidRule(format!("expected key=value, got '{}'", arg)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    fields_from_pairs(pairs)
}

impl Packet {
    /// Builds the packet from `key=value` arguments. The protocol defaults
    /// to tcp when ports or flags are given.
    pub fn from_option_args(args: &[String]) -> Result<Self, Error> {
        let mut packet = Packet::default();
        let mut proto = None;

        for arg in args {
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| Error::InvalidRule(format!("expected key=value, got '{}'", arg)))?;
            match key {
                SRC => packet.src = parse_ip(key, value)?,
                DST => packet.dst = parse_ip(key, value)?,
                PROTO | "l4proto" => proto = Some(parse_l4proto(value)?),
                SPORT => packet.sport = Some(parse_port(value)?),
                DPORT => packet.dport = Some(parse_port(value)?),
                FLAGS | "tcpflags" => packet.tcpflags = Some(parse_tcp_flags(value)?),
                CT | "conntrack" => packet.conntrack = value.parse()?,
                LEN => {
                    packet.len = value.parse::<u64>().map_err(|e| {
                        Error::InvalidRule(format!("invalid len '{}', {}", value, e))
                    })?
                }
                _ => {
                    return Err(Error::InvalidRule(format!(
                        "unknown key '{}' in option '{}'",
                        key, arg
                    )))
                }
            }
        }

        let has_ports = packet.sport.is_some() || packet.dport.is_some();
        let has_l4 = has_ports || packet.tcpflags.is_some();
        packet.l4proto = match proto {
            Some(p) if has_ports && !Protocol::has_ports(p) => {
                return Err(Error::InvalidRule(format!("protocol {} has no ports", p)))
            }
            Some(p) => p,
            None if has_l4 => libc::IPPROTO_TCP as u8,
            None => 0,
        };
        Ok(packet)
    }

    pub fn to_options(&self) -> Vec<String> {
        let mut opt = vec![
            format!("{}={}", SRC, self.src),
            format!("{}={}", DST, self.dst),
            format!("{}={}", PROTO, self.l4proto),
        ];
        if let Some(port) = self.sport {
            opt.push(format!("{}={}", SPORT, port));
        }
        if let Some(port) = self.dport {
            opt.push(format!("{}={}", DPORT, port));
        }
        if let Some(flags) = self.tcpflags {
            let names = flags.iter_names().map(|(n, _)| n).collect::<Vec<_>>();
            opt.push(format!("{}={}", FLAGS, names.join("|")));
        }
        opt.push(format!("{}={}", CT, self.conntrack));
        opt.push(format!("{}={}", LEN, self.len));
        opt
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_options().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::ConntrackState;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn packet_from_args() {
        let p = Packet::from_option_args(&args(&[
            "src=10.0.0.1",
            "dport=22",
            "flags=syn|ack",
            "ct=established",
            "len=1500",
        ]))
        .unwrap();
        assert_eq!(p.src, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(p.dst, Ipv4Addr::UNSPECIFIED);
        assert_eq!(p.l4proto, 6);
        assert_eq!(p.dport, Some(22));
        assert_eq!(p.tcpflags, Some(TcpFlags::SYN | TcpFlags::ACK));
        assert_eq!(p.conntrack, ConntrackState::Established);
        assert_eq!(p.len, 1500);
        assert_eq!(
            p.to_string(),
            "src=10.0.0.1 dst=0.0.0.0 proto=6 dport=22 flags=SYN|ACK ct=established len=1500"
        );

        let udp = Packet::from_option_args(&args(&["proto=udp", "sport=53"])).unwrap();
        assert_eq!(udp.l4proto, 17);
        assert!(Packet::from_option_args(&args(&["proto=icmp", "dport=80"])).is_err());

        assert!(Packet::from_option_args(&args(&["src"])).is_err());
        assert!(Packet::from_option_args(&args(&["vlan=3"])).is_err());
        assert!(Packet::from_option_args(&args(&["flags=syn|fun"])).is_err());
    }

    #[test]
    fn rule_fields_from_args() {
        let fields = fields_from_option_args(&args(&["src=10.1.0.0/16", "proto=udp", "dport=53"]))
            .unwrap();
        assert_eq!(fields.src, Some("10.1.0.0/16".parse().unwrap()));
        assert_eq!(fields.l4proto, Some(17));
        assert_eq!(fields.dport, Some(53));
        assert!(fields.sport.is_none());
        assert_eq!(fields_from_option_args(&[]).unwrap(), MatchFields::default());

        assert!(fields_from_option_args(&args(&["dport"])).is_err());
        assert!(fields_from_option_args(&args(&["vlan=3"])).is_err());
    }
}

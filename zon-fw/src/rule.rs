use crate::error::Error;
use crate::protocols::{l4proto_name, parse_l4proto};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::{fmt, net::Ipv4Addr, str::FromStr};
use zon_fw_common::{action, ctstate, TcpFlags, EGRESS, INGRESS};

/// Traffic direction, one chain for each.
#[derive(
    Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    pub fn index(&self) -> u32 {
        match self {
            Self::Ingress => INGRESS,
            Self::Egress => EGRESS,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ingress => write!(f, "ingress"),
            Self::Egress => write!(f, "egress"),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Drop,
    Log,
    #[serde(alias = "accept")]
    Forward,
}

impl Action {
    pub fn code(&self) -> u8 {
        match self {
            Self::Drop => action::DROP,
            Self::Log => action::LOG,
            Self::Forward => action::FORWARD,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Drop => write!(f, "drop"),
            Self::Log => write!(f, "log"),
            Self::Forward => write!(f, "forward"),
        }
    }
}

impl FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "log" => Ok(Self::Log),
            "forward" | "accept" => Ok(Self::Forward),
            _ => Err(Error::InvalidRule(format!("unknown action '{}'", s))),
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConntrackState {
    New,
    Established,
    Related,
    Invalid,
}

impl ConntrackState {
    pub fn code(&self) -> u8 {
        match self {
            Self::New => ctstate::NEW,
            Self::Established => ctstate::ESTABLISHED,
            Self::Related => ctstate::RELATED,
            Self::Invalid => ctstate::INVALID,
        }
    }
}

impl fmt::Display for ConntrackState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Established => "established",
            Self::Related => "related",
            Self::Invalid => "invalid",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for ConntrackState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "new" => Ok(Self::New),
            "established" => Ok(Self::Established),
            "related" => Ok(Self::Related),
            "invalid" => Ok(Self::Invalid),
            _ => Err(Error::InvalidRule(format!("unknown conntrack state '{}'", s))),
        }
    }
}

/// IPv4 prefix normalized to its network address, so that two rules
/// written as 10.0.0.1/8 and 10.0.0.0/8 end up in the same map entry.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct IpPrefix {
    pub addr: Ipv4Addr,
    pub len: u8,
}

impl IpPrefix {
    pub fn new(addr: Ipv4Addr, len: u8) -> Result<Self, Error> {
        let net = Ipv4Network::new(addr, len)
            .map_err(|e| Error::InvalidRule(format!("invalid prefix {}/{}, {}", addr, len, e)))?;
        Ok(Self {
            addr: net.network(),
            len,
        })
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        match Ipv4Network::new(self.addr, self.len) {
            Ok(net) => net.contains(ip),
            Err(_) => false,
        }
    }
}

impl FromStr for IpPrefix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let net = s
            .trim()
            .parse::<Ipv4Network>()
            .map_err(|e| Error::InvalidRule(format!("invalid ip '{}', {}", s, e)))?;
        Self::new(net.ip(), net.prefix())
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.len == 32 {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{}/{}", self.addr, self.len)
        }
    }
}

/// TCP flags constraint: the `set` flags must be present and the `unset`
/// flags must be clear, the others don't matter.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Default)]
pub struct FlagMatch {
    pub set: TcpFlags,
    pub unset: TcpFlags,
}

impl FlagMatch {
    pub fn accepts(&self, flags: TcpFlags) -> bool {
        flags.contains(self.set) && !flags.intersects(self.unset)
    }
}

impl FromStr for FlagMatch {
    type Err = Error;

    /// Parses flag names separated by spaces or commas, e.g. `SYN !ACK`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fm = FlagMatch::default();
        for token in s.split([' ', ',']).filter(|t| !t.is_empty()) {
            let (negate, name) = match token.strip_prefix('!') {
                Some(name) => (true, name),
                None => (false, token),
            };
            let flag = TcpFlags::from_name(&name.to_ascii_uppercase())
                .ok_or_else(|| Error::InvalidRule(format!("unknown tcp flag '{}'", name)))?;
            if negate {
                fm.unset |= flag;
            } else {
                fm.set |= flag;
            }
        }
        if fm.set.intersects(fm.unset) {
            return Err(Error::InvalidRule(format!(
                "tcp flags '{}' both required and forbidden",
                s
            )));
        }
        if fm.set.is_empty() && fm.unset.is_empty() {
            return Err(Error::InvalidRule("empty tcp flags".to_string()));
        }
        Ok(fm)
    }
}

impl fmt::Display for FlagMatch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut names = vec![];
        for (name, _) in self.set.iter_names() {
            names.push(name.to_string());
        }
        for (name, _) in self.unset.iter_names() {
            names.push(format!("!{}", name));
        }
        write!(f, "{}", names.join(" "))
    }
}

/// The match dimensions of a rule. A `None` field doesn't constrain the
/// packet.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct MatchFields {
    pub conntrack: Option<ConntrackState>,
    pub src: Option<IpPrefix>,
    pub dst: Option<IpPrefix>,
    pub l4proto: Option<u8>,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
    pub tcpflags: Option<FlagMatch>,
}

impl MatchFields {
    pub fn is_wildcard(&self) -> bool {
        *self == Self::default()
    }
}

impl fmt::Display for MatchFields {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ct) = &self.conntrack {
            write!(f, "ct={} ", ct)?;
        }
        if let Some(src) = &self.src {
            write!(f, "src={} ", src)?;
        }
        if let Some(dst) = &self.dst {
            write!(f, "dst={} ", dst)?;
        }
        if let Some(proto) = self.l4proto {
            write!(f, "l4proto={} ", l4proto_name(proto))?;
        }
        if let Some(port) = self.sport {
            write!(f, "sport={} ", port)?;
        }
        if let Some(port) = self.dport {
            write!(f, "dport={} ", port)?;
        }
        if let Some(flags) = &self.tcpflags {
            write!(f, "tcpflags={} ", flags)?;
        }
        if self.is_wildcard() {
            write!(f, "*")?;
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Rule {
    pub id: u32,
    pub fields: MatchFields,
    pub action: Action,
    pub description: String,
}

impl Rule {
    pub fn new(id: u32, fields: MatchFields, action: Action) -> Self {
        Self {
            id,
            fields,
            action,
            description: String::new(),
        }
    }

    pub fn with_description<S: AsRef<str>>(mut self, description: S) -> Self {
        self.description = description.as_ref().to_string();
        self
    }
}

/// Builds the match fields from `key=value` pairs, the keys being the
/// same as in the config file.
pub fn fields_from_pairs<'a, I>(pairs: I) -> Result<MatchFields, Error>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut fields = MatchFields::default();
    for (key, value) in pairs {
        match key {
            "conntrack" | "ct" => fields.conntrack = Some(value.parse()?),
            "src" => fields.src = Some(value.parse()?),
            "dst" => fields.dst = Some(value.parse()?),
            "l4proto" | "proto" => fields.l4proto = Some(parse_l4proto(value)?),
            "sport" => fields.sport = Some(parse_port(value)?),
            "dport" => fields.dport = Some(parse_port(value)?),
            "tcpflags" | "flags" => fields.tcpflags = Some(value.parse()?),
            _ => return Err(Error::InvalidRule(format!("unknown match field '{}'", key))),
        }
    }
    Ok(fields)
}

pub fn parse_port(value: &str) -> Result<u16, Error> {
    value
        .trim()
        .parse::<u16>()
        .map_err(|e| Error::InvalidRule(format!("invalid port '{}', {}", value, e)))
}

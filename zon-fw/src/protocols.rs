use crate::error::Error;
use clap::ValueEnum;
use std::{fmt, str::FromStr};

/// IP protocols that can be named in the `l4proto` match, picked from
/// /etc/protocols. Any other protocol can be given by its number.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum, Debug)]
pub enum Protocol {
    /// Icmp 1 ICMP # internet control message protocol
    Icmp = 1,
    /// Igmp 2 IGMP # Internet Group Management
    Igmp = 2,
    /// Tcp 6 TCP # transmission control protocol
    Tcp = 6,
    /// Udp 17 UDP # user datagram protocol
    Udp = 17,
    /// Gre 47 GRE # General Routing Encapsulation
    Gre = 47,
    /// Esp 50 IPSEC-ESP # Encap Security Payload [RFC2406]
    Esp = 50,
    /// Ah 51 IPSEC-AH # Authentication Header [RFC2402]
    Ah = 51,
    /// Ipv6-icmp 58 IPv6-ICMP # ICMP for IPv6
    Ipv6Icmp = 58,
    /// Ospf 89 OSPFIGP # Open Shortest Path First IGP
    Ospf = 89,
    /// Vrrp 112 VRRP # Virtual Router Redundancy Protocol [RFC5798]
    Vrrp = 112,
    /// Sctp 132 SCTP # Stream Control Transmission Protocol
    Sctp = 132,
    /// Udplite 136 UDPLite # UDP-Lite [RFC3828]
    Udplite = 136,
}

impl Protocol {
    pub fn from_number(v: u8) -> Option<Self> {
        Self::value_variants().iter().find(|e| **e as u8 == v).copied()
    }

    /// True for the protocols that carry the source and destination ports
    /// matched by the port modules.
    pub fn has_ports(v: u8) -> bool {
        matches!(
            Self::from_number(v),
            Some(Self::Tcp | Self::Udp | Self::Sctp | Self::Udplite)
        )
    }
}

/// Parses a protocol name (case insensitive) or a protocol number.
pub fn parse_l4proto(input: &str) -> Result<u8, Error> {
    let input = input.trim();
    if let Ok(number) = input.parse::<u8>() {
        return Ok(number);
    }
    <Protocol as ValueEnum>::from_str(input, true)
        .map(|p| p as u8)
        .map_err(|_| Error::InvalidRule(format!("unknown l4proto '{}'", input)))
}

/// Name of the protocol if known, otherwise the number.
pub fn l4proto_name(v: u8) -> String {
    match Protocol::from_number(v) {
        Some(p) => p
            .to_possible_value()
            .map(|pv| pv.get_name().to_string())
            .unwrap_or_else(|| v.to_string()),
        None => v.to_string(),
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", l4proto_name(*self as u8))
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let number = parse_l4proto(s)?;
        Self::from_number(number)
            .ok_or_else(|| Error::InvalidRule(format!("unnamed l4proto {}", number)))
    }
}

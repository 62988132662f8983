#![no_std]

use bitflags;

pub const VERSION: u32 = 0x0000001;

/// Max rules per chain. The per-rule bitmaps handed to the match
/// programs are sized for this value.
pub const MAX_RULES: u32 = 1024;
pub const RULE_WORDS: usize = (MAX_RULES / 64) as usize;

/// Number of positions reserved for one chain generation: seven match
/// modules, the bitscan and the action module.
pub const NR_MODULES: u32 = 9;

/// Positions of the modules shared by both chains.
pub const PARSER_POSITION: u32 = 0;
pub const FORWARDER_POSITION: u32 = 1;
pub const DEFAULT_ACTION_POSITION: u32 = 2;

/// First position available to the chain generations.
pub const FIRST_CHAIN_POSITION: u32 = 3;

/// Number of traffic directions (chains).
pub const DIRECTIONS: u32 = 2;
pub const INGRESS: u32 = 0;
pub const EGRESS: u32 = 1;

/// Size of the program table used for tail calls. Every position
/// returned by [chain_base_position] plus [NR_MODULES] must fit in.
pub const MAX_POSITIONS: u32 = 64;

/// Returns the first position of a chain generation.
///
/// Each direction owns two ranges of [NR_MODULES] positions and the
/// generations alternate between them, so that a new generation is
/// never placed over the one still serving packets.
pub const fn chain_base_position(direction: u32, slot: u32) -> u32 {
    FIRST_CHAIN_POSITION + (slot & 1) * NR_MODULES + direction * 2 * NR_MODULES
}

/// Forwarder hops of each direction. The chains only use
/// `HOPS_PER_DIRECTION - 1`, the hop 0 is the parser fall through.
pub const HOPS_PER_DIRECTION: u32 = 2;

/// Globals patched in every program before loading it.
pub mod globals {
    pub const MODULE_POSITION: &str = "MODULE_POSITION";
    pub const MODULE_DIRECTION: &str = "MODULE_DIRECTION";
    /// Direction value of the modules shared by both chains.
    pub const SHARED_DIRECTION: u32 = u32::MAX;
}

/// Map names. The `ZFWX_` maps are pinned and shared by every program of
/// a firewall instance, the `ZFW_` ones are private to a program.
pub mod maps {
    pub const PIPELINE: &str = "ZFWX_PIPELINE";
    pub const HOPS: &str = "ZFWX_HOPS";
    pub const DEFAULT: &str = "ZFWX_DEFAULT";
    pub const DEFAULT_COUNTERS: &str = "ZFWX_DEFAULT_COUNTERS";
    pub const MATCH: &str = "ZFW_MATCH";
    pub const WILDCARD: &str = "ZFW_WILDCARD";
    pub const ACTIONS: &str = "ZFW_ACTIONS";
    pub const COUNTERS: &str = "ZFW_COUNTERS";
    pub const RUNVAR: &str = "ZFW_RUNVAR";
}

/// Action codes stored in the action table and in the default action map.
pub mod action {
    pub const DROP: u8 = 0;
    pub const LOG: u8 = 1;
    pub const FORWARD: u8 = 2;
}

/// Connection tracking states as seen by the conntrack match program.
pub mod ctstate {
    pub const NEW: u8 = 0;
    pub const ESTABLISHED: u8 = 1;
    pub const RELATED: u8 = 2;
    pub const INVALID: u8 = 3;
}

/// Indexes in the runtime variables map of the parser.
pub mod runvars {
    pub const FUSED_VERSION_IDX: u32 = 0;
    pub const LOG_LEVEL_IDX: u32 = 1;
    /// Number of modules currently loaded in the pipeline.
    pub const NR_MODULES_IDX: u32 = 2;
    pub const MAX_RUNTIME_VARS: u32 = 8;
}

bitflags::bitflags! {
/// TCP header flags, same bit layout as the 13th byte of the TCP header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TcpFlags: u8 {
    const FIN = 0x01;
    const SYN = 0x02;
    const RST = 0x04;
    const PSH = 0x08;
    const ACK = 0x10;
    const URG = 0x20;
    const ECE = 0x40;
    const CWR = 0x80;
}
}

/// One bit for each rule id of a chain. Stored as value in every match
/// map: on lookup the programs AND the found bitmap with the one
/// carried from the previous module.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleBitmap {
    pub words: [u64; RULE_WORDS],
}

impl RuleBitmap {
    pub const fn empty() -> Self {
        Self {
            words: [0; RULE_WORDS],
        }
    }

    /// Sets the bit for `rule_id`, returns false if the id is beyond [MAX_RULES].
    pub fn set(&mut self, rule_id: u32) -> bool {
        if rule_id >= MAX_RULES {
            return false;
        }
        self.words[(rule_id / 64) as usize] |= 1_u64 << (rule_id % 64);
        true
    }
}

impl Default for RuleBitmap {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for RuleBitmap {}

/// Packet and byte counters of a rule, as kept by the action program.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct RuleCounters {
    pub packets: u64,
    pub bytes: u64,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for RuleCounters {}

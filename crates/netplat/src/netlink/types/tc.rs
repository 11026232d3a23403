//! Traffic control message types (RTM_*QDISC, RTM_*TFILTER).

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Traffic control message (struct tcmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcMsg {
    pub tcm_family: u8,
    pub tcm_pad1: u8,
    pub tcm_pad2: u16,
    /// Interface index.
    pub tcm_ifindex: i32,
    /// Object handle.
    pub tcm_handle: u32,
    /// Parent handle.
    pub tcm_parent: u32,
    /// Filters: priority in the upper 16 bits, protocol (network order)
    /// in the lower 16 bits.
    pub tcm_info: u32,
}

impl TcMsg {
    /// Size of this structure.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Generic action header shared by every action's parameter block
/// (struct tc_gen fields).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcGen {
    pub index: u32,
    pub capab: u32,
    pub action: i32,
    pub refcnt: i32,
    pub bindcnt: i32,
}

/// Mirred action parameters (struct tc_mirred).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TcMirred {
    pub generic: TcGen,
    pub eaction: i32,
    pub ifindex: u32,
}

/// TCA_* attribute ids.
pub mod tca {
    pub const KIND: u16 = 1;
    pub const OPTIONS: u16 = 2;
    pub const STATS: u16 = 3;
    pub const XSTATS: u16 = 4;
    pub const STATS2: u16 = 7;
    pub const CHAIN: u16 = 11;
}

/// TCA_FQ_CODEL_* attribute ids.
pub mod fq_codel {
    pub const TARGET: u16 = 1;
    pub const LIMIT: u16 = 2;
    pub const INTERVAL: u16 = 3;
    pub const ECN: u16 = 4;
    pub const FLOWS: u16 = 5;
    pub const QUANTUM: u16 = 6;
    pub const CE_THRESHOLD: u16 = 7;
    pub const DROP_BATCH_SIZE: u16 = 8;
    pub const MEMORY_LIMIT: u16 = 9;
}

/// TCA_MATCHALL_* attribute ids.
pub mod matchall {
    pub const CLASSID: u16 = 1;
    pub const ACT: u16 = 2;
    pub const FLAGS: u16 = 3;
}

/// TCA_BASIC_* attribute ids.
pub mod basic {
    pub const CLASSID: u16 = 1;
    pub const ACT: u16 = 3;
}

/// TCA_ACT_* attribute ids (inside one action table slot).
pub mod act {
    pub const KIND: u16 = 1;
    pub const OPTIONS: u16 = 2;
    pub const INDEX: u16 = 3;
    pub const STATS: u16 = 4;
}

/// act_simple attribute ids (TCA_DEF_*).
pub mod simple {
    pub const TM: u16 = 1;
    pub const PARMS: u16 = 2;
    pub const DATA: u16 = 3;

    /// SIMP_MAX_DATA: size of the kernel's sdata buffer, NUL included.
    pub const MAX_DATA: usize = 32;
}

/// act_gact attribute ids (TCA_GACT_*).
pub mod gact {
    pub const TM: u16 = 1;
    pub const PARMS: u16 = 2;
}

/// act_mirred attribute ids (TCA_MIRRED_*).
pub mod mirred {
    pub const TM: u16 = 1;
    pub const PARMS: u16 = 2;

    pub const EGRESS_REDIR: i32 = 1;
    pub const EGRESS_MIRROR: i32 = 2;
    pub const INGRESS_REDIR: i32 = 3;
    pub const INGRESS_MIRROR: i32 = 4;
}

/// Action verdicts (TC_ACT_*).
pub mod tc_act {
    pub const OK: i32 = 0;
    pub const RECLASSIFY: i32 = 1;
    pub const SHOT: i32 = 2;
    pub const PIPE: i32 = 3;
    pub const STOLEN: i32 = 4;
}

/// Link-layer protocol selector matching every frame.
pub const ETH_P_ALL: u16 = 0x0003;

//! Address message types (RTM_*ADDR).

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Interface address message (struct ifaddrmsg).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfAddrMsg {
    /// Address family (AF_INET or AF_INET6).
    pub ifa_family: u8,
    /// Prefix length.
    pub ifa_prefixlen: u8,
    /// Legacy 8-bit flags; the full set travels in IFA_FLAGS.
    pub ifa_flags: u8,
    /// Address scope.
    pub ifa_scope: u8,
    /// Interface index.
    pub ifa_index: u32,
}

impl IfAddrMsg {
    /// Size of this structure.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

/// Address lifetime information (struct ifa_cacheinfo).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IfaCacheinfo {
    /// Preferred lifetime in seconds.
    pub ifa_prefered: u32,
    /// Valid lifetime in seconds.
    pub ifa_valid: u32,
    /// Created timestamp (hundredths of seconds).
    pub cstamp: u32,
    /// Updated timestamp (hundredths of seconds).
    pub tstamp: u32,
}

/// Lifetime value the kernel uses for "forever".
pub const INFINITY_LIFE_TIME: u32 = 0xFFFF_FFFF;

/// IFA_* attribute ids.
pub mod ifa {
    pub const ADDRESS: u16 = 1;
    pub const LOCAL: u16 = 2;
    pub const LABEL: u16 = 3;
    pub const BROADCAST: u16 = 4;
    pub const CACHEINFO: u16 = 6;
    pub const FLAGS: u16 = 8;
}

/// Address flags (IFA_F_*).
pub mod ifa_flags {
    pub const SECONDARY: u32 = 0x01;
    pub const NODAD: u32 = 0x02;
    pub const OPTIMISTIC: u32 = 0x04;
    pub const DADFAILED: u32 = 0x08;
    pub const HOMEADDRESS: u32 = 0x10;
    pub const DEPRECATED: u32 = 0x20;
    pub const TENTATIVE: u32 = 0x40;
    pub const PERMANENT: u32 = 0x80;
    pub const MANAGETEMPADDR: u32 = 0x100;
    pub const NOPREFIXROUTE: u32 = 0x200;

    /// Flags that describe kernel state rather than configuration.
    pub const VOLATILE: u32 = SECONDARY | TENTATIVE | DEPRECATED | DADFAILED | PERMANENT;
}

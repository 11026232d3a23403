//! Composite TC handles.
//!
//! Qdiscs and filters are addressed by 32-bit handles built from a 16-bit
//! major and a 16-bit minor: `(major << 16) | minor`. A few values are
//! reserved: the root sentinel, the ingress/clsact attach point, and the
//! all-zero "let the kernel choose" value.

use std::fmt;
use std::str::FromStr;

use crate::netlink::error::Error;

/// A composite major:minor handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct TcHandle(u32);

/// What a handle value denotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleClass {
    /// Zero: unspecified, the kernel picks one.
    Unspec,
    /// The root sentinel; the object has no parent qdisc.
    Root,
    /// The ingress (and clsact) attach point.
    Ingress,
    /// An object under the reserved ingress major, such as the ingress qdisc
    /// itself (`ffff:`) or a clsact hook (`ffff:fff2`).
    IngressSide { minor: u16 },
    /// An ordinary major:minor pair.
    Regular { major: u16, minor: u16 },
}

impl TcHandle {
    /// Root sentinel (TC_H_ROOT).
    pub const ROOT: TcHandle = TcHandle(0xFFFF_FFFF);
    /// Ingress attach point (TC_H_INGRESS, equal to TC_H_CLSACT).
    pub const INGRESS: TcHandle = TcHandle(0xFFFF_FFF1);
    /// Clsact attach point; the kernel uses the same value as ingress.
    pub const CLSACT: TcHandle = Self::INGRESS;
    /// Unspecified handle.
    pub const UNSPEC: TcHandle = TcHandle(0);
    /// Major number reserved for ingress-side objects.
    pub const INGRESS_MAJOR: u16 = 0xFFFF;
    /// Handle of the ingress qdisc (`ffff:`).
    pub const INGRESS_QDISC: TcHandle = TcHandle::new(Self::INGRESS_MAJOR, 0);
    /// Clsact ingress hook (`ffff:fff2`).
    pub const CLSACT_INGRESS: TcHandle = TcHandle::new(Self::INGRESS_MAJOR, 0xFFF2);
    /// Clsact egress hook (`ffff:fff3`).
    pub const CLSACT_EGRESS: TcHandle = TcHandle::new(Self::INGRESS_MAJOR, 0xFFF3);

    /// Build a handle from major and minor.
    pub const fn new(major: u16, minor: u16) -> Self {
        Self(((major as u32) << 16) | minor as u32)
    }

    /// Wrap a raw kernel value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw kernel value.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    pub const fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub const fn minor(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// The qdisc a handle belongs to (minor cleared).
    pub const fn qdisc(self) -> TcHandle {
        TcHandle(self.0 & 0xFFFF_0000)
    }

    pub const fn is_root(self) -> bool {
        self.0 == Self::ROOT.0
    }

    pub const fn is_unspec(self) -> bool {
        self.0 == 0
    }

    /// Decode what the value denotes.
    pub const fn class(self) -> HandleClass {
        match self.0 {
            0 => HandleClass::Unspec,
            0xFFFF_FFFF => HandleClass::Root,
            0xFFFF_FFF1 => HandleClass::Ingress,
            _ if self.major() == Self::INGRESS_MAJOR => HandleClass::IngressSide {
                minor: self.minor(),
            },
            _ => HandleClass::Regular {
                major: self.major(),
                minor: self.minor(),
            },
        }
    }
}

impl From<u32> for TcHandle {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl From<TcHandle> for u32 {
    fn from(handle: TcHandle) -> Self {
        handle.0
    }
}

impl fmt::Display for TcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class() {
            HandleClass::Root => f.write_str("root"),
            HandleClass::Ingress => f.write_str("ingress"),
            HandleClass::Unspec => f.write_str("none"),
            _ if self.minor() == 0 => write!(f, "{:x}:", self.major()),
            _ => write!(f, "{:x}:{:x}", self.major(), self.minor()),
        }
    }
}

impl FromStr for TcHandle {
    type Err = Error;

    /// Accepts `root`, `ingress`, `clsact`, `none`, `maj:`, `maj:min` and a
    /// bare `maj`, all in hex.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidArgument(format!("invalid tc handle: {:?}", s));
        match s {
            "root" => Ok(Self::ROOT),
            "ingress" => Ok(Self::INGRESS),
            "clsact" => Ok(Self::CLSACT),
            "none" => Ok(Self::UNSPEC),
            _ => {
                let (maj, min) = s.split_once(':').unwrap_or((s, ""));
                let major = u16::from_str_radix(maj, 16).map_err(|_| invalid())?;
                let minor = if min.is_empty() {
                    0
                } else {
                    u16::from_str_radix(min, 16).map_err(|_| invalid())?
                };
                Ok(Self::new(major, minor))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_major_minor() {
        let handle = TcHandle::new(0x8003, 0);
        assert_eq!(handle.as_raw(), 0x8003_0000);

        let decoded = TcHandle::from_raw(handle.as_raw());
        assert_eq!(decoded.major(), 0x8003);
        assert_eq!(decoded.minor(), 0);
        assert_eq!(
            decoded.class(),
            HandleClass::Regular {
                major: 0x8003,
                minor: 0
            }
        );
    }

    #[test]
    fn test_ingress_sentinel() {
        assert_eq!(
            TcHandle::from_raw(0xFFFF_FFF1).class(),
            HandleClass::Ingress
        );
        assert_eq!(TcHandle::CLSACT, TcHandle::INGRESS);
        assert_eq!(
            TcHandle::INGRESS_QDISC.class(),
            HandleClass::IngressSide { minor: 0 }
        );
        // The ingress qdisc sits at the ingress sentinel's major.
        assert_eq!(TcHandle::INGRESS.qdisc(), TcHandle::INGRESS_QDISC);
    }

    #[test]
    fn test_root_and_unspec() {
        assert_eq!(TcHandle::from_raw(u32::MAX).class(), HandleClass::Root);
        assert_eq!(TcHandle::default().class(), HandleClass::Unspec);
    }

    #[test]
    fn test_format() {
        assert_eq!(TcHandle::ROOT.to_string(), "root");
        assert_eq!(TcHandle::INGRESS.to_string(), "ingress");
        assert_eq!(TcHandle::UNSPEC.to_string(), "none");
        assert_eq!(TcHandle::new(0x8003, 0).to_string(), "8003:");
        assert_eq!(TcHandle::new(0x10, 0x20).to_string(), "10:20");
        assert_eq!(TcHandle::INGRESS_QDISC.to_string(), "ffff:");
    }

    #[test]
    fn test_parse() {
        assert_eq!("root".parse::<TcHandle>().unwrap(), TcHandle::ROOT);
        assert_eq!("clsact".parse::<TcHandle>().unwrap(), TcHandle::INGRESS);
        assert_eq!("none".parse::<TcHandle>().unwrap(), TcHandle::UNSPEC);
        assert_eq!(
            "8003:".parse::<TcHandle>().unwrap(),
            TcHandle::new(0x8003, 0)
        );
        assert_eq!(
            "fff1:1".parse::<TcHandle>().unwrap(),
            TcHandle::new(0xfff1, 1)
        );
        assert_eq!("1234".parse::<TcHandle>().unwrap(), TcHandle::new(0x1234, 0));
        assert!("xyz:1".parse::<TcHandle>().is_err());
        assert!("1:2:3".parse::<TcHandle>().is_err());
    }
}

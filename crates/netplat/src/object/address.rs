//! IPv4/IPv6 address snapshots.

use std::net::IpAddr;

use crate::netlink::attr::get;
use crate::netlink::builder::MessageBuilder;
use crate::netlink::error::{Error, Result};
use crate::netlink::parse::{FromNetlink, PResult, cut, lift, parse_attrs, parse_header};
use crate::netlink::types::addr::{INFINITY_LIFE_TIME, IfAddrMsg, IfaCacheinfo, ifa, ifa_flags};

use super::{RequestAction, family_of, max_prefix_len};

/// An address assigned to an interface.
///
/// Identity is `(ifindex, address, prefix_len)`; the remaining fields are
/// payload that a later snapshot may change.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Address {
    pub ifindex: u32,
    pub address: IpAddr,
    pub prefix_len: u8,
    /// IPv4 label (e.g. `eth0:1`).
    pub label: Option<String>,
    /// IFA_F_* flags.
    pub flags: u32,
    /// Scope; `None` in a desired address lets the kernel pick.
    pub scope: Option<u8>,
    /// Valid lifetime in seconds, `u32::MAX` for forever.
    pub valid_lft: u32,
    /// Preferred lifetime in seconds, `u32::MAX` for forever.
    pub preferred_lft: u32,
}

impl Address {
    /// Address from separate address and prefix length fields.
    pub fn new(ifindex: u32, address: IpAddr, prefix_len: u8) -> Result<Self> {
        if prefix_len > max_prefix_len(&address) {
            return Err(Error::InvalidArgument(format!(
                "prefix length {} out of range for {}",
                prefix_len, address
            )));
        }
        Ok(Self {
            ifindex,
            address,
            prefix_len,
            label: None,
            flags: 0,
            scope: None,
            valid_lft: INFINITY_LIFE_TIME,
            preferred_lft: INFINITY_LIFE_TIME,
        })
    }

    /// Address from a combined `addr/len` token. A bare address gets the
    /// host prefix length.
    pub fn parse_cidr(ifindex: u32, cidr: &str) -> Result<Self> {
        let (addr, len) = match cidr.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (cidr, None),
        };
        let address: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid address: {:?}", cidr)))?;
        let prefix_len = match len {
            Some(len) => len
                .trim()
                .parse()
                .map_err(|_| Error::InvalidArgument(format!("invalid prefix length: {:?}", cidr)))?,
            None => max_prefix_len(&address),
        };
        Self::new(ifindex, address, prefix_len)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_scope(mut self, scope: u8) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Finite lifetimes in seconds.
    pub fn with_lifetime(mut self, valid: u32, preferred: u32) -> Self {
        self.valid_lft = valid;
        self.preferred_lft = preferred.min(valid);
        self
    }

    pub fn family(&self) -> u8 {
        family_of(&self.address)
    }

    pub fn is_v6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Whether `self` (cached) already satisfies `desired`.
    ///
    /// Kernel-state flags are ignored. Lifetimes count down in the kernel,
    /// so a cached lifetime satisfies any desired lifetime it still covers.
    pub fn satisfies(&self, desired: &Address) -> bool {
        let config = |flags: u32| flags & !ifa_flags::VOLATILE;
        config(self.flags) == config(desired.flags)
            && desired.label.as_ref().is_none_or(|l| self.label.as_ref() == Some(l))
            && desired.scope.is_none_or(|s| self.scope == Some(s))
            && self.valid_lft >= desired.valid_lft
            && self.preferred_lft >= desired.preferred_lft
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ifindex == 0 {
            return Err(Error::InvalidArgument(format!(
                "address {} needs an interface",
                self.address
            )));
        }
        match &self.label {
            Some(_) if self.is_v6() => Err(Error::InvalidArgument(
                "address labels are IPv4 only".into(),
            )),
            Some(label) if label.len() >= libc::IFNAMSIZ => Err(Error::InvalidArgument(format!(
                "address label too long: {}",
                label
            ))),
            _ => Ok(()),
        }
    }

    pub(crate) fn write_request(&self, action: RequestAction, b: &mut MessageBuilder) -> Result<()> {
        b.append(&IfAddrMsg {
            ifa_family: self.family(),
            ifa_prefixlen: self.prefix_len,
            ifa_flags: (self.flags & 0xFF) as u8,
            ifa_scope: self.scope.unwrap_or(0),
            ifa_index: self.ifindex,
        });

        if self.address.is_ipv4() {
            b.append_attr_ip(ifa::LOCAL, self.address);
        }
        b.append_attr_ip(ifa::ADDRESS, self.address);
        if action == RequestAction::Delete {
            return Ok(());
        }

        if let Some(label) = &self.label {
            if self.is_v6() {
                return Err(Error::InvalidArgument(
                    "address labels are IPv4 only".into(),
                ));
            }
            b.append_attr_str(ifa::LABEL, label);
        }
        if self.flags > 0xFF {
            b.append_attr_u32(ifa::FLAGS, self.flags);
        }
        if self.valid_lft != INFINITY_LIFE_TIME || self.preferred_lft != INFINITY_LIFE_TIME {
            let ci = IfaCacheinfo {
                ifa_prefered: self.preferred_lft,
                ifa_valid: self.valid_lft,
                ..Default::default()
            };
            b.append_attr(ifa::CACHEINFO, zerocopy::IntoBytes::as_bytes(&ci));
        }
        Ok(())
    }
}

impl FromNetlink for Address {
    fn parse(input: &mut &[u8]) -> PResult<Self> {
        let hdr: IfAddrMsg = parse_header(input)?;
        let family = hdr.ifa_family;

        let mut local = None;
        let mut address = None;
        let mut label = None;
        let mut flags = hdr.ifa_flags as u32;
        let mut lifetimes = (INFINITY_LIFE_TIME, INFINITY_LIFE_TIME);

        for (kind, payload) in parse_attrs(input)? {
            match kind {
                ifa::LOCAL => local = Some(lift(get::ip_addr(payload, family))?),
                ifa::ADDRESS => address = Some(lift(get::ip_addr(payload, family))?),
                ifa::LABEL => label = Some(lift(get::string(payload))?.to_owned()),
                ifa::FLAGS => flags = lift(get::u32_ne(payload))?,
                ifa::CACHEINFO => {
                    let ci = lift(
                        <IfaCacheinfo as zerocopy::FromBytes>::read_from_prefix(payload)
                            .map(|(ci, _)| ci)
                            .map_err(|_| Error::InvalidAttribute("short ifa_cacheinfo".into())),
                    )?;
                    lifetimes = (ci.ifa_valid, ci.ifa_prefered);
                }
                _ => {}
            }
        }

        // For IPv4, IFA_LOCAL is the interface's own address and IFA_ADDRESS
        // the peer on point-to-point links.
        let Some(addr) = local.or(address) else {
            return cut();
        };

        Ok(Address {
            ifindex: hdr.ifa_index,
            address: addr,
            prefix_len: hdr.ifa_prefixlen,
            label,
            flags,
            scope: Some(hdr.ifa_scope),
            valid_lft: lifetimes.0,
            preferred_lft: lifetimes.1,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::NLMSG_HDRLEN;

    #[test]
    fn test_cidr_and_fields_agree() {
        let combined = Address::parse_cidr(42, "192.0.2.1/24").unwrap();
        let separate = Address::new(42, "192.0.2.1".parse().unwrap(), 24).unwrap();
        assert_eq!(combined, separate);
    }

    #[test]
    fn test_bare_address_gets_host_prefix() {
        assert_eq!(Address::parse_cidr(1, "192.0.2.1").unwrap().prefix_len, 32);
        assert_eq!(Address::parse_cidr(1, "2001:db8::1").unwrap().prefix_len, 128);
    }

    #[test]
    fn test_invalid_input() {
        assert!(Address::parse_cidr(1, "192.0.2.1/33").is_err());
        assert!(Address::parse_cidr(1, "not-an-address/24").is_err());
        assert!(Address::parse_cidr(1, "192.0.2.1/abc").is_err());
        assert!(Address::new(1, "2001:db8::1".parse().unwrap(), 129).is_err());
    }

    #[test]
    fn test_request_parses_back() {
        let desired = Address::parse_cidr(7, "192.0.2.1/24")
            .unwrap()
            .with_label("test0:1")
            .with_flags(ifa_flags::NOPREFIXROUTE)
            .with_lifetime(3600, 1800);
        let mut b = MessageBuilder::new(20, 0);
        desired.write_request(RequestAction::Create, &mut b).unwrap();
        let msg = b.finish();

        let parsed = Address::from_bytes(&msg[NLMSG_HDRLEN..]).unwrap();
        assert_eq!(parsed.ifindex, 7);
        assert_eq!(parsed.address, desired.address);
        assert_eq!(parsed.prefix_len, 24);
        assert_eq!(parsed.label.as_deref(), Some("test0:1"));
        assert_eq!(parsed.flags, ifa_flags::NOPREFIXROUTE);
        assert_eq!(parsed.valid_lft, 3600);
        assert!(parsed.satisfies(&desired));
    }

    #[test]
    fn test_satisfies_ignores_kernel_state() {
        let desired = Address::parse_cidr(2, "2001:db8::1/64").unwrap();
        let mut cached = desired.clone();
        cached.flags = ifa_flags::PERMANENT | ifa_flags::TENTATIVE;
        cached.scope = Some(0);
        assert!(cached.satisfies(&desired));

        cached.flags |= ifa_flags::NODAD;
        assert!(!cached.satisfies(&desired));
    }

    #[test]
    fn test_expiring_address_does_not_satisfy_forever() {
        let desired = Address::parse_cidr(2, "192.0.2.9/24").unwrap();
        let cached = desired.clone().with_lifetime(100, 100);
        assert!(!cached.satisfies(&desired));
        assert!(desired.satisfies(&cached));
    }

    #[test]
    fn test_label_length_limit() {
        let fits = Address::parse_cidr(2, "192.0.2.1/24")
            .unwrap()
            .with_label("test0:123456789");
        assert!(fits.validate().is_ok());
        let long = fits.with_label("test0:1234567890");
        assert!(matches!(long.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_v6_label_rejected() {
        let desired = Address::parse_cidr(2, "2001:db8::1/64")
            .unwrap()
            .with_label("x");
        assert!(desired.validate().is_err());
        let mut b = MessageBuilder::new(20, 0);
        assert!(desired.write_request(RequestAction::Create, &mut b).is_err());
    }
}

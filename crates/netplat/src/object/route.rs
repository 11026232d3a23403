//! IPv4/IPv6 unicast route snapshots.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::netlink::attr::get;
use crate::netlink::builder::MessageBuilder;
use crate::netlink::error::{Error, Result};
use crate::netlink::parse::{FromNetlink, PResult, lift, parse_attrs, parse_header};
use crate::netlink::types::route::{
    IP6_RT_PRIO_USER, RTM_F_CLONED, RtMsg, rt_scope, rt_table, rta, rtn, rtprot,
};

use super::{RequestAction, family_of, max_prefix_len};

/// A unicast route.
///
/// Identity is `(table, tos, destination, metric)`. The nexthop (`ifindex`,
/// `gateway`) is stored but is not part of the identity: a second route with
/// the same key replaces the first one's nexthop.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Route {
    pub table: u32,
    pub tos: u8,
    /// Destination, always masked to `dst_len`.
    pub dst: IpAddr,
    pub dst_len: u8,
    /// Priority. For IPv6, 0 means the kernel default of 1024.
    pub metric: u32,
    /// Egress interface; 0 if unset.
    pub ifindex: u32,
    pub gateway: Option<IpAddr>,
    pub pref_src: Option<IpAddr>,
    pub protocol: u8,
    pub scope: u8,
    pub route_type: u8,
    /// RTM_F_* flags.
    pub flags: u32,
}

impl Route {
    /// Route to `dst/dst_len` in the main table.
    pub fn new(dst: IpAddr, dst_len: u8) -> Result<Self> {
        if dst_len > max_prefix_len(&dst) {
            return Err(Error::InvalidArgument(format!(
                "prefix length {} out of range for {}",
                dst_len, dst
            )));
        }
        Ok(Self {
            table: rt_table::MAIN,
            tos: 0,
            dst: mask(dst, dst_len),
            dst_len,
            metric: 0,
            ifindex: 0,
            gateway: None,
            pref_src: None,
            protocol: rtprot::STATIC,
            scope: rt_scope::UNIVERSE,
            route_type: rtn::UNICAST,
            flags: 0,
        })
    }

    /// Route from a `prefix/len` token; a bare address is a host route.
    pub fn parse_prefix(prefix: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("invalid route prefix: {:?}", prefix));
        let (addr, len) = prefix.split_once('/').unwrap_or((prefix, ""));
        let dst: IpAddr = addr.parse().map_err(|_| invalid())?;
        let dst_len = if len.is_empty() {
            max_prefix_len(&dst)
        } else {
            len.parse().map_err(|_| invalid())?
        };
        Self::new(dst, dst_len)
    }

    pub fn dev(mut self, ifindex: u32) -> Self {
        self.ifindex = ifindex;
        self
    }

    pub fn via(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn src(mut self, pref_src: IpAddr) -> Self {
        self.pref_src = Some(pref_src);
        self
    }

    pub fn table(mut self, table: u32) -> Self {
        self.table = table;
        self
    }

    pub fn metric(mut self, metric: u32) -> Self {
        self.metric = metric;
        self
    }

    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn protocol(mut self, protocol: u8) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn family(&self) -> u8 {
        family_of(&self.dst)
    }

    pub fn is_v6(&self) -> bool {
        self.dst.is_ipv6()
    }

    /// The metric the kernel will actually use.
    pub fn effective_metric(&self) -> u32 {
        if self.is_v6() && self.metric == 0 {
            IP6_RT_PRIO_USER
        } else {
            self.metric
        }
    }

    /// Whether the cache mirrors routes like this one.
    ///
    /// Only configuration routes qualify: unicast, not a route cache clone.
    pub fn is_cacheable(&self) -> bool {
        self.route_type == rtn::UNICAST && self.flags & RTM_F_CLONED == 0
    }

    /// Whether `self` (cached) already satisfies `desired`.
    pub fn satisfies(&self, desired: &Route) -> bool {
        (desired.ifindex == 0 || self.ifindex == desired.ifindex)
            && self.gateway == desired.gateway
            && desired.pref_src.is_none_or(|s| self.pref_src == Some(s))
            && self.route_type == desired.route_type
            && (desired.protocol == rtprot::UNSPEC || self.protocol == desired.protocol)
    }

    fn request_scope(&self, action: RequestAction) -> u8 {
        match action {
            RequestAction::Delete => rt_scope::NOWHERE,
            _ if self.is_v6() || self.gateway.is_some() => rt_scope::UNIVERSE,
            _ if self.ifindex != 0 => rt_scope::LINK,
            _ => self.scope,
        }
    }

    pub(crate) fn write_request(&self, action: RequestAction, b: &mut MessageBuilder) -> Result<()> {
        if let Some(gw) = self.gateway
            && gw.is_ipv6() != self.is_v6()
        {
            return Err(Error::InvalidArgument(format!(
                "gateway {} does not match the family of {}/{}",
                gw, self.dst, self.dst_len
            )));
        }

        let small_table = u8::try_from(self.table).unwrap_or(rt_table::UNSPEC as u8);
        b.append(&RtMsg {
            rtm_family: self.family(),
            rtm_dst_len: self.dst_len,
            rtm_tos: self.tos,
            rtm_table: small_table,
            rtm_protocol: if action == RequestAction::Delete {
                rtprot::UNSPEC
            } else {
                self.protocol
            },
            rtm_scope: self.request_scope(action),
            rtm_type: self.route_type,
            ..Default::default()
        });

        b.append_attr_u32(rta::TABLE, self.table);
        if self.dst_len > 0 {
            b.append_attr_ip(rta::DST, self.dst);
        }
        b.append_attr_u32(rta::PRIORITY, self.effective_metric());
        if action == RequestAction::Delete {
            return Ok(());
        }
        if self.ifindex != 0 {
            b.append_attr_u32(rta::OIF, self.ifindex);
        }
        if let Some(gw) = self.gateway {
            b.append_attr_ip(rta::GATEWAY, gw);
        }
        if let Some(src) = self.pref_src {
            b.append_attr_ip(rta::PREFSRC, src);
        }
        Ok(())
    }
}

impl FromNetlink for Route {
    fn parse(input: &mut &[u8]) -> PResult<Self> {
        let hdr: RtMsg = parse_header(input)?;
        let family = hdr.rtm_family;
        let unspecified = if family as i32 == libc::AF_INET6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };

        let mut route = Route {
            table: hdr.rtm_table as u32,
            tos: hdr.rtm_tos,
            dst: unspecified,
            dst_len: hdr.rtm_dst_len,
            metric: 0,
            ifindex: 0,
            gateway: None,
            pref_src: None,
            protocol: hdr.rtm_protocol,
            scope: hdr.rtm_scope,
            route_type: hdr.rtm_type,
            flags: hdr.rtm_flags,
        };

        for (kind, payload) in parse_attrs(input)? {
            match kind {
                rta::TABLE => route.table = lift(get::u32_ne(payload))?,
                rta::DST => route.dst = lift(get::ip_addr(payload, family))?,
                rta::PRIORITY => route.metric = lift(get::u32_ne(payload))?,
                rta::OIF => route.ifindex = lift(get::u32_ne(payload))?,
                rta::GATEWAY => route.gateway = Some(lift(get::ip_addr(payload, family))?),
                rta::PREFSRC => route.pref_src = Some(lift(get::ip_addr(payload, family))?),
                _ => {}
            }
        }
        route.dst = mask(route.dst, route.dst_len);
        Ok(route)
    }
}

/// Clear host bits beyond `len`.
pub fn mask(addr: IpAddr, len: u8) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let bits = u32::from(v4);
            let m = u32::MAX.checked_shl(32 - u32::from(len.min(32))).unwrap_or(0);
            IpAddr::V4(Ipv4Addr::from(bits & m))
        }
        IpAddr::V6(v6) => {
            let bits = u128::from(v6);
            let m = u128::MAX
                .checked_shl(128 - u32::from(len.min(128)))
                .unwrap_or(0);
            IpAddr::V6(Ipv6Addr::from(bits & m))
        }
    }
}

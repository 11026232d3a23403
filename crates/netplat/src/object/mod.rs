//! Canonical object model.
//!
//! Every kernel object the platform mirrors is a [`PlatformObject`]: an
//! immutable snapshot tagged with its [`ObjectKind`]. Each snapshot has an
//! [`ObjectKey`] that decides which cache slot it occupies. The key is not
//! the full set of fields:
//!
//! - addresses key on `(ifindex, address, prefix_len)` no matter how the
//!   prefix was spelled;
//! - routes key on `(table, tos, destination, metric)` and leave the nexthop
//!   out, so a new nexthop replaces the old one;
//! - qdiscs key on `(ifindex, parent)`;
//! - filters key on `(ifindex, parent, protocol, prio, handle)`, and a
//!   desired filter that leaves `prio` or `handle` to the kernel is found
//!   by what it does instead.
//!
//! [`PlatformObject::equivalent`] answers "same entity?", and
//! [`PlatformObject::satisfies`] answers "does this cached snapshot already
//! look like what the caller asked for?".

pub mod address;
pub mod handle;
pub mod link;
pub mod qdisc;
pub mod route;
pub mod tfilter;

use std::fmt;
use std::net::IpAddr;

pub use address::Address;
pub use handle::{HandleClass, TcHandle};
pub use link::{Link, LinkKind, OperState, SettingType};
pub use qdisc::{FqCodelParams, Qdisc, QdiscOptions};
pub use route::Route;
pub use tfilter::{TcAction, Tfilter};

use crate::netlink::builder::MessageBuilder;
use crate::netlink::error::{Error, Result};
use crate::netlink::message::{
    NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL, NLM_F_REPLACE, NLM_F_REQUEST, NlMsgType,
};
use crate::netlink::parse::FromNetlink;
use crate::netlink::types::addr::IfAddrMsg;
use crate::netlink::types::link::IfInfoMsg;
use crate::netlink::types::route::RtMsg;
use crate::netlink::types::tc::TcMsg;

/// The closed set of object kinds, in resynchronization order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ObjectKind {
    Link,
    Ip4Address,
    Ip6Address,
    Ip4Route,
    Ip6Route,
    Qdisc,
    Tfilter,
}

impl ObjectKind {
    /// All kinds; dependencies come before dependents.
    pub const ALL: [ObjectKind; 7] = [
        ObjectKind::Link,
        ObjectKind::Ip4Address,
        ObjectKind::Ip6Address,
        ObjectKind::Ip4Route,
        ObjectKind::Ip6Route,
        ObjectKind::Qdisc,
        ObjectKind::Tfilter,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ObjectKind::Link => "link",
            ObjectKind::Ip4Address => "ip4-address",
            ObjectKind::Ip6Address => "ip6-address",
            ObjectKind::Ip4Route => "ip4-route",
            ObjectKind::Ip6Route => "ip6-route",
            ObjectKind::Qdisc => "qdisc",
            ObjectKind::Tfilter => "tfilter",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Whether objects of this kind belong to an interface.
    pub fn is_per_interface(self) -> bool {
        !matches!(self, ObjectKind::Link)
    }

    fn family(self) -> u8 {
        match self {
            ObjectKind::Ip4Address | ObjectKind::Ip4Route => libc::AF_INET as u8,
            ObjectKind::Ip6Address | ObjectKind::Ip6Route => libc::AF_INET6 as u8,
            _ => libc::AF_UNSPEC as u8,
        }
    }

    /// RTM_NEW*, RTM_DEL*, RTM_GET* for this kind.
    pub(crate) fn message_types(self) -> (u16, u16, u16) {
        match self {
            ObjectKind::Link => (
                NlMsgType::RTM_NEWLINK,
                NlMsgType::RTM_DELLINK,
                NlMsgType::RTM_GETLINK,
            ),
            ObjectKind::Ip4Address | ObjectKind::Ip6Address => (
                NlMsgType::RTM_NEWADDR,
                NlMsgType::RTM_DELADDR,
                NlMsgType::RTM_GETADDR,
            ),
            ObjectKind::Ip4Route | ObjectKind::Ip6Route => (
                NlMsgType::RTM_NEWROUTE,
                NlMsgType::RTM_DELROUTE,
                NlMsgType::RTM_GETROUTE,
            ),
            ObjectKind::Qdisc => (
                NlMsgType::RTM_NEWQDISC,
                NlMsgType::RTM_DELQDISC,
                NlMsgType::RTM_GETQDISC,
            ),
            ObjectKind::Tfilter => (
                NlMsgType::RTM_NEWTFILTER,
                NlMsgType::RTM_DELTFILTER,
                NlMsgType::RTM_GETTFILTER,
            ),
        }
    }

    /// Build a dump request for every object of this kind.
    ///
    /// Filters cannot be dumped globally; use [`tfilter_dump_request`].
    pub fn dump_request(self) -> MessageBuilder {
        let (_, _, get) = self.message_types();
        let mut b = MessageBuilder::new(get, NLM_F_REQUEST | NLM_F_DUMP);
        let family = self.family();
        match self {
            ObjectKind::Link => b.append(&IfInfoMsg {
                ifi_family: family,
                ..Default::default()
            }),
            ObjectKind::Ip4Address | ObjectKind::Ip6Address => b.append(&IfAddrMsg {
                ifa_family: family,
                ..Default::default()
            }),
            ObjectKind::Ip4Route | ObjectKind::Ip6Route => b.append(&RtMsg {
                rtm_family: family,
                ..Default::default()
            }),
            ObjectKind::Qdisc | ObjectKind::Tfilter => b.append(&TcMsg::default()),
        }
        b
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Dump the filters attached to the qdisc `parent` on `ifindex`.
pub fn tfilter_dump_request(ifindex: u32, parent: TcHandle) -> MessageBuilder {
    let mut b = MessageBuilder::new(NlMsgType::RTM_GETTFILTER, NLM_F_REQUEST | NLM_F_DUMP);
    b.append(&TcMsg {
        tcm_ifindex: ifindex as i32,
        tcm_parent: parent.as_raw(),
        ..Default::default()
    });
    b
}

/// Whether a notification announces a new/changed object or a removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ChangeKind {
    New,
    Del,
}

/// What a request does to the kernel object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestAction {
    /// Create; fail if the identity exists.
    Create,
    /// Create or replace in place (NLM_F_REPLACE).
    Replace,
    /// Modify an existing object without create semantics.
    Change,
    Delete,
}

/// Cache identity of an object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum ObjectKey {
    Link {
        ifindex: u32,
    },
    Address {
        ifindex: u32,
        address: IpAddr,
        prefix_len: u8,
    },
    Route {
        table: u32,
        tos: u8,
        dst: IpAddr,
        dst_len: u8,
        metric: u32,
    },
    Qdisc {
        ifindex: u32,
        parent: TcHandle,
    },
    Tfilter {
        ifindex: u32,
        parent: TcHandle,
        protocol: u16,
        prio: u16,
        handle: TcHandle,
    },
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKey::Link { ifindex } => write!(f, "link {}", ifindex),
            ObjectKey::Address {
                ifindex,
                address,
                prefix_len,
            } => write!(f, "{}/{} dev {}", address, prefix_len, ifindex),
            ObjectKey::Route {
                table,
                tos,
                dst,
                dst_len,
                metric,
            } => write!(
                f,
                "{}/{} table {} tos {} metric {}",
                dst, dst_len, table, tos, metric
            ),
            ObjectKey::Qdisc { ifindex, parent } => {
                write!(f, "qdisc dev {} parent {}", ifindex, parent)
            }
            ObjectKey::Tfilter {
                ifindex,
                parent,
                protocol,
                prio,
                handle,
            } => write!(
                f,
                "filter dev {} parent {} protocol {:#06x} prio {} handle {}",
                ifindex, parent, protocol, prio, handle
            ),
        }
    }
}

/// An immutable snapshot of one kernel object.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum PlatformObject {
    Link(Link),
    Address(Address),
    Route(Route),
    Qdisc(Qdisc),
    Tfilter(Tfilter),
}

impl PlatformObject {
    pub fn kind(&self) -> ObjectKind {
        match self {
            PlatformObject::Link(_) => ObjectKind::Link,
            PlatformObject::Address(a) if a.is_v6() => ObjectKind::Ip6Address,
            PlatformObject::Address(_) => ObjectKind::Ip4Address,
            PlatformObject::Route(r) if r.is_v6() => ObjectKind::Ip6Route,
            PlatformObject::Route(_) => ObjectKind::Ip4Route,
            PlatformObject::Qdisc(_) => ObjectKind::Qdisc,
            PlatformObject::Tfilter(_) => ObjectKind::Tfilter,
        }
    }

    /// The cache slot this snapshot belongs in.
    pub fn identity_key(&self) -> ObjectKey {
        match self {
            PlatformObject::Link(l) => ObjectKey::Link { ifindex: l.ifindex },
            PlatformObject::Address(a) => ObjectKey::Address {
                ifindex: a.ifindex,
                address: a.address,
                prefix_len: a.prefix_len,
            },
            PlatformObject::Route(r) => ObjectKey::Route {
                table: r.table,
                tos: r.tos,
                dst: route::mask(r.dst, r.dst_len),
                dst_len: r.dst_len,
                metric: r.effective_metric(),
            },
            PlatformObject::Qdisc(q) => ObjectKey::Qdisc {
                ifindex: q.ifindex,
                parent: q.parent,
            },
            PlatformObject::Tfilter(t) => ObjectKey::Tfilter {
                ifindex: t.ifindex,
                parent: t.parent,
                protocol: t.protocol,
                prio: t.prio,
                handle: t.handle,
            },
        }
    }

    /// Whether `a` and `b` denote the same kernel entity.
    ///
    /// Filter `prio` and `handle` left at 0 match whatever the kernel chose.
    pub fn equivalent(a: &PlatformObject, b: &PlatformObject) -> bool {
        match (a, b) {
            (PlatformObject::Tfilter(x), PlatformObject::Tfilter(y)) => x.same_slot(y),
            _ => a.kind() == b.kind() && a.identity_key() == b.identity_key(),
        }
    }

    /// Whether this snapshot (cached) already satisfies `desired`: same
    /// entity, and every field the caller set has the requested value.
    pub fn satisfies(&self, desired: &PlatformObject) -> bool {
        match (self, desired) {
            (PlatformObject::Link(have), PlatformObject::Link(want)) => {
                (want.ifindex == 0 || have.ifindex == want.ifindex) && have.satisfies(want)
            }
            _ if !Self::equivalent(self, desired) => false,
            (PlatformObject::Address(have), PlatformObject::Address(want)) => have.satisfies(want),
            (PlatformObject::Route(have), PlatformObject::Route(want)) => have.satisfies(want),
            (PlatformObject::Qdisc(have), PlatformObject::Qdisc(want)) => have.satisfies(want),
            (PlatformObject::Tfilter(have), PlatformObject::Tfilter(want)) => have.satisfies(want),
            _ => false,
        }
    }

    /// The interface that owns this object, for per-interface indexing.
    ///
    /// Routes are owned by their egress interface.
    pub fn ifindex(&self) -> Option<u32> {
        let ifindex = match self {
            PlatformObject::Link(l) => l.ifindex,
            PlatformObject::Address(a) => a.ifindex,
            PlatformObject::Route(r) => r.ifindex,
            PlatformObject::Qdisc(q) => q.ifindex,
            PlatformObject::Tfilter(t) => t.ifindex,
        };
        (ifindex != 0).then_some(ifindex)
    }

    /// Check fields before anything goes on the wire.
    pub fn validate(&self) -> Result<()> {
        match self {
            PlatformObject::Link(l) => l.validate(),
            PlatformObject::Address(a) => a.validate(),
            PlatformObject::Route(r) if r.ifindex == 0 && r.gateway.is_none() => {
                Err(Error::InvalidArgument(format!(
                    "route {}/{} needs a device or a gateway",
                    r.dst, r.dst_len
                )))
            }
            PlatformObject::Route(_) => Ok(()),
            PlatformObject::Qdisc(q) => q.validate(),
            PlatformObject::Tfilter(t) => t.validate(),
        }
    }

    /// Build the request that performs `action` on this object.
    pub fn request(&self, action: RequestAction) -> Result<MessageBuilder> {
        let (new, del, _) = self.kind().message_types();
        let (msg_type, flags) = match action {
            RequestAction::Create => (new, NLM_F_CREATE | NLM_F_EXCL),
            RequestAction::Replace => (new, NLM_F_CREATE | NLM_F_REPLACE),
            RequestAction::Change => (new, 0),
            RequestAction::Delete => (del, 0),
        };
        let mut b = MessageBuilder::new(msg_type, NLM_F_REQUEST | NLM_F_ACK | flags);
        self.write_body(action, &mut b)?;
        b.check()?;
        Ok(b)
    }

    /// Encode as a kernel-originated message of `msg_type`.
    pub fn to_message(&self, msg_type: u16, flags: u16) -> Result<MessageBuilder> {
        let mut b = MessageBuilder::new(msg_type, flags);
        let action = match msg_type {
            NlMsgType::RTM_DELLINK
            | NlMsgType::RTM_DELADDR
            | NlMsgType::RTM_DELROUTE
            | NlMsgType::RTM_DELQDISC
            | NlMsgType::RTM_DELTFILTER => RequestAction::Delete,
            _ => RequestAction::Change,
        };
        match self {
            PlatformObject::Link(l) if action != RequestAction::Delete => {
                l.write_kernel_form(&mut b)?
            }
            _ => self.write_body(action, &mut b)?,
        }
        b.check()?;
        Ok(b)
    }

    fn write_body(&self, action: RequestAction, b: &mut MessageBuilder) -> Result<()> {
        match self {
            PlatformObject::Link(l) => l.write_request(action, b),
            PlatformObject::Address(a) => a.write_request(action, b),
            PlatformObject::Route(r) => r.write_request(action, b),
            PlatformObject::Qdisc(q) => q.write_request(action, b),
            PlatformObject::Tfilter(t) => t.write_request(action, b),
        }
    }

    /// Decode an rtnetlink message payload.
    ///
    /// Returns `Ok(None)` for message types and families the cache does not
    /// mirror, and for routes that are not configuration routes.
    pub fn decode(msg_type: u16, payload: &[u8]) -> Result<Option<(ChangeKind, PlatformObject)>> {
        let change = match msg_type {
            NlMsgType::RTM_NEWLINK
            | NlMsgType::RTM_NEWADDR
            | NlMsgType::RTM_NEWROUTE
            | NlMsgType::RTM_NEWQDISC
            | NlMsgType::RTM_NEWTFILTER => ChangeKind::New,
            NlMsgType::RTM_DELLINK
            | NlMsgType::RTM_DELADDR
            | NlMsgType::RTM_DELROUTE
            | NlMsgType::RTM_DELQDISC
            | NlMsgType::RTM_DELTFILTER => ChangeKind::Del,
            _ => return Ok(None),
        };
        let family = payload.first().copied().unwrap_or(0) as i32;
        let ip_family = family == libc::AF_INET || family == libc::AF_INET6;

        let object = match msg_type {
            NlMsgType::RTM_NEWLINK | NlMsgType::RTM_DELLINK => {
                PlatformObject::Link(Link::from_bytes(payload)?)
            }
            NlMsgType::RTM_NEWADDR | NlMsgType::RTM_DELADDR if ip_family => {
                PlatformObject::Address(Address::from_bytes(payload)?)
            }
            NlMsgType::RTM_NEWROUTE | NlMsgType::RTM_DELROUTE if ip_family => {
                let route = Route::from_bytes(payload)?;
                if !route.is_cacheable() {
                    return Ok(None);
                }
                PlatformObject::Route(route)
            }
            NlMsgType::RTM_NEWQDISC | NlMsgType::RTM_DELQDISC => {
                PlatformObject::Qdisc(Qdisc::from_bytes(payload)?)
            }
            NlMsgType::RTM_NEWTFILTER | NlMsgType::RTM_DELTFILTER => {
                PlatformObject::Tfilter(Tfilter::from_bytes(payload)?)
            }
            _ => return Ok(None),
        };
        Ok(Some((change, object)))
    }
}

impl fmt::Display for PlatformObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlatformObject::Link(l) => write!(f, "link {} ({}, {})", l.name, l.ifindex, l.kind),
            PlatformObject::Address(a) => {
                write!(f, "address {}/{} dev {}", a.address, a.prefix_len, a.ifindex)
            }
            PlatformObject::Route(r) => {
                write!(f, "route {}/{} table {}", r.dst, r.dst_len, r.table)?;
                if let Some(gw) = r.gateway {
                    write!(f, " via {}", gw)?;
                }
                write!(f, " dev {} metric {}", r.ifindex, r.effective_metric())
            }
            PlatformObject::Qdisc(q) => write!(f, "qdisc {}", q),
            PlatformObject::Tfilter(t) => {
                write!(
                    f,
                    "filter dev {} parent {} prio {} {}",
                    t.ifindex, t.parent, t.prio, t.kind
                )?;
                if let Some(action) = &t.action {
                    write!(f, " action {}", action)?;
                }
                Ok(())
            }
        }
    }
}

macro_rules! impl_from_object {
    ($($variant:ident),*) => {
        $(impl From<$variant> for PlatformObject {
            fn from(value: $variant) -> Self {
                PlatformObject::$variant(value)
            }
        })*
    };
}

impl_from_object!(Link, Address, Route, Qdisc, Tfilter);

pub(crate) fn family_of(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => libc::AF_INET as u8,
        IpAddr::V6(_) => libc::AF_INET6 as u8,
    }
}

pub(crate) fn max_prefix_len(addr: &IpAddr) -> u8 {
    if addr.is_ipv4() { 32 } else { 128 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::NLMSG_HDRLEN;

    fn route(prefix: &str, ifindex: u32, gateway: &str) -> PlatformObject {
        Route::parse_prefix(prefix)
            .unwrap()
            .dev(ifindex)
            .via(gateway.parse().unwrap())
            .metric(1024)
            .into()
    }

    #[test]
    fn test_address_identity_from_both_spellings() {
        let combined: PlatformObject = Address::parse_cidr(42, "192.0.2.1/24").unwrap().into();
        let separate: PlatformObject =
            Address::new(42, "192.0.2.1".parse().unwrap(), 24).unwrap().into();
        assert_eq!(combined.identity_key(), separate.identity_key());
        assert!(PlatformObject::equivalent(&combined, &separate));
    }

    #[test]
    fn test_route_identity_ignores_nexthop_v4() {
        let a = route("192.0.2.0/24", 111, "198.51.100.1");
        let b = route("192.0.2.0/24", 222, "198.51.100.2");
        assert_eq!(a.identity_key(), b.identity_key());
        assert!(PlatformObject::equivalent(&a, &b));
        assert!(!a.satisfies(&b));
    }

    #[test]
    fn test_route_identity_ignores_nexthop_v6() {
        let a = route("2001:db8:a:b::/64", 111, "2001:db8:e:f:1:2:3:4");
        let b = route("2001:db8:a:b::/64", 111, "2001:db8:e:f:5:6:7:8");
        assert_eq!(a.identity_key(), b.identity_key());
        assert_eq!(a.kind(), ObjectKind::Ip6Route);
    }

    #[test]
    fn test_v6_metric_zero_keys_as_default() {
        let implicit: PlatformObject = Route::parse_prefix("2001:db8::/32").unwrap().dev(1).into();
        let explicit: PlatformObject = Route::parse_prefix("2001:db8::/32")
            .unwrap()
            .dev(1)
            .metric(1024)
            .into();
        assert_eq!(implicit.identity_key(), explicit.identity_key());
    }

    #[test]
    fn test_route_key_distinguishes_table_and_metric() {
        let a = route("192.0.2.0/24", 1, "198.51.100.1");
        let PlatformObject::Route(r) = a.clone() else {
            unreachable!()
        };
        let other_table: PlatformObject = r.clone().table(100).into();
        let other_metric: PlatformObject = r.metric(10).into();
        assert_ne!(a.identity_key(), other_table.identity_key());
        assert_ne!(a.identity_key(), other_metric.identity_key());
    }

    #[test]
    fn test_filter_keys_by_parent() {
        let egress: PlatformObject =
            Tfilter::matchall(4, TcHandle::new(0x8003, 0), TcAction::simple("Egress")).into();
        let ingress: PlatformObject =
            Tfilter::matchall(4, TcHandle::INGRESS_QDISC, TcAction::simple("Ingress")).into();
        assert_ne!(egress.identity_key(), ingress.identity_key());
    }

    #[test]
    fn test_filter_key_includes_prio() {
        let parent = TcHandle::INGRESS_QDISC;
        let first: PlatformObject = Tfilter::matchall(4, parent, TcAction::pass()).with_prio(1).into();
        let second: PlatformObject = Tfilter::matchall(4, parent, TcAction::pass()).with_prio(2).into();
        assert_ne!(first.identity_key(), second.identity_key());
        assert!(!PlatformObject::equivalent(&first, &second));

        let unkeyed: PlatformObject = Tfilter::matchall(4, parent, TcAction::pass()).into();
        assert!(PlatformObject::equivalent(&first, &unkeyed));
        assert!(first.satisfies(&unkeyed));
    }

    #[test]
    fn test_oversized_request_is_refused() {
        let filter: PlatformObject = Tfilter::matchall(
            4,
            TcHandle::INGRESS_QDISC,
            TcAction::simple("x".repeat(70_000)),
        )
        .into();
        assert!(matches!(
            filter.request(RequestAction::Create),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_decode_dispatch() {
        let q: PlatformObject = Qdisc::ingress(3).into();
        let msg = q.to_message(NlMsgType::RTM_NEWQDISC, 0).unwrap().finish();
        let (change, decoded) = PlatformObject::decode(NlMsgType::RTM_NEWQDISC, &msg[NLMSG_HDRLEN..])
            .unwrap()
            .unwrap();
        assert_eq!(change, ChangeKind::New);
        assert_eq!(decoded, q);

        assert!(PlatformObject::decode(NlMsgType::DONE, &[]).unwrap().is_none());
    }

    #[test]
    fn test_decode_skips_non_ip_families() {
        let mut b = MessageBuilder::new(NlMsgType::RTM_NEWROUTE, 0);
        b.append(&RtMsg {
            rtm_family: libc::AF_MPLS as u8,
            ..Default::default()
        });
        let msg = b.finish();
        assert!(PlatformObject::decode(NlMsgType::RTM_NEWROUTE, &msg[NLMSG_HDRLEN..])
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_request_flags() {
        use crate::netlink::message::NlMsgHdr;
        let q: PlatformObject = Qdisc::ingress(3).into();
        for (action, ty, flags) in [
            (RequestAction::Create, NlMsgType::RTM_NEWQDISC, NLM_F_CREATE | NLM_F_EXCL),
            (RequestAction::Replace, NlMsgType::RTM_NEWQDISC, NLM_F_CREATE | NLM_F_REPLACE),
            (RequestAction::Delete, NlMsgType::RTM_DELQDISC, 0),
        ] {
            let msg = q.request(action).unwrap().finish();
            let hdr = NlMsgHdr::from_bytes(&msg).unwrap();
            assert_eq!(hdr.nlmsg_type, ty);
            assert_eq!(hdr.nlmsg_flags, NLM_F_REQUEST | NLM_F_ACK | flags);
        }
    }

    #[test]
    fn test_validate() {
        let no_dev: PlatformObject = Route::parse_prefix("192.0.2.0/24").unwrap().into();
        assert!(matches!(no_dev.validate(), Err(Error::InvalidArgument(_))));
        let no_if: PlatformObject = Address::parse_cidr(0, "192.0.2.1/24").unwrap().into();
        assert!(no_if.validate().is_err());
    }
}

//! Link (network interface) snapshots and the link kind table.

use std::fmt;

use crate::netlink::attr::get;
use crate::netlink::builder::MessageBuilder;
use crate::netlink::error::{Error, Result};
use crate::netlink::parse::{FromNetlink, PResult, lift, parse_attrs, parse_header};
use crate::netlink::types::link::{IfInfoMsg, arphrd, iff, ifla, ifla_info, ifla_vlan, veth_info};

use super::RequestAction;

/// Configuration-setting family a link kind can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SettingType {
    None,
    Ethernet,
    Bridge,
    Bond,
    Vlan,
    Wpan,
    Wireguard,
}

/// Closed set of link kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum LinkKind {
    #[default]
    Unknown,
    Loopback,
    Ethernet,
    Dummy,
    Veth,
    Bridge,
    Bond,
    Vlan,
    Macvlan,
    Ifb,
    Wireguard,
    Vrf,
    Wpan,
    Tun,
}

/// Static facts about one link kind.
#[derive(Debug, Clone, Copy)]
pub struct LinkKindInfo {
    pub kind: LinkKind,
    /// `IFLA_INFO_KIND` string, if the kernel reports one.
    pub rtnl_kind: Option<&'static str>,
    /// Exists without backing hardware.
    pub software: bool,
    /// Can be created with RTM_NEWLINK.
    pub creatable: bool,
    /// Setting family the kind is configured with.
    pub setting: SettingType,
}

const fn info(
    kind: LinkKind,
    rtnl_kind: Option<&'static str>,
    software: bool,
    creatable: bool,
    setting: SettingType,
) -> LinkKindInfo {
    LinkKindInfo {
        kind,
        rtnl_kind,
        software,
        creatable,
        setting,
    }
}

/// The capability table, one row per kind.
pub const LINK_KINDS: &[LinkKindInfo] = &[
    info(LinkKind::Unknown, None, false, false, SettingType::None),
    info(LinkKind::Loopback, None, true, false, SettingType::None),
    info(LinkKind::Ethernet, None, false, false, SettingType::Ethernet),
    info(LinkKind::Dummy, Some("dummy"), true, true, SettingType::None),
    info(LinkKind::Veth, Some("veth"), true, true, SettingType::Ethernet),
    info(LinkKind::Bridge, Some("bridge"), true, true, SettingType::Bridge),
    info(LinkKind::Bond, Some("bond"), true, true, SettingType::Bond),
    info(LinkKind::Vlan, Some("vlan"), true, true, SettingType::Vlan),
    info(LinkKind::Macvlan, Some("macvlan"), true, true, SettingType::Ethernet),
    info(LinkKind::Ifb, Some("ifb"), true, true, SettingType::None),
    info(LinkKind::Wireguard, Some("wireguard"), true, true, SettingType::Wireguard),
    info(LinkKind::Vrf, Some("vrf"), true, true, SettingType::None),
    info(LinkKind::Wpan, None, false, false, SettingType::Wpan),
    info(LinkKind::Tun, Some("tun"), true, false, SettingType::None),
];

impl LinkKind {
    /// Table row for this kind.
    pub fn info(self) -> &'static LinkKindInfo {
        LINK_KINDS
            .iter()
            .find(|row| row.kind == self)
            .unwrap_or(&LINK_KINDS[0])
    }

    /// Kind from an `IFLA_INFO_KIND` string; unrecognised strings are `Unknown`.
    pub fn from_rtnl_kind(s: &str) -> Self {
        LINK_KINDS
            .iter()
            .find(|row| row.rtnl_kind == Some(s))
            .map(|row| row.kind)
            .unwrap_or(LinkKind::Unknown)
    }

    pub fn rtnl_kind(self) -> Option<&'static str> {
        self.info().rtnl_kind
    }

    pub fn is_software(self) -> bool {
        self.info().software
    }

    pub fn is_creatable(self) -> bool {
        self.info().creatable
    }

    /// Whether a connection with `setting` can be activated on this kind.
    ///
    /// Kinds always accept their own setting family; ethernet-like kinds
    /// (veth, macvlan) accept ethernet settings and nothing else; kinds
    /// with no setting family accept only `SettingType::None`.
    pub fn supports_setting(self, setting: SettingType) -> bool {
        self.info().setting == setting
    }

    fn arphrd(self) -> u16 {
        match self {
            LinkKind::Loopback => arphrd::LOOPBACK,
            LinkKind::Wpan => arphrd::IEEE802154,
            LinkKind::Tun | LinkKind::Wireguard => arphrd::NONE,
            _ => arphrd::ETHER,
        }
    }

    fn from_arphrd(ifi_type: u16) -> Self {
        match ifi_type {
            arphrd::LOOPBACK => LinkKind::Loopback,
            arphrd::ETHER => LinkKind::Ethernet,
            arphrd::IEEE802154 => LinkKind::Wpan,
            _ => LinkKind::Unknown,
        }
    }
}

impl fmt::Display for LinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkKind::Unknown => f.write_str("unknown"),
            LinkKind::Loopback => f.write_str("loopback"),
            LinkKind::Ethernet => f.write_str("ethernet"),
            LinkKind::Wpan => f.write_str("wpan"),
            other => f.write_str(other.rtnl_kind().unwrap_or("unknown")),
        }
    }
}

/// Operational state (IF_OPER_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum OperState {
    #[default]
    Unknown,
    NotPresent,
    Down,
    LowerLayerDown,
    Testing,
    Dormant,
    Up,
}

impl From<u8> for OperState {
    fn from(v: u8) -> Self {
        match v {
            1 => OperState::NotPresent,
            2 => OperState::Down,
            3 => OperState::LowerLayerDown,
            4 => OperState::Testing,
            5 => OperState::Dormant,
            6 => OperState::Up,
            _ => OperState::Unknown,
        }
    }
}

impl From<OperState> for u8 {
    fn from(state: OperState) -> Self {
        match state {
            OperState::Unknown => 0,
            OperState::NotPresent => 1,
            OperState::Down => 2,
            OperState::LowerLayerDown => 3,
            OperState::Testing => 4,
            OperState::Dormant => 5,
            OperState::Up => 6,
        }
    }
}

/// Snapshot of a network interface.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Link {
    /// Kernel-assigned index; 0 in a desired link means "resolve by name".
    pub ifindex: u32,
    pub name: String,
    pub kind: LinkKind,
    /// IFF_* flags.
    pub flags: u32,
    pub mtu: Option<u32>,
    pub operstate: OperState,
    /// Lower device (IFLA_LINK) for vlan/macvlan.
    pub parent: Option<u32>,
    pub vlan_id: Option<u16>,
    /// Peer name, only used when creating a veth pair.
    pub veth_peer: Option<String>,
}

impl Link {
    /// Desired link of `kind` named `name`.
    pub fn new(name: impl Into<String>, kind: LinkKind) -> Self {
        Self {
            name: name.into(),
            kind,
            ..Default::default()
        }
    }

    /// A dummy link.
    pub fn dummy(name: impl Into<String>) -> Self {
        Self::new(name, LinkKind::Dummy)
    }

    /// A veth pair.
    pub fn veth(name: impl Into<String>, peer: impl Into<String>) -> Self {
        Self {
            veth_peer: Some(peer.into()),
            ..Self::new(name, LinkKind::Veth)
        }
    }

    /// A vlan on top of `parent`.
    pub fn vlan(name: impl Into<String>, parent: u32, id: u16) -> Self {
        Self {
            parent: Some(parent),
            vlan_id: Some(id),
            ..Self::new(name, LinkKind::Vlan)
        }
    }

    /// Set the administrative state.
    pub fn up(mut self, up: bool) -> Self {
        if up {
            self.flags |= iff::UP;
        } else {
            self.flags &= !iff::UP;
        }
        self
    }

    pub fn mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn with_ifindex(mut self, ifindex: u32) -> Self {
        self.ifindex = ifindex;
        self
    }

    pub fn is_up(&self) -> bool {
        self.flags & iff::UP != 0
    }

    pub fn has_carrier(&self) -> bool {
        self.flags & iff::LOWER_UP != 0
    }

    /// Whether `self` (cached) already satisfies `desired`.
    pub fn satisfies(&self, desired: &Link) -> bool {
        self.name == desired.name
            && (desired.kind == LinkKind::Unknown || self.kind == desired.kind)
            && self.is_up() == desired.is_up()
            && desired.mtu.is_none_or(|mtu| self.mtu == Some(mtu))
    }

    /// Whether an in-place change can turn `self` into `desired`.
    pub fn changeable_to(&self, desired: &Link) -> bool {
        desired.kind == LinkKind::Unknown || self.kind == desired.kind
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() && self.ifindex == 0 {
            return Err(Error::InvalidArgument(
                "link needs a name or an ifindex".into(),
            ));
        }
        if self.name.len() >= libc::IFNAMSIZ {
            return Err(Error::InvalidArgument(format!(
                "link name too long: {}",
                self.name
            )));
        }
        Ok(())
    }

    pub(crate) fn write_request(&self, action: RequestAction, b: &mut MessageBuilder) -> Result<()> {
        let (flags, change) = match action {
            RequestAction::Delete => (0, 0),
            _ => (self.flags & iff::UP, iff::UP),
        };
        b.append(&IfInfoMsg {
            ifi_index: self.ifindex as i32,
            ifi_flags: flags,
            ifi_change: change,
            ..Default::default()
        });

        if !self.name.is_empty() {
            b.append_attr_str(ifla::IFNAME, &self.name);
        }
        if action == RequestAction::Delete {
            return Ok(());
        }
        if let Some(mtu) = self.mtu {
            b.append_attr_u32(ifla::MTU, mtu);
        }
        if action == RequestAction::Create {
            if !self.kind.is_creatable() {
                return Err(Error::NotSupported(format!(
                    "links of kind {} cannot be created",
                    self.kind
                )));
            }
            if let Some(parent) = self.parent {
                b.append_attr_u32(ifla::LINK, parent);
            }
            self.write_linkinfo(b)?;
        }
        Ok(())
    }

    /// Write the link the way the kernel reports it in dumps and
    /// notifications: full flags, device type and link info.
    pub(crate) fn write_kernel_form(&self, b: &mut MessageBuilder) -> Result<()> {
        b.append(&IfInfoMsg {
            ifi_type: self.kind.arphrd(),
            ifi_index: self.ifindex as i32,
            ifi_flags: self.flags,
            ..Default::default()
        });
        b.append_attr_str(ifla::IFNAME, &self.name);
        if let Some(mtu) = self.mtu {
            b.append_attr_u32(ifla::MTU, mtu);
        }
        if let Some(parent) = self.parent {
            b.append_attr_u32(ifla::LINK, parent);
        }
        b.append_attr_u8(ifla::OPERSTATE, self.operstate.into());
        self.write_linkinfo(b)
    }

    fn write_linkinfo(&self, b: &mut MessageBuilder) -> Result<()> {
        let Some(kind) = self.kind.rtnl_kind() else {
            return Ok(());
        };
        let linkinfo = b.nest_start(ifla::LINKINFO);
        b.append_attr_str(ifla_info::KIND, kind);
        match self.kind {
            LinkKind::Vlan => {
                let id = self.vlan_id.ok_or_else(|| {
                    Error::InvalidArgument(format!("vlan {} needs an id", self.name))
                })?;
                let data = b.nest_start(ifla_info::DATA);
                b.append_attr(ifla_vlan::ID, &id.to_ne_bytes());
                b.nest_end(data);
            }
            LinkKind::Veth => {
                if let Some(peer) = &self.veth_peer {
                    let data = b.nest_start(ifla_info::DATA);
                    let peer_nest = b.nest_start(veth_info::PEER);
                    b.append(&IfInfoMsg::default());
                    b.append_attr_str(ifla::IFNAME, peer);
                    b.nest_end(peer_nest);
                    b.nest_end(data);
                }
            }
            _ => {}
        }
        b.nest_end(linkinfo);
        Ok(())
    }
}

impl FromNetlink for Link {
    fn parse(input: &mut &[u8]) -> PResult<Self> {
        let hdr: IfInfoMsg = parse_header(input)?;
        let mut link = Link {
            ifindex: hdr.ifi_index as u32,
            flags: hdr.ifi_flags,
            kind: LinkKind::from_arphrd(hdr.ifi_type),
            ..Default::default()
        };

        for (kind, payload) in parse_attrs(input)? {
            match kind {
                ifla::IFNAME => link.name = lift(get::string(payload))?.to_owned(),
                ifla::MTU => link.mtu = Some(lift(get::u32_ne(payload))?),
                ifla::LINK => link.parent = Some(lift(get::u32_ne(payload))?),
                ifla::OPERSTATE => link.operstate = OperState::from(lift(get::u8(payload))?),
                ifla::LINKINFO => parse_linkinfo(&mut link, payload)?,
                _ => {}
            }
        }

        if hdr.ifi_type == arphrd::NONE && link.kind == LinkKind::Unknown {
            link.kind = LinkKind::Tun;
        }
        Ok(link)
    }
}

fn parse_linkinfo(link: &mut Link, mut data: &[u8]) -> PResult<()> {
    let mut info_data: Option<&[u8]> = None;
    for (kind, payload) in parse_attrs(&mut data)? {
        match kind {
            ifla_info::KIND => {
                let parsed = LinkKind::from_rtnl_kind(lift(get::string(payload))?);
                if parsed != LinkKind::Unknown {
                    link.kind = parsed;
                }
            }
            ifla_info::DATA => info_data = Some(payload),
            _ => {}
        }
    }
    if let (LinkKind::Vlan, Some(mut data)) = (link.kind, info_data) {
        for (kind, payload) in parse_attrs(&mut data)? {
            if kind == ifla_vlan::ID {
                link.vlan_id = Some(lift(get::u16_ne(payload))?);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::NLMSG_HDRLEN;

    fn round_trip(link: &Link, action: RequestAction) -> Link {
        let mut b = MessageBuilder::new(16, 0);
        link.write_request(action, &mut b).unwrap();
        let msg = b.finish();
        Link::from_bytes(&msg[NLMSG_HDRLEN..]).unwrap()
    }

    #[test]
    fn test_kind_table() {
        assert_eq!(LinkKind::from_rtnl_kind("dummy"), LinkKind::Dummy);
        assert_eq!(LinkKind::from_rtnl_kind("nonsense"), LinkKind::Unknown);
        assert!(LinkKind::Dummy.is_software());
        assert!(!LinkKind::Ethernet.is_creatable());
        assert!(LinkKind::Veth.supports_setting(SettingType::Ethernet));
        assert!(!LinkKind::Bridge.supports_setting(SettingType::Ethernet));
        assert!(LinkKind::Wpan.supports_setting(SettingType::Wpan));
        assert_eq!(LinkKind::Wpan.to_string(), "wpan");
        assert_eq!(LinkKind::Bridge.to_string(), "bridge");
    }

    #[test]
    fn test_create_request_parses_back() {
        let desired = Link::dummy("test0").up(true).mtu(1400);
        let parsed = round_trip(&desired, RequestAction::Create);
        assert_eq!(parsed.name, "test0");
        assert_eq!(parsed.kind, LinkKind::Dummy);
        assert_eq!(parsed.mtu, Some(1400));
        assert!(parsed.is_up());
        assert!(parsed.satisfies(&desired));
    }

    #[test]
    fn test_vlan_request() {
        let desired = Link::vlan("eth0.10", 2, 10);
        let parsed = round_trip(&desired, RequestAction::Create);
        assert_eq!(parsed.kind, LinkKind::Vlan);
        assert_eq!(parsed.vlan_id, Some(10));
        assert_eq!(parsed.parent, Some(2));

        let mut missing_id = desired.clone();
        missing_id.vlan_id = None;
        let mut b = MessageBuilder::new(16, 0);
        assert!(missing_id
            .write_request(RequestAction::Create, &mut b)
            .is_err());
    }

    #[test]
    fn test_hardware_kinds_not_creatable() {
        let mut b = MessageBuilder::new(16, 0);
        let err = Link::new("eth0", LinkKind::Ethernet)
            .write_request(RequestAction::Create, &mut b)
            .unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn test_satisfies() {
        let cached = Link {
            ifindex: 3,
            name: "test0".into(),
            kind: LinkKind::Dummy,
            flags: iff::UP | iff::RUNNING,
            mtu: Some(1500),
            ..Default::default()
        };
        assert!(cached.satisfies(&Link::dummy("test0").up(true)));
        assert!(!cached.satisfies(&Link::dummy("test0")));
        assert!(!cached.satisfies(&Link::dummy("test0").up(true).mtu(9000)));
        assert!(cached.satisfies(&Link::new("test0", LinkKind::Unknown).up(true)));
    }

    #[test]
    fn test_validate() {
        assert!(Link::default().validate().is_err());
        assert!(Link::dummy("a-very-long-interface-name").validate().is_err());
        assert!(Link::dummy("test0").validate().is_ok());
    }
}

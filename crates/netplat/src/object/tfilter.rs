//! Traffic filter snapshots and their single attached action.

use std::fmt;
use std::str::FromStr;

use zerocopy::FromBytes;

use crate::netlink::attr::{self, AttrIter, get};
use crate::netlink::builder::MessageBuilder;
use crate::netlink::error::{Error, Result};
use crate::netlink::parse::{FromNetlink, PResult, lift, parse_attrs, parse_header};
use crate::netlink::types::tc::{
    ETH_P_ALL, TcGen, TcMirred, TcMsg, act, basic, gact, matchall, mirred, simple, tc_act, tca,
};

use super::RequestAction;
use super::handle::TcHandle;

/// Action table slot used for the one action we attach.
const ACTION_SLOT: u16 = 1;

/// The action a filter runs on match.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum TcAction {
    /// act_simple: logs `sdata` and continues.
    Simple { sdata: String },
    /// act_gact with a fixed verdict (TC_ACT_*).
    Gact { verdict: i32 },
    /// act_mirred: mirror or redirect to `ifindex`.
    Mirred {
        ingress: bool,
        redirect: bool,
        ifindex: u32,
    },
}

impl TcAction {
    pub fn simple(sdata: impl Into<String>) -> Self {
        TcAction::Simple {
            sdata: sdata.into(),
        }
    }

    pub fn drop() -> Self {
        TcAction::Gact {
            verdict: tc_act::SHOT,
        }
    }

    pub fn pass() -> Self {
        TcAction::Gact {
            verdict: tc_act::OK,
        }
    }

    /// Redirect egress traffic to `ifindex`.
    pub fn redirect(ifindex: u32) -> Self {
        TcAction::Mirred {
            ingress: false,
            redirect: true,
            ifindex,
        }
    }

    /// The kernel action kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TcAction::Simple { .. } => "simple",
            TcAction::Gact { .. } => "gact",
            TcAction::Mirred { .. } => "mirred",
        }
    }

    fn write(&self, b: &mut MessageBuilder) {
        let slot = b.nest_start(ACTION_SLOT);
        b.append_attr_str(act::KIND, self.kind());
        let opts = b.nest_start(act::OPTIONS);
        match self {
            TcAction::Simple { sdata } => {
                let parms = TcGen {
                    action: tc_act::PIPE,
                    ..Default::default()
                };
                b.append_attr(simple::PARMS, zerocopy::IntoBytes::as_bytes(&parms));
                b.append_attr_str(simple::DATA, sdata);
            }
            TcAction::Gact { verdict } => {
                let parms = TcGen {
                    action: *verdict,
                    ..Default::default()
                };
                b.append_attr(gact::PARMS, zerocopy::IntoBytes::as_bytes(&parms));
            }
            TcAction::Mirred {
                ingress,
                redirect,
                ifindex,
            } => {
                let eaction = match (ingress, redirect) {
                    (false, true) => mirred::EGRESS_REDIR,
                    (false, false) => mirred::EGRESS_MIRROR,
                    (true, true) => mirred::INGRESS_REDIR,
                    (true, false) => mirred::INGRESS_MIRROR,
                };
                let parms = TcMirred {
                    generic: TcGen {
                        action: if *redirect { tc_act::STOLEN } else { tc_act::PIPE },
                        ..Default::default()
                    },
                    eaction,
                    ifindex: *ifindex,
                };
                b.append_attr(mirred::PARMS, zerocopy::IntoBytes::as_bytes(&parms));
            }
        }
        b.nest_end(opts);
        b.nest_end(slot);
    }

    /// Decode the first action in an action table; unknown kinds yield `None`.
    fn parse_table(table: &[u8]) -> Result<Option<Self>> {
        let Some((_, slot)) = AttrIter::new(table).next() else {
            return Ok(None);
        };
        let kind = attr::find(slot, act::KIND)
            .map(get::string)
            .transpose()?
            .unwrap_or_default();
        let opts = attr::find(slot, act::OPTIONS).unwrap_or_default();

        let parms = |id: u16| -> Result<TcGen> {
            let data = attr::find(opts, id)
                .ok_or_else(|| Error::InvalidAttribute(format!("{} action without parms", kind)))?;
            TcGen::read_from_prefix(data)
                .map(|(g, _)| g)
                .map_err(|_| Error::InvalidAttribute(format!("short {} parms", kind)))
        };

        let action = match kind {
            "simple" => {
                let sdata = attr::find(opts, simple::DATA)
                    .map(get::string)
                    .transpose()?
                    .unwrap_or_default();
                TcAction::simple(sdata)
            }
            "gact" => TcAction::Gact {
                verdict: parms(gact::PARMS)?.action,
            },
            "mirred" => {
                let data = attr::find(opts, mirred::PARMS)
                    .ok_or_else(|| Error::InvalidAttribute("mirred without parms".into()))?;
                let (m, _) = TcMirred::read_from_prefix(data)
                    .map_err(|_| Error::InvalidAttribute("short mirred parms".into()))?;
                TcAction::Mirred {
                    ingress: matches!(m.eaction, mirred::INGRESS_REDIR | mirred::INGRESS_MIRROR),
                    redirect: matches!(m.eaction, mirred::EGRESS_REDIR | mirred::INGRESS_REDIR),
                    ifindex: m.ifindex,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(action))
    }
}

fn verdict_name(verdict: i32) -> Option<&'static str> {
    match verdict {
        tc_act::OK => Some("pass"),
        tc_act::SHOT => Some("drop"),
        tc_act::PIPE => Some("pipe"),
        tc_act::RECLASSIFY => Some("reclassify"),
        tc_act::STOLEN => Some("stolen"),
        _ => None,
    }
}

/// `simple sdata <text>`, `drop`, `pass`, `mirred egress redirect dev <ifindex>`.
impl fmt::Display for TcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TcAction::Simple { sdata } => write!(f, "simple sdata {}", sdata),
            TcAction::Gact { verdict } => match verdict_name(*verdict) {
                Some(name) => f.write_str(name),
                None => write!(f, "gact {}", verdict),
            },
            TcAction::Mirred {
                ingress,
                redirect,
                ifindex,
            } => write!(
                f,
                "mirred {} {} dev {}",
                if *ingress { "ingress" } else { "egress" },
                if *redirect { "redirect" } else { "mirror" },
                ifindex
            ),
        }
    }
}

impl FromStr for TcAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidArgument(format!("invalid action: {:?}", s));
        let s = s.trim();
        if let Some(rest) = s.strip_prefix("simple") {
            let sdata = rest
                .trim_start()
                .strip_prefix("sdata")
                .ok_or_else(invalid)?
                .trim();
            if sdata.is_empty() {
                return Err(invalid());
            }
            return Ok(TcAction::simple(sdata));
        }
        let words: Vec<&str> = s.split_whitespace().collect();
        match words.as_slice() {
            ["drop"] => Ok(TcAction::drop()),
            ["pass"] | ["ok"] => Ok(TcAction::pass()),
            ["pipe"] => Ok(TcAction::Gact {
                verdict: tc_act::PIPE,
            }),
            ["mirred", dir, mode, "dev", ifindex] => Ok(TcAction::Mirred {
                ingress: match *dir {
                    "ingress" => true,
                    "egress" => false,
                    _ => return Err(invalid()),
                },
                redirect: match *mode {
                    "redirect" => true,
                    "mirror" => false,
                    _ => return Err(invalid()),
                },
                ifindex: ifindex.parse().map_err(|_| invalid())?,
            }),
            _ => Err(invalid()),
        }
    }
}

/// A classifier attached to a qdisc.
///
/// Identity is `(ifindex, parent, protocol, prio, handle)`, so several
/// filters can share a parent. The kernel picks `prio` and `handle` when
/// they are left at 0 and the cached snapshot records what it chose; a
/// desired filter with either left at 0 is looked up by what it does
/// rather than by its key.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Tfilter {
    pub ifindex: u32,
    /// Classifier kind (`matchall`, `basic`).
    pub kind: String,
    pub handle: TcHandle,
    pub parent: TcHandle,
    pub prio: u16,
    /// Link-layer protocol, host order.
    pub protocol: u16,
    pub action: Option<TcAction>,
}

impl Tfilter {
    /// A filter matching every frame at `parent`.
    pub fn matchall(ifindex: u32, parent: TcHandle, action: TcAction) -> Self {
        Self {
            ifindex,
            kind: "matchall".into(),
            handle: TcHandle::UNSPEC,
            parent,
            prio: 0,
            protocol: ETH_P_ALL,
            action: Some(action),
        }
    }

    pub fn with_prio(mut self, prio: u16) -> Self {
        self.prio = prio;
        self
    }

    pub fn with_protocol(mut self, protocol: u16) -> Self {
        self.protocol = protocol;
        self
    }

    fn action_attr(&self) -> Option<u16> {
        match self.kind.as_str() {
            "matchall" => Some(matchall::ACT),
            "basic" => Some(basic::ACT),
            _ => None,
        }
    }

    /// Whether both `prio` and `handle` are set, so the filter names exactly
    /// one kernel filter.
    pub fn is_keyed(&self) -> bool {
        self.prio != 0 && !self.handle.is_unspec()
    }

    /// Whether `self` and `other` can be the same kernel filter: same attach
    /// point and protocol, and `prio`/`handle` equal wherever both are set.
    pub fn same_slot(&self, other: &Tfilter) -> bool {
        self.ifindex == other.ifindex
            && self.parent == other.parent
            && self.protocol == other.protocol
            && (self.prio == 0 || other.prio == 0 || self.prio == other.prio)
            && (self.handle.is_unspec() || other.handle.is_unspec() || self.handle == other.handle)
    }

    /// Whether `self` (cached) already satisfies `desired`.
    pub fn satisfies(&self, desired: &Tfilter) -> bool {
        self.same_slot(desired) && self.kind == desired.kind && self.action == desired.action
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.ifindex == 0 || self.parent.is_unspec() {
            return Err(Error::InvalidArgument(format!(
                "{} filter needs an interface and a parent",
                self.kind
            )));
        }
        if let Some(TcAction::Simple { sdata }) = &self.action
            && sdata.len() >= simple::MAX_DATA
        {
            return Err(Error::InvalidArgument(format!(
                "simple action data is {} bytes, the kernel keeps at most {}",
                sdata.len(),
                simple::MAX_DATA - 1
            )));
        }
        if self.action.is_some() && self.action_attr().is_none() {
            return Err(Error::NotSupported(format!(
                "actions on {} filters",
                self.kind
            )));
        }
        Ok(())
    }

    pub(crate) fn write_request(&self, action: RequestAction, b: &mut MessageBuilder) -> Result<()> {
        if action == RequestAction::Delete && self.prio == 0 {
            // Flush form: the kernel rejects protocol, handle or kind here.
            b.append(&TcMsg {
                tcm_family: libc::AF_UNSPEC as u8,
                tcm_ifindex: self.ifindex as i32,
                tcm_parent: self.parent.as_raw(),
                ..Default::default()
            });
            return Ok(());
        }
        b.append(&TcMsg {
            tcm_family: libc::AF_UNSPEC as u8,
            tcm_ifindex: self.ifindex as i32,
            tcm_handle: self.handle.as_raw(),
            tcm_parent: self.parent.as_raw(),
            tcm_info: ((self.prio as u32) << 16) | self.protocol.to_be() as u32,
            ..Default::default()
        });
        b.append_attr_str(tca::KIND, &self.kind);
        if action == RequestAction::Delete {
            return Ok(());
        }
        if let Some(tc_action) = &self.action {
            let attr = self.action_attr().ok_or_else(|| {
                Error::NotSupported(format!("actions on {} filters", self.kind))
            })?;
            let opts = b.nest_start(tca::OPTIONS);
            let table = b.nest_start(attr);
            tc_action.write(b);
            b.nest_end(table);
            b.nest_end(opts);
        }
        Ok(())
    }
}

impl FromNetlink for Tfilter {
    fn parse(input: &mut &[u8]) -> PResult<Self> {
        let hdr: TcMsg = parse_header(input)?;
        let mut filter = Tfilter {
            ifindex: hdr.tcm_ifindex as u32,
            kind: String::new(),
            handle: TcHandle::from_raw(hdr.tcm_handle),
            parent: TcHandle::from_raw(hdr.tcm_parent),
            prio: (hdr.tcm_info >> 16) as u16,
            protocol: u16::from_be((hdr.tcm_info & 0xFFFF) as u16),
            action: None,
        };
        let mut options = None;
        for (kind, payload) in parse_attrs(input)? {
            match kind {
                tca::KIND => filter.kind = lift(get::string(payload))?.to_owned(),
                tca::OPTIONS => options = Some(payload),
                _ => {}
            }
        }
        if let (Some(attr), Some(opts)) = (filter.action_attr(), options)
            && let Some(table) = attr::find(opts, attr)
        {
            filter.action = lift(TcAction::parse_table(table))?;
        }
        Ok(filter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::message::NLMSG_HDRLEN;

    fn round_trip(filter: &Tfilter) -> Tfilter {
        let mut b = MessageBuilder::new(44, 0);
        filter
            .write_request(RequestAction::Create, &mut b)
            .unwrap();
        let msg = b.finish();
        Tfilter::from_bytes(&msg[NLMSG_HDRLEN..]).unwrap()
    }

    #[test]
    fn test_matchall_simple_round_trip() {
        let desired = Tfilter::matchall(4, TcHandle::new(0x8003, 0), TcAction::simple("Egress"));
        let parsed = round_trip(&desired);
        assert_eq!(parsed, desired);
        assert_eq!(parsed.protocol, ETH_P_ALL);
    }

    #[test]
    fn test_info_encoding() {
        let f = Tfilter::matchall(4, TcHandle::INGRESS_QDISC, TcAction::drop()).with_prio(0xC000);
        let mut b = MessageBuilder::new(44, 0);
        f.write_request(RequestAction::Create, &mut b).unwrap();
        let msg = b.finish();
        let info = u32::from_ne_bytes(msg[NLMSG_HDRLEN + 16..NLMSG_HDRLEN + 20].try_into().unwrap());
        assert_eq!(info >> 16, 0xC000);
        assert_eq!(u16::from_be((info & 0xFFFF) as u16), ETH_P_ALL);
    }

    #[test]
    fn test_delete_without_prio_flushes_parent() {
        let f = Tfilter::matchall(4, TcHandle::INGRESS_QDISC, TcAction::drop());
        let mut b = MessageBuilder::new(45, 0);
        f.write_request(RequestAction::Delete, &mut b).unwrap();
        let msg = b.finish();
        assert_eq!(msg.len(), NLMSG_HDRLEN + 20);
        let handle = u32::from_ne_bytes(msg[NLMSG_HDRLEN + 8..NLMSG_HDRLEN + 12].try_into().unwrap());
        let info = u32::from_ne_bytes(msg[NLMSG_HDRLEN + 16..NLMSG_HDRLEN + 20].try_into().unwrap());
        assert_eq!(handle, 0);
        assert_eq!(info, 0);
    }

    #[test]
    fn test_mirred_round_trip() {
        let desired = Tfilter::matchall(4, TcHandle::INGRESS_QDISC, TcAction::redirect(9));
        assert_eq!(round_trip(&desired), desired);
    }

    #[test]
    fn test_satisfies_kernel_assigned_fields() {
        let desired = Tfilter::matchall(4, TcHandle::new(0x8003, 0), TcAction::simple("Egress"));
        let mut cached = desired.clone();
        cached.prio = 0xC000;
        cached.handle = TcHandle::from_raw(1);
        assert!(cached.satisfies(&desired));

        let other = Tfilter::matchall(4, TcHandle::new(0x8003, 0), TcAction::simple("Other"));
        assert!(!cached.satisfies(&other));
        assert!(!cached.satisfies(&desired.clone().with_prio(1)));
    }

    #[test]
    fn test_filters_at_one_parent_are_told_apart() {
        let parent = TcHandle::INGRESS_QDISC;
        let mut first = Tfilter::matchall(4, parent, TcAction::pass()).with_prio(1);
        first.handle = TcHandle::from_raw(1);
        let mut second = Tfilter::matchall(4, parent, TcAction::drop()).with_prio(2);
        second.handle = TcHandle::from_raw(1);
        assert!(first.is_keyed());
        assert!(!first.same_slot(&second));

        // An unkeyed request only matches the filter doing the same thing.
        let wanted = Tfilter::matchall(4, parent, TcAction::drop());
        assert!(!wanted.is_keyed());
        assert!(!first.satisfies(&wanted));
        assert!(second.satisfies(&wanted));
        assert!(!second.satisfies(&wanted.clone().with_protocol(0x0800)));
    }

    #[test]
    fn test_simple_data_limit() {
        let parent = TcHandle::INGRESS_QDISC;
        let fits = Tfilter::matchall(4, parent, TcAction::simple("x".repeat(31)));
        assert!(fits.validate().is_ok());
        let long = Tfilter::matchall(4, parent, TcAction::simple("x".repeat(32)));
        assert!(matches!(long.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_huge_action_data_never_reaches_the_wire() {
        let f = Tfilter::matchall(4, TcHandle::INGRESS_QDISC, TcAction::simple("x".repeat(70_000)));
        assert!(f.validate().is_err());
        let mut b = MessageBuilder::new(44, 0);
        f.write_request(RequestAction::Create, &mut b).unwrap();
        assert!(matches!(b.check(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_action_text_forms() {
        assert_eq!(
            "simple sdata Hello".parse::<TcAction>().unwrap(),
            TcAction::simple("Hello")
        );
        assert_eq!("drop".parse::<TcAction>().unwrap(), TcAction::drop());
        assert_eq!(TcAction::drop().to_string(), "drop");
        assert_eq!(TcAction::simple("Hello").to_string(), "simple sdata Hello");
        let m: TcAction = "mirred egress redirect dev 9".parse().unwrap();
        assert_eq!(m, TcAction::redirect(9));
        assert_eq!(m.to_string(), "mirred egress redirect dev 9");
        assert!("simple".parse::<TcAction>().is_err());
        assert!("explode".parse::<TcAction>().is_err());
    }

    #[test]
    fn test_validate() {
        let mut f = Tfilter::matchall(4, TcHandle::ROOT, TcAction::pass());
        assert!(f.validate().is_ok());
        f.kind = "u32".into();
        assert!(matches!(f.validate(), Err(Error::NotSupported(_))));
        f.ifindex = 0;
        assert!(matches!(f.validate(), Err(Error::InvalidArgument(_))));
    }
}

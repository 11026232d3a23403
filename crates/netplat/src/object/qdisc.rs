//! Queueing discipline snapshots.

use std::fmt;
use std::str::FromStr;

use crate::netlink::attr::{AttrIter, get};
use crate::netlink::builder::MessageBuilder;
use crate::netlink::error::{Error, Result};
use crate::netlink::parse::{FromNetlink, PResult, lift, parse_attrs, parse_header};
use crate::netlink::types::tc::{TcMsg, fq_codel, tca};

use super::RequestAction;
use super::handle::TcHandle;

/// Kinds that take no options at all.
const PARAMETERLESS: &[&str] = &["ingress", "clsact", "pfifo_fast", "noqueue", "mq"];

/// Typed fq_codel parameters. `None` leaves the kernel default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct FqCodelParams {
    pub target_us: Option<u32>,
    pub limit: Option<u32>,
    pub interval_us: Option<u32>,
    pub ecn: Option<bool>,
    pub flows: Option<u32>,
    pub quantum: Option<u32>,
    pub ce_threshold_us: Option<u32>,
    pub drop_batch_size: Option<u32>,
    pub memory_limit: Option<u32>,
}

impl FqCodelParams {
    /// Every field set in `desired` has the same value here.
    pub fn covers(&self, desired: &FqCodelParams) -> bool {
        fn same<T: PartialEq>(have: Option<T>, want: Option<T>) -> bool {
            want.is_none() || have == want
        }
        same(self.target_us, desired.target_us)
            && same(self.limit, desired.limit)
            && same(self.interval_us, desired.interval_us)
            && same(self.ecn, desired.ecn)
            && same(self.flows, desired.flows)
            && same(self.quantum, desired.quantum)
            && same(self.ce_threshold_us, desired.ce_threshold_us)
            && same(self.drop_batch_size, desired.drop_batch_size)
            && same(self.memory_limit, desired.memory_limit)
    }

    fn write(&self, b: &mut MessageBuilder) {
        let fields = [
            (fq_codel::TARGET, self.target_us),
            (fq_codel::LIMIT, self.limit),
            (fq_codel::INTERVAL, self.interval_us),
            (fq_codel::ECN, self.ecn.map(u32::from)),
            (fq_codel::FLOWS, self.flows),
            (fq_codel::QUANTUM, self.quantum),
            (fq_codel::CE_THRESHOLD, self.ce_threshold_us),
            (fq_codel::DROP_BATCH_SIZE, self.drop_batch_size),
            (fq_codel::MEMORY_LIMIT, self.memory_limit),
        ];
        for (kind, value) in fields {
            if let Some(value) = value {
                b.append_attr_u32(kind, value);
            }
        }
    }

    fn parse(data: &[u8]) -> Result<Self> {
        let mut p = FqCodelParams::default();
        for (kind, payload) in AttrIter::new(data) {
            let value = Some(get::u32_ne(payload)?);
            match kind {
                fq_codel::TARGET => p.target_us = value,
                fq_codel::LIMIT => p.limit = value,
                fq_codel::INTERVAL => p.interval_us = value,
                fq_codel::ECN => p.ecn = value.map(|v| v != 0),
                fq_codel::FLOWS => p.flows = value,
                fq_codel::QUANTUM => p.quantum = value,
                fq_codel::CE_THRESHOLD => p.ce_threshold_us = value,
                fq_codel::DROP_BATCH_SIZE => p.drop_batch_size = value,
                fq_codel::MEMORY_LIMIT => p.memory_limit = value,
                _ => {}
            }
        }
        Ok(p)
    }
}

/// Kind-specific qdisc parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum QdiscOptions {
    /// No options (or none that we track).
    #[default]
    None,
    FqCodel(FqCodelParams),
    /// Undecoded TCA_OPTIONS payload of another kind.
    Raw(Vec<u8>),
}

/// A queueing discipline attached to an interface.
///
/// Identity is `(ifindex, parent)`: one qdisc per attach point.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Qdisc {
    pub ifindex: u32,
    pub kind: String,
    pub handle: TcHandle,
    pub parent: TcHandle,
    pub options: QdiscOptions,
}

impl Qdisc {
    pub fn new(ifindex: u32, kind: impl Into<String>, handle: TcHandle, parent: TcHandle) -> Self {
        Self {
            ifindex,
            kind: kind.into(),
            handle,
            parent,
            options: QdiscOptions::None,
        }
    }

    /// fq_codel at the root.
    pub fn fq_codel(ifindex: u32, handle: TcHandle, params: FqCodelParams) -> Self {
        Self {
            options: QdiscOptions::FqCodel(params),
            ..Self::new(ifindex, "fq_codel", handle, TcHandle::ROOT)
        }
    }

    /// The ingress qdisc, which always lives at `ffff:` under the ingress
    /// attach point.
    pub fn ingress(ifindex: u32) -> Self {
        Self::new(ifindex, "ingress", TcHandle::INGRESS_QDISC, TcHandle::INGRESS)
    }

    /// A kernel default qdisc (handle 0). These are replaced implicitly by
    /// any qdisc created at the same parent.
    pub fn is_default(&self) -> bool {
        self.handle.is_unspec()
    }

    /// Whether `self` (cached) already satisfies `desired`.
    pub fn satisfies(&self, desired: &Qdisc) -> bool {
        self.kind == desired.kind
            && (desired.handle.is_unspec() || self.handle == desired.handle)
            && match (&self.options, &desired.options) {
                (_, QdiscOptions::None) => true,
                (QdiscOptions::FqCodel(have), QdiscOptions::FqCodel(want)) => have.covers(want),
                (have, want) => have == want,
            }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.kind.is_empty() {
            return Err(Error::InvalidArgument("qdisc kind is empty".into()));
        }
        if self.ifindex == 0 {
            return Err(Error::InvalidArgument(format!(
                "qdisc {} needs an interface",
                self.kind
            )));
        }
        if self.parent.is_unspec() {
            return Err(Error::InvalidArgument(format!(
                "qdisc {} needs a parent",
                self.kind
            )));
        }
        if self.kind == "ingress" && self.parent != TcHandle::INGRESS {
            return Err(Error::InvalidArgument(
                "ingress qdisc must attach at the ingress parent".into(),
            ));
        }
        match (&self.options, self.kind.as_str()) {
            (QdiscOptions::FqCodel(_), "fq_codel") | (QdiscOptions::None, _) => Ok(()),
            (QdiscOptions::Raw(_), kind) if !PARAMETERLESS.contains(&kind) => Ok(()),
            (_, kind) => Err(Error::InvalidArgument(format!(
                "options do not match qdisc kind {}",
                kind
            ))),
        }
    }

    pub(crate) fn write_request(&self, action: RequestAction, b: &mut MessageBuilder) -> Result<()> {
        b.append(&TcMsg {
            tcm_family: libc::AF_UNSPEC as u8,
            tcm_ifindex: self.ifindex as i32,
            tcm_handle: self.handle.as_raw(),
            tcm_parent: self.parent.as_raw(),
            ..Default::default()
        });
        b.append_attr_str(tca::KIND, &self.kind);
        if action == RequestAction::Delete {
            return Ok(());
        }
        match &self.options {
            QdiscOptions::None => {}
            QdiscOptions::FqCodel(params) => {
                let nest = b.nest_start(tca::OPTIONS);
                params.write(b);
                b.nest_end(nest);
            }
            QdiscOptions::Raw(bytes) => b.append_attr(tca::OPTIONS, bytes),
        }
        Ok(())
    }
}

impl FromNetlink for Qdisc {
    fn parse(input: &mut &[u8]) -> PResult<Self> {
        let hdr: TcMsg = parse_header(input)?;
        let mut qdisc = Qdisc::new(
            hdr.tcm_ifindex as u32,
            String::new(),
            TcHandle::from_raw(hdr.tcm_handle),
            TcHandle::from_raw(hdr.tcm_parent),
        );
        let mut options = None;
        for (kind, payload) in parse_attrs(input)? {
            match kind {
                tca::KIND => qdisc.kind = lift(get::string(payload))?.to_owned(),
                tca::OPTIONS => options = Some(payload),
                _ => {}
            }
        }
        qdisc.options = match options {
            None => QdiscOptions::None,
            Some(_) if PARAMETERLESS.contains(&qdisc.kind.as_str()) => QdiscOptions::None,
            Some(data) if qdisc.kind == "fq_codel" => {
                QdiscOptions::FqCodel(lift(FqCodelParams::parse(data))?)
            }
            Some(data) if data.is_empty() => QdiscOptions::None,
            Some(data) => QdiscOptions::Raw(data.to_vec()),
        };
        Ok(qdisc)
    }
}

/// `[dev <ifindex>] (root | parent <handle>) [handle <handle>] <kind>`,
/// e.g. `root fq_codel` or `parent fff1:1 handle 1234: pfifo_fast`.
impl fmt::Display for Qdisc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ifindex != 0 {
            write!(f, "dev {} ", self.ifindex)?;
        }
        if self.parent.is_root() {
            f.write_str("root ")?;
        } else {
            write!(f, "parent {} ", self.parent)?;
        }
        if !self.handle.is_unspec() {
            write!(f, "handle {} ", self.handle)?;
        }
        f.write_str(&self.kind)
    }
}

impl FromStr for Qdisc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| Error::InvalidArgument(format!("qdisc {:?}: {}", s, why));
        let mut qdisc = Qdisc::new(0, String::new(), TcHandle::UNSPEC, TcHandle::UNSPEC);
        let mut words = s.split_whitespace();
        while let Some(word) = words.next() {
            match word {
                "root" => qdisc.parent = TcHandle::ROOT,
                "ingress" if qdisc.parent.is_unspec() => {
                    qdisc.parent = TcHandle::INGRESS;
                    qdisc.handle = TcHandle::INGRESS_QDISC;
                    qdisc.kind = "ingress".into();
                }
                "parent" | "handle" | "dev" => {
                    let value = words.next().ok_or_else(|| invalid("missing value"))?;
                    match word {
                        "parent" => qdisc.parent = value.parse()?,
                        "handle" => qdisc.handle = value.parse()?,
                        _ => {
                            qdisc.ifindex =
                                value.parse().map_err(|_| invalid("bad ifindex"))?
                        }
                    }
                }
                kind if qdisc.kind.is_empty() => qdisc.kind = kind.to_owned(),
                _ => return Err(invalid("trailing input")),
            }
        }
        if qdisc.kind.is_empty() {
            return Err(invalid("missing kind"));
        }
        if qdisc.parent.is_unspec() {
            return Err(invalid("missing parent"));
        }
        Ok(qdisc)
    }
}

//! Kernel capability detection.
//!
//! Which optional features a kernel has is answered once and memoised as a
//! [`KernelSupport`] bitmask. Socket-level features and the availability of
//! TC and IPv6 come from the netlink socket and from probe dumps. Optional
//! qdisc, classifier, action and link kinds come from the module index:
//! loaded modules under `/sys/module` plus `modules.builtin` and
//! `modules.dep` of the running kernel. Without module data every kind is
//! assumed present and the kernel gets the final word.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::ops::{BitOr, BitOrAssign};
use std::path::{Path, PathBuf};

use crate::netlink::error::{Error, Result};
use crate::object::PlatformObject;

/// Bitmask of optional kernel features.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct KernelSupport(u32);

impl KernelSupport {
    pub const EXTENDED_ACK: Self = Self(1 << 0);
    pub const STRICT_CHECK: Self = Self(1 << 1);
    pub const TC: Self = Self(1 << 2);
    /// NLM_F_REPLACE works for qdiscs, filters, routes and addresses.
    pub const REPLACE: Self = Self(1 << 3);
    pub const IPV6: Self = Self(1 << 4);

    pub const QDISC_FQ_CODEL: Self = Self(1 << 8);
    /// `ingress` and `clsact`, both provided by sch_ingress.
    pub const QDISC_INGRESS: Self = Self(1 << 9);
    pub const CLS_MATCHALL: Self = Self(1 << 10);
    pub const CLS_BASIC: Self = Self(1 << 11);
    pub const ACT_SIMPLE: Self = Self(1 << 12);
    pub const ACT_GACT: Self = Self(1 << 13);
    pub const ACT_MIRRED: Self = Self(1 << 14);

    pub const LINK_DUMMY: Self = Self(1 << 16);
    pub const LINK_VETH: Self = Self(1 << 17);
    pub const LINK_BRIDGE: Self = Self(1 << 18);
    pub const LINK_BOND: Self = Self(1 << 19);
    pub const LINK_VLAN: Self = Self(1 << 20);
    pub const LINK_MACVLAN: Self = Self(1 << 21);
    pub const LINK_IFB: Self = Self(1 << 22);
    pub const LINK_WIREGUARD: Self = Self(1 << 23);
    pub const LINK_VRF: Self = Self(1 << 24);

    pub const fn empty() -> Self {
        Self(0)
    }

    /// Every known feature.
    pub fn all() -> Self {
        FEATURES
            .iter()
            .fold(Self::empty(), |acc, feature| acc | feature.flag)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Unknown bits are dropped.
    pub fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::all().0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// The flag behind a feature name such as `"fq_codel"` or `"ipv6"`.
    pub fn flag_for(name: &str) -> Option<Self> {
        FEATURES.iter().find(|f| f.name == name).map(|f| f.flag)
    }

    /// Whether the named feature is available. Unknown names are not.
    pub fn supports(self, name: &str) -> bool {
        Self::flag_for(name).is_some_and(|flag| self.contains(flag))
    }

    /// Names of the features present, in table order.
    pub fn names(self) -> impl Iterator<Item = &'static str> {
        FEATURES
            .iter()
            .filter(move |f| self.contains(f.flag))
            .map(|f| f.name)
    }

    /// Every named feature with its state.
    pub fn report(self) -> Vec<(&'static str, bool)> {
        FEATURES
            .iter()
            .map(|f| (f.name, self.contains(f.flag)))
            .collect()
    }
}

impl BitOr for KernelSupport {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for KernelSupport {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for KernelSupport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("KernelSupport")
            .field(&self.names().collect::<Vec<_>>())
            .finish()
    }
}

struct Feature {
    name: &'static str,
    flag: KernelSupport,
    /// Module providing the feature; `None` for probed features.
    module: Option<&'static str>,
}

const fn feature(name: &'static str, flag: KernelSupport, module: Option<&'static str>) -> Feature {
    Feature { name, flag, module }
}

const FEATURES: &[Feature] = &[
    feature("extended-ack", KernelSupport::EXTENDED_ACK, None),
    feature("strict-check", KernelSupport::STRICT_CHECK, None),
    feature("tc", KernelSupport::TC, None),
    feature("replace", KernelSupport::REPLACE, None),
    feature("ipv6", KernelSupport::IPV6, None),
    feature("fq_codel", KernelSupport::QDISC_FQ_CODEL, Some("sch_fq_codel")),
    feature("ingress", KernelSupport::QDISC_INGRESS, Some("sch_ingress")),
    feature("clsact", KernelSupport::QDISC_INGRESS, Some("sch_ingress")),
    feature("matchall", KernelSupport::CLS_MATCHALL, Some("cls_matchall")),
    feature("basic", KernelSupport::CLS_BASIC, Some("cls_basic")),
    feature("simple", KernelSupport::ACT_SIMPLE, Some("act_simple")),
    feature("gact", KernelSupport::ACT_GACT, Some("act_gact")),
    feature("mirred", KernelSupport::ACT_MIRRED, Some("act_mirred")),
    feature("dummy", KernelSupport::LINK_DUMMY, Some("dummy")),
    feature("veth", KernelSupport::LINK_VETH, Some("veth")),
    feature("bridge", KernelSupport::LINK_BRIDGE, Some("bridge")),
    feature("bond", KernelSupport::LINK_BOND, Some("bonding")),
    feature("vlan", KernelSupport::LINK_VLAN, Some("8021q")),
    feature("macvlan", KernelSupport::LINK_MACVLAN, Some("macvlan")),
    feature("ifb", KernelSupport::LINK_IFB, Some("ifb")),
    feature("wireguard", KernelSupport::LINK_WIREGUARD, Some("wireguard")),
    feature("vrf", KernelSupport::LINK_VRF, Some("vrf")),
];

/// Kernel modules that are loaded, built in, or installed for the running
/// kernel.
#[derive(Debug, Clone, Default)]
pub struct ModuleIndex {
    modules: BTreeSet<String>,
    /// Whether `modules.builtin` or `modules.dep` was read. Without them
    /// the index cannot tell "absent" from "not loaded yet".
    complete: bool,
}

impl ModuleIndex {
    /// Read the module index below `root` (normally `/`).
    pub fn load(root: &Path) -> Self {
        let mut index = Self::default();

        if let Ok(entries) = fs::read_dir(root.join("sys/module")) {
            for entry in entries.flatten() {
                index.insert(&entry.file_name().to_string_lossy());
            }
        }

        let release = fs::read_to_string(root.join("proc/sys/kernel/osrelease"))
            .map(|s| s.trim().to_owned())
            .unwrap_or_default();
        if release.is_empty() {
            tracing::debug!(root = %root.display(), "kernel release unknown, module data unavailable");
            return index;
        }

        for dir in ["lib/modules", "usr/lib/modules"] {
            let base: PathBuf = root.join(dir).join(&release);
            let builtin = fs::read_to_string(base.join("modules.builtin"));
            let dep = fs::read_to_string(base.join("modules.dep"));
            if builtin.is_err() && dep.is_err() {
                continue;
            }
            index.add_listing(builtin.as_deref().unwrap_or(""), dep.as_deref().unwrap_or(""));
            break;
        }
        index
    }

    /// Index from the contents of `modules.builtin` and `modules.dep`.
    pub fn parse(builtin: &str, dep: &str) -> Self {
        let mut index = Self::default();
        index.add_listing(builtin, dep);
        index
    }

    /// Mark a module as loaded.
    pub fn with_loaded(mut self, module: &str) -> Self {
        self.insert(module);
        self
    }

    fn add_listing(&mut self, builtin: &str, dep: &str) {
        for line in builtin.lines() {
            self.insert(module_name(line.trim()));
        }
        for line in dep.lines() {
            if let Some((path, _)) = line.split_once(':') {
                self.insert(module_name(path.trim()));
            }
        }
        self.complete = true;
    }

    fn insert(&mut self, name: &str) {
        if !name.is_empty() {
            self.modules.insert(name.replace('-', "_"));
        }
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Whether `module` is available. Always true without module data.
    pub fn has(&self, module: &str) -> bool {
        !self.complete || self.modules.contains(&module.replace('-', "_"))
    }
}

/// `kernel/net/sched/sch_fq_codel.ko.zst` -> `sch_fq_codel`
fn module_name(path: &str) -> &str {
    let file = path.rsplit('/').next().unwrap_or(path);
    file.split_once(".ko").map_or(file, |(name, _)| name)
}

/// Facts gathered from the socket and the probe dumps.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProbeFacts {
    pub extended_ack: bool,
    pub strict_check: bool,
    /// A qdisc dump succeeded.
    pub tc: bool,
    /// An IPv6 address dump succeeded.
    pub ipv6: bool,
}

/// Combine probe facts with the module index.
pub fn evaluate(facts: &ProbeFacts, modules: &ModuleIndex) -> KernelSupport {
    let mut support = KernelSupport::empty();
    support.set(KernelSupport::EXTENDED_ACK, facts.extended_ack);
    support.set(KernelSupport::STRICT_CHECK, facts.strict_check);
    support.set(KernelSupport::TC, facts.tc);
    support.set(KernelSupport::REPLACE, facts.tc);
    support.set(KernelSupport::IPV6, facts.ipv6);

    for feature in FEATURES {
        if let Some(module) = feature.module {
            let tc_only = feature.flag.0 < KernelSupport::LINK_DUMMY.0;
            if (!tc_only || facts.tc) && modules.has(module) {
                support |= feature.flag;
            }
        }
    }
    support
}

/// Memoised capability state.
#[derive(Debug, Clone)]
pub struct CapabilityProbe {
    module_root: PathBuf,
    cached: Option<KernelSupport>,
}

impl CapabilityProbe {
    pub fn new(module_root: impl Into<PathBuf>) -> Self {
        Self {
            module_root: module_root.into(),
            cached: None,
        }
    }

    /// A probe whose answer is fixed.
    pub fn fixed(support: KernelSupport) -> Self {
        Self {
            module_root: PathBuf::from("/"),
            cached: Some(support),
        }
    }

    pub fn cached(&self) -> Option<KernelSupport> {
        self.cached
    }

    /// Record the outcome of a probe run.
    pub fn finish(&mut self, facts: &ProbeFacts) -> KernelSupport {
        let modules = ModuleIndex::load(&self.module_root);
        let support = evaluate(facts, &modules);
        tracing::info!(
            features = ?support.names().collect::<Vec<_>>(),
            module_data = modules.is_complete(),
            "kernel capabilities probed"
        );
        self.cached = Some(support);
        support
    }

    /// Forget the memoised answer; the next query probes again.
    pub fn invalidate(&mut self) {
        self.cached = None;
    }
}

/// Fail with `NotSupported` if adding `object` needs a missing feature.
///
/// Kinds missing from the feature table are not gated.
pub fn check(support: KernelSupport, object: &PlatformObject) -> Result<()> {
    let require = |name: &str, flag: KernelSupport| -> Result<()> {
        if support.contains(flag) {
            Ok(())
        } else {
            Err(Error::NotSupported(format!(
                "{} is not supported by the running kernel",
                name
            )))
        }
    };
    let require_named = |name: &str| -> Result<()> {
        match KernelSupport::flag_for(name) {
            Some(flag) => require(name, flag),
            None => Ok(()),
        }
    };

    match object {
        PlatformObject::Link(link) => match link.kind.rtnl_kind() {
            Some(kind) if link.kind.is_creatable() => require_named(kind),
            _ => Ok(()),
        },
        PlatformObject::Address(a) if a.is_v6() => require("ipv6", KernelSupport::IPV6),
        PlatformObject::Route(r) if r.is_v6() => require("ipv6", KernelSupport::IPV6),
        PlatformObject::Address(_) | PlatformObject::Route(_) => Ok(()),
        PlatformObject::Qdisc(q) => {
            require("tc", KernelSupport::TC)?;
            require_named(&q.kind)
        }
        PlatformObject::Tfilter(f) => {
            require("tc", KernelSupport::TC)?;
            require_named(&f.kind)?;
            match &f.action {
                Some(action) => require_named(action.kind()),
                None => Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Address, Link, Qdisc, TcAction, TcHandle, Tfilter};

    const BUILTIN: &str = "kernel/net/sched/sch_fq_codel.ko\nkernel/drivers/net/dummy.ko\n";
    const DEP: &str = "kernel/net/sched/cls_matchall.ko.zst:\n\
                       kernel/net/sched/act_simple.ko.xz:\n\
                       kernel/net/sched/sch_ingress.ko: kernel/net/sched/sch_fq_codel.ko\n";

    #[test]
    fn test_module_names() {
        assert_eq!(module_name("kernel/net/sched/sch_fq_codel.ko.zst"), "sch_fq_codel");
        assert_eq!(module_name("dummy.ko"), "dummy");
        assert_eq!(module_name("8021q"), "8021q");
    }

    #[test]
    fn test_module_index() {
        let index = ModuleIndex::parse(BUILTIN, DEP).with_loaded("act-gact");
        assert!(index.is_complete());
        assert!(index.has("sch_fq_codel"));
        assert!(index.has("cls_matchall"));
        assert!(index.has("act_gact"));
        assert!(!index.has("act_mirred"));

        let unknown = ModuleIndex::default();
        assert!(unknown.has("act_mirred"));
    }

    #[test]
    fn test_evaluate() {
        let facts = ProbeFacts {
            extended_ack: true,
            strict_check: false,
            tc: true,
            ipv6: true,
        };
        let support = evaluate(&facts, &ModuleIndex::parse(BUILTIN, DEP));
        assert!(support.contains(KernelSupport::TC | KernelSupport::REPLACE));
        assert!(support.supports("fq_codel"));
        assert!(support.supports("ingress"));
        assert!(support.supports("clsact"));
        assert!(support.supports("matchall"));
        assert!(support.supports("dummy"));
        assert!(!support.supports("mirred"));
        assert!(!support.supports("strict-check"));
        assert!(!support.supports("no-such-feature"));

        let no_tc = evaluate(
            &ProbeFacts {
                tc: false,
                ..facts
            },
            &ModuleIndex::default(),
        );
        assert!(!no_tc.supports("fq_codel"));
        assert!(no_tc.supports("veth"));
    }

    #[test]
    fn test_bits() {
        let all = KernelSupport::all();
        assert_eq!(KernelSupport::from_bits_truncate(u32::MAX), all);
        assert!(all.contains(KernelSupport::LINK_VRF));
        let fewer = all.without(KernelSupport::ACT_MIRRED);
        assert!(!fewer.supports("mirred"));
        assert_eq!(all.report().len(), 22);
    }

    #[test]
    fn test_check_gates_known_kinds() {
        let support = KernelSupport::all().without(KernelSupport::CLS_MATCHALL);
        let filter: PlatformObject =
            Tfilter::matchall(1, TcHandle::INGRESS_QDISC, TcAction::simple("x")).into();
        let err = check(support, &filter).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));

        let odd_qdisc: PlatformObject =
            Qdisc::new(1, "cake", TcHandle::new(1, 0), TcHandle::ROOT).into();
        assert!(check(support, &odd_qdisc).is_ok());

        let no_v6 = KernelSupport::all().without(KernelSupport::IPV6);
        let v6: PlatformObject = Address::parse_cidr(1, "2001:db8::1/64").unwrap().into();
        assert!(check(no_v6, &v6).is_err());

        let no_veth = KernelSupport::all().without(KernelSupport::LINK_VETH);
        assert!(check(no_veth, &Link::veth("a", "b").into()).is_err());
        assert!(check(no_veth, &Link::dummy("a").into()).is_ok());
    }

    #[test]
    fn test_probe_memoises() {
        let mut probe = CapabilityProbe::new("/nonexistent-root");
        assert!(probe.cached().is_none());
        let support = probe.finish(&ProbeFacts {
            tc: true,
            ..Default::default()
        });
        // No module data: every kind is assumed present.
        assert!(support.supports("mirred"));
        assert_eq!(probe.cached(), Some(support));
        probe.invalidate();
        assert!(probe.cached().is_none());
    }
}

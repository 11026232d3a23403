//! In-process rtnetlink responder for tests.
//!
//! [`FakeKernel`] implements [`NetlinkIo`] and answers requests the way the
//! kernel does: acks and errno values, multicast notifications for every
//! change (carrying the requester's sequence number), and dumps split over
//! several datagrams. Clones share state, so a test keeps one clone as a
//! control handle while the platform owns another.
//!
//! ```ignore
//! let kernel = FakeKernel::new();
//! let mut platform = Platform::with_io(kernel.clone(), PlatformConfig::default()).await?;
//! kernel.external(Link::dummy("ext0").into(), ApplyMode::Add)?;
//! platform.drain().await?;
//! assert!(platform.link_by_name("ext0").is_some());
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use crate::netlink::builder::MessageBuilder;
use crate::netlink::error::{Error, Result};
use crate::netlink::message::{
    MessageIter, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_DUMP_INTR, NLM_F_EXCL, NLM_F_MULTI,
    NLM_F_REPLACE, NlMsgError, NlMsgHdr, NlMsgType,
};
use crate::netlink::parse::FromNetlink;
use crate::netlink::types::addr::{INFINITY_LIFE_TIME, ifa_flags};
use crate::netlink::types::link::iff;
use crate::object::{
    Address, Link, LinkKind, ObjectKind, OperState, PlatformObject, Qdisc, Route, TcHandle, Tfilter,
};
use crate::platform::ApplyMode;
use crate::transport::NetlinkIo;

/// Port id the fake kernel reports for its socket.
pub const PORT_ID: u32 = 4242;

const QDISC_KINDS: &[&str] = &[
    "fq_codel", "ingress", "clsact", "noqueue", "pfifo_fast", "pfifo", "mq", "htb", "prio", "sfq",
    "tbf",
];
const FILTER_KINDS: &[&str] = &["matchall", "basic"];
const FIRST_FILTER_PRIO: u16 = 0xC000;

/// A request the fake kernel received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRequest {
    pub msg_type: u16,
    pub flags: u16,
    pub seq: u32,
    /// The decoded object; `None` for dumps and undecodable requests.
    pub object: Option<PlatformObject>,
}

/// Where a change came from; notifications carry it.
#[derive(Debug, Clone, Copy)]
struct Origin {
    seq: u32,
    pid: u32,
    silent: bool,
}

impl Origin {
    const EXTERNAL: Origin = Origin {
        seq: 0,
        pid: 0,
        silent: false,
    };
}

type Errno = i32;
type Outcome<T = ()> = std::result::Result<T, Errno>;

struct KernelState {
    links: BTreeMap<u32, Link>,
    addresses: Vec<Address>,
    routes: Vec<Route>,
    qdiscs: Vec<Qdisc>,
    filters: Vec<Tfilter>,
    next_ifindex: u32,
    next_qdisc_major: u16,

    outbox: VecDeque<Vec<u8>>,
    requests: Vec<RecordedRequest>,
    failures: VecDeque<(u16, Errno)>,
    overruns: u32,
    suppress_notifications: bool,
    drop_replies: bool,
    interrupt_dumps: u32,
    dump_chunk: usize,
    ipv6: bool,
}

struct Shared {
    state: Mutex<KernelState>,
    wake: Notify,
}

/// Fake rtnetlink peer. See the module docs.
#[derive(Clone)]
pub struct FakeKernel {
    shared: Arc<Shared>,
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeKernel {
    /// A kernel with only the loopback interface (ifindex 1, up,
    /// `127.0.0.1/8`, default `noqueue` root qdisc).
    pub fn new() -> Self {
        let lo = Link {
            ifindex: 1,
            name: "lo".into(),
            kind: LinkKind::Loopback,
            flags: iff::UP | iff::LOOPBACK | iff::RUNNING | iff::LOWER_UP,
            mtu: Some(65536),
            operstate: OperState::Unknown,
            ..Default::default()
        };
        let lo_addr = Address {
            ifindex: 1,
            address: IpAddr::from([127, 0, 0, 1]),
            prefix_len: 8,
            label: Some("lo".into()),
            flags: ifa_flags::PERMANENT,
            scope: Some(254),
            valid_lft: INFINITY_LIFE_TIME,
            preferred_lft: INFINITY_LIFE_TIME,
        };
        let state = KernelState {
            links: BTreeMap::from([(1, lo)]),
            addresses: vec![lo_addr],
            routes: Vec::new(),
            qdiscs: vec![default_qdisc(1)],
            filters: Vec::new(),
            next_ifindex: 2,
            next_qdisc_major: 0x8001,
            outbox: VecDeque::new(),
            requests: Vec::new(),
            failures: VecDeque::new(),
            overruns: 0,
            suppress_notifications: false,
            drop_replies: false,
            interrupt_dumps: 0,
            dump_chunk: 2,
            ipv6: true,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                wake: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, KernelState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.shared.wake.notify_one();
    }

    /// Change kernel state as another process would, with notifications.
    pub fn external(&self, object: PlatformObject, mode: ApplyMode) -> Result<()> {
        self.change(object, mode, Origin::EXTERNAL)
    }

    /// Change kernel state without telling anyone.
    pub fn silent(&self, object: PlatformObject, mode: ApplyMode) -> Result<()> {
        self.change(
            object,
            mode,
            Origin {
                silent: true,
                ..Origin::EXTERNAL
            },
        )
    }

    fn change(&self, object: PlatformObject, mode: ApplyMode, origin: Origin) -> Result<()> {
        let flags = match mode {
            ApplyMode::Add => NLM_F_CREATE | NLM_F_REPLACE,
            ApplyMode::Delete => 0,
        };
        let result = self.lock().apply(origin, flags, mode, object);
        self.wake();
        result.map_err(|errno| Error::from_errno(-errno))
    }

    /// Fail the next request of `msg_type` with `errno` (positive).
    pub fn fail_next(&self, msg_type: u16, errno: i32) {
        self.lock().failures.push_back((msg_type, errno));
    }

    /// Make the next receive fail with ENOBUFS.
    pub fn overrun(&self) {
        self.lock().overruns += 1;
        self.wake();
    }

    pub fn suppress_notifications(&self, on: bool) {
        self.lock().suppress_notifications = on;
    }

    /// Swallow acks and error replies.
    pub fn drop_replies(&self, on: bool) {
        self.lock().drop_replies = on;
    }

    /// Flag the next `count` dumps as interrupted.
    pub fn interrupt_dumps(&self, count: u32) {
        self.lock().interrupt_dumps = count;
    }

    /// Objects per dump datagram.
    pub fn set_dump_chunk(&self, objects: usize) {
        self.lock().dump_chunk = objects.max(1);
    }

    /// Reject IPv6 addresses, routes and dumps with EAFNOSUPPORT.
    pub fn disable_ipv6(&self) {
        self.lock().ipv6 = false;
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.lock().requests.clear();
    }

    /// Number of received requests of `msg_type`.
    pub fn request_count(&self, msg_type: u16) -> usize {
        self.lock()
            .requests
            .iter()
            .filter(|r| r.msg_type == msg_type)
            .count()
    }

    /// Current kernel objects of `kind`.
    pub fn objects(&self, kind: ObjectKind) -> Vec<PlatformObject> {
        self.lock().objects(kind)
    }

    pub fn link_index(&self, name: &str) -> Option<u32> {
        self.lock().link_by_name(name)
    }
}

impl NetlinkIo for FakeKernel {
    fn port_id(&self) -> u32 {
        PORT_ID
    }

    fn extended_ack(&self) -> bool {
        true
    }

    fn strict_check(&self) -> bool {
        true
    }

    async fn send(&self, msg: &[u8]) -> Result<()> {
        {
            let mut state = self.lock();
            for message in MessageIter::new(msg) {
                let (header, payload) = message?;
                state.handle(header, payload);
            }
        }
        self.wake();
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>> {
        loop {
            let notified = self.shared.wake.notified();
            {
                let mut state = self.lock();
                if state.overruns > 0 {
                    state.overruns -= 1;
                    return Err(Error::Io(io::Error::from_raw_os_error(libc::ENOBUFS)));
                }
                if let Some(datagram) = state.outbox.pop_front() {
                    return Ok(datagram);
                }
            }
            notified.await;
        }
    }
}

fn default_qdisc(ifindex: u32) -> Qdisc {
    Qdisc::new(ifindex, "noqueue", TcHandle::UNSPEC, TcHandle::ROOT)
}

fn carrier_flags(up: bool) -> u32 {
    if up {
        iff::UP | iff::RUNNING | iff::LOWER_UP
    } else {
        0
    }
}

fn in_subnet(addr: &Address, ip: IpAddr) -> bool {
    crate::object::route::mask(addr.address, addr.prefix_len)
        == crate::object::route::mask(ip, addr.prefix_len)
        && addr.address.is_ipv6() == ip.is_ipv6()
}

impl KernelState {
    fn handle(&mut self, header: &NlMsgHdr, payload: &[u8]) {
        let decoded = PlatformObject::decode(header.nlmsg_type, payload);
        let dump = header.nlmsg_flags & NLM_F_DUMP == NLM_F_DUMP;
        self.requests.push(RecordedRequest {
            msg_type: header.nlmsg_type,
            flags: header.nlmsg_flags,
            seq: header.nlmsg_seq,
            object: match &decoded {
                Ok(Some((_, object))) if !dump => Some(object.clone()),
                _ => None,
            },
        });

        if let Some(pos) = self
            .failures
            .iter()
            .position(|(t, _)| *t == header.nlmsg_type)
            && let Some((_, errno)) = self.failures.remove(pos)
        {
            self.reply(header, -errno);
            return;
        }

        if dump {
            self.dump(header, payload);
            return;
        }

        let origin = Origin {
            seq: header.nlmsg_seq,
            pid: header.nlmsg_pid,
            silent: false,
        };
        let mode = match header.nlmsg_type {
            NlMsgType::RTM_DELLINK
            | NlMsgType::RTM_DELADDR
            | NlMsgType::RTM_DELROUTE
            | NlMsgType::RTM_DELQDISC
            | NlMsgType::RTM_DELTFILTER => ApplyMode::Delete,
            _ => ApplyMode::Add,
        };
        let result = match decoded {
            Ok(Some((_, object))) => self.apply(origin, header.nlmsg_flags, mode, object),
            Ok(None) => Err(libc::EOPNOTSUPP),
            Err(_) => Err(libc::EINVAL),
        };
        match result {
            Err(errno) => self.reply(header, -errno),
            Ok(()) if header.nlmsg_flags & NLM_F_ACK != 0 => self.reply(header, 0),
            Ok(()) => {}
        }
    }

    fn reply(&mut self, request: &NlMsgHdr, error: i32) {
        if self.drop_replies {
            return;
        }
        let mut b = MessageBuilder::new(NlMsgType::ERROR, 0);
        b.append(&NlMsgError {
            error,
            msg: *request,
        });
        b.set_seq(request.nlmsg_seq);
        b.set_pid(request.nlmsg_pid);
        self.outbox.push_back(b.finish());
    }

    fn notify(&mut self, origin: Origin, msg_type: u16, object: &PlatformObject) {
        if origin.silent || self.suppress_notifications {
            return;
        }
        match object.to_message(msg_type, 0) {
            Ok(mut b) => {
                b.set_seq(origin.seq);
                b.set_pid(origin.pid);
                self.outbox.push_back(b.finish());
            }
            Err(e) => tracing::warn!(error = %e, "fake kernel cannot encode notification"),
        }
    }

    fn apply(&mut self, origin: Origin, flags: u16, mode: ApplyMode, object: PlatformObject) -> Outcome {
        match (mode, object) {
            (ApplyMode::Add, PlatformObject::Link(l)) => self.new_link(origin, flags, l),
            (ApplyMode::Delete, PlatformObject::Link(l)) => self.del_link(origin, l),
            (ApplyMode::Add, PlatformObject::Address(a)) => self.new_addr(origin, flags, a),
            (ApplyMode::Delete, PlatformObject::Address(a)) => self.del_addr(origin, a),
            (ApplyMode::Add, PlatformObject::Route(r)) => self.new_route(origin, flags, r),
            (ApplyMode::Delete, PlatformObject::Route(r)) => self.del_route(origin, r),
            (ApplyMode::Add, PlatformObject::Qdisc(q)) => self.new_qdisc(origin, flags, q),
            (ApplyMode::Delete, PlatformObject::Qdisc(q)) => self.del_qdisc(origin, q),
            (ApplyMode::Add, PlatformObject::Tfilter(f)) => self.new_filter(origin, flags, f),
            (ApplyMode::Delete, PlatformObject::Tfilter(f)) => self.del_filter(origin, f),
        }
    }

    fn link_by_name(&self, name: &str) -> Option<u32> {
        self.links
            .values()
            .find(|l| l.name == name)
            .map(|l| l.ifindex)
    }

    fn resolve_link(&self, want: &Link) -> Option<u32> {
        if want.ifindex != 0 {
            self.links.contains_key(&want.ifindex).then_some(want.ifindex)
        } else {
            self.link_by_name(&want.name)
        }
    }

    fn new_link(&mut self, origin: Origin, flags: u16, want: Link) -> Outcome {
        if let Some(ifindex) = self.resolve_link(&want) {
            if flags & (NLM_F_CREATE | NLM_F_EXCL) == NLM_F_CREATE | NLM_F_EXCL {
                return Err(libc::EEXIST);
            }
            if !want.name.is_empty()
                && self
                    .link_by_name(&want.name)
                    .is_some_and(|other| other != ifindex)
            {
                return Err(libc::EEXIST);
            }
            let Some(link) = self.links.get_mut(&ifindex) else {
                return Err(libc::ENODEV);
            };
            let keep = link.flags & !(iff::UP | iff::RUNNING | iff::LOWER_UP);
            link.flags = keep | carrier_flags(want.is_up());
            link.operstate = if want.is_up() {
                OperState::Unknown
            } else {
                OperState::Down
            };
            if let Some(mtu) = want.mtu {
                link.mtu = Some(mtu);
            }
            if !want.name.is_empty() {
                link.name = want.name;
            }
            let snapshot = PlatformObject::Link(link.clone());
            self.notify(origin, NlMsgType::RTM_NEWLINK, &snapshot);
            return Ok(());
        }

        if want.ifindex != 0 || flags & NLM_F_CREATE == 0 {
            return Err(libc::ENODEV);
        }
        if want.name.is_empty() {
            return Err(libc::EINVAL);
        }
        if !want.kind.is_creatable() {
            return Err(libc::EOPNOTSUPP);
        }
        if let Some(parent) = want.parent
            && !self.links.contains_key(&parent)
        {
            return Err(libc::ENODEV);
        }

        let ifindex = self.next_ifindex;
        self.next_ifindex += 1;
        let link = Link {
            ifindex,
            name: want.name,
            kind: want.kind,
            flags: iff::BROADCAST | iff::NOARP | carrier_flags(want.flags & iff::UP != 0),
            mtu: want.mtu.or(Some(1500)),
            operstate: if want.flags & iff::UP != 0 {
                OperState::Unknown
            } else {
                OperState::Down
            },
            parent: want.parent,
            vlan_id: want.vlan_id,
            veth_peer: None,
        };
        self.links.insert(ifindex, link.clone());
        self.notify(origin, NlMsgType::RTM_NEWLINK, &link.into());

        let qdisc = default_qdisc(ifindex);
        self.qdiscs.push(qdisc.clone());
        self.notify(origin, NlMsgType::RTM_NEWQDISC, &qdisc.into());
        Ok(())
    }

    fn del_link(&mut self, origin: Origin, want: Link) -> Outcome {
        let ifindex = self.resolve_link(&want).ok_or(libc::ENODEV)?;
        if self.links.get(&ifindex).is_some_and(|l| l.kind == LinkKind::Loopback) {
            return Err(libc::EOPNOTSUPP);
        }

        let (gone, kept): (Vec<Address>, Vec<Address>) = std::mem::take(&mut self.addresses)
            .into_iter()
            .partition(|a| a.ifindex == ifindex);
        self.addresses = kept;
        for addr in gone {
            self.notify(origin, NlMsgType::RTM_DELADDR, &addr.into());
        }
        // Routes, qdiscs and filters go away without notifications.
        self.routes.retain(|r| r.ifindex != ifindex);
        self.qdiscs.retain(|q| q.ifindex != ifindex);
        self.filters.retain(|f| f.ifindex != ifindex);

        if let Some(link) = self.links.remove(&ifindex) {
            self.notify(origin, NlMsgType::RTM_DELLINK, &link.into());
        }
        Ok(())
    }

    fn new_addr(&mut self, origin: Origin, flags: u16, want: Address) -> Outcome {
        let link_name = self
            .links
            .get(&want.ifindex)
            .map(|l| l.name.clone())
            .ok_or(libc::ENODEV)?;
        if want.is_v6() && !self.ipv6 {
            return Err(libc::EAFNOSUPPORT);
        }

        let mut addr = want;
        if addr.label.is_none() && !addr.is_v6() {
            addr.label = Some(link_name);
        }
        if addr.valid_lft == INFINITY_LIFE_TIME {
            addr.flags |= ifa_flags::PERMANENT;
        }
        addr.scope = Some(addr.scope.unwrap_or(0));

        let existing = self.addresses.iter().position(|a| {
            a.ifindex == addr.ifindex && a.address == addr.address && a.prefix_len == addr.prefix_len
        });
        match existing {
            Some(_) if flags & NLM_F_EXCL != 0 || flags & NLM_F_REPLACE == 0 => {
                return Err(libc::EEXIST);
            }
            Some(i) => self.addresses[i] = addr.clone(),
            None if flags & NLM_F_CREATE == 0 => return Err(libc::EADDRNOTAVAIL),
            None => self.addresses.push(addr.clone()),
        }
        self.notify(origin, NlMsgType::RTM_NEWADDR, &addr.into());
        Ok(())
    }

    fn del_addr(&mut self, origin: Origin, want: Address) -> Outcome {
        let pos = self
            .addresses
            .iter()
            .position(|a| {
                a.ifindex == want.ifindex
                    && a.address == want.address
                    && a.prefix_len == want.prefix_len
            })
            .ok_or(libc::EADDRNOTAVAIL)?;
        let addr = self.addresses.remove(pos);
        self.notify(origin, NlMsgType::RTM_DELADDR, &addr.into());
        Ok(())
    }

    fn new_route(&mut self, origin: Origin, flags: u16, want: Route) -> Outcome {
        if want.is_v6() && !self.ipv6 {
            return Err(libc::EAFNOSUPPORT);
        }
        let mut route = want;
        if route.ifindex == 0 {
            let gateway = route.gateway.ok_or(libc::EINVAL)?;
            route.ifindex = self
                .addresses
                .iter()
                .find(|a| in_subnet(a, gateway))
                .map(|a| a.ifindex)
                .ok_or(libc::ENETUNREACH)?;
        } else if !self.links.contains_key(&route.ifindex) {
            return Err(libc::ENODEV);
        }
        route.metric = route.effective_metric();

        let key = PlatformObject::Route(route.clone()).identity_key();
        let existing = self
            .routes
            .iter()
            .position(|r| PlatformObject::Route(r.clone()).identity_key() == key);
        match existing {
            Some(_) if flags & NLM_F_EXCL != 0 => return Err(libc::EEXIST),
            Some(i) => self.routes[i] = route.clone(),
            None if flags & NLM_F_CREATE == 0 => return Err(libc::ESRCH),
            None => self.routes.push(route.clone()),
        }
        self.notify(origin, NlMsgType::RTM_NEWROUTE, &route.into());
        Ok(())
    }

    fn del_route(&mut self, origin: Origin, want: Route) -> Outcome {
        let key = PlatformObject::Route(want).identity_key();
        let pos = self
            .routes
            .iter()
            .position(|r| PlatformObject::Route(r.clone()).identity_key() == key)
            .ok_or(libc::ESRCH)?;
        let route = self.routes.remove(pos);
        self.notify(origin, NlMsgType::RTM_DELROUTE, &route.into());
        Ok(())
    }

    fn allocate_qdisc_handle(&mut self, ifindex: u32) -> TcHandle {
        loop {
            let major = self.next_qdisc_major;
            self.next_qdisc_major = self.next_qdisc_major.wrapping_add(1).max(0x8001);
            if !self
                .qdiscs
                .iter()
                .any(|q| q.ifindex == ifindex && q.handle.major() == major)
            {
                return TcHandle::new(major, 0);
            }
        }
    }

    fn new_qdisc(&mut self, origin: Origin, flags: u16, want: Qdisc) -> Outcome {
        if !self.links.contains_key(&want.ifindex) {
            return Err(libc::ENODEV);
        }
        if !QDISC_KINDS.contains(&want.kind.as_str()) {
            return Err(libc::ENOENT);
        }
        let ingress_kind = want.kind == "ingress" || want.kind == "clsact";
        if ingress_kind != (want.parent == TcHandle::INGRESS) {
            return Err(libc::EINVAL);
        }
        if !ingress_kind && want.parent != TcHandle::ROOT {
            return Err(libc::ENOENT);
        }

        let existing = self
            .qdiscs
            .iter()
            .position(|q| q.ifindex == want.ifindex && q.parent == want.parent);
        if let Some(i) = existing
            && !self.qdiscs[i].is_default()
        {
            let old = &self.qdiscs[i];
            if flags & NLM_F_EXCL != 0 {
                return Err(libc::EEXIST);
            }
            let same = old.kind == want.kind && (want.handle.is_unspec() || want.handle == old.handle);
            if same {
                let handle = old.handle;
                let updated = Qdisc { handle, ..want };
                self.qdiscs[i] = updated.clone();
                self.notify(origin, NlMsgType::RTM_NEWQDISC, &updated.into());
                return Ok(());
            }
            if flags & NLM_F_REPLACE == 0 {
                return Err(libc::EINVAL);
            }
            let old = self.qdiscs.remove(i);
            self.drop_filters_below(&old);
            self.notify(origin, NlMsgType::RTM_DELQDISC, &old.into());
        } else if let Some(i) = existing {
            // A default qdisc is grafted over without a delete notification.
            self.qdiscs.remove(i);
        } else if flags & NLM_F_CREATE == 0 {
            return Err(libc::ENOENT);
        }

        let mut qdisc = want;
        if ingress_kind {
            qdisc.handle = TcHandle::INGRESS_QDISC;
        } else if qdisc.handle.is_unspec() {
            qdisc.handle = self.allocate_qdisc_handle(qdisc.ifindex);
        } else if self
            .qdiscs
            .iter()
            .any(|q| q.ifindex == qdisc.ifindex && q.handle == qdisc.handle)
        {
            return Err(libc::EEXIST);
        }
        self.qdiscs.push(qdisc.clone());
        self.notify(origin, NlMsgType::RTM_NEWQDISC, &qdisc.into());
        Ok(())
    }

    fn has_filter_parent(&self, ifindex: u32, parent: TcHandle) -> bool {
        self.qdiscs
            .iter()
            .any(|q| q.ifindex == ifindex && !q.is_default() && q.handle.major() == parent.major())
    }

    fn drop_filters_below(&mut self, qdisc: &Qdisc) {
        self.filters
            .retain(|f| !(f.ifindex == qdisc.ifindex && f.parent.major() == qdisc.handle.major()));
    }

    fn del_qdisc(&mut self, origin: Origin, want: Qdisc) -> Outcome {
        let pos = self
            .qdiscs
            .iter()
            .position(|q| {
                q.ifindex == want.ifindex
                    && (q.parent == want.parent
                        || (!want.handle.is_unspec() && q.handle == want.handle))
            })
            .ok_or(libc::ENOENT)?;
        if self.qdiscs[pos].is_default() {
            return Err(libc::ENOENT);
        }
        let old = self.qdiscs.remove(pos);
        self.drop_filters_below(&old);
        let root = old.parent == TcHandle::ROOT;
        let ifindex = old.ifindex;
        self.notify(origin, NlMsgType::RTM_DELQDISC, &old.into());
        if root {
            let qdisc = default_qdisc(ifindex);
            self.qdiscs.push(qdisc.clone());
            self.notify(origin, NlMsgType::RTM_NEWQDISC, &qdisc.into());
        }
        Ok(())
    }

    fn new_filter(&mut self, origin: Origin, flags: u16, want: Tfilter) -> Outcome {
        if !self.links.contains_key(&want.ifindex) {
            return Err(libc::ENODEV);
        }
        if !self.has_filter_parent(want.ifindex, want.parent) {
            return Err(libc::EINVAL);
        }
        if !FILTER_KINDS.contains(&want.kind.as_str()) {
            return Err(libc::ENOENT);
        }

        let at_parent = |f: &&Tfilter| f.ifindex == want.ifindex && f.parent == want.parent;
        let prio = if want.prio != 0 {
            want.prio
        } else {
            self.filters
                .iter()
                .filter(at_parent)
                .map(|f| f.prio)
                .min()
                .map_or(FIRST_FILTER_PRIO, |p| p.saturating_sub(1))
        };
        let existing = self.filters.iter().position(|f| {
            at_parent(&f)
                && f.prio == prio
                && (want.handle.is_unspec() || f.handle == want.handle)
        });

        let mut filter = want;
        filter.prio = prio;
        match existing {
            Some(_) if flags & NLM_F_EXCL != 0 || flags & NLM_F_REPLACE == 0 => {
                return Err(libc::EEXIST);
            }
            Some(i) => {
                filter.handle = self.filters[i].handle;
                self.filters[i] = filter.clone();
            }
            None if flags & NLM_F_CREATE == 0 => return Err(libc::ENOENT),
            None => {
                if filter.handle.is_unspec() {
                    let used = self
                        .filters
                        .iter()
                        .filter(|f| f.ifindex == filter.ifindex && f.parent == filter.parent)
                        .map(|f| f.handle.as_raw())
                        .max()
                        .unwrap_or(0);
                    filter.handle = TcHandle::from_raw(used + 1);
                }
                self.filters.push(filter.clone());
            }
        }
        self.notify(origin, NlMsgType::RTM_NEWTFILTER, &filter.into());
        Ok(())
    }

    fn del_filter(&mut self, origin: Origin, want: Tfilter) -> Outcome {
        // "Parent Qdisc doesn't exists"
        if !self.has_filter_parent(want.ifindex, want.parent) {
            return Err(libc::EINVAL);
        }
        let matches = |f: &Tfilter| {
            f.ifindex == want.ifindex
                && f.parent == want.parent
                && (want.prio == 0 || f.prio == want.prio)
                && (want.prio == 0 || want.handle.is_unspec() || f.handle == want.handle)
        };
        let (gone, kept): (Vec<Tfilter>, Vec<Tfilter>) =
            std::mem::take(&mut self.filters).into_iter().partition(|f| matches(f));
        self.filters = kept;
        if gone.is_empty() {
            return Err(libc::ENOENT);
        }
        for filter in gone {
            self.notify(origin, NlMsgType::RTM_DELTFILTER, &filter.into());
        }
        Ok(())
    }

    fn objects(&self, kind: ObjectKind) -> Vec<PlatformObject> {
        let v4 = |ip: &IpAddr| ip.is_ipv4();
        match kind {
            ObjectKind::Link => self.links.values().cloned().map(Into::into).collect(),
            ObjectKind::Ip4Address | ObjectKind::Ip6Address => self
                .addresses
                .iter()
                .filter(|a| v4(&a.address) == (kind == ObjectKind::Ip4Address))
                .cloned()
                .map(Into::into)
                .collect(),
            ObjectKind::Ip4Route | ObjectKind::Ip6Route => self
                .routes
                .iter()
                .filter(|r| v4(&r.dst) == (kind == ObjectKind::Ip4Route))
                .cloned()
                .map(Into::into)
                .collect(),
            ObjectKind::Qdisc => self.qdiscs.iter().cloned().map(Into::into).collect(),
            ObjectKind::Tfilter => self.filters.iter().cloned().map(Into::into).collect(),
        }
    }

    fn dump_objects(&self, header: &NlMsgHdr, payload: &[u8]) -> Outcome<Vec<PlatformObject>> {
        let family = payload.first().copied().unwrap_or(0) as i32;
        let by_family = |v4: ObjectKind, v6: ObjectKind| -> Outcome<Vec<PlatformObject>> {
            match family {
                libc::AF_INET => Ok(self.objects(v4)),
                libc::AF_INET6 if !self.ipv6 => Err(libc::EAFNOSUPPORT),
                libc::AF_INET6 => Ok(self.objects(v6)),
                _ => {
                    let mut all = self.objects(v4);
                    if self.ipv6 {
                        all.extend(self.objects(v6));
                    }
                    Ok(all)
                }
            }
        };
        match header.nlmsg_type {
            NlMsgType::RTM_GETLINK => Ok(self.objects(ObjectKind::Link)),
            NlMsgType::RTM_GETADDR => by_family(ObjectKind::Ip4Address, ObjectKind::Ip6Address),
            NlMsgType::RTM_GETROUTE => by_family(ObjectKind::Ip4Route, ObjectKind::Ip6Route),
            NlMsgType::RTM_GETQDISC => Ok(self.objects(ObjectKind::Qdisc)),
            NlMsgType::RTM_GETTFILTER => {
                let request = Tfilter::from_bytes(payload).map_err(|_| libc::EINVAL)?;
                if !self.has_filter_parent(request.ifindex, request.parent) {
                    return Err(libc::EINVAL);
                }
                Ok(self
                    .filters
                    .iter()
                    .filter(|f| {
                        f.ifindex == request.ifindex
                            && if request.parent.minor() != 0 {
                                f.parent == request.parent
                            } else {
                                f.parent.major() == request.parent.major()
                            }
                    })
                    .cloned()
                    .map(Into::into)
                    .collect())
            }
            _ => Err(libc::EOPNOTSUPP),
        }
    }

    fn dump(&mut self, header: &NlMsgHdr, payload: &[u8]) {
        let objects = match self.dump_objects(header, payload) {
            Ok(objects) => objects,
            Err(errno) => {
                self.reply(header, -errno);
                return;
            }
        };
        let intr = if self.interrupt_dumps > 0 {
            self.interrupt_dumps -= 1;
            NLM_F_DUMP_INTR
        } else {
            0
        };

        let mut datagrams = Vec::new();
        for chunk in objects.chunks(self.dump_chunk) {
            let mut datagram = Vec::new();
            for object in chunk {
                match object.to_message(object.kind().message_types().0, NLM_F_MULTI) {
                    Ok(mut b) => {
                        b.set_seq(header.nlmsg_seq);
                        b.set_pid(header.nlmsg_pid);
                        datagram.extend(b.finish());
                    }
                    Err(e) => tracing::warn!(error = %e, "fake kernel cannot encode dump entry"),
                }
            }
            datagrams.push(datagram);
        }

        let mut done = MessageBuilder::new(NlMsgType::DONE, NLM_F_MULTI | intr);
        done.append_bytes(&0i32.to_ne_bytes());
        done.set_seq(header.nlmsg_seq);
        done.set_pid(header.nlmsg_pid);
        match datagrams.last_mut() {
            Some(last) => last.extend(done.finish()),
            None => datagrams.push(done.finish()),
        }
        self.outbox.extend(datagrams);
    }
}

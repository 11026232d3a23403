//! The platform context and its sync engine.
//!
//! A [`Platform`] owns the transport, the cache and the capability probe.
//! Callers describe what they want with [`Platform::apply`] (or
//! [`Platform::submit`] plus [`Platform::wait`] to keep several operations in
//! flight) and read what the kernel actually has through [`Platform::cache`].
//!
//! The receive path is the only writer of the cache. An operation is
//! finished when its requests are acked *and* the cache shows the result;
//! a kernel that acks but never notifies leaves the operation
//! [`OperationOutcome::Unconfirmed`] after the confirmation window.
//!
//! # Example
//!
//! ```ignore
//! use netplat::{ApplyMode, Link, Platform, PlatformConfig};
//!
//! let mut platform = Platform::open(PlatformConfig::default()).await?;
//! let outcome = platform
//!     .apply(Link::dummy("test0").up(true).into(), ApplyMode::Add)
//!     .await?;
//! println!("{:?}", outcome.status());
//! ```

mod ops;

use std::time::Duration;

use tokio::time::Instant;

pub use ops::{ApplyMode, OpHandle, OpId, OperationOutcome};
use ops::{Op, OpState, Step};

use crate::cache::{Cache, ReconcileSummary, Subscription, SubscriptionFilter};
use crate::capability::{self, CapabilityProbe, KernelSupport, ProbeFacts};
use crate::config::PlatformConfig;
use crate::netlink::builder::MessageBuilder;
use crate::netlink::error::{Error, Result, Status};
use crate::netlink::message::NLM_F_ECHO;
use crate::netlink::socket::{NetlinkSocket, SocketOptions, rtnetlink_groups};
use crate::object::{
    ChangeKind, Link, ObjectKind, PlatformObject, RequestAction, TcHandle, tfilter_dump_request,
};
use crate::transport::{DumpMode, NetlinkIo, Reply, Token, Transport, TransportEvent};

enum Plan {
    Done(OperationOutcome),
    Steps(Vec<Step>),
}

fn step(object: &PlatformObject, action: RequestAction) -> Step {
    Step {
        object: object.clone(),
        action,
    }
}

/// Kernel network state, mirrored and managed.
pub struct Platform<S> {
    transport: Transport<S>,
    cache: Cache,
    config: PlatformConfig,
    probe: CapabilityProbe,
    ops: Vec<Op>,
    next_op: u64,
    needs_resync: bool,
}

impl Platform<NetlinkSocket> {
    /// Open a netlink socket, join the notification groups and load the
    /// cache with a full dump of every kind.
    pub async fn open(config: PlatformConfig) -> Result<Self> {
        let options = SocketOptions {
            groups: rtnetlink_groups::CACHED.to_vec(),
            recv_buffer_size: config.recv_buffer_size,
        };
        let socket = match config.namespace.path() {
            Some(path) => NetlinkSocket::new_in_namespace_path(&options, path)?,
            None => NetlinkSocket::new(&options)?,
        };
        Self::with_io(socket, config).await
    }
}

impl<S: NetlinkIo> Platform<S> {
    /// Build a platform on an already connected channel and run the
    /// initial full dump.
    pub async fn with_io(io: S, config: PlatformConfig) -> Result<Self> {
        let probe = match config.kernel_support {
            Some(support) => CapabilityProbe::fixed(support),
            None => CapabilityProbe::new(config.module_root.clone()),
        };
        let mut platform = Self {
            transport: Transport::new(io),
            cache: Cache::new(),
            config,
            probe,
            ops: Vec::new(),
            next_op: 1,
            needs_resync: false,
        };
        platform.sync_all().await?;
        Ok(platform)
    }

    pub fn cache(&self) -> &Cache {
        &self.cache
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    pub fn io(&self) -> &S {
        self.transport.io()
    }

    pub fn link_by_name(&self, name: &str) -> Option<&Link> {
        self.cache.link_by_name(name)
    }

    /// Register for cache change events.
    pub fn subscribe(&mut self, filter: SubscriptionFilter) -> Subscription {
        self.cache.subscribe(filter)
    }

    /// Operations submitted and not yet finished.
    pub fn pending_ops(&self) -> usize {
        self.ops.len()
    }

    /// Capabilities of the running kernel, probed on first use.
    pub async fn kernel_support(&mut self) -> Result<KernelSupport> {
        if let Some(support) = self.probe.cached() {
            return Ok(support);
        }
        let tc = match self
            .dump(ObjectKind::Qdisc.dump_request(), ObjectKind::Qdisc)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "qdisc dump failed, no TC support");
                false
            }
        };
        let ipv6 = match self
            .dump(ObjectKind::Ip6Address.dump_request(), ObjectKind::Ip6Address)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(error = %e, "IPv6 address dump failed, no IPv6 support");
                false
            }
        };
        let facts = ProbeFacts {
            extended_ack: self.transport.io().extended_ack(),
            strict_check: self.transport.io().strict_check(),
            tc,
            ipv6,
        };
        Ok(self.probe.finish(&facts))
    }

    /// Forget probed capabilities. A configured override stays in place.
    pub fn invalidate_support(&mut self) {
        if self.config.kernel_support.is_none() {
            self.probe.invalidate();
        }
    }

    /// Submit an operation and wait until it is finished.
    pub async fn apply(&mut self, desired: PlatformObject, mode: ApplyMode) -> Result<OperationOutcome> {
        let handle = self.submit(desired, mode).await?;
        self.wait(handle).await
    }

    /// Plan an operation and send its first request.
    ///
    /// Validation and capability failures are returned here. Everything the
    /// kernel says arrives through the handle.
    pub async fn submit(&mut self, desired: PlatformObject, mode: ApplyMode) -> Result<OpHandle> {
        desired.validate()?;
        let id = OpId(self.next_op);
        self.next_op += 1;

        let (desired, plan) = match mode {
            ApplyMode::Add => {
                let support = self.kernel_support().await?;
                capability::check(support, &desired)?;
                let plan = self.plan_add(&desired, support)?;
                (desired, plan)
            }
            ApplyMode::Delete => self.plan_delete(desired),
        };
        let steps = match plan {
            Plan::Done(outcome) => {
                tracing::debug!(op = id.0, object = %desired, ?outcome, "nothing to do");
                return Ok(Op::finished(id, Ok(outcome)));
            }
            Plan::Steps(steps) => steps,
        };

        let (op, handle) = Op::new(id, desired, mode, steps);
        tracing::debug!(op = id.0, what = %op.describe(), steps = op.steps.len(), "operation submitted");
        self.ops.push(op);
        self.pump().await;
        Ok(handle)
    }

    /// Drive the platform until `handle` is finished.
    pub async fn wait(&mut self, mut handle: OpHandle) -> Result<OperationOutcome> {
        loop {
            if let Some(outcome) = handle.try_outcome() {
                return outcome;
            }
            self.drive().await?;
        }
    }

    /// One turn of the event loop: wait for the next kernel message or the
    /// next operation deadline, whichever comes first, and act on it.
    ///
    /// With nothing pending this waits for the kernel indefinitely.
    pub async fn drive(&mut self) -> Result<()> {
        if self.needs_resync {
            self.sync_all().await?;
        }
        self.pump().await;

        let deadline = self.ops.iter().filter_map(Op::deadline).min();
        let sleep = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now));
        let events = tokio::select! {
            events = self.transport.poll() => Some(events?),
            _ = sleep, if deadline.is_some() => None,
        };
        if let Some(events) = events {
            self.process(events);
        }
        self.expire(Instant::now());
        self.pump().await;
        Ok(())
    }

    /// Drive until every submitted operation is finished, then apply
    /// whatever the kernel already sent.
    pub async fn settle(&mut self) -> Result<()> {
        loop {
            if self.needs_resync {
                self.sync_all().await?;
            }
            if self.ops.is_empty() {
                break;
            }
            self.drive().await?;
        }
        self.drain().await?;
        Ok(())
    }

    /// Apply the messages that are already queued, without waiting for
    /// more. Returns the number of events handled.
    pub async fn drain(&mut self) -> Result<usize> {
        let mut handled = 0;
        while let Ok(events) = tokio::time::timeout(Duration::ZERO, self.transport.poll()).await {
            let events = events?;
            handled += events.len();
            self.process(events);
        }
        if self.needs_resync {
            self.sync_all().await?;
        }
        Ok(handled)
    }

    /// Re-dump every kind and reconcile the cache with it.
    pub async fn sync_all(&mut self) -> Result<()> {
        let mut rounds = 0;
        loop {
            self.needs_resync = false;
            for kind in ObjectKind::ALL {
                self.sync_kind(kind).await?;
            }
            if !self.needs_resync {
                break;
            }
            rounds += 1;
            if rounds > self.config.dump_retries {
                tracing::warn!(rounds, "notifications lost during every resync, will retry");
                break;
            }
        }
        tracing::info!(objects = self.cache.len(), "cache synchronised with the kernel");
        Ok(())
    }

    /// Re-dump one kind and reconcile the cache with it.
    ///
    /// Filters are dumped per qdisc, so qdiscs should be current first.
    pub async fn sync_kind(&mut self, kind: ObjectKind) -> Result<ReconcileSummary> {
        let objects = if kind == ObjectKind::Tfilter {
            let mut all = Vec::new();
            for (ifindex, parent) in self.filter_parents() {
                match self.dump(tfilter_dump_request(ifindex, parent), kind).await {
                    Ok(found) => all.extend(found),
                    Err(e) if e.is_not_found() || e.status() == Status::InvalidArgument => {
                        tracing::debug!(ifindex, %parent, error = %e, "qdisc gone during filter dump");
                    }
                    Err(e) => return Err(e),
                }
            }
            all
        } else {
            match self.dump(kind.dump_request(), kind).await {
                Ok(found) => found,
                Err(e) if unsupported_family(&e) => {
                    tracing::debug!(%kind, error = %e, "kind not available, treating as empty");
                    Vec::new()
                }
                Err(e) => return Err(e),
            }
        };

        let links_before: Vec<u32> = if kind == ObjectKind::Link {
            self.cache
                .iter(ObjectKind::Link)
                .filter_map(PlatformObject::ifindex)
                .collect()
        } else {
            Vec::new()
        };

        let summary = self.cache.reconcile_full_dump(kind, objects);
        tracing::debug!(
            %kind,
            added = summary.added,
            updated = summary.updated,
            removed = summary.removed,
            unchanged = summary.unchanged,
            "reconciled"
        );

        self.settle_confirmations();
        for ifindex in links_before {
            if self.cache.link(ifindex).is_none() {
                self.abandon(ifindex);
            }
        }
        Ok(summary)
    }

    fn filter_parents(&self) -> Vec<(u32, TcHandle)> {
        let mut parents = Vec::new();
        for object in self.cache.iter(ObjectKind::Qdisc) {
            let PlatformObject::Qdisc(qdisc) = object else {
                continue;
            };
            if qdisc.is_default() {
                continue;
            }
            if qdisc.kind == "clsact" {
                parents.push((qdisc.ifindex, TcHandle::CLSACT_INGRESS));
                parents.push((qdisc.ifindex, TcHandle::CLSACT_EGRESS));
            } else {
                parents.push((qdisc.ifindex, qdisc.handle));
            }
        }
        parents
    }

    /// Run one dump to completion, retrying while the kernel reports it
    /// as interrupted.
    async fn dump(&mut self, request: MessageBuilder, kind: ObjectKind) -> Result<Vec<PlatformObject>> {
        let mut attempt = 0;
        loop {
            let token = self
                .transport
                .send_dump(request.clone(), kind, DumpMode::Buffered)
                .await?;
            let (objects, interrupted) = self.await_dump(token, kind).await?;
            if !interrupted {
                return Ok(objects);
            }
            if attempt >= self.config.dump_retries {
                tracing::warn!(%kind, attempt, "dump still inconsistent, using it anyway");
                return Ok(objects);
            }
            attempt += 1;
            tracing::debug!(%kind, attempt, "dump interrupted, retrying");
        }
    }

    async fn await_dump(&mut self, token: Token, kind: ObjectKind) -> Result<(Vec<PlatformObject>, bool)> {
        let deadline = Instant::now() + self.config.ack_timeout;
        loop {
            let events = match tokio::time::timeout_at(deadline, self.transport.poll()).await {
                Ok(events) => events?,
                Err(_) => {
                    self.transport.cancel(token);
                    return Err(Error::Timeout {
                        operation: format!("dump {}", kind),
                        after: self.config.ack_timeout,
                    });
                }
            };

            let mut finished = None;
            for event in events {
                match event {
                    TransportEvent::Reply { token: t, result } if t == token => finished = Some(result),
                    other => self.process_event(other),
                }
            }
            self.expire(Instant::now());

            match finished {
                Some(Ok(Reply::Dump {
                    objects,
                    interrupted,
                    ..
                })) => return Ok((objects, interrupted)),
                Some(Ok(Reply::Ack)) => return Ok((Vec::new(), false)),
                Some(Err(e)) => return Err(e.with_context(format!("dump {}", kind))),
                None => {}
            }
        }
    }

    fn plan_add(&self, desired: &PlatformObject, support: KernelSupport) -> Result<Plan> {
        let Some(existing) = self.cache.find(desired) else {
            return Ok(Plan::Steps(vec![step(desired, RequestAction::Create)]));
        };
        if existing.satisfies(desired) {
            return Ok(Plan::Done(OperationOutcome::Unchanged(existing.clone())));
        }

        let steps = match (existing, desired) {
            (PlatformObject::Link(have), PlatformObject::Link(want)) => {
                if !have.changeable_to(want) {
                    return Err(Error::AlreadyExists(format!(
                        "link {} exists as {}",
                        have.name, have.kind
                    )));
                }
                let change = PlatformObject::Link(want.clone().with_ifindex(have.ifindex));
                vec![step(&change, RequestAction::Change)]
            }
            // Any qdisc created at a default's parent takes its place.
            (PlatformObject::Qdisc(have), _) if have.is_default() => {
                vec![step(desired, RequestAction::Create)]
            }
            // Classifiers such as matchall cannot be changed in place.
            (PlatformObject::Tfilter(_), _) => vec![
                step(existing, RequestAction::Delete),
                step(desired, RequestAction::Create),
            ],
            _ if support.contains(KernelSupport::REPLACE) => {
                vec![step(desired, RequestAction::Replace)]
            }
            _ => vec![
                step(existing, RequestAction::Delete),
                step(desired, RequestAction::Create),
            ],
        };
        Ok(Plan::Steps(steps))
    }

    /// Plan a removal. Returns the object the operation is about: the
    /// cached snapshot when there is one, since it carries what the kernel
    /// assigned (ifindex, filter prio and handle).
    fn plan_delete(&self, desired: PlatformObject) -> (PlatformObject, Plan) {
        match self.cache.find(&desired) {
            Some(PlatformObject::Qdisc(q)) if q.is_default() => {
                (desired, Plan::Done(OperationOutcome::AlreadyAbsent))
            }
            Some(existing) => {
                let target = existing.clone();
                let plan = Plan::Steps(vec![step(&target, RequestAction::Delete)]);
                (target, plan)
            }
            None => {
                let absent = match &desired {
                    // Without a prio the request would flush every filter at
                    // the parent, and without the parent qdisc there are no
                    // filters.
                    PlatformObject::Tfilter(f) => {
                        f.prio == 0 || self.cache.filter_parent(f.ifindex, f.parent).is_none()
                    }
                    _ => false,
                };
                if absent {
                    return (desired, Plan::Done(OperationOutcome::AlreadyAbsent));
                }
                let plan = Plan::Steps(vec![step(&desired, RequestAction::Delete)]);
                (desired, plan)
            }
        }
    }

    /// Send the next step of every operation that is ready for it.
    async fn pump(&mut self) {
        let now = Instant::now();
        let echo = self.config.echo;
        let ack_timeout = self.config.ack_timeout;
        let mut failed = Vec::new();

        for op in &mut self.ops {
            let due = match op.state {
                OpState::Queued => true,
                OpState::Backoff { until } => until <= now,
                _ => false,
            };
            if !due {
                continue;
            }
            let Some(request) = op.current().map(|s| s.object.request(s.action)) else {
                continue;
            };
            let sent = match request {
                Ok(mut builder) => {
                    if echo {
                        builder.add_flags(NLM_F_ECHO);
                    }
                    self.transport.send(builder).await
                }
                Err(e) => Err(e),
            };
            match sent {
                Ok(token) => {
                    op.state = OpState::Submitted {
                        token,
                        deadline: Instant::now() + ack_timeout,
                    };
                }
                Err(e) => failed.push((op.id, e)),
            }
        }

        for (id, error) in failed {
            if let Some(op) = self.take_op(id) {
                tracing::debug!(what = %op.describe(), error = %error, "request could not be sent");
                op.fail(error);
            }
        }
    }

    fn take_op(&mut self, id: OpId) -> Option<Op> {
        let index = self.ops.iter().position(|op| op.id == id)?;
        Some(self.ops.remove(index))
    }

    fn process(&mut self, events: Vec<TransportEvent>) {
        for event in events {
            self.process_event(event);
        }
    }

    /// Apply one event, then finish whatever it confirmed or orphaned.
    fn process_event(&mut self, event: TransportEvent) {
        let mut removed_link = None;
        match event {
            TransportEvent::Notification {
                kind,
                change,
                object,
            } => {
                tracing::debug!(%kind, ?change, %object, "notification");
                match change {
                    ChangeKind::New => {
                        self.cache.upsert(object);
                    }
                    ChangeKind::Del => {
                        if let Some(PlatformObject::Link(link)) =
                            self.cache.remove(kind, &object.identity_key())
                        {
                            removed_link = Some(link.ifindex);
                        }
                    }
                }
            }
            TransportEvent::Reply { token, result } => self.handle_reply(token, result),
            TransportEvent::DumpChunk { token, .. } => {
                tracing::debug!(seq = token.seq(), "ignoring unrequested dump chunk");
            }
            TransportEvent::Overrun => self.needs_resync = true,
        }

        self.settle_confirmations();
        if let Some(ifindex) = removed_link {
            self.abandon(ifindex);
        }
    }

    fn handle_reply(&mut self, token: Token, result: Result<Reply>) {
        let Some(index) = self.ops.iter().position(|op| op.token() == Some(token)) else {
            tracing::debug!(seq = token.seq(), "reply for an operation that is gone");
            return;
        };
        let now = Instant::now();
        let op = &mut self.ops[index];

        let error = match result {
            Ok(_) => {
                op.state = if op.advance() {
                    OpState::Queued
                } else {
                    OpState::Acked {
                        deadline: now + self.config.confirm_timeout,
                    }
                };
                return;
            }
            Err(error) => error,
        };

        let gone = op
            .current()
            .is_some_and(|s| s.action == RequestAction::Delete && target_gone(&s.object, &error));
        if gone {
            if op.advance() {
                op.state = OpState::Queued;
                return;
            }
            let op = self.ops.remove(index);
            // The kernel is the authority; drop a stale entry.
            if let Some(stale) = self.cache.find(&op.desired) {
                let (kind, key) = (stale.kind(), stale.identity_key());
                tracing::debug!(%key, "kernel has no such object, dropping cached entry");
                self.cache.remove(kind, &key);
            }
            op.finish(Ok(OperationOutcome::AlreadyAbsent));
            return;
        }

        if error.is_transient() && op.attempt < self.config.max_retries {
            op.attempt += 1;
            let delay = self.config.backoff_for(op.attempt);
            tracing::debug!(
                what = %op.describe(),
                attempt = op.attempt,
                ?delay,
                error = %error,
                "transient failure, retrying"
            );
            op.state = OpState::Backoff { until: now + delay };
            return;
        }

        let op = self.ops.remove(index);
        let what = op.describe();
        op.fail(error.with_context(what));
    }

    /// Finish acked operations whose result the cache now shows.
    fn settle_confirmations(&mut self) {
        let ops = std::mem::take(&mut self.ops);
        for op in ops {
            let outcome = match op.state {
                OpState::Acked { .. } => self.confirmation(&op),
                _ => None,
            };
            match outcome {
                Some(outcome) => {
                    tracing::debug!(what = %op.describe(), "operation confirmed");
                    op.finish(Ok(outcome));
                }
                None => self.ops.push(op),
            }
        }
    }

    fn confirmation(&self, op: &Op) -> Option<OperationOutcome> {
        let cached = self.cache.find(&op.desired);
        match op.mode {
            ApplyMode::Add => cached
                .filter(|have| have.satisfies(&op.desired))
                .map(|have| OperationOutcome::Confirmed(have.clone())),
            ApplyMode::Delete => match cached {
                None => Some(OperationOutcome::Deleted),
                Some(PlatformObject::Qdisc(q)) if q.is_default() => Some(OperationOutcome::Deleted),
                Some(_) => None,
            },
        }
    }

    /// Fail or give up on operations whose deadline passed.
    fn expire(&mut self, now: Instant) {
        let ops = std::mem::take(&mut self.ops);
        for op in ops {
            match op.state {
                OpState::Submitted { token, deadline } if deadline <= now => {
                    self.transport.cancel(token);
                    let what = op.describe();
                    tracing::warn!(what = %what, "no reply from the kernel");
                    op.fail(Error::Timeout {
                        operation: what,
                        after: self.config.ack_timeout,
                    });
                }
                OpState::Acked { deadline } if deadline <= now => {
                    tracing::warn!(
                        what = %op.describe(),
                        window = ?self.config.confirm_timeout,
                        "acked but not confirmed by a notification"
                    );
                    op.finish(Ok(OperationOutcome::Unconfirmed));
                }
                _ => self.ops.push(op),
            }
        }
    }

    /// Drop operations that target a removed interface.
    fn abandon(&mut self, ifindex: u32) {
        let ops = std::mem::take(&mut self.ops);
        for op in ops {
            if op.target_ifindex() != Some(ifindex) {
                self.ops.push(op);
                continue;
            }
            if let Some(token) = op.token() {
                self.transport.cancel(token);
            }
            tracing::debug!(what = %op.describe(), ifindex, "interface removed, abandoning");
            op.finish(Ok(OperationOutcome::Abandoned));
        }
    }
}

/// Whether a failed delete of `object` means it no longer exists. The
/// kernel answers a filter delete under a missing qdisc with EINVAL.
fn target_gone(object: &PlatformObject, error: &Error) -> bool {
    error.is_not_found()
        || (matches!(object, PlatformObject::Tfilter(_)) && error.errno() == Some(libc::EINVAL))
}

fn unsupported_family(error: &Error) -> bool {
    error.errno() == Some(libc::EAFNOSUPPORT) || error.status() == Status::NotSupported
}

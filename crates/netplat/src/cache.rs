//! In-memory mirror of kernel network state.
//!
//! The cache holds the latest snapshot per [`ObjectKey`], one map per
//! [`ObjectKind`], plus an index by owning interface. An upsert always
//! replaces the whole stored snapshot; fields are never merged.
//!
//! Removal cascades the way the kernel does it silently:
//!
//! - removing a link drops every object owned by its ifindex;
//! - removing a qdisc (or replacing it with a different handle) drops the
//!   filters attached below it.
//!
//! Every change is published to subscribers as a [`CacheEvent`], in the
//! order subscribers registered.

use std::collections::{BTreeMap, BTreeSet};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;

use crate::object::{Link, ObjectKey, ObjectKind, PlatformObject, Qdisc, TcHandle};

/// What happened to a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum CacheChange {
    Added,
    Updated,
    Removed,
}

/// A change published to subscribers.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct CacheEvent {
    pub kind: ObjectKind,
    pub change: CacheChange,
    /// The new snapshot, or the last one for removals.
    pub object: PlatformObject,
}

/// Result of [`Cache::upsert`].
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    Added,
    /// Replaced the previous snapshot, returned here.
    Updated(PlatformObject),
    Unchanged,
}

/// Counts from [`Cache::reconcile_full_dump`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct ReconcileSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
}

impl ReconcileSummary {
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.removed > 0
    }
}

/// Which events a subscription receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFilter {
    All,
    Kind(ObjectKind),
    /// Every object owned by the interface, the link itself included.
    Interface(u32),
    /// Only changes of the link with this ifindex.
    Link(u32),
}

impl SubscriptionFilter {
    fn matches(&self, event: &CacheEvent) -> bool {
        match *self {
            SubscriptionFilter::All => true,
            SubscriptionFilter::Kind(kind) => event.kind == kind,
            SubscriptionFilter::Interface(ifindex) => event.object.ifindex() == Some(ifindex),
            SubscriptionFilter::Link(ifindex) => {
                event.kind == ObjectKind::Link && event.object.ifindex() == Some(ifindex)
            }
        }
    }
}

/// Stream of [`CacheEvent`]s. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<CacheEvent>,
}

impl Subscription {
    /// Next already-published event, without waiting.
    pub fn try_next(&mut self) -> Option<CacheEvent> {
        self.rx.try_recv().ok()
    }

    /// Everything published so far.
    pub fn drain(&mut self) -> Vec<CacheEvent> {
        std::iter::from_fn(|| self.try_next()).collect()
    }
}

impl Stream for Subscription {
    type Item = CacheEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug)]
struct Listener {
    filter: SubscriptionFilter,
    tx: mpsc::UnboundedSender<CacheEvent>,
}

type IndexEntry = (ObjectKind, ObjectKey);

/// Kernel state mirror. See the module docs.
#[derive(Debug, Default)]
pub struct Cache {
    objects: BTreeMap<ObjectKind, BTreeMap<ObjectKey, PlatformObject>>,
    by_ifindex: BTreeMap<u32, BTreeSet<IndexEntry>>,
    listeners: Vec<Listener>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of cached objects.
    pub fn len(&self) -> usize {
        self.objects.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of cached objects of `kind`.
    pub fn count(&self, kind: ObjectKind) -> usize {
        self.objects.get(&kind).map_or(0, BTreeMap::len)
    }

    pub fn lookup(&self, kind: ObjectKind, key: &ObjectKey) -> Option<&PlatformObject> {
        self.objects.get(&kind)?.get(key)
    }

    /// The cached snapshot of the entity `desired` describes.
    ///
    /// Links without an ifindex are looked up by name. A filter without a
    /// prio is found only among filters that already do what it asks; with
    /// a prio but no handle, the filter in that slot is returned.
    pub fn find(&self, desired: &PlatformObject) -> Option<&PlatformObject> {
        match desired {
            PlatformObject::Link(link) if link.ifindex == 0 => self
                .iter(ObjectKind::Link)
                .find(|o| matches!(o, PlatformObject::Link(l) if l.name == link.name)),
            PlatformObject::Tfilter(want) if !want.is_keyed() => {
                let mut in_slot = None;
                for object in self.iter_by_interface(want.ifindex) {
                    let PlatformObject::Tfilter(have) = object else {
                        continue;
                    };
                    if have.satisfies(want) {
                        return Some(object);
                    }
                    if want.prio != 0 && have.same_slot(want) {
                        in_slot.get_or_insert(object);
                    }
                }
                in_slot
            }
            _ => self.lookup(desired.kind(), &desired.identity_key()),
        }
    }

    /// The non-default qdisc that filters at `parent` attach to.
    pub fn filter_parent(&self, ifindex: u32, parent: TcHandle) -> Option<&Qdisc> {
        self.iter_by_interface(ifindex).find_map(|o| match o {
            PlatformObject::Qdisc(q) if !q.is_default() && q.handle.major() == parent.major() => {
                Some(q)
            }
            _ => None,
        })
    }

    pub fn link(&self, ifindex: u32) -> Option<&Link> {
        match self.lookup(ObjectKind::Link, &ObjectKey::Link { ifindex })? {
            PlatformObject::Link(link) => Some(link),
            _ => None,
        }
    }

    pub fn link_by_name(&self, name: &str) -> Option<&Link> {
        self.iter(ObjectKind::Link).find_map(|o| match o {
            PlatformObject::Link(link) if link.name == name => Some(link),
            _ => None,
        })
    }

    /// All cached objects of `kind`, in key order.
    pub fn iter(&self, kind: ObjectKind) -> impl Iterator<Item = &PlatformObject> + '_ {
        self.objects.get(&kind).into_iter().flat_map(BTreeMap::values)
    }

    /// All cached objects owned by `ifindex`, across kinds.
    pub fn iter_by_interface(&self, ifindex: u32) -> impl Iterator<Item = &PlatformObject> + '_ {
        self.by_ifindex
            .get(&ifindex)
            .into_iter()
            .flatten()
            .filter_map(|(kind, key)| self.lookup(*kind, key))
    }

    /// Register a listener. Events are delivered in registration order.
    pub fn subscribe(&mut self, filter: SubscriptionFilter) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.push(Listener { filter, tx });
        Subscription { rx }
    }

    /// Insert or replace the entry at the object's identity key.
    pub fn upsert(&mut self, object: PlatformObject) -> Upsert {
        let kind = object.kind();
        let key = object.identity_key();
        let owner = object.ifindex();

        let previous = self
            .objects
            .entry(kind)
            .or_default()
            .insert(key.clone(), object.clone());

        let outcome = match previous {
            None => Upsert::Added,
            Some(old) if old == object => Upsert::Unchanged,
            Some(old) => {
                if let Some(old_owner) = old.ifindex()
                    && Some(old_owner) != owner
                {
                    self.unindex(old_owner, kind, &key);
                }
                Upsert::Updated(old)
            }
        };
        if let Some(owner) = owner {
            self.by_ifindex
                .entry(owner)
                .or_default()
                .insert((kind, key));
        }

        match &outcome {
            Upsert::Added => self.publish(kind, CacheChange::Added, object),
            Upsert::Updated(old) => {
                let orphaned = orphaned_filters(old, Some(&object));
                self.publish(kind, CacheChange::Updated, object);
                self.remove_filters(orphaned);
            }
            Upsert::Unchanged => {}
        }
        outcome
    }

    /// Remove the entry at `key`. Absent entries are not an error.
    pub fn remove(&mut self, kind: ObjectKind, key: &ObjectKey) -> Option<PlatformObject> {
        let removed = self.objects.get_mut(&kind)?.remove(key)?;
        if let Some(owner) = removed.ifindex() {
            self.unindex(owner, kind, key);
        }
        self.publish(kind, CacheChange::Removed, removed.clone());
        self.cascade(&removed);
        Some(removed)
    }

    /// Replace everything cached for `kind` with an authoritative listing.
    ///
    /// The new map is built and swapped in before any event is published, so
    /// no reader sees a half-reconciled kind. Events for the difference
    /// follow, then any cascaded removals.
    pub fn reconcile_full_dump(
        &mut self,
        kind: ObjectKind,
        objects: impl IntoIterator<Item = PlatformObject>,
    ) -> ReconcileSummary {
        let mut fresh = BTreeMap::new();
        for object in objects {
            if object.kind() == kind {
                fresh.insert(object.identity_key(), object);
            }
        }
        let old = std::mem::replace(self.objects.entry(kind).or_default(), fresh);

        for (key, object) in &old {
            if let Some(owner) = object.ifindex() {
                self.unindex(owner, kind, key);
            }
        }
        let fresh = &self.objects[&kind];
        for (key, object) in fresh {
            if let Some(owner) = object.ifindex() {
                self.by_ifindex
                    .entry(owner)
                    .or_default()
                    .insert((kind, key.clone()));
            }
        }

        let mut summary = ReconcileSummary::default();
        let mut events = Vec::new();
        let mut gone = Vec::new();
        for (key, object) in fresh {
            match old.get(key) {
                None => {
                    summary.added += 1;
                    events.push((CacheChange::Added, object.clone()));
                }
                Some(previous) if previous == object => summary.unchanged += 1,
                Some(previous) => {
                    summary.updated += 1;
                    events.push((CacheChange::Updated, object.clone()));
                    gone.extend(orphaned_filters(previous, Some(object)));
                }
            }
        }
        let mut removed = Vec::new();
        for (key, object) in old {
            if !fresh.contains_key(&key) {
                summary.removed += 1;
                events.push((CacheChange::Removed, object.clone()));
                removed.push(object);
            }
        }

        for (change, object) in events {
            self.publish(kind, change, object);
        }
        for object in &removed {
            self.cascade(object);
        }
        self.remove_filters(gone);
        summary
    }

    fn cascade(&mut self, removed: &PlatformObject) {
        match removed {
            PlatformObject::Link(link) => {
                let owned: Vec<IndexEntry> = self
                    .by_ifindex
                    .get(&link.ifindex)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default();
                for (kind, key) in owned {
                    self.remove(kind, &key);
                }
            }
            PlatformObject::Qdisc(_) => {
                let orphaned = orphaned_filters(removed, None);
                self.remove_filters(orphaned);
            }
            _ => {}
        }
    }

    fn remove_filters(&mut self, keys: Vec<(u32, u16)>) {
        for (ifindex, major) in keys {
            let doomed: Vec<ObjectKey> = self
                .iter(ObjectKind::Tfilter)
                .filter_map(|o| match o {
                    PlatformObject::Tfilter(f)
                        if f.ifindex == ifindex && f.parent.major() == major =>
                    {
                        Some(o.identity_key())
                    }
                    _ => None,
                })
                .collect();
            for key in doomed {
                self.remove(ObjectKind::Tfilter, &key);
            }
        }
    }

    fn unindex(&mut self, owner: u32, kind: ObjectKind, key: &ObjectKey) {
        if let Some(set) = self.by_ifindex.get_mut(&owner) {
            set.remove(&(kind, key.clone()));
            if set.is_empty() {
                self.by_ifindex.remove(&owner);
            }
        }
    }

    fn publish(&mut self, kind: ObjectKind, change: CacheChange, object: PlatformObject) {
        let event = CacheEvent {
            kind,
            change,
            object,
        };
        self.listeners.retain(|listener| {
            if listener.tx.is_closed() {
                return false;
            }
            if listener.filter.matches(&event) {
                return listener.tx.send(event.clone()).is_ok();
            }
            true
        });
    }
}

/// Filter attachment points that disappear when `old` is removed or
/// replaced by `new`, as `(ifindex, handle major)`.
fn orphaned_filters(old: &PlatformObject, new: Option<&PlatformObject>) -> Vec<(u32, u16)> {
    let PlatformObject::Qdisc(old) = old else {
        return Vec::new();
    };
    if old.is_default() {
        return Vec::new();
    }
    let survives = matches!(new, Some(PlatformObject::Qdisc(Qdisc { handle, .. })) if *handle == old.handle);
    if survives {
        Vec::new()
    } else {
        vec![(old.ifindex, old.handle.major())]
    }
}

//! Clusters
//!
//! A cluster is a group of objects that live and die together. Reaching any
//! of them claims the cluster root; the pass then clears every member and
//! marks the outside references the cluster recorded when it was built.
//! Members are never traced.
//!
//! ```text
//!   outside ──► member ──┐
//!                        ▼
//!               ┌─────────────────┐  recorded refs  ┌─────────┐
//!               │ root            │ ──────────────► │ object  │
//!               │ member, member  │ ──────────────► │ cluster │
//!               └─────────────────┘                 └─────────┘
//! ```
//!
//! The recorded references are a snapshot. A cluster whose objects gain new
//! outside references must be dissolved and rebuilt; `verify_gc_assumptions`
//! reports the drift. A pass that keeps a pending-kill object alive through
//! a cluster flags the cluster, and the collector dissolves it afterwards so
//! the next pass traces its objects and nulls those references.

use super::reachability::trace_item;
use super::tracer::{ReferenceCollector, ReferenceOrigin, ReferenceSlot, Tracer};
use crate::object::{ObjectFlags, ObjectId, ObjectRef, ObjectTable};
use crate::types::TokenKind;
use crate::{GcError, GcResult};
use rustc_hash::FxHashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Handle of a cluster within one collector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterId(pub(crate) u32);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster#{}", self.0)
    }
}

/// One cluster and its reference snapshot
#[derive(Debug)]
pub(crate) struct Cluster {
    pub(crate) root: ObjectId,
    /// Cluster objects other than the root
    pub(crate) members: Vec<ObjectId>,
    /// Strong references from cluster objects to collectable objects outside it
    pub(crate) references: Vec<ObjectRef>,
    /// Cluster objects whose type may hold weak references
    pub(crate) weak_holders: Vec<ObjectId>,
    needs_dissolving: AtomicBool,
}

impl Cluster {
    /// Root first, then members
    pub(crate) fn objects(&self) -> impl Iterator<Item = ObjectId> + '_ {
        std::iter::once(self.root).chain(self.members.iter().copied())
    }

    /// Ask the collector to dissolve this cluster after the current pass
    pub(crate) fn request_dissolve(&self) {
        self.needs_dissolving.store(true, Ordering::Relaxed);
    }

    pub(crate) fn needs_dissolving(&self) -> bool {
        self.needs_dissolving.load(Ordering::Relaxed)
    }
}

/// Live clusters of one collector, indexed by `ClusterId`
#[derive(Debug, Default)]
pub(crate) struct ClusterTable {
    clusters: Vec<Option<Cluster>>,
    free: Vec<u32>,
    len: usize,
}

impl ClusterTable {
    pub(crate) fn insert(&mut self, cluster: Cluster) -> ClusterId {
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                self.clusters[index as usize] = Some(cluster);
                ClusterId(index)
            }
            None => {
                self.clusters.push(Some(cluster));
                ClusterId((self.clusters.len() - 1) as u32)
            }
        }
    }

    pub(crate) fn remove(&mut self, id: ClusterId) -> Option<Cluster> {
        let cluster = self.clusters.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);
        self.len -= 1;
        Some(cluster)
    }

    #[inline]
    pub(crate) fn get(&self, index: u32) -> Option<&Cluster> {
        self.clusters.get(index as usize)?.as_ref()
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (ClusterId, &Cluster)> + '_ {
        self.clusters
            .iter()
            .enumerate()
            .filter_map(|(index, cluster)| Some((ClusterId(index as u32), cluster.as_ref()?)))
    }
}

/// Trace `root` and `members` and record what they reference outside the group
///
/// The caller has validated the objects and removed duplicates.
pub(crate) fn build_cluster(objects: &ObjectTable, root: ObjectId, members: Vec<ObjectId>) -> Cluster {
    let inside: FxHashSet<ObjectId> = std::iter::once(root).chain(members.iter().copied()).collect();
    let mut snapshot = Snapshot {
        objects,
        inside: &inside,
        seen: FxHashSet::default(),
        references: Vec::new(),
    };
    let mut tracer = Tracer::new();
    let mut weak_holders = Vec::new();
    for id in std::iter::once(root).chain(members.iter().copied()) {
        trace_item(&mut tracer, objects, id, &mut snapshot);
        let may_hold_weak = objects
            .item(id)
            .and_then(|item| item.descriptor())
            .is_some_and(|descriptor| {
                let stream = descriptor.token_stream();
                stream.contains_kind(TokenKind::WeakObject) || stream.contains_kind(TokenKind::Custom)
            });
        if may_hold_weak {
            weak_holders.push(id);
        }
    }

    Cluster {
        root,
        members,
        references: snapshot.references,
        weak_holders,
        needs_dissolving: AtomicBool::new(false),
    }
}

struct Snapshot<'a> {
    objects: &'a ObjectTable,
    inside: &'a FxHashSet<ObjectId>,
    seen: FxHashSet<ObjectId>,
    references: Vec<ObjectRef>,
}

impl ReferenceCollector for Snapshot<'_> {
    fn handle_object_reference(&mut self, slot: &ReferenceSlot<'_>, _origin: ReferenceOrigin) {
        let target = slot.get();
        let Some((id, _)) = self.objects.resolve(target) else {
            return;
        };
        if self.inside.contains(&id) || self.objects.is_permanent(id) {
            return;
        }
        if self.seen.insert(id) {
            self.references.push(target);
        }
    }
}

/// Finds the first live strong reference `allowed` rejects
struct FirstOutside<'a> {
    objects: &'a ObjectTable,
    allowed: &'a dyn Fn(ObjectId) -> bool,
    found: Option<ObjectRef>,
}

impl ReferenceCollector for FirstOutside<'_> {
    fn handle_object_reference(&mut self, slot: &ReferenceSlot<'_>, _origin: ReferenceOrigin) {
        let target = slot.get();
        let Some((id, _)) = self.objects.resolve(target) else {
            return;
        };
        if self.found.is_none() && !(self.allowed)(id) {
            self.found = Some(target);
        }
    }

    fn is_satisfied(&self) -> bool {
        self.found.is_some()
    }
}

fn first_outside(
    tracer: &mut Tracer,
    objects: &ObjectTable,
    id: ObjectId,
    allowed: &dyn Fn(ObjectId) -> bool,
) -> Option<ObjectRef> {
    let mut finder = FirstOutside {
        objects,
        allowed,
        found: None,
    };
    trace_item(tracer, objects, id, &mut finder);
    finder.found
}

/// Check the assumptions passes make about permanent objects and clusters
///
/// - A permanent object outside the root set references only permanent
///   objects, since passes never trace it.
/// - A cluster object references only its own cluster, permanent objects and
///   the targets recorded when the cluster was built.
pub(crate) fn verify_gc_assumptions(objects: &ObjectTable, clusters: &ClusterTable) -> GcResult<()> {
    let mut tracer = Tracer::new();

    let permanent = |id: ObjectId| objects.is_permanent(id);
    for (id, item) in objects.iter().take_while(|(id, _)| objects.is_permanent(*id)) {
        if item.flags().intersects(ObjectFlags::ROOTS) {
            continue;
        }
        if let Some(target) = first_outside(&mut tracer, objects, id, &permanent) {
            return Err(GcError::PermanentPoolViolation {
                object: id,
                type_name: item.type_name(),
                target,
            });
        }
    }

    for (cluster_id, cluster) in clusters.iter() {
        let recorded: FxHashSet<ObjectId> = cluster
            .references
            .iter()
            .filter_map(|reference| reference.id())
            .collect();
        let allowed = |id: ObjectId| {
            objects.is_permanent(id)
                || recorded.contains(&id)
                || objects.item(id).and_then(|item| item.cluster()) == Some(cluster_id.0)
        };
        for id in cluster.objects() {
            if let Some(target) = first_outside(&mut tracer, objects, id, &allowed) {
                return Err(GcError::ClusterViolation {
                    root: cluster.root,
                    object: id,
                    type_name: objects.item(id).map_or("<free>", |item| item.type_name()),
                    target,
                });
            }
        }
    }
    Ok(())
}

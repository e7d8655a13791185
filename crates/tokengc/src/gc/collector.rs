//! Collector context
//!
//! `CollectorContext` owns everything a collector needs: configuration, type
//! registry, object table, purge progress and statistics. Independent
//! contexts share nothing, so several can run side by side.
//!
//! Clusters and the permanent pool are managed here too: both change what a
//! pass traces, so they may only change between passes.

use super::cluster::{build_cluster, verify_gc_assumptions, ClusterId, ClusterTable};
use super::purge::{PurgeBudget, PurgeProgress, PurgeState};
use super::reachability::{mark_objects_as_unreachable, perform_reachability_analysis, trace_item};
use super::stats::GcStats;
use super::tracer::{ReferenceCollector, Tracer};
use crate::config::GcConfig;
use crate::object::{ObjectFlags, ObjectId, ObjectItem, ObjectRef, ObjectTable};
use crate::types::{Managed, TypeDescriptor, TypeRegistry};
use crate::{fatal, GcError, GcResult};
use rustc_hash::FxHashSet;
use std::any::TypeId;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Parameters of one collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectOptions {
    /// Purge every unreachable object before returning, ignoring the budget
    pub force_full_purge: bool,
    /// Time for an immediate purge tick; `None` leaves the purge to
    /// `incremental_purge`
    pub time_budget: Option<Duration>,
}

impl CollectOptions {
    /// Mark and purge everything now
    pub fn full() -> Self {
        Self {
            force_full_purge: true,
            time_budget: None,
        }
    }

    /// Mark, then purge for at most `budget`
    pub fn incremental(budget: Duration) -> Self {
        Self {
            force_full_purge: false,
            time_budget: Some(budget),
        }
    }
}

/// Outcome of `collect_garbage`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionReport {
    /// Objects found reachable
    pub marked: usize,
    /// Objects found unreachable
    pub unreachable: usize,
    /// Duration of the reachability pass
    pub mark_time: Duration,
    /// Barrier waves of the pass
    pub waves: usize,
    /// Workers used by the pass
    pub workers: usize,
    /// State of the purge when the call returned
    pub purge: PurgeProgress,
}

/// A garbage collector and the objects it manages
pub struct CollectorContext {
    config: GcConfig,
    registry: TypeRegistry,
    objects: ObjectTable,
    clusters: ClusterTable,
    purge: PurgeState,
    stats: GcStats,
    /// Consecutive `try_collect_garbage` calls skipped by a pending purge
    skipped_collections: u32,
}

impl CollectorContext {
    /// Create a collector for the types in `registry`
    pub fn new(config: GcConfig, registry: TypeRegistry) -> Self {
        log::debug!(
            "collector created: {} types, parallel={}, workers={}",
            registry.len(),
            config.allow_parallel,
            config.worker_count
        );
        Self {
            config,
            registry,
            objects: ObjectTable::new(),
            clusters: ClusterTable::default(),
            purge: PurgeState::default(),
            stats: GcStats::default(),
            skipped_collections: 0,
        }
    }

    /// Configuration
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Type registry
    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Swap in a new descriptor for its type
    ///
    /// Objects allocated earlier keep the descriptor they were created with.
    pub fn replace_descriptor(&mut self, descriptor: Arc<TypeDescriptor>) -> Option<Arc<TypeDescriptor>> {
        log::debug!("replacing descriptor of {}", descriptor.name());
        self.registry.replace(descriptor)
    }

    /// Object table
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// Statistics
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Number of live objects, including unreachable ones not yet freed
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    // ===== Mutator API =====

    /// Allocate a managed object
    pub fn allocate<T: Managed>(&mut self, value: T) -> GcResult<ObjectRef> {
        self.allocate_with_flags(value, ObjectFlags::empty())
    }

    /// Allocate a managed object with initial root flags
    ///
    /// Only `ROOT_SET` and `KEEP_ALIVE` may be given.
    pub fn allocate_with_flags<T: Managed>(&mut self, value: T, flags: ObjectFlags) -> GcResult<ObjectRef> {
        let descriptor = self.registry.get_of::<T>()?.clone();
        if !ObjectFlags::ROOTS.contains(flags) {
            return Err(GcError::InvalidFlags(flags));
        }
        Ok(self.objects.allocate(descriptor, value, flags))
    }

    /// Shared access to an object's payload
    pub fn get<T: Managed>(&self, reference: ObjectRef) -> GcResult<&T> {
        let (_, item) = self.resolve_accessible(reference)?;
        let payload = Self::checked_payload::<T>(item)?;
        // SAFETY: payload is a live `T` (or a type with `T` as prefix).
        Ok(unsafe { payload.cast::<T>().as_ref() })
    }

    /// Exclusive access to an object's payload
    pub fn get_mut<T: Managed>(&mut self, reference: ObjectRef) -> GcResult<&mut T> {
        let (_, item) = self.resolve_accessible(reference)?;
        let payload = Self::checked_payload::<T>(item)?;
        // SAFETY: as above; `&mut self` excludes every other access.
        Ok(unsafe { payload.cast::<T>().as_mut() })
    }

    /// Type name of a live object
    pub fn type_name(&self, reference: ObjectRef) -> GcResult<&'static str> {
        let (_, item) = self.resolve(reference)?;
        Ok(item.type_name())
    }

    /// Add an object to the root set
    pub fn add_to_root(&mut self, reference: ObjectRef) -> GcResult<()> {
        let (id, item) = self.resolve_accessible(reference)?;
        if item.flags().intersects(ObjectFlags::PENDING_KILL) {
            return Err(GcError::PendingKillRoot {
                object: id,
                type_name: item.type_name(),
            });
        }
        item.flags().insert(ObjectFlags::ROOT_SET);
        Ok(())
    }

    /// Remove an object from the root set
    pub fn remove_from_root(&mut self, reference: ObjectRef) -> GcResult<()> {
        let (_, item) = self.resolve_accessible(reference)?;
        item.flags().remove(ObjectFlags::ROOT_SET);
        Ok(())
    }

    /// Set or clear the keep-alive policy flag
    pub fn set_keep_alive(&mut self, reference: ObjectRef, keep: bool) -> GcResult<()> {
        let (id, item) = self.resolve_accessible(reference)?;
        if keep {
            if item.flags().intersects(ObjectFlags::PENDING_KILL) {
                return Err(GcError::PendingKillRoot {
                    object: id,
                    type_name: item.type_name(),
                });
            }
            item.flags().insert(ObjectFlags::KEEP_ALIVE);
        } else {
            item.flags().remove(ObjectFlags::KEEP_ALIVE);
        }
        Ok(())
    }

    /// Request destruction of an object
    ///
    /// The object is never seeded again and strong references to it are
    /// nulled by the next pass. Rooted and permanent objects cannot be
    /// killed; a clustered object leaves its cluster, which is dissolved.
    pub fn mark_pending_kill(&mut self, reference: ObjectRef) -> GcResult<()> {
        let (id, item) = self.resolve_accessible(reference)?;
        let type_name = item.type_name();
        let cluster = item.cluster();
        if item.flags().intersects(ObjectFlags::ROOTS) {
            return Err(GcError::PendingKillRoot { object: id, type_name });
        }
        if self.objects.is_permanent(id) {
            return Err(GcError::PermanentObject { object: id, type_name });
        }
        if let Some(cluster) = cluster {
            self.dissolve(ClusterId(cluster));
        }
        if let Some(item) = self.objects.item(id) {
            item.flags().insert(ObjectFlags::PENDING_KILL);
        }
        Ok(())
    }

    /// Check whether a handle names an accessible object
    pub fn is_valid(&self, reference: ObjectRef) -> bool {
        self.resolve_accessible(reference).is_ok()
    }

    /// Flags of a live object
    pub fn flags(&self, reference: ObjectRef) -> Option<ObjectFlags> {
        self.objects
            .resolve(reference)
            .map(|(_, item)| item.flags().load())
    }

    // ===== Collection =====

    /// Run a reachability pass and start purging what it found unreachable
    ///
    /// A purge still pending from an earlier pass is completed first.
    pub fn collect_garbage(&mut self, options: CollectOptions) -> CollectionReport {
        if self.purge.is_pending() {
            log::debug!(
                "finishing previous purge ({} objects) before collecting",
                self.purge.remaining()
            );
            self.incremental_purge(PurgeBudget::Unbounded);
        }
        self.skipped_collections = 0;

        if self.config.verify_gc_assumptions {
            if let Err(error) = verify_gc_assumptions(&self.objects, &self.clusters) {
                fatal(error);
            }
        }

        let start = Instant::now();
        let workers = self.config.effective_workers(self.objects.len());
        let seeds = mark_objects_as_unreachable(&self.objects, workers);
        let result = perform_reachability_analysis(&self.objects, &self.clusters, seeds, &self.config);
        self.dissolve_after_pass();
        self.purge.start(&self.objects, result.weak_owners);
        let mark_time = start.elapsed();

        let unreachable = self.purge.unreachable_count();
        self.stats
            .record_mark(mark_time, result.marked, unreachable, result.waves, result.workers);
        log::debug!(
            "GC marked {} reachable, {} unreachable in {:?} ({} workers)",
            result.marked,
            unreachable,
            mark_time,
            result.workers
        );

        let purge = if options.force_full_purge || unreachable == 0 {
            self.incremental_purge(PurgeBudget::Unbounded)
        } else if let Some(budget) = options.time_budget {
            self.incremental_purge(PurgeBudget::TimeLimit(budget))
        } else {
            PurgeProgress::Incomplete {
                remaining: self.purge.remaining(),
            }
        };

        CollectionReport {
            marked: result.marked,
            unreachable,
            mark_time,
            waves: result.waves,
            workers: result.workers,
            purge,
        }
    }

    /// Collect unless a purge is still pending
    ///
    /// Returns `None` when skipped. After `retries_before_forcing` skips in a
    /// row the pending purge is finished and the collection runs anyway.
    pub fn try_collect_garbage(&mut self, options: CollectOptions) -> Option<CollectionReport> {
        if self.purge.is_pending() && self.skipped_collections < self.config.retries_before_forcing {
            self.skipped_collections += 1;
            log::trace!(
                "collection skipped, purge pending ({} of {})",
                self.skipped_collections,
                self.config.retries_before_forcing
            );
            return None;
        }
        Some(self.collect_garbage(options))
    }

    /// Continue the pending purge within `budget`
    pub fn incremental_purge(&mut self, budget: PurgeBudget) -> PurgeProgress {
        self.purge
            .tick(&mut self.objects, &self.config, budget, &mut self.stats)
    }

    /// Check if unreachable objects are still waiting to be freed
    pub fn is_purge_pending(&self) -> bool {
        self.purge.is_pending()
    }

    // ===== Clusters =====

    /// Group `root` and `members` into a cluster that lives and dies as one
    ///
    /// The outside references of every object are recorded now. References
    /// added later are not seen by passes until the cluster is dissolved;
    /// `verify_gc_assumptions` reports them.
    pub fn create_cluster(&mut self, root: ObjectRef, members: &[ObjectRef]) -> GcResult<ClusterId> {
        let root_id = self.clusterable(root)?;
        let mut seen = FxHashSet::default();
        seen.insert(root_id);
        let mut member_ids = Vec::with_capacity(members.len());
        for &member in members {
            let id = self.clusterable(member)?;
            if seen.insert(id) {
                member_ids.push(id);
            }
        }

        let cluster = build_cluster(&self.objects, root_id, member_ids);
        let objects: Vec<ObjectId> = cluster.objects().collect();
        let references = cluster.references.len();
        let id = self.clusters.insert(cluster);
        for &object in &objects {
            self.objects.set_cluster(object, Some(id.0));
        }
        if let Some(item) = self.objects.item(root_id) {
            item.flags().insert(ObjectFlags::CLUSTER_ROOT);
        }
        log::debug!(
            "{} created: {} objects, {} outside references",
            id,
            objects.len(),
            references
        );
        Ok(id)
    }

    /// Return a cluster's objects to ordinary tracing
    pub fn dissolve_cluster(&mut self, id: ClusterId) -> GcResult<()> {
        if self.dissolve(id) {
            Ok(())
        } else {
            Err(GcError::InvalidCluster(id))
        }
    }

    /// Cluster an object belongs to
    pub fn cluster_of(&self, reference: ObjectRef) -> Option<ClusterId> {
        let (_, item) = self.objects.resolve(reference)?;
        item.cluster().map(ClusterId)
    }

    /// Number of live clusters
    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    /// Check that permanent objects and clusters hold no reference a pass
    /// would miss
    pub fn verify_gc_assumptions(&self) -> GcResult<()> {
        verify_gc_assumptions(&self.objects, &self.clusters)
    }

    // ===== Permanent Pool =====

    /// Move every live object into the permanent pool
    ///
    /// Permanent objects are never collected. Passes skip them unless they
    /// are rooted, so a non-rooted permanent object must reference only
    /// permanent objects. Returns the number of objects in the pool.
    pub fn close_disregard_for_gc(&mut self) -> GcResult<usize> {
        if self.objects.permanent_limit() > 0 {
            return Err(GcError::PermanentPoolUnavailable("already closed"));
        }
        if self.purge.is_pending() {
            return Err(GcError::PermanentPoolUnavailable("purge pending"));
        }
        if !self.clusters.is_empty() {
            return Err(GcError::PermanentPoolUnavailable("clusters exist"));
        }
        let count = self.objects.close_permanent_pool();
        log::info!(
            "permanent pool closed: {} objects in {} slots",
            count,
            self.objects.permanent_limit()
        );
        Ok(count)
    }

    /// Return the permanent pool to ordinary collection
    pub fn disable_disregard_for_gc(&mut self) {
        if self.objects.permanent_limit() > 0 {
            log::info!(
                "permanent pool disabled: {} slots returned",
                self.objects.permanent_limit()
            );
        }
        self.objects.open_permanent_pool();
    }

    /// Check whether an object is in the permanent pool
    pub fn is_permanent(&self, reference: ObjectRef) -> bool {
        self.objects
            .resolve(reference)
            .is_some_and(|(id, _)| self.objects.is_permanent(id))
    }

    // ===== Internal =====

    /// Validate an object for `create_cluster`
    fn clusterable(&self, reference: ObjectRef) -> GcResult<ObjectId> {
        let (id, item) = self.resolve_accessible(reference)?;
        let reason = if self.objects.is_permanent(id) {
            Some("permanent")
        } else if item.cluster().is_some() {
            Some("already clustered")
        } else if item.flags().intersects(ObjectFlags::PENDING_KILL) {
            Some("pending kill")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(GcError::InvalidClusterObject {
                object: id,
                type_name: item.type_name(),
                reason,
            }),
            None => Ok(id),
        }
    }

    /// Unlink a cluster's objects; false if `id` is unknown
    fn dissolve(&mut self, id: ClusterId) -> bool {
        let Some(cluster) = self.clusters.remove(id) else {
            return false;
        };
        if let Some(item) = self.objects.item(cluster.root) {
            item.flags().remove(ObjectFlags::CLUSTER_ROOT);
        }
        for object in cluster.objects() {
            self.objects.set_cluster(object, None);
        }
        self.stats.clusters_dissolved += 1;
        log::trace!("{} dissolved ({} objects)", id, cluster.members.len() + 1);
        true
    }

    /// Dissolve clusters found dead or flagged by the last pass
    fn dissolve_after_pass(&mut self) {
        let doomed: Vec<ClusterId> = self
            .clusters
            .iter()
            .filter(|(_, cluster)| {
                cluster.needs_dissolving()
                    || self
                        .objects
                        .item(cluster.root)
                        .map_or(true, |item| item.is_unreachable())
            })
            .map(|(id, _)| id)
            .collect();
        for id in doomed {
            self.dissolve(id);
        }
    }

    pub(crate) fn resolve(&self, reference: ObjectRef) -> GcResult<(ObjectId, &ObjectItem)> {
        self.objects
            .resolve(reference)
            .ok_or(GcError::InvalidObject(reference))
    }

    /// Report the references held by `id` to `collector`
    pub(crate) fn trace_with<C: ReferenceCollector>(
        &self,
        tracer: &mut Tracer,
        id: ObjectId,
        collector: &mut C,
    ) {
        trace_item(tracer, &self.objects, id, collector);
    }

    /// Resolve, rejecting objects that are unreachable or being destroyed
    fn resolve_accessible(&self, reference: ObjectRef) -> GcResult<(ObjectId, &ObjectItem)> {
        let (id, item) = self.resolve(reference)?;
        if item
            .flags()
            .intersects(ObjectFlags::UNREACHABLE | ObjectFlags::DESTROYING)
        {
            return Err(GcError::InvalidObject(reference));
        }
        Ok((id, item))
    }

    fn checked_payload<T: Managed>(item: &ObjectItem) -> GcResult<std::ptr::NonNull<u8>> {
        let (Some(payload), Some(descriptor)) = (item.payload(), item.descriptor()) else {
            return Err(GcError::TypeNotRegistered(std::any::type_name::<T>()));
        };
        if !descriptor.is_a(TypeId::of::<T>()) {
            return Err(GcError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                found: descriptor.name(),
            });
        }
        Ok(payload)
    }
}

impl Drop for CollectorContext {
    fn drop(&mut self) {
        if self.purge.is_pending() {
            self.incremental_purge(PurgeBudget::Unbounded);
        }
        if self.objects.is_empty() {
            return;
        }
        // Route every remaining object through both destruction stages
        log::debug!("collector shutdown: destroying {} objects", self.objects.len());
        let clusters: Vec<ClusterId> = self.clusters.iter().map(|(id, _)| id).collect();
        for id in clusters {
            self.dissolve(id);
        }
        self.objects.open_permanent_pool();
        for (_, item) in self.objects.iter() {
            item.flags().remove(ObjectFlags::ROOTS);
            item.flags().insert(ObjectFlags::UNREACHABLE);
        }
        self.purge.start(&self.objects, Vec::new());
        self.incremental_purge(PurgeBudget::Unbounded);
    }
}

impl std::fmt::Debug for CollectorContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorContext")
            .field("objects", &self.objects.len())
            .field("types", &self.registry.len())
            .field("clusters", &self.clusters.len())
            .field("permanent", &self.objects.permanent_limit())
            .field("purge_pending", &self.purge.is_pending())
            .field("collections", &self.stats.collections)
            .finish()
    }
}

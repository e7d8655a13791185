//! Reachability analysis
//!
//! A pass has two steps:
//!
//! 1. `mark_objects_as_unreachable` flags every live object `UNREACHABLE`
//!    except the root set, and seeds the worklist with the roots and the
//!    targets of persistent references. Permanent objects are left alone
//!    unless rooted.
//! 2. `perform_reachability_analysis` drains the worklist. Each popped object
//!    is traced; a target whose `UNREACHABLE` bit this thread cleared is new
//!    and gets pushed. A target inside a cluster claims the whole cluster
//!    instead (see [`cluster`](super::cluster)).
//!
//! The parallel variant runs in waves separated by a barrier:
//!
//! ```text
//!   frontier ──split──► worker 0 ─┐   pop / steal   ┌─► overflow 0 ─┐
//!                      worker 1 ─┼──────────────────┼─► overflow 1 ─┼─► frontier
//!                      worker N ─┘                  └─► overflow N ─┘
//!                                   ═══ barrier ═══
//! ```
//!
//! Discoveries stay in the discovering worker's deque up to a limit; the rest
//! spill into its overflow buffer, merged by the barrier leader into the next
//! wave's frontier. The pass ends when a wave produces nothing.
//!
//! A worker that panics (a fatal error while tracing) still reaches every
//! barrier: the panic is caught, the pass is flagged aborted, all workers
//! leave after the current wave and the first payload is re-raised on the
//! calling thread.

use super::cluster::ClusterTable;
use super::tracer::{ReferenceCollector, ReferenceKind, ReferenceOrigin, ReferenceSlot, Tracer};
use crate::config::GcConfig;
use crate::object::{ObjectFlags, ObjectId, ObjectItem, ObjectTable};
use crate::{fatal, GcError};
use crossbeam::utils::CachePadded;
use crossbeam_deque::{Steal, Stealer, Worker};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Barrier;

/// Initial worklist of a pass
#[derive(Debug, Default)]
pub(crate) struct Seeds {
    /// Rooted objects and persistent targets, already unflagged
    pub(crate) objects: Vec<ObjectId>,
    /// Clusters to claim before draining
    pub(crate) clusters: Vec<u32>,
}

impl Seeds {
    fn append(&mut self, other: &mut Seeds) {
        self.objects.append(&mut other.objects);
        self.clusters.append(&mut other.clusters);
    }
}

/// Outcome of one reachability pass
#[derive(Debug, Default)]
pub(crate) struct ReachabilityResult {
    /// Objects found reachable, cluster objects included
    pub(crate) marked: usize,
    /// Barrier-separated waves (1 for the single-threaded pass)
    pub(crate) waves: usize,
    /// Workers used
    pub(crate) workers: usize,
    /// Reachable objects holding at least one non-null weak reference
    pub(crate) weak_owners: Vec<ObjectId>,
}

/// Flag the population unreachable and collect the initial worklist
///
/// Returns the seeds: the root set plus every object a persistent reference
/// points to, and the clusters either of them belongs to.
pub(crate) fn mark_objects_as_unreachable(objects: &ObjectTable, workers: usize) -> Seeds {
    let slots = objects.slots();
    let permanent = objects.permanent_limit();
    let (mut seeds, holders) = if workers > 1 && slots.len() >= workers * 2 {
        let chunk_size = slots.len().div_ceil(workers);
        std::thread::scope(|scope| {
            let handles: Vec<_> = slots
                .chunks(chunk_size)
                .enumerate()
                .map(|(chunk, items)| {
                    scope.spawn(move || {
                        let mut seeds = Seeds::default();
                        let mut holders = Vec::new();
                        let base = chunk * chunk_size;
                        for (offset, item) in items.iter().enumerate() {
                            let index = base + offset;
                            let id = ObjectId(index as u32);
                            scan_slot(id, item, index < permanent, &mut seeds, &mut holders);
                        }
                        (seeds, holders)
                    })
                })
                .collect();

            let mut seeds = Seeds::default();
            let mut holders = Vec::new();
            for handle in handles {
                match handle.join() {
                    Ok((mut chunk_seeds, chunk_holders)) => {
                        seeds.append(&mut chunk_seeds);
                        holders.extend(chunk_holders);
                    }
                    Err(payload) => panic::resume_unwind(payload),
                }
            }
            (seeds, holders)
        })
    } else {
        let mut seeds = Seeds::default();
        let mut holders = Vec::new();
        for (index, item) in slots.iter().enumerate() {
            scan_slot(ObjectId(index as u32), item, index < permanent, &mut seeds, &mut holders);
        }
        (seeds, holders)
    };

    // Persistent targets are seeded even when the holder itself is unreachable
    let mut seeder = PersistentSeeder {
        objects,
        seeds: &mut seeds,
    };
    let mut tracer = Tracer::new();
    for holder in holders {
        trace_item(&mut tracer, objects, holder, &mut seeder);
    }

    log::trace!(
        "reachability: {} seeds, {} seeded clusters",
        seeds.objects.len(),
        seeds.clusters.len()
    );
    seeds
}

#[inline]
fn scan_slot(id: ObjectId, item: &ObjectItem, permanent: bool, seeds: &mut Seeds, holders: &mut Vec<ObjectId>) {
    let Some(descriptor) = item.descriptor() else {
        return;
    };
    let flags = item.flags();
    let current = flags.load();
    let rooted = current.intersects(ObjectFlags::ROOTS);

    if rooted && current.contains(ObjectFlags::PENDING_KILL) {
        fatal(GcError::PendingKillRoot {
            object: id,
            type_name: descriptor.name(),
        });
    }

    if permanent {
        // Never flagged; only rooted ones are traced
        if rooted {
            seeds.objects.push(id);
        }
        return;
    }

    if let Some(cluster) = item.cluster() {
        // Cluster objects wait for their cluster to be claimed
        flags.insert(ObjectFlags::UNREACHABLE);
        if rooted {
            seeds.clusters.push(cluster);
        }
    } else if rooted {
        flags.remove(ObjectFlags::UNREACHABLE);
        seeds.objects.push(id);
    } else {
        flags.insert(ObjectFlags::UNREACHABLE);
    }

    if descriptor.has_persistent_references() {
        holders.push(id);
    }
}

/// Trace one object if it is live and has references
#[inline]
pub(super) fn trace_item<C: ReferenceCollector>(
    tracer: &mut Tracer,
    objects: &ObjectTable,
    id: ObjectId,
    collector: &mut C,
) {
    let Some(item) = objects.item(id) else {
        return;
    };
    let (Some(payload), Some(descriptor)) = (item.payload(), item.descriptor()) else {
        return;
    };
    // Streams holding only the terminator
    if descriptor.token_stream().len() <= 1 {
        return;
    }
    // SAFETY: the payload is live and described by `descriptor`. Marking
    // claims each object once, so no other thread traces it concurrently.
    unsafe { tracer.trace(payload, descriptor, id, collector) };
}

/// Seeds the targets of persistent references
struct PersistentSeeder<'a> {
    objects: &'a ObjectTable,
    seeds: &'a mut Seeds,
}

impl ReferenceCollector for PersistentSeeder<'_> {
    fn handle_object_reference(&mut self, slot: &ReferenceSlot<'_>, origin: ReferenceOrigin) {
        if origin.kind != ReferenceKind::Persistent {
            return;
        }
        let Some((id, item)) = self.objects.resolve(slot.get()) else {
            return;
        };
        if self.objects.is_permanent(id) || item.flags().intersects(ObjectFlags::PENDING_KILL) {
            return;
        }
        if let Some(cluster) = item.cluster() {
            self.seeds.clusters.push(cluster);
        } else if item.flags().try_clear_unreachable() {
            self.seeds.objects.push(id);
        }
    }
}

/// Marks the targets of traced references
struct MarkCollector<'a> {
    objects: &'a ObjectTable,
    clusters: &'a ClusterTable,
    verify: bool,
    discovered: Vec<ObjectId>,
    weak_owners: Vec<ObjectId>,
    /// Clusters claimed but not yet expanded
    claimed_clusters: Vec<u32>,
    /// Objects marked through claimed clusters
    cluster_objects: usize,
}

impl<'a> MarkCollector<'a> {
    fn new(objects: &'a ObjectTable, clusters: &'a ClusterTable, config: &GcConfig) -> Self {
        Self {
            objects,
            clusters,
            verify: config.verify_references,
            discovered: Vec::new(),
            weak_owners: Vec::new(),
            claimed_clusters: Vec::new(),
            cluster_objects: 0,
        }
    }

    /// Claim a cluster and everything it keeps alive
    fn mark_cluster(&mut self, index: u32) {
        let clusters = self.clusters;
        self.claimed_clusters.push(index);
        while let Some(index) = self.claimed_clusters.pop() {
            let Some(cluster) = clusters.get(index) else {
                continue;
            };
            let Some(root) = self.objects.item(cluster.root) else {
                continue;
            };
            if !root.flags().try_clear_unreachable() {
                continue;
            }
            for &member in &cluster.members {
                if let Some(item) = self.objects.item(member) {
                    item.flags().remove(ObjectFlags::UNREACHABLE);
                }
            }
            self.cluster_objects += 1 + cluster.members.len();
            self.weak_owners.extend_from_slice(&cluster.weak_holders);

            for &reference in &cluster.references {
                let Some((id, item)) = self.objects.resolve(reference) else {
                    if self.verify {
                        fatal(GcError::DanglingReference {
                            referencer: cluster.root,
                            type_name: root.type_name(),
                            field: "cluster".to_string(),
                            target: reference,
                        });
                    }
                    continue;
                };
                if self.objects.is_permanent(id) {
                    continue;
                }
                // Kept alive this pass; the references are nulled once the
                // dissolved cluster is traced
                if item.flags().intersects(ObjectFlags::PENDING_KILL) {
                    cluster.request_dissolve();
                }
                match item.cluster() {
                    Some(other) => self.claimed_clusters.push(other),
                    None => {
                        if item.flags().try_clear_unreachable() {
                            self.discovered.push(id);
                        }
                    }
                }
            }
        }
    }

    #[cold]
    fn dangling(&self, slot: &ReferenceSlot<'_>, origin: ReferenceOrigin) -> ! {
        let (type_name, field) = match self
            .objects
            .item(origin.referencer)
            .and_then(|item| item.descriptor())
        {
            Some(descriptor) => (
                descriptor.name(),
                origin
                    .token_index
                    .map(|index| descriptor.token_stream().field_name(index))
                    .unwrap_or_else(|| "native".to_string()),
            ),
            None => ("<free>", "native".to_string()),
        };
        fatal(GcError::DanglingReference {
            referencer: origin.referencer,
            type_name,
            field,
            target: slot.get(),
        })
    }
}

impl ReferenceCollector for MarkCollector<'_> {
    #[inline]
    fn handle_object_reference(&mut self, slot: &ReferenceSlot<'_>, origin: ReferenceOrigin) {
        let target = slot.get();
        if target.is_null() {
            return;
        }
        let Some((id, item)) = self.objects.resolve(target) else {
            if self.verify {
                self.dangling(slot, origin);
            }
            return;
        };
        if self.objects.is_permanent(id) {
            return;
        }
        let flags = item.flags();
        if flags.intersects(ObjectFlags::PENDING_KILL)
            && slot.is_field()
            && matches!(origin.kind, ReferenceKind::Strong | ReferenceKind::Native)
        {
            // SAFETY: the referencer was claimed by this thread.
            unsafe { slot.clear() };
            return;
        }
        if let Some(cluster) = item.cluster() {
            self.mark_cluster(cluster);
        } else if flags.try_clear_unreachable() {
            self.discovered.push(id);
        }
    }

    #[inline]
    fn handle_weak_reference(&mut self, slot: &ReferenceSlot<'_>, origin: ReferenceOrigin) {
        if slot.get().is_null() || !slot.is_field() {
            return;
        }
        if self.weak_owners.last() != Some(&origin.referencer) {
            self.weak_owners.push(origin.referencer);
        }
    }
}

/// Drain the worklist, marking everything reachable from `seeds`
pub(crate) fn perform_reachability_analysis(
    objects: &ObjectTable,
    clusters: &ClusterTable,
    seeds: Seeds,
    config: &GcConfig,
) -> ReachabilityResult {
    let workers = config.effective_workers(objects.len());

    // Seeded clusters are claimed up front; what they reach joins the seeds
    let mut collector = MarkCollector::new(objects, clusters, config);
    for cluster in seeds.clusters {
        collector.mark_cluster(cluster);
    }
    let mut frontier = seeds.objects;
    frontier.append(&mut collector.discovered);

    let mut result = if workers > 1 {
        let mut result = mark_parallel(objects, clusters, frontier, config, workers);
        result.marked += collector.cluster_objects;
        result.weak_owners.append(&mut collector.weak_owners);
        result
    } else {
        mark_serial(collector, frontier)
    };
    result.weak_owners.sort_unstable();
    result.weak_owners.dedup();
    log::debug!(
        "reachability: {} reachable, {} waves, {} workers",
        result.marked,
        result.waves,
        result.workers
    );
    result
}

fn mark_serial(mut collector: MarkCollector<'_>, frontier: Vec<ObjectId>) -> ReachabilityResult {
    let objects = collector.objects;
    collector.discovered = frontier;
    let mut tracer = Tracer::new();
    let mut marked = 0;

    while let Some(id) = collector.discovered.pop() {
        marked += 1;
        trace_item(&mut tracer, objects, id, &mut collector);
    }

    ReachabilityResult {
        marked: marked + collector.cluster_objects,
        waves: 1,
        workers: 1,
        weak_owners: collector.weak_owners,
    }
}

/// State shared by the workers of one parallel pass
struct WaveState {
    barrier: Barrier,
    done: AtomicBool,
    aborted: AtomicBool,
    /// First panic caught in a worker
    panic: Mutex<Option<Box<dyn Any + Send>>>,
    waves: AtomicUsize,
    /// Objects each worker starts the next wave with
    inbox: Vec<CachePadded<Mutex<Vec<ObjectId>>>>,
    /// Discoveries that did not fit the worker's deque
    overflow: Vec<CachePadded<Mutex<Vec<ObjectId>>>>,
    marked: Vec<CachePadded<AtomicUsize>>,
    weak_owners: Mutex<Vec<ObjectId>>,
}

impl WaveState {
    fn new(workers: usize) -> Self {
        let buffers = || {
            (0..workers)
                .map(|_| CachePadded::new(Mutex::new(Vec::new())))
                .collect::<Vec<_>>()
        };
        Self {
            barrier: Barrier::new(workers),
            done: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            panic: Mutex::new(None),
            waves: AtomicUsize::new(0),
            inbox: buffers(),
            overflow: buffers(),
            marked: (0..workers)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
            weak_owners: Mutex::new(Vec::new()),
        }
    }

    /// Round-robin `frontier` over the inboxes
    fn distribute(&self, frontier: Vec<ObjectId>) {
        let workers = self.inbox.len();
        let share = frontier.len().div_ceil(workers).max(1);
        for (worker, chunk) in frontier.chunks(share).enumerate() {
            self.inbox[worker].lock().extend_from_slice(chunk);
        }
    }

    /// Merge every overflow buffer into the next wave; run by the barrier leader
    fn advance(&self) {
        let mut frontier = Vec::new();
        for buffer in &self.overflow {
            frontier.append(&mut buffer.lock());
        }
        if frontier.is_empty() || self.is_aborted() {
            self.done.store(true, Ordering::Release);
        } else {
            self.waves.fetch_add(1, Ordering::Relaxed);
            self.distribute(frontier);
        }
    }

    /// Record a worker panic; later payloads are dropped
    fn abort(&self, payload: Box<dyn Any + Send>) {
        let mut slot = self.panic.lock();
        if slot.is_none() {
            *slot = Some(payload);
        }
        self.aborted.store(true, Ordering::Release);
    }

    #[inline]
    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }
}

/// Per-thread side of the parallel pass
struct MarkWorker<'a> {
    index: usize,
    deque: Worker<ObjectId>,
    stealers: &'a [Stealer<ObjectId>],
    state: &'a WaveState,
    local_limit: usize,
}

impl MarkWorker<'_> {
    fn run(self, objects: &ObjectTable, clusters: &ClusterTable, config: &GcConfig) {
        let mut collector = MarkCollector::new(objects, clusters, config);
        let mut tracer = Tracer::new();
        let mut marked = 0;

        loop {
            let wave = panic::catch_unwind(AssertUnwindSafe(|| {
                for id in self.state.inbox[self.index].lock().drain(..) {
                    self.deque.push(id);
                }

                while let Some(id) = self.find_work() {
                    if self.state.is_aborted() {
                        break;
                    }
                    marked += 1;
                    trace_item(&mut tracer, objects, id, &mut collector);
                    self.publish(&mut collector.discovered);
                }
            }));
            if let Err(payload) = wave {
                self.state.abort(payload);
            }
            if self.state.is_aborted() {
                while self.deque.pop().is_some() {}
                collector.discovered.clear();
            }

            // Every worker arrives here, panicked or not
            if self.state.barrier.wait().is_leader() {
                self.state.advance();
            }
            self.state.barrier.wait();
            if self.state.done.load(Ordering::Acquire) {
                break;
            }
        }

        self.state.marked[self.index].store(marked + collector.cluster_objects, Ordering::Relaxed);
        self.state.weak_owners.lock().append(&mut collector.weak_owners);
    }

    /// Keep discoveries local up to the limit, spill the rest
    fn publish(&self, discovered: &mut Vec<ObjectId>) {
        let room = self.local_limit.saturating_sub(self.deque.len());
        if discovered.len() <= room {
            for id in discovered.drain(..) {
                self.deque.push(id);
            }
            return;
        }
        for id in discovered.drain(..room) {
            self.deque.push(id);
        }
        self.state.overflow[self.index].lock().append(discovered);
    }

    fn find_work(&self) -> Option<ObjectId> {
        if let Some(id) = self.deque.pop() {
            return Some(id);
        }
        self.steal_from_others()
    }

    fn steal_from_others(&self) -> Option<ObjectId> {
        use rand::Rng;

        let count = self.stealers.len();
        if count < 2 {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..count);
        for i in 0..count {
            let victim = (start + i) % count;
            if victim == self.index {
                continue;
            }
            loop {
                match self.stealers[victim].steal() {
                    Steal::Success(id) => return Some(id),
                    Steal::Empty => break,
                    Steal::Retry => continue,
                }
            }
        }
        None
    }
}

fn mark_parallel(
    objects: &ObjectTable,
    clusters: &ClusterTable,
    frontier: Vec<ObjectId>,
    config: &GcConfig,
    workers: usize,
) -> ReachabilityResult {
    let state = WaveState::new(workers);
    state.distribute(frontier);
    state.waves.store(1, Ordering::Relaxed);

    let deques: Vec<Worker<ObjectId>> = (0..workers).map(|_| Worker::new_lifo()).collect();
    let stealers: Vec<Stealer<ObjectId>> = deques.iter().map(Worker::stealer).collect();

    std::thread::scope(|scope| {
        let handles: Vec<_> = deques
            .into_iter()
            .enumerate()
            .map(|(index, deque)| {
                let worker = MarkWorker {
                    index,
                    deque,
                    stealers: &stealers,
                    state: &state,
                    local_limit: config.local_queue_limit.max(1),
                };
                scope.spawn(move || worker.run(objects, clusters, config))
            })
            .collect();
        for handle in handles {
            if let Err(payload) = handle.join() {
                panic::resume_unwind(payload);
            }
        }
    });

    if let Some(payload) = state.panic.lock().take() {
        log::error!(
            "reachability: parallel pass aborted after {} waves",
            state.waves.load(Ordering::Relaxed)
        );
        panic::resume_unwind(payload);
    }

    ReachabilityResult {
        marked: state
            .marked
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .sum(),
        waves: state.waves.load(Ordering::Relaxed),
        workers,
        weak_owners: state.weak_owners.into_inner(),
    }
}

//! Incremental purge
//!
//! Objects found unreachable by a pass are destroyed in stages:
//!
//! ```text
//!  BeginDestroy ──► ClearWeak ──► FinishDestroy ──► PendingFinishDestroy ──► Free ──► Idle
//!   (every object)   (weak slots    (ready objects)   (objects that were          (drop +
//!                     of survivors)                    not ready, retried)          dealloc)
//! ```
//!
//! Each stage walks the unreachable list from a saved cursor. A tick stops at
//! any object boundary once its time limit is exceeded and the next tick
//! resumes exactly there. The clock is read every `destroy_poll_interval`
//! objects in the destroy stages and every `free_poll_interval` objects while
//! freeing.

use super::reachability::trace_item;
use super::stats::GcStats;
use super::tracer::{ReferenceCollector, ReferenceOrigin, ReferenceSlot, Tracer};
use crate::config::GcConfig;
use crate::defaults::DEFAULT_STATS_TOP_TYPES;
use crate::object::{ObjectFlags, ObjectId, ObjectTable};
use crate::{fatal, GcError};
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

/// Time allowed for one purge tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeBudget {
    /// Run until the purge is complete
    Unbounded,
    /// Stop at the first object boundary after this much time
    TimeLimit(Duration),
}

impl PurgeBudget {
    fn limit(self) -> Option<Duration> {
        match self {
            PurgeBudget::Unbounded => None,
            PurgeBudget::TimeLimit(limit) => Some(limit),
        }
    }
}

/// Result of a purge tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeProgress {
    /// Every unreachable object of the cycle has been freed
    Complete {
        /// Objects freed by the whole cycle
        purged: usize,
    },
    /// The budget ran out
    Incomplete {
        /// Objects not yet freed
        remaining: usize,
    },
}

impl PurgeProgress {
    /// Check if the purge finished
    pub fn is_complete(&self) -> bool {
        matches!(self, PurgeProgress::Complete { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PurgePhase {
    Idle,
    BeginDestroy { cursor: usize },
    ClearWeak,
    FinishDestroy { cursor: usize },
    /// `cursor` resumes a round cut short by the budget
    PendingFinishDestroy { rounds: u32, cursor: usize },
    Free { cursor: usize },
}

/// Polls the clock at a fixed granularity
struct Deadline {
    start: Instant,
    limit: Option<Duration>,
    polls: usize,
}

impl Deadline {
    fn new(limit: Option<Duration>) -> Self {
        Self {
            start: Instant::now(),
            limit,
            polls: 0,
        }
    }

    /// Called after each object; true once the limit is exceeded
    #[inline]
    fn expired(&mut self, granularity: usize) -> bool {
        let Some(limit) = self.limit else {
            return false;
        };
        let due = self.polls % granularity.max(1) == 0;
        self.polls += 1;
        due && self.start.elapsed() > limit
    }
}

/// Progress of the current purge cycle
#[derive(Debug)]
pub(crate) struct PurgeState {
    phase: PurgePhase,
    unreachable: Vec<ObjectId>,
    not_ready: Vec<ObjectId>,
    weak_owners: Vec<ObjectId>,
    objects_before: usize,
    freed: usize,
    purged_by_type: FxHashMap<&'static str, usize>,
}

impl Default for PurgeState {
    fn default() -> Self {
        Self {
            phase: PurgePhase::Idle,
            unreachable: Vec::new(),
            not_ready: Vec::new(),
            weak_owners: Vec::new(),
            objects_before: 0,
            freed: 0,
            purged_by_type: FxHashMap::default(),
        }
    }
}

impl PurgeState {
    /// Begin a cycle over the objects a pass left unreachable
    pub(crate) fn start(&mut self, objects: &ObjectTable, weak_owners: Vec<ObjectId>) {
        debug_assert!(!self.is_pending());
        self.unreachable = gather_unreachable(objects);
        self.weak_owners = weak_owners;
        self.objects_before = objects.len();
        self.freed = 0;
        self.not_ready.clear();
        self.purged_by_type.clear();
        self.phase = PurgePhase::BeginDestroy { cursor: 0 };
    }

    /// Check if a cycle has not finished yet
    pub(crate) fn is_pending(&self) -> bool {
        self.phase != PurgePhase::Idle
    }

    /// Objects of the current cycle not yet freed
    pub(crate) fn remaining(&self) -> usize {
        self.unreachable.len() - self.freed
    }

    /// Objects the current cycle will free
    pub(crate) fn unreachable_count(&self) -> usize {
        self.unreachable.len()
    }

    /// Run one tick
    pub(crate) fn tick(
        &mut self,
        objects: &mut ObjectTable,
        config: &GcConfig,
        budget: PurgeBudget,
        stats: &mut GcStats,
    ) -> PurgeProgress {
        if !self.is_pending() {
            return PurgeProgress::Complete { purged: 0 };
        }

        let mut deadline = Deadline::new(budget.limit());
        let freed_before = self.freed;
        let bytes_before = objects.allocated_bytes();

        let finished = self.run(objects, config, &mut deadline, stats);

        stats.record_purge(
            deadline.start.elapsed(),
            self.freed - freed_before,
            bytes_before - objects.allocated_bytes(),
        );

        if !finished {
            log::trace!("purge: budget exhausted, {} objects remaining", self.remaining());
            return PurgeProgress::Incomplete {
                remaining: self.remaining(),
            };
        }

        let purged = self.freed;
        log::info!(
            "GC purged {} objects ({} -> {})",
            purged,
            self.objects_before,
            objects.len()
        );
        if config.detailed_stats {
            self.log_purged_types();
        }
        stats.live_objects = objects.len();
        stats.live_bytes = objects.allocated_bytes();

        self.unreachable = Vec::new();
        self.weak_owners = Vec::new();
        self.freed = 0;
        PurgeProgress::Complete { purged }
    }

    /// Advance through the phases; returns true once the cycle is done
    fn run(
        &mut self,
        objects: &mut ObjectTable,
        config: &GcConfig,
        deadline: &mut Deadline,
        stats: &mut GcStats,
    ) -> bool {
        loop {
            match self.phase {
                PurgePhase::Idle => return true,

                PurgePhase::BeginDestroy { mut cursor } => {
                    while cursor < self.unreachable.len() {
                        begin_destroy(objects, self.unreachable[cursor]);
                        cursor += 1;
                        if deadline.expired(config.destroy_poll_interval) {
                            self.phase = PurgePhase::BeginDestroy { cursor };
                            return false;
                        }
                    }
                    self.phase = PurgePhase::ClearWeak;
                }

                PurgePhase::ClearWeak => {
                    let cleared = clear_weak_references(objects, &self.weak_owners);
                    log::trace!("purge: cleared {} weak references", cleared);
                    stats.weak_references_cleared += cleared;
                    self.phase = PurgePhase::FinishDestroy { cursor: 0 };
                }

                PurgePhase::FinishDestroy { mut cursor } => {
                    while cursor < self.unreachable.len() {
                        let id = self.unreachable[cursor];
                        if !self.finish_destroy_if_ready(objects, id, config) {
                            self.not_ready.push(id);
                        }
                        cursor += 1;
                        if deadline.expired(config.destroy_poll_interval) {
                            self.phase = PurgePhase::FinishDestroy { cursor };
                            return false;
                        }
                    }
                    self.phase = PurgePhase::PendingFinishDestroy { rounds: 0, cursor: 0 };
                }

                PurgePhase::PendingFinishDestroy { mut rounds, mut cursor } => {
                    while !self.not_ready.is_empty() {
                        while cursor < self.not_ready.len() {
                            let id = self.not_ready[cursor];
                            if self.finish_destroy_if_ready(objects, id, config) {
                                // The swapped-in entry has not been polled this round
                                self.not_ready.swap_remove(cursor);
                            } else {
                                cursor += 1;
                            }
                            if deadline.expired(config.destroy_poll_interval) {
                                self.phase = PurgePhase::PendingFinishDestroy { rounds, cursor };
                                return false;
                            }
                        }
                        cursor = 0;
                        rounds += 1;
                        if self.not_ready.is_empty() {
                            break;
                        }
                        if deadline.limit.is_some() {
                            // One full round per tick when time-limited
                            self.phase = PurgePhase::PendingFinishDestroy { rounds, cursor };
                            return false;
                        }
                        if rounds >= config.retries_before_forcing {
                            log::warn!(
                                "purge: forcing finish_destroy on {} objects still not ready after {} rounds",
                                self.not_ready.len(),
                                rounds
                            );
                            for id in std::mem::take(&mut self.not_ready) {
                                self.finish_destroy(objects, id, config);
                            }
                        } else {
                            std::thread::yield_now();
                        }
                    }
                    self.phase = PurgePhase::Free { cursor: 0 };
                }

                PurgePhase::Free { mut cursor } => {
                    while cursor < self.unreachable.len() {
                        self.free(objects, self.unreachable[cursor]);
                        cursor += 1;
                        if deadline.expired(config.free_poll_interval) {
                            self.phase = PurgePhase::Free { cursor };
                            return false;
                        }
                    }
                    self.phase = PurgePhase::Idle;
                }
            }
        }
    }

    fn finish_destroy_if_ready(&mut self, objects: &ObjectTable, id: ObjectId, config: &GcConfig) -> bool {
        let Some(item) = objects.item(id) else {
            return true;
        };
        let (Some(payload), Some(descriptor)) = (item.payload(), item.descriptor()) else {
            return true;
        };
        // SAFETY: the object is unreachable, so no mutator handle can reach it.
        let ready = unsafe { (descriptor.hooks().is_ready_for_finish_destroy)(payload) };
        if ready {
            self.finish_destroy(objects, id, config);
        }
        ready
    }

    fn finish_destroy(&mut self, objects: &ObjectTable, id: ObjectId, config: &GcConfig) {
        let Some(item) = objects.item(id) else {
            return;
        };
        let (Some(payload), Some(descriptor)) = (item.payload(), item.descriptor()) else {
            return;
        };
        let flags = item.flags().load();
        if !flags.contains(ObjectFlags::BEGIN_DESTROYED) || flags.contains(ObjectFlags::FINISH_DESTROYED) {
            fatal(GcError::DoubleDestroy {
                object: id,
                type_name: descriptor.name(),
                stage: "finish_destroy",
            });
        }
        item.flags().insert(ObjectFlags::FINISH_DESTROYED);
        if config.detailed_stats {
            *self.purged_by_type.entry(descriptor.name()).or_insert(0) += 1;
        }
        // SAFETY: as above.
        unsafe { (descriptor.hooks().finish_destroy)(payload) };
    }

    fn free(&mut self, objects: &mut ObjectTable, id: ObjectId) {
        let Some(item) = objects.item(id) else {
            return;
        };
        if !item.is_live() {
            return;
        }
        if !item.flags().intersects(ObjectFlags::FINISH_DESTROYED) {
            fatal(GcError::DoubleDestroy {
                object: id,
                type_name: item.type_name(),
                stage: "free",
            });
        }
        // SAFETY: finish_destroy has run; nothing references the payload.
        unsafe { objects.free(id) };
        self.freed += 1;
    }

    fn log_purged_types(&self) {
        let mut counts: Vec<_> = self.purged_by_type.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1).then(a.0.cmp(b.0)));
        for (name, count) in counts.into_iter().take(DEFAULT_STATS_TOP_TYPES) {
            log::debug!("purged {:>8} x {}", count, name);
        }
    }
}

/// Ids of every live object flagged unreachable, in slot order
fn gather_unreachable(objects: &ObjectTable) -> Vec<ObjectId> {
    objects
        .iter()
        .filter(|(_, item)| item.is_unreachable())
        .map(|(id, _)| id)
        .collect()
}

fn begin_destroy(objects: &ObjectTable, id: ObjectId) {
    let Some(item) = objects.item(id) else {
        return;
    };
    let (Some(payload), Some(descriptor)) = (item.payload(), item.descriptor()) else {
        return;
    };
    if item.flags().intersects(ObjectFlags::BEGIN_DESTROYED) {
        fatal(GcError::DoubleDestroy {
            object: id,
            type_name: descriptor.name(),
            stage: "begin_destroy",
        });
    }
    item.flags().insert(ObjectFlags::BEGIN_DESTROYED);
    // SAFETY: the object is unreachable, so no mutator handle can reach it.
    unsafe { (descriptor.hooks().begin_destroy)(payload) };
}

/// Nulls weak references whose target did not survive
struct WeakClearer<'a> {
    objects: &'a ObjectTable,
    cleared: usize,
}

impl ReferenceCollector for WeakClearer<'_> {
    fn handle_object_reference(&mut self, _slot: &ReferenceSlot<'_>, _origin: ReferenceOrigin) {}

    fn handle_weak_reference(&mut self, slot: &ReferenceSlot<'_>, _origin: ReferenceOrigin) {
        let target = slot.get();
        if target.is_null() {
            return;
        }
        let dead = match self.objects.resolve(target) {
            Some((_, item)) => item.is_unreachable(),
            None => true,
        };
        if dead {
            // SAFETY: the owner is traced by this thread only.
            unsafe { slot.clear() };
            self.cleared += 1;
        }
    }
}

/// Re-trace the recorded owners and null their dead weak references
fn clear_weak_references(objects: &ObjectTable, owners: &[ObjectId]) -> usize {
    let mut clearer = WeakClearer { objects, cleared: 0 };
    let mut tracer = Tracer::new();
    for &owner in owners {
        let Some(item) = objects.item(owner) else {
            continue;
        };
        if item.is_live() && !item.is_unreachable() {
            trace_item(&mut tracer, objects, owner, &mut clearer);
        }
    }
    clearer.cleared
}

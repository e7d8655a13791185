//! Reference queries
//!
//! Offline queries over the reference graph, built on the same tracer as
//! marking. They never modify objects and may be slow on large heaps.

use super::ObjectFilter;
use crate::gc::{
    CollectorContext, ReferenceCollector, ReferenceKind, ReferenceOrigin, ReferenceSlot, Tracer,
};
use crate::object::{ObjectId, ObjectRef, ObjectTable};
use crate::GcResult;
use rustc_hash::FxHashSet;
use std::collections::VecDeque;
use std::fmt;

/// Parameters of `referenced_objects`
#[derive(Debug, Clone, Default)]
pub struct ReferenceQuery {
    /// Follow references transitively
    pub recursive: bool,
    /// Report weak references too
    pub include_weak: bool,
    /// Only report and expand objects in this set
    pub within: Option<Vec<ObjectRef>>,
}

/// One way an object references another
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceDescription {
    /// Field path from the debug token map, or `native`
    pub field: String,
    /// Reference kind
    pub kind: ReferenceKind,
    /// Token that produced the reference
    pub token_index: Option<u32>,
}

impl fmt::Display for ReferenceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ReferenceKind::Strong => write!(f, "{}", self.field),
            ReferenceKind::Persistent => write!(f, "{} (persistent)", self.field),
            ReferenceKind::Weak => write!(f, "{} (weak)", self.field),
            ReferenceKind::Native => write!(f, "{} (native)", self.field),
        }
    }
}

/// Collects the distinct live targets of traced references
pub(crate) struct ReferenceFinder<'a> {
    objects: &'a ObjectTable,
    include_weak: bool,
    seen: FxHashSet<ObjectId>,
    pub(crate) found: Vec<ObjectId>,
}

impl<'a> ReferenceFinder<'a> {
    pub(crate) fn new(objects: &'a ObjectTable, include_weak: bool) -> Self {
        Self {
            objects,
            include_weak,
            seen: FxHashSet::default(),
            found: Vec::new(),
        }
    }

    /// Forget per-object state before tracing the next referencer
    pub(crate) fn reset(&mut self) {
        self.seen.clear();
        self.found.clear();
    }

    fn add(&mut self, target: ObjectRef) {
        if let Some((id, _)) = self.objects.resolve(target) {
            if self.seen.insert(id) {
                self.found.push(id);
            }
        }
    }
}

impl ReferenceCollector for ReferenceFinder<'_> {
    fn handle_object_reference(&mut self, slot: &ReferenceSlot<'_>, _origin: ReferenceOrigin) {
        self.add(slot.get());
    }

    fn handle_weak_reference(&mut self, slot: &ReferenceSlot<'_>, _origin: ReferenceOrigin) {
        if self.include_weak {
            self.add(slot.get());
        }
    }
}

/// Stops at the first strong reference into a target set
struct HasReferences<'a> {
    objects: &'a ObjectTable,
    targets: &'a FxHashSet<ObjectId>,
    found: bool,
}

impl ReferenceCollector for HasReferences<'_> {
    fn handle_object_reference(&mut self, slot: &ReferenceSlot<'_>, _origin: ReferenceOrigin) {
        if let Some((id, _)) = self.objects.resolve(slot.get()) {
            self.found |= self.targets.contains(&id);
        }
    }

    fn is_satisfied(&self) -> bool {
        self.found
    }
}

/// Records every reference to one target
struct ReferenceDescriber<'a> {
    objects: &'a ObjectTable,
    target: ObjectId,
    hits: Vec<ReferenceOrigin>,
}

impl ReferenceDescriber<'_> {
    fn record(&mut self, slot: &ReferenceSlot<'_>, origin: ReferenceOrigin) {
        if let Some((id, _)) = self.objects.resolve(slot.get()) {
            if id == self.target {
                self.hits.push(origin);
            }
        }
    }
}

impl ReferenceCollector for ReferenceDescriber<'_> {
    fn handle_object_reference(&mut self, slot: &ReferenceSlot<'_>, origin: ReferenceOrigin) {
        self.record(slot, origin);
    }

    fn handle_weak_reference(&mut self, slot: &ReferenceSlot<'_>, origin: ReferenceOrigin) {
        self.record(slot, origin);
    }
}

impl CollectorContext {
    /// Objects referenced by `object`
    ///
    /// With `recursive` set this is the transitive closure; `object` itself
    /// appears only if a cycle leads back to it.
    pub fn referenced_objects(&self, object: ObjectRef, query: &ReferenceQuery) -> GcResult<Vec<ObjectRef>> {
        let (start, _) = self.resolve(object)?;
        let within = query.within.as_ref().map(|refs| self.resolve_set(refs));

        let mut finder = ReferenceFinder::new(self.objects(), query.include_weak);
        let mut tracer = Tracer::new();
        let mut reported = FxHashSet::default();
        let mut result = Vec::new();
        let mut queue = VecDeque::from([start]);

        while let Some(id) = queue.pop_front() {
            finder.reset();
            self.trace_with(&mut tracer, id, &mut finder);
            for &target in &finder.found {
                if within.as_ref().is_some_and(|set| !set.contains(&target)) {
                    continue;
                }
                if reported.insert(target) {
                    result.push(self.objects().reference_to(target));
                    if query.recursive {
                        queue.push_back(target);
                    }
                }
            }
        }
        Ok(result)
    }

    /// Check if `from` directly references `to`
    ///
    /// Weak references do not count.
    pub fn references(&self, from: ObjectRef, to: ObjectRef) -> GcResult<bool> {
        self.references_any(from, &[to])
    }

    /// Check if `from` directly references any of `targets`
    pub fn references_any(&self, from: ObjectRef, targets: &[ObjectRef]) -> GcResult<bool> {
        let (id, _) = self.resolve(from)?;
        let targets = self.resolve_targets(targets)?;
        Ok(self.has_references(&mut Tracer::new(), id, &targets))
    }

    /// Objects among `candidates` that directly reference any of `targets`
    pub fn referencers_of(&self, targets: &[ObjectRef], candidates: &ObjectFilter) -> GcResult<Vec<ObjectRef>> {
        let targets = self.resolve_targets(targets)?;
        let mut tracer = Tracer::new();
        Ok(candidates
            .select(self.objects())
            .into_iter()
            .filter(|&id| self.has_references(&mut tracer, id, &targets))
            .map(|id| self.objects().reference_to(id))
            .collect())
    }

    /// The only object referencing `target`, if there is exactly one
    pub fn find_single_referencer(&self, target: ObjectRef) -> GcResult<Option<ObjectRef>> {
        let referencers = self.referencers_of(&[target], &ObjectFilter::All)?;
        Ok(match referencers.as_slice() {
            [single] => Some(*single),
            _ => None,
        })
    }

    /// Every field through which `from` references `to`
    pub fn describe_reference(&self, from: ObjectRef, to: ObjectRef) -> GcResult<Vec<ReferenceDescription>> {
        let (id, item) = self.resolve(from)?;
        let (target, _) = self.resolve(to)?;
        let mut describer = ReferenceDescriber {
            objects: self.objects(),
            target,
            hits: Vec::new(),
        };
        self.trace_with(&mut Tracer::new(), id, &mut describer);

        let stream = item.descriptor().map(|descriptor| descriptor.token_stream());
        Ok(describer
            .hits
            .into_iter()
            .map(|origin| ReferenceDescription {
                field: match (origin.token_index, stream) {
                    (Some(index), Some(stream)) => stream.field_name(index),
                    _ => "native".to_string(),
                },
                kind: origin.kind,
                token_index: origin.token_index,
            })
            .collect())
    }

    fn has_references(&self, tracer: &mut Tracer, id: ObjectId, targets: &FxHashSet<ObjectId>) -> bool {
        let mut finder = HasReferences {
            objects: self.objects(),
            targets,
            found: false,
        };
        self.trace_with(tracer, id, &mut finder);
        finder.found
    }

    /// Resolve every handle, failing on the first invalid one
    fn resolve_targets(&self, targets: &[ObjectRef]) -> GcResult<FxHashSet<ObjectId>> {
        targets
            .iter()
            .map(|&target| self.resolve(target).map(|(id, _)| id))
            .collect()
    }

    /// Resolve the valid handles, ignoring stale ones
    fn resolve_set(&self, refs: &[ObjectRef]) -> FxHashSet<ObjectId> {
        refs.iter()
            .filter_map(|&r| self.objects().resolve(r).map(|(id, _)| id))
            .collect()
    }
}

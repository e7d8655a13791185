//! Reference-graph diagnostics
//!
//! Query helpers layered on the tracer, exposed as methods of
//! [`CollectorContext`](crate::CollectorContext):
//! - `find_cycles`: strongly connected components and representative cycles
//! - `references` / `references_any`: does one object point at another
//! - `referencers_of` / `find_single_referencer`: who holds an object alive
//! - `referenced_objects`: direct or transitive references of an object
//! - `describe_reference`: the fields through which a reference is held

mod cycles;
mod finder;

pub use cycles::CycleReport;
pub use finder::{ReferenceDescription, ReferenceQuery};

use crate::object::{ObjectFlags, ObjectId, ObjectRef, ObjectTable};
use rustc_hash::FxHashSet;

/// Objects a diagnostic query examines
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ObjectFilter {
    /// Every live object
    All,
    /// Live objects outside the root set
    #[default]
    NonRooted,
    /// An explicit list; stale handles are skipped
    Objects(Vec<ObjectRef>),
}

impl ObjectFilter {
    /// Ids of the selected live objects, in slot order for `All`/`NonRooted`
    pub(crate) fn select(&self, objects: &ObjectTable) -> Vec<ObjectId> {
        match self {
            ObjectFilter::All => objects.iter().map(|(id, _)| id).collect(),
            ObjectFilter::NonRooted => objects
                .iter()
                .filter(|(_, item)| !item.flags().intersects(ObjectFlags::ROOTS))
                .map(|(id, _)| id)
                .collect(),
            ObjectFilter::Objects(refs) => {
                // First occurrence wins
                let mut seen = FxHashSet::default();
                refs.iter()
                    .filter_map(|&r| objects.resolve(r).map(|(id, _)| id))
                    .filter(|id| seen.insert(*id))
                    .collect()
            }
        }
    }
}

//! Garbage collection
//!
//! ```text
//!   roots + persistent targets
//!              │
//!              ▼
//!   ┌──────────────────────┐   trace    ┌────────────┐
//!   │ reachability (mark)  │ ─────────► │   tracer   │ ◄── token streams
//!   └──────────────────────┘            └────────────┘
//!              │ claims     ▲
//!              ▼            │ recorded references
//!   ┌──────────────────────┐
//!   │       clusters       │  dissolved when dead or holding pending kill
//!   └──────────────────────┘
//!              │ UNREACHABLE flags, weak owners
//!              ▼
//!   ┌──────────────────────┐
//!   │  purge (time-sliced) │  BeginDestroy → clear weak → FinishDestroy → free
//!   └──────────────────────┘
//! ```
//!
//! [`CollectorContext`] drives both phases; the tracer is public so
//! diagnostics and embedders can walk references with their own collectors.

mod cluster;
mod collector;
mod purge;
mod reachability;
mod stats;
mod tracer;

pub use cluster::ClusterId;
pub use collector::{CollectOptions, CollectionReport, CollectorContext};
pub use purge::{PurgeBudget, PurgeProgress};
pub use stats::GcStats;
pub use tracer::{
    trace_object, ReferenceCollector, ReferenceKind, ReferenceOrigin, ReferenceSlot,
    ReferenceVisitor, Tracer,
};

//! Token-stream driven garbage collector
//!
//! This crate provides a reachability collector for large, mutable, cyclic
//! graphs of managed objects:
//! - Per-type reference token streams describing where references live
//! - A stack-based tracer that walks token streams without reflection
//! - Single-threaded and worker-parallel reachability passes
//! - Clusters marked as a unit and a permanent pool the passes skip
//! - A time-sliced two-stage purge (BeginDestroy, then FinishDestroy)
//! - Reference-graph diagnostics (cycles, referencers, reference queries)
//!
//! All collector state lives in an explicit [`CollectorContext`]; independent
//! contexts never share roots, flags or purge progress.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod defaults;
pub mod diagnostics;
pub mod gc;
pub mod object;
pub mod types;

pub use config::GcConfig;
pub use diagnostics::{CycleReport, ObjectFilter, ReferenceDescription, ReferenceQuery};
pub use gc::{
    trace_object, ClusterId, CollectOptions, CollectionReport, CollectorContext, GcStats, PurgeBudget,
    PurgeProgress, ReferenceCollector, ReferenceKind, ReferenceOrigin, ReferenceSlot,
    ReferenceVisitor, Tracer,
};
pub use object::{ManagedArray, ObjectFlags, ObjectId, ObjectRef, WeakObjectRef};
pub use types::{
    CustomTraceFn, FieldLayout, Managed, ReferenceTokenStream, TokenKind, TypeDescriptor,
    TypeRegistry,
};

/// Collector errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GcError {
    /// A token stream failed structural validation
    #[error("Malformed token stream for {type_name} at token {index}: {reason}")]
    MalformedTokenStream {
        /// Owning type
        type_name: String,
        /// Offending token index
        index: u32,
        /// What is wrong with it
        reason: String,
    },

    /// A skip placeholder could not be patched
    #[error("Invalid skip patch (placeholder {placeholder}, target {target}): {reason}")]
    InvalidSkipPatch {
        /// Index of the placeholder word
        placeholder: u32,
        /// Requested jump target
        target: u32,
        /// Failed precondition
        reason: &'static str,
    },

    /// A reference field lies outside the instance
    #[error("Field {field} of {type_name} at offset {offset} exceeds instance size {size}")]
    OffsetOutOfBounds {
        /// Owning type
        type_name: String,
        /// Field path
        field: String,
        /// Byte offset of the field
        offset: usize,
        /// Instance size in bytes
        size: usize,
    },

    /// Field offset not aligned for the field's kind
    #[error("Field {field} of {type_name} at offset {offset} is not aligned to {align} bytes")]
    MisalignedField {
        /// Owning type
        type_name: String,
        /// Field path
        field: String,
        /// Byte offset of the field
        offset: usize,
        /// Required alignment
        align: usize,
    },

    /// A custom callback token names no registered callback
    #[error("Unresolved custom callback {id} in {type_name}")]
    UnresolvedCallback {
        /// Owning type
        type_name: String,
        /// Callback identifier
        id: u32,
    },

    /// A type was used before being registered
    #[error("Type not registered: {0}")]
    TypeNotRegistered(&'static str),

    /// Typed access with the wrong type
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Requested type
        expected: &'static str,
        /// Actual type of the object
        found: &'static str,
    },

    /// Flags a mutator may not set
    #[error("Invalid initial flags: {0:?}")]
    InvalidFlags(ObjectFlags),

    /// Null, stale or destroyed handle
    #[error("Invalid object reference: {0}")]
    InvalidObject(ObjectRef),

    /// Attempt to kill a rooted object
    #[error("Object {object} ({type_name}) is part of the root set and cannot be marked pending kill")]
    PendingKillRoot {
        /// Offending object
        object: ObjectId,
        /// Its type
        type_name: &'static str,
    },

    /// A live object references a freed or stale slot
    #[error("{referencer} ({type_name}) references freed object {target} through {field}")]
    DanglingReference {
        /// Referencing object
        referencer: ObjectId,
        /// Referencing type
        type_name: &'static str,
        /// Field path, or "native" for callback-reported references
        field: String,
        /// Dangling handle
        target: ObjectRef,
    },

    /// Operation not allowed on an object of the permanent pool
    #[error("Object {object} ({type_name}) is in the permanent pool")]
    PermanentObject {
        /// Offending object
        object: ObjectId,
        /// Its type
        type_name: &'static str,
    },

    /// The permanent pool cannot change state now
    #[error("Permanent pool unavailable: {0}")]
    PermanentPoolUnavailable(&'static str),

    /// A non-rooted permanent object references a collectable object
    #[error("Permanent object {object} ({type_name}) references non-permanent object {target} without being rooted")]
    PermanentPoolViolation {
        /// Referencing permanent object
        object: ObjectId,
        /// Its type
        type_name: &'static str,
        /// Collectable target
        target: ObjectRef,
    },

    /// An object cannot join a cluster
    #[error("Object {object} ({type_name}) cannot join a cluster: {reason}")]
    InvalidClusterObject {
        /// Offending object
        object: ObjectId,
        /// Its type
        type_name: &'static str,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Unknown or dissolved cluster
    #[error("Invalid cluster: {0}")]
    InvalidCluster(ClusterId),

    /// A cluster object references something the cluster did not record
    #[error("Object {object} ({type_name}) of cluster rooted at {root} references unrecorded object {target}")]
    ClusterViolation {
        /// Cluster root
        root: ObjectId,
        /// Referencing cluster object
        object: ObjectId,
        /// Its type
        type_name: &'static str,
        /// Unrecorded target
        target: ObjectRef,
    },

    /// A destruction hook ran twice or out of order
    #[error("Object {object} ({type_name}) {stage} twice or out of order")]
    DoubleDestroy {
        /// Offending object
        object: ObjectId,
        /// Its type
        type_name: &'static str,
        /// Destruction stage
        stage: &'static str,
    },
}

/// Collector result
pub type GcResult<T> = Result<T, GcError>;

/// Report an invariant violation and abort the current pass
#[cold]
#[inline(never)]
pub(crate) fn fatal(error: GcError) -> ! {
    log::error!("{}", error);
    panic!("{}", error)
}

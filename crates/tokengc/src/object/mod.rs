//! Managed objects
//!
//! - **ObjectRef / WeakObjectRef**: handles stored in instance memory
//! - **ObjectFlags**: lifecycle flags, atomically updated during marking
//! - **ManagedArray**: dynamic container with a layout the tracer can read
//! - **ObjectTable**: the object population of one collector

mod array;
mod flags;
mod handle;
mod table;

pub use array::ManagedArray;
pub(crate) use array::RawArrayHeader;
pub use flags::{AtomicObjectFlags, ObjectFlags};
pub use handle::{ObjectId, ObjectRef, WeakObjectRef};
pub use table::{ObjectItem, ObjectTable};

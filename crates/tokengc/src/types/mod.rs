//! Type information for tracing
//!
//! - **ReferenceTokenStream**: encoded reference locations of one type
//! - **FieldLayout**: declared reference fields, compiled into tokens
//! - **TypeDescriptor**: layout, composed stream and lifecycle hooks
//! - **TypeRegistry**: `TypeId` to descriptor map

mod descriptor;
mod layout;
mod registry;
mod token;

pub use descriptor::{DropFn, Managed, TypeDescriptor, TypeDescriptorBuilder};
pub(crate) use descriptor::LifecycleHooks;
pub use layout::{CustomTraceFn, Field, FieldLayout};
pub use registry::{TypeRegistry, TypeRegistryBuilder};
pub use token::{
    ReferenceInfo, ReferenceTokenStream, SkipInfo, TokenDebugInfo, TokenKind, SKIP_PLACEHOLDER,
};

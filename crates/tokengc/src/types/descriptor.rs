//! Type descriptors
//!
//! A descriptor is the runtime type information of one managed type: its
//! memory layout, its composed token stream and its lifecycle hooks.

use super::layout::{CustomTraceFn, FieldLayout};
use super::token::{ReferenceTokenStream, TokenKind};
use crate::{GcError, GcResult};
use std::alloc::Layout;
use std::any::TypeId;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;

/// Payload type of a managed object
///
/// The hooks run during the purge. `begin_destroy` runs while every other
/// unreachable object is still intact; `finish_destroy` must not touch other
/// managed objects.
pub trait Managed: Send + Sync + 'static {
    /// First destruction stage
    fn begin_destroy(&mut self) {}

    /// Whether `finish_destroy` may run now; polled again on later ticks
    fn is_ready_for_finish_destroy(&mut self) -> bool {
        true
    }

    /// Second destruction stage, releasing owned resources
    fn finish_destroy(&mut self) {}
}

/// Drop function type
pub type DropFn = unsafe fn(NonNull<u8>);

type HookFn = unsafe fn(NonNull<u8>);
type ReadyFn = unsafe fn(NonNull<u8>) -> bool;

/// Monomorphised lifecycle entry points of a type
#[derive(Clone, Copy)]
pub(crate) struct LifecycleHooks {
    pub(crate) begin_destroy: HookFn,
    pub(crate) is_ready_for_finish_destroy: ReadyFn,
    pub(crate) finish_destroy: HookFn,
    pub(crate) drop_fn: DropFn,
}

impl LifecycleHooks {
    fn of<T: Managed>() -> Self {
        unsafe fn begin_destroy<T: Managed>(instance: NonNull<u8>) {
            instance.cast::<T>().as_mut().begin_destroy()
        }
        unsafe fn is_ready<T: Managed>(instance: NonNull<u8>) -> bool {
            instance.cast::<T>().as_mut().is_ready_for_finish_destroy()
        }
        unsafe fn finish_destroy<T: Managed>(instance: NonNull<u8>) {
            instance.cast::<T>().as_mut().finish_destroy()
        }
        unsafe fn drop_value<T>(instance: NonNull<u8>) {
            std::ptr::drop_in_place(instance.cast::<T>().as_ptr())
        }

        Self {
            begin_destroy: begin_destroy::<T>,
            is_ready_for_finish_destroy: is_ready::<T>,
            finish_destroy: finish_destroy::<T>,
            drop_fn: drop_value::<T>,
        }
    }
}

/// Runtime type information of a managed type
pub struct TypeDescriptor {
    type_id: TypeId,
    name: &'static str,
    layout: Layout,
    token_stream: ReferenceTokenStream,
    parent: Option<Arc<TypeDescriptor>>,
    hooks: LifecycleHooks,
    has_persistent_references: bool,
}

impl TypeDescriptor {
    /// Start describing `T`
    pub fn builder<T: Managed>(name: &'static str) -> TypeDescriptorBuilder<T> {
        TypeDescriptorBuilder {
            name,
            parent: None,
            fields: FieldLayout::new(),
            _marker: PhantomData,
        }
    }

    /// Descriptor of a type without references
    pub fn leaf<T: Managed>(name: &'static str) -> GcResult<Arc<Self>> {
        Self::builder::<T>(name).build()
    }

    /// Type ID
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Type name
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Memory layout of an instance
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Instance size in bytes
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    /// Composed token stream (parent tokens first)
    #[inline(always)]
    pub fn token_stream(&self) -> &ReferenceTokenStream {
        &self.token_stream
    }

    /// Parent type
    pub fn parent(&self) -> Option<&Arc<TypeDescriptor>> {
        self.parent.as_ref()
    }

    /// Check whether this type is `type_id` or derives from it
    pub fn is_a(&self, type_id: TypeId) -> bool {
        let mut current = Some(self);
        while let Some(descriptor) = current {
            if descriptor.type_id == type_id {
                return true;
            }
            current = descriptor.parent.as_deref();
        }
        false
    }

    /// Whether instances hold persistent references that act as roots
    pub fn has_persistent_references(&self) -> bool {
        self.has_persistent_references
    }

    pub(crate) fn hooks(&self) -> &LifecycleHooks {
        &self.hooks
    }
}

impl std::fmt::Debug for TypeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("name", &self.name)
            .field("size", &self.layout.size())
            .field("align", &self.layout.align())
            .field("tokens", &self.token_stream.len())
            .field("parent", &self.parent.as_ref().map(|p| p.name))
            .finish()
    }
}

/// Builder for `TypeDescriptor`
///
/// Field offsets follow the contract documented on
/// [`FieldLayout`](super::FieldLayout): each must come from `offset_of!` on a
/// field of `T` of the declared kind. `build` rejects fields outside `T` and
/// misaligned fields, nothing more.
pub struct TypeDescriptorBuilder<T> {
    name: &'static str,
    parent: Option<Arc<TypeDescriptor>>,
    fields: FieldLayout,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Managed> TypeDescriptorBuilder<T> {
    /// Derive from `parent`
    ///
    /// `T` must be `#[repr(C)]` with the parent type as its first field so
    /// the parent's offsets stay valid.
    pub fn parent(mut self, parent: &Arc<TypeDescriptor>) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Declare an `ObjectRef` field
    pub fn object(mut self, offset: usize, name: &str) -> Self {
        self.fields = self.fields.object(offset, name);
        self
    }

    /// Declare an always-rooting `ObjectRef` field
    pub fn persistent(mut self, offset: usize, name: &str) -> Self {
        self.fields = self.fields.persistent(offset, name);
        self
    }

    /// Declare a `WeakObjectRef` field
    pub fn weak(mut self, offset: usize, name: &str) -> Self {
        self.fields = self.fields.weak(offset, name);
        self
    }

    /// Declare a `ManagedArray<ObjectRef>` field
    pub fn object_array(mut self, offset: usize, name: &str) -> Self {
        self.fields = self.fields.object_array(offset, name);
        self
    }

    /// Declare a `ManagedArray<S>` field with element fields `fields`
    pub fn struct_array<S>(mut self, offset: usize, name: &str, fields: FieldLayout) -> Self {
        self.fields = self
            .fields
            .struct_array(offset, name, std::mem::size_of::<S>(), fields);
        self
    }

    /// Declare a `[S; count]` field with element fields `fields`
    pub fn fixed_array<S>(mut self, offset: usize, name: &str, count: usize, fields: FieldLayout) -> Self {
        self.fields = self
            .fields
            .fixed_array(offset, name, std::mem::size_of::<S>(), count, fields);
        self
    }

    /// Declare a `[ObjectRef; count]` field
    pub fn fixed_objects(mut self, offset: usize, name: &str, count: usize) -> Self {
        self.fields = self.fields.fixed_objects(offset, name, count);
        self
    }

    /// Declare an embedded struct
    pub fn inline_struct(mut self, offset: usize, name: &str, fields: FieldLayout) -> Self {
        self.fields = self.fields.inline_struct(offset, name, fields);
        self
    }

    /// Register a custom trace callback
    pub fn custom(mut self, name: &str, callback: CustomTraceFn) -> Self {
        self.fields = self.fields.custom(name, callback);
        self
    }

    /// Append a prepared layout
    pub fn fields(mut self, layout: FieldLayout) -> Self {
        self.fields = self.fields.extend(layout);
        self
    }

    /// Compose the token stream and validate it
    ///
    /// Own fields are emitted first, then the parent stream is prepended,
    /// then the terminator is appended.
    pub fn build(self) -> GcResult<Arc<TypeDescriptor>> {
        let layout = Layout::new::<T>();
        if let Some(parent) = &self.parent {
            if parent.size() > layout.size() {
                return Err(GcError::OffsetOutOfBounds {
                    type_name: self.name.to_string(),
                    field: format!("<parent {}>", parent.name()),
                    offset: 0,
                    size: layout.size(),
                });
            }
        }

        let mut token_stream = ReferenceTokenStream::new();
        self.fields
            .emit_into(&mut token_stream, self.name, layout.size())?;
        if let Some(parent) = &self.parent {
            token_stream.prepend(parent.token_stream());
        }
        token_stream.finish();
        token_stream.validate(self.name, layout.size())?;

        let has_persistent_references = token_stream.contains_kind(TokenKind::PersistentObject);
        log::debug!(
            "registered type {} ({} bytes, {} token words)",
            self.name,
            layout.size(),
            token_stream.len()
        );

        Ok(Arc::new(TypeDescriptor {
            type_id: TypeId::of::<T>(),
            name: self.name,
            layout,
            token_stream,
            parent: self.parent,
            hooks: LifecycleHooks::of::<T>(),
            has_persistent_references,
        }))
    }
}

//! Type registry
//!
//! Maps `TypeId` to `TypeDescriptor`. Descriptors are swapped as a unit by
//! `replace`, which is only reachable through `&mut`, so a pass never sees a
//! half-updated descriptor.

use super::descriptor::TypeDescriptor;
use crate::{GcError, GcResult};
use rustc_hash::FxHashMap;
use std::any::TypeId;
use std::sync::Arc;

/// Registry of managed types
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    types: Arc<FxHashMap<TypeId, Arc<TypeDescriptor>>>,
}

impl TypeRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry builder
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder {
            types: FxHashMap::default(),
        }
    }

    /// Descriptor by TypeId
    pub fn get(&self, type_id: TypeId) -> Option<&Arc<TypeDescriptor>> {
        self.types.get(&type_id)
    }

    /// Descriptor of `T`
    pub fn get_of<T: 'static>(&self) -> GcResult<&Arc<TypeDescriptor>> {
        self.get(TypeId::of::<T>())
            .ok_or(GcError::TypeNotRegistered(std::any::type_name::<T>()))
    }

    /// Check if a type is registered
    pub fn contains(&self, type_id: TypeId) -> bool {
        self.types.contains_key(&type_id)
    }

    /// Add or replace a descriptor
    ///
    /// Existing objects keep the descriptor they were allocated with.
    pub fn replace(&mut self, descriptor: Arc<TypeDescriptor>) -> Option<Arc<TypeDescriptor>> {
        Arc::make_mut(&mut self.types).insert(descriptor.type_id(), descriptor)
    }

    /// Iterate over descriptors
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TypeDescriptor>> {
        self.types.values()
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Builder for TypeRegistry
pub struct TypeRegistryBuilder {
    types: FxHashMap<TypeId, Arc<TypeDescriptor>>,
}

impl TypeRegistryBuilder {
    /// Register a descriptor
    pub fn register(mut self, descriptor: Arc<TypeDescriptor>) -> Self {
        self.types.insert(descriptor.type_id(), descriptor);
        self
    }

    /// Build the registry
    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            types: Arc::new(self.types),
        }
    }
}

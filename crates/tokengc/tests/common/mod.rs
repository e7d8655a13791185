//! Shared managed types for integration tests

#![allow(dead_code)]

use std::mem::offset_of;
use std::ptr::NonNull;
use tokengc::{
    CollectorContext, FieldLayout, GcConfig, Managed, ManagedArray, ObjectRef, ReferenceVisitor,
    TypeDescriptor, TypeRegistry, WeakObjectRef,
};

/// Graph node with every plain reference kind
#[repr(C)]
#[derive(Default)]
pub struct Node {
    pub label: u32,
    pub next: ObjectRef,
    pub edges: ManagedArray<ObjectRef>,
    pub keep: ObjectRef,
    pub weak: WeakObjectRef,
}
impl Managed for Node {}

impl Node {
    pub fn labeled(label: u32) -> Self {
        Self {
            label,
            ..Self::default()
        }
    }
}

/// Element of a struct array
#[repr(C)]
#[derive(Default, Clone)]
pub struct Slot {
    pub tag: u64,
    pub target: ObjectRef,
    pub weak: WeakObjectRef,
}

/// Struct arrays and fixed arrays
#[repr(C)]
#[derive(Default)]
pub struct Bag {
    pub head: ObjectRef,
    pub slots: ManagedArray<Slot>,
    pub pair: [ObjectRef; 2],
    pub tail: ObjectRef,
}
impl Managed for Bag {}

/// Derived type extending `Node`
#[repr(C)]
#[derive(Default)]
pub struct Special {
    pub base: Node,
    pub extra: ObjectRef,
}
impl Managed for Special {}

/// References held in a container the token format cannot describe
#[derive(Default)]
pub struct Lookup {
    pub entries: Vec<(ObjectRef, u32)>,
    pub fallback: ObjectRef,
}
impl Managed for Lookup {}

unsafe fn trace_lookup(instance: NonNull<u8>, visitor: &mut ReferenceVisitor<'_>) {
    let lookup = instance.cast::<Lookup>().as_mut();
    for (key, _) in &lookup.entries {
        visitor.add_referenced_value(*key);
    }
    visitor.add_referenced_object(&mut lookup.fallback);
}

pub fn node_descriptor() -> std::sync::Arc<TypeDescriptor> {
    TypeDescriptor::builder::<Node>("Node")
        .object(offset_of!(Node, next), "next")
        .object_array(offset_of!(Node, edges), "edges")
        .persistent(offset_of!(Node, keep), "keep")
        .weak(offset_of!(Node, weak), "weak")
        .build()
        .unwrap()
}

pub fn registry() -> TypeRegistry {
    let node = node_descriptor();
    let special = TypeDescriptor::builder::<Special>("Special")
        .parent(&node)
        .object(offset_of!(Special, extra), "extra")
        .build()
        .unwrap();
    let bag = TypeDescriptor::builder::<Bag>("Bag")
        .object(offset_of!(Bag, head), "head")
        .struct_array::<Slot>(
            offset_of!(Bag, slots),
            "slots",
            FieldLayout::new()
                .object(offset_of!(Slot, target), "target")
                .weak(offset_of!(Slot, weak), "weak"),
        )
        .fixed_objects(offset_of!(Bag, pair), "pair", 2)
        .object(offset_of!(Bag, tail), "tail")
        .build()
        .unwrap();
    let lookup = TypeDescriptor::builder::<Lookup>("Lookup")
        .custom("entries", trace_lookup)
        .build()
        .unwrap();

    TypeRegistry::builder()
        .register(node)
        .register(special)
        .register(bag)
        .register(lookup)
        .build()
}

pub fn collector() -> CollectorContext {
    CollectorContext::new(GcConfig::single_threaded(), registry())
}

pub fn parallel_collector(workers: usize) -> CollectorContext {
    let config = GcConfig {
        allow_parallel: true,
        min_objects_per_worker: 8,
        local_queue_limit: 16,
        ..GcConfig::default().with_workers(workers)
    };
    CollectorContext::new(config, registry())
}

/// Route `log` output through the test harness
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

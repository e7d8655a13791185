//! Token stream tracing tests
//!
//! Traces hand-built instances through their descriptors and compares the
//! reported references against the fields that were filled in:
//! - Object arrays and struct arrays with zero and N elements
//! - Struct arrays nested in struct arrays, with empty inner arrays
//! - Fixed arrays, inline structs and inherited streams
//! - Descriptor validation errors
//!
//! # Running Tests
//! ```bash
//! cargo test -p tokengc --test token_stream_tests
//! ```

mod common;

use std::mem::{offset_of, size_of};
use std::ptr::NonNull;
use std::sync::Arc;
use tokengc::{
    trace_object, FieldLayout, GcError, Managed, ManagedArray, ObjectId, ObjectRef,
    ReferenceCollector, ReferenceKind, ReferenceOrigin, ReferenceSlot, TypeDescriptor,
    WeakObjectRef,
};

/// Records non-null references in the order they are reported
#[derive(Default)]
struct Recorder {
    strong: Vec<ObjectRef>,
    persistent: Vec<ObjectRef>,
    weak: Vec<ObjectRef>,
}

impl ReferenceCollector for Recorder {
    fn handle_object_reference(&mut self, slot: &ReferenceSlot<'_>, origin: ReferenceOrigin) {
        let target = slot.get();
        if target.is_null() {
            return;
        }
        match origin.kind {
            ReferenceKind::Persistent => self.persistent.push(target),
            _ => self.strong.push(target),
        }
    }

    fn handle_weak_reference(&mut self, slot: &ReferenceSlot<'_>, _origin: ReferenceOrigin) {
        if !slot.get().is_null() {
            self.weak.push(slot.get());
        }
    }
}

fn trace<T>(value: &mut T, descriptor: &TypeDescriptor) -> Recorder {
    let mut recorder = Recorder::default();
    // SAFETY: `value` is a live instance of the described type and is
    // exclusively borrowed for the call.
    unsafe {
        trace_object(
            NonNull::from(value).cast(),
            descriptor,
            ObjectId::from_index(0),
            &mut recorder,
        );
    }
    recorder
}

/// Distinct live handles to use as field values
fn handles(count: usize) -> Vec<ObjectRef> {
    let mut gc = common::collector();
    (0..count)
        .map(|i| gc.allocate(common::Node::labeled(i as u32)).unwrap())
        .collect()
}

// ===== Types =====

#[repr(C)]
#[derive(Default, Clone)]
struct Item {
    items: ManagedArray<ObjectRef>,
    owner: ObjectRef,
}

#[repr(C)]
#[derive(Default)]
struct Shelf {
    before: ObjectRef,
    boxes: ManagedArray<Item>,
    after: ObjectRef,
    keep: ObjectRef,
}
impl Managed for Shelf {}

fn item_layout() -> FieldLayout {
    FieldLayout::new()
        .object_array(offset_of!(Item, items), "items")
        .object(offset_of!(Item, owner), "owner")
}

fn shelf_descriptor() -> Arc<TypeDescriptor> {
    TypeDescriptor::builder::<Shelf>("Shelf")
        .object(offset_of!(Shelf, before), "before")
        .struct_array::<Item>(offset_of!(Shelf, boxes), "boxes", item_layout())
        .object(offset_of!(Shelf, after), "after")
        .persistent(offset_of!(Shelf, keep), "keep")
        .build()
        .unwrap()
}

#[repr(C)]
#[derive(Default, Clone)]
struct Row {
    cells: ManagedArray<Item>,
    tag: ObjectRef,
}

#[repr(C)]
#[derive(Default)]
struct Grid {
    rows: ManagedArray<Row>,
    footer: ObjectRef,
}
impl Managed for Grid {}

fn grid_descriptor() -> Arc<TypeDescriptor> {
    let row = FieldLayout::new()
        .struct_array(offset_of!(Row, cells), "cells", size_of::<Item>(), item_layout())
        .object(offset_of!(Row, tag), "tag");
    TypeDescriptor::builder::<Grid>("Grid")
        .struct_array::<Row>(offset_of!(Grid, rows), "rows", row)
        .object(offset_of!(Grid, footer), "footer")
        .build()
        .unwrap()
}

#[repr(C)]
#[derive(Default)]
struct Pair {
    strong: ObjectRef,
    weak: WeakObjectRef,
}

#[repr(C)]
#[derive(Default)]
struct Fixture {
    pairs: [Pair; 3],
    header: Pair,
    last: ObjectRef,
}
impl Managed for Fixture {}

fn pair_layout() -> FieldLayout {
    FieldLayout::new()
        .object(offset_of!(Pair, strong), "strong")
        .weak(offset_of!(Pair, weak), "weak")
}

fn fixture_descriptor() -> Arc<TypeDescriptor> {
    TypeDescriptor::builder::<Fixture>("Fixture")
        .fixed_array::<Pair>(offset_of!(Fixture, pairs), "pairs", 3, pair_layout())
        .inline_struct(offset_of!(Fixture, header), "header", pair_layout())
        .object(offset_of!(Fixture, last), "last")
        .build()
        .unwrap()
}

// ===== Struct Arrays =====

#[test]
fn test_empty_struct_array_skips_to_following_fields() {
    let h = handles(3);
    let descriptor = shelf_descriptor();
    let mut shelf = Shelf {
        before: h[0],
        after: h[1],
        keep: h[2],
        ..Shelf::default()
    };

    let recorded = trace(&mut shelf, &descriptor);
    assert_eq!(recorded.strong, vec![h[0], h[1]]);
    assert_eq!(recorded.persistent, vec![h[2]]);
}

#[test]
fn test_struct_array_with_elements() {
    let h = handles(8);
    let descriptor = shelf_descriptor();
    let mut shelf = Shelf {
        before: h[0],
        after: h[6],
        keep: h[7],
        ..Shelf::default()
    };
    shelf.boxes.push(Item {
        items: vec![h[1], h[2]].into(),
        owner: h[3],
    });
    // Empty inner array followed by a field of the same element
    shelf.boxes.push(Item {
        items: ManagedArray::new(),
        owner: h[4],
    });
    shelf.boxes.push(Item {
        items: vec![h[5]].into(),
        owner: ObjectRef::NULL,
    });

    let recorded = trace(&mut shelf, &descriptor);
    assert_eq!(recorded.strong, vec![h[0], h[1], h[2], h[3], h[4], h[5], h[6]]);
    assert_eq!(recorded.persistent, vec![h[7]]);
}

#[test]
fn test_element_count_does_not_change_following_fields() {
    let h = handles(4);
    let descriptor = shelf_descriptor();
    for count in [0usize, 1, 2, 17] {
        let mut shelf = Shelf {
            before: h[0],
            after: h[1],
            ..Shelf::default()
        };
        for _ in 0..count {
            shelf.boxes.push(Item {
                items: vec![h[2]].into(),
                owner: h[3],
            });
        }
        let recorded = trace(&mut shelf, &descriptor);
        assert_eq!(recorded.strong.len(), 2 + 2 * count, "count {}", count);
        assert_eq!(recorded.strong.first(), Some(&h[0]));
        assert_eq!(recorded.strong.last(), Some(&h[1]));
    }
}

// ===== Nested Arrays =====

#[test]
fn test_nested_struct_arrays_with_empty_levels() {
    let h = handles(6);
    let descriptor = grid_descriptor();
    let mut grid = Grid {
        footer: h[5],
        ..Grid::default()
    };
    // Row without cells
    grid.rows.push(Row {
        cells: ManagedArray::new(),
        tag: h[0],
    });
    // Row whose cells are all empty
    grid.rows.push(Row {
        cells: vec![Item::default(), Item::default()].into(),
        tag: h[1],
    });
    // Row with content
    grid.rows.push(Row {
        cells: vec![Item {
            items: vec![h[2], h[3]].into(),
            owner: h[4],
        }]
        .into(),
        tag: ObjectRef::NULL,
    });

    let recorded = trace(&mut grid, &descriptor);
    assert_eq!(recorded.strong, vec![h[0], h[1], h[2], h[3], h[4], h[5]]);
}

#[test]
fn test_nested_struct_arrays_all_empty() {
    let h = handles(1);
    let descriptor = grid_descriptor();
    let mut grid = Grid {
        footer: h[0],
        ..Grid::default()
    };
    let recorded = trace(&mut grid, &descriptor);
    assert_eq!(recorded.strong, vec![h[0]]);
}

// ===== Fixed Arrays And Inline Structs =====

#[test]
fn test_fixed_array_and_inline_struct() {
    let h = handles(7);
    let descriptor = fixture_descriptor();
    let mut fixture = Fixture::default();
    fixture.pairs[0].strong = h[0];
    fixture.pairs[1].weak = h[1].into();
    fixture.pairs[2].strong = h[2];
    fixture.pairs[2].weak = h[3].into();
    fixture.header.strong = h[4];
    fixture.header.weak = h[5].into();
    fixture.last = h[6];

    let recorded = trace(&mut fixture, &descriptor);
    assert_eq!(recorded.strong, vec![h[0], h[2], h[4], h[6]]);
    assert_eq!(recorded.weak, vec![h[1], h[3], h[5]]);
}

// ===== Inheritance =====

#[test]
fn test_derived_stream_reports_parent_fields_first() {
    let h = handles(4);
    let registry = common::registry();
    let descriptor = registry.get_of::<common::Special>().unwrap();
    let mut special = common::Special::default();
    special.base.next = h[0];
    special.base.edges.push(h[1]);
    special.base.weak.set(h[2]);
    special.extra = h[3];

    let recorded = trace(&mut special, descriptor);
    assert_eq!(recorded.strong, vec![h[0], h[1], h[3]]);
    assert_eq!(recorded.weak, vec![h[2]]);
    assert!(descriptor.is_a(std::any::TypeId::of::<common::Node>()));
}

// ===== Validation =====

#[repr(C)]
#[derive(Default)]
struct Tiny {
    only: ObjectRef,
}
impl Managed for Tiny {}

#[test]
fn test_field_outside_instance_is_rejected() {
    let result = TypeDescriptor::builder::<Tiny>("Tiny")
        .object(size_of::<Tiny>(), "beyond")
        .build();
    match result {
        Err(GcError::OffsetOutOfBounds { type_name, field, .. }) => {
            assert_eq!(type_name, "Tiny");
            assert_eq!(field, "beyond");
        }
        other => panic!("unexpected result: {:?}", other.map(|d| d.name())),
    }
}

#[repr(C)]
#[derive(Default)]
struct Tagged {
    tag: u32,
    flags: u32,
    target: ObjectRef,
}
impl Managed for Tagged {}

#[test]
fn test_field_offset_must_be_aligned_for_its_kind() {
    let result = TypeDescriptor::builder::<Tagged>("Tagged")
        .object(offset_of!(Tagged, flags), "flags")
        .build();
    assert!(matches!(
        result,
        Err(GcError::MisalignedField { ref field, offset: 4, .. }) if field == "flags"
    ));

    let descriptor = TypeDescriptor::builder::<Tagged>("Tagged")
        .object(offset_of!(Tagged, target), "target")
        .build()
        .unwrap();
    assert_eq!(descriptor.token_stream().field_name(0), "target");
}

#[test]
fn test_leaf_type_has_terminator_only() {
    let descriptor = TypeDescriptor::leaf::<Tiny>("Tiny").unwrap();
    assert_eq!(descriptor.token_stream().len(), 1);
    let mut tiny = Tiny { only: handles(1)[0] };
    assert!(trace(&mut tiny, &descriptor).strong.is_empty());
}

//! Reference-graph diagnostics tests
//!
//! Tests for the query methods of `CollectorContext`:
//! - Cycle detection over mixed field kinds and filters
//! - Referencer lookups
//! - Reference descriptions through nested fields
//!
//! # Running Tests
//! ```bash
//! cargo test -p tokengc --test diagnostics_tests
//!
//! # Including long-running tests
//! cargo test -p tokengc --test diagnostics_tests -- --include-ignored
//! ```

mod common;

use common::{collector, Bag, Lookup, Node, Slot};
use std::collections::HashSet;
use tokengc::{
    CollectOptions, CollectorContext, ObjectFilter, ObjectFlags, ObjectRef, ReferenceKind,
    ReferenceQuery,
};

fn chain(gc: &mut CollectorContext, count: u32) -> Vec<ObjectRef> {
    let nodes: Vec<ObjectRef> = (0..count).map(|i| gc.allocate(Node::labeled(i)).unwrap()).collect();
    for pair in nodes.windows(2) {
        gc.get_mut::<Node>(pair[0]).unwrap().next = pair[1];
    }
    nodes
}

fn as_set(refs: &[ObjectRef]) -> HashSet<ObjectRef> {
    refs.iter().copied().collect()
}

// ===== Cycles =====

#[test]
fn test_three_cycle_is_one_component() {
    let mut gc = collector();
    let nodes = chain(&mut gc, 3);
    gc.get_mut::<Node>(nodes[2]).unwrap().next = nodes[0];
    let tail = gc.allocate(Node::labeled(9)).unwrap();
    gc.get_mut::<Node>(nodes[1]).unwrap().edges.push(tail);

    let report = gc.find_cycles(&ObjectFilter::All);
    assert!(report.has_cycles());
    assert_eq!(report.components.len(), 1);
    assert_eq!(as_set(&report.components[0]), as_set(&nodes));
    assert_eq!(report.simple_cycles[0].len(), 3);
    assert_eq!(report.object_count, 4);
    assert_eq!(report.edge_count, 4);
}

#[test]
fn test_simple_cycle_closes_at_first_revisit() {
    let mut gc = collector();
    let nodes = chain(&mut gc, 4);
    gc.get_mut::<Node>(nodes[3]).unwrap().next = nodes[1];
    gc.get_mut::<Node>(nodes[2]).unwrap().edges.push(nodes[0]);

    let report = gc.find_cycles(&ObjectFilter::All);
    assert_eq!(report.components.len(), 1);
    assert_eq!(report.components[0].len(), 4);
    // `next` is traced before `edges`, so the walk from nodes[0] loops back
    // to nodes[1] before it tries nodes[2] -> nodes[0]
    assert_eq!(report.simple_cycles[0], vec![nodes[1], nodes[2], nodes[3]]);
}

#[test]
fn test_acyclic_graph_has_no_cycles() {
    let mut gc = collector();
    let nodes = chain(&mut gc, 10);
    gc.get_mut::<Node>(nodes[0]).unwrap().edges.push(nodes[9]);

    let report = gc.find_cycles(&ObjectFilter::All);
    assert!(!report.has_cycles());
    assert!(report.simple_cycles.is_empty());
}

#[test]
fn test_self_reference_is_a_single_object_cycle() {
    let mut gc = collector();
    let node = gc.allocate(Node::labeled(0)).unwrap();
    let plain = gc.allocate(Node::labeled(1)).unwrap();
    gc.get_mut::<Node>(node).unwrap().next = node;

    let report = gc.find_cycles(&ObjectFilter::All);
    assert_eq!(report.components, vec![vec![node]]);
    assert_eq!(report.simple_cycles, vec![vec![node]]);
    assert!(!report.components.iter().flatten().any(|r| *r == plain));
}

#[test]
fn test_cycles_through_struct_arrays_and_callbacks() {
    let mut gc = collector();
    let bag = gc.allocate(Bag::default()).unwrap();
    let lookup = gc.allocate(Lookup::default()).unwrap();
    let node = gc.allocate(Node::labeled(0)).unwrap();

    gc.get_mut::<Bag>(bag).unwrap().slots.push(Slot {
        target: lookup,
        ..Slot::default()
    });
    gc.get_mut::<Lookup>(lookup).unwrap().entries.push((node, 1));
    gc.get_mut::<Node>(node).unwrap().keep = bag;

    let report = gc.find_cycles(&ObjectFilter::All);
    assert_eq!(report.components.len(), 1);
    assert_eq!(as_set(&report.components[0]), as_set(&[bag, lookup, node]));
}

#[test]
fn test_weak_references_do_not_close_cycles() {
    let mut gc = collector();
    let nodes = chain(&mut gc, 2);
    gc.get_mut::<Node>(nodes[1]).unwrap().weak.set(nodes[0]);

    assert!(!gc.find_cycles(&ObjectFilter::All).has_cycles());
}

#[test]
fn test_components_are_ordered_by_size() {
    let mut gc = collector();
    let small = chain(&mut gc, 2);
    gc.get_mut::<Node>(small[1]).unwrap().next = small[0];
    let large = chain(&mut gc, 5);
    gc.get_mut::<Node>(large[4]).unwrap().next = large[0];

    let report = gc.find_cycles(&ObjectFilter::All);
    assert_eq!(report.components.len(), 2);
    assert_eq!(report.components[0].len(), 5);
    assert_eq!(report.components[1].len(), 2);
}

#[test]
fn test_filter_limits_examined_objects() {
    let mut gc = collector();
    let nodes = chain(&mut gc, 3);
    gc.get_mut::<Node>(nodes[2]).unwrap().next = nodes[0];
    gc.add_to_root(nodes[0]).unwrap();

    // The root breaks the cycle for the default filter
    assert!(!gc.find_cycles(&ObjectFilter::NonRooted).has_cycles());
    assert!(gc.find_cycles(&ObjectFilter::All).has_cycles());
    assert!(!gc
        .find_cycles(&ObjectFilter::Objects(vec![nodes[0], nodes[1]]))
        .has_cycles());
}

#[test]
fn test_repeated_filter_entries_count_once() {
    let mut gc = collector();
    let nodes = chain(&mut gc, 2);
    let (p, q) = (nodes[0], nodes[1]);
    gc.get_mut::<Node>(q).unwrap().next = p;
    let filter = ObjectFilter::Objects(vec![q, p, q]);

    let report = gc.find_cycles(&filter);
    assert_eq!(report.object_count, 2);
    assert_eq!(report.edge_count, 2);
    assert_eq!(report.components.len(), 1);
    assert_eq!(report.components[0].len(), 2);

    assert_eq!(gc.referencers_of(&[p], &filter).unwrap(), vec![q]);
    assert_eq!(gc.referencers_of(&[p, q], &filter).unwrap(), vec![q, p]);
}

#[test]
fn test_unreachable_cycle_is_collected() {
    let mut gc = collector();
    let nodes = chain(&mut gc, 4);
    gc.get_mut::<Node>(nodes[3]).unwrap().next = nodes[0];
    assert!(gc.find_cycles(&ObjectFilter::All).has_cycles());

    gc.collect_garbage(CollectOptions::full());
    assert_eq!(gc.object_count(), 0);
    let report = gc.find_cycles(&ObjectFilter::All);
    assert!(!report.has_cycles());
    assert_eq!(report.object_count, 0);
}

#[test]
#[ignore]
fn test_large_ring() {
    let mut gc = collector();
    let nodes = chain(&mut gc, 100_000);
    gc.get_mut::<Node>(nodes[nodes.len() - 1]).unwrap().next = nodes[0];
    let report = gc.find_cycles(&ObjectFilter::All);
    assert_eq!(report.components.len(), 1);
    assert_eq!(report.simple_cycles[0].len(), 100_000);
}

// ===== Referencers =====

#[test]
fn test_referencers_of_across_kinds() {
    let mut gc = collector();
    let target = gc.allocate(Node::labeled(0)).unwrap();
    let by_field = gc.allocate(Node::labeled(1)).unwrap();
    let by_array = gc.allocate(Node::labeled(2)).unwrap();
    let by_persistent = gc.allocate(Node::labeled(3)).unwrap();
    let by_weak = gc.allocate(Node::labeled(4)).unwrap();
    let by_callback = gc.allocate(Lookup::default()).unwrap();

    gc.get_mut::<Node>(by_field).unwrap().next = target;
    gc.get_mut::<Node>(by_array).unwrap().edges.push(target);
    gc.get_mut::<Node>(by_persistent).unwrap().keep = target;
    gc.get_mut::<Node>(by_weak).unwrap().weak.set(target);
    gc.get_mut::<Lookup>(by_callback).unwrap().fallback = target;

    let referencers = gc.referencers_of(&[target], &ObjectFilter::All).unwrap();
    assert_eq!(
        referencers,
        vec![by_field, by_array, by_persistent, by_callback]
    );
    assert_eq!(gc.find_single_referencer(target).unwrap(), None);
}

#[test]
fn test_single_referencer_and_root_filter() {
    let mut gc = collector();
    let owner = gc
        .allocate_with_flags(Node::labeled(0), ObjectFlags::ROOT_SET)
        .unwrap();
    let child = gc.allocate(Node::labeled(1)).unwrap();
    gc.get_mut::<Node>(owner).unwrap().next = child;

    assert_eq!(gc.find_single_referencer(child).unwrap(), Some(owner));
    assert!(gc
        .referencers_of(&[child], &ObjectFilter::NonRooted)
        .unwrap()
        .is_empty());
}

#[test]
fn test_transitive_references_stop_at_cycles() {
    let mut gc = collector();
    let nodes = chain(&mut gc, 4);
    gc.get_mut::<Node>(nodes[3]).unwrap().next = nodes[1];

    let query = ReferenceQuery {
        recursive: true,
        ..ReferenceQuery::default()
    };
    let reached = gc.referenced_objects(nodes[0], &query).unwrap();
    assert_eq!(reached, vec![nodes[1], nodes[2], nodes[3]]);
}

// ===== Descriptions =====

#[test]
fn test_describe_reference_names_nested_fields() {
    let mut gc = collector();
    let target = gc.allocate(Node::labeled(0)).unwrap();
    let bag = gc.allocate(Bag::default()).unwrap();
    {
        let bag = gc.get_mut::<Bag>(bag).unwrap();
        bag.head = target;
        bag.slots.push(Slot {
            target,
            weak: target.into(),
            ..Slot::default()
        });
        bag.pair[1] = target;
    }

    let descriptions = gc.describe_reference(bag, target).unwrap();
    let fields: Vec<&str> = descriptions.iter().map(|d| d.field.as_str()).collect();
    assert_eq!(fields, vec!["head", "slots[].target", "slots[].weak", "pair[]"]);
    assert_eq!(descriptions[2].kind, ReferenceKind::Weak);
}

#[test]
fn test_describe_callback_reference() {
    let mut gc = collector();
    let target = gc.allocate(Node::labeled(0)).unwrap();
    let lookup = gc.allocate(Lookup::default()).unwrap();
    gc.get_mut::<Lookup>(lookup).unwrap().entries.push((target, 3));

    let descriptions = gc.describe_reference(lookup, target).unwrap();
    assert_eq!(descriptions.len(), 1);
    assert_eq!(descriptions[0].kind, ReferenceKind::Native);
}

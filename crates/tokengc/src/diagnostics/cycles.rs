//! Reference cycle detection
//!
//! Builds the strong reference graph over a subset of objects and splits it
//! into strongly connected components with an iterative Tarjan walk, so deep
//! graphs cannot overflow the stack. Every component that contains a cycle
//! is reported together with one simple cycle, found by a depth-first walk
//! from its first member that stops at the first edge leading back onto the
//! current path.
//!
//! Edges are strong, persistent and callback-reported references between
//! objects of the subset; weak references are not edges. A single object is
//! a cycle only if it references itself.

use super::finder::ReferenceFinder;
use super::ObjectFilter;
use crate::gc::{CollectorContext, Tracer};
use crate::object::{ObjectId, ObjectRef};
use rustc_hash::FxHashMap;

/// Result of `find_cycles`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Strongly connected components containing a cycle, largest first
    pub components: Vec<Vec<ObjectRef>>,
    /// One simple cycle per component, in the same order
    pub simple_cycles: Vec<Vec<ObjectRef>>,
    /// Objects examined
    pub object_count: usize,
    /// Edges between examined objects
    pub edge_count: usize,
}

impl CycleReport {
    /// Check if any cycle was found
    pub fn has_cycles(&self) -> bool {
        !self.components.is_empty()
    }
}

/// Adjacency lists over dense node indices
struct Graph {
    nodes: Vec<ObjectId>,
    edges: Vec<Vec<usize>>,
}

impl Graph {
    fn has_self_edge(&self, node: usize) -> bool {
        self.edges[node].contains(&node)
    }

    fn edge_count(&self) -> usize {
        self.edges.iter().map(Vec::len).sum()
    }
}

const UNVISITED: usize = usize::MAX;

/// Iterative Tarjan; components come out in reverse topological order
fn strongly_connected_components(graph: &Graph) -> Vec<Vec<usize>> {
    let count = graph.nodes.len();
    let mut index = vec![UNVISITED; count];
    let mut lowlink = vec![0; count];
    let mut on_stack = vec![false; count];
    let mut stack = Vec::new();
    let mut components = Vec::new();
    let mut next_index = 0;
    // (node, next edge to visit)
    let mut call_stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..count {
        if index[root] != UNVISITED {
            continue;
        }
        call_stack.push((root, 0));
        index[root] = next_index;
        lowlink[root] = next_index;
        next_index += 1;
        stack.push(root);
        on_stack[root] = true;

        while let Some(frame) = call_stack.last_mut() {
            let node = frame.0;
            if let Some(&successor) = graph.edges[node].get(frame.1) {
                frame.1 += 1;
                if index[successor] == UNVISITED {
                    index[successor] = next_index;
                    lowlink[successor] = next_index;
                    next_index += 1;
                    stack.push(successor);
                    on_stack[successor] = true;
                    call_stack.push((successor, 0));
                } else if on_stack[successor] {
                    lowlink[node] = lowlink[node].min(index[successor]);
                }
                continue;
            }

            call_stack.pop();
            if let Some(&(parent, _)) = call_stack.last() {
                lowlink[parent] = lowlink[parent].min(lowlink[node]);
            }
            if lowlink[node] == index[node] {
                let mut component = Vec::new();
                while let Some(member) = stack.pop() {
                    on_stack[member] = false;
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                components.push(component);
            }
        }
    }
    components
}

/// First cycle a depth-first walk from `start` closes inside `members`
///
/// The cycle starts at the revisited node, which need not be `start`.
fn first_cycle(graph: &Graph, start: usize, members: &[usize]) -> Vec<usize> {
    let count = graph.nodes.len();
    let mut in_component = vec![false; count];
    for &member in members {
        in_component[member] = true;
    }
    let mut visited = vec![false; count];
    // Depth on the current path, UNVISITED when off it
    let mut depth = vec![UNVISITED; count];
    // (node, next edge to visit)
    let mut path: Vec<(usize, usize)> = vec![(start, 0)];
    visited[start] = true;
    depth[start] = 0;

    while let Some(frame) = path.last_mut() {
        let node = frame.0;
        let Some(&successor) = graph.edges[node].get(frame.1) else {
            depth[node] = UNVISITED;
            path.pop();
            continue;
        };
        frame.1 += 1;
        if !in_component[successor] {
            continue;
        }
        if depth[successor] != UNVISITED {
            return path[depth[successor]..].iter().map(|&(node, _)| node).collect();
        }
        if !visited[successor] {
            visited[successor] = true;
            depth[successor] = path.len();
            path.push((successor, 0));
        }
    }
    // Unreachable for a strongly connected component of size > 1
    Vec::new()
}

impl CollectorContext {
    /// Find reference cycles among the objects selected by `filter`
    pub fn find_cycles(&self, filter: &ObjectFilter) -> CycleReport {
        let graph = self.reference_graph(filter);
        let mut components: Vec<Vec<usize>> = strongly_connected_components(&graph)
            .into_iter()
            .filter(|component| component.len() > 1 || graph.has_self_edge(component[0]))
            .map(|mut component| {
                component.sort_unstable();
                component
            })
            .collect();
        components.sort_by(|a, b| b.len().cmp(&a.len()).then(a[0].cmp(&b[0])));

        let to_refs = |nodes: &[usize]| -> Vec<ObjectRef> {
            nodes
                .iter()
                .map(|&node| self.objects().reference_to(graph.nodes[node]))
                .collect()
        };
        let simple_cycles = components
            .iter()
            .map(|component| to_refs(&first_cycle(&graph, component[0], component)))
            .collect();

        let report = CycleReport {
            components: components.iter().map(|component| to_refs(component)).collect(),
            simple_cycles,
            object_count: graph.nodes.len(),
            edge_count: graph.edge_count(),
        };
        log::debug!(
            "find_cycles: {} components over {} objects, {} edges",
            report.components.len(),
            report.object_count,
            report.edge_count
        );
        report
    }

    fn reference_graph(&self, filter: &ObjectFilter) -> Graph {
        let nodes = filter.select(self.objects());
        let positions: FxHashMap<ObjectId, usize> = nodes
            .iter()
            .enumerate()
            .map(|(position, &id)| (id, position))
            .collect();

        let mut finder = ReferenceFinder::new(self.objects(), false);
        let mut tracer = Tracer::new();
        let edges = nodes
            .iter()
            .map(|&id| {
                finder.reset();
                self.trace_with(&mut tracer, id, &mut finder);
                finder
                    .found
                    .iter()
                    .filter_map(|target| positions.get(target).copied())
                    .collect()
            })
            .collect();
        Graph { nodes, edges }
    }
}

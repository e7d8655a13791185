use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use std::mem::offset_of;
use tokengc::{
    CollectOptions, CollectorContext, GcConfig, Managed, ManagedArray, ObjectFilter, ObjectFlags,
    ObjectRef, TypeDescriptor, TypeRegistry,
};

#[repr(C)]
#[derive(Default)]
struct Node {
    next: ObjectRef,
    edges: ManagedArray<ObjectRef>,
}
impl Managed for Node {}

fn context(config: GcConfig) -> CollectorContext {
    let node = TypeDescriptor::builder::<Node>("Node")
        .object(offset_of!(Node, next), "next")
        .object_array(offset_of!(Node, edges), "edges")
        .build()
        .unwrap();
    CollectorContext::new(config, TypeRegistry::builder().register(node).build())
}

/// A rooted tree with fan-out 4 plus back edges every 16 nodes
fn populate(gc: &mut CollectorContext, count: usize, rooted: bool) -> Vec<ObjectRef> {
    let flags = if rooted { ObjectFlags::ROOT_SET } else { ObjectFlags::empty() };
    let mut nodes = vec![gc.allocate_with_flags(Node::default(), flags).unwrap()];
    for i in 1..count {
        let node = gc.allocate(Node::default()).unwrap();
        let parent = nodes[(i - 1) / 4];
        gc.get_mut::<Node>(parent).unwrap().edges.push(node);
        if i % 16 == 0 {
            gc.get_mut::<Node>(node).unwrap().next = nodes[i / 2];
        }
        nodes.push(node);
    }
    nodes
}

fn bench_mark(c: &mut Criterion) {
    let mut group = c.benchmark_group("mark");
    for count in [10_000usize, 100_000] {
        group.throughput(Throughput::Elements(count as u64));

        let mut serial = context(GcConfig::single_threaded());
        populate(&mut serial, count, true);
        group.bench_with_input(BenchmarkId::new("serial", count), &count, |b, _| {
            b.iter(|| black_box(serial.collect_garbage(CollectOptions::full())));
        });

        for workers in [2usize, 4] {
            let mut parallel = context(GcConfig::default().with_workers(workers));
            populate(&mut parallel, count, true);
            group.bench_with_input(
                BenchmarkId::new(format!("parallel_{}", workers), count),
                &count,
                |b, _| {
                    b.iter(|| black_box(parallel.collect_garbage(CollectOptions::full())));
                },
            );
        }
    }
    group.finish();
}

fn bench_purge(c: &mut Criterion) {
    let mut group = c.benchmark_group("purge");
    let count = 20_000usize;
    group.throughput(Throughput::Elements(count as u64));
    group.bench_function("full", |b| {
        b.iter_batched(
            || {
                let mut gc = context(GcConfig::single_threaded());
                populate(&mut gc, count, false);
                gc
            },
            |mut gc| black_box(gc.collect_garbage(CollectOptions::full())),
            BatchSize::LargeInput,
        );
    });
    group.finish();
}

fn bench_find_cycles(c: &mut Criterion) {
    let mut gc = context(GcConfig::single_threaded());
    populate(&mut gc, 20_000, true);
    c.bench_function("find_cycles_20k", |b| {
        b.iter(|| black_box(gc.find_cycles(&ObjectFilter::All)));
    });
}

criterion_group!(benches, bench_mark, bench_purge, bench_find_cycles);
criterion_main!(benches);

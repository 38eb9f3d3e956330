//! Heap benchmarks against the system allocator.

use std::alloc::{GlobalAlloc, Layout, System};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use buddymalloc_heap::Heap;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

fn bench_alloc_free_cycle(c: &mut Criterion) {
    let sizes: &[usize] = &[16, 64, 256, 1024, 4096, 32768];
    let heap = Heap::default();
    let arena = heap.register_thread().expect("register");
    let mut group = c.benchmark_group("alloc_free_cycle");

    for &size in sizes {
        group.bench_with_input(BenchmarkId::new("buddy", size), &size, |b, &sz| {
            b.iter(|| {
                let p = heap.allocate(arena, sz).expect("allocate");
                criterion::black_box(heap.release(arena, p.as_ptr()));
            });
        });
        group.bench_with_input(BenchmarkId::new("system", size), &size, |b, &sz| {
            let layout = Layout::from_size_align(sz, 8).expect("layout");
            b.iter(|| {
                // SAFETY: non-zero layout, freed with the same layout.
                unsafe {
                    let p = System.alloc(layout);
                    criterion::black_box(p);
                    System.dealloc(p, layout);
                }
            });
        });
    }
    group.finish();
}

fn bench_alloc_burst(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_burst");

    group.bench_function("buddy_1000x64B", |b| {
        let heap = Heap::default();
        let arena = heap.register_thread().expect("register");
        let mut live = Vec::with_capacity(1000);
        b.iter(|| {
            live.extend((0..1000).map(|_| heap.allocate(arena, 64).expect("allocate")));
            for p in live.drain(..) {
                heap.release(arena, p.as_ptr());
            }
        });
    });

    group.bench_function("system_1000x64B", |b| {
        b.iter(|| {
            let allocs: Vec<Vec<u8>> = (0..1000).map(|_| vec![0u8; 64]).collect();
            criterion::black_box(allocs);
        });
    });

    group.finish();
}

/// Blocks allocated on a producer thread and released by the bench thread.
fn bench_cross_thread_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("cross_thread_release");
    for &arenas in &[1usize, 8, 64] {
        group.bench_with_input(BenchmarkId::new("buddy", arenas), &arenas, |b, &n| {
            let heap = &Heap::default();
            // Older arenas the foreign scan has to walk past.
            for _ in 1..n {
                heap.register_thread().expect("register");
            }
            let consumer = heap.register_thread().expect("register");
            let (req_tx, req_rx) = mpsc::channel::<u64>();
            let (blk_tx, blk_rx) = mpsc::channel::<Vec<usize>>();
            thread::scope(|s| {
                s.spawn(move || {
                    let producer = heap.register_thread().expect("register");
                    for count in req_rx {
                        let blocks = (0..count)
                            .map(|_| heap.allocate(producer, 48).expect("allocate").as_ptr() as usize)
                            .collect();
                        if blk_tx.send(blocks).is_err() {
                            break;
                        }
                    }
                });
                b.iter_custom(|iters| {
                    req_tx.send(iters).expect("producer alive");
                    let blocks = blk_rx.recv().expect("producer alive");
                    let start = Instant::now();
                    for addr in blocks {
                        criterion::black_box(heap.release(consumer, addr as *mut u8));
                    }
                    start.elapsed()
                });
                drop(req_tx);
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_alloc_free_cycle,
    bench_alloc_burst,
    bench_cross_thread_release
);
criterion_main!(benches);

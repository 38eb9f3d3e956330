//! Seeded multithreaded stress workload.
//!
//! Every worker registers its own arena and runs a deterministic mix of
//! allocations, own releases and hand-offs through a shared mailbox; blocks
//! taken from the mailbox are released by whichever worker picks them up, so
//! the cross-arena release path sees steady traffic. After the workers join,
//! the surviving blocks are checked for overlap against their granted sizes
//! and against the heap's own byte counters, then released.
//!
//! The check works on addresses and granted sizes only; block contents are
//! never touched.

use std::sync::Mutex;
use std::thread;

use buddymalloc_heap::{FreeResult, Heap};
use serde::Serialize;

use crate::error::HarnessError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StressConfig {
    pub threads: usize,
    /// Operations per worker.
    pub ops: usize,
    /// Largest request in bytes.
    pub max_size: usize,
    pub seed: u64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            ops: 10_000,
            max_size: 4096,
            seed: 0xB0DD_7EE5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadSummary {
    pub worker: usize,
    pub arena: usize,
    pub allocations: u64,
    pub aligned_allocations: u64,
    pub zeroed_allocations: u64,
    pub releases: u64,
    pub foreign_releases: u64,
    pub handoffs: u64,
    pub peak_live: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StressOutcome {
    pub workers: Vec<ThreadSummary>,
    /// Blocks still live when the workers finished.
    pub survivors: usize,
    pub survivor_bytes: usize,
    /// Invariant violations; empty on a clean run.
    pub violations: Vec<String>,
}

impl StressOutcome {
    /// `Err` carrying the first violation, if any.
    pub fn check(&self) -> Result<(), HarnessError> {
        match self.violations.first() {
            None => Ok(()),
            Some(first) => Err(HarnessError::Invariants {
                count: self.violations.len(),
                first: first.clone(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Deterministic RNG
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        // Zero is a fixed point of xorshift.
        Self {
            state: seed | 1,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn below(&mut self, bound: usize) -> usize {
        (self.next_u64() % bound as u64) as usize
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// (address, requested bytes)
type Block = (usize, usize);

struct Worker<'h> {
    heap: &'h Heap,
    config: StressConfig,
    mailbox: &'h Mutex<Vec<Block>>,
}

struct WorkerResult {
    summary: ThreadSummary,
    live: Vec<Block>,
    violations: Vec<String>,
}

impl Worker<'_> {
    fn run(&self, worker: usize) -> Result<WorkerResult, HarnessError> {
        let heap = self.heap;
        let arena = heap.register_thread()?;
        let mut rng = XorShift64::new(self.config.seed ^ (worker as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut live: Vec<Block> = Vec::new();
        let mut violations = Vec::new();
        let mut summary = ThreadSummary {
            worker,
            arena: arena.index(),
            ..ThreadSummary::default()
        };

        for op in 0..self.config.ops {
            let roll = rng.below(100);
            if roll < 45 || live.is_empty() {
                let size = 1 + rng.below(self.config.max_size.max(1));
                let (block, alignment) = match rng.below(8) {
                    0 => {
                        let alignment = 1usize << (3 + rng.below(10));
                        summary.aligned_allocations += 1;
                        (heap.allocate_aligned(arena, alignment, size)?, alignment)
                    }
                    1 => {
                        summary.zeroed_allocations += 1;
                        (heap.zero_allocate(arena, 1, size)?, heap.config().min_alignment())
                    }
                    _ => (heap.allocate(arena, size)?, heap.config().min_alignment()),
                };
                summary.allocations += 1;
                let addr = block.as_ptr() as usize;
                if addr % alignment != 0 {
                    violations.push(format!("worker {worker} op {op}: {addr:#x} not aligned to {alignment}"));
                }
                match heap.usable_size(arena, block.as_ptr()) {
                    Some(granted) if granted >= size && granted.is_power_of_two() => {}
                    other => violations.push(format!(
                        "worker {worker} op {op}: {addr:#x} granted {other:?} for {size} bytes"
                    )),
                }
                live.push((addr, size));
                summary.peak_live = summary.peak_live.max(live.len());
            } else if roll < 75 {
                let (addr, _) = live.swap_remove(rng.below(live.len()));
                match heap.release(arena, addr as *mut u8) {
                    FreeResult::Freed { .. } => summary.releases += 1,
                    FreeResult::FreedForeign { .. } => summary.foreign_releases += 1,
                    other => violations.push(format!("worker {worker} op {op}: own block {addr:#x} {other:?}")),
                }
            } else if roll < 90 {
                let block = live.swap_remove(rng.below(live.len()));
                lock(self.mailbox).push(block);
                summary.handoffs += 1;
            } else {
                let taken = lock(self.mailbox).pop();
                if let Some((addr, _)) = taken {
                    match heap.release(arena, addr as *mut u8) {
                        FreeResult::Freed { .. } => summary.releases += 1,
                        FreeResult::FreedForeign { .. } => summary.foreign_releases += 1,
                        other => violations.push(format!(
                            "worker {worker} op {op}: mailbox block {addr:#x} {other:?}"
                        )),
                    }
                }
            }
        }
        Ok(WorkerResult {
            summary,
            live,
            violations,
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    // A panicking worker is reported through its join handle.
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Run the workload against `heap` and release everything it left behind.
pub fn run_stress(heap: &Heap, config: &StressConfig) -> Result<StressOutcome, HarnessError> {
    let mailbox = Mutex::new(Vec::new());
    let worker = Worker {
        heap,
        config: *config,
        mailbox: &mailbox,
    };

    let results = thread::scope(|s| {
        let handles: Vec<_> = (0..config.threads)
            .map(|i| {
                let worker = &worker;
                s.spawn(move || worker.run(i))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(i, h)| h.join().map_err(|_| HarnessError::WorkerPanicked(i))?)
            .collect::<Result<Vec<_>, _>>()
    })?;

    let mut outcome = StressOutcome::default();
    let mut survivors: Vec<Block> = mailbox.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner);
    for result in results {
        outcome.workers.push(result.summary);
        outcome.violations.extend(result.violations);
        survivors.extend(result.live);
    }

    let sweeper = heap.register_thread()?;
    survivors.sort_unstable();
    let mut granted = Vec::with_capacity(survivors.len());
    for &(addr, size) in &survivors {
        match heap.usable_size(sweeper, addr as *mut u8) {
            Some(bytes) => granted.push((addr, bytes)),
            None => outcome
                .violations
                .push(format!("survivor {addr:#x} ({size} bytes) is not live")),
        }
    }
    for pair in granted.windows(2) {
        let ((a, a_len), (b, _)) = (pair[0], pair[1]);
        if a + a_len > b {
            outcome
                .violations
                .push(format!("blocks {a:#x}+{a_len} and {b:#x} overlap"));
        }
    }
    outcome.survivors = granted.len();
    outcome.survivor_bytes = granted.iter().map(|&(_, bytes)| bytes).sum();
    let used: usize = heap.stats().iter().map(|a| a.used_bytes()).sum();
    if used != outcome.survivor_bytes {
        outcome.violations.push(format!(
            "heap reports {used} used bytes, survivors hold {}",
            outcome.survivor_bytes
        ));
    }

    for &(addr, _) in &granted {
        if heap.release(sweeper, addr as *mut u8).freed_bytes().is_none() {
            outcome.violations.push(format!("sweep could not release {addr:#x}"));
        }
    }
    let leaked: usize = heap.stats().iter().map(|a| a.used_bytes()).sum();
    if leaked != 0 {
        outcome.violations.push(format!("{leaked} bytes still used after sweep"));
    }
    Ok(outcome)
}

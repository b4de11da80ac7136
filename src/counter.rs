// A thread-safe striped counter
//
// Writes land on the primary cell until contention is observed, then spread
// over lazily engaged cells capped near twice the processor count. `sum` is
// exact and reads every cell; `estimated` trades exactness for a cached sum
// refreshed at most once per coarse clock tick.

use std::sync::atomic::{AtomicIsize, AtomicU64, AtomicUsize};
use std::sync::atomic::Ordering::*;
use std::time::Instant;

use crossbeam_utils::CachePadded;
use lazy_static::lazy_static;

use crate::thread_id;

const FIRST_ENGAGE: usize = 2;

lazy_static! {
    static ref CLOCK_BASE: Instant = Instant::now();
    static ref MAX_CELLS: usize = (num_cpus::get() * 2).next_power_of_two();
}

#[inline(always)]
fn coarse_tick() -> u64 {
    CLOCK_BASE.elapsed().as_millis() as u64
}

pub struct Counter {
    prime: CachePadded<AtomicIsize>,
    cells: Box<[CachePadded<AtomicIsize>]>,
    // Number of cells writes currently spread over, always a power of two.
    // Zero routes everything to the primary cell.
    engaged: AtomicUsize,
    cached: CachePadded<AtomicIsize>,
    cached_tick: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        let cells = (0..*MAX_CELLS)
            .map(|_| CachePadded::new(AtomicIsize::new(0)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            prime: CachePadded::new(AtomicIsize::new(0)),
            cells,
            engaged: AtomicUsize::new(0),
            cached: CachePadded::new(AtomicIsize::new(0)),
            // Forces a refresh on the first estimate.
            cached_tick: AtomicU64::new(u64::MAX),
        }
    }

    #[inline(always)]
    pub fn incr(&self, amount: usize) {
        self.add(amount as isize);
    }

    #[inline(always)]
    pub fn decr(&self, amount: usize) {
        self.add(-(amount as isize));
    }

    pub fn add(&self, delta: isize) {
        if delta == 0 {
            return;
        }
        let engaged = self.engaged.load(Relaxed);
        let cell: &AtomicIsize = if engaged == 0 {
            &self.prime
        } else {
            &self.cells[thread_id::current() & (engaged - 1)]
        };
        // One optimistic update; drift between the expected and observed cell
        // value is the contention signal that engages more cells.
        let seen = cell.load(Relaxed);
        if cell
            .compare_exchange(seen, seen.wrapping_add(delta), Relaxed, Relaxed)
            .is_err()
        {
            cell.fetch_add(delta, Relaxed);
            self.engage_more(engaged);
        }
    }

    fn engage_more(&self, engaged: usize) {
        let target = if engaged == 0 {
            FIRST_ENGAGE
        } else {
            engaged << 1
        };
        if target > *MAX_CELLS {
            return;
        }
        let _ = self.engaged.compare_exchange(engaged, target, Relaxed, Relaxed);
    }

    /// Exact total, O(cells).
    pub fn sum(&self) -> isize {
        let mut total = self.prime.load(Acquire);
        for cell in self.cells.iter() {
            total += cell.load(Acquire);
        }
        total
    }

    /// Cached total, refreshed at most once per clock tick. Suitable only for
    /// heuristics that tolerate staleness, like resize thresholds.
    pub fn estimated(&self) -> isize {
        if self.engaged.load(Relaxed) == 0 {
            return self.prime.load(Relaxed);
        }
        let tick = coarse_tick();
        if self.cached_tick.load(Relaxed) != tick {
            let total = self.sum();
            self.cached.store(total, Relaxed);
            self.cached_tick.store(tick, Relaxed);
        }
        self.cached.load(Relaxed)
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn sequential_sum_is_exact() {
        let counter = Counter::new();
        for _ in 0..1000 {
            counter.incr(1);
        }
        for _ in 0..400 {
            counter.decr(1);
        }
        counter.add(42);
        assert_eq!(counter.sum(), 642);
    }

    #[test]
    fn concurrent_sum_is_exact_after_join() {
        let counter = Arc::new(Counter::new());
        let num_threads = 16;
        let per_thread = 10_000;
        let mut threads = vec![];
        for _ in 0..num_threads {
            let counter = counter.clone();
            threads.push(thread::spawn(move || {
                for i in 0..per_thread {
                    if i % 3 == 0 {
                        counter.decr(1);
                    } else {
                        counter.incr(2);
                    }
                }
            }));
        }
        for t in threads {
            let _ = t.join();
        }
        let expected: isize = (0..per_thread)
            .map(|i| if i % 3 == 0 { -1 } else { 2 })
            .sum::<isize>()
            * num_threads as isize;
        assert_eq!(counter.sum(), expected);
    }

    #[test]
    fn estimate_converges_after_tick() {
        let counter = Counter::new();
        // Force cells to engage so the cached path is exercised.
        while counter.engaged.load(Relaxed) == 0 {
            counter.engage_more(0);
        }
        counter.add(1234);
        thread::sleep(Duration::from_millis(2));
        assert_eq!(counter.estimated(), 1234);
        assert_eq!(counter.sum(), 1234);
    }
}

//! Explicit two-level thread pool
//!
//! One outer pool runs blocks within a region; when block-level nesting
//! is enabled, each outer thread owns an inner pool that runs the
//! sub-blocks of its current block. Making the two levels explicit keeps
//! the thread-divisor arithmetic and per-thread scratch affinity visible
//! and testable.

use crate::Error;
use rayon::prelude::*;

pub struct ThreadPools {
    outer: rayon::ThreadPool,
    /// One inner pool per outer thread; empty when nesting is disabled
    inner: Vec<rayon::ThreadPool>,
    num_outer: usize,
    num_inner: usize,
}
//
impl ThreadPools {
    /// Build pools for `num_outer` region threads with `num_inner`
    /// block threads nested under each
    pub fn new(num_outer: usize, num_inner: usize) -> Result<Self, Error> {
        let num_outer = num_outer.max(1);
        let num_inner = num_inner.max(1);
        let build = |n: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(n)
                .build()
                .map_err(|e| Error::InvalidArgument(format!("cannot build thread pool: {e}")))
        };
        let outer = build(num_outer)?;
        let inner = if num_inner > 1 {
            (0..num_outer)
                .map(|_| build(num_inner))
                .collect::<Result<Vec<_>, _>>()?
        } else {
            Vec::new()
        };
        log::debug!("thread pools: {num_outer} region threads x {num_inner} block threads");
        Ok(Self {
            outer,
            inner,
            num_outer,
            num_inner,
        })
    }

    pub fn num_outer(&self) -> usize {
        self.num_outer
    }

    pub fn num_inner(&self) -> usize {
        self.num_inner
    }

    /// Total scratch slots: one per (outer, inner) thread pair
    pub fn num_thread_slots(&self) -> usize {
        self.num_outer * self.num_inner
    }

    /// Run `f(task, outer_thread)` for every task in the outer pool
    pub fn run_blocks<F>(&self, num_tasks: usize, f: F) -> Result<(), Error>
    where
        F: Fn(usize, usize) -> Result<(), Error> + Sync,
    {
        self.outer.install(|| {
            (0..num_tasks).into_par_iter().try_for_each(|task| {
                let outer_idx = rayon::current_thread_index().unwrap_or(0);
                f(task, outer_idx)
            })
        })
    }

    /// Run `f(task, inner_thread)` for every task, nested under one outer
    /// thread; falls back to a serial loop when nesting is disabled
    pub fn run_sub_blocks<F>(&self, outer_idx: usize, num_tasks: usize, f: F) -> Result<(), Error>
    where
        F: Fn(usize, usize) -> Result<(), Error> + Sync,
    {
        if self.inner.is_empty() {
            return (0..num_tasks).try_for_each(|task| f(task, 0));
        }
        self.inner[outer_idx % self.inner.len()].install(|| {
            (0..num_tasks).into_par_iter().try_for_each(|task| {
                let inner_idx = rayon::current_thread_index().unwrap_or(0);
                f(task, inner_idx)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn flat_dispatch_covers_all_tasks() {
        let pools = ThreadPools::new(3, 1).unwrap();
        assert_eq!(pools.num_thread_slots(), 3);
        let seen = Mutex::new(HashSet::new());
        pools
            .run_blocks(17, |task, outer| {
                assert!(outer < 3);
                seen.lock().unwrap().insert(task);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 17);
    }

    #[test]
    fn nested_dispatch_covers_all_tasks() {
        let pools = ThreadPools::new(2, 2).unwrap();
        assert_eq!(pools.num_thread_slots(), 4);
        let seen = Mutex::new(Vec::new());
        pools
            .run_blocks(4, |block, outer| {
                pools.run_sub_blocks(outer, 5, |sub, inner| {
                    assert!(inner < 2);
                    seen.lock().unwrap().push((block, sub));
                    Ok(())
                })
            })
            .unwrap();
        assert_eq!(seen.lock().unwrap().len(), 20);
    }

    #[test]
    fn errors_propagate() {
        let pools = ThreadPools::new(2, 1).unwrap();
        let res = pools.run_blocks(8, |task, _| {
            if task == 5 {
                Err(Error::InvalidArgument("boom".into()))
            } else {
                Ok(())
            }
        });
        assert!(res.is_err());
    }
}

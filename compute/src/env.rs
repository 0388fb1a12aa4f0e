//! Kernel environment: rank topology and collective helpers
//!
//! Created once per process. With the `mpi` feature the environment owns
//! the MPI universe; without it the process is a single rank and every
//! collective is a no-op.

use crate::Error;
use std::sync::Arc;

cfg_if::cfg_if! {
    if #[cfg(feature = "mpi")] {
        use mpi::collective::SystemOperation;
        use mpi::topology::SimpleCommunicator;
        use mpi::traits::*;

        /// Per-process distributed-computation state
        pub struct KernelEnv {
            _universe: mpi::environment::Universe,
            world: SimpleCommunicator,
        }
        //
        impl KernelEnv {
            /// Initialize the environment, including MPI
            pub fn new() -> Result<Arc<Self>, Error> {
                let universe = mpi::initialize().ok_or_else(|| {
                    Error::CommFailed("MPI initialization failed".into())
                })?;
                let world = universe.world();
                log::info!(
                    "kernel environment: rank {} of {}",
                    world.rank(),
                    world.size()
                );
                Ok(Arc::new(Self {
                    _universe: universe,
                    world,
                }))
            }

            pub(crate) fn world(&self) -> &SimpleCommunicator {
                &self.world
            }

            /// Number of ranks in the computation
            pub fn num_ranks(&self) -> usize {
                self.world.size() as usize
            }

            /// Index of this rank
            pub fn rank_index(&self) -> usize {
                self.world.rank() as usize
            }

            /// Wait until all ranks have reached this point
            pub fn global_barrier(&self) {
                self.world.barrier();
            }

            /// Sum of `val` over all ranks
            pub fn sum_over_ranks(&self, val: i64) -> i64 {
                let mut sum = 0i64;
                self.world
                    .all_reduce_into(&val, &mut sum, SystemOperation::sum());
                sum
            }

            /// Minimum of `val` over all ranks
            pub fn min_over_ranks(&self, val: i64) -> i64 {
                let mut min = 0i64;
                self.world
                    .all_reduce_into(&val, &mut min, SystemOperation::min());
                min
            }

            /// Maximum of `val` over all ranks
            pub fn max_over_ranks(&self, val: i64) -> i64 {
                let mut max = 0i64;
                self.world
                    .all_reduce_into(&val, &mut max, SystemOperation::max());
                max
            }
        }
    } else {
        /// Per-process distributed-computation state
        ///
        /// Built without distributed support: one rank, no neighbors,
        /// no-op barriers.
        pub struct KernelEnv {
            _private: (),
        }
        //
        impl KernelEnv {
            /// Initialize the environment
            pub fn new() -> Result<Arc<Self>, Error> {
                Ok(Arc::new(Self { _private: () }))
            }

            /// Number of ranks in the computation
            pub fn num_ranks(&self) -> usize {
                1
            }

            /// Index of this rank
            pub fn rank_index(&self) -> usize {
                0
            }

            /// Wait until all ranks have reached this point
            pub fn global_barrier(&self) {}

            /// Sum of `val` over all ranks
            pub fn sum_over_ranks(&self, val: i64) -> i64 {
                val
            }

            /// Minimum of `val` over all ranks
            pub fn min_over_ranks(&self, val: i64) -> i64 {
                val
            }

            /// Maximum of `val` over all ranks
            pub fn max_over_ranks(&self, val: i64) -> i64 {
                val
            }
        }
    }
}
//
impl KernelEnv {
    /// Check that `val` is identical on every rank
    ///
    /// Used during prepare to catch per-rank settings disagreements.
    pub fn assert_equality_over_ranks(&self, val: i64, descr: &str) -> Result<(), Error> {
        let min = self.min_over_ranks(val);
        let max = self.max_over_ranks(val);
        if min != val || max != val {
            return Err(Error::ConfigurationMismatch(format!(
                "{descr} ranges from {min} to {max} across ranks; it must be identical"
            )));
        }
        Ok(())
    }
}

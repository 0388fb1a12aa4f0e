//! Execution engine of the stencil runtime
//!
//! A solution is a precompiled bundle of stencil equations plus a set of
//! named grids; this crate owns the machinery that advances it through
//! the step dimension: the kernel environment (rank topology and
//! collectives), runtime settings, the hierarchical region/block/
//! sub-block scan with optional temporal wave-fronts, the halo-exchange
//! engine, the block-shape auto-tuner, and the public solution facade.

pub mod bundle;
mod engine;
pub mod env;
pub mod halo;
mod pools;
pub mod settings;
pub mod solution;
pub mod tuner;

pub use bundle::{BundlePack, KernelArgs, ScratchSpec, StencilBundle};
pub use env::KernelEnv;
pub use settings::Settings;
pub use solution::{Solution, Stats};

use thiserror::Error;

/// Things that can go wrong while driving a solution
#[derive(Debug, Error)]
pub enum Error {
    /// Error from the storage side
    #[error(transparent)]
    Data(#[from] data::Error),

    /// Bad option, bad step range, or other caller mistake
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Per-rank settings disagree; caught during prepare_solution
    #[error("configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    /// Transport error during halo exchange; fatal for the solution
    #[error("communication failed: {0}")]
    CommFailed(String),
}

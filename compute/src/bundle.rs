//! Stencil bundles and bundle packs
//!
//! A bundle is one compiled stencil equation: it declares the grids it
//! writes and reads, how far its reads reach into neighboring points, and
//! an opaque compute operation that fills every point of a sub-block
//! index range. Code generation hands the engine a list of such records;
//! the engine never looks inside `compute`.

use crate::Error;
use data::bbox::BoundingBox;
use data::dims::IdxTuple;
use data::grid::{Grid, GridId};
use std::fmt;

/// Arguments handed to a bundle's compute operation for one sub-block
pub struct KernelArgs<'a> {
    /// All solution grids, indexed by [`GridId`]
    ///
    /// Reads may touch any point of the declared input grids within halo
    /// distance of the writes. Writes go through
    /// [`Grid::write_elem_unsync`]; the engine guarantees that no other
    /// thread touches the same points.
    pub grids: &'a [Grid],
    /// This thread's scratch grids, re-offset to the current work tile
    pub scratch: &'a mut [Grid],
    /// Sub-block begin, inclusive, over the domain dimensions
    pub begin: IdxTuple,
    /// Sub-block end, exclusive, over the domain dimensions
    pub end: IdxTuple,
    /// Step index being read; writes land at `step + 1`
    pub step: i64,
}

/// Compute operation of one bundle
pub type KernelFn = dyn Fn(KernelArgs<'_>) -> Result<(), Error> + Send + Sync;

/// Request for one per-thread scratch grid
#[derive(Clone, Debug)]
pub struct ScratchSpec {
    pub name: String,
    /// Halo the scratch grid needs around the work tile, per domain dim
    pub halo: IdxTuple,
}

/// One compiled stencil equation
pub struct StencilBundle {
    pub name: String,
    /// Grids this bundle writes (at `step + 1`)
    pub outputs: Vec<GridId>,
    /// Grids this bundle reads (at `step`)
    pub inputs: Vec<GridId>,
    /// Read reach into neighboring points, per domain dimension
    pub halo: IdxTuple,
    /// Domain-only bounding box this bundle is valid in; `None` means the
    /// whole rank domain
    pub sub_domain: Option<BoundingBox>,
    /// Scratch grids required per thread
    pub scratch: Vec<ScratchSpec>,
    /// Estimated floating-point operations per computed point
    pub fp_ops_per_point: usize,
    pub compute: Box<KernelFn>,
}
//
impl fmt::Debug for StencilBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StencilBundle")
            .field("name", &self.name)
            .field("outputs", &self.outputs)
            .field("inputs", &self.inputs)
            .field("halo", &self.halo.to_string())
            .field("scratch", &self.scratch.len())
            .finish_non_exhaustive()
    }
}

/// An ordered list of bundles evaluated back-to-back within one step
///
/// Packs are the unit of halo exchange: all of a pack's stale inputs are
/// made consistent before any of its bundles run.
#[derive(Debug)]
pub struct BundlePack {
    pub name: String,
    /// Indices into the solution's bundle list, in evaluation order
    pub bundles: Vec<usize>,
}

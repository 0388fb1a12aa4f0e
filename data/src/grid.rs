//! Multi-dimensional grid storage
//!
//! Each grid owns one contiguous byte region sized to its padded, folded
//! shape. Domain dimensions carry halos (border points owned by a
//! neighbor rank) and extra padding, rounded up so that the first domain
//! point is vector-aligned and the per-dimension allocation is a multiple
//! of the vector fold. Vector-folded dimensions decompose every index
//! into (outer, inner) parts; the inner elements of one fold cluster are
//! stored contiguously, so a whole cluster can be moved as one SIMD
//! register group. The step dimension is a ring: step indices are reduced
//! modulo the grid's step allocation.
//!
//! For a 1-D domain of 8 points with halo 1, extra pad 1 and fold 4, the
//! layout looks like this (`p` pad, `h` halo, `d` domain, `|` cluster
//! boundaries):
//!
//! ```text
//! | p p h d | d d d d | d d d p |
//!       ^ first domain point is cluster-aligned
//! ```

use crate::alloc::{AllocBuf, NumaPref, BUF_PAD_LINES, CACHELINE_BYTES};
use crate::dims::{for_each_in, imod, round_up, DimKind, IdxTuple};
use crate::{Error, Precision, ELEMENT_BYTES};
use std::sync::Arc;

/// Identifier of a grid within its owning solution
pub type GridId = usize;

/// Everything the storage layer tracks about one dimension of one grid
#[derive(Clone, Debug, PartialEq)]
pub struct GridDim {
    name: String,
    kind: DimKind,
    size: i64,
    left_halo: i64,
    right_halo: i64,
    left_extra_pad: i64,
    right_extra_pad: i64,
    fold: i64,
    first_rank_idx: i64,
    // Derived by update_layout()
    left_pad: i64,
    right_pad: i64,
    alloc_size: i64,
}
//
impl GridDim {
    /// A domain dimension of the given rank-local size and vector fold
    pub fn domain(name: impl Into<String>, size: i64, fold: i64) -> Self {
        debug_assert!(size >= 0 && fold >= 1);
        let mut dim = Self {
            name: name.into(),
            kind: DimKind::Domain,
            size,
            left_halo: 0,
            right_halo: 0,
            left_extra_pad: 0,
            right_extra_pad: 0,
            fold,
            first_rank_idx: 0,
            left_pad: 0,
            right_pad: 0,
            alloc_size: 0,
        };
        dim.update_layout();
        dim
    }

    /// The step dimension, stored as a ring of `alloc_len` entries
    pub fn step(name: impl Into<String>, alloc_len: i64) -> Self {
        debug_assert!(alloc_len >= 1);
        let mut dim = Self {
            name: name.into(),
            kind: DimKind::Step,
            size: alloc_len,
            left_halo: 0,
            right_halo: 0,
            left_extra_pad: 0,
            right_extra_pad: 0,
            fold: 1,
            first_rank_idx: 0,
            left_pad: 0,
            right_pad: 0,
            alloc_size: 0,
        };
        dim.update_layout();
        dim
    }

    /// A misc dimension: enumerated, no halo, no fold
    pub fn misc(name: impl Into<String>, size: i64) -> Self {
        let mut dim = Self::domain(name, size, 1);
        dim.kind = DimKind::Misc;
        dim.update_layout();
        dim
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DimKind {
        self.kind
    }

    /// Rank-local domain size (domain dims), ring length (step), or size (misc)
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn left_halo(&self) -> i64 {
        self.left_halo
    }

    pub fn right_halo(&self) -> i64 {
        self.right_halo
    }

    pub fn fold(&self) -> i64 {
        self.fold
    }

    /// Global index of the first rank-local domain point
    pub fn first_rank_idx(&self) -> i64 {
        self.first_rank_idx
    }

    /// Total left padding (halo + extra, rounded up to the fold)
    pub fn left_pad(&self) -> i64 {
        self.left_pad
    }

    pub fn alloc_size(&self) -> i64 {
        self.alloc_size
    }

    /// First allocated logical index in this dimension
    pub fn first_alloc_idx(&self) -> i64 {
        match self.kind {
            DimKind::Domain => self.first_rank_idx - self.left_pad,
            DimKind::Step => 0,
            DimKind::Misc => self.first_rank_idx,
        }
    }

    /// Recompute pads and allocation size from the wanted sizes
    ///
    /// Invariant: alloc_size >= size + halos + extra pads, alloc_size is a
    /// multiple of the fold, and the first domain point is fold-aligned.
    fn update_layout(&mut self) {
        match self.kind {
            DimKind::Domain => {
                self.left_pad = round_up(self.left_halo + self.left_extra_pad, self.fold);
                self.right_pad = round_up(self.right_halo + self.right_extra_pad, self.fold);
                self.alloc_size = round_up(self.size, self.fold) + self.left_pad + self.right_pad;
            }
            DimKind::Step | DimKind::Misc => {
                self.left_pad = 0;
                self.right_pad = 0;
                self.alloc_size = self.size;
            }
        }
    }
}

/// A named multi-dimensional array with padding, folding and a step ring
#[derive(Debug)]
pub struct Grid {
    name: String,
    dims: Vec<GridDim>,
    fixed_size: bool,
    buf: Option<Arc<AllocBuf>>,
    /// One dirty flag per step-ring slot (a single flag without a step dim)
    dirty: Vec<bool>,
}
//
impl Grid {
    /// A grid whose sizes may still be adjusted until storage is allocated
    pub fn new(name: impl Into<String>, dims: Vec<GridDim>) -> Self {
        let slots = Self::dirty_slots(&dims);
        Self {
            name: name.into(),
            dims,
            fixed_size: false,
            buf: None,
            dirty: vec![false; slots],
        }
    }

    /// A fixed-size grid: only `0..size` is addressable in every dimension
    pub fn new_fixed(name: impl Into<String>, dims: Vec<GridDim>) -> Self {
        let mut grid = Self::new(name, dims);
        grid.fixed_size = true;
        grid
    }

    fn dirty_slots(dims: &[GridDim]) -> usize {
        dims.iter()
            .find(|d| d.kind == DimKind::Step)
            .map(|d| d.alloc_size as usize)
            .unwrap_or(1)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dims(&self) -> &[GridDim] {
        &self.dims
    }

    pub fn dim(&self, name: &str) -> Option<&GridDim> {
        self.dims.iter().find(|d| d.name == name)
    }

    fn dim_checked(&self, name: &str) -> Result<usize, Error> {
        self.dims
            .iter()
            .position(|d| d.name == name)
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "grid `{}` has no dimension `{name}`",
                    self.name
                ))
            })
    }

    pub fn is_fixed_size(&self) -> bool {
        self.fixed_size
    }

    /// Ring length of the step dimension (1 when there is none)
    pub fn step_alloc(&self) -> i64 {
        self.dims
            .iter()
            .find(|d| d.kind == DimKind::Step)
            .map(|d| d.alloc_size)
            .unwrap_or(1)
    }

    // ---- shape adjustment (frozen once storage exists) ----

    fn check_resizable(&self) -> Result<(), Error> {
        if self.buf.is_some() {
            return Err(Error::InvalidArgument(format!(
                "grid `{}` cannot be resized once storage is allocated",
                self.name
            )));
        }
        Ok(())
    }

    /// Grow the halo of a domain dimension to at least (left, right)
    pub fn update_halo(&mut self, dim: &str, left: i64, right: i64) -> Result<(), Error> {
        self.check_resizable()?;
        let i = self.dim_checked(dim)?;
        let d = &mut self.dims[i];
        if d.kind != DimKind::Domain {
            return Err(Error::DimKindMismatch {
                dim: dim.to_string(),
                expected: "domain",
                op: "update_halo",
            });
        }
        d.left_halo = d.left_halo.max(left);
        d.right_halo = d.right_halo.max(right);
        d.update_layout();
        Ok(())
    }

    /// Change the rank-local domain size of a domain dimension
    pub fn set_domain_size(&mut self, dim: &str, size: i64) -> Result<(), Error> {
        self.check_resizable()?;
        if size < 0 {
            return Err(Error::InvalidArgument(format!(
                "domain size {size} for dimension `{dim}` must not be negative"
            )));
        }
        let i = self.dim_checked(dim)?;
        let d = &mut self.dims[i];
        if d.kind != DimKind::Domain {
            return Err(Error::DimKindMismatch {
                dim: dim.to_string(),
                expected: "domain",
                op: "set_domain_size",
            });
        }
        d.size = size;
        d.update_layout();
        Ok(())
    }

    /// Request at least (left, right) extra padding beyond the halo
    pub fn set_min_extra_pad(&mut self, dim: &str, left: i64, right: i64) -> Result<(), Error> {
        self.check_resizable()?;
        let i = self.dim_checked(dim)?;
        let d = &mut self.dims[i];
        d.left_extra_pad = d.left_extra_pad.max(left);
        d.right_extra_pad = d.right_extra_pad.max(right);
        d.update_layout();
        Ok(())
    }

    /// Change the ring length of the step dimension
    pub fn set_step_alloc(&mut self, alloc_len: i64) -> Result<(), Error> {
        self.check_resizable()?;
        if alloc_len < 1 {
            return Err(Error::InvalidArgument(format!(
                "step allocation {alloc_len} must be positive"
            )));
        }
        for d in &mut self.dims {
            if d.kind == DimKind::Step {
                d.size = alloc_len;
                d.update_layout();
                self.dirty = vec![false; alloc_len as usize];
                return Ok(());
            }
        }
        Err(Error::InvalidArgument(format!(
            "grid `{}` has no step dimension",
            self.name
        )))
    }

    /// Re-address a dimension so its first rank-domain point sits at `idx`
    ///
    /// Unlike the size setters this is valid with live storage: it only
    /// moves the logical window, which is how scratch grids are re-offset
    /// to the current work tile.
    pub fn set_first_rank_index(&mut self, dim: &str, idx: i64) -> Result<(), Error> {
        let i = self.dim_checked(dim)?;
        self.dims[i].first_rank_idx = idx;
        Ok(())
    }

    // ---- storage ----

    pub fn has_storage(&self) -> bool {
        self.buf.is_some()
    }

    /// Total allocated elements, padding included
    pub fn num_storage_elements(&self) -> i64 {
        self.dims.iter().map(|d| d.alloc_size).product()
    }

    /// Bytes holding elements (excludes the inter-buffer pad)
    pub fn storage_bytes(&self) -> usize {
        self.num_storage_elements() as usize * ELEMENT_BYTES
    }

    /// Allocate zeroed storage for the current shape
    ///
    /// `pad_mult` scales the inter-buffer pad appended to the allocation
    /// to avoid conflict-miss aliasing between same-sized grids.
    pub fn alloc_storage(&mut self, numa: NumaPref, pad_mult: usize) -> Result<(), Error> {
        let nbytes = self.storage_bytes() + CACHELINE_BYTES * BUF_PAD_LINES * pad_mult;
        log::debug!(
            "allocating {} for grid `{}`",
            crate::byte_str(nbytes),
            self.name
        );
        self.buf = Some(Arc::new(AllocBuf::new(nbytes, numa)?));
        self.dirty = vec![false; Self::dirty_slots(&self.dims)];
        Ok(())
    }

    pub fn release_storage(&mut self) {
        self.buf = None;
    }

    fn storage(&self) -> Result<&Arc<AllocBuf>, Error> {
        self.buf.as_ref().ok_or_else(|| {
            Error::InvalidArgument(format!("grid `{}` has no storage", self.name))
        })
    }

    /// Adopt another grid's buffer; shapes and folds must match exactly
    pub fn share_storage_from(&mut self, other: &Grid) -> Result<(), Error> {
        if self.dims.len() != other.dims.len() {
            return Err(Error::ShapeMismatch(format!(
                "grid `{}` has {} dims, `{}` has {}",
                self.name,
                self.dims.len(),
                other.name,
                other.dims.len()
            )));
        }
        for (a, b) in self.dims.iter().zip(&other.dims) {
            if a != b {
                return Err(Error::ShapeMismatch(format!(
                    "grid `{}` dim `{}` ({a:?}) does not match `{}` ({b:?})",
                    self.name, a.name, other.name
                )));
            }
        }
        self.buf = Some(other.storage()?.clone());
        self.dirty = other.dirty.clone();
        Ok(())
    }

    // ---- element access ----

    /// Linear element offset of a logical index tuple
    ///
    /// The tuple must contain an entry for every grid dimension (extra
    /// entries are ignored). Step indices are reduced modulo the ring
    /// length; all other indices must fall inside the allocated range.
    pub fn offset_of(&self, idxs: &IdxTuple) -> Result<usize, Error> {
        let mut outer: i64 = 0;
        let mut inner: i64 = 0;
        let mut fold_vol: i64 = 1;
        for d in &self.dims {
            let mut idx = idxs.lookup(&d.name)?;
            if d.kind == DimKind::Step {
                idx = imod(idx, d.alloc_size);
            }
            let first = d.first_alloc_idx();
            let rel = idx - first;
            if rel < 0 || rel >= d.alloc_size {
                return Err(Error::OutOfBounds {
                    dim: d.name.clone(),
                    index: idx,
                    first,
                    last: first + d.alloc_size,
                });
            }
            outer = outer * (d.alloc_size / d.fold) + rel / d.fold;
            inner = inner * d.fold + rel % d.fold;
            fold_vol *= d.fold;
        }
        Ok((outer * fold_vol + inner) as usize)
    }

    /// Inverse of [`offset_of`](Self::offset_of)
    pub fn index_of(&self, offset: usize) -> Result<IdxTuple, Error> {
        let total = self.num_storage_elements();
        if offset as i64 >= total {
            return Err(Error::InvalidArgument(format!(
                "linear offset {offset} exceeds storage size {total}"
            )));
        }
        let fold_vol: i64 = self.dims.iter().map(|d| d.fold).product();
        let mut outer = offset as i64 / fold_vol;
        let mut inner = offset as i64 % fold_vol;
        let mut rev = Vec::with_capacity(self.dims.len());
        for d in self.dims.iter().rev() {
            let outer_size = d.alloc_size / d.fold;
            let o = outer % outer_size;
            outer /= outer_size;
            let i = inner % d.fold;
            inner /= d.fold;
            rev.push((d.name.clone(), d.first_alloc_idx() + o * d.fold + i));
        }
        Ok(IdxTuple::from_pairs(rev.into_iter().rev()))
    }

    /// Read one element at a logical index
    pub fn read_elem(&self, idxs: &IdxTuple) -> Result<Precision, Error> {
        let off = self.offset_of(idxs)?;
        let buf = self.storage()?;
        let elems: &[Precision] =
            bytemuck::cast_slice(&buf.as_slice()[..self.storage_bytes()]);
        Ok(elems[off])
    }

    /// Write one element at a logical index
    pub fn write_elem(&mut self, idxs: &IdxTuple, val: Precision) -> Result<(), Error> {
        let off = self.offset_of(idxs)?;
        let buf = self.storage()?;
        // SAFETY: the offset is bounds-checked and &mut self excludes
        // concurrent access through this grid handle.
        unsafe { (buf.as_ptr() as *mut Precision).add(off).write(val) };
        Ok(())
    }

    /// Write one element through a shared reference
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other thread concurrently reads
    /// or writes this element. The execution engine upholds this by
    /// partitioning each bundle's writes into disjoint sub-blocks.
    pub unsafe fn write_elem_unsync(
        &self,
        idxs: &IdxTuple,
        val: Precision,
    ) -> Result<(), Error> {
        let off = self.offset_of(idxs)?;
        let buf = self.storage()?;
        unsafe { (buf.as_ptr() as *mut Precision).add(off).write(val) };
        Ok(())
    }

    // ---- dirty tracking ----

    fn dirty_slot(&self, step: i64) -> usize {
        imod(step, self.dirty.len() as i64) as usize
    }

    /// Halos of this step value may be stale
    pub fn is_dirty(&self, step: i64) -> bool {
        self.dirty[self.dirty_slot(step)]
    }

    pub fn set_dirty(&mut self, step: i64, dirty: bool) {
        let slot = self.dirty_slot(step);
        self.dirty[slot] = dirty;
    }

    pub fn set_dirty_all(&mut self, dirty: bool) {
        self.dirty.fill(dirty);
    }

    // ---- whole-grid helpers ----

    /// Set every allocated element (padding included) to `val`
    pub fn set_all_same(&mut self, val: Precision) -> Result<(), Error> {
        let n = self.num_storage_elements() as usize;
        let buf = self.storage()?;
        let ptr = buf.as_ptr() as *mut Precision;
        for i in 0..n {
            // SAFETY: i < allocated element count, exclusive via &mut self
            unsafe { ptr.add(i).write(val) };
        }
        Ok(())
    }

    /// Fill with a deterministic per-element sequence derived from `seed`
    pub fn set_all_in_seq(&mut self, seed: Precision) -> Result<(), Error> {
        let n = self.num_storage_elements() as usize;
        let buf = self.storage()?;
        let ptr = buf.as_ptr() as *mut Precision;
        for i in 0..n {
            let val = seed * ((i % 1024) + 1) as Precision;
            // SAFETY: i < allocated element count, exclusive via &mut self
            unsafe { ptr.add(i).write(val) };
        }
        Ok(())
    }

    /// Logical index bounds covering domain, step ring and misc extents
    /// (halos and padding excluded)
    pub fn logical_bounds(&self) -> (IdxTuple, IdxTuple) {
        let mut begin = IdxTuple::new();
        let mut end = IdxTuple::new();
        for d in &self.dims {
            match d.kind {
                DimKind::Step => {
                    begin.push(&d.name, 0);
                    end.push(&d.name, d.alloc_size);
                }
                DimKind::Domain | DimKind::Misc => {
                    begin.push(&d.name, d.first_rank_idx);
                    end.push(&d.name, d.first_rank_idx + d.size);
                }
            }
        }
        (begin, end)
    }

    /// Count elements differing from `other` beyond `max(|ref|, 1) * eps`
    ///
    /// Only domain points are compared (halos may legitimately disagree).
    pub fn compare(&self, other: &Grid, eps: Precision) -> Result<usize, Error> {
        let (begin, end) = self.logical_bounds();
        let (obegin, oend) = other.logical_bounds();
        if begin != obegin || end != oend {
            return Err(Error::ShapeMismatch(format!(
                "grids `{}` and `{}` cover different logical ranges",
                self.name, other.name
            )));
        }
        let mut mismatches = 0usize;
        for_each_in(&begin, &end, |pt| {
            let a = self.read_elem(pt)?;
            let b = other.read_elem(pt)?;
            if (a - b).abs() > b.abs().max(1.0) * eps {
                if mismatches < 8 {
                    log::debug!("grid `{}` mismatch at ({pt}): {a} != {b}", self.name);
                }
                mismatches += 1;
            }
            Ok::<(), Error>(())
        })?;
        Ok(mismatches)
    }
}

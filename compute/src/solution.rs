//! The solution facade
//!
//! A [`Solution`] owns its grids, bundles, thread pools and MPI data, and
//! exposes the public control surface: configure settings, create grids,
//! register bundle packs, prepare, run, share storage, gather statistics.
//! Cyclic references are avoided throughout: grids live in one owned
//! vector and every other part refers to them by [`GridId`].

use crate::bundle::{BundlePack, StencilBundle};
use crate::engine;
use crate::env::KernelEnv;
use crate::halo::{HaloBuffers, MpiInfo};
use crate::pools::ThreadPools;
use crate::settings::Settings;
use crate::tuner::AutoTuner;
use crate::Error;
use data::bbox::BoundingBox;
use data::dims::{DimKind, DimSet, IdxTuple};
use data::grid::{Grid, GridDim, GridId};
use data::{byte_str, num_str, Precision};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Work and timing counters gathered over calls to `run_solution`
#[derive(Clone, Debug, Default)]
pub struct Stats {
    /// Points in the overall (all-rank) domain
    pub num_elements: i64,
    /// Grid points written, summed over steps
    pub num_writes: i64,
    /// Estimated floating-point operations, summed over steps
    pub est_fp_ops: i64,
    /// Steps completed by `run_solution`
    pub num_steps_done: i64,
    /// Seconds spent inside `run_solution`, halo exchange included
    pub elapsed_run_secs: f64,
    /// Seconds spent in halo exchange alone
    pub elapsed_mpi_secs: f64,
}

static NEXT_SOLUTION_ID: AtomicUsize = AtomicUsize::new(0);

/// A prepared stencil solution: grids, bundles, and the machinery to
/// advance them through the step dimension
pub struct Solution {
    pub(crate) name: String,
    /// Disambiguates halo-packet tags between solutions on one communicator
    pub(crate) id: usize,
    pub(crate) env: Arc<KernelEnv>,
    pub(crate) dims: DimSet,
    pub(crate) settings: Settings,
    /// Vector fold per domain dimension
    pub(crate) folds: IdxTuple,
    /// Cluster size per domain dimension (a multiple of the fold)
    pub(crate) cluster_mults: IdxTuple,

    pub(crate) grids: Vec<Grid>,
    pub(crate) bundles: Vec<StencilBundle>,
    pub(crate) packs: Vec<BundlePack>,

    /// One scratch-grid vector per (region thread, block thread) pair
    pub(crate) scratch: Vec<Mutex<Vec<Grid>>>,
    /// Range of each bundle's scratch grids within a scratch vector
    pub(crate) scratch_ranges: Vec<(usize, usize)>,

    pub(crate) mpi_info: Option<MpiInfo>,
    pub(crate) mpi_bufs: Vec<HaloBuffers>,
    pub(crate) pools: Option<ThreadPools>,
    pub(crate) tuner: AutoTuner,

    /// BB of this rank's domain, without wave-front extensions
    pub(crate) rank_bb: BoundingBox,
    /// BB extended for wave-fronts; equals `rank_bb` without them
    pub(crate) ext_bb: BoundingBox,
    pub(crate) max_halos: IdxTuple,
    pub(crate) wf_angles: IdxTuple,
    pub(crate) num_wf_shifts: i64,
    pub(crate) left_wf_exts: IdxTuple,
    pub(crate) right_wf_exts: IdxTuple,

    pub(crate) rank_domain_offsets: IdxTuple,
    pub(crate) overall_domain_sizes: IdxTuple,

    pub(crate) stats: Stats,
    pub(crate) prepared: bool,
    /// Set after a transport failure; every later run fails
    pub(crate) broken: bool,
}
//
impl Solution {
    /// A fresh solution with default settings
    pub fn new(env: Arc<KernelEnv>, name: impl Into<String>, dims: DimSet) -> Self {
        let settings = Settings::new(&dims);
        Self::with_settings(env, name, dims, settings)
    }

    /// A fresh solution copying another solution's settings
    ///
    /// Grids, grid data and bundles are not copied; see
    /// [`share_grid_storage`](Self::share_grid_storage).
    pub fn with_settings_from(
        env: Arc<KernelEnv>,
        name: impl Into<String>,
        source: &Solution,
    ) -> Self {
        Self::with_settings(env, name, source.dims.clone(), source.settings.clone())
    }

    fn with_settings(
        env: Arc<KernelEnv>,
        name: impl Into<String>,
        dims: DimSet,
        settings: Settings,
    ) -> Self {
        let zero = dims.domain_tuple(0);
        let empty_bb = BoundingBox::new(zero.clone(), zero.clone());
        Self {
            name: name.into(),
            id: NEXT_SOLUTION_ID.fetch_add(1, Ordering::Relaxed),
            env,
            folds: dims.domain_tuple(1),
            cluster_mults: dims.domain_tuple(1),
            settings,
            dims,
            grids: Vec::new(),
            bundles: Vec::new(),
            packs: Vec::new(),
            scratch: Vec::new(),
            scratch_ranges: Vec::new(),
            mpi_info: None,
            mpi_bufs: Vec::new(),
            pools: None,
            tuner: AutoTuner::new(),
            rank_bb: empty_bb.clone(),
            ext_bb: empty_bb,
            max_halos: zero.clone(),
            wf_angles: zero.clone(),
            num_wf_shifts: 0,
            left_wf_exts: zero.clone(),
            right_wf_exts: zero.clone(),
            rank_domain_offsets: zero.clone(),
            overall_domain_sizes: zero,
            stats: Stats::default(),
            prepared: false,
            broken: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    // ---- configuration (pre-prepare) ----

    fn set_domain_setting(
        &mut self,
        which: fn(&mut Settings) -> &mut IdxTuple,
        op: &'static str,
        dim: &str,
        size: i64,
    ) -> Result<(), Error> {
        self.dims.check_kind(dim, op, false, true, false)?;
        if size < 0 {
            return Err(Error::InvalidArgument(format!(
                "{op}: size {size} must not be negative"
            )));
        }
        which(&mut self.settings).set(dim, size)?;
        Ok(())
    }

    pub fn set_rank_domain_size(&mut self, dim: &str, size: i64) -> Result<(), Error> {
        self.set_domain_setting(|s| &mut s.rank_domain_sizes, "set_rank_domain_size", dim, size)
    }

    pub fn set_region_size(&mut self, dim: &str, size: i64) -> Result<(), Error> {
        self.set_domain_setting(|s| &mut s.region_sizes, "set_region_size", dim, size)
    }

    pub fn set_block_size(&mut self, dim: &str, size: i64) -> Result<(), Error> {
        self.set_domain_setting(|s| &mut s.block_sizes, "set_block_size", dim, size)
    }

    pub fn set_sub_block_size(&mut self, dim: &str, size: i64) -> Result<(), Error> {
        self.set_domain_setting(|s| &mut s.sub_block_sizes, "set_sub_block_size", dim, size)
    }

    pub fn set_min_pad_size(&mut self, dim: &str, size: i64) -> Result<(), Error> {
        self.set_domain_setting(|s| &mut s.min_pad_sizes, "set_min_pad_size", dim, size)
    }

    pub fn set_num_ranks(&mut self, dim: &str, num: i64) -> Result<(), Error> {
        self.dims.check_kind(dim, "set_num_ranks", false, true, false)?;
        if num < 1 {
            return Err(Error::InvalidArgument(format!(
                "set_num_ranks: {num} must be positive"
            )));
        }
        self.settings.num_ranks.set(dim, num)?;
        Ok(())
    }

    /// Steps advanced per region; above 1 enables wave-front skewing
    pub fn set_region_steps(&mut self, steps: i64) -> Result<(), Error> {
        if steps < 1 {
            return Err(Error::InvalidArgument(format!(
                "set_region_steps: {steps} must be positive"
            )));
        }
        self.settings.region_steps = steps;
        Ok(())
    }

    /// Size used for a misc dimension in grids created afterwards
    pub fn set_misc_dim_size(&mut self, dim: &str, size: i64) -> Result<(), Error> {
        self.dims.check_kind(dim, "set_misc_dim_size", false, false, true)?;
        if size < 1 {
            return Err(Error::InvalidArgument(format!(
                "set_misc_dim_size: {size} must be positive"
            )));
        }
        self.settings.misc_sizes.set(dim, size)?;
        Ok(())
    }

    /// Vector fold of a domain dimension; must precede grid creation
    pub fn set_fold(&mut self, dim: &str, fold: i64) -> Result<(), Error> {
        self.dims.check_kind(dim, "set_fold", false, true, false)?;
        if fold < 1 {
            return Err(Error::InvalidArgument(format!(
                "set_fold: {fold} must be positive"
            )));
        }
        if !self.grids.is_empty() {
            return Err(Error::InvalidArgument(
                "set_fold must be called before any grid is created".into(),
            ));
        }
        self.folds.set(dim, fold)?;
        // Clusters are whole multiples of the fold
        let mult = self.cluster_mults.lookup(dim)?;
        self.cluster_mults.set(dim, fold * mult.max(1))?;
        Ok(())
    }

    /// NUMA node preference for storage allocated from now on
    ///
    /// Non-negative values prefer that node; -1 binds locally, -2
    /// interleaves, anything else disables binding.
    pub fn set_default_numa_preferred(&mut self, node: i64) {
        self.settings.numa_pref = match node {
            n if n >= 0 => data::alloc::NumaPref::Preferred(n as u32),
            -1 => data::alloc::NumaPref::Local,
            -2 => data::alloc::NumaPref::Interleave,
            _ => data::alloc::NumaPref::None,
        };
    }

    /// Parse an option string; unrecognized tokens are returned
    pub fn apply_command_line_options(&mut self, args: &str) -> Result<Vec<String>, Error> {
        self.settings.apply_command_line_options(args)
    }

    // ---- grid creation ----

    /// Create a grid sized from the solution's settings
    ///
    /// `dim_names` may be any subset of the declared dimensions.
    pub fn new_grid(&mut self, name: &str, dim_names: &[&str]) -> Result<GridId, Error> {
        if self.grid_id(name).is_some() {
            return Err(Error::InvalidArgument(format!(
                "grid `{name}` already exists"
            )));
        }
        let mut grid_dims = Vec::with_capacity(dim_names.len());
        for dn in dim_names {
            let kind = self.dims.check_kind(dn, "new_grid", true, true, true)?;
            grid_dims.push(match kind {
                DimKind::Step => GridDim::step(*dn, self.settings.step_alloc),
                DimKind::Domain => GridDim::domain(
                    *dn,
                    self.settings.rank_domain_sizes.lookup(dn)?,
                    self.folds.lookup(dn)?,
                ),
                DimKind::Misc => GridDim::misc(*dn, self.settings.misc_sizes.lookup(dn)?),
            });
        }
        self.grids.push(Grid::new(name, grid_dims));
        Ok(self.grids.len() - 1)
    }

    /// Create a grid with explicit per-dimension sizes and no halos
    pub fn new_fixed_size_grid(
        &mut self,
        name: &str,
        dim_names: &[&str],
        sizes: &[i64],
    ) -> Result<GridId, Error> {
        if dim_names.len() != sizes.len() {
            return Err(Error::InvalidArgument(format!(
                "new_fixed_size_grid: {} dims but {} sizes",
                dim_names.len(),
                sizes.len()
            )));
        }
        if self.grid_id(name).is_some() {
            return Err(Error::InvalidArgument(format!(
                "grid `{name}` already exists"
            )));
        }
        let mut grid_dims = Vec::with_capacity(dim_names.len());
        for (dn, &size) in dim_names.iter().zip(sizes) {
            let kind = self.dims.check_kind(dn, "new_fixed_size_grid", true, true, true)?;
            if size < 1 {
                return Err(Error::InvalidArgument(format!(
                    "new_fixed_size_grid: size {size} for `{dn}` must be positive"
                )));
            }
            grid_dims.push(match kind {
                DimKind::Step => GridDim::step(*dn, size),
                DimKind::Domain => GridDim::domain(*dn, size, 1),
                DimKind::Misc => GridDim::misc(*dn, size),
            });
        }
        self.grids.push(Grid::new_fixed(name, grid_dims));
        Ok(self.grids.len() - 1)
    }

    // ---- bundles ----

    /// Register a pack of bundles, evaluated after all earlier packs
    ///
    /// Grows the halos of every input grid to the bundles' read reach.
    pub fn add_bundle_pack(
        &mut self,
        name: &str,
        bundles: Vec<StencilBundle>,
    ) -> Result<(), Error> {
        if self.prepared {
            return Err(Error::InvalidArgument(
                "bundle packs must be added before prepare_solution".into(),
            ));
        }
        let mut indices = Vec::with_capacity(bundles.len());
        for bundle in bundles {
            let domain_names: Vec<&str> =
                self.dims.domain_dims().iter().map(String::as_str).collect();
            if !bundle.halo.same_names(&self.dims.domain_tuple(0)) {
                return Err(Error::InvalidArgument(format!(
                    "bundle `{}` halo must name every domain dimension",
                    bundle.name
                )));
            }
            for &gid in bundle.inputs.iter().chain(&bundle.outputs) {
                if gid >= self.grids.len() {
                    return Err(Error::InvalidArgument(format!(
                        "bundle `{}` refers to unknown grid id {gid}",
                        bundle.name
                    )));
                }
            }
            // Reads reach into neighbor territory, so the inputs need halos
            for &gid in &bundle.inputs {
                for dn in &domain_names {
                    if self.grids[gid].dim(dn).is_some() {
                        let h = bundle.halo.lookup(dn)?;
                        self.grids[gid].update_halo(dn, h, h)?;
                    }
                }
            }
            indices.push(self.bundles.len());
            self.bundles.push(bundle);
        }
        self.packs.push(BundlePack {
            name: name.to_string(),
            bundles: indices,
        });
        Ok(())
    }

    // ---- queries ----

    pub fn get_num_grids(&self) -> usize {
        self.grids.len()
    }

    /// Look up a grid by name
    pub fn get_grid(&self, name: &str) -> Option<&Grid> {
        self.grid_id(name).map(|id| &self.grids[id])
    }

    pub fn grid_id(&self, name: &str) -> Option<GridId> {
        self.grids.iter().position(|g| g.name() == name)
    }

    pub fn grid(&self, id: GridId) -> &Grid {
        &self.grids[id]
    }

    pub fn grid_mut(&mut self, id: GridId) -> &mut Grid {
        &mut self.grids[id]
    }

    pub fn get_step_dim_name(&self) -> &str {
        self.dims.step_dim()
    }

    pub fn get_domain_dim_names(&self) -> &[String] {
        self.dims.domain_dims()
    }

    pub fn get_misc_dim_names(&self) -> &[String] {
        self.dims.misc_dims()
    }

    /// Global index of this rank's first domain point
    pub fn get_first_rank_domain_index(&self, dim: &str) -> Result<i64, Error> {
        self.require_prepared("get_first_rank_domain_index")?;
        self.dims
            .check_kind(dim, "get_first_rank_domain_index", false, true, false)?;
        Ok(self.rank_domain_offsets.lookup(dim)?)
    }

    /// Global index of this rank's last domain point
    pub fn get_last_rank_domain_index(&self, dim: &str) -> Result<i64, Error> {
        self.require_prepared("get_last_rank_domain_index")?;
        self.dims
            .check_kind(dim, "get_last_rank_domain_index", false, true, false)?;
        Ok(self.rank_domain_offsets.lookup(dim)? + self.settings.rank_domain_sizes.lookup(dim)?
            - 1)
    }

    /// Domain size summed over all ranks
    pub fn get_overall_domain_size(&self, dim: &str) -> Result<i64, Error> {
        self.require_prepared("get_overall_domain_size")?;
        self.dims
            .check_kind(dim, "get_overall_domain_size", false, true, false)?;
        Ok(self.overall_domain_sizes.lookup(dim)?)
    }

    fn require_prepared(&self, op: &str) -> Result<(), Error> {
        if !self.prepared {
            return Err(Error::InvalidArgument(format!(
                "{op} requires prepare_solution to have been called"
            )));
        }
        Ok(())
    }

    // ---- prepare / run / end ----

    /// Allocate storage, compute bounding boxes, set up MPI data and
    /// thread pools; must precede `run_solution`
    pub fn prepare_solution(&mut self) -> Result<(), Error> {
        // Gather per-rank disagreements into one error before aborting
        let mut mismatches = Vec::new();
        let mut check = |env: &KernelEnv, val: i64, descr: String| {
            if let Err(Error::ConfigurationMismatch(m)) =
                env.assert_equality_over_ranks(val, &descr)
            {
                mismatches.push(m);
            }
        };
        for d in self.dims.domain_dims() {
            check(
                &self.env,
                self.settings.rank_domain_sizes.lookup(d)?,
                format!("rank-domain size in `{d}`"),
            );
            check(
                &self.env,
                self.settings.num_ranks.lookup(d)?,
                format!("rank count in `{d}`"),
            );
        }
        check(&self.env, self.settings.region_steps, "region step depth".into());
        check(&self.env, self.settings.step_alloc, "step allocation".into());
        if !mismatches.is_empty() {
            return Err(Error::ConfigurationMismatch(mismatches.join("; ")));
        }

        let mpi_info = MpiInfo::new(&self.env, &self.settings.num_ranks)?;

        // This rank's place in the overall problem
        let mut offsets = IdxTuple::new();
        let mut overall = IdxTuple::new();
        for d in self.dims.domain_dims() {
            let size = self.settings.rank_domain_sizes.lookup(d)?;
            let coord = mpi_info.my_coords.lookup(d)?;
            offsets.push(d.as_str(), coord * size);
            overall.push(d.as_str(), size * self.settings.num_ranks.lookup(d)?);
        }
        self.rank_domain_offsets = offsets.clone();
        self.overall_domain_sizes = overall;

        // Maximum halos and wave-front geometry
        let mut max_halos = self.dims.domain_tuple(0);
        for bundle in &self.bundles {
            max_halos = max_halos.max_with(&bundle.halo)?;
        }
        self.max_halos = max_halos.clone();
        self.num_wf_shifts = if self.packs.is_empty() {
            0
        } else {
            (self.settings.region_steps - 1).max(0)
        };
        let shifts = self.num_wf_shifts;
        self.wf_angles = if shifts > 0 {
            max_halos.clone()
        } else {
            self.dims.domain_tuple(0)
        };
        self.left_wf_exts = self.wf_angles.map(|a| a * shifts);
        self.right_wf_exts = self.left_wf_exts.clone();

        let rank_end = offsets.add(&self.settings.rank_domain_sizes.clone())?;
        self.rank_bb = BoundingBox::new(offsets.clone(), rank_end.clone());
        self.ext_bb = BoundingBox::new(
            offsets.sub(&self.left_wf_exts)?,
            rank_end.add(&self.right_wf_exts)?,
        );

        // Freeze grid shapes: apply settings, offsets, wave-front pads
        let domain_names: Vec<String> = self.dims.domain_dims().to_vec();
        for grid in &mut self.grids {
            if grid.is_fixed_size() || grid.has_storage() {
                continue;
            }
            for d in &domain_names {
                if grid.dim(d).is_none() {
                    continue;
                }
                grid.set_domain_size(d, self.settings.rank_domain_sizes.lookup(d)?)?;
                grid.set_first_rank_index(d, self.rank_domain_offsets.lookup(d)?)?;
                let pad = self.settings.min_pad_sizes.lookup(d)?;
                let left = pad + self.left_wf_exts.lookup(d)?;
                let right = pad + self.right_wf_exts.lookup(d)?;
                grid.set_min_extra_pad(d, left, right)?;
            }
        }

        // Allocate grid storage that is not already shared in
        let mut total_bytes = 0usize;
        for grid in &mut self.grids {
            if !grid.has_storage() {
                grid.alloc_storage(self.settings.numa_pref, self.settings.buf_pad_mult)?;
            }
            total_bytes += grid.storage_bytes();
        }

        self.mpi_info = Some(mpi_info);
        self.alloc_mpi_data()?;

        let pools = ThreadPools::new(
            self.settings.num_region_threads(),
            self.settings.num_block_threads,
        )?;
        self.alloc_scratch_data(pools.num_thread_slots())?;

        self.stats.num_elements = self.overall_domain_sizes.product();
        self.prepared = true;

        log::info!(
            "solution `{}` (id {}) prepared: rank {}/{}, domain ({}), {} grids, {} in {} packs, \
             {} region x {} block threads, {} of storage",
            self.name,
            self.id,
            self.env.rank_index(),
            self.env.num_ranks(),
            self.settings.rank_domain_sizes,
            self.grids.len(),
            match self.bundles.len() {
                1 => "1 bundle".to_string(),
                n => format!("{n} bundles"),
            },
            self.packs.len(),
            pools.num_outer(),
            pools.num_inner(),
            byte_str(total_bytes),
        );
        log::debug!(
            "folds ({}), clusters ({})",
            self.folds,
            self.cluster_mults
        );
        self.pools = Some(pools);
        if self.num_wf_shifts > 0 {
            log::info!(
                "wave-fronts: {} shifts, angles ({}), extended BB {}",
                self.num_wf_shifts,
                self.wf_angles,
                self.ext_bb,
            );
        }
        Ok(())
    }

    /// Per-thread scratch grids sized for the worst-case work tile
    fn alloc_scratch_data(&mut self, num_slots: usize) -> Result<(), Error> {
        self.scratch_ranges.clear();
        let mut count = 0usize;
        for bundle in &self.bundles {
            self.scratch_ranges.push((count, bundle.scratch.len()));
            count += bundle.scratch.len();
        }
        let ext_lens = self.ext_bb.len();
        let region_sizes = self.settings.adjusted_region_sizes(&ext_lens);
        self.scratch = (0..num_slots)
            .map(|_| -> Result<Mutex<Vec<Grid>>, Error> {
                let mut grids = Vec::with_capacity(count);
                for bundle in &self.bundles {
                    for spec in &bundle.scratch {
                        let mut dims = Vec::new();
                        for (d, len) in region_sizes.iter() {
                            dims.push(GridDim::domain(d, len, self.folds.lookup(d)?));
                        }
                        let mut grid = Grid::new(&spec.name, dims);
                        for (d, h) in spec.halo.iter() {
                            grid.update_halo(d, h, h)?;
                        }
                        grid.alloc_storage(self.settings.numa_pref, self.settings.buf_pad_mult)?;
                        grids.push(grid);
                    }
                }
                Ok(Mutex::new(grids))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    /// Advance all packs over the step range `[t0, t1)`
    pub fn run_solution(&mut self, t0: i64, t1: i64) -> Result<(), Error> {
        if self.broken {
            return Err(Error::CommFailed(
                "solution is unusable after a prior communication failure".into(),
            ));
        }
        self.require_prepared("run_solution")?;
        if t1 < t0 {
            return Err(Error::InvalidArgument(format!(
                "step range [{t0}, {t1}) is reversed"
            )));
        }
        let rt = self.settings.region_steps.max(1);
        let mut t = t0;
        while t < t1 {
            let stop = (t + rt).min(t1);
            let chunk_began = Instant::now();
            if let Err(e) = engine::calc_rank_opt(self, t, stop) {
                if matches!(e, Error::CommFailed(_)) {
                    self.broken = true;
                }
                return Err(e);
            }
            let secs = chunk_began.elapsed().as_secs_f64();
            self.stats.num_steps_done += stop - t;
            self.stats.elapsed_run_secs += secs;
            if !self.tuner.is_done() {
                let region_sizes = self
                    .settings
                    .adjusted_region_sizes(&self.ext_bb.len());
                self.tuner
                    .eval(&mut self.settings, &region_sizes, stop - t, secs);
            }
            t = stop;
        }
        Ok(())
    }

    /// Advance using the unblocked reference scan (the validation oracle)
    pub fn run_solution_ref(&mut self, t0: i64, t1: i64) -> Result<(), Error> {
        if self.broken {
            return Err(Error::CommFailed(
                "solution is unusable after a prior communication failure".into(),
            ));
        }
        self.require_prepared("run_solution_ref")?;
        if t1 < t0 {
            return Err(Error::InvalidArgument(format!(
                "step range [{t0}, {t1}) is reversed"
            )));
        }
        let chunk_began = Instant::now();
        engine::calc_rank_ref(self, t0, t1)?;
        self.stats.num_steps_done += t1 - t0;
        self.stats.elapsed_run_secs += chunk_began.elapsed().as_secs_f64();
        Ok(())
    }

    /// Release storage and communication resources
    pub fn end_solution(&mut self) {
        for grid in &mut self.grids {
            grid.release_storage();
        }
        self.scratch.clear();
        self.mpi_bufs.clear();
        self.pools = None;
        self.prepared = false;
        self.env.global_barrier();
    }

    // ---- storage sharing ----

    /// Adopt the storage of every same-named grid of `source`
    ///
    /// Shapes, folds and step allocations must match exactly.
    pub fn share_grid_storage(&mut self, source: &Solution) -> Result<(), Error> {
        for grid in &mut self.grids {
            let Some(src_id) = source.grid_id(grid.name()) else {
                continue;
            };
            grid.share_storage_from(&source.grids[src_id])?;
        }
        Ok(())
    }

    // ---- seeding & validation ----

    /// Set all elements of every grid to one per-grid value
    pub fn init_same(&mut self) -> Result<(), Error> {
        for (i, grid) in self.grids.iter_mut().enumerate() {
            grid.set_all_same(0.1 * (i + 1) as Precision)?;
            grid.set_dirty_all(true);
        }
        Ok(())
    }

    /// Fill every grid with a deterministic per-element sequence
    pub fn init_diff(&mut self) -> Result<(), Error> {
        for (i, grid) in self.grids.iter_mut().enumerate() {
            grid.set_all_in_seq(0.01 * (i + 1) as Precision)?;
            grid.set_dirty_all(true);
        }
        Ok(())
    }

    /// Count mismatching elements against paired grids of another solution
    pub fn compare_data(&self, other: &Solution, eps: Precision) -> Result<usize, Error> {
        let mut mismatches = 0;
        for grid in &self.grids {
            let Some(other_id) = other.grid_id(grid.name()) else {
                continue;
            };
            mismatches += grid.compare(&other.grids[other_id], eps)?;
        }
        Ok(mismatches)
    }

    // ---- statistics ----

    /// Statistics gathered since the previous call; clears the counters
    pub fn get_stats(&mut self) -> Stats {
        let stats = self.stats.clone();
        if stats.num_steps_done > 0 {
            log::info!(
                "solution `{}`: {} steps in {:.3}s ({} writes/s)",
                self.name,
                stats.num_steps_done,
                stats.elapsed_run_secs,
                num_str(stats.num_writes as f64 / stats.elapsed_run_secs.max(1e-9)),
            );
        }
        self.clear_timers();
        stats
    }

    /// Reset the work and timing counters without reading them
    pub fn clear_timers(&mut self) {
        self.stats.num_writes = 0;
        self.stats.est_fp_ops = 0;
        self.stats.num_steps_done = 0;
        self.stats.elapsed_run_secs = 0.0;
        self.stats.elapsed_mpi_secs = 0.0;
    }

    // ---- auto-tuner ----

    /// Restart (or disable) the auto-tuner for subsequent runs
    pub fn reset_auto_tuner(&mut self, enable: bool, verbose: bool) {
        self.tuner.clear(!enable, verbose);
    }

    pub fn is_auto_tuner_enabled(&self) -> bool {
        !self.tuner.is_done()
    }

    /// Run the solution in place until the auto-tuner search finishes
    ///
    /// Grid contents are advanced (and overwritten) while tuning.
    pub fn run_auto_tuner_now(&mut self, verbose: bool) -> Result<(), Error> {
        self.require_prepared("run_auto_tuner_now")?;
        self.reset_auto_tuner(true, verbose);
        let rt = self.settings.region_steps.max(1);
        let mut t = 0;
        const MAX_CHUNKS: usize = 100_000;
        for _ in 0..MAX_CHUNKS {
            if self.tuner.is_done() {
                return Ok(());
            }
            self.run_solution(t, t + rt)?;
            t += rt;
        }
        log::warn!("auto-tuner did not converge after {MAX_CHUNKS} chunks");
        Ok(())
    }
}

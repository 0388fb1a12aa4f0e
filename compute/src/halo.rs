//! Halo exchange between ranks
//!
//! Before any bundle that reads a grid runs, the grid's halo regions must
//! be consistent with the neighbor ranks that own them. Neighbors are
//! derived from the configured n-D rank grid; each (grid, direction) pair
//! gets a send/recv buffer pair sized by the domain face times the halo
//! thickness. Transfers are matched by a deterministic tag, so the
//! protocol is insensitive to arrival order, and the pack's interior runs
//! while transfers are in flight.

use crate::solution::Solution;
use crate::Error;
use data::alloc::AllocBuf;
use data::bbox::BoundingBox;
use data::dims::{div_floor, imod, round_up, DimKind, IdxTuple};
use data::grid::{Grid, GridId};
use data::{Precision, ELEMENT_BYTES};

/// One entry of the neighbor table
#[derive(Clone, Debug)]
pub struct Neighbor {
    /// Offset in {-1, 0, +1} per domain dimension
    pub offsets: IdxTuple,
    /// Owning rank, or None past the edge of the rank grid
    pub rank: Option<usize>,
    /// Base-3 encoding of `offsets`, used in transfer tags
    pub dir_code: usize,
}

/// This rank's place in the rank grid and its neighbor table
#[derive(Clone, Debug)]
pub struct MpiInfo {
    pub rank_grid: IdxTuple,
    pub my_coords: IdxTuple,
    /// All 3^n - 1 directions, in dir-code order
    pub neighbors: Vec<Neighbor>,
}
//
impl MpiInfo {
    pub fn new(env: &crate::KernelEnv, rank_grid: &IdxTuple) -> Result<Self, Error> {
        let total = rank_grid.product();
        if total != env.num_ranks() as i64 {
            return Err(Error::ConfigurationMismatch(format!(
                "rank grid ({rank_grid}) holds {total} ranks but the environment has {}",
                env.num_ranks()
            )));
        }
        let my_coords = coords_of(env.rank_index() as i64, rank_grid);
        let ndims = rank_grid.len();
        let mut neighbors = Vec::with_capacity(3usize.pow(ndims as u32).saturating_sub(1));
        for code in 0..3usize.pow(ndims as u32) {
            let offsets = offsets_of(code, rank_grid);
            if offsets.vals().all(|o| o == 0) {
                continue;
            }
            let coords = my_coords
                .add(&offsets)
                .expect("coords and offsets share dimensions");
            neighbors.push(Neighbor {
                rank: rank_of(&coords, rank_grid).map(|r| r as usize),
                offsets,
                dir_code: code,
            });
        }
        Ok(Self {
            rank_grid: rank_grid.clone(),
            my_coords,
            neighbors,
        })
    }

    /// Is there a neighbor rank on the given side of `dim`?
    pub fn has_neighbor(&self, dim: &str, side: i64) -> bool {
        self.neighbors.iter().any(|n| {
            n.rank.is_some() && n.offsets.get(dim) == Some(side)
                && n.offsets.iter().all(|(d, o)| d == dim || o == 0)
        })
    }
}

/// Decompose a rank index into rank-grid coordinates, first dim slowest
fn coords_of(rank: i64, rank_grid: &IdxTuple) -> IdxTuple {
    let mut rem = rank;
    let mut rev = Vec::with_capacity(rank_grid.len());
    for i in (0..rank_grid.len()).rev() {
        let n = rank_grid.val_at(i).max(1);
        rev.push((rank_grid.name_at(i).to_string(), imod(rem, n)));
        rem = div_floor(rem, n);
    }
    IdxTuple::from_pairs(rev.into_iter().rev())
}

/// Compose rank-grid coordinates back into a rank index
fn rank_of(coords: &IdxTuple, rank_grid: &IdxTuple) -> Option<i64> {
    let mut rank = 0i64;
    for i in 0..rank_grid.len() {
        let n = rank_grid.val_at(i);
        let c = coords.val_at(i);
        if c < 0 || c >= n {
            return None;
        }
        rank = rank * n + c;
    }
    Some(rank)
}

/// Decode a base-3 direction code into per-dim offsets in {-1, 0, +1}
fn offsets_of(code: usize, rank_grid: &IdxTuple) -> IdxTuple {
    let ndims = rank_grid.len();
    let mut digits = vec![0i64; ndims];
    let mut rem = code;
    for d in (0..ndims).rev() {
        digits[d] = (rem % 3) as i64 - 1;
        rem /= 3;
    }
    IdxTuple::from_pairs(
        (0..ndims).map(|d| (rank_grid.name_at(d).to_string(), digits[d])),
    )
}

/// Direction code of the opposite direction
#[cfg_attr(not(feature = "mpi"), allow(dead_code))]
fn opposite_code(code: usize, ndims: usize) -> usize {
    let mut rem = code;
    let mut out = 0;
    let mut mult = 3usize.pow(ndims as u32);
    for _ in 0..ndims {
        mult /= 3;
        let digit = (rem / mult) % 3;
        out += (2 - digit) * mult;
        rem %= mult;
    }
    out
}

/// Deterministic transfer tag
///
/// Embeds a solution-id nibble so that same-named grids in different
/// solutions sharing a communicator cannot collide, plus a step hash so
/// exchanges for different steps stay apart.
#[cfg_attr(not(feature = "mpi"), allow(dead_code))]
fn halo_tag(solution_id: usize, grid_id: GridId, dir_code: usize, step: i64) -> i32 {
    let step_hash = imod(step, 64) as i32;
    (((solution_id & 0xF) as i32) << 24)
        | (step_hash << 16)
        | (((grid_id * 27 + dir_code) & 0xFFFF) as i32)
}

/// Send/recv faces of one grid toward one neighbor, or None when the
/// grid has no face there (zero halo or missing dimension)
///
/// The send face is the slab of owned domain the neighbor's halo mirrors;
/// the recv face is this rank's halo slab. With vectorized exchange the
/// faces are expanded to whole vector clusters.
fn halo_boxes(
    grid: &Grid,
    offsets: &IdxTuple,
    vec_exchange: bool,
) -> Result<Option<(BoundingBox, BoundingBox)>, Error> {
    // A neighbor offset in a dimension this grid does not span means the
    // grid is replicated there; nothing to exchange.
    if offsets
        .iter()
        .any(|(d, o)| o != 0 && grid.dim(d).is_none())
    {
        return Ok(None);
    }
    let mut send_begin = IdxTuple::new();
    let mut send_end = IdxTuple::new();
    let mut recv_begin = IdxTuple::new();
    let mut recv_end = IdxTuple::new();
    for dim in grid.dims() {
        if dim.kind() == DimKind::Step {
            continue;
        }
        let first = dim.first_rank_idx();
        let size = dim.size();
        let offset = if dim.kind() == DimKind::Domain {
            offsets.get(dim.name()).unwrap_or(0)
        } else {
            0
        };
        let (sb, se, rb, re) = match offset {
            0 => (first, first + size, first, first + size),
            -1 => (
                first,
                first + dim.right_halo(),
                first - dim.left_halo(),
                first,
            ),
            1 => (
                first + size - dim.left_halo(),
                first + size,
                first + size,
                first + size + dim.right_halo(),
            ),
            _ => return Ok(None),
        };
        let (mut sb, mut se, mut rb, mut re) = (sb, se, rb, re);
        if vec_exchange && dim.fold() > 1 {
            let fold = dim.fold();
            sb = div_floor(sb, fold) * fold;
            se = round_up(se, fold);
            rb = div_floor(rb, fold) * fold;
            re = round_up(re, fold);
        }
        if sb >= se || rb >= re {
            return Ok(None);
        }
        send_begin.push(dim.name(), sb);
        send_end.push(dim.name(), se);
        recv_begin.push(dim.name(), rb);
        recv_end.push(dim.name(), re);
    }
    if send_begin.is_empty() {
        return Ok(None);
    }
    Ok(Some((
        BoundingBox::new(send_begin, send_end),
        BoundingBox::new(recv_begin, recv_end),
    )))
}

/// Send/recv buffer pair for one (grid, neighbor) combination
pub struct HaloBuffers {
    pub grid: GridId,
    pub neighbor_idx: usize,
    pub send_box: BoundingBox,
    pub recv_box: BoundingBox,
    pub send: AllocBuf,
    pub recv: AllocBuf,
}
//
impl Solution {
    /// (Re)allocate halo buffers; called from `prepare_solution`
    ///
    /// Also verifies, collectively, that every rank computed the same
    /// buffer shapes; disagreement means the per-rank grid settings
    /// differ and is reported as a configuration mismatch.
    pub(crate) fn alloc_mpi_data(&mut self) -> Result<(), Error> {
        self.mpi_bufs.clear();
        let Some(info) = self.mpi_info.clone() else {
            return Ok(());
        };
        let mut checksum = 0i64;
        if self.settings.enable_halo_exchange && self.env.num_ranks() > 1 {
            for gid in 0..self.grids.len() {
                if self.grids[gid].is_fixed_size() {
                    continue;
                }
                for (ni, neighbor) in info.neighbors.iter().enumerate() {
                    let Some(boxes) = halo_boxes(
                        &self.grids[gid],
                        &neighbor.offsets,
                        self.settings.allow_vec_exchange,
                    )?
                    else {
                        continue;
                    };
                    let (send_box, recv_box) = boxes;
                    checksum += (send_box.size() + recv_box.size())
                        * (gid as i64 + 1)
                        * (neighbor.dir_code as i64 + 1);
                    if neighbor.rank.is_none() {
                        continue;
                    }
                    let send =
                        AllocBuf::new(send_box.size() as usize * ELEMENT_BYTES, self.settings.numa_pref)?;
                    let recv =
                        AllocBuf::new(recv_box.size() as usize * ELEMENT_BYTES, self.settings.numa_pref)?;
                    self.mpi_bufs.push(HaloBuffers {
                        grid: gid,
                        neighbor_idx: ni,
                        send_box,
                        recv_box,
                        send,
                        recv,
                    });
                }
            }
        }
        self.env
            .assert_equality_over_ranks(checksum, "halo buffer shapes")?;
        if !self.mpi_bufs.is_empty() {
            let bytes: usize = self
                .mpi_bufs
                .iter()
                .map(|b| b.send.len() + b.recv.len())
                .sum();
            log::info!(
                "halo exchange: {} buffer pairs, {}",
                self.mpi_bufs.len(),
                data::byte_str(bytes)
            );
        }
        Ok(())
    }

    /// Stale margins of the work box, per side, where neighbors exist
    ///
    /// Points further than these margins from every rank boundary form
    /// the interior that can run while transfers are in flight. With
    /// wave-fronts the margin also covers the extension, since those
    /// points read exchanged data too.
    pub(crate) fn exchange_margins(&self) -> (IdxTuple, IdxTuple) {
        let mut left = self.dims.domain_tuple(0);
        let mut right = self.dims.domain_tuple(0);
        if let Some(info) = &self.mpi_info {
            for d in self.dims.domain_dims() {
                let h = self.max_halos.get(d).unwrap_or(0);
                if info.has_neighbor(d, -1) {
                    let _ = left.set(d, h + self.left_wf_exts.get(d).unwrap_or(0));
                }
                if info.has_neighbor(d, 1) {
                    let _ = right.set(d, h + self.right_wf_exts.get(d).unwrap_or(0));
                }
            }
        }
        (left, right)
    }

    /// Make the halos a pack reads consistent, blocking until done
    pub(crate) fn exchange_halos(&mut self, pack_idx: usize, t0: i64, t1: i64) -> Result<(), Error> {
        self.exchange_halos_overlapped(pack_idx, t0, t1, |_| Ok(()))
    }

    /// Exchange halos for a pack over `[t0, t1)`, running `interior`
    /// while the transfers are in flight
    ///
    /// Steps: find stale (grid, step) pairs the pack reads, pack send
    /// buffers, post non-blocking receives and sends, run `interior`,
    /// wait, unpack into the halo regions, clear the dirty flags. The
    /// caller runs the exterior afterwards.
    pub(crate) fn exchange_halos_overlapped(
        &mut self,
        pack_idx: usize,
        t0: i64,
        t1: i64,
        interior: impl FnOnce(&Solution) -> Result<(), Error>,
    ) -> Result<(), Error> {
        if !self.settings.enable_halo_exchange {
            return interior(self);
        }
        let mut stale: Vec<(GridId, i64)> = Vec::new();
        for &bi in &self.packs[pack_idx].bundles {
            for &gid in &self.bundles[bi].inputs {
                for t in t0..t1 {
                    if self.grids[gid].is_dirty(t) && !stale.contains(&(gid, t)) {
                        stale.push((gid, t));
                    }
                }
            }
        }
        let result = self.do_exchange(&stale, interior);
        if result.is_ok() {
            for &(gid, t) in &stale {
                self.grids[gid].set_dirty(t, false);
            }
        }
        result
    }
}

/// Without distributed support there is nothing to transfer; the interior
/// is simply the whole work box
#[cfg(not(feature = "mpi"))]
impl Solution {
    fn do_exchange(
        &mut self,
        _stale: &[(GridId, i64)],
        interior: impl FnOnce(&Solution) -> Result<(), Error>,
    ) -> Result<(), Error> {
        interior(self)
    }
}

#[cfg(feature = "mpi")]
mod transport {
    use super::*;
    use mpi::request::RequestCollection;
    use mpi::traits::*;
    use std::time::Instant;

    impl Solution {
        pub(super) fn do_exchange(
            &mut self,
            stale: &[(GridId, i64)],
            interior: impl FnOnce(&Solution) -> Result<(), Error>,
        ) -> Result<(), Error> {
            let began = Instant::now();
            let transfers: Vec<(usize, i64)> = self
                .mpi_bufs
                .iter()
                .enumerate()
                .flat_map(|(i, hb)| {
                    stale
                        .iter()
                        .filter(|(gid, _)| *gid == hb.grid)
                        .map(|&(_, t)| (i, t))
                        .collect::<Vec<_>>()
                })
                .collect();
            self.pack_send_buffers(&transfers)?;
            self.transfer(&transfers, interior)?;
            self.unpack_recv_buffers(&transfers)?;
            self.stats.elapsed_mpi_secs += began.elapsed().as_secs_f64();
            Ok(())
        }

        /// Copy owned faces into the send buffers
        fn pack_send_buffers(&mut self, transfers: &[(usize, i64)]) -> Result<(), Error> {
            let step_dim = self.dims.step_dim().to_string();
            let (grids, bufs) = (&self.grids, &mut self.mpi_bufs);
            for &(buf_idx, t) in transfers {
                let hb = &mut bufs[buf_idx];
                let grid = &grids[hb.grid];
                let dst: &mut [Precision] = bytemuck::cast_slice_mut(
                    &mut hb.send.as_mut_slice()[..hb.send_box.size() as usize * ELEMENT_BYTES],
                );
                let mut k = 0usize;
                data::dims::for_each_in(&hb.send_box.begin, &hb.send_box.end, |pt| {
                    dst[k] = grid.read_elem(&with_step(pt, grid, &step_dim, t))?;
                    k += 1;
                    Ok::<(), Error>(())
                })?;
            }
            Ok(())
        }

        /// Post receives and sends, run `interior`, then wait for all
        fn transfer(
            &mut self,
            transfers: &[(usize, i64)],
            interior: impl FnOnce(&Solution) -> Result<(), Error>,
        ) -> Result<(), Error> {
            let this: &Solution = self;
            let Some(info) = &this.mpi_info else {
                return interior(this);
            };
            let ndims = this.dims.domain_dims().len();
            let world = this.env.world();
            mpi::request::multiple_scope(
                2 * transfers.len(),
                |scope, coll: &mut RequestCollection<'_, [Precision]>| {
                    for &(buf_idx, t) in transfers {
                        let hb = &this.mpi_bufs[buf_idx];
                        let neighbor = &info.neighbors[hb.neighbor_idx];
                        let Some(rank) = neighbor.rank else { continue };
                        let process = world.process_at_rank(rank as i32);
                        // The partner tags its send with the direction as
                        // it sees it, which is the opposite of ours.
                        let recv_tag = halo_tag(
                            this.id,
                            hb.grid,
                            opposite_code(neighbor.dir_code, ndims),
                            t,
                        );
                        let send_tag = halo_tag(this.id, hb.grid, neighbor.dir_code, t);
                        // SAFETY: halo buffers are owned by the halo
                        // engine; compute never touches them, so forming
                        // these slices while `this` is shared cannot alias
                        // an active reference.
                        let recv: &mut [Precision] = unsafe {
                            std::slice::from_raw_parts_mut(
                                hb.recv.as_ptr() as *mut Precision,
                                hb.recv_box.size() as usize,
                            )
                        };
                        let send: &[Precision] = unsafe {
                            std::slice::from_raw_parts(
                                hb.send.as_ptr() as *const Precision,
                                hb.send_box.size() as usize,
                            )
                        };
                        coll.add(process.immediate_receive_into_with_tag(scope, recv, recv_tag));
                        coll.add(process.immediate_send_with_tag(scope, send, send_tag));
                    }
                    // Interior computation overlaps the transfers
                    let result = interior(this);
                    let mut statuses = Vec::with_capacity(coll.incomplete());
                    coll.wait_all(&mut statuses);
                    result
                },
            )
        }

        /// Copy received data into the halo regions
        fn unpack_recv_buffers(&mut self, transfers: &[(usize, i64)]) -> Result<(), Error> {
            let step_dim = self.dims.step_dim().to_string();
            for &(buf_idx, t) in transfers {
                let (grids, bufs) = (&mut self.grids, &self.mpi_bufs);
                let hb = &bufs[buf_idx];
                let src: &[Precision] = bytemuck::cast_slice(
                    &hb.recv.as_slice()[..hb.recv_box.size() as usize * ELEMENT_BYTES],
                );
                let grid = &mut grids[hb.grid];
                let mut k = 0usize;
                data::dims::for_each_in(&hb.recv_box.begin, &hb.recv_box.end, |pt| {
                    let idx = with_step(pt, grid, &step_dim, t);
                    grid.write_elem(&idx, src[k])?;
                    k += 1;
                    Ok::<(), Error>(())
                })?;
            }
            Ok(())
        }
    }

    /// Face point plus the step coordinate, when the grid has a step dim
    fn with_step(pt: &IdxTuple, grid: &Grid, step_dim: &str, t: i64) -> IdxTuple {
        let mut idx = pt.clone();
        if grid.dim(step_dim).is_some() {
            idx.push(step_dim, t);
        }
        idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::grid::GridDim;

    #[test]
    fn single_rank_has_no_neighbors() {
        let env = crate::KernelEnv::new().unwrap();
        let rank_grid = IdxTuple::from_pairs([("x", 1), ("y", 1)]);
        let info = MpiInfo::new(&env, &rank_grid).unwrap();
        assert_eq!(info.neighbors.len(), 8);
        assert!(info.neighbors.iter().all(|n| n.rank.is_none()));
        assert!(!info.has_neighbor("x", -1));
    }

    #[test]
    fn rank_grid_mismatch_detected() {
        let env = crate::KernelEnv::new().unwrap();
        let rank_grid = IdxTuple::from_pairs([("x", 2)]);
        assert!(matches!(
            MpiInfo::new(&env, &rank_grid),
            Err(Error::ConfigurationMismatch(_))
        ));
    }

    #[test]
    fn coords_round_trip() {
        let shape = IdxTuple::from_pairs([("x", 3), ("y", 4)]);
        for rank in 0..12 {
            let coords = coords_of(rank, &shape);
            assert_eq!(rank_of(&coords, &shape), Some(rank));
        }
        // First dim is the slowest
        assert_eq!(coords_of(5, &shape), IdxTuple::from_pairs([("x", 1), ("y", 1)]));
        // Outside the grid there is no rank
        let outside = IdxTuple::from_pairs([("x", 3), ("y", 0)]);
        assert_eq!(rank_of(&outside, &shape), None);
    }

    #[test]
    fn opposite_codes_cancel() {
        let shape = IdxTuple::from_pairs([("x", 3), ("y", 3)]);
        for code in 0..9 {
            let o = offsets_of(code, &shape);
            let opp = offsets_of(opposite_code(code, 2), &shape);
            assert_eq!(o.add(&opp).unwrap(), shape.map(|_| 0));
        }
    }

    #[test]
    fn tags_are_deterministic_and_distinct() {
        let a = halo_tag(1, 3, 4, 7);
        assert_eq!(a, halo_tag(1, 3, 4, 7));
        assert_ne!(a, halo_tag(2, 3, 4, 7));
        assert_ne!(a, halo_tag(1, 4, 4, 7));
        assert_ne!(a, halo_tag(1, 3, 5, 7));
        assert_ne!(a, halo_tag(1, 3, 4, 8));
        assert!(a >= 0);
    }

    #[test]
    fn face_boxes_match_halos() {
        let mut g = Grid::new(
            "a",
            vec![GridDim::step("t", 2), GridDim::domain("x", 8, 1), GridDim::domain("y", 4, 1)],
        );
        g.update_halo("x", 1, 2).unwrap();
        g.update_halo("y", 1, 1).unwrap();

        // Left neighbor in x: send the slab the neighbor's right halo
        // mirrors, receive into our left halo
        let off = IdxTuple::from_pairs([("x", -1), ("y", 0)]);
        let (send, recv) = halo_boxes(&g, &off, false).unwrap().unwrap();
        assert_eq!(send.begin.get("x"), Some(0));
        assert_eq!(send.end.get("x"), Some(2)); // right halo thickness
        assert_eq!(recv.begin.get("x"), Some(-1));
        assert_eq!(recv.end.get("x"), Some(0)); // left halo thickness
        // Orthogonal dim covers the whole face
        assert_eq!(send.begin.get("y"), Some(0));
        assert_eq!(send.end.get("y"), Some(4));

        // Zero-halo direction has no face
        let mut flat = Grid::new("b", vec![GridDim::domain("x", 8, 1)]);
        flat.update_halo("x", 0, 0).unwrap();
        let off = IdxTuple::from_pairs([("x", -1)]);
        assert!(halo_boxes(&flat, &off, false).unwrap().is_none());
    }

    #[test]
    fn vectorized_faces_are_cluster_multiples() {
        let mut g = Grid::new("a", vec![GridDim::domain("x", 16, 4)]);
        g.update_halo("x", 1, 1).unwrap();
        let off = IdxTuple::from_pairs([("x", 1)]);
        let (send, recv) = halo_boxes(&g, &off, true).unwrap().unwrap();
        // Faces expand to whole folds
        assert_eq!(send.len().get("x"), Some(4));
        assert_eq!(recv.len().get("x"), Some(4));
        let folds = IdxTuple::from_pairs([("x", 4)]);
        assert!(send.is_aligned(&folds));
        assert!(recv.is_aligned(&folds));
    }
}

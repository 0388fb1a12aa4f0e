//! The blocked scan driver
//!
//! Four nested spatial levels, coarsest first: regions are evaluated one
//! at a time and hold the thread pool; blocks within a region run on the
//! outer threads; sub-blocks within a block run on the nested inner
//! threads; the vector cluster below that belongs to the compiled kernel.
//! When a region advances more than one step, the per-step work tiles are
//! skewed by the wave-front angles so cached data is reused across steps
//! and halos are exchanged once per region instead of once per step.

use crate::bundle::KernelArgs;
use crate::solution::Solution;
use crate::Error;
use data::bbox::BoundingBox;
use data::dims::{div_ceil, for_each_in, IdxTuple};
use data::grid::GridId;

/// Evaluate every pack on every region tile for the step chunk `[t0, t1)`
pub(crate) fn calc_rank_opt(soln: &mut Solution, t0: i64, t1: i64) -> Result<(), Error> {
    let region_sizes = soln.settings.adjusted_region_sizes(&soln.ext_bb.len());
    let regions = tile_boxes(&soln.ext_bb, &region_sizes)?;
    log::trace!(
        "rank scan [{t0}, {t1}): {} regions of ({region_sizes})",
        regions.len()
    );
    for region_bb in &regions {
        for pack_idx in 0..soln.packs.len() {
            calc_region(soln, pack_idx, region_bb, t0, t1)?;
        }
    }
    Ok(())
}

/// Evaluate one pack on one region tile
///
/// The halo exchange for the whole step chunk happens once here; the
/// first step's interior (points beyond halo reach of every neighbor
/// boundary) runs while the transfers are in flight, its exterior slabs
/// run after they complete, and the remaining wave-front shifts follow.
fn calc_region(
    soln: &mut Solution,
    pack_idx: usize,
    region_bb: &BoundingBox,
    t0: i64,
    t1: i64,
) -> Result<(), Error> {
    let chunk_steps = t1 - t0;
    let first_box = wf_shifted_box(region_bb, &soln.rank_bb, &soln.wf_angles, 0, chunk_steps)?;
    let (interior, exterior) = if soln.settings.overlap_comms {
        let (left_margins, right_margins) = soln.exchange_margins();
        split_interior_exterior(&first_box, &left_margins, &right_margins)?
    } else {
        (first_box.clone(), Vec::new())
    };
    let run_whole_first = !soln.settings.overlap_comms;
    soln.exchange_halos_overlapped(pack_idx, t0, t1, |this| {
        if run_whole_first {
            Ok(())
        } else {
            run_blocks_over(this, pack_idx, std::slice::from_ref(&interior), t0)
        }
    })?;
    if run_whole_first {
        run_blocks_over(soln, pack_idx, std::slice::from_ref(&interior), t0)?;
    }
    run_blocks_over(soln, pack_idx, &exterior, t0)?;
    account_and_mark(soln, pack_idx, &first_box, t0);

    for t in t0 + 1..t1 {
        let shifted = wf_shifted_box(region_bb, &soln.rank_bb, &soln.wf_angles, t - t0, chunk_steps)?;
        if shifted.is_empty() {
            continue;
        }
        run_blocks_over(soln, pack_idx, std::slice::from_ref(&shifted), t)?;
        account_and_mark(soln, pack_idx, &shifted, t);
    }
    Ok(())
}

/// Tile work boxes into blocks and run them on the outer threads
fn run_blocks_over(
    soln: &Solution,
    pack_idx: usize,
    boxes: &[BoundingBox],
    t: i64,
) -> Result<(), Error> {
    let region_sizes = soln.settings.adjusted_region_sizes(&soln.ext_bb.len());
    let block_sizes = soln.settings.adjusted_block_sizes(&region_sizes);
    let pools = soln
        .pools
        .as_ref()
        .ok_or_else(|| Error::InvalidArgument("thread pools not prepared".into()))?;
    for bb in boxes {
        if bb.is_empty() {
            continue;
        }
        let blocks = tile_boxes(bb, &block_sizes)?;
        pools.run_blocks(blocks.len(), |bi, outer_idx| {
            calc_block(soln, pack_idx, &blocks[bi], t, outer_idx)
        })?;
    }
    Ok(())
}

/// Record work counters and mark the pack's outputs dirty at `t + 1`
fn account_and_mark(soln: &mut Solution, pack_idx: usize, bb: &BoundingBox, t: i64) {
    if bb.is_empty() {
        return;
    }
    let (writes, fp_ops, out_grids) = pack_work(soln, pack_idx, bb);
    soln.stats.num_writes += writes;
    soln.stats.est_fp_ops += fp_ops;
    for gid in out_grids {
        soln.grids[gid].set_dirty(t + 1, true);
    }
}

/// Evaluate one pack on one block, sub-blocks nested under one outer thread
fn calc_block(
    soln: &Solution,
    pack_idx: usize,
    block_bb: &BoundingBox,
    t: i64,
    outer_idx: usize,
) -> Result<(), Error> {
    let pools = soln
        .pools
        .as_ref()
        .ok_or_else(|| Error::InvalidArgument("thread pools not prepared".into()))?;
    for &bundle_idx in &soln.packs[pack_idx].bundles {
        let bundle = &soln.bundles[bundle_idx];
        let mut bb = block_bb.clone();
        if let Some(sub_domain) = &bundle.sub_domain {
            bb = bb.intersect(sub_domain);
        }
        if bb.is_empty() {
            continue;
        }
        let sub_sizes = soln.settings.adjusted_sub_block_sizes(&bb.len());
        let subs = tile_boxes(&bb, &sub_sizes)?;
        pools.run_sub_blocks(outer_idx, subs.len(), |si, inner_idx| {
            calc_sub_block(soln, bundle_idx, &subs[si], t, outer_idx, inner_idx)
        })?;
    }
    Ok(())
}

/// Invoke one bundle's compute operation on one sub-block
fn calc_sub_block(
    soln: &Solution,
    bundle_idx: usize,
    bb: &BoundingBox,
    t: i64,
    outer_idx: usize,
    inner_idx: usize,
) -> Result<(), Error> {
    let bundle = &soln.bundles[bundle_idx];
    let slot = (outer_idx * soln.pools.as_ref().map_or(1, |p| p.num_inner()) + inner_idx)
        % soln.scratch.len().max(1);
    let mut guard = soln.scratch[slot]
        .lock()
        .map_err(|_| Error::InvalidArgument("scratch vector lock poisoned".into()))?;
    let (start, len) = soln.scratch_ranges[bundle_idx];
    let scratch = &mut guard[start..start + len];
    // Re-address the scratch grids to the current work tile
    for sg in scratch.iter_mut() {
        for (d, b) in bb.begin.iter() {
            sg.set_first_rank_index(d, b)?;
        }
    }
    (bundle.compute)(KernelArgs {
        grids: &soln.grids,
        scratch,
        begin: bb.begin.clone(),
        end: bb.end.clone(),
        step: t,
    })
}

/// Points and output grids a pack touches within `bb` at one step
fn pack_work(soln: &Solution, pack_idx: usize, bb: &BoundingBox) -> (i64, i64, Vec<GridId>) {
    let mut writes = 0i64;
    let mut fp_ops = 0i64;
    let mut out_grids = Vec::new();
    for &bundle_idx in &soln.packs[pack_idx].bundles {
        let bundle = &soln.bundles[bundle_idx];
        let mut bundle_bb = bb.clone();
        if let Some(sub_domain) = &bundle.sub_domain {
            bundle_bb = bundle_bb.intersect(sub_domain);
        }
        let pts = bundle_bb.size();
        writes += pts * bundle.outputs.len() as i64;
        fp_ops += pts * bundle.fp_ops_per_point as i64;
        for &gid in &bundle.outputs {
            if !out_grids.contains(&gid) {
                out_grids.push(gid);
            }
        }
    }
    (writes, fp_ops, out_grids)
}

/// The non-blocked reference scan: one point at a time, dimension order
///
/// Produces the same result as the optimized scan and serves as the
/// oracle for validation runs.
pub(crate) fn calc_rank_ref(soln: &mut Solution, t0: i64, t1: i64) -> Result<(), Error> {
    for t in t0..t1 {
        for pack_idx in 0..soln.packs.len() {
            soln.exchange_halos(pack_idx, t, t + 1)?;
            let bundle_ids = soln.packs[pack_idx].bundles.clone();
            for bundle_idx in bundle_ids {
                let mut bb = soln.rank_bb.clone();
                if let Some(sub_domain) = &soln.bundles[bundle_idx].sub_domain {
                    bb = bb.intersect(sub_domain);
                }
                if bb.is_empty() {
                    continue;
                }
                {
                    let this: &Solution = soln;
                    let bundle = &this.bundles[bundle_idx];
                    let mut guard = this.scratch[0]
                        .lock()
                        .map_err(|_| Error::InvalidArgument("scratch vector lock poisoned".into()))?;
                    let (start, len) = this.scratch_ranges[bundle_idx];
                    for_each_in(&bb.begin, &bb.end, |pt| {
                        let scratch = &mut guard[start..start + len];
                        for sg in scratch.iter_mut() {
                            for (d, b) in pt.iter() {
                                sg.set_first_rank_index(d, b)?;
                            }
                        }
                        (bundle.compute)(KernelArgs {
                            grids: &this.grids,
                            scratch,
                            begin: pt.clone(),
                            end: pt.map(|v| v + 1),
                            step: t,
                        })
                    })?;
                }
                let (writes, fp_ops, out_grids) = {
                    let bundle = &soln.bundles[bundle_idx];
                    let pts = bb.size();
                    (
                        pts * bundle.outputs.len() as i64,
                        pts * bundle.fp_ops_per_point as i64,
                        bundle.outputs.clone(),
                    )
                };
                soln.stats.num_writes += writes;
                soln.stats.est_fp_ops += fp_ops;
                for gid in out_grids {
                    soln.grids[gid].set_dirty(t + 1, true);
                }
            }
        }
    }
    Ok(())
}

/// Split `[bb]` into tiles of at most `sizes` per dimension
pub(crate) fn tile_boxes(bb: &BoundingBox, sizes: &IdxTuple) -> Result<Vec<BoundingBox>, Error> {
    if bb.is_empty() {
        return Ok(Vec::new());
    }
    let lens = bb.len();
    let counts: Vec<i64> = lens
        .iter()
        .map(|(name, len)| {
            let size = sizes.get(name).unwrap_or(len).max(1);
            div_ceil(len, size)
        })
        .collect();
    let mut tiles = Vec::with_capacity(counts.iter().product::<i64>() as usize);
    let ndims = counts.len();
    let mut cursor = vec![0i64; ndims];
    loop {
        let mut begin = IdxTuple::new();
        let mut end = IdxTuple::new();
        for (d, (name, len)) in lens.iter().enumerate() {
            let size = sizes.get(name).unwrap_or(len).max(1);
            let b = bb.begin.val_at(d) + cursor[d] * size;
            begin.push(name, b);
            end.push(name, (b + size).min(bb.end.val_at(d)));
        }
        tiles.push(BoundingBox::new(begin, end));

        // Odometer over tile counts, innermost dimension fastest
        let mut d = ndims;
        loop {
            if d == 0 {
                return Ok(tiles);
            }
            d -= 1;
            cursor[d] += 1;
            if cursor[d] < counts[d] {
                break;
            }
            cursor[d] = 0;
        }
    }
}

/// Per-step work tile of a wave-front region
///
/// The region is displaced by the skewing angles once per step-shift, then
/// clipped to the part of the extended rank box that later shifts can
/// still feed: `remaining` shifts after this one allow an extension of
/// `angle * remaining` beyond the rank domain.
pub(crate) fn wf_shifted_box(
    region_bb: &BoundingBox,
    rank_bb: &BoundingBox,
    angles: &IdxTuple,
    shift: i64,
    chunk_steps: i64,
) -> Result<BoundingBox, Error> {
    let translated = BoundingBox::new(
        region_bb.begin.zip_with(angles, |b, a| b - a * shift)?,
        region_bb.end.zip_with(angles, |e, a| e - a * shift)?,
    );
    let remaining = (chunk_steps - 1 - shift).max(0);
    let allowed = BoundingBox::new(
        rank_bb.begin.zip_with(angles, |b, a| b - a * remaining)?,
        rank_bb.end.zip_with(angles, |e, a| e + a * remaining)?,
    );
    Ok(translated.intersect(&allowed))
}

/// Split a box into the interior (shrunk by the margins) and the
/// near-boundary exterior slabs
///
/// The interior can be computed while halo transfers are in flight; the
/// slabs wait for the transfers. Together the returned boxes cover `bb`
/// exactly once.
pub(crate) fn split_interior_exterior(
    bb: &BoundingBox,
    left_margins: &IdxTuple,
    right_margins: &IdxTuple,
) -> Result<(BoundingBox, Vec<BoundingBox>), Error> {
    let mut slabs = Vec::new();
    let mut remaining = bb.clone();
    for (d, _) in bb.begin.iter().collect::<Vec<_>>() {
        let left = left_margins.get(d).unwrap_or(0).max(0);
        let right = right_margins.get(d).unwrap_or(0).max(0);
        let begin = remaining.begin.lookup(d)?;
        let end = remaining.end.lookup(d)?;
        if left > 0 {
            let mut slab = remaining.clone();
            slab.end.set(d, (begin + left).min(end))?;
            let slab = BoundingBox::new(slab.begin, slab.end);
            if !slab.is_empty() {
                slabs.push(slab);
            }
            remaining.begin.set(d, (begin + left).min(end))?;
        }
        if right > 0 {
            let begin = remaining.begin.lookup(d)?;
            let mut slab = remaining.clone();
            slab.begin.set(d, (end - right).max(begin))?;
            let slab = BoundingBox::new(slab.begin, slab.end);
            if !slab.is_empty() {
                slabs.push(slab);
            }
            remaining.end.set(d, (end - right).max(begin))?;
        }
        remaining = BoundingBox::new(remaining.begin, remaining.end);
    }
    Ok((remaining, slabs))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb2(xb: i64, xe: i64, yb: i64, ye: i64) -> BoundingBox {
        BoundingBox::new(
            IdxTuple::from_pairs([("x", xb), ("y", yb)]),
            IdxTuple::from_pairs([("x", xe), ("y", ye)]),
        )
    }

    #[test]
    fn tiles_cover_box_disjointly() {
        let bb = bb2(-1, 9, 0, 7);
        let sizes = IdxTuple::from_pairs([("x", 4), ("y", 3)]);
        let tiles = tile_boxes(&bb, &sizes).unwrap();
        assert_eq!(tiles.len(), 3 * 3);
        let total: i64 = tiles.iter().map(|t| t.size()).sum();
        assert_eq!(total, bb.size());
        // Tiles never overlap
        for (i, a) in tiles.iter().enumerate() {
            for b in tiles.iter().skip(i + 1) {
                assert!(a.intersect(b).is_empty(), "{a} overlaps {b}");
            }
        }
    }

    #[test]
    fn tiling_empty_box() {
        let bb = bb2(4, 4, 0, 3);
        let sizes = IdxTuple::from_pairs([("x", 2), ("y", 2)]);
        assert!(tile_boxes(&bb, &sizes).unwrap().is_empty());
    }

    #[test]
    fn wavefront_two_shift_geometry() {
        // Rank BB [0, 64), angle 1, two steps per region: the first shift
        // covers [-1, 65), the second contracts to [0, 64)
        let rank = BoundingBox::new(
            IdxTuple::from_pairs([("x", 0)]),
            IdxTuple::from_pairs([("x", 64)]),
        );
        let ext = BoundingBox::new(
            IdxTuple::from_pairs([("x", -1)]),
            IdxTuple::from_pairs([("x", 65)]),
        );
        let angles = IdxTuple::from_pairs([("x", 1)]);
        let s0 = wf_shifted_box(&ext, &rank, &angles, 0, 2).unwrap();
        assert_eq!(s0.begin.get("x"), Some(-1));
        assert_eq!(s0.end.get("x"), Some(65));
        let s1 = wf_shifted_box(&ext, &rank, &angles, 1, 2).unwrap();
        assert_eq!(s1.begin.get("x"), Some(0));
        assert_eq!(s1.end.get("x"), Some(64));
    }

    #[test]
    fn no_wavefront_clips_to_rank() {
        let rank = bb2(0, 8, 0, 8);
        let angles = IdxTuple::from_pairs([("x", 0), ("y", 0)]);
        let s = wf_shifted_box(&rank, &rank, &angles, 0, 1).unwrap();
        assert_eq!(s, rank);
    }

    #[test]
    fn interior_exterior_partition() {
        let bb = bb2(0, 10, 0, 6);
        let left = IdxTuple::from_pairs([("x", 2), ("y", 1)]);
        let right = IdxTuple::from_pairs([("x", 1), ("y", 0)]);
        let (interior, slabs) = split_interior_exterior(&bb, &left, &right).unwrap();
        assert_eq!(interior, bb2(2, 9, 1, 6));
        let total: i64 = interior.size() + slabs.iter().map(|s| s.size()).sum::<i64>();
        assert_eq!(total, bb.size());
        for (i, a) in slabs.iter().enumerate() {
            assert!(a.intersect(&interior).is_empty());
            for b in slabs.iter().skip(i + 1) {
                assert!(a.intersect(b).is_empty(), "{a} overlaps {b}");
            }
        }
    }
}

//! End-to-end solution tests: small stencils driven through the facade,
//! checked against hand results and the reference scan

use compute::{KernelArgs, KernelEnv, ScratchSpec, Solution, StencilBundle};
use data::dims::{for_each_in, DimSet, IdxTuple};
use data::Precision;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

fn env() -> Arc<KernelEnv> {
    KernelEnv::new().unwrap()
}

fn idx1(t: i64, x: i64) -> IdxTuple {
    IdxTuple::from_pairs([("t", t), ("x", x)])
}

/// `A[t+1, x] = A[t, x]` over a 1-D domain
fn identity_1d(n: i64) -> Solution {
    let dims = DimSet::new("t", &["x"], &[]).unwrap();
    let mut soln = Solution::new(env(), "identity", dims);
    soln.set_rank_domain_size("x", n).unwrap();
    let a = soln.new_grid("A", &["t", "x"]).unwrap();
    soln.add_bundle_pack(
        "p0",
        vec![StencilBundle {
            name: "copy".into(),
            outputs: vec![a],
            inputs: vec![a],
            halo: IdxTuple::from_pairs([("x", 0)]),
            sub_domain: None,
            scratch: vec![],
            fp_ops_per_point: 0,
            compute: Box::new(move |args: KernelArgs<'_>| {
                for_each_in(&args.begin, &args.end, |pt| {
                    let x = pt.get("x").unwrap();
                    let v = args.grids[a].read_elem(&idx1(args.step, x))?;
                    // SAFETY: sub-blocks partition writes disjointly
                    unsafe { args.grids[a].write_elem_unsync(&idx1(args.step + 1, x), v)? };
                    Ok::<(), compute::Error>(())
                })
            }),
        }],
    )
    .unwrap();
    soln
}

/// `B[t+1, x] = A[t, x-1] + A[t, x] + A[t, x+1]` over a 1-D domain
fn laplacian_1d(n: i64) -> Solution {
    let dims = DimSet::new("t", &["x"], &[]).unwrap();
    let mut soln = Solution::new(env(), "laplacian", dims);
    soln.set_rank_domain_size("x", n).unwrap();
    let a = soln.new_grid("A", &["t", "x"]).unwrap();
    let b = soln.new_grid("B", &["t", "x"]).unwrap();
    soln.add_bundle_pack(
        "p0",
        vec![StencilBundle {
            name: "laplace".into(),
            outputs: vec![b],
            inputs: vec![a],
            halo: IdxTuple::from_pairs([("x", 1)]),
            sub_domain: None,
            scratch: vec![],
            fp_ops_per_point: 2,
            compute: Box::new(move |args: KernelArgs<'_>| {
                for_each_in(&args.begin, &args.end, |pt| {
                    let x = pt.get("x").unwrap();
                    let t = args.step;
                    let v = args.grids[a].read_elem(&idx1(t, x - 1))?
                        + args.grids[a].read_elem(&idx1(t, x))?
                        + args.grids[a].read_elem(&idx1(t, x + 1))?;
                    // SAFETY: sub-blocks partition writes disjointly
                    unsafe { args.grids[b].write_elem_unsync(&idx1(t + 1, x), v)? };
                    Ok::<(), compute::Error>(())
                })
            }),
        }],
    )
    .unwrap();
    soln
}

/// 2-D four-neighbor average of `A` into itself, for equivalence runs
fn diffusion_2d(name: &str, nx: i64, ny: i64) -> Solution {
    let dims = DimSet::new("t", &["x", "y"], &[]).unwrap();
    let mut soln = Solution::new(env(), name, dims);
    soln.set_rank_domain_size("x", nx).unwrap();
    soln.set_rank_domain_size("y", ny).unwrap();
    let a = soln.new_grid("A", &["t", "x", "y"]).unwrap();
    soln.add_bundle_pack(
        "p0",
        vec![StencilBundle {
            name: "diffuse".into(),
            outputs: vec![a],
            inputs: vec![a],
            halo: IdxTuple::from_pairs([("x", 1), ("y", 1)]),
            sub_domain: None,
            scratch: vec![],
            fp_ops_per_point: 4,
            compute: Box::new(move |args: KernelArgs<'_>| {
                for_each_in(&args.begin, &args.end, |pt| {
                    let (x, y) = (pt.get("x").unwrap(), pt.get("y").unwrap());
                    let t = args.step;
                    let at = |xx: i64, yy: i64| {
                        args.grids[a]
                            .read_elem(&IdxTuple::from_pairs([("t", t), ("x", xx), ("y", yy)]))
                    };
                    let v = 0.25 * (at(x - 1, y)? + at(x + 1, y)? + at(x, y - 1)? + at(x, y + 1)?);
                    let dst = IdxTuple::from_pairs([("t", t + 1), ("x", x), ("y", y)]);
                    // SAFETY: sub-blocks partition writes disjointly
                    unsafe { args.grids[a].write_elem_unsync(&dst, v)? };
                    Ok::<(), compute::Error>(())
                })
            }),
        }],
    )
    .unwrap();
    soln
}

#[test]
fn one_step_identity() {
    let mut soln = identity_1d(16);
    soln.prepare_solution().unwrap();
    let a = soln.grid_id("A").unwrap();
    for x in 0..16 {
        soln.grid_mut(a).write_elem(&idx1(0, x), x as Precision).unwrap();
    }
    soln.run_solution(0, 1).unwrap();
    for x in 0..16 {
        assert_eq!(soln.grid(a).read_elem(&idx1(1, x)).unwrap(), x as Precision);
    }
    let stats = soln.get_stats();
    assert_eq!(stats.num_steps_done, 1);
    assert_eq!(stats.num_writes, 16);
    assert_eq!(stats.num_elements, 16);
    // Counters cleared by get_stats
    assert_eq!(soln.get_stats().num_steps_done, 0);
}

#[test]
fn laplacian_hand_result() {
    let mut soln = laplacian_1d(8);
    soln.prepare_solution().unwrap();
    let a = soln.grid_id("A").unwrap();
    let b = soln.grid_id("B").unwrap();
    // A[0, x] = x, halo included
    for x in -1..=8 {
        soln.grid_mut(a).write_elem(&idx1(0, x), x as Precision).unwrap();
    }
    soln.run_solution(0, 1).unwrap();
    for x in 0..8 {
        assert_eq!(
            soln.grid(b).read_elem(&idx1(1, x)).unwrap(),
            3.0 * x as Precision,
            "B[1, {x}]"
        );
    }
}

/// Fill A[0] (halos included) with a reproducible random field
fn seed_random(soln: &mut Solution, nx: i64, ny: i64) {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let a = soln.grid_id("A").unwrap();
    for x in -1..=nx {
        for y in -1..=ny {
            let v: Precision = rng.gen_range(-1.0..1.0);
            soln.grid_mut(a)
                .write_elem(&IdxTuple::from_pairs([("t", 0), ("x", x), ("y", y)]), v)
                .unwrap();
        }
    }
}

#[test]
fn blocked_scan_matches_reference() {
    let mut opt = diffusion_2d("opt", 12, 10);
    // Awkward tile sizes plus nested threads to stress the scan
    opt.apply_command_line_options("-bx 5 -by 3 -sb 2 -max_threads 4 -block_threads 2")
        .unwrap();
    let mut reference = diffusion_2d("reference", 12, 10);
    opt.prepare_solution().unwrap();
    reference.prepare_solution().unwrap();
    seed_random(&mut opt, 12, 10);
    seed_random(&mut reference, 12, 10);
    opt.run_solution(0, 3).unwrap();
    reference.run_solution_ref(0, 3).unwrap();
    assert_eq!(opt.compare_data(&reference, 1e-4).unwrap(), 0);
}

#[test]
fn init_helpers_are_deterministic() {
    let mut first = laplacian_1d(8);
    let mut second = laplacian_1d(8);
    first.prepare_solution().unwrap();
    second.prepare_solution().unwrap();
    first.init_diff().unwrap();
    second.init_diff().unwrap();
    assert_eq!(first.compare_data(&second, 1e-6).unwrap(), 0);
    first.init_same().unwrap();
    let a = first.grid_id("A").unwrap();
    assert_eq!(first.grid(a).read_elem(&idx1(0, 3)).unwrap(), 0.1);
    // Seeding marks everything stale
    assert!(first.grid(a).is_dirty(0));
}

#[test]
fn ring_aliasing_through_facade() {
    let mut soln = identity_1d(4);
    soln.prepare_solution().unwrap();
    let a = soln.grid_id("A").unwrap();
    // Default step allocation is 2: steps 0 and 2 alias, step 1 does not
    soln.grid_mut(a).write_elem(&idx1(0, 1), 5.0).unwrap();
    soln.grid_mut(a).write_elem(&idx1(1, 1), 6.0).unwrap();
    soln.grid_mut(a).write_elem(&idx1(2, 1), 7.0).unwrap();
    assert_eq!(soln.grid(a).read_elem(&idx1(0, 1)).unwrap(), 7.0);
    assert_eq!(soln.grid(a).read_elem(&idx1(1, 1)).unwrap(), 6.0);
}

#[test]
fn wavefront_two_shift_extension() {
    let dims = DimSet::new("t", &["x"], &[]).unwrap();
    let mut soln = Solution::new(env(), "wavefront", dims);
    soln.set_rank_domain_size("x", 64).unwrap();
    soln.set_region_steps(2).unwrap();
    let a = soln.new_grid("A", &["t", "x"]).unwrap();
    let written: Arc<Mutex<HashSet<(i64, i64)>>> = Arc::new(Mutex::new(HashSet::new()));
    let sink = written.clone();
    soln.add_bundle_pack(
        "p0",
        vec![StencilBundle {
            name: "record".into(),
            outputs: vec![a],
            inputs: vec![a],
            halo: IdxTuple::from_pairs([("x", 1)]),
            sub_domain: None,
            scratch: vec![],
            fp_ops_per_point: 0,
            compute: Box::new(move |args: KernelArgs<'_>| {
                for_each_in(&args.begin, &args.end, |pt| {
                    let x = pt.get("x").unwrap();
                    let v = args.grids[a].read_elem(&idx1(args.step, x))?;
                    // SAFETY: sub-blocks partition writes disjointly
                    unsafe { args.grids[a].write_elem_unsync(&idx1(args.step + 1, x), v)? };
                    sink.lock().unwrap().insert((args.step + 1, x));
                    Ok::<(), compute::Error>(())
                })
            }),
        }],
    )
    .unwrap();
    soln.prepare_solution().unwrap();
    soln.run_solution(0, 2).unwrap();

    let written = written.lock().unwrap();
    // First shift covers the extended box [-1, 65): the points beyond the
    // domain are computed even though no rank owns them
    assert!(written.contains(&(1, -1)));
    assert!(written.contains(&(1, 64)));
    assert!(!written.contains(&(1, -2)));
    assert!(!written.contains(&(1, 65)));
    // Second shift contracts back to the true domain [0, 64)
    assert!(written.contains(&(2, 0)));
    assert!(written.contains(&(2, 63)));
    assert!(!written.contains(&(2, -1)));
    assert!(!written.contains(&(2, 64)));
}

#[test]
fn blocks_partition_writes_disjointly() {
    let dims = DimSet::new("t", &["x", "y"], &[]).unwrap();
    let mut soln = Solution::new(env(), "partition", dims);
    soln.set_rank_domain_size("x", 16).unwrap();
    soln.set_rank_domain_size("y", 10).unwrap();
    soln.apply_command_line_options("-bx 5 -by 3 -sb 2 -max_threads 4 -block_threads 2")
        .unwrap();
    let a = soln.new_grid("A", &["t", "x", "y"]).unwrap();
    let written: Arc<Mutex<Vec<(i64, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = written.clone();
    soln.add_bundle_pack(
        "p0",
        vec![StencilBundle {
            name: "record".into(),
            outputs: vec![a],
            inputs: vec![a],
            halo: IdxTuple::from_pairs([("x", 0), ("y", 0)]),
            sub_domain: None,
            scratch: vec![],
            fp_ops_per_point: 0,
            compute: Box::new(move |args: KernelArgs<'_>| {
                for_each_in(&args.begin, &args.end, |pt| {
                    sink.lock()
                        .unwrap()
                        .push((pt.get("x").unwrap(), pt.get("y").unwrap()));
                    Ok::<(), compute::Error>(())
                })
            }),
        }],
    )
    .unwrap();
    soln.prepare_solution().unwrap();
    soln.run_solution(0, 1).unwrap();

    let written = written.lock().unwrap();
    assert_eq!(written.len(), 16 * 10, "every point computed exactly once");
    let unique: HashSet<_> = written.iter().collect();
    assert_eq!(unique.len(), written.len(), "no point computed twice");
}

#[test]
fn dirty_flags_follow_runs() {
    let mut soln = identity_1d(8);
    soln.prepare_solution().unwrap();
    let a = soln.grid_id("A").unwrap();
    assert!(!soln.grid(a).is_dirty(1));
    soln.run_solution(0, 1).unwrap();
    // The write at step 1 left its halos stale
    assert!(soln.grid(a).is_dirty(1));
    soln.run_solution(1, 2).unwrap();
    // The exchange before step 1's read cleared it; step 2 is now stale
    assert!(!soln.grid(a).is_dirty(1));
    assert!(soln.grid(a).is_dirty(2));
}

#[test]
fn scratch_grids_follow_the_tile() {
    let dims = DimSet::new("t", &["x"], &[]).unwrap();
    let mut soln = Solution::new(env(), "scratch", dims);
    soln.set_rank_domain_size("x", 24).unwrap();
    soln.apply_command_line_options("-b 7 -sb 3").unwrap();
    let a = soln.new_grid("A", &["t", "x"]).unwrap();
    let b = soln.new_grid("B", &["t", "x"]).unwrap();
    soln.add_bundle_pack(
        "p0",
        vec![StencilBundle {
            name: "via_scratch".into(),
            outputs: vec![b],
            inputs: vec![a],
            halo: IdxTuple::from_pairs([("x", 0)]),
            sub_domain: None,
            scratch: vec![ScratchSpec {
                name: "tmp".into(),
                halo: IdxTuple::from_pairs([("x", 1)]),
            }],
            fp_ops_per_point: 1,
            compute: Box::new(move |args: KernelArgs<'_>| {
                let t = args.step;
                // Stage doubled values in the scratch grid, then copy out
                let pts: Vec<i64> = (args.begin.get("x").unwrap()..args.end.get("x").unwrap())
                    .collect();
                for &x in &pts {
                    let v = args.grids[a].read_elem(&idx1(t, x))?;
                    args.scratch[0]
                        .write_elem(&IdxTuple::from_pairs([("x", x)]), 2.0 * v)?;
                }
                for &x in &pts {
                    let v = args.scratch[0].read_elem(&IdxTuple::from_pairs([("x", x)]))?;
                    // SAFETY: sub-blocks partition writes disjointly
                    unsafe { args.grids[b].write_elem_unsync(&idx1(t + 1, x), v)? };
                }
                Ok(())
            }),
        }],
    )
    .unwrap();
    soln.prepare_solution().unwrap();
    let a = soln.grid_id("A").unwrap();
    let b = soln.grid_id("B").unwrap();
    for x in 0..24 {
        soln.grid_mut(a).write_elem(&idx1(0, x), x as Precision).unwrap();
    }
    soln.run_solution(0, 1).unwrap();
    for x in 0..24 {
        assert_eq!(
            soln.grid(b).read_elem(&idx1(1, x)).unwrap(),
            2.0 * x as Precision
        );
    }
}

#[test]
fn packs_evaluate_in_declaration_order() {
    let dims = DimSet::new("t", &["x"], &[]).unwrap();
    let mut soln = Solution::new(env(), "packs", dims);
    soln.set_rank_domain_size("x", 8).unwrap();
    let a = soln.new_grid("A", &["t", "x"]).unwrap();
    let b = soln.new_grid("B", &["t", "x"]).unwrap();
    let c = soln.new_grid("C", &["t", "x"]).unwrap();
    let copy = |src: usize, dst: usize| -> Box<compute::bundle::KernelFn> {
        Box::new(move |args: KernelArgs<'_>| {
            for_each_in(&args.begin, &args.end, |pt| {
                let x = pt.get("x").unwrap();
                // Read what the previous pack just wrote at step + 1
                let v = args.grids[src].read_elem(&idx1(args.step + 1, x))?;
                // SAFETY: sub-blocks partition writes disjointly
                unsafe { args.grids[dst].write_elem_unsync(&idx1(args.step + 1, x), v + 1.0)? };
                Ok::<(), compute::Error>(())
            })
        })
    };
    soln.add_bundle_pack(
        "first",
        vec![StencilBundle {
            name: "a_to_b".into(),
            outputs: vec![b],
            inputs: vec![a],
            halo: IdxTuple::from_pairs([("x", 0)]),
            sub_domain: None,
            scratch: vec![],
            fp_ops_per_point: 1,
            compute: Box::new(move |args: KernelArgs<'_>| {
                for_each_in(&args.begin, &args.end, |pt| {
                    let x = pt.get("x").unwrap();
                    let v = args.grids[a].read_elem(&idx1(args.step, x))?;
                    // SAFETY: sub-blocks partition writes disjointly
                    unsafe { args.grids[b].write_elem_unsync(&idx1(args.step + 1, x), v + 1.0)? };
                    Ok::<(), compute::Error>(())
                })
            }),
        }],
    )
    .unwrap();
    soln.add_bundle_pack(
        "second",
        vec![StencilBundle {
            name: "b_to_c".into(),
            outputs: vec![c],
            inputs: vec![b],
            halo: IdxTuple::from_pairs([("x", 0)]),
            sub_domain: None,
            scratch: vec![],
            fp_ops_per_point: 1,
            compute: copy(b, c),
        }],
    )
    .unwrap();
    soln.prepare_solution().unwrap();
    let a = soln.grid_id("A").unwrap();
    soln.grid_mut(a).write_elem(&idx1(0, 3), 10.0).unwrap();
    soln.run_solution(0, 1).unwrap();
    // B[1] = A[0] + 1, then C[1] = B[1] + 1
    assert_eq!(soln.grid(c).read_elem(&idx1(1, 3)).unwrap(), 12.0);
}

#[test]
fn storage_sharing_between_solutions() {
    let mut first = identity_1d(16);
    first.prepare_solution().unwrap();
    let mut second = identity_1d(16);
    second.prepare_solution().unwrap();
    second.share_grid_storage(&first).unwrap();

    let a1 = first.grid_id("A").unwrap();
    let a2 = second.grid_id("A").unwrap();
    first.grid_mut(a1).write_elem(&idx1(0, 7), 42.0).unwrap();
    assert_eq!(second.grid(a2).read_elem(&idx1(0, 7)).unwrap(), 42.0);

    // A differently shaped solution cannot adopt the storage
    let mut other = identity_1d(32);
    other.prepare_solution().unwrap();
    assert!(matches!(
        other.share_grid_storage(&first),
        Err(compute::Error::Data(data::Error::ShapeMismatch(_)))
    ));
}

#[test]
fn facade_error_paths() {
    let mut soln = identity_1d(8);
    // Running before prepare fails
    assert!(matches!(
        soln.run_solution(0, 1),
        Err(compute::Error::InvalidArgument(_))
    ));
    soln.prepare_solution().unwrap();
    // Reversed step range fails; an empty one is fine
    assert!(matches!(
        soln.run_solution(3, 2),
        Err(compute::Error::InvalidArgument(_))
    ));
    soln.run_solution(2, 2).unwrap();
    // Unknown dimension names are rejected eagerly
    assert!(soln.set_rank_domain_size("q", 4).is_err());
    assert!(matches!(
        soln.set_block_size("t", 4),
        Err(compute::Error::Data(data::Error::DimKindMismatch { .. }))
    ));
}

#[test]
fn rank_count_mismatch_caught_at_prepare() {
    let mut soln = identity_1d(8);
    soln.set_num_ranks("x", 2).unwrap();
    assert!(matches!(
        soln.prepare_solution(),
        Err(compute::Error::ConfigurationMismatch(_))
    ));
}

#[test]
fn facade_queries_after_prepare() {
    let mut soln = laplacian_1d(8);
    soln.prepare_solution().unwrap();
    assert_eq!(soln.get_num_grids(), 2);
    assert_eq!(soln.get_grid("A").map(|g| g.name()), Some("A"));
    assert!(soln.get_grid("missing").is_none());
    assert_eq!(soln.get_step_dim_name(), "t");
    assert_eq!(soln.get_domain_dim_names(), &["x".to_string()]);
    assert!(soln.get_misc_dim_names().is_empty());
    assert_eq!(soln.get_first_rank_domain_index("x").unwrap(), 0);
    assert_eq!(soln.get_last_rank_domain_index("x").unwrap(), 7);
    assert_eq!(soln.get_overall_domain_size("x").unwrap(), 8);
}

#[test]
fn auto_tuner_facade() {
    let mut soln = identity_1d(8);
    soln.prepare_solution().unwrap();
    assert!(!soln.is_auto_tuner_enabled());
    soln.reset_auto_tuner(true, false);
    assert!(soln.is_auto_tuner_enabled());
    soln.reset_auto_tuner(false, false);
    assert!(!soln.is_auto_tuner_enabled());
}

#[test]
fn settings_copied_between_solutions() {
    let dims = DimSet::new("t", &["x"], &[]).unwrap();
    let mut first = Solution::new(env(), "first", dims);
    first.set_rank_domain_size("x", 40).unwrap();
    first.set_block_size("x", 10).unwrap();
    let second = Solution::with_settings_from(env(), "second", &first);
    assert_eq!(second.settings().rank_domain_sizes.get("x"), Some(40));
    assert_eq!(second.settings().block_sizes.get("x"), Some(10));
    assert_eq!(second.get_num_grids(), 0);
}

#[test]
fn fixed_size_grid_through_facade() {
    let dims = DimSet::new("t", &["x"], &["c"]).unwrap();
    let mut soln = Solution::new(env(), "fixed", dims);
    soln.set_rank_domain_size("x", 8).unwrap();
    let w = soln.new_fixed_size_grid("w", &["c"], &[3]).unwrap();
    soln.prepare_solution().unwrap();
    let at = |c: i64| IdxTuple::from_pairs([("c", c)]);
    soln.grid_mut(w).write_elem(&at(2), 1.5).unwrap();
    assert_eq!(soln.grid(w).read_elem(&at(2)).unwrap(), 1.5);
    assert!(soln.grid(w).read_elem(&at(3)).is_err());
}

//! Runtime auto-tuner for block shapes
//!
//! Hill-climbs the block-size tuple while the solution runs: a warmup
//! period discards cold-cache results, then each candidate block is timed
//! over a short measurement period and the search walks toward faster
//! neighbors, halving its radius when a full neighborhood brings no
//! improvement. The state machine is driven by `eval()` calls between
//! region evaluations, so no separate benchmark harness is needed.

use crate::settings::Settings;
use data::dims::IdxTuple;
use std::collections::HashMap;

/// Warmup lasts until BOTH thresholds are reached
const WARMUP_STEPS: i64 = 100;
const WARMUP_SECS: f64 = 1.0;

/// A measurement ends when EITHER threshold is reached
const MIN_STEPS: i64 = 50;
const MIN_SECS: f64 = 0.1;

/// Search stops when the radius falls below this
const MIN_STEP: i64 = 4;
const MAX_RADIUS: i64 = 64;

/// Candidate rejection thresholds
const MIN_PTS: i64 = 512;
const MIN_BLKS: i64 = 4;

/// Block-shape search state machine
#[derive(Debug)]
pub struct AutoTuner {
    verbose: bool,
    done: bool,
    in_warmup: bool,

    /// Steps and seconds accumulated toward the current period
    csteps: i64,
    ctime: f64,

    /// Block currently installed in the settings and being timed
    trial: IdxTuple,
    center: IdxTuple,
    center_rate: Option<f64>,
    radius: i64,
    neigh_idx: usize,

    best_block: IdxTuple,
    best_rate: f64,

    /// Rates of every block evaluated so far
    results: HashMap<IdxTuple, f64>,
    n2big: usize,
    n2small: usize,
}
//
impl AutoTuner {
    /// A new tuner starts disabled; enable it with [`clear`](Self::clear)
    pub fn new() -> Self {
        Self {
            verbose: false,
            done: true,
            in_warmup: true,
            csteps: 0,
            ctime: 0.0,
            trial: IdxTuple::new(),
            center: IdxTuple::new(),
            center_rate: None,
            radius: MAX_RADIUS,
            neigh_idx: 0,
            best_block: IdxTuple::new(),
            best_rate: 0.0,
            results: HashMap::new(),
            n2big: 0,
            n2small: 0,
        }
    }

    /// Reset all state; `mark_done` leaves the tuner disabled
    pub fn clear(&mut self, mark_done: bool, verbose: bool) {
        *self = Self::new();
        self.verbose = verbose;
        self.done = mark_done;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Number of completed block measurements
    pub fn num_evals(&self) -> usize {
        self.results.len()
    }

    /// Evaluate the period just run and install the next candidate block
    ///
    /// `region_sizes` bounds the search: a candidate may not exceed the
    /// region and must leave at least [`MIN_BLKS`] blocks per region.
    pub fn eval(
        &mut self,
        settings: &mut Settings,
        region_sizes: &IdxTuple,
        steps: i64,
        secs: f64,
    ) {
        if self.done {
            return;
        }
        self.csteps += steps;
        self.ctime += secs;

        if self.in_warmup {
            if self.csteps >= WARMUP_STEPS && self.ctime >= WARMUP_SECS {
                self.in_warmup = false;
                self.csteps = 0;
                self.ctime = 0.0;
                // First measured candidate is the user's current block
                self.center = settings.adjusted_block_sizes(region_sizes);
                self.trial = self.center.clone();
                settings.block_sizes = self.trial.clone();
                if self.verbose {
                    log::info!("auto-tuner: warmup done, starting at block ({})", self.center);
                }
            }
            return;
        }

        // Keep measuring the current trial until the period is long enough
        if self.csteps < MIN_STEPS && self.ctime < MIN_SECS {
            return;
        }
        let rate = self.csteps as f64 / self.ctime.max(1e-9);
        self.results.insert(self.trial.clone(), rate);
        self.csteps = 0;
        self.ctime = 0.0;
        if self.verbose {
            log::info!(
                "auto-tuner: block ({}) at {} steps/s",
                self.trial,
                data::num_str(rate)
            );
        }

        if self.is_better(rate, &self.trial) {
            self.best_rate = rate;
            self.best_block = self.trial.clone();
        }

        // Move the center as soon as a neighbor beats it
        let moved = if let Some(center_rate) = self.center_rate {
            if self.trial != self.center && beats(rate, &self.trial, center_rate, &self.center) {
                self.center = self.trial.clone();
                self.center_rate = Some(rate);
                true
            } else {
                false
            }
        } else {
            self.center_rate = Some(rate);
            false
        };
        if moved {
            self.neigh_idx = 0;
            if self.verbose {
                log::info!("auto-tuner: center moved to ({})", self.center);
            }
        }

        self.advance(settings, region_sizes);
    }

    /// Find the next untried candidate, halving the radius on exhaustion
    fn advance(&mut self, settings: &mut Settings, region_sizes: &IdxTuple) {
        let ndims = self.center.len();
        let num_neighbors = 3usize.pow(ndims as u32);
        loop {
            if self.neigh_idx >= num_neighbors {
                self.radius /= 2;
                self.neigh_idx = 0;
                if self.radius < MIN_STEP {
                    self.finish(settings);
                    return;
                }
                continue;
            }
            let idx = self.neigh_idx;
            self.neigh_idx += 1;

            // Decode idx as base-3 offsets in {-1, 0, +1} per dim
            let mut code = idx;
            let mut candidate = self.center.clone();
            let mut is_center = true;
            for d in (0..ndims).rev() {
                let digit = (code % 3) as i64 - 1;
                code /= 3;
                if digit != 0 {
                    is_center = false;
                    let name = self.center.name_at(d).to_string();
                    let val = self.center.val_at(d) + digit * self.radius;
                    if candidate.set(&name, val).is_err() {
                        break;
                    }
                }
            }
            if is_center || self.results.contains_key(&candidate) {
                continue;
            }
            match check_candidate(&candidate, region_sizes) {
                Fit::TooSmall => self.n2small += 1,
                Fit::TooBig => self.n2big += 1,
                Fit::Ok => {
                    self.trial = candidate;
                    settings.block_sizes = self.trial.clone();
                    return;
                }
            }
        }
    }

    /// Apply the best block seen and stop
    fn finish(&mut self, settings: &mut Settings) {
        if !self.best_block.is_empty() {
            settings.block_sizes = self.best_block.clone();
        }
        self.done = true;
        log::info!(
            "auto-tuner: done after {} evaluations ({} too big, {} too small), best block ({}) at {} steps/s",
            self.results.len(),
            self.n2big,
            self.n2small,
            self.best_block,
            data::num_str(self.best_rate)
        );
    }

    fn is_better(&self, rate: f64, block: &IdxTuple) -> bool {
        self.best_block.is_empty() || beats(rate, block, self.best_rate, &self.best_block)
    }
}
//
impl Default for AutoTuner {
    fn default() -> Self {
        Self::new()
    }
}

/// Strict preference order between measured blocks
///
/// Higher rate wins; equal rates prefer the smaller total size, then the
/// lexicographically smaller tuple, so the search cannot cycle.
fn beats(rate_a: f64, block_a: &IdxTuple, rate_b: f64, block_b: &IdxTuple) -> bool {
    if rate_a != rate_b {
        return rate_a > rate_b;
    }
    let (size_a, size_b) = (block_a.product(), block_b.product());
    if size_a != size_b {
        return size_a < size_b;
    }
    block_a.vals().lt(block_b.vals())
}

enum Fit {
    Ok,
    TooSmall,
    TooBig,
}

fn check_candidate(candidate: &IdxTuple, region_sizes: &IdxTuple) -> Fit {
    if candidate.vals().any(|v| v < 1) || candidate.product() < MIN_PTS {
        return Fit::TooSmall;
    }
    let mut blks = 1i64;
    for (name, b) in candidate.iter() {
        let r = region_sizes.get(name).unwrap_or(b);
        if b > r {
            return Fit::TooBig;
        }
        blks *= data::dims::div_ceil(r, b);
    }
    if blks < MIN_BLKS {
        return Fit::TooSmall;
    }
    Fit::Ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use data::dims::DimSet;

    fn setup() -> (Settings, IdxTuple) {
        let dims = DimSet::new("t", &["x", "y", "z"], &[]).unwrap();
        let mut settings = Settings::new(&dims);
        settings.block_sizes.set_all(128);
        let region = dims.domain_tuple(512);
        (settings, region)
    }

    /// Drive the state machine with a synthetic rate function
    fn run_tuner(
        settings: &mut Settings,
        region: &IdxTuple,
        rate_of: impl Fn(&IdxTuple) -> f64,
    ) -> AutoTuner {
        let mut tuner = AutoTuner::new();
        tuner.clear(false, false);
        // One long period gets us out of warmup
        tuner.eval(settings, region, WARMUP_STEPS, WARMUP_SECS);
        let mut guard = 0;
        while !tuner.is_done() {
            let rate = rate_of(&settings.block_sizes);
            // steps/secs chosen so one eval completes one measurement
            tuner.eval(settings, region, MIN_STEPS, MIN_STEPS as f64 / rate);
            guard += 1;
            assert!(guard < 10_000, "auto-tuner failed to terminate");
        }
        tuner
    }

    #[test]
    fn finds_synthetic_optimum() {
        let (mut settings, region) = setup();
        // Rate peaked at block (32, 32, 32)
        let tuner = run_tuner(&mut settings, &region, |block| {
            let dist: i64 = block.vals().map(|v| (v - 32).abs()).sum();
            1000.0 / (1.0 + dist as f64)
        });
        assert_eq!(settings.block_sizes, region.map(|_| 32));
        // Bounded number of evaluations: 4 * 3^n
        assert!(tuner.num_evals() <= 4 * 27, "{} evals", tuner.num_evals());
    }

    #[test]
    fn terminates_on_flat_rate() {
        let (mut settings, region) = setup();
        let tuner = run_tuner(&mut settings, &region, |_| 1.0);
        assert!(tuner.is_done());
        // Equal rates tie-break toward the smallest block, never cycling
        assert!(settings.block_sizes.product() <= 128 * 128 * 128);
    }

    #[test]
    fn respects_region_bounds() {
        let (mut settings, mut region) = setup();
        region.set_all(128);
        let tuner = run_tuner(&mut settings, &region, |block| block.product() as f64);
        assert!(tuner.is_done());
        for (name, b) in settings.block_sizes.iter() {
            assert!(b <= region.get(name).unwrap());
        }
    }

    #[test]
    fn disabled_tuner_leaves_settings_alone() {
        let (mut settings, region) = setup();
        let before = settings.block_sizes.clone();
        let mut tuner = AutoTuner::new();
        assert!(tuner.is_done());
        tuner.eval(&mut settings, &region, 1000, 10.0);
        assert_eq!(settings.block_sizes, before);
    }
}

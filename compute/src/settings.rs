//! Runtime settings and the command-line option table
//!
//! All tunables of a solution live in one statically typed [`Settings`]
//! struct. `apply_command_line_options` consumes an option string of the
//! form `-<name> <integer>` / `-<name>` / `-no-<name>` (tokens are
//! space-separated, double quotes group); recognized options mutate the
//! corresponding field and unrecognized tokens are handed back to the
//! caller for further processing.

use crate::Error;
use data::alloc::NumaPref;
use data::dims::{DimSet, IdxTuple};

/// Default rank-local domain size per domain dimension
const DEF_RANK_SIZE: i64 = 128;

/// Default block size per domain dimension
const DEF_BLOCK_SIZE: i64 = 32;

/// Default ring length of the step dimension in new grids
const DEF_STEP_ALLOC: i64 = 2;

/// All tunables of one solution
///
/// Sizes of zero mean "inherit from the enclosing level": a zero region
/// size becomes the whole (extended) rank domain, a zero block size the
/// region size, a zero sub-block size the block size.
#[derive(Clone, Debug)]
pub struct Settings {
    dims: DimSet,

    /// Rank-local domain size per domain dimension
    pub rank_domain_sizes: IdxTuple,
    /// Region size per domain dimension; fits last-level cache
    pub region_sizes: IdxTuple,
    /// Steps advanced per region; values above 1 enable wave-fronts
    pub region_steps: i64,
    /// Block size per domain dimension; the auto-tuner's search variable
    pub block_sizes: IdxTuple,
    /// Sub-block size per domain dimension; fits L1
    pub sub_block_sizes: IdxTuple,
    /// Minimum extra padding beyond the halo per domain dimension
    pub min_pad_sizes: IdxTuple,
    /// Size per misc dimension for new grids
    pub misc_sizes: IdxTuple,
    /// Rank-grid shape per domain dimension
    pub num_ranks: IdxTuple,

    /// Thread budget; 0 means every hardware thread
    pub max_threads: usize,
    /// Fraction of max_threads actually used (`max_threads / thread_divisor`)
    pub thread_divisor: usize,
    /// Nested threads per block; nesting is enabled when above 1
    pub num_block_threads: usize,

    /// NUMA placement of grid and halo storage
    pub numa_pref: NumaPref,
    /// Multiplier of the inter-buffer pad added to each grid allocation
    pub buf_pad_mult: usize,
    /// Ring length of the step dimension in new grids
    pub step_alloc: i64,

    /// Exchange halos at all (disable for single-rank experiments)
    pub enable_halo_exchange: bool,
    /// Pack and unpack whole vector clusters when halo and face allow it
    pub allow_vec_exchange: bool,
    /// Overlap halo transfers with interior computation
    pub overlap_comms: bool,
}
//
impl Settings {
    pub fn new(dims: &DimSet) -> Self {
        Self {
            dims: dims.clone(),
            rank_domain_sizes: dims.domain_tuple(DEF_RANK_SIZE),
            region_sizes: dims.domain_tuple(0),
            region_steps: 1,
            block_sizes: dims.domain_tuple(DEF_BLOCK_SIZE),
            sub_block_sizes: dims.domain_tuple(0),
            min_pad_sizes: dims.domain_tuple(0),
            misc_sizes: IdxTuple::filled(dims.misc_dims().iter().map(String::as_str), 1),
            num_ranks: dims.domain_tuple(1),
            max_threads: 0,
            thread_divisor: 1,
            num_block_threads: 1,
            numa_pref: NumaPref::None,
            buf_pad_mult: 1,
            step_alloc: DEF_STEP_ALLOC,
            enable_halo_exchange: true,
            allow_vec_exchange: true,
            overlap_comms: true,
        }
    }

    pub fn dims(&self) -> &DimSet {
        &self.dims
    }

    /// Thread budget after applying the divisor
    pub fn total_threads(&self) -> usize {
        let hw = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let max = if self.max_threads == 0 {
            hw
        } else {
            self.max_threads
        };
        (max / self.thread_divisor.max(1)).max(1)
    }

    /// Outer threads: one per block within a region
    pub fn num_region_threads(&self) -> usize {
        (self.total_threads() / self.num_block_threads.max(1)).max(1)
    }

    /// Region sizes with zeros replaced by the extended rank-domain lengths
    pub fn adjusted_region_sizes(&self, ext_lens: &IdxTuple) -> IdxTuple {
        self.region_sizes
            .zip_with(ext_lens, |r, l| if r <= 0 { l.max(1) } else { r.min(l.max(1)) })
            .expect("region and domain tuples share dimensions")
    }

    /// Block sizes clamped into [1, region]
    pub fn adjusted_block_sizes(&self, region_sizes: &IdxTuple) -> IdxTuple {
        self.block_sizes
            .zip_with(region_sizes, |b, r| if b <= 0 { r } else { b.min(r) }.max(1))
            .expect("block and region tuples share dimensions")
    }

    /// Sub-block sizes clamped into [1, block]
    pub fn adjusted_sub_block_sizes(&self, block_sizes: &IdxTuple) -> IdxTuple {
        self.sub_block_sizes
            .zip_with(block_sizes, |s, b| if s <= 0 { b } else { s.min(b) }.max(1))
            .expect("sub-block and block tuples share dimensions")
    }

    /// Parse an option string, mutating matched fields
    ///
    /// Returns the tokens that did not match any known option, in their
    /// original order, so the caller can continue parsing them.
    pub fn apply_command_line_options(&mut self, arg_string: &str) -> Result<Vec<String>, Error> {
        let tokens = tokenize(arg_string);
        let mut extras = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let tok = &tokens[i];
            match self.match_option(&tokens, &mut i)? {
                true => {}
                false => {
                    extras.push(tok.clone());
                    i += 1;
                }
            }
        }
        Ok(extras)
    }

    /// Try to consume the option at `tokens[*i]`; advances `i` on a match
    fn match_option(&mut self, tokens: &[String], i: &mut usize) -> Result<bool, Error> {
        let Some(name) = tokens[*i].strip_prefix('-') else {
            return Ok(false);
        };

        // Boolean options: -<name> sets, -no-<name> clears
        let bools: [(&str, fn(&mut Self, bool)); 3] = [
            ("halo_exchange", |s, v| s.enable_halo_exchange = v),
            ("vec_exchange", |s, v| s.allow_vec_exchange = v),
            ("overlap_comms", |s, v| s.overlap_comms = v),
        ];
        for (bname, set) in bools {
            if name == bname {
                set(self, true);
                *i += 1;
                return Ok(true);
            }
            if let Some(rest) = name.strip_prefix("no-") {
                if rest == bname {
                    set(self, false);
                    *i += 1;
                    return Ok(true);
                }
            }
        }

        // Scalar integer options
        let scalars: [(&str, fn(&mut Self, i64) -> Result<(), Error>); 6] = [
            ("rt", |s, v| {
                s.region_steps = non_negative("rt", v)?;
                Ok(())
            }),
            ("max_threads", |s, v| {
                s.max_threads = non_negative("max_threads", v)? as usize;
                Ok(())
            }),
            ("thread_divisor", |s, v| {
                s.thread_divisor = positive("thread_divisor", v)? as usize;
                Ok(())
            }),
            ("block_threads", |s, v| {
                s.num_block_threads = positive("block_threads", v)? as usize;
                Ok(())
            }),
            ("step_alloc", |s, v| {
                s.step_alloc = positive("step_alloc", v)?;
                Ok(())
            }),
            ("numa_pref", |s, v| {
                s.numa_pref = match v {
                    n if n >= 0 => NumaPref::Preferred(n as u32),
                    -1 => NumaPref::Local,
                    -2 => NumaPref::Interleave,
                    _ => NumaPref::None,
                };
                Ok(())
            }),
        ];
        for (sname, set) in scalars {
            if name == sname {
                let val = int_value(tokens, *i)?;
                set(self, val)?;
                *i += 2;
                return Ok(true);
            }
        }

        // Multi-index options: the bare name sets every domain dimension,
        // the name suffixed with a dimension sets just that dimension.
        let multis: [(&str, fn(&mut Self) -> &mut IdxTuple); 6] = [
            ("d", |s| &mut s.rank_domain_sizes),
            ("r", |s| &mut s.region_sizes),
            ("b", |s| &mut s.block_sizes),
            ("sb", |s| &mut s.sub_block_sizes),
            ("mp", |s| &mut s.min_pad_sizes),
            ("nr", |s| &mut s.num_ranks),
        ];
        for (mname, get) in multis {
            if name == mname {
                let val = non_negative(mname, int_value(tokens, *i)?)?;
                get(self).set_all(val);
                *i += 2;
                return Ok(true);
            }
            if let Some(dim) = name.strip_prefix(mname) {
                if self.dims.domain_dims().iter().any(|d| d == dim) {
                    let val = non_negative(name, int_value(tokens, *i)?)?;
                    get(self)
                        .set(dim, val)
                        .map_err(crate::Error::from)?;
                    *i += 2;
                    return Ok(true);
                }
            }
        }

        Ok(false)
    }
}

/// Parse the integer argument following option `tokens[i]`
fn int_value(tokens: &[String], i: usize) -> Result<i64, Error> {
    let Some(val) = tokens.get(i + 1) else {
        return Err(Error::InvalidArgument(format!(
            "no argument for option '{}'",
            tokens[i]
        )));
    };
    val.parse().map_err(|_| {
        Error::InvalidArgument(format!(
            "argument '{val}' for option '{}' is not an integer",
            tokens[i]
        ))
    })
}

fn non_negative(name: &str, val: i64) -> Result<i64, Error> {
    if val < 0 {
        return Err(Error::InvalidArgument(format!(
            "option '-{name}' must not be negative (got {val})"
        )));
    }
    Ok(val)
}

fn positive(name: &str, val: i64) -> Result<i64, Error> {
    if val < 1 {
        return Err(Error::InvalidArgument(format!(
            "option '-{name}' must be positive (got {val})"
        )));
    }
    Ok(val)
}

/// Split an option string into tokens; double quotes group
fn tokenize(arg_string: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut tmp = String::new();
    let mut in_quotes = false;
    for c in arg_string.chars() {
        if c.is_whitespace() && !in_quotes {
            if !tmp.is_empty() {
                tokens.push(std::mem::take(&mut tmp));
            }
        } else if c == '"' {
            if in_quotes {
                if !tmp.is_empty() {
                    tokens.push(std::mem::take(&mut tmp));
                }
                in_quotes = false;
            } else {
                in_quotes = true;
            }
        } else {
            tmp.push(c);
        }
    }
    if !tmp.is_empty() {
        tokens.push(tmp);
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        let dims = DimSet::new("t", &["x", "y"], &[]).unwrap();
        Settings::new(&dims)
    }

    #[test]
    fn multi_dim_shorthand() {
        let mut s = settings();
        let extra = s.apply_command_line_options("-d 64 -bx 16").unwrap();
        assert!(extra.is_empty());
        assert_eq!(s.rank_domain_sizes.get("x"), Some(64));
        assert_eq!(s.rank_domain_sizes.get("y"), Some(64));
        assert_eq!(s.block_sizes.get("x"), Some(16));
        assert_eq!(s.block_sizes.get("y"), Some(DEF_BLOCK_SIZE));
    }

    #[test]
    fn booleans_and_negation() {
        let mut s = settings();
        s.apply_command_line_options("-no-vec_exchange -overlap_comms")
            .unwrap();
        assert!(!s.allow_vec_exchange);
        assert!(s.overlap_comms);
    }

    #[test]
    fn unknown_tokens_pass_through() {
        let mut s = settings();
        let extra = s
            .apply_command_line_options("-v -d 32 output.bin -bz 8")
            .unwrap();
        // -bz does not name a known dimension, so neither it nor its
        // value is consumed
        assert_eq!(extra, vec!["-v", "output.bin", "-bz", "8"]);
        assert_eq!(s.rank_domain_sizes.get("x"), Some(32));
    }

    #[test]
    fn quoted_tokens() {
        assert_eq!(
            tokenize(r#"-d 8 "a b" c"#),
            vec!["-d", "8", "a b", "c"]
        );
    }

    #[test]
    fn parse_errors() {
        let mut s = settings();
        assert!(matches!(
            s.apply_command_line_options("-d"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            s.apply_command_line_options("-d twelve"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            s.apply_command_line_options("-d -5"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn numa_codes() {
        let mut s = settings();
        s.apply_command_line_options("-numa_pref 1").unwrap();
        assert_eq!(s.numa_pref, NumaPref::Preferred(1));
        s.apply_command_line_options("-numa_pref -2").unwrap();
        assert_eq!(s.numa_pref, NumaPref::Interleave);
        s.apply_command_line_options("-numa_pref -9").unwrap();
        assert_eq!(s.numa_pref, NumaPref::None);
    }

    #[test]
    fn size_adjustment() {
        let mut s = settings();
        s.apply_command_line_options("-r 0 -b 48").unwrap();
        let ext = IdxTuple::from_pairs([("x", 40), ("y", 64)]);
        let region = s.adjusted_region_sizes(&ext);
        assert_eq!(region, ext);
        let block = s.adjusted_block_sizes(&region);
        assert_eq!(block, IdxTuple::from_pairs([("x", 40), ("y", 48)]));
        let sub = s.adjusted_sub_block_sizes(&block);
        assert_eq!(sub, block);
    }

    #[test]
    fn thread_partitioning() {
        let mut s = settings();
        s.max_threads = 16;
        s.thread_divisor = 2;
        s.num_block_threads = 4;
        assert_eq!(s.total_threads(), 8);
        assert_eq!(s.num_region_threads(), 2);
    }
}

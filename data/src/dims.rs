//! Named-dimension index algebra
//!
//! Every solution declares an ordered list of named dimensions: one step
//! dimension (advanced by stepping), zero or more domain dimensions
//! (spatially decomposed, blocked and vectorized), and zero or more misc
//! dimensions (enumerated only). The fundamental shape/offset carrier is
//! [`IdxTuple`], an ordered mapping from a dimension name to a signed
//! integer. Negative indices are meaningful (they address halos), so all
//! division and modulo helpers here use mathematical rather than
//! truncating semantics.

use crate::Error;
use std::fmt;

/// The three roles a dimension can play in a solution
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum DimKind {
    /// The single unbounded dimension advanced by `run_solution` (usually time)
    Step,
    /// Spatially decomposed across ranks, blocked and vectorized
    Domain,
    /// Enumerated, neither decomposed nor vectorized
    Misc,
}
//
impl fmt::Display for DimKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DimKind::Step => "step",
            DimKind::Domain => "domain",
            DimKind::Misc => "misc",
        };
        f.write_str(s)
    }
}

/// Ordered mapping from dimension names to signed indices or sizes
///
/// Domain sizes are assumed to fit in 63 bits; arithmetic overflow is
/// caught by the overflow checks of debug builds.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq)]
pub struct IdxTuple {
    entries: Vec<(String, i64)>,
}
//
impl IdxTuple {
    /// Empty tuple
    pub fn new() -> Self {
        Self::default()
    }

    /// Tuple from (name, value) pairs
    pub fn from_pairs<N: Into<String>>(pairs: impl IntoIterator<Item = (N, i64)>) -> Self {
        Self {
            entries: pairs.into_iter().map(|(n, v)| (n.into(), v)).collect(),
        }
    }

    /// Tuple over the given names, every value set to `val`
    pub fn filled<N: Into<String>>(names: impl IntoIterator<Item = N>, val: i64) -> Self {
        Self::from_pairs(names.into_iter().map(|n| (n, val)))
    }

    /// Append one entry; the name must not already be present
    pub fn push(&mut self, name: impl Into<String>, val: i64) {
        let name = name.into();
        debug_assert!(self.get(&name).is_none(), "duplicate dimension `{name}`");
        self.entries.push((name, val));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dimension names, in declaration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// (name, value) pairs, in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), *v))
    }

    pub fn vals(&self) -> impl Iterator<Item = i64> + '_ {
        self.entries.iter().map(|(_, v)| *v)
    }

    /// Value by name, if present
    pub fn get(&self, name: &str) -> Option<i64> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }

    /// Value by name, failing on unknown names
    pub fn lookup(&self, name: &str) -> Result<i64, Error> {
        self.get(name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown dimension `{name}`")))
    }

    /// Replace the value of an existing entry
    pub fn set(&mut self, name: &str, val: i64) -> Result<(), Error> {
        for (n, v) in &mut self.entries {
            if n == name {
                *v = val;
                return Ok(());
            }
        }
        Err(Error::InvalidArgument(format!(
            "unknown dimension `{name}`"
        )))
    }

    /// Set every entry to the same value
    pub fn set_all(&mut self, val: i64) {
        for (_, v) in &mut self.entries {
            *v = val;
        }
    }

    pub fn name_at(&self, i: usize) -> &str {
        &self.entries[i].0
    }

    pub fn val_at(&self, i: usize) -> i64 {
        self.entries[i].1
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// True when both tuples list the same names in the same order
    pub fn same_names(&self, other: &Self) -> bool {
        self.len() == other.len()
            && self
                .names()
                .zip(other.names())
                .all(|(a, b)| a == b)
    }

    /// Combine with another tuple of identical names, element-wise
    pub fn zip_with(
        &self,
        other: &Self,
        mut f: impl FnMut(i64, i64) -> i64,
    ) -> Result<Self, Error> {
        if !self.same_names(other) {
            return Err(Error::InvalidArgument(format!(
                "dimension mismatch between tuples ({self}) and ({other})"
            )));
        }
        Ok(Self {
            entries: self
                .entries
                .iter()
                .zip(&other.entries)
                .map(|((n, a), (_, b))| (n.clone(), f(*a, *b)))
                .collect(),
        })
    }

    /// Apply `f` to every value
    pub fn map(&self, mut f: impl FnMut(i64) -> i64) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|(n, v)| (n.clone(), f(*v)))
                .collect(),
        }
    }

    pub fn add(&self, other: &Self) -> Result<Self, Error> {
        self.zip_with(other, |a, b| a + b)
    }

    pub fn sub(&self, other: &Self) -> Result<Self, Error> {
        self.zip_with(other, |a, b| a - b)
    }

    pub fn mul(&self, other: &Self) -> Result<Self, Error> {
        self.zip_with(other, |a, b| a * b)
    }

    pub fn min_with(&self, other: &Self) -> Result<Self, Error> {
        self.zip_with(other, i64::min)
    }

    pub fn max_with(&self, other: &Self) -> Result<Self, Error> {
        self.zip_with(other, i64::max)
    }

    /// Product of all values (1 for an empty tuple)
    pub fn product(&self) -> i64 {
        self.vals().product()
    }

    /// Dot-product with a stride tuple, used for linearization
    pub fn dot(&self, strides: &Self) -> Result<i64, Error> {
        Ok(self
            .zip_with(strides, |a, b| a * b)?
            .vals()
            .sum())
    }

    /// Project onto a sub-ordering of names; every requested name must exist
    pub fn project(&self, names: &[&str]) -> Result<Self, Error> {
        let mut out = Self::new();
        for name in names {
            out.push(*name, self.lookup(name)?);
        }
        Ok(out)
    }
}
//
impl fmt::Display for IdxTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (n, v)) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{n}={v}")?;
        }
        Ok(())
    }
}

/// The dimension declaration of one solution
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DimSet {
    step_dim: String,
    domain_dims: Vec<String>,
    misc_dims: Vec<String>,
}
//
impl DimSet {
    /// Declare the dimensions of a solution
    ///
    /// Names must be unique across all three kinds.
    pub fn new(
        step_dim: impl Into<String>,
        domain_dims: &[&str],
        misc_dims: &[&str],
    ) -> Result<Self, Error> {
        let step_dim = step_dim.into();
        let mut seen = vec![step_dim.as_str()];
        for name in domain_dims.iter().chain(misc_dims) {
            if seen.contains(name) {
                return Err(Error::InvalidArgument(format!(
                    "dimension `{name}` declared more than once"
                )));
            }
            seen.push(*name);
        }
        Ok(Self {
            step_dim,
            domain_dims: domain_dims.iter().map(|s| s.to_string()).collect(),
            misc_dims: misc_dims.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn step_dim(&self) -> &str {
        &self.step_dim
    }

    pub fn domain_dims(&self) -> &[String] {
        &self.domain_dims
    }

    pub fn misc_dims(&self) -> &[String] {
        &self.misc_dims
    }

    /// Kind of a declared dimension, or None for unknown names
    pub fn kind_of(&self, name: &str) -> Option<DimKind> {
        if name == self.step_dim {
            Some(DimKind::Step)
        } else if self.domain_dims.iter().any(|d| d == name) {
            Some(DimKind::Domain)
        } else if self.misc_dims.iter().any(|d| d == name) {
            Some(DimKind::Misc)
        } else {
            None
        }
    }

    /// Check that `dim` exists and may play the requested roles in `op`
    pub fn check_kind(
        &self,
        dim: &str,
        op: &'static str,
        step_ok: bool,
        domain_ok: bool,
        misc_ok: bool,
    ) -> Result<DimKind, Error> {
        let kind = self.kind_of(dim).ok_or_else(|| {
            Error::InvalidArgument(format!("unknown dimension `{dim}` in {op}"))
        })?;
        let ok = match kind {
            DimKind::Step => step_ok,
            DimKind::Domain => domain_ok,
            DimKind::Misc => misc_ok,
        };
        if ok {
            Ok(kind)
        } else {
            let expected = if domain_ok {
                "domain"
            } else if step_ok {
                "step"
            } else {
                "misc"
            };
            Err(Error::DimKindMismatch {
                dim: dim.to_string(),
                expected,
                op,
            })
        }
    }

    /// Tuple over the domain dimensions, every value set to `val`
    pub fn domain_tuple(&self, val: i64) -> IdxTuple {
        IdxTuple::filled(self.domain_dims.iter().map(String::as_str), val)
    }
}

/// Floor division: rounds toward negative infinity
pub fn div_floor(x: i64, y: i64) -> i64 {
    debug_assert!(y > 0);
    let q = x / y;
    if x % y != 0 && (x < 0) != (y < 0) {
        q - 1
    } else {
        q
    }
}

/// Ceiling division: rounds toward positive infinity
pub fn div_ceil(x: i64, y: i64) -> i64 {
    -div_floor(-x, y)
}

/// Mathematical modulo: result is always in `[0, y)` for `y > 0`
///
/// Needed for ring indexing and wave-front skewing, where the left-hand
/// side is routinely negative.
pub fn imod(x: i64, y: i64) -> i64 {
    x - div_floor(x, y) * y
}

/// Round `val` up to a multiple of `mult`
pub fn round_up(val: i64, mult: i64) -> i64 {
    debug_assert!(mult > 0);
    div_ceil(val, mult) * mult
}

/// Visit every index tuple in the half-open box `[begin, end)`,
/// innermost (last-declared) dimension fastest
pub fn for_each_in<E: From<Error>>(
    begin: &IdxTuple,
    end: &IdxTuple,
    mut f: impl FnMut(&IdxTuple) -> Result<(), E>,
) -> Result<(), E> {
    if !begin.same_names(end) {
        return Err(Error::InvalidArgument(format!(
            "range bounds ({begin}) and ({end}) disagree"
        ))
        .into());
    }
    let ndims = begin.len();
    if begin.iter().zip(end.iter()).any(|((_, b), (_, e))| b >= e) {
        return Ok(()); // empty box
    }
    let mut cur = begin.clone();
    loop {
        f(&cur)?;

        // Odometer increment
        let mut d = ndims;
        loop {
            if d == 0 {
                return Ok(());
            }
            d -= 1;
            let name = begin.name_at(d).to_string();
            let next = cur.val_at(d) + 1;
            if next < end.val_at(d) {
                cur.set(&name, next)?;
                break;
            }
            cur.set(&name, begin.val_at(d))?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_division() {
        assert_eq!(div_floor(7, 2), 3);
        assert_eq!(div_floor(-7, 2), -4);
        assert_eq!(div_ceil(7, 2), 4);
        assert_eq!(div_ceil(-7, 2), -3);
        assert_eq!(round_up(5, 4), 8);
        assert_eq!(round_up(8, 4), 8);
        assert_eq!(round_up(-5, 4), -4);
    }

    #[test]
    fn mathematical_modulo() {
        assert_eq!(imod(7, 3), 1);
        assert_eq!(imod(-1, 3), 2);
        assert_eq!(imod(-3, 3), 0);
        assert_eq!(imod(0, 3), 0);
        // Congruent values agree, as required by ring indexing
        for x in -10..10 {
            assert_eq!(imod(x, 4), imod(x + 8, 4));
        }
    }

    #[test]
    fn tuple_ops() {
        let a = IdxTuple::from_pairs([("x", 4), ("y", -2)]);
        let b = IdxTuple::from_pairs([("x", 3), ("y", 5)]);
        assert_eq!(a.add(&b).unwrap(), IdxTuple::from_pairs([("x", 7), ("y", 3)]));
        assert_eq!(a.sub(&b).unwrap(), IdxTuple::from_pairs([("x", 1), ("y", -7)]));
        assert_eq!(a.max_with(&b).unwrap(), IdxTuple::from_pairs([("x", 4), ("y", 5)]));
        assert_eq!(b.product(), 15);
        assert_eq!(a.dot(&b).unwrap(), 4 * 3 + (-2) * 5);
        assert_eq!(a.get("y"), Some(-2));
        assert_eq!(a.get("z"), None);
    }

    #[test]
    fn tuple_name_mismatch() {
        let a = IdxTuple::from_pairs([("x", 1)]);
        let b = IdxTuple::from_pairs([("y", 1)]);
        assert!(matches!(a.add(&b), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn tuple_projection() {
        let a = IdxTuple::from_pairs([("t", 9), ("x", 4), ("y", 2)]);
        let p = a.project(&["y", "x"]).unwrap();
        assert_eq!(p, IdxTuple::from_pairs([("y", 2), ("x", 4)]));
        assert!(a.project(&["w"]).is_err());
    }

    #[test]
    fn dim_kinds() {
        let dims = DimSet::new("t", &["x", "y"], &["c"]).unwrap();
        assert_eq!(dims.kind_of("t"), Some(DimKind::Step));
        assert_eq!(dims.kind_of("x"), Some(DimKind::Domain));
        assert_eq!(dims.kind_of("c"), Some(DimKind::Misc));
        assert_eq!(dims.kind_of("w"), None);
        assert!(dims.check_kind("x", "set_block_size", false, true, false).is_ok());
        assert!(matches!(
            dims.check_kind("t", "set_block_size", false, true, false),
            Err(Error::DimKindMismatch { .. })
        ));
        assert!(DimSet::new("t", &["x", "x"], &[]).is_err());
    }

    #[test]
    fn range_visit_order() {
        let begin = IdxTuple::from_pairs([("x", 0), ("y", -1)]);
        let end = IdxTuple::from_pairs([("x", 2), ("y", 1)]);
        let mut seen = Vec::new();
        for_each_in(&begin, &end, |pt| {
            seen.push((pt.get("x").unwrap(), pt.get("y").unwrap()));
            Ok::<(), Error>(())
        })
        .unwrap();
        // Innermost (y) varies fastest
        assert_eq!(seen, vec![(0, -1), (0, 0), (1, -1), (1, 0)]);
    }

    #[test]
    fn range_visit_empty() {
        let begin = IdxTuple::from_pairs([("x", 3)]);
        let end = IdxTuple::from_pairs([("x", 3)]);
        let mut count = 0;
        for_each_in(&begin, &end, |_| {
            count += 1;
            Ok::<(), Error>(())
        })
        .unwrap();
        assert_eq!(count, 0);
    }
}

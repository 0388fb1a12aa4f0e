//! Axis-aligned bounding boxes over the domain dimensions

use crate::dims::{imod, IdxTuple};

/// An n-D domain-aligned box: `begin` inclusive, `end` exclusive
///
/// `num_points` counts the valid points inside the box; it equals
/// `size()` for a full box but may be smaller when a bundle's sub-domain
/// only covers part of it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BoundingBox {
    pub begin: IdxTuple,
    pub end: IdxTuple,
    pub num_points: i64,
}
//
impl BoundingBox {
    /// Full box over `[begin, end)`
    pub fn new(begin: IdxTuple, end: IdxTuple) -> Self {
        debug_assert!(begin.same_names(&end));
        let mut bb = Self {
            begin,
            end,
            num_points: 0,
        };
        bb.num_points = bb.size();
        bb
    }

    /// Per-dimension lengths, clamped to zero
    pub fn len(&self) -> IdxTuple {
        self.end
            .zip_with(&self.begin, |e, b| (e - b).max(0))
            .expect("begin/end share names by construction")
    }

    /// Total points in the box (product of lengths)
    pub fn size(&self) -> i64 {
        self.len().product()
    }

    /// All points in the box are valid
    pub fn is_full(&self) -> bool {
        self.num_points == self.size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Begin is vector-aligned in every dimension
    pub fn is_aligned(&self, folds: &IdxTuple) -> bool {
        self.begin
            .iter()
            .all(|(name, b)| match folds.get(name) {
                Some(f) if f > 1 => imod(b, f) == 0,
                _ => true,
            })
    }

    /// Every length is a multiple of the vector cluster
    pub fn is_cluster_mult(&self, clusters: &IdxTuple) -> bool {
        self.len()
            .iter()
            .all(|(name, l)| match clusters.get(name) {
                Some(c) if c > 1 => l % c == 0,
                _ => true,
            })
    }

    /// Point containment
    pub fn contains(&self, pt: &IdxTuple) -> bool {
        self.begin.iter().zip(self.end.iter()).all(|((name, b), (_, e))| {
            match pt.get(name) {
                Some(v) => v >= b && v < e,
                None => false,
            }
        })
    }

    /// Intersection with another box over the same dimensions
    ///
    /// The result may be empty; `num_points` is reset to the full size.
    pub fn intersect(&self, other: &Self) -> Self {
        let begin = self
            .begin
            .max_with(&other.begin)
            .expect("boxes share dimensions");
        let end = self
            .end
            .min_with(&other.end)
            .expect("boxes share dimensions")
            .max_with(&begin)
            .expect("same names");
        Self::new(begin, end)
    }
}
//
impl std::fmt::Display for BoundingBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}) .. [{})", self.begin, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bb(xb: i64, xe: i64, yb: i64, ye: i64) -> BoundingBox {
        BoundingBox::new(
            IdxTuple::from_pairs([("x", xb), ("y", yb)]),
            IdxTuple::from_pairs([("x", xe), ("y", ye)]),
        )
    }

    #[test]
    fn sizes_and_flags() {
        let b = bb(0, 8, -1, 3);
        assert_eq!(b.size(), 8 * 4);
        assert!(b.is_full());
        assert!(!b.is_empty());
        let folds = IdxTuple::from_pairs([("x", 4), ("y", 1)]);
        assert!(b.is_aligned(&folds));
        assert!(!bb(2, 8, 0, 4).is_aligned(&folds));
        let clusters = IdxTuple::from_pairs([("x", 4), ("y", 2)]);
        assert!(b.is_cluster_mult(&clusters));
        assert!(!bb(0, 6, 0, 4).is_cluster_mult(&clusters));
    }

    #[test]
    fn containment() {
        let b = bb(0, 4, 0, 4);
        assert!(b.contains(&IdxTuple::from_pairs([("x", 0), ("y", 3)])));
        assert!(!b.contains(&IdxTuple::from_pairs([("x", 4), ("y", 0)])));
        assert!(!b.contains(&IdxTuple::from_pairs([("x", -1), ("y", 0)])));
    }

    #[test]
    fn intersection() {
        let a = bb(0, 8, 0, 8);
        let b = bb(4, 12, -2, 4);
        let i = a.intersect(&b);
        assert_eq!(i, bb(4, 8, 0, 4));
        // Disjoint boxes intersect to an empty box
        assert!(a.intersect(&bb(9, 12, 0, 4)).is_empty());
    }
}

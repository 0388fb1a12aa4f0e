//! Data side of the stencil runtime
//!
//! This crate owns everything the execution engine stores or indexes:
//! named-dimension index algebra, aligned (optionally NUMA-bound) buffer
//! allocation, domain bounding boxes, and the padded, vector-folded,
//! ring-buffered grid storage itself.

pub mod alloc;
pub mod bbox;
pub mod dims;
pub mod grid;

use thiserror::Error;

/// Computation precision
pub type Precision = f32;

/// Bytes per grid element
pub const ELEMENT_BYTES: usize = std::mem::size_of::<Precision>();

/// Things that can go wrong on the storage side
#[derive(Clone, Debug, Error)]
pub enum Error {
    /// Bad dimension name, negative size, or other caller mistake
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A dimension was used in a role it does not have
    #[error("dimension `{dim}` used as a {expected} dimension in {op}")]
    DimKindMismatch {
        dim: String,
        expected: &'static str,
        op: &'static str,
    },

    /// Grid access outside the allocated index range
    #[error("index {index} in dimension `{dim}` is outside the allowed range {first}..{last}")]
    OutOfBounds {
        dim: String,
        index: i64,
        first: i64,
        last: i64,
    },

    /// Grid sharing or cross-rank consistency check failed
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Explicit NUMA binding requested on a build or system without support
    #[error("explicit NUMA policy allocation is not available (requested {request})")]
    NumaUnavailable { request: String },

    /// Allocation failure
    #[error("cannot allocate {}", byte_str(*nbytes))]
    OutOfMemory { nbytes: usize },
}

/// Format a byte count with a binary SI multiplier, e.g. "412KiB"
pub fn byte_str(nbytes: usize) -> String {
    let num = nbytes as f64;
    const ONE_K: f64 = 1024.0;
    const ONE_M: f64 = ONE_K * ONE_K;
    const ONE_G: f64 = ONE_K * ONE_M;
    const ONE_T: f64 = ONE_K * ONE_G;
    if num > ONE_T {
        format!("{:.2}TiB", num / ONE_T)
    } else if num > ONE_G {
        format!("{:.2}GiB", num / ONE_G)
    } else if num > ONE_M {
        format!("{:.2}MiB", num / ONE_M)
    } else if num > ONE_K {
        format!("{:.2}KiB", num / ONE_K)
    } else {
        format!("{num}B")
    }
}

/// Format a rate or count with a decimal SI multiplier, e.g. "3.14M"
pub fn num_str(num: f64) -> String {
    const ONE_K: f64 = 1e3;
    const ONE_M: f64 = 1e6;
    const ONE_G: f64 = 1e9;
    const ONE_T: f64 = 1e12;
    if num > ONE_T {
        format!("{:.2}T", num / ONE_T)
    } else if num > ONE_G {
        format!("{:.2}G", num / ONE_G)
    } else if num > ONE_M {
        format!("{:.2}M", num / ONE_M)
    } else if num > ONE_K {
        format!("{:.2}K", num / ONE_K)
    } else {
        format!("{num:.2}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_strings() {
        assert_eq!(byte_str(100), "100B");
        assert_eq!(byte_str(2048), "2.00KiB");
        assert_eq!(byte_str(3 << 20), "3.00MiB");
    }

    #[test]
    fn num_strings() {
        assert_eq!(num_str(12.0), "12.00");
        assert_eq!(num_str(2.5e6), "2.50M");
    }
}

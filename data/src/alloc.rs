//! Aligned and NUMA-bound buffer allocation
//!
//! Grid storage and halo-exchange buffers are handed out as opaquely owned
//! byte regions. Small regions are cache-line aligned; anything at or above
//! the huge-page threshold is huge-page aligned so the kernel can back it
//! with 2 MiB pages. When the `numa` feature is enabled, regions can
//! additionally be bound to a NUMA node through hwloc.

use crate::Error;
use std::alloc::Layout;
use std::ptr::NonNull;

/// Cache-line size assumed for alignment purposes
pub const CACHELINE_BYTES: usize = 64;

/// Allocations at least this large are huge-page aligned
pub const HUGE_PAGE_BYTES: usize = 2 << 20;

/// Inter-buffer pad in cache lines, scaled by the settings multiplier,
/// added to every grid allocation to avoid conflict-miss aliasing between
/// grids whose sizes are powers of two.
pub const BUF_PAD_LINES: usize = 7;

/// NUMA placement policy for one allocation
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum NumaPref {
    /// Plain aligned allocation; always succeeds
    #[default]
    None,
    /// Prefer the given node, falling back to others under pressure
    Preferred(u32),
    /// Interleave pages across all nodes
    Interleave,
    /// Bind to the node of the allocating thread
    Local,
}
//
impl std::fmt::Display for NumaPref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NumaPref::None => f.write_str("none"),
            NumaPref::Preferred(n) => write!(f, "node {n}"),
            NumaPref::Interleave => f.write_str("interleave"),
            NumaPref::Local => f.write_str("local"),
        }
    }
}

/// Owned, zero-initialized, aligned byte region
pub struct AllocBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}
//
// SAFETY: the region is plain bytes behind a raw pointer with no thread
// affinity. Synchronization of concurrent element writes is the caller's
// contract (see `Grid::write_elem_unsync`).
unsafe impl Send for AllocBuf {}
unsafe impl Sync for AllocBuf {}
//
impl AllocBuf {
    /// Allocate `nbytes` under the given NUMA policy
    pub fn new(nbytes: usize, numa: NumaPref) -> Result<Self, Error> {
        let nbytes = nbytes.max(1);
        let align = if nbytes >= HUGE_PAGE_BYTES {
            HUGE_PAGE_BYTES
        } else {
            CACHELINE_BYTES
        };
        let layout = Layout::from_size_align(nbytes, align)
            .map_err(|_| Error::OutOfMemory { nbytes })?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(ptr) else {
            return Err(Error::OutOfMemory { nbytes });
        };
        let buf = Self { ptr, layout };
        bind_numa(&buf, numa)?;
        Ok(buf)
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    /// Raw base pointer; valid for `len()` bytes for the lifetime of `self`
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the region is owned, initialized, and live for &self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and &mut self guarantees uniqueness
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}
//
impl Drop for AllocBuf {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in new()
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
//
impl std::fmt::Debug for AllocBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocBuf")
            .field("len", &self.len())
            .field("align", &self.layout.align())
            .finish()
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "numa")] {
        use hwlocality::memory::binding::{MemoryBindingFlags, MemoryBindingPolicy};
        use hwlocality::object::types::ObjectType;
        use hwlocality::Topology;

        /// Apply a NUMA policy to a freshly allocated region
        fn bind_numa(buf: &AllocBuf, numa: NumaPref) -> Result<(), Error> {
            if numa == NumaPref::None {
                return Ok(());
            }
            let unavailable = |e: String| Error::NumaUnavailable {
                request: format!("{numa}: {e}"),
            };
            let topology = Topology::new().map_err(|e| unavailable(e.to_string()))?;
            let nodeset = match numa {
                NumaPref::None => unreachable!(),
                NumaPref::Preferred(node) => {
                    let obj = topology
                        .objects_with_type(ObjectType::NUMANode)
                        .nth(node as usize)
                        .ok_or_else(|| unavailable(format!("no NUMA node {node}")))?;
                    obj.nodeset()
                        .ok_or_else(|| unavailable("node has no nodeset".into()))?
                        .clone()
                }
                NumaPref::Interleave | NumaPref::Local => topology.nodeset().clone(),
            };
            let policy = match numa {
                NumaPref::Interleave => MemoryBindingPolicy::Interleave,
                NumaPref::Local => MemoryBindingPolicy::FirstTouch,
                _ => MemoryBindingPolicy::Bind,
            };
            topology
                .bind_memory_area(
                    buf.as_slice(),
                    &nodeset,
                    policy,
                    MemoryBindingFlags::ASSUME_SINGLE_THREAD,
                )
                .map_err(|e| unavailable(e.to_string()))?;
            log::debug!("bound {} bytes to {numa}", buf.len());
            Ok(())
        }
    } else {
        /// Without the `numa` feature, any explicit policy is unavailable
        fn bind_numa(_buf: &AllocBuf, numa: NumaPref) -> Result<(), Error> {
            match numa {
                NumaPref::None => Ok(()),
                _ => Err(Error::NumaUnavailable {
                    request: numa.to_string(),
                }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_allocations_are_cacheline_aligned() {
        let buf = AllocBuf::new(1000, NumaPref::None).unwrap();
        assert_eq!(buf.len(), 1000);
        assert_eq!(buf.as_ptr() as usize % CACHELINE_BYTES, 0);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
    }

    #[test]
    fn large_allocations_are_hugepage_aligned() {
        let buf = AllocBuf::new(HUGE_PAGE_BYTES, NumaPref::None).unwrap();
        assert_eq!(buf.as_ptr() as usize % HUGE_PAGE_BYTES, 0);
    }

    #[cfg(not(feature = "numa"))]
    #[test]
    fn explicit_numa_without_support_fails() {
        assert!(matches!(
            AllocBuf::new(64, NumaPref::Preferred(0)),
            Err(Error::NumaUnavailable { .. })
        ));
        // Policy "none" always succeeds
        assert!(AllocBuf::new(64, NumaPref::None).is_ok());
    }
}

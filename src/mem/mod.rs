//! Memory services for the factorization: the buddy pool, the paired LIFO
//! stacks, the contribution-block facade over both, and the factor arena.

pub mod buddy;
pub mod stack;

pub use buddy::BuddyAlloc;
pub use stack::{StackAlloc, StackBlock};

use core::mem::size_of;
use core::ops::Range;
use core::ptr::NonNull;
use equator::assert;

#[inline]
pub(crate) fn fill_zero<T: bytemuck::Zeroable>(slice: &mut [T]) {
    let len = slice.len();
    unsafe { core::ptr::write_bytes(slice.as_mut_ptr(), 0u8, len) }
}

#[derive(Copy, Clone, Debug)]
enum Inner {
    Stack { even: bool, offset: usize },
    Pool { ptr: NonNull<f64> },
}

/// Handle to one contribution block.
///
/// Handles are affine: they are produced by [`ContribAlloc::alloc`] and
/// consumed by [`ContribAlloc::release`].
#[derive(Debug)]
pub struct ContribBlock {
    len: usize,
    inner: Inner,
}

impl ContribBlock {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

enum Mode {
    /// The stack variant: blocks live on one of two LIFO stacks selected by
    /// the owning node's depth parity.
    PairedStacks { even: StackAlloc, odd: StackAlloc },
    /// The pool variant: blocks are served from a shared buddy table.
    Pool { pool: BuddyAlloc, live: usize },
}

/// Allocation facade for contribution blocks.
pub struct ContribAlloc {
    mode: Mode,
}

impl ContribAlloc {
    /// Two LIFO stacks alternated by tree depth parity.
    pub fn paired_stacks() -> Self {
        Self {
            mode: Mode::PairedStacks {
                even: StackAlloc::new(),
                odd: StackAlloc::new(),
            },
        }
    }

    /// Blocks served from a buddy pool.
    pub fn pool(pool: BuddyAlloc) -> Self {
        Self {
            mode: Mode::Pool { pool, live: 0 },
        }
    }

    /// Allocates a zeroed block of `len` reals for a node of the given depth
    /// parity.
    pub fn alloc(&mut self, even: bool, len: usize) -> ContribBlock {
        match &mut self.mode {
            Mode::PairedStacks { even: e, odd: o } => {
                let stack = if even { e } else { o };
                let block = stack.alloc(len);
                ContribBlock {
                    len,
                    inner: Inner::Stack {
                        even,
                        offset: block.offset,
                    },
                }
            }
            Mode::Pool { pool, live } => {
                let ptr = pool.allocate(len * size_of::<f64>()).cast::<f64>();
                unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0u8, len) };
                *live += len;
                ContribBlock {
                    len,
                    inner: Inner::Pool { ptr },
                }
            }
        }
    }

    /// Releases a block. Stack blocks must be released in reverse allocation
    /// order within their stack.
    #[track_caller]
    pub fn release(&mut self, block: ContribBlock) {
        match (&mut self.mode, block.inner) {
            (Mode::PairedStacks { even: e, odd: o }, Inner::Stack { even, offset }) => {
                let stack = if even { e } else { o };
                stack.free(StackBlock {
                    offset,
                    len: block.len,
                });
            }
            (Mode::Pool { pool, live }, Inner::Pool { ptr }) => {
                *live -= block.len;
                unsafe { pool.deallocate(ptr.cast(), block.len * size_of::<f64>()) };
            }
            _ => panic!("contribution block does not belong to this allocator"),
        }
    }

    /// Shared view of a block.
    pub fn get(&self, block: &ContribBlock) -> &[f64] {
        match (&self.mode, block.inner) {
            (Mode::PairedStacks { even: e, odd: o }, Inner::Stack { even, offset }) => {
                let stack = if even { e } else { o };
                stack.get_range(offset, block.len)
            }
            (Mode::Pool { .. }, Inner::Pool { ptr }) => unsafe {
                core::slice::from_raw_parts(ptr.as_ptr(), block.len)
            },
            _ => panic!("contribution block does not belong to this allocator"),
        }
    }

    /// Mutable view of a block.
    pub fn get_mut(&mut self, block: &ContribBlock) -> &mut [f64] {
        match (&mut self.mode, block.inner) {
            (Mode::PairedStacks { even: e, odd: o }, Inner::Stack { even, offset }) => {
                let stack = if even { e } else { o };
                stack.get_range_mut(offset, block.len)
            }
            (Mode::Pool { .. }, Inner::Pool { ptr }) => unsafe {
                core::slice::from_raw_parts_mut(ptr.as_ptr(), block.len)
            },
            _ => panic!("contribution block does not belong to this allocator"),
        }
    }

    /// Mutable view of `dst` plus shared view of `src`, for folding one block
    /// into another. The blocks must be distinct; on the same stack, `dst`
    /// must be the older allocation.
    #[track_caller]
    pub fn fold_mut(&mut self, dst: &ContribBlock, src: &ContribBlock) -> (&mut [f64], &[f64]) {
        match (&mut self.mode, dst.inner, src.inner) {
            (
                Mode::PairedStacks { even: e, odd: o },
                Inner::Stack {
                    even: de,
                    offset: doff,
                },
                Inner::Stack {
                    even: se,
                    offset: soff,
                },
            ) => {
                if de != se {
                    let (dstack, sstack) = if de { (e, &*o) } else { (o, &*e) };
                    (
                        dstack.get_range_mut(doff, dst.len),
                        sstack.get_range(soff, src.len),
                    )
                } else {
                    let stack = if de { e } else { o };
                    stack.disjoint_pair(doff, dst.len, soff, src.len)
                }
            }
            (Mode::Pool { .. }, Inner::Pool { ptr: dptr }, Inner::Pool { ptr: sptr }) => {
                // live pool blocks never overlap
                let dstart = dptr.as_ptr() as usize;
                let sstart = sptr.as_ptr() as usize;
                assert!(
                    dstart + dst.len * size_of::<f64>() <= sstart
                        || sstart + src.len * size_of::<f64>() <= dstart
                );
                unsafe {
                    (
                        core::slice::from_raw_parts_mut(dptr.as_ptr(), dst.len),
                        core::slice::from_raw_parts(sptr.as_ptr(), src.len),
                    )
                }
            }
            _ => panic!("contribution block does not belong to this allocator"),
        }
    }

    /// Number of reals currently outstanding.
    pub fn live_len(&self) -> usize {
        match &self.mode {
            Mode::PairedStacks { even, odd } => even.live_len() + odd.live_len(),
            Mode::Pool { live, .. } => *live,
        }
    }
}

/// Bump arena for factor storage, the factorization-lifetime allocator behind
/// every front's `lcol` and `perm`.
///
/// Allocations are identified by stable offset ranges, so parent and child
/// front storage can be borrowed disjointly by splitting the underlying
/// buffers.
#[derive(Debug)]
pub struct FactorArena {
    pub(crate) real: Vec<f64>,
    pub(crate) int: Vec<usize>,
}

impl FactorArena {
    pub fn new() -> Self {
        Self {
            real: Vec::new(),
            int: Vec::new(),
        }
    }

    /// Allocates `len` zeroed reals.
    pub fn alloc_real(&mut self, len: usize) -> Range<usize> {
        let start = self.real.len();
        self.real.resize(start + len, 0.0);
        start..start + len
    }

    /// Allocates `len` zeroed indices.
    pub fn alloc_int(&mut self, len: usize) -> Range<usize> {
        let start = self.int.len();
        self.int.resize(start + len, 0);
        start..start + len
    }
}

impl Default for FactorArena {
    fn default() -> Self {
        Self::new()
    }
}

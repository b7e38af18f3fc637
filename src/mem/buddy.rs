//! Buddy-system allocator for transient blocks.
//!
//! A page owns one 32-byte-aligned buffer split into `1 << (NLEVEL - 1)`
//! minimum-size blocks. Per-level free lists are threaded through a side
//! array indexed by block number; a block's partner at level `l` is
//! `idx ^ (1 << l)`. The table keeps pages in insertion order, tries them
//! front to back, grows with pages of at least double the previous size, and
//! serializes everything behind a single lock.

use core::ptr::NonNull;
use equator::assert;
use parking_lot::Mutex;
use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::sync::Arc;

const NLEVEL: usize = 8;
const ALIGN: usize = 32;
const NBLOCK: usize = 1 << (NLEVEL - 1);

const NONE: i32 = -1;
const ISSUED: i32 = -2;

struct Page {
    base: NonNull<u8>,
    min_size: usize,
    size: usize,
    head: [i32; NLEVEL],
    next: Box<[i32]>,
}

// the page owns its buffer exclusively
unsafe impl Send for Page {}

impl Page {
    fn new(size: usize) -> Self {
        let min_size = Ord::max(1, size >> (NLEVEL - 1));
        let min_size = ALIGN * min_size.div_ceil(ALIGN);
        let size = min_size << (NLEVEL - 1);

        let layout = Layout::from_size_align(size, ALIGN).unwrap();
        let base = match NonNull::new(unsafe { alloc(layout) }) {
            Some(base) => base,
            None => handle_alloc_error(layout),
        };

        // a single free block spanning the whole page
        let mut head = [NONE; NLEVEL];
        head[NLEVEL - 1] = 0;

        Self {
            base,
            min_size,
            size,
            head,
            next: vec![NONE; NBLOCK].into_boxed_slice(),
        }
    }

    fn allocate(&mut self, sz: usize) -> Option<NonNull<u8>> {
        if sz > self.size {
            return None;
        }
        let idx = self.pop_free(self.level_for(sz))?;
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(idx as usize * self.min_size)) })
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, sz: usize) {
        let idx = self.block_of(ptr);
        self.mark_free(idx, self.level_for(sz));
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        let p = ptr.as_ptr() as usize;
        let base = self.base.as_ptr() as usize;
        p >= base && p < base + self.size
    }

    /// Smallest level whose blocks hold `sz` bytes.
    fn level_for(&self, sz: usize) -> usize {
        let blocks = sz.div_ceil(self.min_size);
        blocks.next_power_of_two().trailing_zeros() as usize
    }

    fn block_of(&self, ptr: NonNull<u8>) -> i32 {
        ((ptr.as_ptr() as usize - self.base.as_ptr() as usize) / self.min_size) as i32
    }

    /// Pops a free block at `level`, splitting one from the level above if
    /// required: the left half is issued, the right half goes on the free
    /// list.
    fn pop_free(&mut self, level: usize) -> Option<i32> {
        if level >= NLEVEL {
            return None;
        }
        if self.head[level] == NONE {
            let above = self.pop_free(level + 1)?;
            let right = above ^ (1 << level);
            self.next[right as usize] = self.head[level];
            self.head[level] = right;
            self.next[above as usize] = ISSUED;
            return Some(above);
        }
        let p = self.head[level];
        self.head[level] = self.next[p as usize];
        self.next[p as usize] = ISSUED;
        Some(p)
    }

    /// Marks a block free, merging with its partner when the partner is free
    /// at the same level.
    fn mark_free(&mut self, idx: i32, level: usize) {
        if level < NLEVEL - 1 {
            let partner = idx ^ (1 << level);
            // the partner may be free in a list at a different level, in
            // which case it must stay there
            if self.next[partner as usize] != ISSUED && self.unlink(partner, level) {
                self.mark_free(Ord::min(idx, partner), level + 1);
                return;
            }
        }
        self.next[idx as usize] = self.head[level];
        self.head[level] = idx;
    }

    /// Removes `idx` from the free list of `level`; `false` if it is not
    /// there.
    fn unlink(&mut self, idx: i32, level: usize) -> bool {
        let mut prev = NONE;
        let mut current = self.head[level];
        while current != NONE && current != idx {
            prev = current;
            current = self.next[current as usize];
        }
        if current != idx {
            return false;
        }
        if prev == NONE {
            self.head[level] = self.next[idx as usize];
        } else {
            self.next[prev as usize] = self.next[idx as usize];
        }
        true
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        // everything released and coalesced back into one top-level block
        if self.head[NLEVEL - 1] != 0 {
            panic!("buddy page dropped with outstanding allocations");
        }
        let layout = Layout::from_size_align(self.size, ALIGN).unwrap();
        unsafe { dealloc(self.base.as_ptr(), layout) };
    }
}

struct Table {
    pages: Vec<Page>,
    max_size: usize,
}

impl Table {
    fn new(size: usize) -> Self {
        let page = Page::new(size);
        let max_size = page.size;
        Self {
            pages: vec![page],
            max_size,
        }
    }

    fn allocate(&mut self, sz: usize) -> NonNull<u8> {
        for page in &mut self.pages {
            if let Some(ptr) = page.allocate(sz) {
                return ptr;
            }
        }
        // no existing page admits the request: make a bigger page
        self.max_size = Ord::max(2 * self.max_size, sz);
        let mut page = Page::new(self.max_size);
        let ptr = match page.allocate(sz) {
            Some(ptr) => ptr,
            None => unreachable!("fresh page must admit the allocation"),
        };
        self.pages.push(page);
        ptr
    }

    fn deallocate(&mut self, ptr: NonNull<u8>, sz: usize) {
        for page in &mut self.pages {
            if page.owns(ptr) {
                page.deallocate(ptr, sz);
                return;
            }
        }
        panic!("pointer does not belong to this buddy table");
    }
}

/// Cloneable handle to a buddy-allocator table.
///
/// Clones share the table; allocation and release are serialized by a single
/// lock.
#[derive(Clone)]
pub struct BuddyAlloc {
    table: Arc<Mutex<Table>>,
}

impl BuddyAlloc {
    /// Creates a pool with an initial page of at least `size` bytes.
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        Self {
            table: Arc::new(Mutex::new(Table::new(size))),
        }
    }

    /// Allocates `sz` bytes aligned to 32 bytes, growing the pool when no
    /// existing page admits the request.
    pub fn allocate(&self, sz: usize) -> NonNull<u8> {
        self.table.lock().allocate(sz)
    }

    /// Releases an allocation previously returned by [`Self::allocate`] with
    /// the same `sz`.
    ///
    /// # Safety
    /// `ptr` must come from `allocate(sz)` on this pool (or a clone of it),
    /// and must not be used afterwards.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, sz: usize) {
        self.table.lock().deallocate(ptr, sz);
    }
}

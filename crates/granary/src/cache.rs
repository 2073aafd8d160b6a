//! The code cache: two bump-allocated arenas of executable memory.
//!
//! One arena holds translated block code, the other edge code. Both are
//! preallocated page-aligned executable regions. Allocation is a
//! lock-free atomic bump with byte granularity; when the bump pointer
//! would run off the end, a first-fit search over freed pages takes
//! over. Writing previously allocated bytes happens under a per-arena
//! transaction that holds a lock and leaves the pages
//! patchable-executable for the concurrent executors.

use crate::os::memory::{self, PageProtection};
use crate::{CachePc, PAGE_SIZE};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// A bump-allocated arena of patchable executable memory.
pub struct CodeCache {
    base: usize,
    len: usize,
    bump: AtomicUsize,
    /// One flag per page; true when the whole page was returned.
    free_map: Mutex<Vec<bool>>,
    write_lock: Mutex<()>,
}

impl CodeCache {
    /// Take ownership of `[base, base + num_pages * PAGE_SIZE)`, which
    /// must already be mapped patchable-executable.
    pub fn new(base: *mut u8, num_pages: usize) -> Self {
        Self {
            base: base as usize,
            len: num_pages * PAGE_SIZE,
            bump: AtomicUsize::new(0),
            free_map: Mutex::new(vec![false; num_pages]),
            write_lock: Mutex::new(()),
        }
    }

    pub fn base(&self) -> CachePc {
        self.base
    }

    pub fn contains(&self, pc: CachePc) -> bool {
        pc >= self.base && pc < self.base + self.len
    }

    /// Bytes handed out so far (excluding freed-page reuse).
    pub fn bytes_allocated(&self) -> usize {
        self.bump.load(Ordering::Relaxed).min(self.len)
    }

    /// Allocate `size` bytes of cache. Byte granularity, alignment 1;
    /// instructions may straddle cache lines.
    ///
    /// # Panics
    ///
    /// Panics when the arena is exhausted; there is no recovery from a
    /// full code cache.
    pub fn allocate_block(&self, size: usize) -> CachePc {
        assert!(size > 0, "zero-sized cache allocation");
        let offset = self.bump.fetch_add(size, Ordering::Relaxed);
        if offset + size <= self.len {
            return self.base + offset;
        }
        // Bump ran off the end; fall back to first-fit over freed pages.
        let num_pages = memory::num_pages_for(size);
        let mut map = self.free_map.lock().unwrap();
        let mut run = 0usize;
        for i in 0..map.len() {
            if map[i] {
                run += 1;
                if run == num_pages {
                    let first = i + 1 - num_pages;
                    for flag in &mut map[first..=i] {
                        *flag = false;
                    }
                    return self.base + first * PAGE_SIZE;
                }
            } else {
                run = 0;
            }
        }
        panic!("code cache exhausted ({} bytes requested)", size);
    }

    /// Return whole pages to the arena.
    pub fn free_pages(&self, pc: CachePc, num_pages: usize) {
        assert!(self.contains(pc) && (pc - self.base) % PAGE_SIZE == 0);
        let first = (pc - self.base) / PAGE_SIZE;
        let mut map = self.free_map.lock().unwrap();
        for flag in &mut map[first..first + num_pages] {
            debug_assert!(!*flag, "double free of cache page");
            *flag = true;
        }
    }

    /// Open a write transaction on `[begin, end)`. Only one writer per
    /// arena at a time; executors may keep running neighboring code.
    pub fn begin_transaction(&self, begin: CachePc, end: CachePc) -> CodeCacheTransaction<'_> {
        assert!(begin <= end);
        assert!(self.contains(begin) || begin == end);
        let guard = self.write_lock.lock().unwrap();
        let (first_page, num_pages) = page_span(begin, end);
        if num_pages > 0 {
            memory::protect_pages(
                first_page as *mut u8,
                num_pages,
                PageProtection::PatchableExecutable,
            );
        }
        CodeCacheTransaction {
            cache: self,
            first_page,
            num_pages,
            _guard: guard,
        }
    }
}

fn page_span(begin: usize, end: usize) -> (usize, usize) {
    if begin == end {
        return (begin & !(PAGE_SIZE - 1), 0);
    }
    let first = begin & !(PAGE_SIZE - 1);
    let last = (end - 1) & !(PAGE_SIZE - 1);
    (first, (last - first) / PAGE_SIZE + 1)
}

/// Exclusive write access to a sub-range of an arena. Protections are
/// restored when the transaction drops.
pub struct CodeCacheTransaction<'a> {
    cache: &'a CodeCache,
    first_page: usize,
    num_pages: usize,
    _guard: std::sync::MutexGuard<'a, ()>,
}

impl Drop for CodeCacheTransaction<'_> {
    fn drop(&mut self) {
        let _ = self.cache;
        if self.num_pages > 0 {
            memory::protect_pages(
                self.first_page as *mut u8,
                self.num_pages,
                PageProtection::PatchableExecutable,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os::memory::allocate_code_pages;

    #[test]
    fn bump_allocations_are_contiguous() {
        let base = allocate_code_pages(4);
        let cache = CodeCache::new(base, 4);
        let a = cache.allocate_block(100);
        let b = cache.allocate_block(20);
        assert_eq!(a + 100, b);
        assert!(cache.contains(a) && cache.contains(b));
        memory::free_pages(base, 4);
    }

    #[test]
    fn freed_pages_satisfy_overflow() {
        let base = allocate_code_pages(2);
        let cache = CodeCache::new(base, 2);
        let _ = cache.allocate_block(2 * PAGE_SIZE - 16);
        cache.free_pages(base as usize, 1);
        let again = cache.allocate_block(64);
        assert_eq!(again, base as usize);
        memory::free_pages(base, 2);
    }

    #[test]
    fn transactions_serialize_writers() {
        let base = allocate_code_pages(1);
        let cache = CodeCache::new(base, 1);
        let pc = cache.allocate_block(8);
        {
            let _tx = cache.begin_transaction(pc, pc + 8);
            unsafe { (pc as *mut u8).write(0xc3) };
        }
        assert_eq!(unsafe { *(pc as *const u8) }, 0xc3);
        memory::free_pages(base, 1);
    }
}

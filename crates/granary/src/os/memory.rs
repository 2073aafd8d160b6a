//! Page-grained memory, per the host OS contract.
//!
//! Allocation failures are invariant violations: there is no fallback
//! path for running out of code cache, so these calls panic rather than
//! returning errors.

use crate::PAGE_SIZE;

/// Protections a page range can be moved between.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageProtection {
    /// Executable, and writable for patching.
    PatchableExecutable,
    Executable,
    ReadOnly,
    ReadWrite,
    Inaccessible,
}

#[cfg(unix)]
mod imp {
    use super::PageProtection;
    use crate::PAGE_SIZE;
    use rustix::mm::{mmap_anonymous, mprotect, munmap, MapFlags, MprotectFlags, ProtFlags};

    pub fn allocate_pages(num_pages: usize, prot: ProtFlags) -> *mut u8 {
        let len = num_pages * PAGE_SIZE;
        let ptr = unsafe {
            mmap_anonymous(std::ptr::null_mut(), len, prot, MapFlags::PRIVATE)
                .expect("page allocation failed")
        };
        ptr.cast()
    }

    /// Executable pages, left writable so they can be patched.
    pub fn allocate_code_pages(num_pages: usize) -> *mut u8 {
        allocate_pages(
            num_pages,
            ProtFlags::READ | ProtFlags::WRITE | ProtFlags::EXEC,
        )
    }

    pub fn allocate_data_pages(num_pages: usize) -> *mut u8 {
        allocate_pages(num_pages, ProtFlags::READ | ProtFlags::WRITE)
    }

    pub fn free_pages(addr: *mut u8, num_pages: usize) {
        unsafe {
            munmap(addr.cast(), num_pages * PAGE_SIZE).expect("munmap failed");
        }
    }

    pub fn protect_pages(addr: *mut u8, num_pages: usize, prot: PageProtection) {
        let flags = match prot {
            PageProtection::PatchableExecutable => {
                MprotectFlags::READ | MprotectFlags::WRITE | MprotectFlags::EXEC
            }
            PageProtection::Executable => MprotectFlags::READ | MprotectFlags::EXEC,
            PageProtection::ReadOnly => MprotectFlags::READ,
            PageProtection::ReadWrite => MprotectFlags::READ | MprotectFlags::WRITE,
            PageProtection::Inaccessible => MprotectFlags::empty(),
        };
        unsafe {
            mprotect(addr.cast(), num_pages * PAGE_SIZE, flags).expect("mprotect failed");
        }
    }
}

#[cfg(unix)]
pub use imp::{allocate_code_pages, allocate_data_pages, free_pages, protect_pages};

/// Free code pages. Alias kept to mirror the allocation entry points.
pub fn free_code_pages(addr: *mut u8, num_pages: usize) {
    free_pages(addr, num_pages);
}

/// Free data pages.
pub fn free_data_pages(addr: *mut u8, num_pages: usize) {
    free_pages(addr, num_pages);
}

/// Round a byte count up to whole pages.
pub fn num_pages_for(bytes: usize) -> usize {
    bytes.div_ceil(PAGE_SIZE)
}

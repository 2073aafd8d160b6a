//! Block metadata.
//!
//! Every translated block carries one contiguous metadata record. Tools
//! and the translator register typed descriptors up front; once the
//! manager is finalized the per-descriptor offsets are frozen and every
//! record allocated from it has the same packed layout.
//!
//! Descriptors differ only in their equivalence policy:
//!
//! - *indexable* metadata participates in code-cache-index hashing and
//!   equality;
//! - *mutable* metadata is carried but ignored for equality;
//! - *unifiable* metadata can adapt: comparisons answer accept, adapt,
//!   or reject.

use crate::{AppPc, CachePc};
use rustc_hash::FxHasher;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::any::TypeId;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

/// Whether two pieces of unifiable metadata can be reconciled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnificationStatus {
    /// Unifies perfectly.
    Accept,
    /// Does not unify perfectly, but can be adapted.
    Adapt,
    /// Cannot be unified or adapted.
    Reject,
}

/// Behaviors every registered metadata type supplies.
pub trait MetaData: Default + Clone + Send + Sync + 'static {}
impl<T: Default + Clone + Send + Sync + 'static> MetaData for T {}

/// Metadata that participates in index hashing and equality.
pub trait IndexableMetaData: MetaData {
    fn hash_meta(&self, hasher: &mut dyn Hasher);
    fn equals(&self, other: &Self) -> bool;
}

/// Metadata that can adapt to an existing translation.
pub trait UnifiableMetaData: MetaData {
    fn can_unify_with(&self, other: &Self) -> UnificationStatus;
}

/// The policy class of a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetaKind {
    Indexable,
    Mutable,
    Unifiable,
}

/// Type-erased operations over one descriptor's bytes.
struct MetaOps {
    init: unsafe fn(*mut u8),
    copy: unsafe fn(*mut u8, *const u8),
    drop_in_place: unsafe fn(*mut u8),
    hash: Option<unsafe fn(*const u8, &mut dyn Hasher)>,
    equals: Option<unsafe fn(*const u8, *const u8) -> bool>,
    can_unify: Option<unsafe fn(*const u8, *const u8) -> UnificationStatus>,
}

/// Describes one registered metadata type.
struct MetaDescription {
    kind: MetaKind,
    size: usize,
    align: usize,
    ops: MetaOps,
}

unsafe fn init_shim<T: MetaData>(p: *mut u8) {
    p.cast::<T>().write(T::default());
}

unsafe fn copy_shim<T: MetaData>(dst: *mut u8, src: *const u8) {
    dst.cast::<T>().write((*src.cast::<T>()).clone());
}

unsafe fn drop_shim<T: MetaData>(p: *mut u8) {
    p.cast::<T>().drop_in_place();
}

unsafe fn hash_shim<T: IndexableMetaData>(p: *const u8, h: &mut dyn Hasher) {
    (*p.cast::<T>()).hash_meta(h);
}

unsafe fn equals_shim<T: IndexableMetaData>(a: *const u8, b: *const u8) -> bool {
    (*a.cast::<T>()).equals(&*b.cast::<T>())
}

unsafe fn unify_shim<T: UnifiableMetaData>(a: *const u8, b: *const u8) -> UnificationStatus {
    (*a.cast::<T>()).can_unify_with(&*b.cast::<T>())
}

/// Packs all registered descriptors into a single record layout and
/// allocates/frees those records.
pub struct MetaDataManager {
    descriptions: Vec<MetaDescription>,
    offsets: Vec<usize>,
    by_type: HashMap<TypeId, usize>,
    size: usize,
    align: usize,
    finalized: bool,
}

impl Default for MetaDataManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaDataManager {
    pub fn new() -> Self {
        Self {
            descriptions: Vec::new(),
            offsets: Vec::new(),
            by_type: HashMap::new(),
            size: 0,
            align: 1,
            finalized: false,
        }
    }

    fn register_raw<T: MetaData>(&mut self, kind: MetaKind, ops: MetaOps) {
        assert!(!self.finalized, "metadata registered after finalization");
        let prev = self.by_type.insert(TypeId::of::<T>(), self.descriptions.len());
        assert!(prev.is_none(), "metadata type registered twice");
        self.descriptions.push(MetaDescription {
            kind,
            size: std::mem::size_of::<T>(),
            align: std::mem::align_of::<T>(),
            ops,
        });
    }

    /// Register metadata carried for its value only.
    pub fn register_mutable<T: MetaData>(&mut self) {
        self.register_raw::<T>(
            MetaKind::Mutable,
            MetaOps {
                init: init_shim::<T>,
                copy: copy_shim::<T>,
                drop_in_place: drop_shim::<T>,
                hash: None,
                equals: None,
                can_unify: None,
            },
        );
    }

    /// Register metadata that keys the code-cache index.
    pub fn register_indexable<T: IndexableMetaData>(&mut self) {
        self.register_raw::<T>(
            MetaKind::Indexable,
            MetaOps {
                init: init_shim::<T>,
                copy: copy_shim::<T>,
                drop_in_place: drop_shim::<T>,
                hash: Some(hash_shim::<T>),
                equals: Some(equals_shim::<T>),
                can_unify: None,
            },
        );
    }

    /// Register metadata that adapts to existing translations.
    pub fn register_unifiable<T: UnifiableMetaData>(&mut self) {
        self.register_raw::<T>(
            MetaKind::Unifiable,
            MetaOps {
                init: init_shim::<T>,
                copy: copy_shim::<T>,
                drop_in_place: drop_shim::<T>,
                hash: None,
                equals: None,
                can_unify: Some(unify_shim::<T>),
            },
        );
    }

    /// Freeze the layout: compute each descriptor's offset in the packed
    /// record. Registration is no longer possible afterwards.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        let mut offset = 0usize;
        for desc in &self.descriptions {
            offset = offset.next_multiple_of(desc.align);
            self.offsets.push(offset);
            offset += desc.size;
            self.align = self.align.max(desc.align);
        }
        self.size = offset.next_multiple_of(self.align.max(1)).max(1);
        self.finalized = true;
    }

    fn layout(&self) -> Layout {
        Layout::from_size_align(self.size, self.align).expect("bad metadata layout")
    }

    fn offset_of<T: MetaData>(&self) -> usize {
        let idx = *self
            .by_type
            .get(&TypeId::of::<T>())
            .expect("metadata type not registered");
        self.offsets[idx]
    }
}

/// One packed metadata record. Clones are deep copies.
pub struct Meta {
    ptr: NonNull<u8>,
    mgr: Arc<MetaDataManager>,
}

unsafe impl Send for Meta {}
unsafe impl Sync for Meta {}

impl Meta {
    /// Allocate and initialize a fresh record.
    ///
    /// # Panics
    ///
    /// Panics if the manager has not been finalized.
    pub fn allocate(mgr: &Arc<MetaDataManager>) -> Self {
        assert!(mgr.finalized, "metadata allocated before finalization");
        let ptr = unsafe { alloc_zeroed(mgr.layout()) };
        let ptr = NonNull::new(ptr).expect("metadata allocation failed");
        for (desc, &off) in mgr.descriptions.iter().zip(&mgr.offsets) {
            unsafe { (desc.ops.init)(ptr.as_ptr().add(off)) };
        }
        Self {
            ptr,
            mgr: Arc::clone(mgr),
        }
    }

    /// Typed view of one registered component.
    pub fn get<T: MetaData>(&self) -> &T {
        let off = self.mgr.offset_of::<T>();
        unsafe { &*self.ptr.as_ptr().add(off).cast::<T>() }
    }

    /// Typed mutable view of one registered component.
    pub fn get_mut<T: MetaData>(&mut self) -> &mut T {
        let off = self.mgr.offset_of::<T>();
        unsafe { &mut *self.ptr.as_ptr().add(off).cast::<T>() }
    }

    /// Hash the indexable components.
    pub fn index_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        for (desc, &off) in self.mgr.descriptions.iter().zip(&self.mgr.offsets) {
            if let Some(hash) = desc.ops.hash {
                unsafe { hash(self.ptr.as_ptr().add(off), &mut hasher) };
            }
        }
        hasher.finish()
    }

    /// Strict equality over the indexable components.
    pub fn equals(&self, other: &Meta) -> bool {
        debug_assert!(Arc::ptr_eq(&self.mgr, &other.mgr));
        for (desc, &off) in self.mgr.descriptions.iter().zip(&self.mgr.offsets) {
            if let Some(equals) = desc.ops.equals {
                let ok = unsafe {
                    equals(self.ptr.as_ptr().add(off), other.ptr.as_ptr().add(off))
                };
                if !ok {
                    return false;
                }
            }
        }
        true
    }

    /// Combined unification verdict over the unifiable components.
    pub fn can_unify_with(&self, other: &Meta) -> UnificationStatus {
        let mut status = UnificationStatus::Accept;
        for (desc, &off) in self.mgr.descriptions.iter().zip(&self.mgr.offsets) {
            if let Some(can_unify) = desc.ops.can_unify {
                let s = unsafe {
                    can_unify(self.ptr.as_ptr().add(off), other.ptr.as_ptr().add(off))
                };
                status = match (status, s) {
                    (_, UnificationStatus::Reject) | (UnificationStatus::Reject, _) => {
                        return UnificationStatus::Reject;
                    }
                    (UnificationStatus::Adapt, _) | (_, UnificationStatus::Adapt) => {
                        UnificationStatus::Adapt
                    }
                    _ => UnificationStatus::Accept,
                };
            }
        }
        status
    }

    /// The record's address; used by the index for intrusive chaining.
    pub(crate) fn raw(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Rebuild a `Meta` from a raw record address previously obtained
    /// with [`Meta::raw`] and then leaked via [`Meta::into_raw`].
    ///
    /// # Safety
    ///
    /// `ptr` must be a live record allocated from `mgr`.
    pub(crate) unsafe fn from_raw(ptr: *mut u8, mgr: &Arc<MetaDataManager>) -> Self {
        Self {
            ptr: NonNull::new_unchecked(ptr),
            mgr: Arc::clone(mgr),
        }
    }

    /// Leak the record, returning its address.
    pub(crate) fn into_raw(self) -> *mut u8 {
        let ptr = self.ptr.as_ptr();
        std::mem::forget(self);
        ptr
    }
}

impl Clone for Meta {
    fn clone(&self) -> Self {
        assert!(self.mgr.finalized);
        let ptr = unsafe { alloc_zeroed(self.mgr.layout()) };
        let ptr = NonNull::new(ptr).expect("metadata allocation failed");
        for (desc, &off) in self.mgr.descriptions.iter().zip(&self.mgr.offsets) {
            unsafe { (desc.ops.copy)(ptr.as_ptr().add(off), self.ptr.as_ptr().add(off)) };
        }
        Self {
            ptr,
            mgr: Arc::clone(&self.mgr),
        }
    }
}

impl Drop for Meta {
    fn drop(&mut self) {
        for (desc, &off) in self.mgr.descriptions.iter().zip(&self.mgr.offsets) {
            unsafe { (desc.ops.drop_in_place)(self.ptr.as_ptr().add(off)) };
        }
        unsafe { dealloc(self.ptr.as_ptr(), self.mgr.layout()) };
    }
}

impl std::fmt::Debug for Meta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Meta({:p})", self.ptr)
    }
}

/// Where a block came from in the application.
#[derive(Clone, Default, Debug)]
pub struct AppMetaData {
    pub start_pc: AppPc,
}

impl IndexableMetaData for AppMetaData {
    fn hash_meta(&self, hasher: &mut dyn Hasher) {
        self.start_pc.hash(&mut HasherProxy(hasher));
    }

    fn equals(&self, other: &Self) -> bool {
        self.start_pc == other.start_pc
    }
}

/// Where a block went in the code cache.
#[derive(Clone, Default, Debug)]
pub struct CacheMetaData {
    pub start_pc: CachePc,
    /// Addresses of the out-of-line native-address cells this block's
    /// encoded code refers to.
    pub native_addresses: Vec<usize>,
}

/// Intrusive chain pointer for the code-cache index. Zero when the
/// block is unindexed; the index installs a tombstone or successor.
#[derive(Default)]
pub struct IndexMetaData {
    pub next: AtomicUsize,
}

impl Clone for IndexMetaData {
    fn clone(&self) -> Self {
        // A copied record is a fresh, unindexed block.
        Self::default()
    }
}

/// What is known about the stack on entry to a block.
#[derive(Clone, Default, Debug)]
pub struct StackMetaData {
    pub has_stack_hint: bool,
    pub behaves_like_callstack: bool,
}

impl StackMetaData {
    pub fn mark_stack_as_valid(&mut self) {
        self.has_stack_hint = true;
        self.behaves_like_callstack = true;
    }

    pub fn is_stack_valid(&self) -> bool {
        self.has_stack_hint && self.behaves_like_callstack
    }
}

impl UnifiableMetaData for StackMetaData {
    fn can_unify_with(&self, other: &Self) -> UnificationStatus {
        if self.has_stack_hint == other.has_stack_hint
            && self.behaves_like_callstack == other.behaves_like_callstack
        {
            UnificationStatus::Accept
        } else if !self.has_stack_hint {
            // We know nothing; an existing translation with a hint can
            // serve once adapted.
            UnificationStatus::Adapt
        } else {
            UnificationStatus::Reject
        }
    }
}

/// Adapter so `Hash` impls can feed a `dyn Hasher`.
struct HasherProxy<'a>(&'a mut dyn Hasher);

impl Hasher for HasherProxy<'_> {
    fn finish(&self) -> u64 {
        self.0.finish()
    }
    fn write(&mut self, bytes: &[u8]) {
        self.0.write(bytes);
    }
}

/// Build a manager with the translator's built-in metadata registered.
pub fn standard_manager() -> Arc<MetaDataManager> {
    let mut mgr = MetaDataManager::new();
    mgr.register_indexable::<AppMetaData>();
    mgr.register_mutable::<CacheMetaData>();
    mgr.register_mutable::<IndexMetaData>();
    mgr.register_unifiable::<StackMetaData>();
    mgr.finalize();
    Arc::new(mgr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_meta(mgr: &std::sync::Arc<MetaDataManager>, pc: AppPc) -> Meta {
        let mut meta = Meta::allocate(mgr);
        meta.get_mut::<AppMetaData>().start_pc = pc;
        meta
    }

    #[test]
    fn indexable_equality_matches_hash() {
        let mgr = standard_manager();
        let a = new_meta(&mgr, 0x1000);
        let b = new_meta(&mgr, 0x1000);
        let c = new_meta(&mgr, 0x2000);
        assert!(a.equals(&b));
        assert_eq!(a.index_hash(), b.index_hash());
        assert!(!a.equals(&c));
    }

    #[test]
    fn clones_are_deep_and_unindexed() {
        let mgr = standard_manager();
        let mut meta = Meta::allocate(&mgr);
        meta.get_mut::<AppMetaData>().start_pc = 0x1234;
        meta.get::<IndexMetaData>()
            .next
            .store(0xdead, std::sync::atomic::Ordering::Relaxed);
        let copy = meta.clone();
        assert_eq!(copy.get::<AppMetaData>().start_pc, 0x1234);
        assert_eq!(
            copy.get::<IndexMetaData>()
                .next
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn unification_follows_the_stack_hint() {
        let mgr = standard_manager();
        let mut a = Meta::allocate(&mgr);
        let b = Meta::allocate(&mgr);
        assert_eq!(a.can_unify_with(&b), UnificationStatus::Accept);
        // The other side knows more; we can adapt to it.
        let mut c = Meta::allocate(&mgr);
        c.get_mut::<StackMetaData>().mark_stack_as_valid();
        assert_eq!(b.can_unify_with(&c), UnificationStatus::Adapt);
        // We know more; an unhinted translation cannot serve us.
        a.get_mut::<StackMetaData>().mark_stack_as_valid();
        assert_eq!(a.can_unify_with(&b), UnificationStatus::Reject);
    }
}

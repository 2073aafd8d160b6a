//! The code cache index: metadata in, translation out.
//!
//! A lock-free two-level table keyed by the indexable portion of block
//! metadata. Entries chain intrusively through their `IndexMetaData`
//! next pointers; a chain ends at a tombstone. An entry is live exactly
//! when its next pointer is nonzero, which is what makes insertion a
//! single CAS on the chain head.

use crate::metadata::{IndexMetaData, Meta, MetaDataManager, UnificationStatus};
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Chain terminator; never a valid metadata address.
const TOMBSTONE: usize = 1;

/// Slots per second-level array: one page of pointers.
const NUM_SLOTS: usize = 512;

/// First-level fanout. One less than a page of pointers, so the two
/// levels use different residues of the hash.
const NUM_ARRAYS: usize = NUM_SLOTS - 1;

struct MetaArray {
    slots: Vec<AtomicUsize>,
}

impl MetaArray {
    fn new() -> Box<Self> {
        let mut slots = Vec::with_capacity(NUM_SLOTS);
        slots.resize_with(NUM_SLOTS, || AtomicUsize::new(0));
        Box::new(Self { slots })
    }
}

/// Result of an index lookup.
pub struct IndexFindResponse {
    pub status: UnificationStatus,
    /// A deep copy of the matched record, when one was found.
    pub meta: Option<Meta>,
}

/// The two-level lookup table.
pub struct Index {
    arrays: Vec<AtomicUsize>,
    mgr: Arc<MetaDataManager>,
}

impl Index {
    pub fn new(mgr: Arc<MetaDataManager>) -> Self {
        let mut arrays = Vec::with_capacity(NUM_ARRAYS);
        arrays.resize_with(NUM_ARRAYS, || AtomicUsize::new(0));
        Self { arrays, mgr }
    }

    fn position(&self, meta: &Meta) -> (usize, usize) {
        let hash = meta.index_hash() as usize;
        let second = (hash >> 3) % NUM_SLOTS;
        let first = (hash >> 12) % NUM_ARRAYS;
        (first, second)
    }

    fn array(&self, first: usize, create: bool) -> Option<&MetaArray> {
        let slot = &self.arrays[first];
        let mut p = slot.load(Ordering::Acquire);
        if p == 0 {
            if !create {
                return None;
            }
            let fresh = Box::into_raw(MetaArray::new()) as usize;
            match slot.compare_exchange(0, fresh, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => p = fresh,
                Err(existing) => {
                    // Lost the race; free ours and use the winner's.
                    drop(unsafe { Box::from_raw(fresh as *mut MetaArray) });
                    p = existing;
                }
            }
        }
        Some(unsafe { &*(p as *const MetaArray) })
    }

    /// Look up a translation for `meta`. The response status says whether
    /// a usable record was found (`Accept`), one that needs adaptation
    /// (`Adapt`), or nothing (`Reject`).
    pub fn request(&self, meta: &Meta) -> IndexFindResponse {
        // If the record is already chained, it is already in the index.
        if meta.get::<IndexMetaData>().next.load(Ordering::Acquire) != 0 {
            return IndexFindResponse {
                status: UnificationStatus::Accept,
                meta: Some(meta.clone()),
            };
        }
        let (first, second) = self.position(meta);
        let Some(array) = self.array(first, false) else {
            return IndexFindResponse {
                status: UnificationStatus::Reject,
                meta: None,
            };
        };
        let head = array.slots[second].load(Ordering::Acquire);
        self.match_chain(head, meta)
    }

    fn match_chain(&self, mut cursor: usize, search: &Meta) -> IndexFindResponse {
        let mut response = IndexFindResponse {
            status: UnificationStatus::Reject,
            meta: None,
        };
        while cursor != 0 && cursor != TOMBSTONE {
            let entry =
                ManuallyDrop::new(unsafe { Meta::from_raw(cursor as *mut u8, &self.mgr) });
            if search.equals(&entry) {
                match search.can_unify_with(&entry) {
                    UnificationStatus::Accept => {
                        return IndexFindResponse {
                            status: UnificationStatus::Accept,
                            meta: Some((*entry).clone()),
                        };
                    }
                    UnificationStatus::Adapt => {
                        if response.status != UnificationStatus::Adapt {
                            response.status = UnificationStatus::Adapt;
                            response.meta = Some((*entry).clone());
                        }
                    }
                    UnificationStatus::Reject => {}
                }
            }
            cursor = entry.get::<IndexMetaData>().next.load(Ordering::Acquire);
        }
        response
    }

    /// Insert `meta` into the index, consuming it. A record that is
    /// already chained is left alone.
    pub fn insert(&self, meta: Meta) {
        if meta.get::<IndexMetaData>().next.load(Ordering::Acquire) != 0 {
            return;
        }
        let (first, second) = self.position(&meta);
        let array = self.array(first, true).expect("created on demand");
        let slot = &array.slots[second];
        let raw = meta.into_raw() as usize;
        let entry = ManuallyDrop::new(unsafe { Meta::from_raw(raw as *mut u8, &self.mgr) });
        let mut head = slot.load(Ordering::Acquire);
        loop {
            let next = if head == 0 { TOMBSTONE } else { head };
            entry
                .get::<IndexMetaData>()
                .next
                .store(next, Ordering::Release);
            match slot.compare_exchange(head, raw, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(new_head) => head = new_head,
            }
        }
    }
}

impl Drop for Index {
    fn drop(&mut self) {
        for first in &self.arrays {
            let p = first.swap(0, Ordering::AcqRel);
            if p == 0 {
                continue;
            }
            let array = unsafe { Box::from_raw(p as *mut MetaArray) };
            for slot in &array.slots {
                let mut cursor = slot.swap(0, Ordering::AcqRel);
                while cursor != 0 && cursor != TOMBSTONE {
                    let entry = unsafe { Meta::from_raw(cursor as *mut u8, &self.mgr) };
                    cursor = entry.get::<IndexMetaData>().next.load(Ordering::Acquire);
                    drop(entry);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{standard_manager, AppMetaData, CacheMetaData};

    fn meta_for(mgr: &Arc<MetaDataManager>, pc: usize, cache_pc: usize) -> Meta {
        let mut meta = Meta::allocate(mgr);
        meta.get_mut::<AppMetaData>().start_pc = pc;
        meta.get_mut::<CacheMetaData>().start_pc = cache_pc;
        meta
    }

    #[test]
    fn lookup_misses_then_hits() {
        let mgr = standard_manager();
        let index = Index::new(Arc::clone(&mgr));
        let probe = meta_for(&mgr, 0x4000, 0);
        assert_eq!(index.request(&probe).status, UnificationStatus::Reject);

        index.insert(meta_for(&mgr, 0x4000, 0xcafe));
        let response = index.request(&probe);
        assert_eq!(response.status, UnificationStatus::Accept);
        assert_eq!(
            response.meta.unwrap().get::<CacheMetaData>().start_pc,
            0xcafe
        );
    }

    #[test]
    fn distinct_pcs_do_not_collide() {
        let mgr = standard_manager();
        let index = Index::new(Arc::clone(&mgr));
        for pc in 0..64usize {
            index.insert(meta_for(&mgr, 0x1000 + pc * 8, pc));
        }
        for pc in 0..64usize {
            let probe = meta_for(&mgr, 0x1000 + pc * 8, 0);
            let response = index.request(&probe);
            assert_eq!(response.status, UnificationStatus::Accept, "pc {pc}");
            assert_eq!(response.meta.unwrap().get::<CacheMetaData>().start_pc, pc);
        }
    }

    #[test]
    fn chained_records_report_accept_without_search() {
        let mgr = standard_manager();
        let index = Index::new(Arc::clone(&mgr));
        let meta = meta_for(&mgr, 0x9000, 1);
        index.insert(meta.clone());
        // The clone is unchained, so it goes through the table.
        assert_eq!(index.request(&meta).status, UnificationStatus::Accept);
    }
}

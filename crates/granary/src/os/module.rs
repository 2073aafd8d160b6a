//! The module manifest: what code ranges belong to which loaded module.
//!
//! Ranges within a module form a sorted, non-overlapping list. Inserting
//! a conflicting range first carves away the overlap, splitting an
//! enclosing range in two when needed, so the invariant holds after any
//! interleaving of adds and removes.

use crate::AppPc;
use std::sync::{Arc, RwLock};

/// What kind of thing a module is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleKind {
    Program,
    Granary,
    GranaryClient,
    KernelModule,
    SharedLibrary,
    Dynamic,
}

/// One mapped range of a module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleAddressRange {
    pub begin_addr: usize,
    pub end_addr: usize,
    pub begin_offset: usize,
    pub end_offset: usize,
    pub perms: u32,
}

/// A loaded module and its address ranges.
pub struct Module {
    name: String,
    kind: ModuleKind,
    ranges: RwLock<Vec<ModuleAddressRange>>,
}

/// A module-relative offset for a pc.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModuleOffset {
    pub offset: usize,
}

impl Module {
    pub fn new(kind: ModuleKind, name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            ranges: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    /// Does this module contain `pc`?
    pub fn contains(&self, pc: AppPc) -> bool {
        let ranges = self.ranges.read().unwrap();
        find_range(&ranges, pc).is_some()
    }

    /// The static offset of `pc` within the module, if it is contained.
    pub fn offset_of(&self, pc: AppPc) -> Option<ModuleOffset> {
        let ranges = self.ranges.read().unwrap();
        find_range(&ranges, pc).map(|range| ModuleOffset {
            offset: range.begin_offset + (pc - range.begin_addr),
        })
    }

    pub fn num_ranges(&self) -> usize {
        self.ranges.read().unwrap().len()
    }

    /// Add `[begin_addr, end_addr)`. Conflicting parts of existing
    /// ranges are removed first, so overlapping insertions always leave
    /// a clean sorted list.
    pub fn add_range(&self, begin_addr: usize, end_addr: usize, begin_offset: usize, perms: u32) {
        if begin_addr >= end_addr {
            if begin_addr > end_addr {
                return self.add_range(end_addr, begin_addr, begin_offset, perms);
            }
            return;
        }
        let mut ranges = self.ranges.write().unwrap();
        remove_conflicts(&mut ranges, begin_addr, end_addr);
        let range = ModuleAddressRange {
            begin_addr,
            end_addr,
            begin_offset,
            end_offset: begin_offset + (end_addr - begin_addr),
            perms,
        };
        let pos = ranges
            .iter()
            .position(|r| begin_addr < r.begin_addr)
            .unwrap_or(ranges.len());
        ranges.insert(pos, range);
    }

    /// Remove any coverage of `[begin_addr, end_addr)`.
    pub fn remove_range(&self, begin_addr: usize, end_addr: usize) {
        let mut ranges = self.ranges.write().unwrap();
        remove_conflicts(&mut ranges, begin_addr, end_addr);
    }
}

fn find_range(ranges: &[ModuleAddressRange], pc: AppPc) -> Option<&ModuleAddressRange> {
    for range in ranges {
        if range.begin_addr <= pc && pc < range.end_addr {
            return Some(range);
        }
        if range.begin_addr > pc {
            break;
        }
    }
    None
}

/// Carve `[begin_addr, end_addr)` out of the sorted range list,
/// truncating and splitting as necessary.
fn remove_conflicts(ranges: &mut Vec<ModuleAddressRange>, begin_addr: usize, end_addr: usize) {
    let mut i = 0;
    while i < ranges.len() {
        let curr = ranges[i].clone();
        if end_addr < curr.begin_addr {
            break;
        }
        if curr.begin_addr < end_addr && curr.end_addr > begin_addr {
            if curr.begin_addr < begin_addr {
                if end_addr < curr.end_addr {
                    // Removal is strictly inside: split in two.
                    let offset = curr.begin_offset + (end_addr - curr.begin_addr);
                    let after = ModuleAddressRange {
                        begin_addr: end_addr,
                        end_addr: curr.end_addr,
                        begin_offset: offset,
                        end_offset: curr.end_offset,
                        perms: curr.perms,
                    };
                    ranges.insert(i + 1, after);
                }
                // Keep the left piece.
                let cut = curr.end_addr - begin_addr;
                let keep = &mut ranges[i];
                keep.end_addr = begin_addr;
                keep.end_offset -= cut;
                i += 1;
            } else if end_addr < curr.end_addr {
                // Overlap on the left edge: trim the front.
                let keep = &mut ranges[i];
                keep.begin_offset += end_addr - keep.begin_addr;
                keep.begin_addr = end_addr;
                i += 1;
            } else {
                // Fully covered: drop it.
                ranges.remove(i);
            }
        } else {
            i += 1;
        }
    }
}

/// The set of currently loaded modules.
pub struct ModuleManager {
    modules: RwLock<Vec<Arc<Module>>>,
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleManager {
    pub fn new() -> Self {
        Self {
            modules: RwLock::new(Vec::new()),
        }
    }

    pub fn register(&self, module: Module) -> Arc<Module> {
        let module = Arc::new(module);
        let mut modules = self.modules.write().unwrap();
        assert!(
            !modules.iter().any(|m| m.name() == module.name()),
            "module registered twice: {}",
            module.name()
        );
        modules.push(Arc::clone(&module));
        module
    }

    pub fn find_by_pc(&self, pc: AppPc) -> Option<Arc<Module>> {
        let modules = self.modules.read().unwrap();
        modules.iter().find(|m| m.contains(pc)).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<Module>> {
        let modules = self.modules.read().unwrap();
        modules.iter().find(|m| m.name() == name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_ranges_cover_their_union() {
        let m = Module::new(ModuleKind::SharedLibrary, "libtest.so");
        m.add_range(100, 125, 0, 5);
        m.add_range(125, 175, 25, 5);
        m.add_range(175, 200, 75, 5);
        for pc in 100..200 {
            assert!(m.contains(pc), "pc {pc}");
        }
        assert!(!m.contains(99));
        assert!(!m.contains(200));
        assert_eq!(m.num_ranges(), 3);
    }

    #[test]
    fn removing_the_middle_leaves_a_hole() {
        let m = Module::new(ModuleKind::SharedLibrary, "libtest.so");
        m.add_range(100, 125, 0, 5);
        m.add_range(125, 175, 25, 5);
        m.add_range(175, 200, 75, 5);
        m.remove_range(125, 175);
        assert_eq!(m.num_ranges(), 2);
        for pc in 100..125 {
            assert!(m.contains(pc));
        }
        for pc in 125..175 {
            assert!(!m.contains(pc), "pc {pc}");
        }
        for pc in 175..200 {
            assert!(m.contains(pc));
        }
    }

    #[test]
    fn overlapping_insert_splits_the_incumbent() {
        let m = Module::new(ModuleKind::Program, "a.out");
        m.add_range(0x1000, 0x5000, 0, 5);
        m.add_range(0x2000, 0x3000, 0x9000, 7);
        assert_eq!(m.num_ranges(), 3);
        assert_eq!(m.offset_of(0x1800).unwrap().offset, 0x800);
        assert_eq!(m.offset_of(0x2800).unwrap().offset, 0x9800);
        assert_eq!(m.offset_of(0x3800).unwrap().offset, 0x2800);
    }

    #[test]
    fn manager_finds_by_pc_and_name() {
        let mgr = ModuleManager::new();
        let m = mgr.register(Module::new(ModuleKind::Program, "a.out"));
        m.add_range(0x400000, 0x401000, 0, 5);
        assert!(mgr.find_by_pc(0x400800).is_some());
        assert!(mgr.find_by_pc(0x300000).is_none());
        assert!(mgr.find_by_name("a.out").is_some());
    }
}

//! The translation context: caches, index, metadata, modules, edges.
//!
//! One `Context` owns everything a translation needs. Its code caches
//! and its data arena are carved from a single contiguous reservation,
//! which keeps every edge record and native-address cell rip-reachable
//! from every piece of generated code.

use crate::arch::callback::{self, Callback};
use crate::arch::edge as arch_edge;
use crate::cache::CodeCache;
use crate::cfg::FactoryEnv;
use crate::edge::{DirectEdge, IndirectEdge};
use crate::index::{Index, IndexFindResponse};
use crate::metadata::{standard_manager, AppMetaData, Meta, MetaDataManager, StackMetaData};
use crate::os::memory::{self, PageProtection};
use crate::os::ModuleManager;
use crate::translate::TargetStackValidity;
use crate::{AppPc, CachePc, Options, PAGE_SIZE};
use log::{debug, info};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Pages of pinned read-write storage for edge records and cells.
const DATA_PAGES: usize = 256;

/// Bump storage whose contents never move and are never individually
/// freed. Generated code embeds absolute addresses into it.
pub struct DataArena {
    base: usize,
    len: usize,
    bump: AtomicUsize,
}

impl DataArena {
    fn new(base: usize, len: usize) -> Self {
        Self {
            base,
            len,
            bump: AtomicUsize::new(0),
        }
    }

    fn alloc_raw(&self, size: usize, align: usize) -> usize {
        let mut offset = self.bump.load(Ordering::Relaxed);
        loop {
            let start = (self.base + offset).next_multiple_of(align) - self.base;
            let end = start + size;
            assert!(end <= self.len, "edge data arena exhausted");
            match self.bump.compare_exchange_weak(
                offset,
                end,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return self.base + start,
                Err(cur) => offset = cur,
            }
        }
    }

    /// An owned 8-byte cell, e.g. a native-address slot for an
    /// out-of-range branch target.
    pub fn alloc_cell(&self, value: u64) -> usize {
        let addr = self.alloc_raw(8, 8);
        unsafe { (addr as *mut u64).write(value) };
        addr
    }

    /// Place `value` in the arena and return a raw pointer to it. The
    /// value lives until the arena is torn down.
    pub fn alloc_value<T>(&self, value: T) -> *mut T {
        let addr = self.alloc_raw(std::mem::size_of::<T>(), std::mem::align_of::<T>());
        let ptr = addr as *mut T;
        unsafe { ptr.write(value) };
        ptr
    }
}

/// Everything one attachment of the translator owns.
pub struct Context {
    pub options: Options,
    meta_mgr: Arc<MetaDataManager>,
    pub index: Index,
    pub modules: ModuleManager,
    pub block_cache: CodeCache,
    pub edge_cache: CodeCache,
    pub data: DataArena,
    region_base: *mut u8,
    region_pages: usize,
    /// Entry points of the shared edge trampolines.
    direct_edge_entry: CachePc,
    indirect_edge_entry: CachePc,
    direct_edges: Mutex<Vec<*mut DirectEdge>>,
    indirect_edges: Mutex<Vec<*mut IndirectEdge>>,
    callbacks: Mutex<Vec<(usize, Callback)>>,
}

unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    /// Build a context with the default options.
    pub fn new() -> Box<Self> {
        Self::with_options(Options::default())
    }

    /// Build a context. The returned box must stay where it is; the
    /// generated trampolines embed its address.
    pub fn with_options(options: Options) -> Box<Self> {
        let block_pages = options.block_cache_pages;
        let edge_pages = options.edge_cache_pages;
        let total = block_pages + edge_pages + DATA_PAGES;
        let region = memory::allocate_code_pages(total);
        let block_base = region;
        let edge_base = unsafe { region.add(block_pages * PAGE_SIZE) };
        let data_base = unsafe { region.add((block_pages + edge_pages) * PAGE_SIZE) };
        memory::protect_pages(data_base, DATA_PAGES, PageProtection::ReadWrite);

        let meta_mgr = standard_manager();
        let mut ctx = Box::new(Self {
            options,
            index: Index::new(Arc::clone(&meta_mgr)),
            meta_mgr,
            modules: ModuleManager::new(),
            block_cache: CodeCache::new(block_base, block_pages),
            edge_cache: CodeCache::new(edge_base, edge_pages),
            data: DataArena::new(data_base as usize, DATA_PAGES * PAGE_SIZE),
            region_base: region,
            region_pages: total,
            direct_edge_entry: 0,
            indirect_edge_entry: 0,
            direct_edges: Mutex::new(Vec::new()),
            indirect_edges: Mutex::new(Vec::new()),
            callbacks: Mutex::new(Vec::new()),
        });
        ctx.generate_edge_entries();
        info!(
            "context up: block cache {:#x}, edge cache {:#x}",
            ctx.block_cache.base(),
            ctx.edge_cache.base()
        );
        ctx
    }

    /// Lay down the two shared edge-entry trampolines in the edge
    /// cache.
    fn generate_edge_entries(&mut self) {
        let ctx_addr = self as *const Context as usize;
        let direct_cell = self.data.alloc_cell(granary_enter_direct_edge as usize as u64);
        let indirect_cell = self
            .data
            .alloc_cell(granary_enter_indirect_edge as usize as u64);

        let code = self
            .edge_cache
            .allocate_block(2 * arch_edge::EDGE_ENTRY_CODE_SIZE);
        let _tx = self
            .edge_cache
            .begin_transaction(code, code + 2 * arch_edge::EDGE_ENTRY_CODE_SIZE);
        self.direct_edge_entry = code;
        let end = arch_edge::generate_direct_edge_entry_code(ctx_addr, direct_cell, code);
        let indirect = end.next_multiple_of(8);
        self.indirect_edge_entry = indirect;
        arch_edge::generate_indirect_edge_entry_code(ctx_addr, indirect_cell, indirect);
    }

    pub fn meta_manager(&self) -> &Arc<MetaDataManager> {
        &self.meta_mgr
    }

    pub fn direct_edge_entry(&self) -> CachePc {
        self.direct_edge_entry
    }

    pub fn indirect_edge_entry(&self) -> CachePc {
        self.indirect_edge_entry
    }

    /// A fresh metadata record for a block at `pc`.
    pub fn allocate_block_meta(&self, pc: AppPc) -> Meta {
        let mut meta = Meta::allocate(&self.meta_mgr);
        meta.get_mut::<AppMetaData>().start_pc = pc;
        meta
    }

    /// Allocate a direct edge in pinned storage.
    pub fn allocate_direct_edge(&self, dest_meta: Meta) -> &'static DirectEdge {
        let ptr = self.data.alloc_value(DirectEdge::new(dest_meta));
        self.direct_edges.lock().unwrap().push(ptr);
        unsafe { &*ptr }
    }

    /// Allocate an indirect edge in pinned storage.
    pub fn allocate_indirect_edge(
        &self,
        meta_template: Meta,
        shifts_redzone: bool,
    ) -> &'static IndirectEdge {
        let ptr = self
            .data
            .alloc_value(IndirectEdge::new(meta_template, shifts_redzone));
        self.indirect_edges.lock().unwrap().push(ptr);
        unsafe { &*ptr }
    }

    /// Can a rel32 placed anywhere in the reservation reach `target`?
    pub fn is_reachable(&self, target: usize) -> bool {
        let lo = self.region_base as usize;
        let hi = lo + self.region_pages * PAGE_SIZE;
        crate::arch::is_near(lo, target) && crate::arch::is_near(hi, target)
    }

    /// Translate the code at `pc` and return its cache entry point.
    pub fn translate(&self, pc: AppPc, stack: TargetStackValidity) -> CachePc {
        let mut meta = self.allocate_block_meta(pc);
        if stack == TargetStackValidity::Valid {
            meta.get_mut::<StackMetaData>().mark_stack_as_valid();
        }
        self.translate_meta(meta)
    }

    /// Translate the block `meta` describes, reusing an indexed
    /// translation when one serves.
    pub fn translate_meta(&self, meta: Meta) -> CachePc {
        crate::translate::translate_meta(self, meta)
    }

    /// Generate (or reuse) a context-callback trampoline for `func`.
    pub fn context_callback(&self, func: usize) -> CachePc {
        let mut callbacks = self.callbacks.lock().unwrap();
        if let Some((_, cb)) = callbacks.iter().find(|(f, _)| *f == func) {
            return cb.wrapped_callback;
        }
        let cell = self.data.alloc_cell(func as u64);
        let code = self
            .edge_cache
            .allocate_block(callback::CONTEXT_CALL_CODE_SIZE);
        let _tx = self
            .edge_cache
            .begin_transaction(code, code + callback::CONTEXT_CALL_CODE_SIZE);
        let (cb, _) = callback::generate_context_callback(func, cell, code);
        let pc = cb.wrapped_callback;
        callbacks.push((func, cb));
        pc
    }

    /// Generate an outline-callback trampoline for `func`.
    pub fn outline_callback(&self, func: usize) -> CachePc {
        let cell = self.data.alloc_cell(func as u64);
        let code = self
            .edge_cache
            .allocate_block(callback::CONTEXT_CALL_CODE_SIZE);
        let _tx = self
            .edge_cache
            .begin_transaction(code, code + callback::CONTEXT_CALL_CODE_SIZE);
        let (cb, _) = callback::generate_outline_callback(func, cell, code);
        let pc = cb.wrapped_callback;
        self.callbacks.lock().unwrap().push((func, cb));
        pc
    }
}

impl FactoryEnv for Context {
    fn allocate_meta(&self, app_pc: AppPc) -> Meta {
        self.allocate_block_meta(app_pc)
    }

    fn index_request(&self, meta: &Meta) -> IndexFindResponse {
        self.index.request(meta)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Edge records live in the arena; run their destructors so the
        // metadata they hold is released.
        for &edge in self.direct_edges.lock().unwrap().iter() {
            unsafe { std::ptr::drop_in_place(edge) };
        }
        for &edge in self.indirect_edges.lock().unwrap().iter() {
            unsafe { std::ptr::drop_in_place(edge) };
        }
        memory::free_pages(self.region_base, self.region_pages);
    }
}

/// Runtime entry from a direct-edge stub: translate the destination and
/// patch the edge so later executions skip the stub.
unsafe extern "sysv64" fn granary_enter_direct_edge(edge: *mut DirectEdge, ctx: *mut Context) {
    let ctx = &*ctx;
    let edge = &*edge;
    let meta = edge
        .dest_meta
        .lock()
        .unwrap()
        .clone()
        .expect("direct edge without destination metadata");
    let cache_pc = ctx.translate_meta(meta);
    debug!("direct edge resolved to {cache_pc:#x}");

    // Publish: a reader sees either the fallback or the translation.
    edge.entry_target.store(cache_pc, Ordering::Release);
    edge.exit_target.store(cache_pc, Ordering::Release);

    // And try to cut the stub out of the referring branch entirely.
    let patch_pc = edge.patch_instruction.load(Ordering::Acquire);
    if patch_pc != 0 && ctx.block_cache.contains(patch_pc) {
        let _tx = ctx.block_cache.begin_transaction(patch_pc, patch_pc + 8);
        arch_edge::patch_direct_branch(patch_pc, cache_pc);
    }
}

/// Runtime entry from an indirect edge's chain bottom: translate the
/// runtime target and grow the compare chain by one entry.
unsafe extern "sysv64" fn granary_enter_indirect_edge(
    edge: *mut IndirectEdge,
    ctx: *mut Context,
    target: usize,
) {
    let ctx = &*ctx;
    let edge = &*edge;
    let mut meta = edge
        .meta_template
        .lock()
        .unwrap()
        .clone()
        .expect("indirect edge without metadata template");
    meta.get_mut::<AppMetaData>().start_pc = target;
    let cache_pc = ctx.translate_meta(meta);
    debug!("indirect target {target:#x} resolved to {cache_pc:#x}");

    let guard = edge.lock.lock().unwrap();
    let code = ctx.edge_cache.allocate_block(arch_edge::OUT_EDGE_CODE_SIZE);
    let _tx = ctx
        .edge_cache
        .begin_transaction(code, code + arch_edge::OUT_EDGE_CODE_SIZE);
    arch_edge::instantiate_indirect_edge(edge, target, cache_pc, code);
    drop(guard);
}

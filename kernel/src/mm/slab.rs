//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Slab 分配器
//!
//! 固定大小对象的池化分配，摊薄小对象的分配成本，减少伙伴系统
//! 的碎片。
//!
//! # 设计
//! - SlabCache: 管理一种对象大小的缓存，带可选构造函数
//! - slab 页: 一个 order-0 页，页首放 SlabHeader，其余切成对象，
//!   空闲对象用首字（或构造函数缓存的外置链字）串成页内空闲链
//! - 三条 slab 链表: full / partial / empty，slab 恰好在其中一条上
//! - per-CPU magazine: 一个缓存行大小的对象槽数组，命中时
//!   分配/释放只碰本 CPU 的锁
//! - kmalloc/kzalloc/kfree: 按大小路由到桶缓存，超过最大桶直接
//!   走伙伴系统
//!
//! # 支持的桶大小
//! 8, 16, 32, 64, 128, 256, 512, 1024, 2048 字节
//!
//! # 锁序
//! 全局锁序要求 zone 锁 (4) 先于 slab 缓存锁 (5) 先于 magazine
//! 锁 (6)。需要向伙伴系统要页或还页时必须先放掉缓存锁，重新获取
//! 后重验状态；magazine 满时也要先把对象倒出来再拿缓存锁。

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use super::addr::{align_up, Pfn};
use super::buddy::{self, GfpFlags};
use super::context::MemCtx;
use super::frame::{FrameFlag, PFN_NULL};
use crate::config::{MAX_ORDER, PAGE_SIZE, SLAB_EMPTY_HIGH, SLAB_MAGAZINE_SIZE};
use crate::error::{MmError, MmResult};

/// kmalloc 桶大小
const BUCKET_SIZES: [usize; 9] = [8, 16, 32, 64, 128, 256, 512, 1024, 2048];

/// 页内空闲链的结束标记
const OBJ_NONE: u32 = u32::MAX;

/// slab 页首部
///
/// 存放在每个 slab 页的开头；所属缓存同时记录在页帧描述符里
/// （SLAB 标志 + private = 缓存 id），kfree 由此路由。
#[repr(C)]
struct SlabHeader {
    /// 所属缓存 id
    cache_id: u32,
    /// 已分配对象数
    in_use: u32,
    /// 页内空闲链头（对象索引）
    free_head: u32,
    _pad: u32,
    /// slab 链表后继（pfn）
    next: usize,
    /// slab 链表前驱（pfn）
    prev: usize,
}

/// 三条 slab 链表（缓存锁保护）
struct SlabLists {
    /// 没有空闲对象
    full: usize,
    /// 部分使用
    partial: usize,
    /// 全部空闲
    empty: usize,
    empty_count: usize,
}

/// per-CPU 对象弹匣
///
/// 槽数取一个缓存行能放下的指针数，非空时分配/释放都不碰
/// 缓存锁。
struct Magazine {
    objs: [usize; SLAB_MAGAZINE_SIZE],
    len: usize,
}

impl Magazine {
    const fn new() -> Self {
        Self {
            objs: [0; SLAB_MAGAZINE_SIZE],
            len: 0,
        }
    }

    #[inline]
    fn pop(&mut self) -> Option<usize> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.objs[self.len])
    }

    #[inline]
    fn push(&mut self, obj: usize) -> bool {
        if self.len == SLAB_MAGAZINE_SIZE {
            return false;
        }
        self.objs[self.len] = obj;
        self.len += 1;
        true
    }
}

/// Slab 缓存
pub struct SlabCache {
    id: usize,
    name: &'static str,
    /// 对象大小（调用者视角）
    object_size: usize,
    /// 对象间距（含对齐和外置链字）
    stride: usize,
    /// 空闲链字在对象内的偏移
    ///
    /// 无构造函数时链字复用对象首字；有构造函数时链字外置在
    /// 对象之后，构造好的状态不会被空闲链破坏。
    link_offset: usize,
    /// 页内第一个对象的偏移
    obj_base: usize,
    /// 每个 slab 页的对象数
    objects_per_slab: usize,
    /// 可选构造函数：对象随 slab 页创建时执行一次，重分配不再执行
    ctor: Option<fn(*mut u8)>,

    lists: Mutex<SlabLists>,
    magazines: Vec<Mutex<Magazine>>,

    /// 持有的 slab 页数
    total_slabs: AtomicUsize,
    alloc_count: AtomicUsize,
    free_count: AtomicUsize,
}

impl SlabCache {
    fn new(id: usize, name: &'static str, size: usize, align: usize, ctor: Option<fn(*mut u8)>) -> MmResult<Self> {
        if size == 0 {
            return Err(MmError::InvalidArgument);
        }
        let align = align.max(core::mem::size_of::<usize>()).next_power_of_two();

        let (stride, link_offset) = if ctor.is_some() {
            // 链字外置：对象之后紧跟 8 字节链字
            let link = align_up(size, core::mem::size_of::<u64>());
            (align_up(link + core::mem::size_of::<u64>(), align), link)
        } else {
            (align_up(size.max(core::mem::size_of::<u64>()), align), 0)
        };

        let obj_base = align_up(core::mem::size_of::<SlabHeader>(), align);
        if obj_base + stride > PAGE_SIZE {
            // 一个对象都放不下：这种大小不该用 slab
            return Err(MmError::InvalidArgument);
        }
        let objects_per_slab = (PAGE_SIZE - obj_base) / stride;

        let mut magazines = Vec::with_capacity(crate::config::MAX_CPUS);
        for _ in 0..crate::config::MAX_CPUS {
            magazines.push(Mutex::new(Magazine::new()));
        }

        Ok(Self {
            id,
            name,
            object_size: size,
            stride,
            link_offset,
            obj_base,
            objects_per_slab,
            ctor,
            lists: Mutex::new(SlabLists {
                full: PFN_NULL,
                partial: PFN_NULL,
                empty: PFN_NULL,
                empty_count: 0,
            }),
            magazines,
            total_slabs: AtomicUsize::new(0),
            alloc_count: AtomicUsize::new(0),
            free_count: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    #[inline]
    pub fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    /// 持有的 slab 页数
    pub fn slab_pages(&self) -> usize {
        self.total_slabs.load(Ordering::Relaxed)
    }

    /// magazine 里缓存的对象总数（统计用）
    pub fn magazine_objects(&self) -> usize {
        self.magazines.iter().map(|m| m.lock().len).sum()
    }

    // ========== 页内布局 ==========

    fn header<'a>(&self, ctx: &'a MemCtx, pfn: Pfn) -> &'a mut SlabHeader {
        unsafe { &mut *(ctx.frames.page_ptr(pfn) as *mut SlabHeader) }
    }

    fn obj_ptr(&self, ctx: &MemCtx, pfn: Pfn, idx: u32) -> *mut u8 {
        debug_assert!((idx as usize) < self.objects_per_slab);
        unsafe {
            ctx.frames
                .page_ptr(pfn)
                .add(self.obj_base + idx as usize * self.stride)
        }
    }

    fn obj_index(&self, ctx: &MemCtx, pfn: Pfn, ptr: usize) -> u32 {
        let base = ctx.frames.page_ptr(pfn) as usize + self.obj_base;
        debug_assert!(ptr >= base);
        let idx = (ptr - base) / self.stride;
        debug_assert!(idx < self.objects_per_slab);
        idx as u32
    }

    #[inline]
    fn link(&self, obj: *mut u8) -> *mut u32 {
        unsafe { obj.add(self.link_offset) as *mut u32 }
    }

    // ========== 分配 ==========

    /// 分配一个对象
    pub fn alloc(&self, ctx: &MemCtx, gfp: GfpFlags) -> MmResult<NonNull<u8>> {
        let cpu = ctx.arch.cpu_id();

        // 快速路径：本 CPU magazine
        if let Some(obj) = self.magazines[cpu].lock().pop() {
            self.alloc_count.fetch_add(1, Ordering::Relaxed);
            return Ok(unsafe { NonNull::new_unchecked(obj as *mut u8) });
        }

        // 慢速路径：缓存锁下从 partial/empty 取对象并顺手填弹匣
        loop {
            {
                let mut lists = self.lists.lock();
                if let Some(obj) = self.alloc_locked(ctx, &mut lists, cpu) {
                    self.alloc_count.fetch_add(1, Ordering::Relaxed);
                    return Ok(unsafe { NonNull::new_unchecked(obj as *mut u8) });
                }
            }
            // 没有带空闲对象的 slab 了。锁序要求 zone 锁先于缓存锁，
            // 所以放掉缓存锁再向伙伴系统要页，回来重试。
            let pfn = buddy::alloc_pages(ctx, 0, gfp, None)?;
            self.carve(ctx, pfn);
            let mut lists = self.lists.lock();
            list_push(ctx, &mut lists.partial, pfn);
        }
    }

    /// 缓存锁已持有：取一个对象，并把弹匣填到半满
    fn alloc_locked(&self, ctx: &MemCtx, lists: &mut SlabLists, cpu: usize) -> Option<usize> {
        let first = self.take_object(ctx, lists)?;

        // 填弹匣。缓存锁 (5) -> magazine 锁 (6)，与锁序一致。
        let mut mag = self.magazines[cpu].lock();
        while mag.len < SLAB_MAGAZINE_SIZE / 2 {
            match self.take_object(ctx, lists) {
                Some(obj) => {
                    mag.push(obj);
                }
                None => break,
            }
        }
        Some(first)
    }

    /// 从 partial（或 empty）链表摘一个对象（缓存锁已持有）
    fn take_object(&self, ctx: &MemCtx, lists: &mut SlabLists) -> Option<usize> {
        let pfn = if lists.partial != PFN_NULL {
            lists.partial
        } else if lists.empty != PFN_NULL {
            // 提拔一个全空 slab
            let pfn = lists.empty;
            list_remove(ctx, &mut lists.empty, pfn);
            lists.empty_count -= 1;
            list_push(ctx, &mut lists.partial, pfn);
            pfn
        } else {
            return None;
        };

        let header = self.header(ctx, pfn);
        let idx = header.free_head;
        debug_assert_ne!(idx, OBJ_NONE, "partial slab with no free objects");

        let obj = self.obj_ptr(ctx, pfn, idx);
        header.free_head = unsafe { *self.link(obj) };
        header.in_use += 1;

        // 用光了就挪进 full
        if header.free_head == OBJ_NONE {
            list_remove(ctx, &mut lists.partial, pfn);
            list_push(ctx, &mut lists.full, pfn);
        }

        Some(obj as usize)
    }

    /// 把一个新页切成 slab
    fn carve(&self, ctx: &MemCtx, pfn: Pfn) {
        let frame = ctx.frames.frame(pfn);
        frame.set_flag(FrameFlag::Slab);
        frame.set_private(self.id);

        let header = self.header(ctx, pfn);
        header.cache_id = self.id as u32;
        header.in_use = 0;
        header.free_head = 0;
        header.next = PFN_NULL;
        header.prev = PFN_NULL;

        for i in 0..self.objects_per_slab as u32 {
            let obj = self.obj_ptr(ctx, pfn, i);
            // 构造函数随 slab 创建对每个对象执行一次
            if let Some(ctor) = self.ctor {
                ctor(obj);
            }
            let next = if i + 1 < self.objects_per_slab as u32 {
                i + 1
            } else {
                OBJ_NONE
            };
            unsafe { *self.link(obj) = next };
        }

        self.total_slabs.fetch_add(1, Ordering::Relaxed);
    }

    // ========== 释放 ==========

    /// 释放一个对象
    pub fn free(&self, ctx: &MemCtx, ptr: NonNull<u8>) {
        let cpu = ctx.arch.cpu_id();
        self.free_count.fetch_add(1, Ordering::Relaxed);

        // 快速路径：塞进本 CPU magazine
        let mut spill = [0usize; SLAB_MAGAZINE_SIZE / 2];
        let mut spilled = 0;
        {
            let mut mag = self.magazines[cpu].lock();
            if mag.push(ptr.as_ptr() as usize) {
                return;
            }
            // 弹匣满：倒出一半。magazine 锁 (6) 不能反向去拿缓存锁 (5)，
            // 先弹出到栈上，放锁后再还给 slab。
            while spilled < spill.len() {
                match mag.pop() {
                    Some(obj) => {
                        spill[spilled] = obj;
                        spilled += 1;
                    }
                    None => break,
                }
            }
            mag.push(ptr.as_ptr() as usize);
        }

        let mut to_release = [0usize; SLAB_MAGAZINE_SIZE / 2];
        let mut n_release = 0;
        {
            let mut lists = self.lists.lock();
            for &obj in &spill[..spilled] {
                if let Some(pfn) = self.free_locked(ctx, &mut lists, obj) {
                    to_release[n_release] = pfn;
                    n_release += 1;
                }
            }
        }
        // 全空 slab 超过高水位：页归还伙伴系统（缓存锁已放）
        for &pfn in &to_release[..n_release] {
            let frame = ctx.frames.frame(pfn);
            frame.clear_flag(FrameFlag::Slab);
            frame.set_private(0);
            self.total_slabs.fetch_sub(1, Ordering::Relaxed);
            buddy::free_pages(ctx, pfn, 0);
        }
    }

    /// 缓存锁已持有：把对象还给所属 slab
    ///
    /// slab 因此全空并超过保留水位时，返回应归还伙伴系统的页。
    fn free_locked(&self, ctx: &MemCtx, lists: &mut SlabLists, obj: usize) -> Option<Pfn> {
        let pfn = match ctx.frames.addr_to_pfn(obj) {
            Some(pfn) => pfn,
            None => panic!("slab: freeing pointer {:#x} outside memory", obj),
        };
        let frame = ctx.frames.frame(pfn);
        if !frame.test_flag(FrameFlag::Slab) || frame.private() != self.id {
            panic!("slab: pointer {:#x} does not belong to cache '{}'", obj, self.name);
        }

        let idx = self.obj_index(ctx, pfn, obj);
        let header = self.header(ctx, pfn);

        unsafe { *self.link(obj as *mut u8) = header.free_head };
        let was_full = header.free_head == OBJ_NONE;
        header.free_head = idx;
        header.in_use -= 1;

        if was_full {
            list_remove(ctx, &mut lists.full, pfn);
            list_push(ctx, &mut lists.partial, pfn);
        }

        if header.in_use == 0 {
            // 全空：降级到 empty，超过水位就让页走人
            list_remove(ctx, &mut lists.partial, pfn);
            if lists.empty_count >= SLAB_EMPTY_HIGH {
                return Some(pfn);
            }
            list_push(ctx, &mut lists.empty, pfn);
            lists.empty_count += 1;
        }
        None
    }
}

// ========== slab 链表（pfn 双向链，指针在 SlabHeader 里） ==========

fn slab_header(ctx: &MemCtx, pfn: Pfn) -> &mut SlabHeader {
    unsafe { &mut *(ctx.frames.page_ptr(pfn) as *mut SlabHeader) }
}

fn list_push(ctx: &MemCtx, head: &mut usize, pfn: Pfn) {
    let h = slab_header(ctx, pfn);
    h.prev = PFN_NULL;
    h.next = *head;
    if *head != PFN_NULL {
        slab_header(ctx, *head).prev = pfn;
    }
    *head = pfn;
}

fn list_remove(ctx: &MemCtx, head: &mut usize, pfn: Pfn) {
    let (prev, next) = {
        let h = slab_header(ctx, pfn);
        (h.prev, h.next)
    };
    if prev != PFN_NULL {
        slab_header(ctx, prev).next = next;
    } else {
        debug_assert_eq!(*head, pfn);
        *head = next;
    }
    if next != PFN_NULL {
        slab_header(ctx, next).prev = prev;
    }
    let h = slab_header(ctx, pfn);
    h.prev = PFN_NULL;
    h.next = PFN_NULL;
}

// ========== 缓存注册表与 kmalloc 家族 ==========

/// slab 分配器根
pub struct SlabRoot {
    caches: RwLock<Vec<Arc<SlabCache>>>,
    /// kmalloc 桶缓存的 id（与 BUCKET_SIZES 对应）
    kmalloc_ids: spin::Once<[usize; BUCKET_SIZES.len()]>,
}

impl SlabRoot {
    pub fn new() -> Self {
        Self {
            caches: RwLock::new(Vec::new()),
            kmalloc_ids: spin::Once::new(),
        }
    }

    /// 创建 kmalloc 桶缓存（init 末尾调用一次）
    pub(crate) fn init_kmalloc_caches(ctx: &MemCtx) {
        static BUCKET_NAMES: [&str; BUCKET_SIZES.len()] = [
            "kmalloc-8",
            "kmalloc-16",
            "kmalloc-32",
            "kmalloc-64",
            "kmalloc-128",
            "kmalloc-256",
            "kmalloc-512",
            "kmalloc-1024",
            "kmalloc-2048",
        ];
        ctx.slab.kmalloc_ids.call_once(|| {
            let mut ids = [0usize; BUCKET_SIZES.len()];
            for (i, (&size, &name)) in BUCKET_SIZES.iter().zip(BUCKET_NAMES.iter()).enumerate() {
                // 2 的幂桶按自身大小对齐（kmalloc 的对齐保证）
                let cache = kmem_cache_create(ctx, name, size, size, None)
                    .expect("kmalloc bucket geometry is static and valid");
                ids[i] = cache.id;
            }
            ids
        });
    }

    pub(crate) fn cache_by_id(&self, id: usize) -> Option<Arc<SlabCache>> {
        self.caches.read().get(id).cloned()
    }

    /// 全部缓存（统计用）
    pub fn caches(&self) -> Vec<Arc<SlabCache>> {
        self.caches.read().clone()
    }

    fn bucket_for(&self, size: usize) -> Option<usize> {
        let ids = self.kmalloc_ids.get()?;
        BUCKET_SIZES
            .iter()
            .position(|&b| size <= b)
            .map(|i| ids[i])
    }
}

impl Default for SlabRoot {
    fn default() -> Self {
        Self::new()
    }
}

/// 创建一个命名的对象缓存
pub fn kmem_cache_create(
    ctx: &MemCtx,
    name: &'static str,
    size: usize,
    align: usize,
    ctor: Option<fn(*mut u8)>,
) -> MmResult<Arc<SlabCache>> {
    let mut caches = ctx.slab.caches.write();
    let id = caches.len();
    let cache = Arc::new(SlabCache::new(id, name, size, align, ctor)?);
    caches.push(cache.clone());
    log::debug!(
        "slab: cache '{}' created (size={}, {} objs/slab)",
        name,
        size,
        cache.objects_per_slab
    );
    Ok(cache)
}

/// 从命名缓存分配一个对象
pub fn kmem_cache_alloc(ctx: &MemCtx, cache: &SlabCache, gfp: GfpFlags) -> MmResult<NonNull<u8>> {
    cache.alloc(ctx, gfp)
}

/// 释放到命名缓存
pub fn kmem_cache_free(ctx: &MemCtx, cache: &SlabCache, ptr: NonNull<u8>) {
    cache.free(ctx, ptr)
}

/// 分配内核内存
///
/// 按大小路由到桶缓存；超过最大桶时直接走伙伴系统，取能装下的
/// 最小 order。
pub fn kmalloc(ctx: &MemCtx, size: usize, gfp: GfpFlags) -> MmResult<NonNull<u8>> {
    if size == 0 {
        return Err(MmError::InvalidArgument);
    }

    if let Some(id) = ctx.slab.bucket_for(size) {
        let cache = ctx
            .slab
            .cache_by_id(id)
            .expect("kmalloc bucket caches live as long as the context");
        return cache.alloc(ctx, gfp);
    }

    // 大对象：伙伴系统
    let pages = size.div_ceil(PAGE_SIZE);
    let order = pages.next_power_of_two().trailing_zeros() as usize;
    if order > MAX_ORDER {
        return Err(MmError::InvalidArgument);
    }
    let pfn = buddy::alloc_pages(ctx, order, gfp, None)?;
    // 标成复合页头，kfree 由此得知 order（order 0 也要标）
    let head = ctx.frames.frame(pfn);
    head.set_flag(FrameFlag::Compound);
    head.set_private(order);
    Ok(unsafe { NonNull::new_unchecked(ctx.frames.page_ptr(pfn)) })
}

/// 分配并清零
pub fn kzalloc(ctx: &MemCtx, size: usize, gfp: GfpFlags) -> MmResult<NonNull<u8>> {
    let ptr = kmalloc(ctx, size, gfp)?;
    unsafe {
        core::ptr::write_bytes(ptr.as_ptr(), 0, size);
    }
    Ok(ptr)
}

/// 释放 kmalloc / kmem_cache_alloc 的内存
pub fn kfree(ctx: &MemCtx, ptr: NonNull<u8>) {
    let addr = ptr.as_ptr() as usize;
    let pfn = match ctx.frames.addr_to_pfn(addr) {
        Some(pfn) => pfn,
        None => panic!("kfree: pointer {:#x} outside memory", addr),
    };
    let frame = ctx.frames.frame(pfn);

    if frame.test_flag(FrameFlag::Slab) {
        let cache = ctx
            .slab
            .cache_by_id(frame.private())
            .unwrap_or_else(|| panic!("kfree: slab page with bogus cache id {}", frame.private()));
        cache.free(ctx, ptr);
    } else if frame.test_flag(FrameFlag::Compound) {
        debug_assert_eq!(addr % PAGE_SIZE, 0, "kfree of offset large pointer");
        buddy::free_pages(ctx, pfn, frame.order());
    } else {
        panic!("kfree: pointer {:#x} not from kmalloc", addr);
    }
}

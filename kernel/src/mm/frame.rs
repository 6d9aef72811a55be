//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 页帧描述符与页帧数据库
//!
//! 为每个物理页帧维护一个描述符，记录：
//! - 原子标志位（LOCKED/DIRTY/BUDDY/SLAB/LRU/...）
//! - 引用计数
//! - 所属 zone 与 NUMA 节点
//! - 链表指针（伙伴系统空闲链表或 zone 的 LRU 链表，二者互斥）
//! - 按标志位区分的联合字段：BUDDY 时 private 存 order，
//!   SLAB 时存缓存 id，页缓存页的 mapping/index 存 (vnode, 文件页索引)
//!
//! 所有权不变量：任一时刻，页帧恰好处于以下状态之一——伙伴系统
//! 空闲链表（BUDDY）、slab、页缓存条目、一个或多个地址空间映射、
//! 或 in-flight（refcount >= 1 且不在任何链表上）。引用计数降到 0
//! 且不是 BUDDY 时，由持有最后一个引用的路径归还伙伴系统。
//!
//! 数据库在启动时由固件内存图一次性构建，按 pfn 索引，
//! 描述符 <-> 物理地址 <-> 直接映射虚拟地址的转换都是 O(1)。

use core::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;

use super::addr::Pfn;
use crate::config::PAGE_SIZE;

/// 空链表指针（链表指针字段与 pfn 同域，usize::MAX 不会是合法 pfn）
pub const PFN_NULL: usize = usize::MAX;

/// 页帧标志位
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameFlag {
    /// 页已锁定（页缓存加载/回写期间的互斥位）
    Locked = 1 << 0,
    /// 页已修改（需要回写）
    Dirty = 1 << 1,
    /// 页数据有效（已从后备存储读取）
    UpToDate = 1 << 2,
    /// 页在 LRU 链表中
    Lru = 1 << 3,
    /// 页在活跃 LRU 链表
    Active = 1 << 4,
    /// 页属于 slab 分配器
    Slab = 1 << 5,
    /// 页在伙伴系统空闲链表中
    Buddy = 1 << 6,
    /// 大页
    Huge = 1 << 7,
    /// 保留页（固件/内核镜像/早期堆），永不进入伙伴系统
    Reserved = 1 << 8,
    /// 可移动页
    Movable = 1 << 9,
    /// 复合页头部（order > 0 的分配）
    Compound = 1 << 10,
    /// 页最近被访问过（LRU 二次机会）
    Referenced = 1 << 11,
    /// 有等待者在 LOCKED 位上自旋
    Waiters = 1 << 12,
    /// 页缓存页
    PageCache = 1 << 13,
    /// 匿名页
    Anonymous = 1 << 14,
}

/// 页帧标志位集合（原子）
#[derive(Debug, Default)]
pub struct FrameFlags(AtomicU32);

impl FrameFlags {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn test(&self, flag: FrameFlag) -> bool {
        self.0.load(Ordering::Acquire) & (flag as u32) != 0
    }

    pub fn set(&self, flag: FrameFlag) {
        self.0.fetch_or(flag as u32, Ordering::Release);
    }

    pub fn clear(&self, flag: FrameFlag) {
        self.0.fetch_and(!(flag as u32), Ordering::Release);
    }

    /// 测试并设置，返回旧值
    pub fn test_and_set(&self, flag: FrameFlag) -> bool {
        let bit = flag as u32;
        (self.0.fetch_or(bit, Ordering::AcqRel) & bit) != 0
    }

    /// 测试并清除，返回旧值
    pub fn test_and_clear(&self, flag: FrameFlag) -> bool {
        let bit = flag as u32;
        (self.0.fetch_and(!bit, Ordering::AcqRel) & bit) != 0
    }

    pub fn clear_all(&self) {
        self.0.store(0, Ordering::Release);
    }
}

/// 页帧描述符
///
/// 对齐到缓存行，数据库中每个物理页帧一个。
#[repr(C, align(64))]
pub struct Frame {
    /// 原子标志位
    flags: FrameFlags,

    /// 引用计数：0 空闲，> 0 使用中
    refcount: AtomicI32,

    /// 所属 zone（MemCtx.zones 中的扁平索引）
    zone_id: AtomicU32,

    /// 所属 NUMA 节点
    nid: AtomicU32,

    /// 判别字段：
    /// - BUDDY：伙伴系统 order
    /// - SLAB：slab 缓存 id
    /// - COMPOUND 头部：分配 order
    private: AtomicUsize,

    /// 反向映射钩子：
    /// - PageCache：vnode id
    /// - Anonymous：地址空间 id（仅记录首个，调试用）
    mapping: AtomicU64,

    /// 页缓存页在文件中的页索引
    index: AtomicUsize,

    /// 链表前驱（BUDDY 空闲链表或 LRU，按标志位区分）
    prev: AtomicUsize,

    /// 链表后继
    next: AtomicUsize,
}

impl Frame {
    pub const fn new() -> Self {
        Self {
            flags: FrameFlags::new(),
            refcount: AtomicI32::new(0),
            zone_id: AtomicU32::new(0),
            nid: AtomicU32::new(0),
            private: AtomicUsize::new(0),
            mapping: AtomicU64::new(0),
            index: AtomicUsize::new(0),
            prev: AtomicUsize::new(PFN_NULL),
            next: AtomicUsize::new(PFN_NULL),
        }
    }

    /// 初始化为保留页
    pub fn init_reserved(&self) {
        self.flags.clear_all();
        self.flags.set(FrameFlag::Reserved);
        self.refcount.store(1, Ordering::Release);
    }

    /// 初始化为普通可用页
    pub fn init_free(&self) {
        self.flags.clear_all();
        self.refcount.store(0, Ordering::Release);
        self.private.store(0, Ordering::Release);
        self.mapping.store(0, Ordering::Release);
        self.index.store(0, Ordering::Release);
        self.prev.store(PFN_NULL, Ordering::Release);
        self.next.store(PFN_NULL, Ordering::Release);
    }

    // ========== 标志位操作 ==========

    #[inline]
    pub fn test_flag(&self, flag: FrameFlag) -> bool {
        self.flags.test(flag)
    }

    #[inline]
    pub fn set_flag(&self, flag: FrameFlag) {
        self.flags.set(flag);
    }

    #[inline]
    pub fn clear_flag(&self, flag: FrameFlag) {
        self.flags.clear(flag);
    }

    #[inline]
    pub fn test_and_set_flag(&self, flag: FrameFlag) -> bool {
        self.flags.test_and_set(flag)
    }

    #[inline]
    pub fn test_and_clear_flag(&self, flag: FrameFlag) -> bool {
        self.flags.test_and_clear(flag)
    }

    #[inline]
    pub fn flags_raw(&self) -> u32 {
        self.flags.raw()
    }

    #[inline]
    pub fn is_buddy(&self) -> bool {
        self.test_flag(FrameFlag::Buddy)
    }

    #[inline]
    pub fn is_reserved(&self) -> bool {
        self.test_flag(FrameFlag::Reserved)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.test_flag(FrameFlag::Locked)
    }

    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.test_flag(FrameFlag::Dirty)
    }

    /// 对 LOCKED 位上锁；已锁时返回 false
    #[inline]
    pub fn try_lock(&self) -> bool {
        !self.flags.test_and_set(FrameFlag::Locked)
    }

    /// 解锁 LOCKED 位，返回是否有等待者
    #[inline]
    pub fn unlock(&self) -> bool {
        self.flags.clear(FrameFlag::Locked);
        self.flags.test_and_clear(FrameFlag::Waiters)
    }

    /// 自旋等待 LOCKED 位清除
    ///
    /// 页缓存的加载/回写路径很短，没有调度器可依赖时自旋等待。
    /// 设置 WAITERS 让解锁侧知道发生过争用。
    pub fn wait_unlocked(&self) {
        while self.is_locked() {
            self.set_flag(FrameFlag::Waiters);
            core::hint::spin_loop();
        }
    }

    // ========== 引用计数 ==========

    #[inline]
    pub fn refcount(&self) -> i32 {
        self.refcount.load(Ordering::Acquire)
    }

    /// 增加引用计数，返回新值
    #[inline]
    pub fn get(&self) -> i32 {
        self.refcount.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// 减少引用计数，返回新值；降为 0 时调用者必须归还页帧
    #[inline]
    pub fn put(&self) -> i32 {
        let new = self.refcount.fetch_sub(1, Ordering::AcqRel) - 1;
        if new < 0 {
            panic!(
                "mm: frame refcount underflow (flags={:#x}, count={})",
                self.flags.raw(),
                new
            );
        }
        new
    }

    /// 仅当 refcount > 0 时增加引用
    pub fn try_get(&self) -> bool {
        loop {
            let old = self.refcount.load(Ordering::Acquire);
            if old <= 0 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                old,
                old + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(_) => continue,
            }
        }
    }

    /// 设置引用计数（仅用于分配路径初始化）
    #[inline]
    pub fn set_refcount(&self, count: i32) {
        self.refcount.store(count, Ordering::Release);
    }

    // ========== 判别字段 ==========

    #[inline]
    pub fn private(&self) -> usize {
        self.private.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_private(&self, value: usize) {
        self.private.store(value, Ordering::Release);
    }

    /// 伙伴系统 order（仅 BUDDY 或 COMPOUND 头部有效）
    #[inline]
    pub fn order(&self) -> usize {
        self.private()
    }

    // ========== zone / 节点 ==========

    #[inline]
    pub fn zone_id(&self) -> u32 {
        self.zone_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_zone_id(&self, id: u32) {
        self.zone_id.store(id, Ordering::Release);
    }

    #[inline]
    pub fn nid(&self) -> u32 {
        self.nid.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_nid(&self, nid: u32) {
        self.nid.store(nid, Ordering::Release);
    }

    // ========== 反向映射钩子 ==========

    #[inline]
    pub fn mapping(&self) -> u64 {
        self.mapping.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_mapping(&self, mapping: u64) {
        self.mapping.store(mapping, Ordering::Release);
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_index(&self, index: usize) {
        self.index.store(index, Ordering::Release);
    }

    // ========== 链表指针 ==========

    #[inline]
    pub(crate) fn prev(&self) -> usize {
        self.prev.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_prev(&self, pfn: usize) {
        self.prev.store(pfn, Ordering::Release);
    }

    #[inline]
    pub(crate) fn next(&self) -> usize {
        self.next.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_next(&self, pfn: usize) {
        self.next.store(pfn, Ordering::Release);
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

/// 页帧数据库
///
/// 按 pfn 索引的描述符数组，外加直接映射基址。物理页帧 `pfn` 的
/// 内容可以在 `dmap_base + (pfn - base_pfn) * PAGE_SIZE` 处访问；
/// 真实内核传入内核直接映射的基址，宿主机测试传入一块页对齐的
/// 测试内存。
pub struct FrameDb {
    /// 数据库覆盖的第一个 pfn
    base_pfn: Pfn,
    /// 直接映射基址（base_pfn 对应的虚拟地址）
    dmap_base: usize,
    /// 描述符数组，索引 = pfn - base_pfn
    frames: Box<[Frame]>,
}

impl FrameDb {
    /// 构建数据库，所有描述符先标记为保留
    ///
    /// 可用范围由 zone 初始化时逐帧放开（`Frame::init_free`）。
    pub fn new(base_pfn: Pfn, nr_pages: usize, dmap_base: usize) -> Self {
        let mut frames = Vec::with_capacity(nr_pages);
        for _ in 0..nr_pages {
            let f = Frame::new();
            f.init_reserved();
            frames.push(f);
        }
        Self {
            base_pfn,
            dmap_base,
            frames: frames.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn base_pfn(&self) -> Pfn {
        self.base_pfn
    }

    #[inline]
    pub fn nr_pages(&self) -> usize {
        self.frames.len()
    }

    #[inline]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.base_pfn && pfn - self.base_pfn < self.frames.len()
    }

    /// pfn -> 描述符
    ///
    /// 越界 pfn 是不变量失败：伙伴指针越过 zone 边界或引用计数
    /// 错乱才会走到这里。
    #[inline]
    pub fn frame(&self, pfn: Pfn) -> &Frame {
        match self.try_frame(pfn) {
            Some(f) => f,
            None => panic!("mm: pfn {:#x} outside frame database", pfn),
        }
    }

    #[inline]
    pub fn try_frame(&self, pfn: Pfn) -> Option<&Frame> {
        if self.contains(pfn) {
            Some(&self.frames[pfn - self.base_pfn])
        } else {
            None
        }
    }

    /// 遍历全部描述符
    pub fn iter(&self) -> impl Iterator<Item = (Pfn, &Frame)> {
        self.frames
            .iter()
            .enumerate()
            .map(move |(i, f)| (self.base_pfn + i, f))
    }

    // ========== 直接映射访问 ==========

    /// pfn -> 页内容指针
    #[inline]
    pub fn page_ptr(&self, pfn: Pfn) -> *mut u8 {
        debug_assert!(self.contains(pfn));
        (self.dmap_base + (pfn - self.base_pfn) * PAGE_SIZE) as *mut u8
    }

    /// 直接映射地址 -> pfn（kfree 用它找到所属 slab 页）
    pub fn addr_to_pfn(&self, addr: usize) -> Option<Pfn> {
        if addr < self.dmap_base {
            return None;
        }
        let off = addr - self.dmap_base;
        let idx = off / PAGE_SIZE;
        if idx < self.frames.len() {
            Some(self.base_pfn + idx)
        } else {
            None
        }
    }

    /// 清零一页
    pub fn zero_page(&self, pfn: Pfn) {
        unsafe {
            core::ptr::write_bytes(self.page_ptr(pfn), 0, PAGE_SIZE);
        }
    }

    /// 整页拷贝（COW 分裂）
    pub fn copy_page(&self, dst: Pfn, src: Pfn) {
        unsafe {
            core::ptr::copy_nonoverlapping(self.page_ptr(src), self.page_ptr(dst), PAGE_SIZE);
        }
    }
}

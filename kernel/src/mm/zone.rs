//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Zone 与 NUMA 节点
//!
//! zone 是一个 NUMA 节点内的连续 pfn 区间，带类型
//! (DMA | NORMAL | HIGH | MOVABLE) 和自己的分配器状态：
//! - 按 order 0..=MAX_ORDER 的空闲链表（伙伴系统）
//! - 空闲页计数器
//! - 三条水位线 min/low/high
//! - LRU 链表（活跃/不活跃 x 匿名/文件 + 不可驱逐）
//! - per-CPU 页缓存
//!
//! 不变量：每个 zone 的 Σ(order-k 块数 × 2^k) 等于空闲页计数器。
//!
//! zone 和节点在启动后不再变化，可变状态都在锁或原子变量里。

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::vec::Vec;
use spin::Mutex;

use super::addr::Pfn;
use super::frame::{FrameDb, PFN_NULL};
use super::pcp::PcpSet;
use crate::config::{MAX_CPUS, MAX_ORDER, WATERMARK_HIGH, WATERMARK_LOW, WATERMARK_MIN};

/// Zone 类型
///
/// 枚举顺序即回退搜索顺序：请求某一类时，从该类开始沿更低的
/// 类依次回退（MOVABLE -> HIGH -> NORMAL -> DMA）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ZoneKind {
    /// DMA 区域（低物理地址）
    Dma = 0,
    /// 常规区域
    Normal = 1,
    /// 高端区域
    High = 2,
    /// 可移动区域（仅用户 order-0 页）
    Movable = 3,
}

impl ZoneKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ZoneKind::Dma => "DMA",
            ZoneKind::Normal => "Normal",
            ZoneKind::High => "High",
            ZoneKind::Movable => "Movable",
        }
    }

    /// 首选类型的回退链
    pub fn fallback(&self) -> &'static [ZoneKind] {
        match self {
            ZoneKind::Movable => &[
                ZoneKind::Movable,
                ZoneKind::High,
                ZoneKind::Normal,
                ZoneKind::Dma,
            ],
            ZoneKind::High => &[ZoneKind::High, ZoneKind::Normal, ZoneKind::Dma],
            ZoneKind::Normal => &[ZoneKind::Normal, ZoneKind::Dma],
            ZoneKind::Dma => &[ZoneKind::Dma],
        }
    }
}

/// 水位线
#[derive(Debug, Clone, Copy)]
pub struct Watermarks {
    /// 最低保留：普通分配不得使空闲页跌破此线（GFP_ATOMIC 例外）
    pub min: usize,
    /// 跌破即唤醒后台回收
    pub low: usize,
    /// 回收到此线为止
    pub high: usize,
}

impl Watermarks {
    /// 按 zone 大小计算水位线
    ///
    /// 配置值（Kernel.toml）是上限；小 zone 按比例收缩，
    /// 避免水位线吃掉整个 zone。
    pub fn for_zone(managed_pages: usize) -> Self {
        let min = WATERMARK_MIN.min(managed_pages / 32);
        let low = WATERMARK_LOW.min(managed_pages / 16).max(min);
        let high = WATERMARK_HIGH.min(managed_pages / 8).max(low);
        Self { min, low, high }
    }
}

/// 侵入式 pfn 链表
///
/// 链表指针存放在页帧描述符的 prev/next 字段里；一个页帧任一时刻
/// 只会在一条链表上（伙伴空闲链表或 LRU），所以指针字段可以复用。
/// 所有操作都要求调用者持有拥有这条链表的锁。
#[derive(Debug)]
pub struct PfnList {
    head: usize,
    tail: usize,
    len: usize,
}

impl PfnList {
    pub const fn new() -> Self {
        Self {
            head: PFN_NULL,
            tail: PFN_NULL,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn head(&self) -> Option<Pfn> {
        if self.head == PFN_NULL {
            None
        } else {
            Some(self.head)
        }
    }

    /// 头部插入
    pub fn push_front(&mut self, db: &FrameDb, pfn: Pfn) {
        let frame = db.frame(pfn);
        frame.set_prev(PFN_NULL);
        frame.set_next(self.head);
        if self.head != PFN_NULL {
            db.frame(self.head).set_prev(pfn);
        } else {
            self.tail = pfn;
        }
        self.head = pfn;
        self.len += 1;
    }

    /// 尾部插入
    pub fn push_back(&mut self, db: &FrameDb, pfn: Pfn) {
        let frame = db.frame(pfn);
        frame.set_next(PFN_NULL);
        frame.set_prev(self.tail);
        if self.tail != PFN_NULL {
            db.frame(self.tail).set_next(pfn);
        } else {
            self.head = pfn;
        }
        self.tail = pfn;
        self.len += 1;
    }

    /// 摘除任意节点
    pub fn remove(&mut self, db: &FrameDb, pfn: Pfn) {
        let frame = db.frame(pfn);
        let prev = frame.prev();
        let next = frame.next();

        if prev != PFN_NULL {
            db.frame(prev).set_next(next);
        } else {
            debug_assert_eq!(self.head, pfn, "mm: frame not on this list");
            self.head = next;
        }
        if next != PFN_NULL {
            db.frame(next).set_prev(prev);
        } else {
            debug_assert_eq!(self.tail, pfn, "mm: frame not on this list");
            self.tail = prev;
        }

        frame.set_prev(PFN_NULL);
        frame.set_next(PFN_NULL);
        self.len -= 1;
    }

    /// 取出头部
    pub fn pop_front(&mut self, db: &FrameDb) -> Option<Pfn> {
        let pfn = self.head;
        if pfn == PFN_NULL {
            return None;
        }
        self.remove(db, pfn);
        Some(pfn)
    }

    /// 取出尾部（LRU 的冷端）
    pub fn pop_back(&mut self, db: &FrameDb) -> Option<Pfn> {
        let pfn = self.tail;
        if pfn == PFN_NULL {
            return None;
        }
        self.remove(db, pfn);
        Some(pfn)
    }

    /// 迭代（调用者持锁）
    pub fn iter<'a>(&'a self, db: &'a FrameDb) -> PfnListIter<'a> {
        PfnListIter {
            db,
            cur: self.head,
        }
    }
}

pub struct PfnListIter<'a> {
    db: &'a FrameDb,
    cur: usize,
}

impl<'a> Iterator for PfnListIter<'a> {
    type Item = Pfn;

    fn next(&mut self) -> Option<Pfn> {
        if self.cur == PFN_NULL {
            return None;
        }
        let pfn = self.cur;
        self.cur = self.db.frame(pfn).next();
        Some(pfn)
    }
}

/// 伙伴系统空闲区（zone 锁保护）
pub struct FreeArea {
    /// 按 order 索引的空闲链表
    pub lists: [PfnList; MAX_ORDER + 1],
}

impl FreeArea {
    pub fn new() -> Self {
        Self {
            lists: core::array::from_fn(|_| PfnList::new()),
        }
    }

    /// 空闲链表中的总页数（不变量校验用）
    pub fn total_pages(&self) -> usize {
        self.lists
            .iter()
            .enumerate()
            .map(|(order, list)| list.len() << order)
            .sum()
    }
}

/// LRU 链表类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum LruKind {
    ActiveAnon = 0,
    InactiveAnon = 1,
    ActiveFile = 2,
    InactiveFile = 3,
    Unevictable = 4,
}

pub const NR_LRU_LISTS: usize = 5;

/// LRU 链表组（zone 的 lru 锁保护）
pub struct LruLists {
    pub lists: [PfnList; NR_LRU_LISTS],
}

impl LruLists {
    pub fn new() -> Self {
        Self {
            lists: core::array::from_fn(|_| PfnList::new()),
        }
    }

    #[inline]
    pub fn list(&mut self, kind: LruKind) -> &mut PfnList {
        &mut self.lists[kind as usize]
    }
}

/// Zone
pub struct Zone {
    /// MemCtx.zones 中的扁平索引
    pub id: u32,
    /// 所属 NUMA 节点
    pub nid: u32,
    pub kind: ZoneKind,
    /// 覆盖的 pfn 区间 [start, end)
    pub span: core::ops::Range<Pfn>,
    /// 该 zone 管理的可用页数（不含保留页）
    pub managed_pages: usize,
    pub watermarks: Watermarks,

    /// 伙伴系统空闲区
    pub free_area: Mutex<FreeArea>,
    /// 空闲页计数（空闲链表中的页；不含 PCP 缓存的页）
    pub free_pages: AtomicUsize,

    /// per-CPU 页缓存
    pub pcp: Box<[Mutex<PcpSet>]>,
    /// PCP 中缓存的页总数（全 CPU）
    pub pcp_pages: AtomicUsize,

    /// LRU 链表
    pub lru: Mutex<LruLists>,

    /// 已跌破 low 水位，等待后台回收
    pub reclaim_pending: AtomicBool,
}

impl Zone {
    pub fn new(id: u32, nid: u32, kind: ZoneKind, span: core::ops::Range<Pfn>, managed: usize) -> Self {
        let mut pcp = Vec::with_capacity(MAX_CPUS);
        for _ in 0..MAX_CPUS {
            pcp.push(Mutex::new(PcpSet::new()));
        }
        Self {
            id,
            nid,
            kind,
            span,
            managed_pages: managed,
            watermarks: Watermarks::for_zone(managed),
            free_area: Mutex::new(FreeArea::new()),
            free_pages: AtomicUsize::new(0),
            pcp: pcp.into_boxed_slice(),
            pcp_pages: AtomicUsize::new(0),
            lru: Mutex::new(LruLists::new()),
            reclaim_pending: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn free_pages(&self) -> usize {
        self.free_pages.load(Ordering::Acquire)
    }

    /// 分配 2^order 页后是否仍在水位之上
    ///
    /// 普通分配不得跌破 min；GFP_ATOMIC 可以吃保留，到 0 为止。
    pub fn watermark_ok(&self, order: usize, atomic: bool) -> bool {
        let need = 1usize << order;
        let free = self.free_pages();
        if free < need {
            return false;
        }
        if atomic {
            true
        } else {
            free - need >= self.watermarks.min
        }
    }

    /// 是否已跌破 low（需要唤醒回收）
    #[inline]
    pub fn below_low(&self) -> bool {
        self.free_pages() < self.watermarks.low
    }

    /// 是否已回到 high（回收可以停了）
    #[inline]
    pub fn above_high(&self) -> bool {
        self.free_pages() >= self.watermarks.high
    }
}

/// NUMA 节点
pub struct NumaNode {
    pub id: u32,
    /// 本节点的 CPU 位掩码
    pub cpu_mask: usize,
    /// 本节点的 zone（MemCtx.zones 中的索引，按 ZoneKind 升序）
    pub zone_idx: Vec<usize>,
    /// 到每个节点的距离向量（含自身）
    pub distance: Vec<u32>,
}

impl NumaNode {
    /// 按距离升序排列的节点访问顺序（自身最先）
    pub fn fallback_order(&self) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.distance.len() as u32).collect();
        order.sort_by_key(|&n| (self.distance[n as usize], n));
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_fallback_chains() {
        assert_eq!(ZoneKind::Dma.fallback(), &[ZoneKind::Dma]);
        assert_eq!(
            ZoneKind::Movable.fallback(),
            &[
                ZoneKind::Movable,
                ZoneKind::High,
                ZoneKind::Normal,
                ZoneKind::Dma
            ]
        );
    }

    #[test]
    fn test_watermarks_scale_down() {
        let wm = Watermarks::for_zone(1024);
        assert_eq!(wm.min, 32);
        assert_eq!(wm.low, 64);
        assert_eq!(wm.high, 128);

        let big = Watermarks::for_zone(1 << 20);
        assert_eq!(big.min, WATERMARK_MIN);
        assert_eq!(big.low, WATERMARK_LOW);
        assert_eq!(big.high, WATERMARK_HIGH);
    }

    #[test]
    fn test_pfn_list() {
        let db = FrameDb::new(0, 8, alloc_arena(8));
        let mut list = PfnList::new();

        list.push_front(&db, 1);
        list.push_front(&db, 2);
        list.push_back(&db, 3);
        // 链表：2 1 3
        assert_eq!(list.len(), 3);
        assert_eq!(list.iter(&db).collect::<Vec<_>>(), [2, 1, 3]);

        list.remove(&db, 1);
        assert_eq!(list.iter(&db).collect::<Vec<_>>(), [2, 3]);

        assert_eq!(list.pop_back(&db), Some(3));
        assert_eq!(list.pop_front(&db), Some(2));
        assert!(list.is_empty());
        assert_eq!(list.pop_front(&db), None);
    }

    #[test]
    fn test_node_fallback_order() {
        let node = NumaNode {
            id: 0,
            cpu_mask: 0x1,
            zone_idx: alloc::vec![0],
            distance: alloc::vec![10, 40, 20],
        };
        assert_eq!(node.fallback_order(), [0, 2, 1]);
    }

    fn alloc_arena(pages: usize) -> usize {
        use crate::config::PAGE_SIZE;
        let layout = core::alloc::Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        unsafe { std::alloc::alloc_zeroed(layout) as usize }
    }
}

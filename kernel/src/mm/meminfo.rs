//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内核内存统计与不变量校验
//!
//! 提供类似 /proc/meminfo 的内存统计，跟踪整个核心的页帧去向：
//! - zone 空闲页与水位
//! - per-CPU 页缓存
//! - slab 页与 magazine 对象
//! - 页缓存页数与脏页数
//! - 页帧标志分布（匿名、文件、保留、LRU）
//!
//! 同时承担不变量校验：zone 的空闲计数必须等于空闲链表的实际
//! 页数；每个可用页帧必须恰好归属一处。校验失败说明核心自身
//! 有 bug，直接 panic（继续跑会腐蚀无关内存）。

use core::sync::atomic::Ordering;

use super::context::MemCtx;
use super::frame::FrameFlag;

/// 内存统计信息（类似 /proc/meminfo）
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryInfo {
    // ========== 物理内存 ==========
    /// 可用页帧总数
    pub total_pages: usize,
    /// zone 空闲链表中的页数
    pub free_pages: usize,
    /// per-CPU 页缓存中的页数
    pub pcp_pages: usize,

    // ========== Slab ==========
    /// slab 页数
    pub slab_pages: usize,
    /// magazine 里缓存的对象数
    pub magazine_objects: usize,

    // ========== 页缓存 ==========
    /// 页缓存页数
    pub cache_pages: usize,
    /// 脏页数
    pub dirty_pages: usize,

    // ========== 页帧标志分布 ==========
    /// 匿名页数
    pub anon_pages: usize,
    /// LRU 上的页数
    pub lru_pages: usize,
    /// 复合页头数
    pub compound_heads: usize,
}

impl MemoryInfo {
    pub fn format(&self) -> MemoryInfoFormatter<'_> {
        MemoryInfoFormatter { info: self }
    }
}

/// 内存信息格式化器
pub struct MemoryInfoFormatter<'a> {
    info: &'a MemoryInfo,
}

impl<'a> core::fmt::Display for MemoryInfoFormatter<'a> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "Memory Info:")?;
        writeln!(f, "  TotalPages:     {:>10}", self.info.total_pages)?;
        writeln!(f, "  FreePages:      {:>10}", self.info.free_pages)?;
        writeln!(f, "  PcpPages:       {:>10}", self.info.pcp_pages)?;
        writeln!(f, "  SlabPages:      {:>10}", self.info.slab_pages)?;
        writeln!(f, "  MagazineObjs:   {:>10}", self.info.magazine_objects)?;
        writeln!(f, "  CachePages:     {:>10}", self.info.cache_pages)?;
        writeln!(f, "  DirtyPages:     {:>10}", self.info.dirty_pages)?;
        writeln!(f, "  AnonPages:      {:>10}", self.info.anon_pages)?;
        writeln!(f, "  LruPages:       {:>10}", self.info.lru_pages)?;
        writeln!(f, "  CompoundHeads:  {:>10}", self.info.compound_heads)
    }
}

/// 收集完整的内存统计信息
pub fn get_memory_info(ctx: &MemCtx) -> MemoryInfo {
    let mut info = MemoryInfo {
        total_pages: ctx.total_usable,
        ..Default::default()
    };

    for zone in &ctx.zones {
        info.free_pages += zone.free_pages();
        info.pcp_pages += zone.pcp_pages.load(Ordering::Acquire);
    }

    for cache in ctx.slab.caches() {
        info.slab_pages += cache.slab_pages();
        info.magazine_objects += cache.magazine_objects();
    }

    info.cache_pages = ctx.page_cache.nr_pages();
    info.dirty_pages = ctx.page_cache.nr_dirty();

    for (_, frame) in ctx.frames.iter() {
        if frame.is_reserved() {
            continue;
        }
        if frame.test_flag(FrameFlag::Anonymous) {
            info.anon_pages += 1;
        }
        if frame.test_flag(FrameFlag::Lru) {
            info.lru_pages += 1;
        }
        if frame.test_flag(FrameFlag::Compound) {
            info.compound_heads += 1;
        }
    }

    info
}

/// 内存是否紧张（任何 zone 跌破 low）
pub fn is_memory_low(ctx: &MemCtx) -> bool {
    ctx.zones.iter().any(|z| z.below_low())
}

// ========== 不变量校验 ==========

/// 校验每个 zone：空闲计数 == Σ(order-k 块数 × 2^k)
///
/// 不变量破坏说明伙伴核算出了 bug，panic。
pub fn assert_zone_accounting(ctx: &MemCtx) {
    for zone in &ctx.zones {
        let area = zone.free_area.lock();
        let listed = area.total_pages();
        let counted = zone.free_pages();
        if listed != counted {
            panic!(
                "mm: zone {} ({}) free accounting broken: lists hold {} pages, counter says {}",
                zone.id,
                zone.kind.as_str(),
                listed,
                counted
            );
        }
    }
}

/// 校验空闲链表里没有重复页帧、块不越 zone 界
pub fn assert_free_lists_sane(ctx: &MemCtx) {
    for zone in &ctx.zones {
        let area = zone.free_area.lock();
        for (order, list) in area.lists.iter().enumerate() {
            for pfn in list.iter(&ctx.frames) {
                let frame = ctx.frames.frame(pfn);
                if !frame.is_buddy() {
                    panic!(
                        "mm: pfn {:#x} on zone {} order-{} list without BUDDY flag",
                        pfn, zone.id, order
                    );
                }
                if frame.order() != order {
                    panic!(
                        "mm: pfn {:#x} order mismatch: list {} vs frame {}",
                        pfn,
                        order,
                        frame.order()
                    );
                }
                if pfn < zone.span.start || pfn + (1 << order) > zone.span.end {
                    panic!(
                        "mm: pfn {:#x} order-{} block crosses zone {} boundary",
                        pfn, order, zone.id
                    );
                }
            }
        }
    }
}

/// 页帧全量核算
///
/// 每个可用页帧恰好归属一处：zone 空闲链表、per-CPU 缓存、slab、
/// 页缓存、地址空间映射（匿名）、或 in-flight（有引用但不在任何
/// 链表上）。总和必须等于可用页帧总数。
pub fn assert_frame_conservation(ctx: &MemCtx) {
    let mut free = 0usize;
    let mut slab = 0usize;
    let mut cache = 0usize;
    let mut anon = 0usize;
    let mut in_flight = 0usize;
    let mut idle = 0usize;

    // 锁住所有 free_area，让快照一致（测试在静止点调用）
    let _guards: alloc::vec::Vec<_> = ctx.zones.iter().map(|z| z.free_area.lock()).collect();

    for (pfn, frame) in ctx.frames.iter() {
        if frame.is_reserved() {
            continue;
        }
        let owners = [
            frame.is_buddy(),
            frame.test_flag(FrameFlag::Slab),
            frame.test_flag(FrameFlag::PageCache),
            frame.test_flag(FrameFlag::Anonymous),
        ];
        let owner_count = owners.iter().filter(|&&o| o).count();
        if owner_count > 1 {
            panic!(
                "mm: pfn {:#x} claims multiple owners (flags={:#x})",
                pfn,
                frame.flags_raw()
            );
        }

        if frame.is_buddy() {
            free += 1usize << frame.order();
        } else if frame.test_flag(FrameFlag::Slab) {
            slab += 1;
        } else if frame.test_flag(FrameFlag::PageCache) {
            cache += 1;
        } else if frame.test_flag(FrameFlag::Anonymous) {
            anon += 1;
        } else if frame.refcount() > 0 {
            in_flight += 1;
        } else {
            // per-CPU 缓存里的页：无标志、无引用
            idle += 1;
        }
    }

    // buddy 头部的 order 覆盖了整个块，组成页没有标志；把它们
    // 从 idle 里扣掉
    let covered = free.saturating_sub(
        ctx.frames
            .iter()
            .filter(|(_, f)| f.is_buddy())
            .count(),
    );
    let idle = idle.saturating_sub(covered);

    let pcp: usize = ctx
        .zones
        .iter()
        .map(|z| z.pcp_pages.load(Ordering::Acquire))
        .sum();
    if idle != pcp {
        panic!(
            "mm: {} ownerless frames but {} accounted in per-CPU caches",
            idle, pcp
        );
    }

    let total = free + pcp + slab + cache + anon + in_flight;
    if total != ctx.total_usable {
        panic!(
            "mm: frame conservation broken: free={} pcp={} slab={} cache={} anon={} in_flight={} != total {}",
            free, pcp, slab, cache, anon, in_flight, ctx.total_usable
        );
    }
}

/// 全套不变量
pub fn assert_all_invariants(ctx: &MemCtx) {
    assert_zone_accounting(ctx);
    assert_free_lists_sane(ctx);
    assert_frame_conservation(ctx);
}

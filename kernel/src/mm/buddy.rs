//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 分区伙伴系统分配器
//!
//! 物理页按 2^order 页的块管理，每个块在自己的 zone 内有唯一的
//! 伙伴（zone 相对偏移 XOR (1 << order)）。分配沿空闲链表向上找块、
//! 向下分裂（低半块给调用者，高半块回链表，合并因此是确定的）；
//! 释放时逐级与伙伴合并，合并以 zone 边界为限，绝不跨 zone。
//!
//! 搜索顺序：首选 zone 类型沿回退链向下，然后按 NUMA 距离换节点，
//! 然后唤醒回收并重试一次，最后 OOM 并重试一次。普通分配不得使
//! zone 跌破 min 水位；GFP_ATOMIC 可以动用保留页。
//!
//! 引用计数约定：分配返回时每个组成页帧 refcount == 1；
//! `free_pages` 递减引用，降到 0 的块才真正回到空闲链表。

use bitflags::bitflags;
use core::sync::atomic::Ordering;

use super::addr::Pfn;
use super::context::MemCtx;
use super::frame::{FrameDb, FrameFlag};
use super::zone::{Zone, ZoneKind};
use super::{pcp, reclaim};
use crate::config::MAX_ORDER;
use crate::error::{MmError, MmResult};

bitflags! {
    /// 页分配标志 (Get Free Pages)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GfpFlags: u32 {
        /// 从 DMA zone 分配
        const DMA     = 1 << 0;
        /// 首选高端 zone
        const HIGH    = 1 << 1;
        /// 可移动页（用户页）
        const MOVABLE = 1 << 2;
        /// 原子分配：不睡眠，允许动用 min 以下的保留页
        const ATOMIC  = 1 << 3;
        /// 不睡眠、不触发回收/OOM，失败立即返回
        const NOWAIT  = 1 << 4;
        /// 返回前清零
        const ZERO    = 1 << 5;
    }
}

/// 常规内核分配：可以睡眠等待回收
pub const GFP_KERNEL: GfpFlags = GfpFlags::empty();
/// 原子上下文分配
pub const GFP_ATOMIC: GfpFlags = GfpFlags::ATOMIC;
/// 不等待
pub const GFP_NOWAIT: GfpFlags = GfpFlags::NOWAIT;
/// 用户页
pub const GFP_USER: GfpFlags = GfpFlags::MOVABLE;
/// 高端用户页
pub const GFP_HIGHUSER: GfpFlags = GfpFlags::HIGH.union(GfpFlags::MOVABLE);

impl GfpFlags {
    /// 首选 zone 类型
    pub fn preferred_kind(&self) -> ZoneKind {
        if self.contains(GfpFlags::DMA) {
            ZoneKind::Dma
        } else if self.contains(GfpFlags::MOVABLE) {
            ZoneKind::Movable
        } else if self.contains(GfpFlags::HIGH) {
            ZoneKind::High
        } else {
            ZoneKind::Normal
        }
    }

    /// 允许睡眠（等待回收）
    #[inline]
    pub fn can_sleep(&self) -> bool {
        !self.intersects(GfpFlags::ATOMIC | GfpFlags::NOWAIT)
    }
}

/// 分配 2^order 个连续物理页
///
/// 成功时返回块首 pfn，每个组成页帧 refcount == 1。
/// order > MAX_ORDER 直接失败；所有 zone 都无法满足且回收/OOM
/// 无济于事时返回 `OutOfMemory`。
pub fn alloc_pages(
    ctx: &MemCtx,
    order: usize,
    gfp: GfpFlags,
    node_hint: Option<usize>,
) -> MmResult<Pfn> {
    if order > MAX_ORDER {
        return Err(MmError::InvalidArgument);
    }

    if let Some(pfn) = try_alloc(ctx, order, gfp, node_hint) {
        return Ok(finish_alloc(ctx, pfn, order, gfp));
    }

    if gfp.can_sleep() {
        // 慢速路径：直接回收后重试一次
        reclaim::direct_reclaim(ctx, order, gfp);
        if let Some(pfn) = try_alloc(ctx, order, gfp, node_hint) {
            return Ok(finish_alloc(ctx, pfn, order, gfp));
        }

        // 最后手段：OOM 后再重试恰好一次
        if reclaim::out_of_memory(ctx) {
            if let Some(pfn) = try_alloc(ctx, order, gfp, node_hint) {
                return Ok(finish_alloc(ctx, pfn, order, gfp));
            }
        }
    }

    log::warn!(
        "mm: allocation failed (order={}, gfp={:?})",
        order,
        gfp
    );
    Err(MmError::OutOfMemory)
}

/// 释放 2^order 个连续物理页
///
/// 对每个组成页帧做一次 put；只有全部引用都归零的块才回到
/// 空闲链表（共享页帧由最后一个 put 归还）。
pub fn free_pages(ctx: &MemCtx, pfn: Pfn, order: usize) {
    if order > MAX_ORDER {
        panic!("mm: free_pages with bogus order {}", order);
    }
    let db = &ctx.frames;
    let head = db.frame(pfn);
    if head.is_buddy() {
        panic!("mm: double free of pfn {:#x}", pfn);
    }

    let mut all_zero = true;
    for i in 0..(1usize << order) {
        let f = db.frame(pfn + i);
        if f.put() != 0 {
            all_zero = false;
        }
    }
    if all_zero {
        head.clear_flag(FrameFlag::Compound);
        head.clear_flag(FrameFlag::Huge);
        if order == 0 {
            free_one_raw(ctx, pfn);
        } else {
            free_block_raw(ctx, pfn, order);
        }
    }
}

/// 把引用已经归零的 order-0 页帧归还分配器
///
/// 页缓存驱逐、unmap 的 put-到-0 路径走这里；order-0 优先进
/// per-CPU 缓存。
pub(crate) fn free_one_raw(ctx: &MemCtx, pfn: Pfn) {
    let frame = ctx.frames.frame(pfn);
    debug_assert_eq!(frame.refcount(), 0);
    frame.set_mapping(0);
    frame.set_index(0);
    frame.set_private(0);
    frame.clear_flag(FrameFlag::Anonymous);
    frame.clear_flag(FrameFlag::PageCache);
    frame.clear_flag(FrameFlag::Dirty);
    frame.clear_flag(FrameFlag::UpToDate);
    frame.clear_flag(FrameFlag::Referenced);

    let zone = ctx.zone(frame.zone_id());
    pcp::free_page_pcp(ctx, zone, pfn);
}

/// 引用已归零的块直接进空闲链表（绕过 PCP）
pub(crate) fn free_block_raw(ctx: &MemCtx, pfn: Pfn, order: usize) {
    let frame = ctx.frames.frame(pfn);
    let zone = ctx.zone(frame.zone_id());
    for i in 0..(1usize << order) {
        let f = ctx.frames.frame(pfn + i);
        if f.test_flag(FrameFlag::Lru) {
            panic!("mm: freeing pfn {:#x} still on an LRU list", pfn + i);
        }
        f.set_mapping(0);
        f.set_index(0);
        f.set_private(0);
        f.clear_flag(FrameFlag::Anonymous);
        f.clear_flag(FrameFlag::PageCache);
        f.clear_flag(FrameFlag::Dirty);
        f.clear_flag(FrameFlag::UpToDate);
        f.clear_flag(FrameFlag::Referenced);
    }
    zone_free_core(&ctx.frames, zone, pfn, order);
}

// ========== zone 内核心算法 ==========

/// 在一个 zone 内分配（持 zone 锁）
///
/// 水位检查在锁内做：free_pages 的所有修改都发生在持有同一把
/// 锁的路径上，检查与扣减因此是一致的。
pub(crate) fn zone_alloc_core(
    db: &FrameDb,
    zone: &Zone,
    order: usize,
    gfp: GfpFlags,
) -> Option<Pfn> {
    let mut area = zone.free_area.lock();

    if !zone.watermark_ok(order, gfp.contains(GfpFlags::ATOMIC)) {
        return None;
    }

    for cur in order..=MAX_ORDER {
        let pfn = match area.lists[cur].pop_front(db) {
            Some(pfn) => pfn,
            None => continue,
        };
        let head = db.frame(pfn);
        debug_assert!(head.is_buddy());
        head.clear_flag(FrameFlag::Buddy);

        // 逐级分裂：低半块留给调用者，高半块回空闲链表
        let mut split = cur;
        while split > order {
            split -= 1;
            let upper = pfn + (1usize << split);
            let uf = db.frame(upper);
            uf.set_flag(FrameFlag::Buddy);
            uf.set_private(split);
            area.lists[split].push_front(db, upper);
        }

        zone.free_pages
            .fetch_sub(1usize << order, Ordering::AcqRel);
        return Some(pfn);
    }

    None
}

/// 归还一个块并逐级合并（持 zone 锁）
pub(crate) fn zone_free_core(db: &FrameDb, zone: &Zone, pfn: Pfn, order: usize) {
    let mut area = zone.free_area.lock();

    let zone_base = zone.span.start;
    let zone_pages = zone.span.end - zone.span.start;
    let mut pfn = pfn;
    let mut cur = order;

    while cur < MAX_ORDER {
        let rel = pfn - zone_base;
        let buddy_rel = rel ^ (1usize << cur);
        // 合并以 zone 边界为限
        if buddy_rel + (1usize << cur) > zone_pages {
            break;
        }
        let buddy = zone_base + buddy_rel;
        let bf = db.frame(buddy);
        if !bf.is_buddy() || bf.order() != cur {
            break;
        }

        // 伙伴空闲且同阶：摘下来合并，低地址的块存活
        area.lists[cur].remove(db, buddy);
        bf.clear_flag(FrameFlag::Buddy);
        bf.set_private(0);
        if buddy < pfn {
            pfn = buddy;
        }
        cur += 1;
    }

    let head = db.frame(pfn);
    head.set_flag(FrameFlag::Buddy);
    head.set_private(cur);
    area.lists[cur].push_front(db, pfn);

    zone.free_pages
        .fetch_add(1usize << order, Ordering::AcqRel);
}

/// 启动时把一段可用 pfn 区间灌入 zone 的空闲链表
///
/// 直接插入最大的对齐块，对齐以 zone 起点为基准（与伙伴计算
/// 使用同一坐标系）。
pub(crate) fn populate_zone(db: &FrameDb, zone: &Zone, start: Pfn, end: Pfn) {
    let mut area = zone.free_area.lock();
    let mut pfn = start;
    let mut total = 0usize;

    while pfn < end {
        let rel = pfn - zone.span.start;
        let align_order = if rel == 0 {
            MAX_ORDER
        } else {
            (rel.trailing_zeros() as usize).min(MAX_ORDER)
        };
        let mut order = align_order;
        while order > 0 && pfn + (1usize << order) > end {
            order -= 1;
        }

        let head = db.frame(pfn);
        head.set_flag(FrameFlag::Buddy);
        head.set_private(order);
        area.lists[order].push_front(db, pfn);

        total += 1usize << order;
        pfn += 1usize << order;
    }

    zone.free_pages.fetch_add(total, Ordering::AcqRel);
}

// ========== 搜索与收尾 ==========

/// 沿 zone 回退链 + NUMA 距离尝试一轮分配
fn try_alloc(ctx: &MemCtx, order: usize, gfp: GfpFlags, node_hint: Option<usize>) -> Option<Pfn> {
    let cpu = ctx.arch.cpu_id();
    let preferred = gfp.preferred_kind();
    let home = node_hint.unwrap_or_else(|| ctx.node_of_cpu(cpu));

    for nid in ctx.node(home).fallback_order() {
        let node = ctx.node(nid as usize);
        for &kind in preferred.fallback() {
            // 复合页不从 MOVABLE 出：保持 movable zone 真正可移动
            if order > 0 && kind == ZoneKind::Movable {
                continue;
            }
            for &zi in &node.zone_idx {
                let zone = &ctx.zones[zi];
                if zone.kind != kind {
                    continue;
                }

                let got = if order == 0 {
                    pcp::alloc_page_pcp(ctx, zone, cpu, gfp)
                } else {
                    zone_alloc_core(&ctx.frames, zone, order, gfp)
                };

                // 跌破 low 就安排后台回收
                if zone.below_low() && !zone.reclaim_pending.swap(true, Ordering::AcqRel) {
                    ctx.reclaim.wake();
                }

                if let Some(pfn) = got {
                    return Some(pfn);
                }
            }
        }
    }
    None
}

/// 分配成功后的页帧初始化
fn finish_alloc(ctx: &MemCtx, pfn: Pfn, order: usize, gfp: GfpFlags) -> Pfn {
    let db = &ctx.frames;
    for i in 0..(1usize << order) {
        let f = db.frame(pfn + i);
        f.set_refcount(1);
        f.set_private(0);
        if gfp.contains(GfpFlags::MOVABLE) {
            f.set_flag(FrameFlag::Movable);
        } else {
            f.clear_flag(FrameFlag::Movable);
        }
        if gfp.contains(GfpFlags::ZERO) {
            db.zero_page(pfn + i);
        }
    }
    if order > 0 {
        let head = db.frame(pfn);
        head.set_flag(FrameFlag::Compound);
        head.set_private(order);
    }
    pfn
}

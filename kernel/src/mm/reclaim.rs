//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内存回收与 OOM
//!
//! # 回收
//! zone 跌破 low 水位时分配路径置起唤醒标志；内核的回收任务
//! （或分配失败时的直接回收）扫 zone 的 LRU：
//! - 先扫 inactive-file 的冷端：最近被访问过的移回 active
//!   （二次机会），干净且无人引用的走页缓存驱逐路径，脏的先
//!   通过 vnode 回写钩子写出去、下一轮再驱逐
//! - 再扫 inactive-anon：没配交换空间时只做轮转和老化，
//!   不释放任何匿名页（交换接入点留在这里）
//! - 回到 high 水位或一整轮毫无进展时停止
//!
//! # OOM
//! 回收救不回来的不许失败分配走最后一招：按
//! `常驻页数 * 1000 / (保护值 + 1)` 挑最大的牺牲者强制退出，
//! 地址空间拆除归还页帧，失败的分配恰好重试一次。
//!
//! # LRU 维护
//! LRU 链表的增删也在这里：页帧的 LRU 链接复用描述符的链表
//! 指针，操作都在 zone 的 lru 锁内。

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::addr::Pfn;
use super::aspace::AsId;
use super::buddy::GfpFlags;
use super::context::MemCtx;
use super::frame::FrameFlag;
use super::pcp;
use super::zone::{LruKind, Zone};

/// 一轮扫描的批量
const SCAN_BATCH: usize = 32;

/// 回收任务状态
///
/// 回收任务（内核线程）在唤醒标志上等待；分配路径跌破 low 时
/// 置位。核心不拥有线程，嵌入方的循环形如：
/// `loop { wait(); if ctx.reclaim.take_wake() { reclaim::balance(ctx) } }`
pub struct ReclaimState {
    wake: AtomicBool,
    /// 后台回收释放的页数累计（统计）
    pub reclaimed: AtomicUsize,
}

impl ReclaimState {
    pub fn new() -> Self {
        Self {
            wake: AtomicBool::new(false),
            reclaimed: AtomicUsize::new(0),
        }
    }

    /// 置起唤醒标志（zone 跌破 low 时分配路径调用）
    pub fn wake(&self) {
        self.wake.store(true, Ordering::Release);
    }

    /// 取走唤醒标志
    pub fn take_wake(&self) -> bool {
        self.wake.swap(false, Ordering::AcqRel)
    }

    /// 有没有待处理的唤醒
    pub fn pending(&self) -> bool {
        self.wake.load(Ordering::Acquire)
    }
}

impl Default for ReclaimState {
    fn default() -> Self {
        Self::new()
    }
}

// ========== LRU 维护 ==========

/// 把页帧挂上所属 zone 的 LRU
pub(crate) fn lru_add(ctx: &MemCtx, pfn: Pfn, kind: LruKind) {
    let frame = ctx.frames.frame(pfn);
    let zone = ctx.zone(frame.zone_id());
    let mut lru = zone.lru.lock();
    if frame.test_and_set_flag(FrameFlag::Lru) {
        return;
    }
    if matches!(kind, LruKind::ActiveAnon | LruKind::ActiveFile) {
        frame.set_flag(FrameFlag::Active);
    }
    lru.list(kind).push_front(&ctx.frames, pfn);
}

/// 把页帧摘下 LRU（没挂着就是无操作）
pub(crate) fn lru_del(ctx: &MemCtx, pfn: Pfn) {
    let frame = ctx.frames.frame(pfn);
    let zone = ctx.zone(frame.zone_id());
    let mut lru = zone.lru.lock();
    if !frame.test_and_clear_flag(FrameFlag::Lru) {
        return;
    }
    let kind = lru_kind_of(ctx, pfn);
    lru.list(kind).remove(&ctx.frames, pfn);
    frame.clear_flag(FrameFlag::Active);
}

/// 按页帧标志判断它在哪条 LRU 上
fn lru_kind_of(ctx: &MemCtx, pfn: Pfn) -> LruKind {
    let frame = ctx.frames.frame(pfn);
    let active = frame.test_flag(FrameFlag::Active);
    if frame.test_flag(FrameFlag::Anonymous) {
        if active {
            LruKind::ActiveAnon
        } else {
            LruKind::InactiveAnon
        }
    } else if active {
        LruKind::ActiveFile
    } else {
        LruKind::InactiveFile
    }
}

// ========== 回收 ==========

/// 后台回收主循环体：把每个待回收的 zone 拉回 high 水位
pub fn balance(ctx: &MemCtx) -> usize {
    let mut total = 0;
    for zone in &ctx.zones {
        if zone.reclaim_pending.load(Ordering::Acquire) || !zone.above_high() {
            total += shrink_zone(ctx, zone);
            if zone.above_high() {
                zone.reclaim_pending.store(false, Ordering::Release);
            }
        }
    }
    if total > 0 {
        ctx.reclaim.reclaimed.fetch_add(total, Ordering::Relaxed);
        log::debug!("reclaim: balanced {} pages", total);
    }
    total
}

/// 分配失败时的直接回收；返回是否有任何进展
pub(crate) fn direct_reclaim(ctx: &MemCtx, order: usize, gfp: GfpFlags) -> bool {
    let _ = (order, gfp);
    // per-CPU 缓存里闲着的页先倒回去
    pcp::drain_all(ctx);
    let freed = balance(ctx);
    freed > 0
}

/// 把一个 zone 回收到 high 水位或无进展为止
fn shrink_zone(ctx: &MemCtx, zone: &Zone) -> usize {
    let mut freed = 0;
    loop {
        if zone.above_high() {
            break;
        }

        // inactive 空了就从 active 的冷端补（老化）
        refill_inactive(ctx, zone, LruKind::ActiveFile, LruKind::InactiveFile);

        let progress = shrink_inactive_file(ctx, zone, SCAN_BATCH);
        // 匿名链表只轮转不释放（没配交换空间）
        age_inactive_anon(ctx, zone, SCAN_BATCH);

        if progress == 0 {
            break;
        }
        freed += progress;
    }
    freed
}

/// active 链表的冷端降级到 inactive
fn refill_inactive(ctx: &MemCtx, zone: &Zone, from: LruKind, to: LruKind) {
    let mut lru = zone.lru.lock();
    // inactive 少于 active 时才降级
    while lru.list(to).len() < lru.list(from).len() {
        let pfn = match lru.list(from).pop_back(&ctx.frames) {
            Some(pfn) => pfn,
            None => break,
        };
        let frame = ctx.frames.frame(pfn);
        frame.clear_flag(FrameFlag::Active);
        frame.clear_flag(FrameFlag::Referenced);
        lru.list(to).push_front(&ctx.frames, pfn);
    }
}

/// 扫 inactive-file 的冷端
///
/// 返回释放的页数。持 lru 锁时不能去拿页缓存分片锁（锁序 3 在
/// 4 之前），候选页先摘下链表再在锁外处理。
fn shrink_inactive_file(ctx: &MemCtx, zone: &Zone, nr: usize) -> usize {
    // 第一步：锁内摘候选
    let mut candidates: Vec<Pfn> = Vec::new();
    {
        let mut lru = zone.lru.lock();
        for _ in 0..nr {
            let pfn = match lru.list(LruKind::InactiveFile).pop_back(&ctx.frames) {
                Some(pfn) => pfn,
                None => break,
            };
            let frame = ctx.frames.frame(pfn);

            // 二次机会：最近访问过的回 active
            if frame.test_and_clear_flag(FrameFlag::Referenced) {
                frame.set_flag(FrameFlag::Active);
                lru.list(LruKind::ActiveFile).push_front(&ctx.frames, pfn);
                continue;
            }
            frame.clear_flag(FrameFlag::Lru);
            candidates.push(pfn);
        }
    }

    // 第二步：锁外驱逐/回写
    let mut freed = 0;
    for pfn in candidates {
        let frame = ctx.frames.frame(pfn);

        // pin 住或锁住的跳过，挂回链表
        if frame.refcount() > 1 || frame.is_locked() {
            lru_add(ctx, pfn, LruKind::InactiveFile);
            continue;
        }

        if frame.is_dirty() {
            // 脏页先写出去，挂回冷端下一轮驱逐
            let vnode = frame.mapping();
            let index = frame.index();
            let _ = ctx.page_cache.writeback_one(ctx, vnode, index, pfn);
            if frame.test_flag(FrameFlag::PageCache) {
                lru_add_cold(ctx, pfn, LruKind::InactiveFile);
            }
            continue;
        }

        if ctx.page_cache.try_evict(ctx, pfn) {
            freed += 1;
        } else if frame.test_flag(FrameFlag::PageCache) {
            // 条目还在（被 pin 或又变脏了）才挂回去；并发 invalidate
            // 已经撤走的页帧不能再进 LRU
            lru_add(ctx, pfn, LruKind::InactiveFile);
        }
    }
    freed
}

/// 挂回 LRU 的冷端（回写过的页下一轮优先驱逐）
fn lru_add_cold(ctx: &MemCtx, pfn: Pfn, kind: LruKind) {
    let frame = ctx.frames.frame(pfn);
    let zone = ctx.zone(frame.zone_id());
    let mut lru = zone.lru.lock();
    if frame.test_and_set_flag(FrameFlag::Lru) {
        return;
    }
    lru.list(kind).push_back(&ctx.frames, pfn);
}

/// 匿名链表的老化轮转
///
/// 交换空间没配：被访问过的升 active，其余转回头部。释放为零，
/// 交换接入时这里换成换出路径。
fn age_inactive_anon(ctx: &MemCtx, zone: &Zone, nr: usize) {
    let mut lru = zone.lru.lock();
    for _ in 0..nr {
        let pfn = match lru.list(LruKind::InactiveAnon).pop_back(&ctx.frames) {
            Some(pfn) => pfn,
            None => break,
        };
        let frame = ctx.frames.frame(pfn);
        if frame.test_and_clear_flag(FrameFlag::Referenced) {
            frame.set_flag(FrameFlag::Active);
            lru.list(LruKind::ActiveAnon).push_front(&ctx.frames, pfn);
        } else {
            lru.list(LruKind::InactiveAnon).push_front(&ctx.frames, pfn);
        }
    }
}

// ========== OOM ==========

/// OOM 处理器：强制牺牲者退出
///
/// 嵌入方注册的实现应向牺牲进程投递 SIGKILL 并让其退出路径
/// 调用 `AddressSpace::destroy`；没注册时核心直接拆地址空间。
pub trait OomHandler: Send + Sync {
    fn kill(&self, ctx: &MemCtx, victim: AsId);
}

/// 挑牺牲者并强制退出；返回是否真的杀了一个
///
/// 分数 = 常驻页数 * 1000 / (保护值 + 1)，保护值 usize::MAX
/// 表示不可杀。牺牲者的地址空间拆除会把页帧还回来，调用方
/// （分配慢速路径）随后恰好重试一次。
pub fn out_of_memory(ctx: &MemCtx) -> bool {
    let mut candidates: Vec<(u64, usize)> = {
        let aspaces = ctx.aspaces.read();
        aspaces
            .values()
            .filter(|a| a.oom_protection() != usize::MAX && a.resident_pages() > 0)
            .map(|a| (a.id(), oom_score(a.resident_pages(), a.oom_protection())))
            .collect()
    };
    candidates.sort_by_key(|&(_, score)| core::cmp::Reverse(score));

    let handler = ctx.oom.read().clone();

    for (victim, score) in candidates {
        let aspace = match ctx.aspace(victim) {
            Some(a) => a,
            None => continue,
        };
        // 自杀死锁探测：正拿着自己地址空间锁在缺页里分配的进程
        // 不能在这里同步拆自己
        match aspace.inner.try_lock() {
            Some(guard) => drop(guard),
            None => continue,
        }

        log::warn!(
            "oom: killing address space {} (score={}, resident={} pages)",
            victim,
            score,
            aspace.resident_pages()
        );
        match &handler {
            Some(h) => h.kill(ctx, victim),
            None => aspace.destroy(ctx),
        }
        return true;
    }

    log::error!("oom: no killable victim");
    false
}

#[inline]
fn oom_score(resident: usize, protection: usize) -> usize {
    resident.saturating_mul(1000) / (protection.saturating_add(1))
}

/// 注册 OOM 处理器的便捷包装
pub fn set_oom_handler(ctx: &MemCtx, handler: Arc<dyn OomHandler>) {
    ctx.set_oom_handler(handler);
}

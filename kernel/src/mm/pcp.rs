//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Per-CPU Pages (PCP) - 每CPU页缓存
//!
//! 每个 zone 为每个 CPU 维护一小撮 order-0 空闲页，消除热路径上
//! 对 zone 锁的竞争：
//! - 分配时优先从本 CPU 的缓存取页（只碰本 CPU 的锁）
//! - 缓存空时批量从 zone 的空闲链表补充
//! - 缓存超过高水位时批量归还 zone
//!
//! PCP 中的页不计入 zone 的 free_pages 计数器（那个计数器只统计
//! 空闲链表，维持 zone 不变量），单独计入 zone.pcp_pages。
//! 需要精确全局核算的路径（测试、热插拔）先 `drain_all`。

use core::sync::atomic::Ordering;

use super::addr::Pfn;
use super::buddy::{self, GfpFlags};
use super::context::MemCtx;
use super::frame::PFN_NULL;
use super::zone::Zone;
use crate::config::{PCP_BATCH, PCP_HIGH};

/// 一个 (zone, CPU) 组合的页缓存
///
/// 页通过页帧描述符的 next 字段串成单链表。
pub struct PcpSet {
    /// 链表头（pfn），PFN_NULL 表示空
    list: usize,
    /// 缓存的页数
    count: usize,
}

impl PcpSet {
    pub const fn new() -> Self {
        Self {
            list: PFN_NULL,
            count: 0,
        }
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count
    }

    fn push(&mut self, ctx: &MemCtx, pfn: Pfn) {
        ctx.frames.frame(pfn).set_next(self.list);
        self.list = pfn;
        self.count += 1;
    }

    fn pop(&mut self, ctx: &MemCtx) -> Option<Pfn> {
        if self.list == PFN_NULL {
            return None;
        }
        let pfn = self.list;
        let frame = ctx.frames.frame(pfn);
        self.list = frame.next();
        frame.set_next(PFN_NULL);
        self.count -= 1;
        Some(pfn)
    }
}

/// 从 per-CPU 缓存分配一个 order-0 页
///
/// 缓存空时从 zone 批量补充；补充遵守调用者的水位约束。
pub(crate) fn alloc_page_pcp(
    ctx: &MemCtx,
    zone: &Zone,
    cpu: usize,
    gfp: GfpFlags,
) -> Option<Pfn> {
    let mut pcp = zone.pcp[cpu].lock();

    if let Some(pfn) = pcp.pop(ctx) {
        zone.pcp_pages.fetch_sub(1, Ordering::AcqRel);
        return Some(pfn);
    }

    // 批量补充。第一页直接返回给调用者。
    let mut got = None;
    for _ in 0..PCP_BATCH {
        match buddy::zone_alloc_core(&ctx.frames, zone, 0, gfp) {
            Some(pfn) => {
                // zone_alloc_core 不设置引用计数；缓存中的页保持空闲态
                if got.is_none() {
                    got = Some(pfn);
                } else {
                    pcp.push(ctx, pfn);
                    zone.pcp_pages.fetch_add(1, Ordering::AcqRel);
                }
            }
            None => break,
        }
    }
    got
}

/// 释放一个 order-0 页到 per-CPU 缓存
///
/// 超过高水位时批量归还 zone 的空闲链表（合并在那里发生）。
pub(crate) fn free_page_pcp(ctx: &MemCtx, zone: &Zone, pfn: Pfn) {
    let cpu = ctx.arch.cpu_id();
    let mut pcp = zone.pcp[cpu].lock();

    pcp.push(ctx, pfn);
    zone.pcp_pages.fetch_add(1, Ordering::AcqRel);

    if pcp.count >= PCP_HIGH {
        drain_locked(ctx, zone, &mut pcp, PCP_BATCH);
    }
}

/// 归还 `count` 页给 zone（持 pcp 锁）
fn drain_locked(ctx: &MemCtx, zone: &Zone, pcp: &mut PcpSet, count: usize) {
    for _ in 0..count {
        match pcp.pop(ctx) {
            Some(pfn) => {
                zone.pcp_pages.fetch_sub(1, Ordering::AcqRel);
                buddy::zone_free_core(&ctx.frames, zone, pfn, 0);
            }
            None => break,
        }
    }
}

/// 清空一个 zone 的全部 per-CPU 缓存
pub fn drain_zone(ctx: &MemCtx, zone: &Zone) {
    for cpu in 0..zone.pcp.len() {
        let mut pcp = zone.pcp[cpu].lock();
        let n = pcp.count;
        drain_locked(ctx, zone, &mut pcp, n);
    }
}

/// 清空所有 zone 的 per-CPU 缓存
///
/// 回收的收尾和需要精确核算的路径使用。
pub fn drain_all(ctx: &MemCtx) {
    for zone in &ctx.zones {
        drain_zone(ctx, zone);
    }
}

// 测试：水位驱动的回收与 OOM
use core::sync::atomic::Ordering;

use spin::Mutex;
use std::sync::Arc;

use super::{make_env, TestVnode};
use crate::config::PAGE_SIZE;
use crate::mm::addr::VirtAddr;
use crate::mm::aspace::{AddressSpace, AsId, MapFlags};
use crate::mm::buddy::{alloc_pages, free_pages, GFP_KERNEL};
use crate::mm::context::MemCtx;
use crate::mm::meminfo;
use crate::mm::reclaim::{self, OomHandler};
use crate::mm::vma::Perm;

fn va(addr: usize) -> VirtAddr {
    VirtAddr::new(addr)
}

/// 把 zone 的空闲页吃到 high 水位以下，返回占着的页
fn press_below_high(env: &super::TestEnv) -> Vec<usize> {
    let ctx = &env.ctx;
    let zone = &ctx.zones[0];
    let mut held = Vec::new();
    while zone.free_pages() >= zone.watermarks.high {
        held.push(alloc_pages(ctx, 0, GFP_KERNEL, None).unwrap());
    }
    held
}

/// 灌 n 个干净的文件页进页缓存（pin 全放掉）
fn fill_cache(ctx: &MemCtx, vnode: u64, n: usize) {
    for index in 0..n {
        let pfn = ctx.page_cache.get(ctx, vnode, index).unwrap();
        ctx.page_cache.release(ctx, pfn);
    }
}

#[test]
fn test_allocation_pressure_schedules_reclaim() {
    let env = make_env(1024);
    let ctx = &env.ctx;
    let zone = &ctx.zones[0];

    assert!(!ctx.reclaim.pending());

    // 吃到 low 以下：分配路径要置起唤醒标志
    let mut held = Vec::new();
    while zone.free_pages() >= zone.watermarks.low {
        held.push(alloc_pages(ctx, 0, GFP_KERNEL, None).unwrap());
    }
    assert!(ctx.reclaim.pending());
    assert!(zone.reclaim_pending.load(Ordering::Relaxed));

    // 回收任务的循环形态：取走标志、干活
    assert!(ctx.reclaim.take_wake());
    assert!(!ctx.reclaim.take_wake(), "wake flag is edge, not level");

    for pfn in held {
        free_pages(ctx, pfn, 0);
    }
    ctx.drain_pcp();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_balance_evicts_clean_file_pages() {
    let env = make_env(1024);
    let ctx = &env.ctx;
    ctx.page_cache
        .register_vnode(1, TestVnode::new(vec![0u8; 256 * PAGE_SIZE]));

    fill_cache(ctx, 1, 128);
    assert_eq!(ctx.page_cache.nr_pages(), 128);

    let held = press_below_high(&env);
    let cached_before = ctx.page_cache.nr_pages();

    let freed = reclaim::balance(ctx);

    assert!(freed > 0, "clean cache pages were reclaimable");
    assert!(ctx.page_cache.nr_pages() < cached_before);

    for pfn in held {
        free_pages(ctx, pfn, 0);
    }
    ctx.drain_pcp();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_balance_skips_pinned_pages() {
    let env = make_env(1024);
    let ctx = &env.ctx;
    ctx.page_cache
        .register_vnode(1, TestVnode::new(vec![0u8; 256 * PAGE_SIZE]));

    // 页 0 pin 住，其余放掉
    let pinned = ctx.page_cache.get(ctx, 1, 0).unwrap();
    fill_cache(ctx, 1, 64);

    let held = press_below_high(&env);
    reclaim::balance(ctx);

    // pin 住的条目还在缓存里
    assert_eq!(ctx.page_cache.lookup(1, 0), Some(pinned));
    let frame = ctx.frames.frame(pinned);
    assert!(frame.refcount() >= 2);

    ctx.page_cache.release(ctx, pinned);
    for pfn in held {
        free_pages(ctx, pfn, 0);
    }
    ctx.drain_pcp();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_balance_writes_back_dirty_before_evicting() {
    let env = make_env(1024);
    let ctx = &env.ctx;
    let vnode = TestVnode::new(vec![0u8; 256 * PAGE_SIZE]);
    ctx.page_cache.register_vnode(1, vnode.clone());

    // 一半脏一半干净
    for index in 0..64 {
        let pfn = ctx.page_cache.get(ctx, 1, index).unwrap();
        if index % 2 == 0 {
            unsafe { ctx.frames.page_ptr(pfn).write(0xd0 + (index % 16) as u8) };
            ctx.page_cache.mark_dirty(ctx, pfn);
        }
        ctx.page_cache.release(ctx, pfn);
    }
    let dirty_before = ctx.page_cache.nr_dirty();
    assert_eq!(dirty_before, 32);

    let held = press_below_high(&env);
    reclaim::balance(ctx);

    // 脏页不是被丢掉的，是先回写的
    let written: usize = (0..64).map(|i| vnode.writes_of(i)).sum();
    assert!(written > 0, "reclaim never wrote dirty pages back");
    assert!(ctx.page_cache.nr_dirty() < dirty_before);
    // 每页至多回写一次
    for index in 0..64 {
        assert!(vnode.writes_of(index) <= 1);
    }

    for pfn in held {
        free_pages(ctx, pfn, 0);
    }
    ctx.page_cache.flush_all(ctx).unwrap();
    ctx.drain_pcp();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_anon_pages_survive_reclaim_without_swap() {
    // 交换空间没配：匿名页只轮转，绝不释放
    let env = make_env(1024);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();
    aspace
        .map_anon(ctx, va(0x10000), 32 * PAGE_SIZE, Perm::RW, MapFlags::empty())
        .unwrap();
    for i in 0..32 {
        aspace
            .write_bytes(ctx, va(0x10000 + i * PAGE_SIZE), &[i as u8])
            .unwrap();
    }

    let held = press_below_high(&env);
    reclaim::balance(ctx);

    // 全部 32 页原样
    assert_eq!(aspace.resident_pages(), 32);
    for i in 0..32 {
        let mut b = [0u8];
        aspace
            .read_bytes(ctx, va(0x10000 + i * PAGE_SIZE), &mut b)
            .unwrap();
        assert_eq!(b[0], i as u8);
    }

    for pfn in held {
        free_pages(ctx, pfn, 0);
    }
    aspace.destroy(ctx);
    ctx.drain_pcp();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_direct_reclaim_rescues_allocation() {
    // 空闲页大半被干净的缓存页占着，剩下的被原子分配吃干（原子
    // 路径不回收）：GFP_KERNEL 分配靠直接回收驱逐缓存页后成功
    let env = make_env(1024);
    let ctx = &env.ctx;
    ctx.page_cache
        .register_vnode(1, TestVnode::new(vec![0u8; 512 * PAGE_SIZE]));

    fill_cache(ctx, 1, 256);

    let mut held = Vec::new();
    while let Ok(pfn) = alloc_pages(ctx, 0, crate::mm::buddy::GFP_ATOMIC, None) {
        held.push(pfn);
    }

    let cached_before = ctx.page_cache.nr_pages();
    let pfn = alloc_pages(ctx, 0, GFP_KERNEL, None).expect("direct reclaim rescues the allocation");
    assert!(
        ctx.page_cache.nr_pages() < cached_before,
        "rescue had to come from evicting cache pages"
    );

    free_pages(ctx, pfn, 0);
    for pfn in held {
        free_pages(ctx, pfn, 0);
    }
    ctx.drain_pcp();
    meminfo::assert_all_invariants(ctx);
}

// ========== OOM ==========

/// 记录牺牲者并拆它地址空间的处理器
struct KillLog {
    killed: Mutex<Vec<AsId>>,
}

impl OomHandler for KillLog {
    fn kill(&self, ctx: &MemCtx, victim: AsId) {
        self.killed.lock().push(victim);
        if let Some(aspace) = ctx.aspace(victim) {
            aspace.destroy(ctx);
        }
    }
}

#[test]
fn test_oom_picks_largest_unprotected_victim() {
    let env = make_env(512);
    let ctx = &env.ctx;

    // 大进程：64 页常驻
    let big = AddressSpace::new(ctx).unwrap();
    big.map_anon(ctx, va(0x10000), 64 * PAGE_SIZE, Perm::RW, MapFlags::empty())
        .unwrap();
    for i in 0..64 {
        big.write_bytes(ctx, va(0x10000 + i * PAGE_SIZE), &[1]).unwrap();
    }

    // 小进程：4 页常驻，设成不可杀
    let small = AddressSpace::new(ctx).unwrap();
    small
        .map_anon(ctx, va(0x10000), 4 * PAGE_SIZE, Perm::RW, MapFlags::empty())
        .unwrap();
    for i in 0..4 {
        small
            .write_bytes(ctx, va(0x10000 + i * PAGE_SIZE), &[2])
            .unwrap();
    }
    small.set_oom_protection(usize::MAX);

    let log = Arc::new(KillLog {
        killed: Mutex::new(Vec::new()),
    });
    reclaim::set_oom_handler(ctx, log.clone());

    // 吃光内存直到 OOM 介入
    let mut held = Vec::new();
    let big_id = big.id();
    loop {
        match alloc_pages(ctx, 0, GFP_KERNEL, None) {
            Ok(pfn) => held.push(pfn),
            Err(_) => break,
        }
    }

    // 大进程被杀；失败的分配在拆除之后重试成功过（held 继续涨）
    assert_eq!(log.killed.lock().clone(), vec![big_id]);
    assert!(ctx.aspace(big_id).is_none());

    // 受保护的幸存者毫发无损
    let mut b = [0u8];
    small.read_bytes(ctx, va(0x10000), &mut b).unwrap();
    assert_eq!(b[0], 2);
    assert_eq!(small.resident_pages(), 4);

    for pfn in held {
        free_pages(ctx, pfn, 0);
    }
    small.destroy(ctx);
    ctx.drain_pcp();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_oom_without_victim_fails_allocation() {
    let env = make_env(256);
    let ctx = &env.ctx;

    // 没有任何可杀进程：吃光后分配报 OutOfMemory
    let mut held = Vec::new();
    loop {
        match alloc_pages(ctx, 0, GFP_KERNEL, None) {
            Ok(pfn) => held.push(pfn),
            Err(e) => {
                assert_eq!(e, crate::error::MmError::OutOfMemory);
                break;
            }
        }
    }
    assert!(!held.is_empty());
    assert!(!reclaim::out_of_memory(ctx));

    for pfn in held {
        free_pages(ctx, pfn, 0);
    }
    ctx.drain_pcp();
    meminfo::assert_all_invariants(ctx);
}

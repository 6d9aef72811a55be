// 测试：地址空间 map/unmap/protect/brk
use super::make_env;
use crate::config::PAGE_SIZE;
use crate::error::MmError;
use crate::mm::addr::VirtAddr;
use crate::mm::aspace::{AddressSpace, MapFlags};
use crate::mm::meminfo;
use crate::mm::vma::Perm;

fn va(addr: usize) -> VirtAddr {
    VirtAddr::new(addr)
}

#[test]
fn test_map_anon_is_lazy() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    let got = aspace
        .map_anon(ctx, va(0x10000), 0x10000, Perm::RW, MapFlags::empty())
        .unwrap();
    assert_eq!(got.as_usize(), 0x10000);

    // 纯虚拟：一个页帧都没分配
    assert_eq!(aspace.resident_pages(), 0);
    assert!(aspace.translate(ctx, va(0x15000)).is_none());

    aspace.destroy(ctx);
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_demand_zero_read() {
    // 匿名 RW region [0x10000, 0x20000)：读 0x15000 按需装零页
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    aspace
        .map_anon(ctx, va(0x10000), 0x10000, Perm::RW, MapFlags::empty())
        .unwrap();

    let mut byte = [0xffu8];
    aspace.read_bytes(ctx, va(0x15000), &mut byte).unwrap();
    assert_eq!(byte[0], 0, "demand-zero page must read as zero");

    assert_eq!(aspace.resident_pages(), 1);
    let (pfn, pte) = aspace.translate(ctx, va(0x15000)).unwrap();
    assert!(pte.is_writable());
    assert_eq!(ctx.frames.frame(pfn).refcount(), 1);

    aspace.destroy(ctx);
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_write_read_roundtrip() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    aspace
        .map_anon(ctx, va(0x10000), 0x4000, Perm::RW, MapFlags::empty())
        .unwrap();

    let data = [1u8, 2, 3, 4, 5];
    // 跨页写（页边界在 0x11000）
    aspace.write_bytes(ctx, va(0x10ffe), &data).unwrap();
    let mut back = [0u8; 5];
    aspace.read_bytes(ctx, va(0x10ffe), &mut back).unwrap();
    assert_eq!(back, data);
    assert_eq!(aspace.resident_pages(), 2);

    aspace.destroy(ctx);
}

#[test]
fn test_wx_never_both() {
    // 场景：请求 RWX 的 region，装出来的 PTE 必须 W=1、X=0
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    aspace
        .map_anon(
            ctx,
            va(0x10000),
            0x1000,
            Perm::READ | Perm::WRITE | Perm::EXEC,
            MapFlags::empty(),
        )
        .unwrap();
    aspace.write_bytes(ctx, va(0x10000), &[0x42]).unwrap();

    let (_, pte) = aspace.translate(ctx, va(0x10000)).unwrap();
    assert!(pte.is_writable(), "WRITE must be kept");
    assert!(!pte.is_executable(), "EXEC must be silently dropped");

    // 不变量：任何 PTE 不得同时可写可执行
    aspace.destroy(ctx);
}

#[test]
fn test_jit_two_step_dance() {
    // JIT 的约定写法：先 RW 写入，再 protect 成 RX
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    aspace
        .map_anon(ctx, va(0x10000), 0x1000, Perm::RW, MapFlags::empty())
        .unwrap();
    aspace.write_bytes(ctx, va(0x10000), &[0x90, 0x90]).unwrap();

    aspace.protect(ctx, va(0x10000), 0x1000, Perm::RX).unwrap();
    let (_, pte) = aspace.translate(ctx, va(0x10000)).unwrap();
    assert!(!pte.is_writable());
    assert!(pte.is_executable());

    aspace.destroy(ctx);
}

#[test]
fn test_zero_length_ops() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    // 零长度 map 是返回成功的无操作
    let got = aspace
        .map_anon(ctx, va(0x10000), 0, Perm::RW, MapFlags::empty())
        .unwrap();
    assert_eq!(got.as_usize(), 0x10000);
    assert!(aspace.query(ctx, va(0x10000)).is_none());

    assert_eq!(aspace.unmap(ctx, va(0x10000), 0), Ok(()));
    assert_eq!(aspace.protect(ctx, va(0x10000), 0, Perm::READ), Ok(()));

    aspace.destroy(ctx);
}

#[test]
fn test_alignment_errors() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    assert_eq!(
        aspace.map_anon(ctx, va(0x10001), 0x1000, Perm::RW, MapFlags::empty()),
        Err(MmError::AlignmentError)
    );
    assert_eq!(
        aspace.map_anon(ctx, va(0x10000), 0x800, Perm::RW, MapFlags::empty()),
        Err(MmError::AlignmentError)
    );
    assert_eq!(
        aspace.unmap(ctx, va(0x10001), 0x1000),
        Err(MmError::AlignmentError)
    );
    // 出错不留痕
    assert!(aspace.query(ctx, va(0x10000)).is_none());

    aspace.destroy(ctx);
}

#[test]
fn test_fixed_conflict() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    aspace
        .map_anon(ctx, va(0x10000), 0x4000, Perm::RW, MapFlags::empty())
        .unwrap();
    assert_eq!(
        aspace.map_anon(ctx, va(0x12000), 0x4000, Perm::RW, MapFlags::FIXED),
        Err(MmError::Conflict)
    );

    // 不带 FIXED 就换个地方
    let got = aspace
        .map_anon(ctx, va(0x12000), 0x4000, Perm::RW, MapFlags::empty())
        .unwrap();
    assert_ne!(got.as_usize(), 0x12000);

    aspace.destroy(ctx);
}

#[test]
fn test_unmap_splits_region() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    aspace
        .map_anon(ctx, va(0x10000), 0x8000, Perm::RW, MapFlags::empty())
        .unwrap();
    // 触碰全部 8 页
    for i in 0..8 {
        aspace
            .write_bytes(ctx, va(0x10000 + i * PAGE_SIZE), &[i as u8])
            .unwrap();
    }

    // 挖掉中间两页：两个剩余 region 的并集 = 原区间减去被挖范围
    aspace.unmap(ctx, va(0x13000), 0x2000).unwrap();

    assert!(aspace.query(ctx, va(0x12000)).is_some());
    assert!(aspace.query(ctx, va(0x13000)).is_none());
    assert!(aspace.query(ctx, va(0x14000)).is_none());
    assert!(aspace.query(ctx, va(0x15000)).is_some());

    assert!(aspace.translate(ctx, va(0x13000)).is_none());
    assert!(aspace.translate(ctx, va(0x15000)).is_some());
    assert_eq!(aspace.resident_pages(), 6);

    // 两端数据原样
    let mut b = [0u8];
    aspace.read_bytes(ctx, va(0x12000), &mut b).unwrap();
    assert_eq!(b[0], 2);
    aspace.read_bytes(ctx, va(0x17000), &mut b).unwrap();
    assert_eq!(b[0], 7);

    aspace.destroy(ctx);
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_unmap_is_idempotent() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    // 对完全没映射过的范围 unmap 是无操作的成功
    assert_eq!(aspace.unmap(ctx, va(0x30000), 0x4000), Ok(()));

    aspace
        .map_anon(ctx, va(0x30000), 0x4000, Perm::RW, MapFlags::empty())
        .unwrap();
    aspace.write_bytes(ctx, va(0x30000), &[9]).unwrap();

    assert_eq!(aspace.unmap(ctx, va(0x30000), 0x4000), Ok(()));
    // 再来一遍还是成功
    assert_eq!(aspace.unmap(ctx, va(0x30000), 0x4000), Ok(()));

    aspace.destroy(ctx);
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_protect_revokes_write() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    aspace
        .map_anon(ctx, va(0x10000), 0x2000, Perm::RW, MapFlags::empty())
        .unwrap();
    aspace.write_bytes(ctx, va(0x10000), &[7]).unwrap();

    let shootdowns_before = env.tlb.shootdowns.load(core::sync::atomic::Ordering::Relaxed);
    let flushes_before = env.tlb.local_flushes.load(core::sync::atomic::Ordering::Relaxed);
    aspace.protect(ctx, va(0x10000), 0x2000, Perm::READ).unwrap();
    // protect 必须刷 TLB（本核直刷，其他活跃核 shootdown）
    let flushes_after = env.tlb.local_flushes.load(core::sync::atomic::Ordering::Relaxed);
    let _ = shootdowns_before;
    assert!(flushes_after > flushes_before);

    let (_, pte) = aspace.translate(ctx, va(0x10000)).unwrap();
    assert!(!pte.is_writable());

    // region 不再授写权：写访问报坏地址
    assert_eq!(
        aspace.write_bytes(ctx, va(0x10000), &[8]),
        Err(MmError::BadAddress)
    );
    // 读还好好的
    let mut b = [0u8];
    aspace.read_bytes(ctx, va(0x10000), &mut b).unwrap();
    assert_eq!(b[0], 7);

    aspace.destroy(ctx);
}

#[test]
fn test_protect_uncovered_range() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    aspace
        .map_anon(ctx, va(0x10000), 0x2000, Perm::RW, MapFlags::empty())
        .unwrap();
    // 范围伸进没有 region 的空洞
    assert_eq!(
        aspace.protect(ctx, va(0x10000), 0x4000, Perm::READ),
        Err(MmError::BadAddress)
    );

    aspace.destroy(ctx);
}

#[test]
fn test_brk() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    aspace.init_brk(va(0x2000_0000)).unwrap();

    // 向上长两页
    aspace.brk(ctx, 0x2000_2000).unwrap();
    aspace.write_bytes(ctx, va(0x2000_0000), &[0xab]).unwrap();
    aspace.write_bytes(ctx, va(0x2000_1000), &[0xcd]).unwrap();

    // 缩回一页：尾页解除映射
    aspace.brk(ctx, 0x2000_1000).unwrap();
    assert!(aspace.translate(ctx, va(0x2000_1000)).is_none());
    let mut b = [0u8];
    aspace.read_bytes(ctx, va(0x2000_0000), &mut b).unwrap();
    assert_eq!(b[0], 0xab);

    // 低于基址非法
    assert_eq!(
        aspace.brk(ctx, 0x1fff_0000),
        Err(MmError::InvalidArgument)
    );

    aspace.destroy(ctx);
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_region_at_address_zero() {
    // 地址 0 起始的 region：0 处的缺页和任何区内缺页一个待遇
    let env = make_env(2048);
    let ctx = &env.ctx;
    let aspace = AddressSpace::new(ctx).unwrap();

    let got = aspace
        .map_anon(ctx, va(0), 0x2000, Perm::RW, MapFlags::FIXED)
        .unwrap();
    assert_eq!(got.as_usize(), 0);

    aspace.write_bytes(ctx, va(0), &[0x66]).unwrap();
    let mut b = [0u8];
    aspace.read_bytes(ctx, va(0), &mut b).unwrap();
    assert_eq!(b[0], 0x66);
    assert!(aspace.translate(ctx, va(0)).is_some());

    aspace.destroy(ctx);
}

#[test]
fn test_map_known_frames_shares_ownership() {
    // 直接映射一段已知页帧（共享内存的路数）：两个空间各 pin 一次，
    // unmap 对称放掉，调用者的引用最后归还
    let env = make_env(2048);
    let ctx = &env.ctx;
    let pfn = crate::mm::buddy::alloc_pages(ctx, 1, crate::mm::buddy::GFP_KERNEL, None).unwrap();
    unsafe { ctx.frames.page_ptr(pfn).write(0x77) };

    let a = AddressSpace::new(ctx).unwrap();
    let b = AddressSpace::new(ctx).unwrap();
    a.map(ctx, va(0x10000), pfn, 2 * PAGE_SIZE, Perm::RW).unwrap();
    b.map(ctx, va(0x80000), pfn, 2 * PAGE_SIZE, Perm::READ).unwrap();
    assert_eq!(ctx.frames.frame(pfn).refcount(), 3);

    // 一边写一边读：真共享，不 COW
    a.write_bytes(ctx, va(0x10001), &[0x88]).unwrap();
    let mut bytes = [0u8; 2];
    b.read_bytes(ctx, va(0x80000), &mut bytes).unwrap();
    assert_eq!(bytes, [0x77, 0x88]);

    // FIXED 语义：与现有 region 冲突报错
    assert_eq!(
        a.map(ctx, va(0x10000), pfn, PAGE_SIZE, Perm::READ),
        Err(MmError::Conflict)
    );

    a.unmap(ctx, va(0x10000), 2 * PAGE_SIZE).unwrap();
    b.destroy(ctx);
    assert_eq!(ctx.frames.frame(pfn).refcount(), 1);

    crate::mm::buddy::free_pages(ctx, pfn, 1);
    a.destroy(ctx);
    ctx.drain_pcp();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_destroy_returns_all_frames() {
    let env = make_env(2048);
    let ctx = &env.ctx;

    let free_before = env.total_free();
    let aspace = AddressSpace::new(ctx).unwrap();
    aspace
        .map_anon(ctx, va(0x10000), 0x20000, Perm::RW, MapFlags::empty())
        .unwrap();
    for i in 0..32 {
        aspace
            .write_bytes(ctx, va(0x10000 + i * PAGE_SIZE), &[1])
            .unwrap();
    }
    assert_eq!(aspace.resident_pages(), 32);
    let id = aspace.id();

    aspace.destroy(ctx);
    ctx.drain_pcp();

    assert!(ctx.aspace(id).is_none(), "destroyed space still registered");
    assert_eq!(env.total_free(), free_before);
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_activate_tracks_cpu() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let a = AddressSpace::new(ctx).unwrap();
    let b = AddressSpace::new(ctx).unwrap();

    a.activate(ctx, 0);
    assert_eq!(ctx.active_aspace(0).unwrap().id(), a.id());
    assert_eq!(a.active_mask(), 0x1);

    b.activate(ctx, 0);
    assert_eq!(ctx.active_aspace(0).unwrap().id(), b.id());
    assert_eq!(a.active_mask(), 0, "old space keeps stale active bit");
    assert_eq!(b.active_mask(), 0x1);

    a.destroy(ctx);
    b.destroy(ctx);
}

// 测试：统一页缓存
use core::sync::atomic::Ordering;

use super::{make_env, TestVnode};
use crate::config::PAGE_SIZE;
use crate::error::MmError;
use crate::mm::addr::VirtAddr;
use crate::mm::aspace::{AddressSpace, MapFlags};
use crate::mm::frame::FrameFlag;
use crate::mm::meminfo;
use crate::mm::page_cache::map_into;
use crate::mm::vma::Perm;

fn va(addr: usize) -> VirtAddr {
    VirtAddr::new(addr)
}

/// 填一个 3 页的文件：每页首字节是页号 + 0x10
fn file_data() -> Vec<u8> {
    let mut data = vec![0u8; 3 * PAGE_SIZE];
    for page in 0..3 {
        data[page * PAGE_SIZE] = 0x10 + page as u8;
    }
    data
}

#[test]
fn test_get_loads_and_pins() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let vnode = TestVnode::new(file_data());
    ctx.page_cache.register_vnode(1, vnode.clone());

    let pfn = ctx.page_cache.get(ctx, 1, 0).unwrap();
    let frame = ctx.frames.frame(pfn);

    // 基准引用 + 调用者 pin
    assert_eq!(frame.refcount(), 2);
    assert!(frame.test_flag(FrameFlag::PageCache));
    assert!(frame.test_flag(FrameFlag::UpToDate));
    assert!(!frame.is_locked(), "published entry must be unlocked");
    assert_eq!(vnode.reads.load(Ordering::Relaxed), 1);

    // 页内容来自后备存储
    let byte = unsafe { ctx.frames.page_ptr(pfn).read() };
    assert_eq!(byte, 0x10);

    // 第二次 get 命中，不再读盘
    let again = ctx.page_cache.get(ctx, 1, 0).unwrap();
    assert_eq!(again, pfn);
    assert_eq!(vnode.reads.load(Ordering::Relaxed), 1);
    assert_eq!(frame.refcount(), 3);

    ctx.page_cache.release(ctx, pfn);
    ctx.page_cache.release(ctx, again);
    assert_eq!(frame.refcount(), 1);
    assert_eq!(ctx.page_cache.nr_pages(), 1);
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_lookup_returns_at_most_one_entry() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    ctx.page_cache.register_vnode(1, TestVnode::new(file_data()));

    assert!(ctx.page_cache.lookup(1, 0).is_none());

    let pfn = ctx.page_cache.get(ctx, 1, 0).unwrap();
    assert_eq!(ctx.page_cache.lookup(1, 0), Some(pfn));
    // 同一键再怎么 get 也只有一个条目
    let again = ctx.page_cache.get(ctx, 1, 0).unwrap();
    assert_eq!(again, pfn);
    assert_eq!(ctx.page_cache.nr_pages(), 1);

    // 不同键互不串扰
    assert!(ctx.page_cache.lookup(1, 1).is_none());
    assert!(ctx.page_cache.lookup(2, 0).is_none());

    ctx.page_cache.release(ctx, pfn);
    ctx.page_cache.release(ctx, again);
}

#[test]
fn test_get_unregistered_vnode_fails() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    assert_eq!(ctx.page_cache.get(ctx, 99, 0), Err(MmError::Io));
}

#[test]
fn test_read_failure_leaves_no_entry() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let vnode = TestVnode::new(file_data());
    vnode.fail_reads.store(true, Ordering::Relaxed);
    ctx.page_cache.register_vnode(1, vnode.clone());

    let free_before = env.total_free();
    assert_eq!(ctx.page_cache.get(ctx, 1, 0), Err(MmError::Io));

    // 读失败不留条目、不漏页帧
    assert_eq!(ctx.page_cache.nr_pages(), 0);
    assert!(ctx.page_cache.lookup(1, 0).is_none());
    assert_eq!(env.total_free(), free_before);

    // 恢复后重试成功
    vnode.fail_reads.store(false, Ordering::Relaxed);
    let pfn = ctx.page_cache.get(ctx, 1, 0).unwrap();
    ctx.page_cache.release(ctx, pfn);
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_flush_writes_each_dirty_page_once() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let vnode = TestVnode::new(file_data());
    ctx.page_cache.register_vnode(1, vnode.clone());

    // 三页里弄脏两页
    let p0 = ctx.page_cache.get(ctx, 1, 0).unwrap();
    let p1 = ctx.page_cache.get(ctx, 1, 1).unwrap();
    let p2 = ctx.page_cache.get(ctx, 1, 2).unwrap();
    unsafe {
        ctx.frames.page_ptr(p0).write(0xaa);
        ctx.frames.page_ptr(p2).write(0xbb);
    }
    ctx.page_cache.mark_dirty(ctx, p0);
    ctx.page_cache.mark_dirty(ctx, p2);
    // 重复标脏不加计数
    ctx.page_cache.mark_dirty(ctx, p0);
    assert_eq!(ctx.page_cache.nr_dirty(), 2);

    ctx.page_cache.flush(ctx, 1).unwrap();

    // 进入时为脏的每一页恰好回写一次，干净页一次不写
    assert_eq!(vnode.writes_of(0), 1);
    assert_eq!(vnode.writes_of(1), 0);
    assert_eq!(vnode.writes_of(2), 1);
    assert_eq!(ctx.page_cache.nr_dirty(), 0);
    assert_eq!(vnode.byte_at(0), 0xaa);
    assert_eq!(vnode.byte_at(2 * PAGE_SIZE), 0xbb);

    // 再 flush 一遍：全干净，无事发生
    ctx.page_cache.flush(ctx, 1).unwrap();
    assert_eq!(vnode.writes_of(0), 1);

    ctx.page_cache.release(ctx, p0);
    ctx.page_cache.release(ctx, p1);
    ctx.page_cache.release(ctx, p2);
}

#[test]
fn test_flush_all_covers_every_vnode() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let va_node = TestVnode::new(file_data());
    let vb_node = TestVnode::new(file_data());
    ctx.page_cache.register_vnode(1, va_node.clone());
    ctx.page_cache.register_vnode(2, vb_node.clone());

    let pa = ctx.page_cache.get(ctx, 1, 0).unwrap();
    let pb = ctx.page_cache.get(ctx, 2, 1).unwrap();
    ctx.page_cache.mark_dirty(ctx, pa);
    ctx.page_cache.mark_dirty(ctx, pb);

    ctx.page_cache.flush_all(ctx).unwrap();
    assert_eq!(va_node.writes_of(0), 1);
    assert_eq!(vb_node.writes_of(1), 1);
    assert_eq!(ctx.page_cache.nr_dirty(), 0);

    ctx.page_cache.release(ctx, pa);
    ctx.page_cache.release(ctx, pb);
}

#[test]
fn test_scenario_mapped_file_write_then_flush() {
    // 场景：偏移 0 是 0x41 的文件 RW 映射到 0x40000；写 0x5A 后
    // flush，回写钩子对页号 0 恰好调用一次，内容是 0x5A
    let env = make_env(2048);
    let ctx = &env.ctx;
    let mut data = vec![0u8; PAGE_SIZE];
    data[0] = 0x41;
    let vnode = TestVnode::new(data);
    ctx.page_cache.register_vnode(7, vnode.clone());

    let aspace = AddressSpace::new(ctx).unwrap();
    aspace
        .map_file(ctx, va(0x40000), PAGE_SIZE, Perm::RW, MapFlags::empty(), 7, 0)
        .unwrap();

    aspace.write_bytes(ctx, va(0x40000), &[0x5a]).unwrap();

    // 写缺页把条目标脏了
    assert_eq!(ctx.page_cache.nr_dirty(), 1);

    ctx.page_cache.flush(ctx, 7).unwrap();
    assert_eq!(vnode.writes_of(0), 1, "exactly one writeback for page 0");
    assert_eq!(vnode.byte_at(0), 0x5a);

    aspace.destroy(ctx);
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_first_write_fault_maintains_dirty_tracking() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    ctx.page_cache.register_vnode(7, TestVnode::new(file_data()));

    let aspace = AddressSpace::new(ctx).unwrap();
    aspace
        .map_file(
            ctx,
            va(0x40000),
            2 * PAGE_SIZE,
            Perm::RW,
            MapFlags::empty(),
            7,
            0,
        )
        .unwrap();

    // 读触碰：region 授写权，但 PTE 装成只读
    let mut b = [0u8];
    aspace.read_bytes(ctx, va(0x40000), &mut b).unwrap();
    assert_eq!(b[0], 0x10);
    let (_, pte) = aspace.translate(ctx, va(0x40000)).unwrap();
    assert!(!pte.is_writable(), "file page must start read-only");
    assert_eq!(ctx.page_cache.nr_dirty(), 0);

    // 首写：缺页升级为可写并标脏
    aspace.write_bytes(ctx, va(0x40000), &[0x99]).unwrap();
    let (_, pte) = aspace.translate(ctx, va(0x40000)).unwrap();
    assert!(pte.is_writable());
    assert_eq!(ctx.page_cache.nr_dirty(), 1);

    // 没写过的第二页保持干净
    aspace.read_bytes(ctx, va(0x41000), &mut b).unwrap();
    assert_eq!(ctx.page_cache.nr_dirty(), 1);

    aspace.destroy(ctx);
    ctx.page_cache.flush_all(ctx).unwrap();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_map_into_writable_marks_dirty_now() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    ctx.page_cache.register_vnode(7, TestVnode::new(file_data()));

    let aspace = AddressSpace::new(ctx).unwrap();
    aspace
        .map_file(ctx, va(0x40000), 2 * PAGE_SIZE, Perm::RW, MapFlags::empty(), 7, 0)
        .unwrap();

    // writable=false：装只读，脏跟踪靠首写缺页
    map_into(ctx, &aspace, 7, 0, va(0x40000), Perm::RW, false).unwrap();
    let (_, pte) = aspace.translate(ctx, va(0x40000)).unwrap();
    assert!(!pte.is_writable());
    assert_eq!(ctx.page_cache.nr_dirty(), 0);

    // writable=true：直接可写并立即标脏
    map_into(ctx, &aspace, 7, PAGE_SIZE, va(0x41000), Perm::RW, true).unwrap();
    let (_, pte) = aspace.translate(ctx, va(0x41000)).unwrap();
    assert!(pte.is_writable());
    assert_eq!(ctx.page_cache.nr_dirty(), 1);

    aspace.destroy(ctx);
    ctx.page_cache.flush_all(ctx).unwrap();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_shared_mapping_through_cache() {
    // 两个地址空间映射同一文件页：共享同一个页帧，一边写一边读
    let env = make_env(2048);
    let ctx = &env.ctx;
    ctx.page_cache.register_vnode(7, TestVnode::new(file_data()));

    let a = AddressSpace::new(ctx).unwrap();
    let b = AddressSpace::new(ctx).unwrap();
    a.map_file(ctx, va(0x40000), PAGE_SIZE, Perm::RW, MapFlags::empty(), 7, 0)
        .unwrap();
    b.map_file(ctx, va(0x50000), PAGE_SIZE, Perm::READ, MapFlags::empty(), 7, 0)
        .unwrap();

    a.write_bytes(ctx, va(0x40000), &[0x77]).unwrap();
    let mut byte = [0u8];
    b.read_bytes(ctx, va(0x50000), &mut byte).unwrap();
    assert_eq!(byte[0], 0x77, "file mappings share the cache frame");

    let (pa, _) = a.translate(ctx, va(0x40000)).unwrap();
    let (pb, _) = b.translate(ctx, va(0x50000)).unwrap();
    assert_eq!(pa, pb);

    a.destroy(ctx);
    b.destroy(ctx);
    ctx.page_cache.flush_all(ctx).unwrap();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_invalidate_drops_entries_and_frames() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    ctx.page_cache.register_vnode(1, TestVnode::new(file_data()));

    let free_before = env.total_free();
    for index in 0..3 {
        let pfn = ctx.page_cache.get(ctx, 1, index).unwrap();
        ctx.page_cache.release(ctx, pfn);
    }
    assert_eq!(ctx.page_cache.nr_pages(), 3);

    // 截断后半部分：页 1、2 没了，页 0 还在
    ctx.page_cache.invalidate(ctx, 1, 1, usize::MAX);
    assert_eq!(ctx.page_cache.nr_pages(), 1);
    assert!(ctx.page_cache.lookup(1, 0).is_some());
    assert!(ctx.page_cache.lookup(1, 1).is_none());

    // 整个文件
    ctx.page_cache.invalidate(ctx, 1, 0, usize::MAX);
    assert_eq!(ctx.page_cache.nr_pages(), 0);
    ctx.drain_pcp();
    assert_eq!(env.total_free(), free_before);
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_invalidate_with_live_mapping_defers_free() {
    // invalidate 撤条目；仍被映射的页帧等最后一个 unmap 才归还
    let env = make_env(2048);
    let ctx = &env.ctx;
    ctx.page_cache.register_vnode(7, TestVnode::new(file_data()));

    let aspace = AddressSpace::new(ctx).unwrap();
    aspace
        .map_file(ctx, va(0x40000), PAGE_SIZE, Perm::READ, MapFlags::empty(), 7, 0)
        .unwrap();
    let mut b = [0u8];
    aspace.read_bytes(ctx, va(0x40000), &mut b).unwrap();
    let (pfn, _) = aspace.translate(ctx, va(0x40000)).unwrap();

    ctx.page_cache.invalidate(ctx, 7, 0, usize::MAX);
    assert_eq!(ctx.page_cache.nr_pages(), 0);

    // 映射还活着，页帧还在它手里
    assert_eq!(ctx.frames.frame(pfn).refcount(), 1);
    aspace.read_bytes(ctx, va(0x40000), &mut b).unwrap();
    assert_eq!(b[0], 0x10);

    aspace.destroy(ctx);
    ctx.drain_pcp();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_msync_flushes_touched_vnodes() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let touched = TestVnode::new(file_data());
    let other = TestVnode::new(file_data());
    ctx.page_cache.register_vnode(7, touched.clone());
    ctx.page_cache.register_vnode(8, other.clone());

    let aspace = AddressSpace::new(ctx).unwrap();
    aspace
        .map_file(ctx, va(0x40000), PAGE_SIZE, Perm::RW, MapFlags::empty(), 7, 0)
        .unwrap();
    aspace
        .map_file(ctx, va(0x50000), PAGE_SIZE, Perm::RW, MapFlags::empty(), 8, 0)
        .unwrap();
    aspace.write_bytes(ctx, va(0x40000), &[0x01]).unwrap();
    aspace.write_bytes(ctx, va(0x50000), &[0x02]).unwrap();
    assert_eq!(ctx.page_cache.nr_dirty(), 2);

    // 范围只盖住第一个映射：只有它的 vnode 被回写
    aspace.msync(ctx, va(0x40000), PAGE_SIZE).unwrap();
    assert_eq!(touched.writes_of(0), 1);
    assert_eq!(other.writes_of(0), 0);
    assert_eq!(ctx.page_cache.nr_dirty(), 1);

    // 零长度与未对齐
    aspace.msync(ctx, va(0x40000), 0).unwrap();
    assert_eq!(
        aspace.msync(ctx, va(0x40001), PAGE_SIZE),
        Err(MmError::AlignmentError)
    );

    aspace.destroy(ctx);
    ctx.page_cache.flush_all(ctx).unwrap();
    meminfo::assert_all_invariants(ctx);
}

#[test]
fn test_dirty_entry_survives_failed_writeback() {
    let env = make_env(2048);
    let ctx = &env.ctx;
    let vnode = TestVnode::new(file_data());
    ctx.page_cache.register_vnode(1, vnode.clone());

    let pfn = ctx.page_cache.get(ctx, 1, 0).unwrap();
    ctx.page_cache.mark_dirty(ctx, pfn);

    // 回写钩子挂了：DIRTY 保留，下次 flush 重试
    ctx.page_cache.unregister_vnode(1);
    assert!(ctx.page_cache.flush(ctx, 1).is_err());
    assert_eq!(ctx.page_cache.nr_dirty(), 1);

    ctx.page_cache.register_vnode(1, vnode.clone());
    ctx.page_cache.flush(ctx, 1).unwrap();
    assert_eq!(ctx.page_cache.nr_dirty(), 0);
    assert_eq!(vnode.writes_of(0), 1);

    ctx.page_cache.release(ctx, pfn);
}

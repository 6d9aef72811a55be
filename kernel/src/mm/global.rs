//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 全局入口
//!
//! 核心内部全部以 `&MemCtx` 显式传递；内核其他子系统要的是
//! 全局单例。这里提供安装一次的全局上下文和经典签名的包装：
//! `kmalloc` 返回裸指针、失败给 null，`alloc_pages` 给
//! `Option<Pfn>`，供不关心错误细节的调用方使用。
//!
//! `KernelHeap` 是 GlobalAlloc 适配器：嵌入的内核把它注册成
//! `#[global_allocator]`，Rust 的 alloc 就落到 slab 上。

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;

use spin::Once;

use super::addr::{Pfn, VirtAddr};
use super::buddy::GfpFlags;
use super::context::MemCtx;
use super::fault::FaultError;
use super::{buddy, fault, slab};
use crate::error::MmResult;

static KMEM: Once<MemCtx> = Once::new();

/// 安装全局上下文（启动时恰好一次）
///
/// 返回安装后的引用；重复安装 panic。
pub fn install(ctx: MemCtx) -> &'static MemCtx {
    let mut fresh = false;
    let installed = KMEM.call_once(|| {
        fresh = true;
        ctx
    });
    if !fresh {
        panic!("mm: global context installed twice");
    }
    installed
}

/// 全局上下文；未安装时 panic
pub fn ctx() -> &'static MemCtx {
    KMEM.get().expect("mm: global context not installed")
}

/// 全局上下文；未安装时 None
pub fn try_ctx() -> Option<&'static MemCtx> {
    KMEM.get()
}

// ========== 经典签名的包装 ==========

/// 分配内核内存；失败返回 null
pub fn kmalloc(size: usize, gfp: GfpFlags) -> *mut u8 {
    match slab::kmalloc(ctx(), size, gfp) {
        Ok(ptr) => ptr.as_ptr(),
        Err(_) => core::ptr::null_mut(),
    }
}

/// 分配并清零；失败返回 null
pub fn kzalloc(size: usize, gfp: GfpFlags) -> *mut u8 {
    match slab::kzalloc(ctx(), size, gfp) {
        Ok(ptr) => ptr.as_ptr(),
        Err(_) => core::ptr::null_mut(),
    }
}

/// 释放 kmalloc 的内存；null 是无操作
pub fn kfree(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        slab::kfree(ctx(), ptr);
    }
}

/// 分配 2^order 页
pub fn alloc_pages(order: usize, gfp: GfpFlags) -> Option<Pfn> {
    buddy::alloc_pages(ctx(), order, gfp, None).ok()
}

/// 释放 2^order 页
pub fn free_pages(pfn: Pfn, order: usize) {
    buddy::free_pages(ctx(), pfn, order);
}

/// 体系结构 trap 入口调用的缺页分发
pub fn handle_fault(cpu: usize, va: VirtAddr, err: FaultError) -> MmResult<()> {
    fault::handle_fault_on(ctx(), cpu, va, err)
}

// ========== GlobalAlloc 适配器 ==========

/// 内核堆：把 Rust 的全局分配接到 slab/伙伴系统上
///
/// 嵌入的内核声明：
/// ```ignore
/// #[global_allocator]
/// static HEAP: ferro::mm::global::KernelHeap = ferro::mm::global::KernelHeap;
/// ```
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ctx = match try_ctx() {
            Some(ctx) => ctx,
            None => return core::ptr::null_mut(),
        };
        // slab 桶按 8 对齐；更大的对齐要求用大小撑齐（桶和伙伴块
        // 都是 2 的幂边界）
        let size = layout.size().max(layout.align());
        match slab::kmalloc(ctx, size, GfpFlags::empty()) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => core::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let (Some(ctx), Some(ptr)) = (try_ctx(), NonNull::new(ptr)) {
            slab::kfree(ctx, ptr);
        }
    }
}

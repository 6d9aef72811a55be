//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 体系结构钩子
//!
//! 内存核心需要的全部体系结构操作都收敛到 `ArchOps` 一个 trait：
//! CPU 编号、安装页表根、TLB 刷新与跨核 shootdown。真实内核在
//! `MemCtx::init` 时注入各平台实现（RISC-V 上对应 satp 写入与
//! sfence.vma + IPI）；宿主机测试注入记录型实现。
//!
//! TLB 一致性约定（见缺页/保护路径）：任何 PTE 变更先完成 shootdown
//! 再释放地址空间锁；本核的失效是立即的本地失效。

use crate::mm::addr::{Pfn, VirtAddr};

/// 体系结构操作
pub trait ArchOps: Send + Sync {
    /// 当前 CPU 编号（0..MAX_CPUS）
    fn cpu_id(&self) -> usize;

    /// 在当前 CPU 上安装页表根（地址空间切换）
    fn install_root(&self, root: Pfn, asid: u64);

    /// 本地 TLB 失效
    ///
    /// `pages == 0` 表示整个地址空间。
    fn tlb_flush_local(&self, root: Pfn, va: VirtAddr, pages: usize);

    /// 跨核 TLB shootdown
    ///
    /// 通知 `cpu_mask` 中的每个 CPU 使指定范围的翻译失效，
    /// 等待全部确认后才返回。
    fn tlb_shootdown(&self, root: Pfn, va: VirtAddr, pages: usize, cpu_mask: usize);
}

/// 单核空实现
///
/// 启动早期（次核未上线）以及单核配置使用；shootdown 退化为本地失效。
pub struct NullArch;

impl ArchOps for NullArch {
    fn cpu_id(&self) -> usize {
        0
    }

    fn install_root(&self, _root: Pfn, _asid: u64) {}

    fn tlb_flush_local(&self, _root: Pfn, _va: VirtAddr, _pages: usize) {}

    fn tlb_shootdown(&self, root: Pfn, va: VirtAddr, pages: usize, _cpu_mask: usize) {
        self.tlb_flush_local(root, va, pages);
    }
}

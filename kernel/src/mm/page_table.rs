//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 三级页表（Sv39 风格）
//!
//! 页表规格：
//! - 3 级页表（512 项/级），39 位虚拟地址，4KB 页
//! - 页表项：44 位 PPN（位 [53:10]）+ 低 10 位标志
//! - 位 [8] 是软件位，用作 COW 标记；位 [61:54] 保留，必须为 0
//!
//! 页表节点本身是从伙伴系统拿的 order-0 页帧，通过直接映射访问，
//! 核心因此不依赖具体体系结构，可以在宿主机上完整测试。
//!
//! W^X 在这里统一强制：任何同时请求 WRITE 和 EXEC 的安装都
//! 静默保留 WRITE、清除 EXEC。`map_page` 是所有 PTE 安装的
//! 唯一入口，消费者绕不过去。

use super::addr::{Pfn, VirtAddr};
use super::buddy::{self, GfpFlags};
use super::context::MemCtx;
use super::vma::Perm;
use crate::config::PAGE_SHIFT;
use crate::error::{MmError, MmResult};

/// 内核半区在顶级页表中的起始索引（vpn2 256..511）
pub const KERNEL_VPN2_BASE: usize = 256;

/// 页表项
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(pub u64);

impl Pte {
    /// V (Valid) - 位 0
    pub const V: u64 = 1 << 0;
    /// R (Read) - 位 1
    pub const R: u64 = 1 << 1;
    /// W (Write) - 位 2
    pub const W: u64 = 1 << 2;
    /// X (Execute) - 位 3
    pub const X: u64 = 1 << 3;
    /// U (User) - 位 4
    pub const U: u64 = 1 << 4;
    /// G (Global) - 位 5
    pub const G: u64 = 1 << 5;
    /// A (Accessed) - 位 6
    pub const A: u64 = 1 << 6;
    /// D (Dirty) - 位 7
    pub const D: u64 = 1 << 7;
    /// COW（软件位，RSW0）
    pub const COW: u64 = 1 << 8;

    /// 保留位窗口，必须为 0
    pub const RESERVED_MASK: u64 = 0xff << 54;

    #[inline]
    pub const fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(&self) -> u64 {
        self.0
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.0 & Self::V != 0
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        self.0 & Self::R != 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.0 & Self::W != 0
    }

    #[inline]
    pub fn is_executable(&self) -> bool {
        self.0 & Self::X != 0
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.0 & Self::U != 0
    }

    #[inline]
    pub fn is_cow(&self) -> bool {
        self.0 & Self::COW != 0
    }

    /// 指向下一级页表（valid 且无 R/W/X）
    #[inline]
    pub fn is_table(&self) -> bool {
        self.is_valid() && self.0 & (Self::R | Self::W | Self::X) == 0
    }

    #[inline]
    pub fn has_reserved_bits(&self) -> bool {
        self.0 & Self::RESERVED_MASK != 0
    }

    /// 物理页号（位 [53:10]）
    #[inline]
    pub fn ppn(&self) -> Pfn {
        ((self.0 >> 10) & 0xfff_ffff_ffff) as Pfn
    }

    /// 指向下一级页表的 PTE
    #[inline]
    pub fn new_table(pfn: Pfn) -> Self {
        Self(((pfn as u64) << 10) | Self::V)
    }

    /// 叶子 PTE
    ///
    /// W^X 在这里强制：请求 W|X 时保留 W、清除 X。A 位总是置上，
    /// D 位跟随最终的 W。
    pub fn new_leaf(pfn: Pfn, perm: Perm, user: bool, cow: bool) -> Self {
        let mut bits = ((pfn as u64) << 10) | Self::V | Self::A;
        if perm.contains(Perm::READ) {
            bits |= Self::R;
        }
        let want_write = perm.contains(Perm::WRITE) && !cow;
        let want_exec = perm.contains(Perm::EXEC);
        if want_write {
            bits |= Self::W | Self::D;
            // W^X：写赢，执行让位
        } else if want_exec {
            bits |= Self::X;
        }
        if user {
            bits |= Self::U;
        }
        if cow {
            bits |= Self::COW;
        }
        Self(bits)
    }

    /// 有效权限（PTE 视角）
    pub fn perm(&self) -> Perm {
        let mut p = Perm::empty();
        if self.is_readable() {
            p |= Perm::READ;
        }
        if self.is_writable() {
            p |= Perm::WRITE;
        }
        if self.is_executable() {
            p |= Perm::EXEC;
        }
        p
    }
}

impl Default for Pte {
    fn default() -> Self {
        Self::new()
    }
}

// ========== 页表节点 ==========

/// 分配一个清零的页表页
pub(crate) fn alloc_table(ctx: &MemCtx) -> MmResult<Pfn> {
    buddy::alloc_pages(ctx, 0, GfpFlags::ZERO, None)
}

/// 读页表项
#[inline]
fn entry(ctx: &MemCtx, table: Pfn, idx: usize) -> Pte {
    debug_assert!(idx < 512);
    unsafe {
        let p = ctx.frames.page_ptr(table) as *const u64;
        Pte(p.add(idx).read_volatile())
    }
}

/// 写页表项
#[inline]
fn set_entry_raw(ctx: &MemCtx, table: Pfn, idx: usize, pte: Pte) {
    debug_assert!(idx < 512);
    unsafe {
        let p = ctx.frames.page_ptr(table) as *mut u64;
        p.add(idx).write_volatile(pte.bits());
    }
}

/// 把顶级项 idx 指向一个中间页表（内核共享项的安装）
pub(crate) fn set_table_entry(ctx: &MemCtx, root: Pfn, idx: usize, table: Pfn) {
    set_entry_raw(ctx, root, idx, Pte::new_table(table));
}

/// 把 src 根的内核半区顶级项复制到 dst 根
///
/// 顶级项共享同一批中间页表：内核映射对所有地址空间可见，
/// fork/销毁都不触碰它们。
pub(crate) fn share_kernel_entries(ctx: &MemCtx, dst_root: Pfn, src_root: Pfn) {
    for idx in KERNEL_VPN2_BASE..512 {
        let pte = entry(ctx, src_root, idx);
        if pte.is_valid() {
            set_entry_raw(ctx, dst_root, idx, pte);
        }
    }
}

/// 校验页表项没有保留位污染
fn check_entry(pte: Pte, root: Pfn, va: VirtAddr) -> Pte {
    if pte.has_reserved_bits() {
        panic!(
            "mm: corrupted page table: reserved bits set (root={:#x}, va={:#x}, pte={:#x})",
            root,
            va.as_usize(),
            pte.bits()
        );
    }
    pte
}

/// 向下走页表到叶子层，必要时创建中间层
///
/// 返回 (叶子页表 pfn, 叶子索引)。
fn walk_create(ctx: &MemCtx, root: Pfn, va: VirtAddr) -> MmResult<(Pfn, usize)> {
    let mut table = root;
    for level in [2u8, 1u8] {
        let idx = va.vpn_level(level);
        let pte = check_entry(entry(ctx, table, idx), root, va);
        table = if pte.is_valid() {
            if !pte.is_table() {
                panic!(
                    "mm: corrupted page table: unexpected leaf at level {} (va={:#x})",
                    level,
                    va.as_usize()
                );
            }
            pte.ppn()
        } else {
            let new = alloc_table(ctx)?;
            set_entry_raw(ctx, table, idx, Pte::new_table(new));
            new
        };
    }
    Ok((table, va.vpn_level(0)))
}

/// 只读遍历到叶子层
fn walk(ctx: &MemCtx, root: Pfn, va: VirtAddr) -> Option<(Pfn, usize)> {
    let mut table = root;
    for level in [2u8, 1u8] {
        let idx = va.vpn_level(level);
        let pte = check_entry(entry(ctx, table, idx), root, va);
        if !pte.is_valid() {
            return None;
        }
        if !pte.is_table() {
            panic!(
                "mm: corrupted page table: unexpected leaf at level {} (va={:#x})",
                level,
                va.as_usize()
            );
        }
        table = pte.ppn();
    }
    Some((table, va.vpn_level(0)))
}

// ========== 映射操作 ==========

/// 安装一个叶子映射
///
/// 目标位置已有有效映射时返回 Conflict（覆盖语义走
/// `update_page`）。W^X 由 `Pte::new_leaf` 强制。
pub(crate) fn map_page(
    ctx: &MemCtx,
    root: Pfn,
    va: VirtAddr,
    pfn: Pfn,
    perm: Perm,
    user: bool,
    cow: bool,
) -> MmResult<()> {
    let (leaf, idx) = walk_create(ctx, root, va)?;
    let old = check_entry(entry(ctx, leaf, idx), root, va);
    if old.is_valid() {
        return Err(MmError::Conflict);
    }
    set_entry_raw(ctx, leaf, idx, Pte::new_leaf(pfn, perm, user, cow));
    Ok(())
}

/// 原位改写一个已有叶子映射
///
/// COW 分裂、脏页升级、protect 都走这里。返回旧 PTE。
pub(crate) fn update_page(
    ctx: &MemCtx,
    root: Pfn,
    va: VirtAddr,
    f: impl FnOnce(Pte) -> Pte,
) -> Option<Pte> {
    let (leaf, idx) = walk(ctx, root, va)?;
    let old = check_entry(entry(ctx, leaf, idx), root, va);
    if !old.is_valid() {
        return None;
    }
    set_entry_raw(ctx, leaf, idx, f(old));
    Some(old)
}

/// 解除一个叶子映射，返回旧 PTE
///
/// 本来就没映射时返回 None（解除映射是幂等的）。
pub(crate) fn unmap_page(ctx: &MemCtx, root: Pfn, va: VirtAddr) -> Option<Pte> {
    let (leaf, idx) = walk(ctx, root, va)?;
    let old = check_entry(entry(ctx, leaf, idx), root, va);
    if !old.is_valid() {
        return None;
    }
    set_entry_raw(ctx, leaf, idx, Pte::new());
    Some(old)
}

/// 查询翻译
pub(crate) fn translate(ctx: &MemCtx, root: Pfn, va: VirtAddr) -> Option<(Pfn, Pte)> {
    let (leaf, idx) = walk(ctx, root, va)?;
    let pte = check_entry(entry(ctx, leaf, idx), root, va);
    if pte.is_valid() {
        Some((pte.ppn(), pte))
    } else {
        None
    }
}

/// 释放用户半区的页表树
///
/// 只回收页表节点本身；叶子映射必须已经全部解除，残留的有效
/// 叶子说明引用核算出了问题，直接 panic。内核半区的共享中间
/// 页表不动。
pub(crate) fn free_user_tables(ctx: &MemCtx, root: Pfn) {
    for vpn2 in 0..KERNEL_VPN2_BASE {
        let pte2 = entry(ctx, root, vpn2);
        if !pte2.is_valid() {
            continue;
        }
        let mid = pte2.ppn();
        for vpn1 in 0..512 {
            let pte1 = entry(ctx, mid, vpn1);
            if !pte1.is_valid() {
                continue;
            }
            let leaf = pte1.ppn();
            for vpn0 in 0..512 {
                let pte0 = entry(ctx, leaf, vpn0);
                if pte0.is_valid() {
                    panic!(
                        "mm: destroying address space with live mapping (vpn2={}, vpn1={}, vpn0={})",
                        vpn2, vpn1, vpn0
                    );
                }
            }
            buddy::free_pages(ctx, leaf, 0);
        }
        buddy::free_pages(ctx, mid, 0);
    }
    buddy::free_pages(ctx, root, 0);
}

//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 缺页处理
//!
//! 所有内存安全都从这一个入口过：按需调零、文件页装载、COW
//! 分裂、脏页升级、权限违例都在这里分发。
//!
//! 错误字编码硬件报告的故障属性 {present, write, user, ifetch,
//! reserved}；分发规则：
//!
//! 1. 保留位置位：页表损坏，panic
//! 2. 不存在：查 region。没有 region 或权限不够 -> BadAddress
//!    （用户态收信号、内核态 panic 是上层的事）；匿名区拿零页
//!    安装；文件区从页缓存取页，先装只读（脏页跟踪靠首写缺页）
//! 3. 存在 + 写 + PTE 只读：文件页升级可写并标脏；匿名 COW 页
//!    分裂（引用已回到 1 时免拷贝原地升级）
//! 4. 存在 + 取指 + PTE 不可执行：BadAddress
//! 5. 用户态访问内核地址：不查 region，直接 BadAddress
//!
//! 所有安装都经 `page_table::new_leaf`，W^X 在那里强制。
//! 整个分发在地址空间锁内进行；需要页缓存 (3) 和 zone (4) 锁时
//! 按锁序向下拿。

use bitflags::bitflags;

use super::addr::VirtAddr;
use super::aspace::{self, AddressSpace};
use super::context::MemCtx;
use super::page_table::{self, Pte};
use super::vma::{Perm, RegionKind};
use super::KERNEL_VA_BASE;
use crate::error::{MmError, MmResult};

bitflags! {
    /// 缺页错误字
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultError: u32 {
        /// 翻译存在（权限故障）而非缺失
        const PRESENT  = 1 << 0;
        /// 写访问
        const WRITE    = 1 << 1;
        /// 用户态触发
        const USER     = 1 << 2;
        /// 取指
        const IFETCH   = 1 << 3;
        /// PTE 保留位置位
        const RESERVED = 1 << 4;
    }
}

impl FaultError {
    /// 这次访问需要的权限
    fn required_perm(&self) -> Perm {
        if self.contains(FaultError::WRITE) {
            Perm::WRITE
        } else if self.contains(FaultError::IFETCH) {
            Perm::EXEC
        } else {
            Perm::READ
        }
    }
}

/// 体系结构 trap 入口的回调：按 CPU 解析活跃地址空间再分发
///
/// trap 处理器在中断状态已定的前提下调用；返回 Err 时由上层
/// 决定给用户线程发段错误信号还是内核 panic。
pub fn handle_fault_on(ctx: &MemCtx, cpu: usize, va: VirtAddr, err: FaultError) -> MmResult<()> {
    let aspace = ctx.active_aspace(cpu).ok_or(MmError::BadAddress)?;
    handle_fault(ctx, &aspace, va, err)
}

/// 缺页分发
pub fn handle_fault(
    ctx: &MemCtx,
    aspace: &AddressSpace,
    va: VirtAddr,
    err: FaultError,
) -> MmResult<()> {
    // 1. 保留位：页表已经烂了，不能继续跑
    if err.contains(FaultError::RESERVED) {
        panic!(
            "mm: reserved-bit fault, corrupted page tables (as={}, va={:#x}, err={:#x})",
            aspace.id(),
            va.as_usize(),
            err.bits()
        );
    }

    // 5. 用户态摸内核地址：不查 region
    if err.contains(FaultError::USER) && va.as_usize() >= KERNEL_VA_BASE {
        return Err(MmError::BadAddress);
    }

    let mut inner = aspace.inner.lock();

    // 以锁内的页表状态为准分发（错误字里的 present 可能已经过时：
    // 另一个 CPU 可能刚解决了同一个缺页）
    match aspace.translate(ctx, va) {
        None => handle_not_present(ctx, aspace, &mut inner, va, err),
        Some((_, pte)) => handle_present(ctx, aspace, &mut inner, va, err, pte),
    }
}

/// 不存在：按需调零或文件装载
fn handle_not_present(
    ctx: &MemCtx,
    aspace: &AddressSpace,
    inner: &mut aspace::AsInner,
    va: VirtAddr,
    err: FaultError,
) -> MmResult<()> {
    let region = match inner.regions.find(va) {
        Some(r) => *r,
        None => return Err(MmError::BadAddress),
    };
    if !region.perm().contains(err.required_perm()) {
        return Err(MmError::BadAddress);
    }

    match region.kind() {
        RegionKind::Anon => {
            // 按需调零
            let pfn = aspace::alloc_anon_page(ctx, aspace)?;
            aspace.install_page_locked(ctx, inner, va, pfn, region.perm(), false)?;
            Ok(())
        }
        RegionKind::File { vnode, .. } => {
            let index = region
                .file_index_of(va)
                .expect("file region yields file index");
            // 页缓存装载（地址空间锁 (1) -> 页缓存 (3)，锁序成立）
            let pfn = ctx.page_cache.get(ctx, vnode, index)?;
            // 不管 region 的写位，先装只读：脏页跟踪靠首写缺页，
            // 不用扫页表
            let mut ro = region.perm();
            ro.remove(Perm::WRITE);
            if let Err(e) = aspace.install_page_locked(ctx, inner, va, pfn, ro, false) {
                ctx.page_cache.release(ctx, pfn);
                return Err(e);
            }
            // 这次就是写：当场升级并标脏，不让它再缺一次页
            if err.contains(FaultError::WRITE) {
                upgrade_file_write(ctx, aspace, va);
                ctx.page_cache.mark_dirty(ctx, pfn);
            }
            Ok(())
        }
    }
}

/// 存在：权限故障（写保护、NX）或过时的缺页
fn handle_present(
    ctx: &MemCtx,
    aspace: &AddressSpace,
    inner: &mut aspace::AsInner,
    va: VirtAddr,
    err: FaultError,
    pte: Pte,
) -> MmResult<()> {
    // 4. NX 上取指
    if err.contains(FaultError::IFETCH) && !pte.is_executable() {
        return Err(MmError::BadAddress);
    }

    if err.contains(FaultError::WRITE) && !pte.is_writable() {
        let region = match inner.regions.find(va) {
            Some(r) => *r,
            None => return Err(MmError::BadAddress),
        };
        if !region.perm().contains(Perm::WRITE) {
            return Err(MmError::BadAddress);
        }

        if region.is_file_backed() {
            // (a) 文件页：升级可写 + 标脏
            upgrade_file_write(ctx, aspace, va);
            ctx.page_cache.mark_dirty(ctx, pte.ppn());
            return Ok(());
        }

        // (b) 匿名 COW 分裂
        let old_pfn = pte.ppn();
        let old_frame = ctx.frames.frame(old_pfn);
        if old_frame.refcount() > 1 {
            // 还有别的共享者：拷一份私有的
            let new_pfn = aspace::alloc_anon_page(ctx, aspace)?;
            ctx.frames.copy_page(new_pfn, old_pfn);
            page_table::update_page(ctx, aspace.root(), va.floor(), |old| {
                Pte::new_leaf(new_pfn, region.perm(), old.is_user(), false)
            });
            inner.shadow.insert(va.vpn(), new_pfn);
            aspace.flush_range(ctx, va.floor(), 1);
            // 旧页帧放掉我们这份引用
            aspace::put_user_frame(ctx, old_pfn);
        } else {
            // 引用计数在分裂前回到了 1：免拷贝，原地升级
            page_table::update_page(ctx, aspace.root(), va.floor(), |old| {
                Pte::from_bits((old.bits() | Pte::W | Pte::D) & !(Pte::COW | Pte::X))
            });
            aspace.flush_range(ctx, va.floor(), 1);
        }
        return Ok(());
    }

    // 过时的缺页：另一个 CPU 已经装好了映射，刷掉本地旧翻译即可
    ctx.arch.tlb_flush_local(aspace.root(), va.floor(), 1);
    Ok(())
}

/// 文件页的可写升级（保持 W^X：加 W 必去 X）
fn upgrade_file_write(ctx: &MemCtx, aspace: &AddressSpace, va: VirtAddr) {
    page_table::update_page(ctx, aspace.root(), va.floor(), |old| {
        Pte::from_bits((old.bits() | Pte::W | Pte::D) & !(Pte::COW | Pte::X))
    });
    aspace.flush_range(ctx, va.floor(), 1);
}

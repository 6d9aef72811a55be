//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 地址空间管理
//!
//! 每个进程一个 `AddressSpace`：页表根 + region 树 + 影子映射页
//! 记录（vpn -> pfn，COW 簿记和 fork/销毁遍历用）+ 一把锁。
//!
//! 地址空间按 id 注册在上下文里；页帧描述符引用地址空间只记 id
//! 不持指针（环引用用 arena + 索引拆开，销毁因此是确定性的）。
//!
//! # 所有权
//! - 匿名页：映射是唯一所有者，unmap 的 put 降到 0 就归还伙伴系统
//! - 文件页：页缓存持基准引用，每个映射再 pin 一次；unmap 只放
//!   自己的 pin
//! - fork 之后：父子共享页帧（引用计数 +1），可写 PTE 双方都
//!   写保护并打上 COW 软件位，首写触发缺页走 COW 分裂
//!
//! # 锁序
//! 地址空间锁 (1) 最先拿；持锁期间可以进页缓存 (3)、zone (4)。
//! TLB shootdown 在放锁之前发出并等确认。

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use bitflags::bitflags;
use spin::Mutex;

use super::addr::{Pfn, VirtAddr};
use super::buddy::{self, GfpFlags};
use super::context::MemCtx;
use super::frame::FrameFlag;
use super::page_table::{self, Pte};
use super::reclaim;
use super::vma::{Perm, Region, RegionFlags, RegionKind, RegionTree};
use super::zone::LruKind;
use super::{KERNEL_VA_BASE, MMAP_BASE, USER_VA_END};
use crate::config::PAGE_SIZE;
use crate::error::{MmError, MmResult};

/// 地址空间 id（0 保留给"无"/内核自身）
pub type AsId = u64;

bitflags! {
    /// map_anon / map_file 的标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// 必须落在 va_hint：与现有 region 冲突时报错而不是换地方
        const FIXED     = 1 << 0;
        /// 栈式向下增长
        const GROWSDOWN = 1 << 1;
        /// 锁定，不参与回收
        const LOCKED    = 1 << 2;
    }
}

impl MapFlags {
    fn region_flags(&self) -> RegionFlags {
        let mut f = RegionFlags::USER;
        if self.contains(MapFlags::GROWSDOWN) {
            f |= RegionFlags::GROWSDOWN;
        }
        if self.contains(MapFlags::LOCKED) {
            f |= RegionFlags::LOCKED;
        }
        f
    }
}

/// 锁内状态
pub(crate) struct AsInner {
    pub(crate) regions: RegionTree,
    /// 影子映射页记录：vpn -> pfn
    pub(crate) shadow: BTreeMap<usize, Pfn>,
    /// 堆基址（init_brk 设置）与当前 brk
    brk_start: usize,
    brk: usize,
}

/// 地址空间
pub struct AddressSpace {
    id: AsId,
    /// 页表根
    root: Pfn,
    /// 正在哪些 CPU 上活跃（shootdown 掩码）
    active_cpus: AtomicUsize,
    /// 常驻页计数（OOM 打分）
    resident: AtomicUsize,
    /// OOM 保护值：分数与其成反比，usize::MAX 表示不可杀
    oom_protection: AtomicUsize,
    destroyed: AtomicBool,
    pub(crate) inner: Mutex<AsInner>,
}

impl AddressSpace {
    /// 创建空的用户地址空间
    ///
    /// 页表根的内核半区顶级项从内核根复制（共享中间页表）。
    pub fn new(ctx: &MemCtx) -> MmResult<Arc<Self>> {
        let root = page_table::alloc_table(ctx)?;
        page_table::share_kernel_entries(ctx, root, ctx.kernel_root);

        let aspace = Arc::new(Self {
            id: ctx.alloc_as_id(),
            root,
            active_cpus: AtomicUsize::new(0),
            resident: AtomicUsize::new(0),
            oom_protection: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
            inner: Mutex::new(AsInner {
                regions: RegionTree::new(),
                shadow: BTreeMap::new(),
                brk_start: 0,
                brk: 0,
            }),
        });
        ctx.register_aspace(aspace.clone());
        log::debug!("mm: address space {} created (root pfn {:#x})", aspace.id, root);
        Ok(aspace)
    }

    #[inline]
    pub fn id(&self) -> AsId {
        self.id
    }

    #[inline]
    pub fn root(&self) -> Pfn {
        self.root
    }

    /// 常驻页数
    #[inline]
    pub fn resident_pages(&self) -> usize {
        self.resident.load(Ordering::Relaxed)
    }

    /// OOM 保护值（管理属性；分数与其成反比）
    #[inline]
    pub fn oom_protection(&self) -> usize {
        self.oom_protection.load(Ordering::Relaxed)
    }

    pub fn set_oom_protection(&self, value: usize) {
        self.oom_protection.store(value, Ordering::Relaxed);
    }

    // ========== CPU 绑定 ==========

    /// 在一个 CPU 上切换到本地址空间（安装页表根）
    pub fn activate(&self, ctx: &MemCtx, cpu: usize) {
        // 旧地址空间摘掉活跃位
        let prev = ctx.active[cpu].swap(self.id, Ordering::AcqRel);
        if prev != 0 && prev != self.id {
            if let Some(old) = ctx.aspace(prev) {
                old.active_cpus.fetch_and(!(1 << cpu), Ordering::AcqRel);
            }
        }
        self.active_cpus.fetch_or(1 << cpu, Ordering::AcqRel);
        ctx.arch.install_root(self.root, self.id);
    }

    #[inline]
    pub fn active_mask(&self) -> usize {
        self.active_cpus.load(Ordering::Acquire)
    }

    /// PTE 变更后的 TLB 维护：对所有运行着本地址空间的 CPU
    /// shootdown，等确认；放地址空间锁之前调用。
    pub(crate) fn flush_range(&self, ctx: &MemCtx, va: VirtAddr, pages: usize) {
        let mask = self.active_mask();
        let cpu = ctx.arch.cpu_id();
        ctx.arch.tlb_flush_local(self.root, va, pages);
        let others = mask & !(1 << cpu);
        if others != 0 {
            ctx.arch.tlb_shootdown(self.root, va, pages, others);
        }
    }

    // ========== 查询 ==========

    /// 查询翻译（不触发缺页）
    pub fn translate(&self, ctx: &MemCtx, va: VirtAddr) -> Option<(Pfn, Pte)> {
        page_table::translate(ctx, self.root, va)
    }

    /// 查询覆盖 va 的 region 属性
    pub fn query(&self, ctx: &MemCtx, va: VirtAddr) -> Option<(Perm, RegionFlags, RegionKind)> {
        let _ = ctx;
        let inner = self.inner.lock();
        inner
            .regions
            .find(va)
            .map(|r| (r.perm(), r.flags(), r.kind()))
    }

    // ========== region 建立 ==========

    /// 建立匿名映射
    ///
    /// 纯虚拟操作：不分配页帧，首次触碰时缺页按需调零。
    /// 零长度是合法的空操作。
    pub fn map_anon(
        &self,
        ctx: &MemCtx,
        va_hint: VirtAddr,
        len: usize,
        perm: Perm,
        flags: MapFlags,
    ) -> MmResult<VirtAddr> {
        self.map_region(ctx, va_hint, len, perm, flags, RegionKind::Anon)
    }

    /// 建立文件映射
    pub fn map_file(
        &self,
        ctx: &MemCtx,
        va_hint: VirtAddr,
        len: usize,
        perm: Perm,
        flags: MapFlags,
        vnode: super::page_cache::VnodeId,
        file_off: usize,
    ) -> MmResult<VirtAddr> {
        if file_off % PAGE_SIZE != 0 {
            return Err(MmError::AlignmentError);
        }
        self.map_region(
            ctx,
            va_hint,
            len,
            perm,
            flags,
            RegionKind::File {
                vnode,
                offset: file_off,
            },
        )
    }

    fn map_region(
        &self,
        ctx: &MemCtx,
        va_hint: VirtAddr,
        len: usize,
        perm: Perm,
        flags: MapFlags,
        kind: RegionKind,
    ) -> MmResult<VirtAddr> {
        let _ = ctx;
        if len == 0 {
            return Ok(va_hint);
        }
        if !va_hint.is_aligned() || len % PAGE_SIZE != 0 {
            return Err(MmError::AlignmentError);
        }
        let mut inner = self.inner.lock();

        let va = self.pick_range(&inner, va_hint, len, flags)?;
        inner
            .regions
            .add(Region::new(
                va,
                VirtAddr::new(va.as_usize() + len),
                perm,
                flags.region_flags(),
                kind,
            ))
            .expect("picked range does not overlap");
        Ok(va)
    }

    /// 选一段虚拟区间
    fn pick_range(
        &self,
        inner: &AsInner,
        va_hint: VirtAddr,
        len: usize,
        flags: MapFlags,
    ) -> MmResult<VirtAddr> {
        let hint = va_hint.as_usize();
        // FIXED：hint 就是地址，地址 0 也是合法的 region 起点
        if hint != 0 || flags.contains(MapFlags::FIXED) {
            if hint + len > USER_VA_END {
                return Err(MmError::InvalidArgument);
            }
            let end = VirtAddr::new(hint + len);
            if !inner.regions.overlaps(va_hint, end) {
                return Ok(va_hint);
            }
            if flags.contains(MapFlags::FIXED) {
                return Err(MmError::Conflict);
            }
        }
        inner
            .regions
            .find_free_range(VirtAddr::new(MMAP_BASE), len, USER_VA_END)
            .ok_or(MmError::OutOfMemory)
    }

    /// 直接映射一段已知页帧（共享内存、内核导出的缓冲区）
    ///
    /// 对每个页帧加引用（共享所有权），unmap 时对称地放掉。
    /// FIXED 语义：与现有 region 冲突即报错。
    pub fn map(
        &self,
        ctx: &MemCtx,
        va: VirtAddr,
        pfn: Pfn,
        len: usize,
        perm: Perm,
    ) -> MmResult<()> {
        if len == 0 {
            return Ok(());
        }
        if !va.is_aligned() || len % PAGE_SIZE != 0 {
            return Err(MmError::AlignmentError);
        }
        let pages = len / PAGE_SIZE;
        let mut inner = self.inner.lock();

        let end = VirtAddr::new(va.as_usize() + len);
        if va.as_usize() + len > USER_VA_END {
            return Err(MmError::InvalidArgument);
        }
        if inner.regions.overlaps(va, end) {
            return Err(MmError::Conflict);
        }
        inner.regions.add(Region::new(
            va,
            end,
            perm,
            RegionFlags::USER,
            RegionKind::Anon,
        ))?;

        for i in 0..pages {
            let page_va = VirtAddr::new(va.as_usize() + i * PAGE_SIZE);
            let frame = ctx.frames.frame(pfn + i);
            frame.get();
            if let Err(e) = page_table::map_page(ctx, self.root, page_va, pfn + i, perm, true, false)
            {
                frame.put();
                return Err(e);
            }
            inner.shadow.insert(page_va.vpn(), pfn + i);
            self.resident.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    // ========== unmap ==========

    /// 解除 [va, va+len) 的映射
    ///
    /// 可能把 region 一分为二；被移除范围内每个映射页放掉引用，
    /// 归零的页帧回伙伴系统，文件页放掉页缓存 pin。对已经没有
    /// 映射的范围是无操作的成功（幂等）。
    pub fn unmap(&self, ctx: &MemCtx, va: VirtAddr, len: usize) -> MmResult<()> {
        if len == 0 {
            return Ok(());
        }
        if !va.is_aligned() || len % PAGE_SIZE != 0 {
            return Err(MmError::AlignmentError);
        }
        let end = VirtAddr::new(va.as_usize() + len);
        let mut inner = self.inner.lock();

        let removed = inner.regions.remove_range(va, end);
        for region in removed {
            self.zap_range_locked(ctx, &mut inner, region.start(), region.end());
        }

        self.flush_range(ctx, va, len / PAGE_SIZE);
        Ok(())
    }

    /// 拆掉 [start, end) 内已映射的页（锁已持有）
    fn zap_range_locked(
        &self,
        ctx: &MemCtx,
        inner: &mut AsInner,
        start: VirtAddr,
        end: VirtAddr,
    ) {
        let vpns: alloc::vec::Vec<usize> = inner
            .shadow
            .range(start.vpn()..end.vpn())
            .map(|(&vpn, _)| vpn)
            .collect();
        for vpn in vpns {
            let page_va = VirtAddr::new(vpn * PAGE_SIZE);
            let pfn = inner.shadow.remove(&vpn).expect("shadow entry vanished");
            let old = page_table::unmap_page(ctx, self.root, page_va);
            debug_assert!(old.map(|p| p.ppn() == pfn).unwrap_or(false));
            self.resident.fetch_sub(1, Ordering::Relaxed);
            put_user_frame(ctx, pfn);
        }
    }

    // ========== protect ==========

    /// 改变 [va, va+len) 的权限位
    ///
    /// 只动权限；区间必须完全被 region 覆盖。已安装的 PTE 原位
    /// 改写（COW 页保持写保护，region 的 W 经缺页再生效），然后
    /// 对所有活跃 CPU 发 shootdown。
    pub fn protect(&self, ctx: &MemCtx, va: VirtAddr, len: usize, perm: Perm) -> MmResult<()> {
        if len == 0 {
            return Ok(());
        }
        if !va.is_aligned() || len % PAGE_SIZE != 0 {
            return Err(MmError::AlignmentError);
        }
        let end = VirtAddr::new(va.as_usize() + len);
        let mut inner = self.inner.lock();

        if !inner.regions.covers_range(va, len) {
            return Err(MmError::BadAddress);
        }

        // region 按边界切开再改权限
        let removed = inner.regions.remove_range(va, end);
        for mut region in removed {
            region.set_perm(perm);
            inner
                .regions
                .add(region)
                .expect("protect re-insert cannot overlap");
        }

        // 已映射页原位改写
        let vpns: alloc::vec::Vec<usize> = inner
            .shadow
            .range(va.vpn()..end.vpn())
            .map(|(&vpn, _)| vpn)
            .collect();
        for vpn in vpns {
            let page_va = VirtAddr::new(vpn * PAGE_SIZE);
            page_table::update_page(ctx, self.root, page_va, |old| {
                let cow = old.is_cow();
                let frame = ctx.frames.frame(old.ppn());
                let mut eff = perm;
                if frame.test_flag(FrameFlag::PageCache) && !frame.is_dirty() {
                    // 文件页保持写保护：首写经缺页升级并标脏
                    eff.remove(Perm::WRITE);
                }
                Pte::new_leaf(old.ppn(), eff, old.is_user(), cow)
            });
        }

        self.flush_range(ctx, va, len / PAGE_SIZE);
        Ok(())
    }

    /// msync：回写 [va, va+len) 涉及的文件映射
    ///
    /// 当前设计按整个 vnode 回写（范围只用来挑出 vnode）。
    pub fn msync(&self, ctx: &MemCtx, va: VirtAddr, len: usize) -> MmResult<()> {
        if len == 0 {
            return Ok(());
        }
        if !va.is_aligned() || len % PAGE_SIZE != 0 {
            return Err(MmError::AlignmentError);
        }
        let end = VirtAddr::new(va.as_usize() + len);

        // 锁内只收集 vnode；flush 会拿页缓存条目锁，放掉地址空间锁
        // 再做
        let mut vnodes: alloc::vec::Vec<super::page_cache::VnodeId> = alloc::vec::Vec::new();
        {
            let inner = self.inner.lock();
            for region in inner.regions.iter() {
                if !region.overlaps(va, end) {
                    continue;
                }
                if let RegionKind::File { vnode, .. } = region.kind() {
                    if !vnodes.contains(&vnode) {
                        vnodes.push(vnode);
                    }
                }
            }
        }
        for vnode in vnodes {
            ctx.page_cache.flush(ctx, vnode)?;
        }
        Ok(())
    }

    // ========== brk ==========

    /// 设定堆基址（进程加载器调用一次）
    pub fn init_brk(&self, va: VirtAddr) -> MmResult<()> {
        if !va.is_aligned() {
            return Err(MmError::AlignmentError);
        }
        let mut inner = self.inner.lock();
        if inner.brk_start != 0 {
            return Err(MmError::Conflict);
        }
        inner.brk_start = va.as_usize();
        inner.brk = va.as_usize();
        Ok(())
    }

    /// 移动 brk；返回新的 brk
    pub fn brk(&self, ctx: &MemCtx, new_brk: usize) -> MmResult<usize> {
        let mut inner = self.inner.lock();
        if inner.brk_start == 0 || new_brk < inner.brk_start {
            return Err(MmError::InvalidArgument);
        }

        let old_end = VirtAddr::new(inner.brk).ceil();
        let new_end = VirtAddr::new(new_brk).ceil();

        if new_end.as_usize() > old_end.as_usize() {
            if new_end.as_usize() > USER_VA_END {
                return Err(MmError::OutOfMemory);
            }
            inner.regions.add(Region::new(
                old_end,
                new_end,
                Perm::RW,
                RegionFlags::USER,
                RegionKind::Anon,
            ))?;
        } else if new_end.as_usize() < old_end.as_usize() {
            let removed = inner.regions.remove_range(new_end, old_end);
            for region in removed {
                self.zap_range_locked(ctx, &mut inner, region.start(), region.end());
            }
            self.flush_range(
                ctx,
                new_end,
                (old_end.as_usize() - new_end.as_usize()) / PAGE_SIZE,
            );
        }

        inner.brk = new_brk;
        Ok(new_brk)
    }

    // ========== fork ==========

    /// 为 fork 克隆地址空间
    ///
    /// region 全量复制；每个映射页引用 +1；可写 PTE 在父子两边
    /// 同时写保护并打 COW 位，首写走缺页的 COW 分裂。内核半区
    /// 通过共享顶级项带过去，不复制也不 COW。父方 PTE 变了，
    /// 对父方活跃 CPU 发 shootdown。
    pub fn fork(&self, ctx: &MemCtx) -> MmResult<Arc<AddressSpace>> {
        let child = AddressSpace::new(ctx)?;

        let mut parent = self.inner.lock();
        // 子空间刚创建还没发布给调度器，这里拿它的锁不会和别人交错
        let mut child_inner = child.inner.lock();

        // region 复制；匿名可写区在父子两边都标 COW
        for region in parent.regions.iter() {
            let mut r = *region;
            if !r.is_file_backed() && r.perm().contains(Perm::WRITE) {
                r.set_flags(r.flags() | RegionFlags::COW);
            }
            child_inner
                .regions
                .add(r)
                .expect("child region tree starts empty");
        }
        // 父方 region 的 COW 标记
        let cow_marks: alloc::vec::Vec<VirtAddr> = parent
            .regions
            .iter()
            .filter(|r| !r.is_file_backed() && r.perm().contains(Perm::WRITE))
            .map(|r| r.start())
            .collect();
        for start in cow_marks {
            if let Some(r) = parent.regions.find_mut(start) {
                r.set_flags(r.flags() | RegionFlags::COW);
            }
        }
        child_inner.brk_start = parent.brk_start;
        child_inner.brk = parent.brk;

        // 映射页逐个共享
        let mappings: alloc::vec::Vec<(usize, Pfn)> =
            parent.shadow.iter().map(|(&vpn, &pfn)| (vpn, pfn)).collect();
        for (vpn, pfn) in mappings {
            let page_va = VirtAddr::new(vpn * PAGE_SIZE);
            let frame = ctx.frames.frame(pfn);
            frame.get();

            // 父方：可写 PTE 写保护 + COW
            let parent_pte = page_table::update_page(ctx, self.root, page_va, |old| {
                if old.is_writable() {
                    Pte::from_bits((old.bits() & !(Pte::W | Pte::D)) | Pte::COW)
                } else {
                    old
                }
            })
            .expect("shadow entry without PTE");
            let new_pte = if parent_pte.is_writable() {
                Pte::from_bits((parent_pte.bits() & !(Pte::W | Pte::D)) | Pte::COW)
            } else {
                parent_pte
            };

            // 子方装同样的（现在只读的）PTE。失败只可能是子方页表
            // 节点分配不出来（OOM）：放掉本页引用、拆掉半成品的子
            // 空间再上报。父方留下的写保护 PTE 无碍——引用已回到 1，
            // 首写走免拷贝升级。
            let (leaf_perm, cow) = (new_pte.perm(), new_pte.is_cow());
            if let Err(e) =
                page_table::map_page(ctx, child.root, page_va, pfn, leaf_perm, new_pte.is_user(), cow)
            {
                frame.put();
                self.flush_range(ctx, VirtAddr::new(0), 0);
                drop(child_inner);
                drop(parent);
                child.destroy(ctx);
                return Err(e);
            }

            child_inner.shadow.insert(vpn, pfn);
            child.resident.fetch_add(1, Ordering::Relaxed);
        }

        drop(child_inner);

        // 父方 PTE 变了：整空间 shootdown
        self.flush_range(ctx, VirtAddr::new(0), 0);
        drop(parent);

        log::debug!(
            "mm: address space {} forked into {} ({} pages shared)",
            self.id,
            child.id(),
            child.resident_pages()
        );
        Ok(child)
    }

    // ========== 销毁 ==========

    /// 销毁地址空间，归还它拥有的全部页帧
    pub fn destroy(&self, ctx: &MemCtx) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.active_mask() != 0 {
            log::warn!(
                "mm: destroying address space {} while active (mask {:#x})",
                self.id,
                self.active_mask()
            );
        }
        ctx.unregister_aspace(self.id);

        let mut inner = self.inner.lock();
        self.zap_range_locked(ctx, &mut inner, VirtAddr::new(0), VirtAddr::new(USER_VA_END));
        inner.regions.clear();
        inner.shadow.clear();
        drop(inner);

        page_table::free_user_tables(ctx, self.root);
        log::debug!("mm: address space {} destroyed", self.id);
    }

    // ========== 缺页安装路径（fault.rs 调用，锁已持有） ==========

    /// 安装一个新映射页并登记影子记录
    pub(crate) fn install_page_locked(
        &self,
        ctx: &MemCtx,
        inner: &mut AsInner,
        va: VirtAddr,
        pfn: Pfn,
        perm: Perm,
        cow: bool,
    ) -> MmResult<()> {
        page_table::map_page(ctx, self.root, va.floor(), pfn, perm, true, cow)?;
        inner.shadow.insert(va.vpn(), pfn);
        self.resident.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // ========== 用户内存读写 ==========

    /// 读用户内存（翻译失败按硬件缺页的路数走缺页处理后重试）
    pub fn read_bytes(&self, ctx: &MemCtx, va: VirtAddr, buf: &mut [u8]) -> MmResult<()> {
        self.access_bytes(ctx, va, buf.len(), false, |pfn, off, len, pos| unsafe {
            core::ptr::copy_nonoverlapping(
                ctx.frames.page_ptr(pfn).add(off),
                buf.as_mut_ptr().add(pos),
                len,
            );
        })
    }

    /// 写用户内存
    pub fn write_bytes(&self, ctx: &MemCtx, va: VirtAddr, buf: &[u8]) -> MmResult<()> {
        self.access_bytes(ctx, va, buf.len(), true, |pfn, off, len, pos| unsafe {
            core::ptr::copy_nonoverlapping(
                buf.as_ptr().add(pos),
                ctx.frames.page_ptr(pfn).add(off),
                len,
            );
        })
    }

    /// 翻译-或-缺页循环
    ///
    /// 模拟硬件的访问路径：翻译命中且权限够就访问；否则带着
    /// 对应的错误字进缺页处理，成功后重试。
    fn access_bytes(
        &self,
        ctx: &MemCtx,
        va: VirtAddr,
        len: usize,
        write: bool,
        mut access: impl FnMut(Pfn, usize, usize, usize),
    ) -> MmResult<()> {
        use super::fault::{self, FaultError};

        let mut pos = 0;
        while pos < len {
            let cur = VirtAddr::new(va.as_usize() + pos);
            let off = cur.page_offset();
            let chunk = (PAGE_SIZE - off).min(len - pos);

            let ok = match self.translate(ctx, cur) {
                Some((pfn, pte)) if !write && pte.is_readable() => {
                    access(pfn, off, chunk, pos);
                    true
                }
                Some((pfn, pte)) if write && pte.is_writable() => {
                    access(pfn, off, chunk, pos);
                    true
                }
                other => {
                    let mut err = FaultError::USER;
                    if other.is_some() {
                        err |= FaultError::PRESENT;
                    }
                    if write {
                        err |= FaultError::WRITE;
                    }
                    fault::handle_fault(ctx, self, cur, err)?;
                    false
                }
            };
            if ok {
                pos += chunk;
            }
        }
        Ok(())
    }
}

/// 放掉映射对页帧的引用
///
/// 归零时把页帧摘下 LRU 并归还伙伴系统；文件页的归零只会发生在
/// 页缓存条目已被 invalidate 撤走之后（缓存在表里时还握着基准
/// 引用）。
pub(crate) fn put_user_frame(ctx: &MemCtx, pfn: Pfn) {
    let frame = ctx.frames.frame(pfn);
    if frame.put() == 0 {
        if frame.test_flag(FrameFlag::Lru) {
            reclaim::lru_del(ctx, pfn);
        }
        buddy::free_one_raw(ctx, pfn);
    }
}

/// 匿名缺页页帧的标准来源：可移动 zone 的零页
pub(crate) fn alloc_anon_page(ctx: &MemCtx, aspace: &AddressSpace) -> MmResult<Pfn> {
    let pfn = buddy::alloc_pages(
        ctx,
        0,
        GfpFlags::MOVABLE | GfpFlags::HIGH | GfpFlags::ZERO,
        None,
    )?;
    let frame = ctx.frames.frame(pfn);
    frame.set_flag(FrameFlag::Anonymous);
    frame.set_mapping(aspace.id());
    reclaim::lru_add(ctx, pfn, LruKind::InactiveAnon);
    Ok(pfn)
}

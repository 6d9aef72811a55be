//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 统一页缓存
//!
//! (vnode, 页索引) -> 页帧 的映射，VFS 读写和文件映射共用一份。
//!
//! # 结构
//! - 分片哈希表：键哈希选片，片内 BTreeMap，每片一把自旋锁
//! - 页帧描述符承载条目状态：PRESENT（在表里即 present）、DIRTY、
//!   LOCKED（加载/回写期间的互斥位）；pin 就是页帧引用计数
//! - 缓存自身对每个条目持一个基准引用；pin 在其上 +1；
//!   驱逐要求 refcount == 1（只剩缓存自己）且干净、未锁
//!
//! # 状态机
//! absent -> LOCKED(加载中) -> PRESENT -> PRESENT|DIRTY
//!        -> LOCKED(回写中) -> PRESENT -> 被驱逐
//!
//! DIRTY 只由缺页处理（可写升级）和 VFS 写路径设置；DIRTY 条目
//! 在回写钩子成功前绝不离开缓存。
//!
//! # 等待协议
//! LOCKED 排斥并发读者：撞上加载中的页就自旋等 LOCKED 清除
//! （核心没有调度器可以睡）。等待线程被杀时加载仍会完成——
//! 页帧归缓存所有，不会泄漏，线程只是不再安装 PTE。

use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, RwLock};

use super::addr::Pfn;
use super::buddy::{self, GfpFlags};
use super::context::MemCtx;
use super::frame::FrameFlag;
use super::reclaim;
use super::zone::LruKind;
use crate::config::PAGE_SIZE;
use crate::error::{MmError, MmResult};

/// vnode 标识（VFS 侧的 inode 指针/编号，核心只当不透明键用）
pub type VnodeId = u64;

/// 文件内页索引
pub type PageIndex = usize;

/// 每个 vnode 注册的后备存储钩子
///
/// `write_page` 是回写回调：flush 对每个脏页恰好调用一次。
pub trait VnodeOps: Send + Sync {
    fn read_page(&self, index: PageIndex, buf: &mut [u8]) -> MmResult<()>;
    fn write_page(&self, index: PageIndex, buf: &[u8]) -> MmResult<()>;
}

/// 哈希分片数
const SHARDS: usize = 16;

type Shard = BTreeMap<(VnodeId, PageIndex), Pfn>;

/// 页缓存
pub struct PageCache {
    shards: Vec<Mutex<Shard>>,
    vnodes: RwLock<BTreeMap<VnodeId, Arc<dyn VnodeOps>>>,
    nr_pages: AtomicUsize,
    nr_dirty: AtomicUsize,
}

#[inline]
fn shard_of(vnode: VnodeId, index: PageIndex) -> usize {
    // Fibonacci 散列，够用了：同一文件的相邻页散到不同片
    let h = (vnode ^ index as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
    (h >> 59) as usize % SHARDS
}

impl PageCache {
    pub fn new() -> Self {
        let mut shards = Vec::with_capacity(SHARDS);
        for _ in 0..SHARDS {
            shards.push(Mutex::new(BTreeMap::new()));
        }
        Self {
            shards,
            vnodes: RwLock::new(BTreeMap::new()),
            nr_pages: AtomicUsize::new(0),
            nr_dirty: AtomicUsize::new(0),
        }
    }

    /// 缓存的页数
    pub fn nr_pages(&self) -> usize {
        self.nr_pages.load(Ordering::Relaxed)
    }

    /// 脏页数
    pub fn nr_dirty(&self) -> usize {
        self.nr_dirty.load(Ordering::Relaxed)
    }

    // ========== vnode 注册 ==========

    /// 注册 vnode 的后备存储钩子（VFS 在打开时调用）
    pub fn register_vnode(&self, vnode: VnodeId, ops: Arc<dyn VnodeOps>) {
        self.vnodes.write().insert(vnode, ops);
    }

    /// 注销 vnode（调用者须先 flush + invalidate）
    pub fn unregister_vnode(&self, vnode: VnodeId) {
        self.vnodes.write().remove(&vnode);
    }

    pub(crate) fn ops_of(&self, vnode: VnodeId) -> Option<Arc<dyn VnodeOps>> {
        self.vnodes.read().get(&vnode).cloned()
    }

    // ========== 查找 / 装载 ==========

    /// 取 (vnode, index) 对应的页帧，返回时已 pin
    ///
    /// 未缓存时分配页帧、置 LOCKED、通过 VFS 钩子读入、发布。
    /// 调用者用完必须 `release`。
    pub fn get(&self, ctx: &MemCtx, vnode: VnodeId, index: PageIndex) -> MmResult<Pfn> {
        let key = (vnode, index);
        let ops = self.ops_of(vnode).ok_or(MmError::Io)?;

        loop {
            // 命中路径
            {
                let shard = self.shards[shard_of(vnode, index)].lock();
                if let Some(&pfn) = shard.get(&key) {
                    let frame = ctx.frames.frame(pfn);
                    if frame.is_locked() {
                        // 正在加载/回写：放锁自旋，回头重查
                        drop(shard);
                        frame.wait_unlocked();
                        continue;
                    }
                    frame.get();
                    frame.set_flag(FrameFlag::Referenced);
                    return Ok(pfn);
                }
            }

            // 未命中：先备好页帧再抢插入权。持分片锁分配会把回收
            // 路径（驱逐时要拿分片锁）锁死，所以分配在锁外。
            let pfn = buddy::alloc_pages(ctx, 0, GfpFlags::empty(), None)?;
            let frame = ctx.frames.frame(pfn);

            {
                let mut shard = self.shards[shard_of(vnode, index)].lock();
                if shard.contains_key(&key) {
                    // 撞车：别人先插了，退掉自己的页帧重来
                    drop(shard);
                    buddy::free_pages(ctx, pfn, 0);
                    continue;
                }
                frame.set_flag(FrameFlag::Locked);
                frame.set_flag(FrameFlag::PageCache);
                frame.set_mapping(vnode);
                frame.set_index(index);
                // 缓存基准引用 1 + 调用者 pin 1
                frame.set_refcount(2);
                shard.insert(key, pfn);
            }
            self.nr_pages.fetch_add(1, Ordering::Relaxed);

            // 读后备存储（挂起点；只占着条目的 LOCKED 位）
            let buf = unsafe {
                core::slice::from_raw_parts_mut(ctx.frames.page_ptr(pfn), PAGE_SIZE)
            };
            match ops.read_page(index, buf) {
                Ok(()) => {
                    frame.set_flag(FrameFlag::UpToDate);
                    reclaim::lru_add(ctx, pfn, LruKind::InactiveFile);
                    frame.unlock();
                    return Ok(pfn);
                }
                Err(e) => {
                    // 读失败：撤掉条目，页帧归还
                    {
                        let mut shard = self.shards[shard_of(vnode, index)].lock();
                        shard.remove(&key);
                    }
                    self.nr_pages.fetch_sub(1, Ordering::Relaxed);
                    frame.clear_flag(FrameFlag::PageCache);
                    frame.set_mapping(0);
                    frame.set_index(0);
                    frame.unlock();
                    frame.set_refcount(0);
                    buddy::free_one_raw(ctx, pfn);
                    return Err(e);
                }
            }
        }
    }

    /// 只查不装载（不 pin 不读盘）
    pub fn lookup(&self, vnode: VnodeId, index: PageIndex) -> Option<Pfn> {
        let shard = self.shards[shard_of(vnode, index)].lock();
        shard.get(&(vnode, index)).copied()
    }

    /// 放掉 `get` 的 pin
    pub fn release(&self, ctx: &MemCtx, pfn: Pfn) {
        let frame = ctx.frames.frame(pfn);
        if frame.put() == 0 {
            // 条目已被 invalidate 撤走，这是最后一个引用
            buddy::free_one_raw(ctx, pfn);
        }
    }

    // ========== 脏页核算 ==========

    /// 标脏（VFS 写路径和缺页的可写升级调用）
    pub fn mark_dirty(&self, ctx: &MemCtx, pfn: Pfn) {
        let frame = ctx.frames.frame(pfn);
        if !frame.test_and_set_flag(FrameFlag::Dirty) {
            self.nr_dirty.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn clear_dirty(&self, ctx: &MemCtx, pfn: Pfn) {
        let frame = ctx.frames.frame(pfn);
        if frame.test_and_clear_flag(FrameFlag::Dirty) {
            self.nr_dirty.fetch_sub(1, Ordering::Relaxed);
        }
    }

    // ========== 回写 ==========

    /// 回写一个 vnode 的全部脏页
    ///
    /// 进入时为 DIRTY 的每一页，回写钩子恰好调用一次；成功后
    /// 清除 DIRTY。
    pub fn flush(&self, ctx: &MemCtx, vnode: VnodeId) -> MmResult<()> {
        let dirty = self.collect_dirty(ctx, Some(vnode));
        for (vnode, index, pfn) in dirty {
            self.writeback_one(ctx, vnode, index, pfn)?;
        }
        Ok(())
    }

    /// 回写全部脏页
    pub fn flush_all(&self, ctx: &MemCtx) -> MmResult<()> {
        let dirty = self.collect_dirty(ctx, None);
        for (vnode, index, pfn) in dirty {
            self.writeback_one(ctx, vnode, index, pfn)?;
        }
        Ok(())
    }

    /// 摘一份进入时刻的脏页快照
    fn collect_dirty(&self, ctx: &MemCtx, vnode: Option<VnodeId>) -> Vec<(VnodeId, PageIndex, Pfn)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock();
            for (&(v, index), &pfn) in shard.iter() {
                if let Some(want) = vnode {
                    if v != want {
                        continue;
                    }
                }
                if ctx.frames.frame(pfn).is_dirty() {
                    out.push((v, index, pfn));
                }
            }
        }
        out
    }

    /// 回写单页
    pub(crate) fn writeback_one(
        &self,
        ctx: &MemCtx,
        vnode: VnodeId,
        index: PageIndex,
        pfn: Pfn,
    ) -> MmResult<()> {
        let ops = self.ops_of(vnode).ok_or(MmError::Io)?;
        let frame = ctx.frames.frame(pfn);

        // 抢条目锁；撞上加载/别的回写就等
        while !frame.try_lock() {
            frame.wait_unlocked();
        }

        // 确认条目还在（并发 truncate 可能已经撤了）
        let present = {
            let shard = self.shards[shard_of(vnode, index)].lock();
            shard.get(&(vnode, index)) == Some(&pfn)
        };
        if !present {
            frame.unlock();
            return Ok(());
        }

        let buf = unsafe { core::slice::from_raw_parts(ctx.frames.page_ptr(pfn), PAGE_SIZE) };
        let result = ops.write_page(index, buf);
        match result {
            Ok(()) => {
                self.clear_dirty(ctx, pfn);
                frame.unlock();
                Ok(())
            }
            Err(e) => {
                // 保持 DIRTY，下次 flush 重试
                frame.unlock();
                log::warn!(
                    "pagecache: writeback failed (vnode={}, index={})",
                    vnode,
                    index
                );
                Err(e)
            }
        }
    }

    // ========== 失效 / 驱逐 ==========

    /// 截断/删除路径的失效钩子：撤掉 [start, end) 页索引的条目
    ///
    /// 脏数据随条目一起丢弃（文件本身都没了）。仍被映射/pin 的
    /// 页帧在最后一个引用释放时归还。
    pub fn invalidate(&self, ctx: &MemCtx, vnode: VnodeId, start: PageIndex, end: PageIndex) {
        for sh in 0..SHARDS {
            let victims: Vec<(PageIndex, Pfn)> = {
                let shard = self.shards[sh].lock();
                shard
                    .range((vnode, start)..(vnode, end))
                    .map(|(&(_, index), &pfn)| (index, pfn))
                    .collect()
            };
            for (index, pfn) in victims {
                let frame = ctx.frames.frame(pfn);
                // 排斥进行中的加载/回写
                while !frame.try_lock() {
                    frame.wait_unlocked();
                }
                let removed = {
                    let mut shard = self.shards[sh].lock();
                    shard.remove(&(vnode, index)).is_some()
                };
                if !removed {
                    frame.unlock();
                    continue;
                }
                self.nr_pages.fetch_sub(1, Ordering::Relaxed);
                self.clear_dirty(ctx, pfn);
                reclaim::lru_del(ctx, pfn);
                frame.clear_flag(FrameFlag::PageCache);
                frame.unlock();
                // 撤掉缓存基准引用
                if frame.put() == 0 {
                    buddy::free_one_raw(ctx, pfn);
                }
            }
        }
    }

    /// 回收路径的驱逐：干净、未锁、无人引用的条目摘掉并归还页帧
    ///
    /// 返回是否真的驱逐了。pin 住的（refcount > 1）、LOCKED 的、
    /// DIRTY 的都跳过。
    pub(crate) fn try_evict(&self, ctx: &MemCtx, pfn: Pfn) -> bool {
        let frame = ctx.frames.frame(pfn);
        let vnode = frame.mapping();
        let index = frame.index();
        let sh = shard_of(vnode, index);

        let mut shard = self.shards[sh].lock();
        // 分片锁挡住新的 pin（pin 只能从查表开始）
        if frame.refcount() != 1 || frame.is_dirty() || frame.is_locked() {
            return false;
        }
        if shard.remove(&(vnode, index)).is_none() {
            return false;
        }
        drop(shard);

        self.nr_pages.fetch_sub(1, Ordering::Relaxed);
        reclaim::lru_del(ctx, pfn);
        frame.clear_flag(FrameFlag::PageCache);
        if frame.put() == 0 {
            buddy::free_one_raw(ctx, pfn);
        } else {
            panic!("pagecache: evicted entry had concurrent reference");
        }
        true
    }
}

impl Default for PageCache {
    fn default() -> Self {
        Self::new()
    }
}

/// 把一个文件页映射进地址空间
///
/// `writable` 为 false 时即使 perm 带写也装只读：首写缺页把 PTE
/// 升级为可写并把条目标脏——脏页跟踪因此不需要扫页表。
/// `writable` 为 true 则直接装可写并立即标脏。
/// 页帧上的 pin 由映射持有，unmap 时对称释放。
pub fn map_into(
    ctx: &MemCtx,
    aspace: &super::aspace::AddressSpace,
    vnode: VnodeId,
    file_off: usize,
    va: super::addr::VirtAddr,
    perm: super::vma::Perm,
    writable: bool,
) -> MmResult<()> {
    use super::vma::Perm;

    if !va.is_aligned() || file_off % PAGE_SIZE != 0 {
        return Err(MmError::AlignmentError);
    }

    let index = file_off / PAGE_SIZE;
    let pfn = ctx.page_cache.get(ctx, vnode, index)?;

    let mut eff = perm;
    let write_now = writable && perm.contains(Perm::WRITE);
    if !write_now {
        eff.remove(Perm::WRITE);
    }

    let mut inner = aspace.inner.lock();
    if let Err(e) = aspace.install_page_locked(ctx, &mut inner, va, pfn, eff, false) {
        drop(inner);
        ctx.page_cache.release(ctx, pfn);
        return Err(e);
    }
    drop(inner);

    if write_now {
        ctx.page_cache.mark_dirty(ctx, pfn);
    }
    Ok(())
}

//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 虚拟内存区域 (region) 管理 - 平台无关部分
//!
//! region 是进程地址空间中一个半开的连续虚拟区间，带相同的
//! 访问权限和映射属性：
//! - Perm: R/W/X 权限三元组
//! - RegionFlags: USER/COW/LOCKED/GROWSDOWN
//! - RegionKind: 匿名或文件映射（vnode + 偏移）
//!
//! `RegionTree` 用 BTreeMap 按起始地址存 region：
//! - O(log n) 查找、插入、删除
//! - `remove_range` 会按需把 region 一分为二再挖掉中间
//!
//! 页表操作（map/unmap/protect 的 PTE 部分）在 `aspace` 中。

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use bitflags::bitflags;

use super::addr::VirtAddr;
use super::page_cache::VnodeId;
use crate::config::PAGE_SIZE;
use crate::error::{MmError, MmResult};

bitflags! {
    /// 权限三元组
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Perm: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
    }
}

impl Perm {
    pub const RW: Perm = Perm::READ.union(Perm::WRITE);
    pub const RX: Perm = Perm::READ.union(Perm::EXEC);
}

bitflags! {
    /// region 属性
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RegionFlags: u32 {
        /// 用户态可访问
        const USER      = 1 << 0;
        /// 写时复制（fork 后的私有可写区）
        const COW       = 1 << 1;
        /// 锁定，不可回收
        const LOCKED    = 1 << 2;
        /// 向下增长（栈）
        const GROWSDOWN = 1 << 3;
    }
}

/// region 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// 匿名映射（堆、栈、私有数据），按需调零
    Anon,
    /// 文件映射：页来自页缓存
    File {
        vnode: VnodeId,
        /// 文件内字节偏移（页对齐）
        offset: usize,
    },
}

/// 虚拟内存区域
#[derive(Debug, Clone, Copy)]
pub struct Region {
    /// 起始虚拟地址（包含，页对齐）
    start: VirtAddr,
    /// 结束虚拟地址（不包含，页对齐）
    end: VirtAddr,
    perm: Perm,
    flags: RegionFlags,
    kind: RegionKind,
}

impl Region {
    pub fn new(start: VirtAddr, end: VirtAddr, perm: Perm, flags: RegionFlags, kind: RegionKind) -> Self {
        debug_assert!(start.as_usize() < end.as_usize(), "invalid region range");
        debug_assert!(start.is_aligned() && end.is_aligned(), "region not page aligned");
        Self {
            start,
            end,
            perm,
            flags,
            kind,
        }
    }

    #[inline]
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    #[inline]
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.end.as_usize() - self.start.as_usize()
    }

    #[inline]
    pub fn page_count(&self) -> usize {
        self.len() / PAGE_SIZE
    }

    #[inline]
    pub fn perm(&self) -> Perm {
        self.perm
    }

    pub fn set_perm(&mut self, perm: Perm) {
        self.perm = perm;
    }

    #[inline]
    pub fn flags(&self) -> RegionFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: RegionFlags) {
        self.flags = flags;
    }

    #[inline]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    #[inline]
    pub fn is_file_backed(&self) -> bool {
        matches!(self.kind, RegionKind::File { .. })
    }

    #[inline]
    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr.as_usize() >= self.start.as_usize() && addr.as_usize() < self.end.as_usize()
    }

    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        self.start.as_usize() < end.as_usize() && start.as_usize() < self.end.as_usize()
    }

    /// 文件映射中某个虚拟页对应的文件页索引
    pub fn file_index_of(&self, addr: VirtAddr) -> Option<usize> {
        match self.kind {
            RegionKind::File { offset, .. } => {
                let delta = addr.floor().as_usize() - self.start.as_usize();
                Some((offset + delta) / PAGE_SIZE)
            }
            RegionKind::Anon => None,
        }
    }

    /// 在 addr 处分裂为两半（addr 必须页对齐且严格在区间内部）
    pub fn split(&self, addr: VirtAddr) -> Option<(Region, Region)> {
        if !addr.is_aligned()
            || addr.as_usize() <= self.start.as_usize()
            || addr.as_usize() >= self.end.as_usize()
        {
            return None;
        }

        let mut first = *self;
        first.end = addr;

        let mut second = *self;
        second.start = addr;
        // 文件映射的后半段偏移要跟着走
        if let RegionKind::File { vnode, offset } = self.kind {
            second.kind = RegionKind::File {
                vnode,
                offset: offset + (addr.as_usize() - self.start.as_usize()),
            };
        }

        Some((first, second))
    }

    /// 能与后邻合并吗（相邻 + 属性一致 + 文件偏移连续）
    pub fn can_merge(&self, other: &Region) -> bool {
        if self.end.as_usize() != other.start.as_usize()
            || self.perm != other.perm
            || self.flags != other.flags
        {
            return false;
        }
        match (self.kind, other.kind) {
            (RegionKind::Anon, RegionKind::Anon) => true,
            (
                RegionKind::File { vnode: v1, offset: o1 },
                RegionKind::File { vnode: v2, offset: o2 },
            ) => v1 == v2 && o1 + self.len() == o2,
            _ => false,
        }
    }
}

/// region 树
///
/// 按起始地址排序的 BTreeMap。
pub struct RegionTree {
    regions: BTreeMap<usize, Region>,
}

impl RegionTree {
    pub fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    /// 插入 region；与现有区间重叠返回 Conflict
    pub fn add(&mut self, region: Region) -> MmResult<()> {
        if self.overlaps(region.start(), region.end()) {
            return Err(MmError::Conflict);
        }
        self.regions.insert(region.start().as_usize(), region);
        Ok(())
    }

    /// 是否与 [start, end) 有交
    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        // 只需检查起点在 end 之前的最后一个 region 和起点之后的第一个
        if let Some((_, prev)) = self.regions.range(..end.as_usize()).next_back() {
            if prev.overlaps(start, end) {
                return true;
            }
        }
        false
    }

    /// 查找覆盖 addr 的 region
    pub fn find(&self, addr: VirtAddr) -> Option<&Region> {
        self.regions
            .range(..=addr.as_usize())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    pub fn find_mut(&mut self, addr: VirtAddr) -> Option<&mut Region> {
        self.regions
            .range_mut(..=addr.as_usize())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(addr))
    }

    /// [addr, addr+len) 是否完全被 region 覆盖（可以跨多个相邻 region）
    pub fn covers_range(&self, addr: VirtAddr, len: usize) -> bool {
        let mut cur = addr.as_usize();
        let end = addr.as_usize() + len;
        while cur < end {
            match self.find(VirtAddr::new(cur)) {
                Some(r) => cur = r.end().as_usize(),
                None => return false,
            }
        }
        true
    }

    /// 挖掉 [start, end)，必要时分裂两端的 region
    ///
    /// 返回被移除的每一段（供调用者解除其中的页映射）。
    /// 区间内没有 region 也是成功：挖空洞是幂等的。
    pub fn remove_range(&mut self, start: VirtAddr, end: VirtAddr) -> Vec<Region> {
        let mut removed = Vec::new();

        // 左端：跨 start 的 region 先分裂
        if let Some(r) = self.find(start) {
            let key = r.start().as_usize();
            if key < start.as_usize() {
                let r = self.regions.remove(&key).unwrap();
                let (left, right) = r.split(start).unwrap();
                self.regions.insert(left.start().as_usize(), left);
                self.regions.insert(right.start().as_usize(), right);
            }
        }

        // 右端：跨 end 的 region 分裂
        if end.as_usize() > 0 {
            if let Some(r) = self.find(VirtAddr::new(end.as_usize() - 1)) {
                if r.end().as_usize() > end.as_usize() {
                    let key = r.start().as_usize();
                    let r = self.regions.remove(&key).unwrap();
                    if let Some((left, right)) = r.split(end) {
                        self.regions.insert(left.start().as_usize(), left);
                        self.regions.insert(right.start().as_usize(), right);
                    } else {
                        // split 失败说明 region 正好从 end 开始，放回去
                        self.regions.insert(key, r);
                    }
                }
            }
        }

        // 现在 [start, end) 内的 region 都完整落在区间里
        let keys: Vec<usize> = self
            .regions
            .range(start.as_usize()..end.as_usize())
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            removed.push(self.regions.remove(&key).unwrap());
        }
        removed
    }

    /// 在 [from, limit) 中找一段长 len 的空闲虚拟区间
    pub fn find_free_range(&self, from: VirtAddr, len: usize, limit: usize) -> Option<VirtAddr> {
        let mut cur = from.as_usize();
        loop {
            if cur + len > limit {
                return None;
            }
            // 与 [cur, cur+len) 相交的第一个 region
            let conflict = self
                .regions
                .range(..cur + len)
                .next_back()
                .map(|(_, r)| *r)
                .filter(|r| r.overlaps(VirtAddr::new(cur), VirtAddr::new(cur + len)));
            match conflict {
                None => return Some(VirtAddr::new(cur)),
                Some(r) => cur = r.end().as_usize(),
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.regions.len()
    }

    pub fn clear(&mut self) {
        self.regions.clear();
    }
}

impl Default for RegionTree {
    fn default() -> Self {
        Self::new()
    }
}

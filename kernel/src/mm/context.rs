//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内存核心上下文
//!
//! 页帧数据库、zone 数组、NUMA 节点数组是启动时构建一次、之后
//! 读多写少的全局状态。它们不做成模块级静态，而是收进一个
//! `MemCtx`，作为第一个参数穿过每个入口点——在合成的 zone 上
//! 单测伙伴系统因此是平凡的。需要全局单例的内核子系统走
//! `mm::global` 的安装一次入口。
//!
//! `MemCtx::init` 是早期启动的唯一入口：传入固件内存图、NUMA
//! 拓扑和内核保留区间，构建页帧数据库、zone、节点记录和空的
//! 内核地址空间。其他入口点在 init 返回前一律不可用。

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::RwLock;

use super::addr::{Pfn, PhysAddr};
use super::aspace::{AddressSpace, AsId};
use super::frame::FrameDb;
use super::page_cache::PageCache;
use super::page_table;
use super::reclaim::{OomHandler, ReclaimState};
use super::slab::SlabRoot;
use super::zone::{NumaNode, Zone, ZoneKind};
use super::{buddy, pcp};
use crate::arch::ArchOps;
use crate::config::{DMA_LIMIT, KERNEL_SHARED_TABLES, MAX_CPUS, PAGE_SHIFT};
use crate::error::{MmError, MmResult};

/// 一段 pfn 区间 [start, end)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PfnRange {
    pub start: Pfn,
    pub end: Pfn,
}

impl PfnRange {
    pub const fn new(start: Pfn, end: Pfn) -> Self {
        Self { start, end }
    }

    #[inline]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn >= self.start && pfn < self.end
    }
}

/// 固件内存图中的一段可用物理内存
#[derive(Debug, Clone, Copy)]
pub struct MemRegion {
    pub start: PhysAddr,
    pub pages: usize,
    /// 所属 NUMA 节点
    pub nid: u32,
}

/// 固件内存图
///
/// `dmap_base` 是直接映射基址：内存图覆盖的最低 pfn 的页内容在
/// 该虚拟地址处可见，之后逐页连续。真实内核传内核直接映射；
/// 宿主机测试传一块页对齐的测试内存。
#[derive(Debug)]
pub struct MemoryMap {
    pub dmap_base: usize,
    pub regions: Vec<MemRegion>,
}

/// NUMA 节点描述
#[derive(Debug, Clone, Copy)]
pub struct NodeDesc {
    pub id: u32,
    /// 本节点的 CPU 位掩码
    pub cpu_mask: usize,
    /// 节点顶端划给 MOVABLE zone 的页数（0 表示不建 MOVABLE）
    pub movable_pages: usize,
}

/// NUMA 拓扑
#[derive(Debug)]
pub struct NumaTopology {
    pub nodes: Vec<NodeDesc>,
    /// distances[i][j] = 节点 i 到节点 j 的距离
    pub distances: Vec<Vec<u32>>,
}

impl NumaTopology {
    /// 单节点拓扑（全部 CPU 在节点 0）
    pub fn single_node() -> Self {
        Self {
            nodes: alloc::vec![NodeDesc {
                id: 0,
                cpu_mask: (1 << MAX_CPUS) - 1,
                movable_pages: 0,
            }],
            distances: alloc::vec![alloc::vec![10]],
        }
    }
}

/// 内存核心上下文
pub struct MemCtx {
    /// 页帧数据库
    pub frames: FrameDb,
    /// 全部 zone（扁平数组，Zone::id 即索引）
    pub zones: Vec<Zone>,
    /// NUMA 节点
    pub nodes: Vec<NumaNode>,
    /// 页缓存
    pub page_cache: PageCache,
    /// slab 分配器根
    pub slab: SlabRoot,
    /// 回收状态
    pub reclaim: ReclaimState,
    /// 体系结构钩子
    pub arch: Box<dyn ArchOps>,

    /// 内核页表根（内核半区的共享顶级项都在这里）
    pub kernel_root: Pfn,
    /// 可用页帧总数（不变量核算的分母）
    pub total_usable: usize,

    /// 地址空间注册表（按 id；页帧通过 id 引用地址空间，不持指针）
    pub(crate) aspaces: RwLock<BTreeMap<AsId, Arc<AddressSpace>>>,
    next_as_id: AtomicU64,
    /// 每个 CPU 当前活跃的地址空间 id（0 = 内核自身）
    pub(crate) active: Box<[AtomicU64]>,

    /// OOM 处理器（未注册时直接销毁牺牲者的地址空间）
    pub(crate) oom: RwLock<Option<Arc<dyn OomHandler>>>,
}

impl MemCtx {
    /// 构建内存核心
    ///
    /// 早期启动代码在任何其他入口点之前调用一次。
    pub fn init(
        memory_map: &MemoryMap,
        topology: &NumaTopology,
        reserved: &[PfnRange],
        arch: Box<dyn ArchOps>,
    ) -> MmResult<Self> {
        if memory_map.regions.is_empty() || topology.nodes.is_empty() {
            return Err(MmError::InvalidArgument);
        }

        // 1. 页帧数据库覆盖内存图的整个 pfn 跨度
        let base_pfn = memory_map
            .regions
            .iter()
            .map(|r| r.start.pfn())
            .min()
            .unwrap_or(0);
        let end_pfn = memory_map
            .regions
            .iter()
            .map(|r| r.start.pfn() + r.pages)
            .max()
            .unwrap_or(0);
        let frames = FrameDb::new(base_pfn, end_pfn - base_pfn, memory_map.dmap_base);

        // 2. 内存图中的页帧放开为可用，保留区间再压回去
        for region in &memory_map.regions {
            let start = region.start.pfn();
            for pfn in start..start + region.pages {
                let f = frames.frame(pfn);
                f.init_free();
                f.set_nid(region.nid);
            }
        }
        for range in reserved {
            for pfn in range.start..range.end {
                if frames.contains(pfn) {
                    frames.frame(pfn).init_reserved();
                }
            }
        }

        // 3. 每个节点按 pfn 边界切 zone
        let dma_limit_pfn = DMA_LIMIT >> PAGE_SHIFT;
        let mut zones: Vec<Zone> = Vec::new();
        let mut nodes: Vec<NumaNode> = Vec::new();

        for desc in &topology.nodes {
            let nid = desc.id;
            // 节点的 pfn 跨度
            let node_regions: Vec<&MemRegion> = memory_map
                .regions
                .iter()
                .filter(|r| r.nid == nid)
                .collect();
            if node_regions.is_empty() {
                return Err(MmError::InvalidArgument);
            }
            let node_start = node_regions.iter().map(|r| r.start.pfn()).min().unwrap();
            let node_end = node_regions
                .iter()
                .map(|r| r.start.pfn() + r.pages)
                .max()
                .unwrap();

            // zone 边界：DMA | NORMAL | MOVABLE（HIGH 在 64 位配置下不出现）
            let movable_start = node_end - desc.movable_pages.min(node_end - node_start);
            let dma_end = dma_limit_pfn.clamp(node_start, movable_start);

            let spans = [
                (ZoneKind::Dma, node_start, dma_end),
                (ZoneKind::Normal, dma_end, movable_start),
                (ZoneKind::Movable, movable_start, node_end),
            ];

            let mut zone_idx = Vec::new();
            for (kind, start, end) in spans {
                if start >= end {
                    continue;
                }
                let id = zones.len() as u32;

                // zone 内可用页帧的连续段
                let runs = usable_runs(&frames, start, end, nid);
                let managed: usize = runs.iter().map(|r| r.end - r.start).sum();
                if managed == 0 {
                    continue;
                }

                let zone = Zone::new(id, nid, kind, start..end, managed);
                for run in &runs {
                    for pfn in run.start..run.end {
                        let f = frames.frame(pfn);
                        f.set_zone_id(id);
                    }
                    buddy::populate_zone(&frames, &zone, run.start, run.end);
                }
                zone_idx.push(id as usize);
                zones.push(zone);
            }

            nodes.push(NumaNode {
                id: nid,
                cpu_mask: desc.cpu_mask,
                zone_idx,
                distance: topology.distances[nid as usize].clone(),
            });
        }

        let total_usable = zones.iter().map(|z| z.managed_pages).sum();

        let mut active = Vec::with_capacity(MAX_CPUS);
        for _ in 0..MAX_CPUS {
            active.push(AtomicU64::new(0));
        }

        let mut ctx = MemCtx {
            frames,
            zones,
            nodes,
            page_cache: PageCache::new(),
            slab: SlabRoot::new(),
            reclaim: ReclaimState::new(),
            arch,
            kernel_root: 0,
            total_usable,
            aspaces: RwLock::new(BTreeMap::new()),
            next_as_id: AtomicU64::new(1),
            active: active.into_boxed_slice(),
            oom: RwLock::new(None),
        };

        // 4. 内核页表根 + 共享的内核半区顶级项
        //    这些顶级项指向的中间页表由所有地址空间共享（fork 时
        //    只复制顶级项本身），内核映射因此对每个进程可见。
        let kernel_root = page_table::alloc_table(&ctx)?;
        for i in 0..KERNEL_SHARED_TABLES {
            let mid = page_table::alloc_table(&ctx)?;
            page_table::set_table_entry(
                &ctx,
                kernel_root,
                page_table::KERNEL_VPN2_BASE + i,
                mid,
            );
        }
        ctx.kernel_root = kernel_root;

        // 5. kmalloc 桶缓存
        SlabRoot::init_kmalloc_caches(&ctx);

        log::info!(
            "mm: {} v{} memory core up: {} usable pages, {} zones, {} nodes",
            crate::config::KERNEL_NAME,
            crate::config::KERNEL_VERSION,
            ctx.total_usable,
            ctx.zones.len(),
            ctx.nodes.len()
        );
        for zone in &ctx.zones {
            log::debug!(
                "mm:   node {} zone {:<7} pfn {:#x}-{:#x} managed {} wm {}/{}/{}",
                zone.nid,
                zone.kind.as_str(),
                zone.span.start,
                zone.span.end,
                zone.managed_pages,
                zone.watermarks.min,
                zone.watermarks.low,
                zone.watermarks.high
            );
        }

        Ok(ctx)
    }

    // ========== zone / 节点访问 ==========

    #[inline]
    pub fn zone(&self, id: u32) -> &Zone {
        &self.zones[id as usize]
    }

    #[inline]
    pub fn node(&self, nid: usize) -> &NumaNode {
        &self.nodes[nid]
    }

    /// CPU 所在的节点
    pub fn node_of_cpu(&self, cpu: usize) -> usize {
        self.nodes
            .iter()
            .position(|n| n.cpu_mask & (1 << cpu) != 0)
            .unwrap_or(0)
    }

    /// 清空全部 per-CPU 页缓存（精确核算前调用）
    pub fn drain_pcp(&self) {
        pcp::drain_all(self);
    }

    // ========== 地址空间注册表 ==========

    pub(crate) fn alloc_as_id(&self) -> AsId {
        self.next_as_id.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn register_aspace(&self, aspace: Arc<AddressSpace>) {
        self.aspaces.write().insert(aspace.id(), aspace);
    }

    pub(crate) fn unregister_aspace(&self, id: AsId) -> Option<Arc<AddressSpace>> {
        self.aspaces.write().remove(&id)
    }

    /// 按 id 查地址空间
    pub fn aspace(&self, id: AsId) -> Option<Arc<AddressSpace>> {
        self.aspaces.read().get(&id).cloned()
    }

    /// CPU 当前活跃的地址空间
    pub fn active_aspace(&self, cpu: usize) -> Option<Arc<AddressSpace>> {
        let id = self.active[cpu].load(Ordering::Acquire);
        if id == 0 {
            None
        } else {
            self.aspace(id)
        }
    }

    /// 注册 OOM 处理器
    pub fn set_oom_handler(&self, handler: Arc<dyn OomHandler>) {
        *self.oom.write() = Some(handler);
    }
}

/// zone 内可用（未保留、属本节点）页帧的连续段
fn usable_runs(frames: &FrameDb, start: Pfn, end: Pfn, nid: u32) -> Vec<PfnRange> {
    let mut runs = Vec::new();
    let mut run_start: Option<Pfn> = None;

    for pfn in start..end {
        let usable = frames
            .try_frame(pfn)
            .map(|f| !f.is_reserved() && f.nid() == nid)
            .unwrap_or(false);
        match (usable, run_start) {
            (true, None) => run_start = Some(pfn),
            (false, Some(s)) => {
                runs.push(PfnRange::new(s, pfn));
                run_start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = run_start {
        runs.push(PfnRange::new(s, end));
    }
    runs
}

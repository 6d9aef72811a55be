//! 单元测试模块
//!
//! 场景测试都在这个模块中，按主题分文件；`cargo test` 在宿主机上跑。
//!
//! 每个测试用一块页对齐的堆内存充当"物理内存"，在其上构建
//! `MemCtx`：固件内存图、NUMA 拓扑、保留区间都按测试需要合成。
//! 体系结构钩子注入记录型实现，TLB shootdown 的次数可以断言。

pub mod mem_mmap;
pub mod page_cache;
pub mod reclaim_oom;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::alloc::Layout;
use std::cell::Cell;
use std::sync::Arc;

use spin::Mutex;

use crate::arch::ArchOps;
use crate::config::PAGE_SIZE;
use crate::error::{MmError, MmResult};
use crate::mm::addr::{Pfn, PhysAddr, VirtAddr};
use crate::mm::context::{MemCtx, MemRegion, MemoryMap, NodeDesc, NumaTopology};
use crate::mm::page_cache::{PageIndex, VnodeOps};

/// 测试"物理内存"的起始物理地址（64MB，落在 NORMAL zone）
pub const PHYS_BASE: usize = 0x400_0000;

/// 测试物理内存
///
/// 一块页对齐的堆内存；`MemCtx` 通过直接映射基址访问它。
pub struct Arena {
    ptr: *mut u8,
    layout: Layout,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, layout }
    }

    pub fn base(&self) -> usize {
        self.ptr as usize
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe { std::alloc::dealloc(self.ptr, self.layout) };
    }
}

// ========== 记录型体系结构钩子 ==========

thread_local! {
    static THIS_CPU: Cell<usize> = const { Cell::new(0) };
}

/// 把当前线程当作某个 CPU（SMP 测试里每个线程认领一个编号）
pub fn set_cpu(cpu: usize) {
    THIS_CPU.with(|c| c.set(cpu));
}

/// TLB 维护计数器
#[derive(Default)]
pub struct TlbCounters {
    pub local_flushes: AtomicUsize,
    pub shootdowns: AtomicUsize,
}

pub struct TestArch {
    pub counters: Arc<TlbCounters>,
}

impl ArchOps for TestArch {
    fn cpu_id(&self) -> usize {
        THIS_CPU.with(|c| c.get())
    }

    fn install_root(&self, _root: Pfn, _asid: u64) {}

    fn tlb_flush_local(&self, _root: Pfn, _va: VirtAddr, _pages: usize) {
        self.counters.local_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn tlb_shootdown(&self, _root: Pfn, _va: VirtAddr, _pages: usize, _cpu_mask: usize) {
        self.counters.shootdowns.fetch_add(1, Ordering::Relaxed);
    }
}

// ========== 测试 vnode ==========

/// 内存里的假文件：读零扩展，回写记录页索引
pub struct TestVnode {
    data: Mutex<Vec<u8>>,
    pub reads: AtomicUsize,
    /// 回写日志（每次 write_page 记一个页索引）
    pub write_log: Mutex<Vec<PageIndex>>,
    pub fail_reads: AtomicBool,
}

impl TestVnode {
    pub fn new(data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(data),
            reads: AtomicUsize::new(0),
            write_log: Mutex::new(Vec::new()),
            fail_reads: AtomicBool::new(false),
        })
    }

    pub fn byte_at(&self, off: usize) -> u8 {
        self.data.lock()[off]
    }

    pub fn writes_of(&self, index: PageIndex) -> usize {
        self.write_log.lock().iter().filter(|&&i| i == index).count()
    }
}

impl VnodeOps for TestVnode {
    fn read_page(&self, index: PageIndex, buf: &mut [u8]) -> MmResult<()> {
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(MmError::Io);
        }
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock();
        let start = index * PAGE_SIZE;
        for (i, b) in buf.iter_mut().enumerate() {
            *b = data.get(start + i).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_page(&self, index: PageIndex, buf: &[u8]) -> MmResult<()> {
        self.write_log.lock().push(index);
        let mut data = self.data.lock();
        let start = index * PAGE_SIZE;
        if data.len() < start + buf.len() {
            data.resize(start + buf.len(), 0);
        }
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

// ========== 环境构建 ==========

pub struct TestEnv {
    pub ctx: MemCtx,
    pub tlb: Arc<TlbCounters>,
    _arena: Arena,
}

fn build_env(regions: Vec<MemRegion>, topology: NumaTopology, arena_pages: usize) -> TestEnv {
    set_cpu(0);
    let arena = Arena::new(arena_pages);
    let map = MemoryMap {
        dmap_base: arena.base(),
        regions,
    };
    let counters = Arc::new(TlbCounters::default());
    let arch = Box::new(TestArch {
        counters: counters.clone(),
    });
    let ctx = MemCtx::init(&map, &topology, &[], arch).expect("test context");
    TestEnv {
        ctx,
        tlb: counters,
        _arena: arena,
    }
}

/// 单节点、全 NORMAL 的环境
pub fn make_env(pages: usize) -> TestEnv {
    build_env(
        vec![MemRegion {
            start: PhysAddr::new(PHYS_BASE),
            pages,
            nid: 0,
        }],
        NumaTopology::single_node(),
        pages,
    )
}

/// 双节点环境：节点 0 给内核起步用，节点 1 是干净的实验区
pub fn make_env_two_nodes(n0_pages: usize, n1_pages: usize) -> TestEnv {
    build_env(
        vec![
            MemRegion {
                start: PhysAddr::new(PHYS_BASE),
                pages: n0_pages,
                nid: 0,
            },
            MemRegion {
                start: PhysAddr::new(PHYS_BASE + n0_pages * PAGE_SIZE),
                pages: n1_pages,
                nid: 1,
            },
        ],
        NumaTopology {
            nodes: vec![
                NodeDesc {
                    id: 0,
                    cpu_mask: 0x3,
                    movable_pages: 0,
                },
                NodeDesc {
                    id: 1,
                    cpu_mask: 0xc,
                    movable_pages: 0,
                },
            ],
            distances: vec![vec![10, 20], vec![20, 10]],
        },
        n0_pages + n1_pages,
    )
}

/// 带 MOVABLE zone 的单节点环境
pub fn make_env_movable(pages: usize, movable_pages: usize) -> TestEnv {
    build_env(
        vec![MemRegion {
            start: PhysAddr::new(PHYS_BASE),
            pages,
            nid: 0,
        }],
        NumaTopology {
            nodes: vec![NodeDesc {
                id: 0,
                cpu_mask: (1 << crate::config::MAX_CPUS) - 1,
                movable_pages,
            }],
            distances: vec![vec![10]],
        },
        pages,
    )
}

/// 跨 DMA 边界的环境：一段在 16MB 以下，一段在上面
pub fn make_env_dma(dma_pages: usize, normal_pages: usize) -> TestEnv {
    let dma_start = crate::config::DMA_LIMIT - dma_pages * PAGE_SIZE;
    build_env(
        vec![
            MemRegion {
                start: PhysAddr::new(dma_start),
                pages: dma_pages,
                nid: 0,
            },
            MemRegion {
                start: PhysAddr::new(crate::config::DMA_LIMIT),
                pages: normal_pages,
                nid: 0,
            },
        ],
        NumaTopology::single_node(),
        dma_pages + normal_pages,
    )
}

impl TestEnv {
    /// 全系统空闲页（zone 空闲链表 + per-CPU 缓存）
    pub fn total_free(&self) -> usize {
        self.ctx
            .zones
            .iter()
            .map(|z| z.free_pages() + z.pcp_pages.load(Ordering::Acquire))
            .sum()
    }
}

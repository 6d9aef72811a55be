//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内存管理模块

pub mod addr;
pub mod aspace;
pub mod buddy;
pub mod context;
pub mod fault;
pub mod frame;
pub mod global;
pub mod meminfo;
pub mod page_cache;
pub mod page_table;
pub mod pcp;
pub mod reclaim;
pub mod slab;
pub mod vma;
pub mod zone;

pub use crate::config::{MAX_ORDER, PAGE_SHIFT, PAGE_SIZE};

pub use addr::{Pfn, PhysAddr, VirtAddr};
pub use aspace::{AddressSpace, AsId, MapFlags};
pub use buddy::{alloc_pages, free_pages, GfpFlags, GFP_ATOMIC, GFP_KERNEL, GFP_NOWAIT, GFP_USER};
pub use context::{MemCtx, MemRegion, MemoryMap, NodeDesc, NumaTopology, PfnRange};
pub use fault::{handle_fault, FaultError};
pub use frame::{Frame, FrameDb, FrameFlag, PFN_NULL};
pub use page_cache::{PageIndex, VnodeId, VnodeOps};
pub use slab::{kfree, kmalloc, kmem_cache_create, kzalloc};
pub use vma::{Perm, RegionFlags, RegionKind};

/// 用户虚拟地址空间上界（Sv39 低半区，vpn2 0..255）
pub const USER_VA_END: usize = 0x40_0000_0000;

/// 内核虚拟地址空间下界
///
/// 用户态访问此界以上的地址直接按坏地址处理，不查 region。
pub const KERNEL_VA_BASE: usize = USER_VA_END;

/// `map_anon`/`map_file` 在 va_hint 为 0 时的搜索起点
pub const MMAP_BASE: usize = 0x4000_0000;

//! Ferro 内核配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 基本信息
// ============================================================

/// 内核名称
pub const KERNEL_NAME: &str = "Ferro";

/// 内核版本
pub const KERNEL_VERSION: &str = "0.1.0";

// ============================================================
// 内存配置
// ============================================================

/// 页大小（字节）
pub const PAGE_SIZE: usize = 4096;

/// 页大小位移
pub const PAGE_SHIFT: usize = 12;

/// 伙伴系统最大 order（空闲链表覆盖 order 0..=MAX_ORDER）
pub const MAX_ORDER: usize = 10;

/// DMA zone 的物理地址上限（字节）
pub const DMA_LIMIT: usize = 16 * 1024 * 1024;

/// 水位线默认值（页数）
///
/// 实际水位线在 zone 初始化时按 zone 大小向下收缩，
/// 这里是上限（策略旋钮，通过 Kernel.toml 调整）。
pub const WATERMARK_MIN: usize = 128;
pub const WATERMARK_LOW: usize = 256;
pub const WATERMARK_HIGH: usize = 512;

/// 内核半区共享的顶级页表项数量
///
/// 这些顶级项指向的中间页表在所有地址空间间共享，
/// fork 时不复制，也不参与 COW。
pub const KERNEL_SHARED_TABLES: usize = 8;

// ============================================================
// Slab 配置
// ============================================================

/// 每 CPU magazine 的对象槽位数（一个缓存行的指针数）
pub const SLAB_MAGAZINE_SIZE: usize = 8;

/// 每个缓存保留的全空 slab 数量上限，超过即归还伙伴系统
pub const SLAB_EMPTY_HIGH: usize = 2;

// ============================================================
// Per-CPU 页缓存配置
// ============================================================

/// PCP 高水位（超过时批量归还伙伴系统）
pub const PCP_HIGH: usize = 64;

/// PCP 批量填充/归还数量
pub const PCP_BATCH: usize = 16;

// ============================================================
// SMP 配置
// ============================================================

/// 最大 CPU 数量
pub const MAX_CPUS: usize = 4;

//! Ferro 内核构建脚本
//!
//! 这个脚本在编译前运行，负责：
//! 1. 解析 Kernel.toml 配置文件
//! 2. 生成配置代码 (src/config.rs)
//!
//! 缺失的配置键使用内置默认值，保证没有 Kernel.toml 时也能构建。

use std::env;
use std::fs;
use std::path::PathBuf;

/// 读取整数配置项
fn get_usize(config: &toml::Value, section: &str, key: &str, default: usize) -> usize {
    config
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_integer())
        .map(|v| v as usize)
        .unwrap_or(default)
}

/// 读取字符串配置项
fn get_str<'a>(config: &'a toml::Value, section: &str, key: &str, default: &'a str) -> &'a str {
    config
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or(default)
}

fn main() {
    println!("cargo:rerun-if-changed=../Kernel.toml");
    println!("cargo:rerun-if-changed=build.rs");

    // 读取 Kernel.toml（工作区根目录）；不存在时使用空配置
    let config: toml::Value = match fs::read_to_string("../Kernel.toml") {
        Ok(content) => toml::from_str(&content).expect("Kernel.toml 解析失败"),
        Err(_) => toml::Value::Table(toml::map::Map::new()),
    };

    let kernel_name = get_str(&config, "general", "name", "Ferro").to_string();
    let kernel_version = get_str(&config, "general", "version", "0.1.0").to_string();

    let page_size = get_usize(&config, "memory", "page_size", 4096);
    assert!(page_size.is_power_of_two(), "page_size 必须是 2 的幂");
    let page_shift = page_size.trailing_zeros() as usize;

    let max_order = get_usize(&config, "memory", "max_order", 10);
    let dma_limit_mb = get_usize(&config, "memory", "dma_limit_mb", 16);
    let watermark_min = get_usize(&config, "memory", "watermark_min", 128);
    let watermark_low = get_usize(&config, "memory", "watermark_low", 256);
    let watermark_high = get_usize(&config, "memory", "watermark_high", 512);
    let kernel_shared_tables = get_usize(&config, "memory", "kernel_shared_tables", 8);

    let magazine_size = get_usize(&config, "slab", "magazine_size", 8);
    let empty_slab_high = get_usize(&config, "slab", "empty_slab_high", 2);

    let pcp_high = get_usize(&config, "pcp", "high", 64);
    let pcp_batch = get_usize(&config, "pcp", "batch", 16);

    let max_cpus = get_usize(&config, "smp", "max_cpus", 4);

    let code = format!(
        r#"//! Ferro 内核配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 基本信息
// ============================================================

/// 内核名称
pub const KERNEL_NAME: &str = "{kernel_name}";

/// 内核版本
pub const KERNEL_VERSION: &str = "{kernel_version}";

// ============================================================
// 内存配置
// ============================================================

/// 页大小（字节）
pub const PAGE_SIZE: usize = {page_size};

/// 页大小位移
pub const PAGE_SHIFT: usize = {page_shift};

/// 伙伴系统最大 order（空闲链表覆盖 order 0..=MAX_ORDER）
pub const MAX_ORDER: usize = {max_order};

/// DMA zone 的物理地址上限（字节）
pub const DMA_LIMIT: usize = {dma_limit_mb} * 1024 * 1024;

/// 水位线默认值（页数）
///
/// 实际水位线在 zone 初始化时按 zone 大小向下收缩，
/// 这里是上限（策略旋钮，通过 Kernel.toml 调整）。
pub const WATERMARK_MIN: usize = {watermark_min};
pub const WATERMARK_LOW: usize = {watermark_low};
pub const WATERMARK_HIGH: usize = {watermark_high};

/// 内核半区共享的顶级页表项数量
///
/// 这些顶级项指向的中间页表在所有地址空间间共享，
/// fork 时不复制，也不参与 COW。
pub const KERNEL_SHARED_TABLES: usize = {kernel_shared_tables};

// ============================================================
// Slab 配置
// ============================================================

/// 每 CPU magazine 的对象槽位数（一个缓存行的指针数）
pub const SLAB_MAGAZINE_SIZE: usize = {magazine_size};

/// 每个缓存保留的全空 slab 数量上限，超过即归还伙伴系统
pub const SLAB_EMPTY_HIGH: usize = {empty_slab_high};

// ============================================================
// Per-CPU 页缓存配置
// ============================================================

/// PCP 高水位（超过时批量归还伙伴系统）
pub const PCP_HIGH: usize = {pcp_high};

/// PCP 批量填充/归还数量
pub const PCP_BATCH: usize = {pcp_batch};

// ============================================================
// SMP 配置
// ============================================================

/// 最大 CPU 数量
pub const MAX_CPUS: usize = {max_cpus};
"#
    );

    // 写入 src/config.rs（仅在内容变化时写，避免无谓的重新编译）
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());
    let config_path = manifest_dir.join("src").join("config.rs");
    let unchanged = fs::read_to_string(&config_path)
        .map(|old| old == code)
        .unwrap_or(false);
    if !unchanged {
        fs::write(&config_path, code).expect("无法写入 src/config.rs");
    }
}

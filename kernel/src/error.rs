//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内存核心错误代码定义
//!
//! 区分两类失败：
//! - **报告型失败**：调用者的问题（内存不足、坏地址、参数错误），
//!   用 `MmError` 返回并通过 `?` 向上传播，绝不静默吞掉。
//! - **不变量失败**：核心自身的 bug（引用计数下溢、页帧同时挂在
//!   两个链表上、伙伴指针越过 zone 边界）。继续运行会破坏无关内存，
//!   直接 panic 并带诊断快照。
//!
//! W^X 违例不在此列：`map` 按设计静默降级（保留 WRITE、清除 EXEC），
//! 不向调用者报告。

/// 内存核心的报告型错误
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmError {
    /// 没有 zone 能满足请求，回收和 OOM 也无济于事 (ENOMEM)
    OutOfMemory,

    /// 用户指针不在任何 region 内，或缺少请求的权限 (EFAULT)
    BadAddress,

    /// map/unmap 收到非页对齐的参数，未做任何修改 (EINVAL)
    AlignmentError,

    /// FIXED 语义的 map 与现有 region 冲突 (EEXIST)
    Conflict,

    /// 无效参数（order 超限、长度溢出等）(EINVAL)
    InvalidArgument,

    /// VFS 读写钩子失败 (EIO)
    Io,

    /// 保留位缺页或页表项损坏
    ///
    /// 正常路径下这会直接 panic；只有显式的校验接口才把它
    /// 作为值返回。
    CorruptedTables,
}

/// 内存核心统一的结果类型
pub type MmResult<T> = Result<T, MmError>;

impl MmError {
    /// 映射为标准错误代码（正数）
    #[inline]
    pub const fn errno(self) -> i32 {
        match self {
            MmError::OutOfMemory => constants::ENOMEM,
            MmError::BadAddress => constants::EFAULT,
            MmError::AlignmentError => constants::EINVAL,
            MmError::Conflict => constants::EEXIST,
            MmError::InvalidArgument => constants::EINVAL,
            MmError::Io => constants::EIO,
            MmError::CorruptedTables => constants::EFAULT,
        }
    }

    /// 映射为负数错误代码（系统调用返回值风格）
    #[inline]
    pub const fn as_neg_i32(self) -> i32 {
        -self.errno()
    }
}

/// 常用的错误代码常量
pub mod constants {
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EFAULT: i32 = 14;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
}

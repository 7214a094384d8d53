//! 错误处理模块
//!
//! 定义了 GPU 驻留与提交核心使用的统一错误类型。
//!
//! # 设计原则
//!
//! - 致命的设备错误不在这里抛出，而是通过 `device_fatal_error` 标记，下一帧统一恢复
//! - 这里的错误只覆盖调用方需要立即知道的失败（创建失败、配置错误、IO）
//! - 支持错误链（error source）

use std::fmt;

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, GpuError>;

/// GPU 核心的错误类型
#[derive(Debug)]
pub enum GpuError {
    /// 配置错误
    Config(ConfigError),

    /// 设备或原生 API 错误
    Device(DeviceError),

    /// 显存分配错误
    Memory(MemoryError),

    /// IO 错误
    Io(std::io::Error),

    /// 日志系统错误
    Log(String),

    /// 初始化错误
    Initialization(String),
}

/// 配置相关的错误
#[derive(Debug)]
pub enum ConfigError {
    /// 配置文件未找到
    FileNotFound(String),

    /// 配置文件解析失败
    ParseError(String),

    /// 配置值无效
    InvalidValue { field: String, reason: String },
}

/// 设备相关的错误
#[derive(Debug)]
pub enum DeviceError {
    /// 设备创建失败
    Creation(String),

    /// 设备已移除
    Removed(String),

    /// 原生调用失败
    Call { call: &'static str, message: String },

    /// 资源创建失败
    ResourceCreation(String),

    /// 命令执行失败
    CommandExecution(String),

    /// CPU 等待不可能完成（例如等待一个永远不会发出的栅栏值）
    WaitNeverCompletes(String),
}

/// 显存分配相关的错误
#[derive(Debug)]
pub enum MemoryError {
    /// 请求的大小无效
    InvalidSize { size: u64, limit: u64 },

    /// 分配器无法满足请求
    Exhausted { size: u64, align: u64 },

    /// 堆创建失败
    HeapCreation(String),

    /// 该内存不可被 CPU 访问
    NotCpuVisible,

    /// 访问越界
    OutOfRange { offset: u64, size: u64, limit: u64 },
}

impl GpuError {
    /// 原生调用失败的便捷构造
    pub fn call(call: &'static str, message: impl fmt::Display) -> Self {
        GpuError::Device(DeviceError::Call {
            call,
            message: message.to_string(),
        })
    }
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::Config(e) => write!(f, "Configuration error: {}", e),
            GpuError::Device(e) => write!(f, "Device error: {}", e),
            GpuError::Memory(e) => write!(f, "Memory error: {}", e),
            GpuError::Io(e) => write!(f, "IO error: {}", e),
            GpuError::Log(msg) => write!(f, "Log error: {}", msg),
            GpuError::Initialization(msg) => write!(f, "Initialization error: {}", msg),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {}", path),
            ConfigError::ParseError(msg) => write!(f, "Failed to parse config: {}", msg),
            ConfigError::InvalidValue { field, reason } => {
                write!(f, "Invalid value for '{}': {}", field, reason)
            }
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::Creation(msg) => write!(f, "Device creation failed: {}", msg),
            DeviceError::Removed(reason) => write!(f, "Device removed: {}", reason),
            DeviceError::Call { call, message } => write!(f, "{} failed: {}", call, message),
            DeviceError::ResourceCreation(msg) => write!(f, "Resource creation failed: {}", msg),
            DeviceError::CommandExecution(msg) => write!(f, "Command execution failed: {}", msg),
            DeviceError::WaitNeverCompletes(msg) => write!(f, "Wait can never complete: {}", msg),
        }
    }
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::InvalidSize { size, limit } => {
                write!(f, "Invalid allocation size {} (limit {})", size, limit)
            }
            MemoryError::Exhausted { size, align } => {
                write!(f, "No room for {} bytes aligned to {}", size, align)
            }
            MemoryError::HeapCreation(msg) => write!(f, "Heap creation failed: {}", msg),
            MemoryError::NotCpuVisible => write!(f, "Memory is not CPU visible"),
            MemoryError::OutOfRange { offset, size, limit } => {
                write!(f, "Access [{}, {}) exceeds {}", offset, offset + size, limit)
            }
        }
    }
}

impl std::error::Error for GpuError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GpuError::Io(e) => Some(e),
            GpuError::Config(e) => Some(e),
            GpuError::Device(e) => Some(e),
            GpuError::Memory(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for ConfigError {}
impl std::error::Error for DeviceError {}
impl std::error::Error for MemoryError {}

// 实现 From trait 以便于错误转换
impl From<std::io::Error> for GpuError {
    fn from(err: std::io::Error) -> Self {
        GpuError::Io(err)
    }
}

impl From<ConfigError> for GpuError {
    fn from(err: ConfigError) -> Self {
        GpuError::Config(err)
    }
}

impl From<DeviceError> for GpuError {
    fn from(err: DeviceError) -> Self {
        GpuError::Device(err)
    }
}

impl From<MemoryError> for GpuError {
    fn from(err: MemoryError) -> Self {
        GpuError::Memory(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err: GpuError = MemoryError::Exhausted { size: 64, align: 256 }.into();
        assert_eq!(err.to_string(), "Memory error: No room for 64 bytes aligned to 256");

        let err = GpuError::call("CreateHeap", "E_OUTOFMEMORY");
        assert_eq!(err.to_string(), "Device error: CreateHeap failed: E_OUTOFMEMORY");
    }

    #[test]
    fn test_error_source() {
        use std::error::Error;

        let err: GpuError = std::io::Error::new(std::io::ErrorKind::NotFound, "missing").into();
        assert!(err.source().is_some());
        assert!(GpuError::Log("x".into()).source().is_none());
    }
}

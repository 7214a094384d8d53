//! 配置管理模块
//!
//! 提供 GPU 核心配置的加载、解析和管理功能。
//! 支持从 TOML 配置文件加载，也支持命令行参数覆盖。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [device]
//! backend = "soft"          # 或 "dx12"
//! debug_layer = true
//! soft_budget = 268435456
//!
//! [memory]
//! upload_ring = 1048576
//! texture_max = 33554432
//!
//! [residency]
//! over_budget = "proceed"   # 或 "skip_execution"
//! create_heaps_not_resident = true
//!
//! [submission]
//! capture_timeout_ms = 2000
//!
//! [cache]
//! pipeline_cache = "pipeline.cache"
//!
//! [logging]
//! level = "info"            # trace, debug, info, warn, error
//! file_output = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{ConfigError, Result};

const MEG: u64 = 1024 * 1024;

/// 核心配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 设备配置
    #[serde(default)]
    pub device: DeviceConfig,

    /// 分配器大小
    #[serde(default)]
    pub memory: MemoryConfig,

    /// 驻留策略
    #[serde(default)]
    pub residency: ResidencyConfig,

    /// 提交相关
    #[serde(default)]
    pub submission: SubmissionConfig,

    /// 管线缓存
    #[serde(default)]
    pub cache: CacheConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 设备配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// 后端选择
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// 是否启用 D3D12 调试层
    #[serde(default = "default_debug_layer")]
    pub debug_layer: bool,

    /// 软件设备的显存预算（字节）
    #[serde(default = "default_soft_budget")]
    pub soft_budget: u64,
}

/// 后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 软件模拟设备
    Soft,
    /// DirectX 12
    Dx12,
}

/// 各分配器的初始与最大大小（字节）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_one_meg")]
    pub upload_ring: u64,
    #[serde(default = "default_one_meg")]
    pub readback_ring: u64,
    #[serde(default = "default_one_meg")]
    pub dynamic_buffer_ring: u64,
    #[serde(default = "default_one_meg")]
    pub static_buffer_initial: u64,
    #[serde(default = "default_static_buffer_max")]
    pub static_buffer_max: u64,
    #[serde(default = "default_texture_initial")]
    pub texture_initial: u64,
    #[serde(default = "default_texture_max")]
    pub texture_max: u64,
    #[serde(default = "default_target_initial")]
    pub target_initial: u64,
    #[serde(default = "default_target_max")]
    pub target_max: u64,
}

/// 驻留配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResidencyConfig {
    /// 驱逐后仍超出预算时的处理方式
    #[serde(default)]
    pub over_budget: OverBudgetPolicy,

    /// 驱动支持时，以非驻留方式创建堆
    #[serde(default = "default_not_resident")]
    pub create_heaps_not_resident: bool,
}

/// 超出显存预算时的提交策略
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverBudgetPolicy {
    /// 记录失败并照常执行
    #[default]
    Proceed,
    /// 不执行这一批命令列表（栅栏仍会发出，等待者不会卡死）
    SkipExecution,
}

/// 提交配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    /// 跨线程读回 GPU 数据时的最长等待（毫秒）
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_ms: u64,
}

/// 管线缓存配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    /// 缓存文件路径，为空则不持久化
    #[serde(default)]
    pub pipeline_cache: Option<String>,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    /// 是否输出到文件
    #[serde(default = "default_file_output")]
    pub file_output: bool,

    /// 日志文件路径
    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// 默认值函数
fn default_backend() -> BackendKind {
    if cfg!(target_os = "windows") { BackendKind::Dx12 } else { BackendKind::Soft }
}
fn default_debug_layer() -> bool { cfg!(debug_assertions) }
fn default_soft_budget() -> u64 { 256 * MEG }
fn default_one_meg() -> u64 { MEG }
fn default_static_buffer_max() -> u64 { 8 * MEG }
fn default_texture_initial() -> u64 { 4 * MEG }
fn default_texture_max() -> u64 { 32 * MEG }
fn default_target_initial() -> u64 { 16 * MEG }
fn default_target_max() -> u64 { 128 * MEG }
fn default_not_resident() -> bool { true }
fn default_capture_timeout() -> u64 { 2000 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { false }
fn default_log_file() -> String { "dist_gpu.log".to_string() }

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            debug_layer: default_debug_layer(),
            soft_budget: default_soft_budget(),
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            upload_ring: default_one_meg(),
            readback_ring: default_one_meg(),
            dynamic_buffer_ring: default_one_meg(),
            static_buffer_initial: default_one_meg(),
            static_buffer_max: default_static_buffer_max(),
            texture_initial: default_texture_initial(),
            texture_max: default_texture_max(),
            target_initial: default_target_initial(),
            target_max: default_target_max(),
        }
    }
}

impl Default for ResidencyConfig {
    fn default() -> Self {
        Self {
            over_budget: OverBudgetPolicy::default(),
            create_heaps_not_resident: default_not_resident(),
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self { capture_timeout_ms: default_capture_timeout() }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_file: default_log_file(),
        }
    }
}

impl Config {
    /// 从配置文件加载
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在或无法解析则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 从命令行参数覆盖配置
    ///
    /// 支持的参数：
    /// - `--dx12` / `--soft`: 选择后端
    /// - `--budget <bytes>`: 软件设备显存预算
    /// - `--log-level <level>`: 日志级别
    /// - `--skip-over-budget`: 超预算时跳过执行
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        if args.iter().any(|a| a == "--dx12") {
            self.device.backend = BackendKind::Dx12;
        }

        if args.iter().any(|a| a == "--soft") {
            self.device.backend = BackendKind::Soft;
        }

        if args.iter().any(|a| a == "--skip-over-budget") {
            self.residency.over_budget = OverBudgetPolicy::SkipExecution;
        }

        if let Some(budget) = arg_value(&args, "--budget").and_then(|v| v.parse().ok()) {
            self.device.soft_budget = budget;
        }

        if let Some(value) = arg_value(&args, "--log-level") {
            match LogLevel::parse(value) {
                Some(level) => self.logging.level = level,
                None => tracing::warn!(value, "Ignoring unknown log level"),
            }
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        let m = &self.memory;
        let pairs = [
            ("memory.static_buffer", m.static_buffer_initial, m.static_buffer_max),
            ("memory.texture", m.texture_initial, m.texture_max),
            ("memory.target", m.target_initial, m.target_max),
        ];

        for (field, initial, max) in pairs {
            if initial == 0 || max < initial {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("initial size {} must be non-zero and <= max {}", initial, max),
                }.into());
            }
        }

        for (field, size) in [
            ("memory.upload_ring", m.upload_ring),
            ("memory.readback_ring", m.readback_ring),
            ("memory.dynamic_buffer_ring", m.dynamic_buffer_ring),
        ] {
            if size == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "Ring size must be greater than 0".to_string(),
                }.into());
            }
        }

        if self.device.backend == BackendKind::Dx12 && !cfg!(target_os = "windows") {
            return Err(ConfigError::InvalidValue {
                field: "device.backend".to_string(),
                reason: "DirectX 12 is only available on Windows".to_string(),
            }.into());
        }

        Ok(())
    }
}

fn arg_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|idx| args.get(idx + 1))
        .map(String::as_str)
}

impl LogLevel {
    /// 解析小写的级别名称
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "trace" => Some(LogLevel::Trace),
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

impl BackendKind {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Soft => "Software",
            BackendKind::Dx12 => "DirectX 12",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.memory.upload_ring, MEG);
        assert_eq!(config.memory.target_max, 128 * MEG);
        assert_eq!(config.residency.over_budget, OverBudgetPolicy::Proceed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.device.backend = BackendKind::Soft;
        assert!(config.validate().is_ok());

        config.memory.texture_max = config.memory.texture_initial - 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            "[residency]\nover_budget = \"skip_execution\"\n[device]\nbackend = \"soft\"\n",
        ).unwrap();
        assert_eq!(config.residency.over_budget, OverBudgetPolicy::SkipExecution);
        assert_eq!(config.device.backend, BackendKind::Soft);
        assert_eq!(config.memory.texture_initial, 4 * MEG);
        assert!(config.residency.create_heaps_not_resident);
    }

    #[test]
    fn test_apply_args() {
        let mut config = Config::default();
        config.apply_args(["app", "--soft", "--budget", "4096", "--log-level", "debug", "--skip-over-budget"]);
        assert_eq!(config.device.backend, BackendKind::Soft);
        assert_eq!(config.device.soft_budget, 4096);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.residency.over_budget, OverBudgetPolicy::SkipExecution);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.device.backend = BackendKind::Soft;
        config.memory.static_buffer_max = 16 * MEG;
        config.save_to_file(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.memory.static_buffer_max, 16 * MEG);
        assert_eq!(loaded.device.backend, BackendKind::Soft);
    }
}

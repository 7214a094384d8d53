//! 日志系统模块
//!
//! 基于 `tracing` 提供结构化的日志记录功能。
//!
//! # 日志目标
//!
//! - `dist_gpu::device`：设备创建、设备丢失与重置
//! - `dist_gpu::residency`：驻留与驱逐
//! - 其余模块直接使用 `tracing` 宏，目标为模块路径
//!
//! # 使用示例
//!
//! ```no_run
//! use dist_gpu::core::{log, config::LogLevel};
//!
//! log::init_logger(LogLevel::Info, false, None);
//! tracing::info!(budget = 1024, "Video memory budget");
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    prelude::*,
    EnvFilter,
};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use std::path::Path;

use super::config::LogLevel;

const DEFAULT_LOG_FILE: &str = "dist_gpu.log";

/// 初始化日志系统
///
/// 必须在程序开始时调用一次。`RUST_LOG` 环境变量优先于 `level`。
///
/// # 参数
///
/// * `level` - 日志级别
/// * `file_output` - 是否输出到文件
/// * `log_file_path` - 日志文件路径（可选，默认为 "dist_gpu.log"）
pub fn init_logger(level: LogLevel, file_output: bool, log_file_path: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter()));

    if file_output {
        let log_path = log_file_path.unwrap_or(DEFAULT_LOG_FILE);
        let path = Path::new(log_path);
        let directory = path.parent().unwrap_or(Path::new("."));
        let filename = path.file_name()
            .and_then(|s| s.to_str())
            .unwrap_or(DEFAULT_LOG_FILE);

        // 每天滚动
        let file_appender = RollingFileAppender::new(Rotation::DAILY, directory, filename);

        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(true);

        let file_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .init();
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(true);

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .init();
    }
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// 设备日志 - Info 级别
#[macro_export]
macro_rules! device_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "dist_gpu::device", $($arg)*)
    };
}

/// 设备日志 - Warn 级别
#[macro_export]
macro_rules! device_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "dist_gpu::device", $($arg)*)
    };
}

/// 设备日志 - Error 级别
#[macro_export]
macro_rules! device_error {
    ($($arg:tt)*) => {
        tracing::error!(target: "dist_gpu::device", $($arg)*)
    };
}

/// 驻留日志 - Info 级别
#[macro_export]
macro_rules! residency_info {
    ($($arg:tt)*) => {
        tracing::info!(target: "dist_gpu::residency", $($arg)*)
    };
}

/// 驻留日志 - Warn 级别
#[macro_export]
macro_rules! residency_warn {
    ($($arg:tt)*) => {
        tracing::warn!(target: "dist_gpu::residency", $($arg)*)
    };
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

/// 性能追踪宏
///
/// ```no_run
/// fn make_resident() {
///     let _span = dist_gpu::span_trace!("make_resident").entered();
/// }
/// ```
#[macro_export]
macro_rules! span_trace {
    ($name:expr) => {
        tracing::span!(tracing::Level::TRACE, $name)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(LogLevel::Debug.as_filter(), "debug");
    }
}

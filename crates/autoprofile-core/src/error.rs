//! 错误分类（对外暴露）
//!
//! - `ProfilerError`：派发引擎之前或数据加载过程中的错误。
//! - `EngineFailure`：单个引擎运行失败，只影响该引擎的结果，不会中断整次运行。
//! - `ConfigError`：配置文件读取/解析/校验失败。
use std::path::PathBuf;

use thiserror::Error;

use crate::delimiter::Delimiter;

pub type Result<T> = std::result::Result<T, ProfilerError>;

#[derive(Debug, Error)]
pub enum ProfilerError {
    /// 输入文件不存在、不可读或超出大小上限
    #[error("input error: {}: {reason}", .path.display())]
    Input { path: PathBuf, reason: String },

    /// 输出根目录无法创建或不可写
    #[error("output error: {}: {reason}", .path.display())]
    Output { path: PathBuf, reason: String },

    /// 零字节或没有任何非空行
    #[error("input is empty: {}", .0.display())]
    EmptyInput(PathBuf),

    /// 最佳候选分隔符的置信度低于阈值，需要调用方显式指定
    #[error("ambiguous delimiter: best guess {best_guess} scored {confidence:.2}, below threshold {threshold:.2}")]
    AmbiguousDelimiter { best_guess: Delimiter, confidence: f64, threshold: f64 },

    /// 解析失败（或畸形行比例超过阈值）
    #[error("file processing failed{}: {message}", line_context(.line))]
    FileProcessing { line: Option<u64>, message: String },

    /// 分块加载时进程内存超过上限；不返回任何部分结果
    #[error("memory usage {used} bytes exceeded limit {limit} bytes after {rows_read} rows")]
    MemoryExceeded { used: u64, limit: u64, rows_read: usize },

    /// 加载过程中收到取消信号；已读的行全部丢弃
    #[error("load cancelled after {rows_read} rows")]
    Cancelled { rows_read: usize },

    #[error("engine `{id}` unavailable: {reason}")]
    EngineUnavailable { id: String, reason: String },

    #[error("invalid delimiter {value:?}: {reason}")]
    InvalidDelimiter { value: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProfilerError {
    /// 是否属于"派发前致命"错误（整次运行中止）
    pub fn aborts_run(&self) -> bool {
        matches!(
            self,
            ProfilerError::Input { .. }
                | ProfilerError::Output { .. }
                | ProfilerError::EmptyInput(_)
                | ProfilerError::AmbiguousDelimiter { .. }
                | ProfilerError::InvalidDelimiter { .. }
                | ProfilerError::Config(_)
        )
    }
}

fn line_context(line: &Option<u64>) -> String {
    match line {
        Some(l) => format!(" at line {l}"),
        None => String::new(),
    }
}

/// 单个引擎的运行失败
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineFailure {
    #[error("failed to launch engine: {0}")]
    Launch(String),

    #[error("engine exited with {}: {detail}", exit_label(.code))]
    Exit { code: Option<i32>, detail: String },

    #[error("engine raised an error: {0}")]
    Raised(String),

    #[error("engine was cancelled")]
    Cancelled,
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("status {c}"),
        None => "no status (killed by signal)".to_string(),
    }
}

impl From<std::io::Error> for EngineFailure {
    fn from(e: std::io::Error) -> Self {
        EngineFailure::Raised(e.to_string())
    }
}

impl From<ProfilerError> for EngineFailure {
    fn from(e: ProfilerError) -> Self {
        match e {
            ProfilerError::Cancelled { .. } => EngineFailure::Cancelled,
            other => EngineFailure::Raised(other.to_string()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid { key: key.to_string(), reason: reason.into() }
    }
}

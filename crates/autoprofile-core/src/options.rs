//! 运行选项与执行请求（模块）
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::delimiter::{Delimiter, DetectOptions};
use crate::error::ConfigError;
use crate::loader::LoadOptions;
use crate::settings::Settings;

const MIB: u64 = 1024 * 1024;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// 协调器调度参数
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOptions {
    /// 并行 worker 上限；实际 worker 数 = min(引擎数, 上限)
    pub max_workers: usize,
    /// 单引擎默认超时（描述符未指定时使用）
    pub engine_timeout: Duration,
    /// 全局截止时间（相对运行开始）；None 表示不限
    pub global_deadline: Option<Duration>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().max(1),
            engine_timeout: Duration::from_secs(3600),
            global_deadline: None,
        }
    }
}

/// 参数上限（校验用）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationLimits {
    pub max_chunk_size: usize,
    pub max_memory_limit_bytes: u64,
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self { max_chunk_size: 100_000, max_memory_limit_bytes: 32 * 1024 * MIB }
    }
}

impl ValidationLimits {
    /// 校验分块大小与内存上限
    pub fn check(&self, limits: &ResourceLimits) -> Result<(), ConfigError> {
        if limits.chunk_size_rows == 0 {
            return Err(ConfigError::invalid("performance.chunk_size", "must be positive"));
        }
        if limits.chunk_size_rows > self.max_chunk_size {
            return Err(ConfigError::invalid(
                "performance.chunk_size",
                format!("{} exceeds maximum of {} rows", limits.chunk_size_rows, self.max_chunk_size),
            ));
        }
        if limits.memory_limit_bytes == 0 {
            return Err(ConfigError::invalid("performance.memory_limit_gb", "must be positive"));
        }
        if limits.memory_limit_bytes > self.max_memory_limit_bytes {
            return Err(ConfigError::invalid(
                "performance.memory_limit_gb",
                format!("{} bytes exceeds maximum of {} bytes", limits.memory_limit_bytes, self.max_memory_limit_bytes),
            ));
        }
        Ok(())
    }
}

/// 完整配置（由 Settings 解析得到）
#[derive(Debug, Clone)]
pub struct ProfilerConfig {
    pub load: LoadOptions,
    pub detect: DetectOptions,
    pub execution: ExecutionOptions,
    pub limits: ValidationLimits,
    /// 输入文件大小上限（字节）
    pub max_file_size_bytes: u64,
    /// 外部引擎入口脚本的相对根目录
    pub engines_root: PathBuf,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            load: LoadOptions::default(),
            detect: DetectOptions::default(),
            execution: ExecutionOptions::default(),
            limits: ValidationLimits::default(),
            max_file_size_bytes: 500 * MIB,
            engines_root: PathBuf::from("."),
        }
    }
}

impl ProfilerConfig {
    /// 从配置读取并校验
    pub fn from_settings(s: &Settings) -> Result<Self, ConfigError> {
        let d = Self::default();

        // 1) 校验上限
        let max_memory_gb: f64 = s.get("validation.max_memory_limit_gb", 32.0)?;
        let limits = ValidationLimits {
            max_chunk_size: s.get("validation.max_chunk_size", d.limits.max_chunk_size)?,
            max_memory_limit_bytes: gb_to_bytes("validation.max_memory_limit_gb", max_memory_gb)?,
        };
        if limits.max_chunk_size == 0 {
            return Err(ConfigError::invalid("validation.max_chunk_size", "must be positive"));
        }

        // 2) 加载参数
        let memory_gb: f64 = s.get("performance.memory_limit_gb", 1.0)?;
        let small_mb: f64 = s.get("performance.small_file_threshold_mb", 50.0)?;
        let max_file_mb: f64 = s.get("performance.max_file_size_mb", 500.0)?;
        let load = LoadOptions {
            chunk_size_rows: s.get("performance.chunk_size", d.load.chunk_size_rows)?,
            memory_limit_bytes: gb_to_bytes("performance.memory_limit_gb", memory_gb)?,
            small_file_threshold_bytes: mb_to_bytes("performance.small_file_threshold_mb", small_mb)?,
            max_malformed_ratio: s.get("performance.max_malformed_ratio", d.load.max_malformed_ratio)?,
        };
        limits.check(&ResourceLimits::from(&load))?;
        if !(0.0..=1.0).contains(&load.max_malformed_ratio) {
            return Err(ConfigError::invalid("performance.max_malformed_ratio", "must be between 0 and 1"));
        }

        // 3) 分隔符识别参数
        let candidates: Vec<String> = s.get(
            "delimiter_detection.common_delimiters",
            d.detect.candidates.iter().map(|c| c.as_arg()).collect(),
        )?;
        let candidates = candidates
            .iter()
            .map(|c| {
                Delimiter::parse(c)
                    .map_err(|e| ConfigError::invalid("delimiter_detection.common_delimiters", e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if candidates.is_empty() {
            return Err(ConfigError::invalid("delimiter_detection.common_delimiters", "at least one candidate is required"));
        }
        let detect = DetectOptions {
            sample_lines: s.get("delimiter_detection.sample_lines", d.detect.sample_lines)?,
            candidates,
            confidence_threshold: s.get("delimiter_detection.confidence_threshold", d.detect.confidence_threshold)?,
        };
        if detect.sample_lines == 0 {
            return Err(ConfigError::invalid("delimiter_detection.sample_lines", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&detect.confidence_threshold) {
            return Err(ConfigError::invalid("delimiter_detection.confidence_threshold", "must be between 0 and 1"));
        }

        // 4) 调度参数
        let timeout_secs: u64 = s.get("execution.engine_timeout_secs", d.execution.engine_timeout.as_secs())?;
        let deadline_secs: Option<u64> = s.get("execution.global_deadline_secs", None)?;
        let execution = ExecutionOptions {
            max_workers: s.get("execution.max_workers", d.execution.max_workers)?,
            engine_timeout: Duration::from_secs(timeout_secs),
            global_deadline: deadline_secs.map(Duration::from_secs),
        };
        if execution.max_workers == 0 {
            return Err(ConfigError::invalid("execution.max_workers", "must be at least 1"));
        }
        if timeout_secs == 0 {
            return Err(ConfigError::invalid("execution.engine_timeout_secs", "must be positive"));
        }

        let engines_root: String = s.get("execution.engines_root", ".".to_string())?;

        Ok(Self {
            load,
            detect,
            execution,
            limits,
            max_file_size_bytes: mb_to_bytes("performance.max_file_size_mb", max_file_mb)?,
            engines_root: PathBuf::from(engines_root),
        })
    }
}

fn gb_to_bytes(key: &str, gb: f64) -> Result<u64, ConfigError> {
    if !(gb > 0.0 && gb.is_finite()) {
        return Err(ConfigError::invalid(key, "must be positive"));
    }
    Ok((gb * GIB) as u64)
}

fn mb_to_bytes(key: &str, mb: f64) -> Result<u64, ConfigError> {
    if !(mb >= 0.0 && mb.is_finite()) {
        return Err(ConfigError::invalid(key, "must not be negative"));
    }
    Ok((mb * MIB as f64) as u64)
}

/// 单引擎的分块/内存参数（随调用交给引擎）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub chunk_size_rows: usize,
    pub memory_limit_bytes: u64,
}

impl From<&LoadOptions> for ResourceLimits {
    fn from(o: &LoadOptions) -> Self {
        Self { chunk_size_rows: o.chunk_size_rows, memory_limit_bytes: o.memory_limit_bytes }
    }
}

/// 一次运行的执行请求
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub dataset: PathBuf,
    pub delimiter: Delimiter,
    pub output_root: PathBuf,
    /// 选中的引擎 id（顺序即报告顺序）
    pub engines: Vec<String>,
    pub limits: ResourceLimits,
    /// 按引擎 id 覆盖分块/内存参数
    pub overrides: BTreeMap<String, ResourceLimits>,
}

impl ExecutionRequest {
    pub fn limits_for(&self, engine_id: &str) -> ResourceLimits {
        self.overrides.get(engine_id).copied().unwrap_or(self.limits)
    }

    /// 引擎的私有输出子目录
    pub fn output_dir_for(&self, engine_id: &str) -> PathBuf {
        self.output_root.join(engine_id)
    }
}

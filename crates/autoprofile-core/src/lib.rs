//! 多引擎 CSV 剖析编排库
//!
//! 设计要点：
//! - 分隔符识别基于前若干行的字段数一致性；低于阈值时拒绝猜测，由调用方显式指定。
//! - 数据集加载按文件大小在整读与分块之间切换，分块时监控进程内存，超限整体失败。
//! - 引擎是独立的工作单元，只通过文件系统交互（数据集路径、分隔符、私有输出目录）；
//!   单个引擎的失败、超时或不可用只影响该引擎的结果。
//! - 报告顺序与选择顺序一致，与并行完成顺序无关。

mod coordinator;
mod delimiter;
mod descriptor;
mod engine;
mod error;
mod loader;
mod memory;
mod options;
mod orchestrator;
mod outcome;
mod registry;
mod report;
mod settings;
mod summary;
mod validation;

pub use coordinator::ExecutionCoordinator;
pub use delimiter::{detect, Delimiter, DetectOptions, Detection};
pub use descriptor::{
    builtin_descriptors, descriptors_from_settings, validate_engine_id, Builtin, Capabilities, EngineDescriptor,
    EntryPoint, Runtime,
};
pub use engine::{CancelFlag, Engine, EngineJob, EngineReport, ProcessEngine, SummaryEngine, ENGINE_LOG};
pub use error::{ConfigError, EngineFailure, ProfilerError, Result};
pub use loader::{DatasetLoader, LoadOptions, LoadedTable, ParseWarning, SizeClass, Table};
pub use memory::{default_probe, MemoryProbe, ProcStatusProbe};
pub use options::{ExecutionOptions, ExecutionRequest, ProfilerConfig, ResourceLimits, ValidationLimits};
pub use orchestrator::{ProfileRequest, ProfileRun, Profiler, SUMMARY_FILE};
pub use outcome::{ExecutionOutcome, OutcomeStatus};
pub use registry::{DefaultResolver, EngineRegistry, EngineStatus, ResolutionState, Resolver};
pub use report::{aggregate, write_manifest, AggregatedReport, DatasetHandle, RunStatus, StatusCounts, MANIFEST_FILE};
pub use settings::{Settings, ENV_PREFIX};
pub use summary::{ColumnSummary, DatasetSummary};
pub use validation::{default_output_root, prepare_output_root, validate_input};

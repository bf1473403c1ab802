//! 一次完整的剖析运行
//!
//! 流程：
//! 1) 校验输入文件
//! 2) 识别分隔符（或使用调用方指定的分隔符）
//! 3) 准备输出根目录
//! 4) 可选：编排器自身加载数据集并写出 `summary.json`（失败只告警）
//! 5) 调度选中的引擎
//! 6) 汇总并写出 `manifest.json`
//!
//! 1)–3) 的任何错误都在派发前中止整次运行。
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::coordinator::ExecutionCoordinator;
use crate::delimiter::{self, Delimiter, Detection};
use crate::descriptor::descriptors_from_settings;
use crate::error::Result;
use crate::loader::DatasetLoader;
use crate::options::{ExecutionRequest, ProfilerConfig, ResourceLimits};
use crate::registry::{DefaultResolver, EngineRegistry};
use crate::report::{aggregate, write_manifest, AggregatedReport, DatasetHandle};
use crate::settings::Settings;
use crate::summary::DatasetSummary;
use crate::validation::{prepare_output_root, validate_input};

/// 数据集概要文件名（位于输出根目录）
pub const SUMMARY_FILE: &str = "summary.json";

/// 调用方提交的运行请求
#[derive(Debug, Clone, Default)]
pub struct ProfileRequest {
    pub input: PathBuf,
    /// None 时使用 `<输入目录>/<文件名>/`
    pub output_root: Option<PathBuf>,
    /// 空表示全部引擎
    pub engines: Vec<String>,
    /// 显式分隔符，跳过识别
    pub delimiter: Option<Delimiter>,
    pub max_workers: Option<usize>,
    pub global_deadline: Option<Duration>,
    /// 写出编排器自身的数据集概要
    pub summarize: bool,
    /// 按引擎覆盖分块/内存参数
    pub overrides: BTreeMap<String, ResourceLimits>,
}

/// 一次运行的结果
#[derive(Debug, Clone)]
pub struct ProfileRun {
    pub dataset: DatasetHandle,
    pub output_root: PathBuf,
    pub report: AggregatedReport,
    pub summary: Option<DatasetSummary>,
    pub manifest: PathBuf,
    pub elapsed: Duration,
}

pub struct Profiler {
    config: ProfilerConfig,
    registry: Arc<EngineRegistry>,
}

impl Profiler {
    pub fn new(config: ProfilerConfig, registry: Arc<EngineRegistry>) -> Self {
        Self { config, registry }
    }

    /// 由配置构建：校验参数、合并引擎表、使用默认解析器
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let config = ProfilerConfig::from_settings(settings)?;
        let descriptors = descriptors_from_settings(settings, config.execution.engine_timeout)?;
        let resolver = DefaultResolver::new(config.engines_root.clone(), config.load);
        let registry = EngineRegistry::new(descriptors, Box::new(resolver));
        Ok(Self::new(config, Arc::new(registry)))
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    /// 选择顺序：空请求取整张表；重复 id 只保留第一次出现。未知 id 保留，稍后记为 Unavailable。
    pub fn select_engines(&self, requested: &[String]) -> Vec<String> {
        if requested.is_empty() {
            return self.registry.ids();
        }
        let mut seen = std::collections::HashSet::new();
        requested.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
    }

    /// 校验输入并识别分隔符
    pub fn detect(&self, input: &Path) -> Result<Detection> {
        validate_input(input, self.config.max_file_size_bytes)?;
        delimiter::detect(input, &self.config.detect)
    }

    pub fn profile(&self, req: &ProfileRequest) -> Result<ProfileRun> {
        let started = Instant::now();

        // 1) 输入
        let size_bytes = validate_input(&req.input, self.config.max_file_size_bytes)?;

        // 2) 分隔符
        let (delimiter, confidence) = match req.delimiter {
            Some(d) => {
                info!(delimiter = %d, "using caller-supplied delimiter");
                (d, 1.0)
            }
            None => {
                let det = delimiter::detect(&req.input, &self.config.detect)?;
                info!(delimiter = %det.delimiter, confidence = det.confidence, "delimiter detected");
                (det.delimiter, det.confidence)
            }
        };

        // 覆盖参数同样受上限约束
        for limits in req.overrides.values() {
            self.config.limits.check(limits)?;
        }

        // 3) 输出目录
        let output_root = prepare_output_root(&req.input, req.output_root.as_deref())?;
        let dataset = DatasetHandle {
            path: req.input.clone(),
            delimiter,
            confidence,
            size_bytes,
            size_class: self.config.load.size_class(size_bytes),
        };
        let engines = self.select_engines(&req.engines);
        info!(
            input = %req.input.display(),
            output = %output_root.display(),
            engines = ?engines,
            "profiling run started"
        );

        // 4) 数据集概要
        let summary = if req.summarize { self.summarize(&dataset, &output_root) } else { None };

        // 5) 调度
        let mut execution = self.config.execution.clone();
        if let Some(w) = req.max_workers {
            execution.max_workers = w.max(1);
        }
        if req.global_deadline.is_some() {
            execution.global_deadline = req.global_deadline;
        }
        let request = ExecutionRequest {
            dataset: dataset.path.clone(),
            delimiter,
            output_root: output_root.clone(),
            engines: engines.clone(),
            limits: ResourceLimits::from(&self.config.load),
            overrides: req.overrides.clone(),
        };
        let outcomes = ExecutionCoordinator::new(Arc::clone(&self.registry), execution).run(&request);

        // 6) 汇总
        let report = aggregate(&engines, outcomes);
        let manifest = write_manifest(&output_root, &dataset, &report)?;
        let elapsed = started.elapsed();
        let counts = report.counts();
        info!(
            status = ?report.status(),
            succeeded = counts.succeeded,
            failed = counts.failed,
            unavailable = counts.unavailable,
            timed_out = counts.timed_out,
            elapsed_ms = elapsed.as_millis() as u64,
            "profiling run finished"
        );
        Ok(ProfileRun { dataset, output_root, report, summary, manifest, elapsed })
    }

    /// 加载失败（内存超限、畸形行过多等）只影响概要本身
    fn summarize(&self, dataset: &DatasetHandle, output_root: &Path) -> Option<DatasetSummary> {
        let loaded = match DatasetLoader::new(self.config.load).load(&dataset.path, dataset.delimiter) {
            Ok(l) => l,
            Err(e) => {
                warn!(error = %e, "dataset summary skipped");
                return None;
            }
        };
        let summary = DatasetSummary::from_loaded(&loaded);
        let path = output_root.join(SUMMARY_FILE);
        let written = serde_json::to_vec_pretty(&summary)
            .map_err(std::io::Error::from)
            .and_then(|json| std::fs::write(&path, json));
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "cannot write dataset summary");
        }
        Some(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delimiter::DetectOptions;
    use crate::descriptor::builtin_descriptors;
    use crate::engine::SummaryEngine;
    use crate::error::ProfilerError;
    use crate::loader::LoadOptions;
    use crate::outcome::OutcomeStatus;
    use crate::report::{RunStatus, MANIFEST_FILE};

    /// 内置引擎表 + 空搜索路径：只有进程内 summary 引擎可用
    fn profiler(config: ProfilerConfig) -> Profiler {
        let resolver = DefaultResolver::new(PathBuf::from("."), LoadOptions::default()).with_search_path(None);
        let registry = EngineRegistry::new(builtin_descriptors(Duration::from_secs(60)), Box::new(resolver));
        Profiler::new(config, Arc::new(registry))
    }

    fn write_input(dir: &Path, name: &str, body: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, body).unwrap();
        p
    }

    #[test]
    fn semicolon_dataset_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "sales.csv", "region;units;price\nnorth;3;9.5\nsouth;7;4.25\n");
        let p = profiler(ProfilerConfig::default());
        let run = p
            .profile(&ProfileRequest {
                input: input.clone(),
                engines: vec!["summary".into(), "ydata".into()],
                summarize: true,
                ..ProfileRequest::default()
            })
            .unwrap();

        assert_eq!(run.dataset.delimiter, Delimiter::SEMICOLON);
        assert_eq!(run.dataset.confidence, 1.0);
        assert_eq!(run.output_root, dir.path().join("sales"));
        assert_eq!(run.report.status(), RunStatus::PartialFailure);
        let statuses: Vec<OutcomeStatus> = run.report.outcomes().iter().map(|o| o.status()).collect();
        assert_eq!(statuses, vec![OutcomeStatus::Succeeded, OutcomeStatus::Unavailable]);
        assert_eq!(
            run.report.outcomes()[0].artifacts(),
            &[run.output_root.join("summary").join(SummaryEngine::ARTIFACT)]
        );

        assert_eq!(run.manifest, run.output_root.join(MANIFEST_FILE));
        assert!(run.output_root.join(SUMMARY_FILE).is_file());
        assert_eq!(run.summary.as_ref().map(|s| s.rows), Some(2));
    }

    #[test]
    fn ambiguous_delimiter_aborts_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "messy.csv", "a,b\nc,d,e\nf,g,h,i\nj,k,l,m,n\n");
        let p = profiler(ProfilerConfig::default());
        let err = p.profile(&ProfileRequest { input, ..ProfileRequest::default() }).unwrap_err();
        assert!(matches!(err, ProfilerError::AmbiguousDelimiter { best_guess, .. } if best_guess == Delimiter::COMMA));
        assert!(err.aborts_run());
        assert!(!dir.path().join("messy").exists());
    }

    #[test]
    fn explicit_delimiter_skips_detection() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "piped.txt", "k|v\n1|2\n3|4\n");
        let config = ProfilerConfig {
            detect: DetectOptions { candidates: vec![Delimiter::COMMA], ..DetectOptions::default() },
            ..ProfilerConfig::default()
        };
        let p = profiler(config);
        assert!(matches!(p.detect(&input), Err(ProfilerError::AmbiguousDelimiter { .. })));

        let out = dir.path().join("reports");
        let run = p
            .profile(&ProfileRequest {
                input,
                output_root: Some(out.clone()),
                engines: vec!["summary".into()],
                delimiter: Some(Delimiter::PIPE),
                ..ProfileRequest::default()
            })
            .unwrap();
        assert_eq!(run.output_root, out);
        assert_eq!(run.dataset.confidence, 1.0);
        assert_eq!(run.report.status(), RunStatus::Succeeded);
        assert!(run.summary.is_none());
    }

    #[test]
    fn all_engines_selected_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "d.csv", "a,b\n1,2\n");
        let p = profiler(ProfilerConfig::default());
        let run = p.profile(&ProfileRequest { input, max_workers: Some(4), ..ProfileRequest::default() }).unwrap();
        let ids: Vec<&str> = run.report.outcomes().iter().map(|o| o.engine_id()).collect();
        assert_eq!(ids, vec!["summary", "ydata", "sweetviz", "dataprep"]);
        assert_eq!(run.report.counts().unavailable, 3);
        assert_eq!(run.report.status(), RunStatus::PartialFailure);
    }

    #[test]
    fn only_unavailable_engines_is_total_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "d.csv", "a,b\n1,2\n");
        let p = profiler(ProfilerConfig::default());
        let run = p
            .profile(&ProfileRequest {
                input,
                engines: vec!["sweetviz".into(), "nope".into()],
                ..ProfileRequest::default()
            })
            .unwrap();
        assert_eq!(run.report.status(), RunStatus::TotalFailure);
        assert_eq!(run.report.outcomes().len(), 2);
        assert!(run.manifest.is_file());
    }

    #[test]
    fn selection_drops_duplicates_and_keeps_order() {
        let p = profiler(ProfilerConfig::default());
        let picked = p.select_engines(&["ydata".into(), "summary".into(), "ydata".into()]);
        assert_eq!(picked, vec!["ydata".to_string(), "summary".to_string()]);
    }

    #[test]
    fn oversized_override_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "d.csv", "a,b\n1,2\n");
        let p = profiler(ProfilerConfig::default());
        let mut overrides = BTreeMap::new();
        overrides.insert("summary".to_string(), ResourceLimits { chunk_size_rows: 1_000_000, memory_limit_bytes: 1024 });
        let err = p.profile(&ProfileRequest { input, overrides, ..ProfileRequest::default() }).unwrap_err();
        assert!(matches!(err, ProfilerError::Config(_)));
    }
}

//! 结果汇总与清单输出
//!
//! 稳定性保证：无论并行完成顺序如何，报告始终按调用方的选择顺序排列。
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::delimiter::Delimiter;
use crate::loader::SizeClass;
use crate::outcome::{ExecutionOutcome, OutcomeStatus};

/// 清单文件名（位于输出根目录）
pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    /// 全部引擎成功
    Succeeded,
    /// 至少一个成功，至少一个未成功
    PartialFailure,
    /// 没有任何成功（包括全部不可用）
    TotalFailure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub succeeded: usize,
    pub failed: usize,
    pub unavailable: usize,
    pub timed_out: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.unavailable + self.timed_out
    }
}

/// 一次运行的汇总报告（组装后不再修改）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedReport {
    outcomes: Vec<ExecutionOutcome>,
    counts: StatusCounts,
    status: RunStatus,
}

impl AggregatedReport {
    pub fn outcomes(&self) -> &[ExecutionOutcome] {
        &self.outcomes
    }

    pub fn counts(&self) -> StatusCounts {
        self.counts
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }
}

/// 按选择顺序重排并统计
///
/// 每个选中的 id 恰好对应一个结果：重复的结果只保留第一个，缺失的补为 Failed，
/// 不在选择列表中的结果被丢弃。
pub fn aggregate(selection: &[String], outcomes: Vec<ExecutionOutcome>) -> AggregatedReport {
    let mut by_id: HashMap<String, ExecutionOutcome> = HashMap::with_capacity(outcomes.len());
    for o in outcomes {
        by_id.entry(o.engine_id().to_string()).or_insert(o);
    }

    let mut ordered = Vec::with_capacity(selection.len());
    let mut counts = StatusCounts::default();
    for id in selection {
        let outcome = by_id
            .remove(id)
            .unwrap_or_else(|| ExecutionOutcome::failed(id.clone(), "no outcome was recorded", Default::default()));
        match outcome.status() {
            OutcomeStatus::Succeeded => counts.succeeded += 1,
            OutcomeStatus::Failed => counts.failed += 1,
            OutcomeStatus::Unavailable => counts.unavailable += 1,
            OutcomeStatus::TimedOut => counts.timed_out += 1,
        }
        ordered.push(outcome);
    }

    let status = if counts.succeeded == 0 {
        RunStatus::TotalFailure
    } else if counts.succeeded == counts.total() {
        RunStatus::Succeeded
    } else {
        RunStatus::PartialFailure
    };
    AggregatedReport { outcomes: ordered, counts, status }
}

/// 数据集句柄（已校验的路径 + 分隔符）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetHandle {
    pub path: PathBuf,
    pub delimiter: Delimiter,
    /// 显式指定分隔符时为 1.0
    pub confidence: f64,
    pub size_bytes: u64,
    pub size_class: SizeClass,
}

#[derive(Serialize)]
struct Manifest<'a> {
    dataset: &'a DatasetHandle,
    status: RunStatus,
    counts: StatusCounts,
    engines: &'a [ExecutionOutcome],
}

/// 写出清单 `<output_root>/manifest.json`
pub fn write_manifest(output_root: &Path, dataset: &DatasetHandle, report: &AggregatedReport) -> std::io::Result<PathBuf> {
    let manifest = Manifest { dataset, status: report.status, counts: report.counts, engines: &report.outcomes };
    let path = output_root.join(MANIFEST_FILE);
    let json = serde_json::to_vec_pretty(&manifest)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn reorders_into_selection_order() {
        let outcomes = vec![
            ExecutionOutcome::timed_out("c", "slow", Duration::from_secs(1)),
            ExecutionOutcome::succeeded("a", Vec::new(), Duration::from_secs(2)),
            ExecutionOutcome::failed("b", "raised", Duration::ZERO),
        ];
        let report = aggregate(&ids(&["a", "b", "c"]), outcomes);
        let order: Vec<&str> = report.outcomes().iter().map(|o| o.engine_id()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(report.counts(), StatusCounts { succeeded: 1, failed: 1, unavailable: 0, timed_out: 1 });
        assert_eq!(report.status(), RunStatus::PartialFailure);
    }

    #[test]
    fn overall_status_rules() {
        let all_ok = aggregate(
            &ids(&["a", "b"]),
            vec![
                ExecutionOutcome::succeeded("b", Vec::new(), Duration::ZERO),
                ExecutionOutcome::succeeded("a", Vec::new(), Duration::ZERO),
            ],
        );
        assert_eq!(all_ok.status(), RunStatus::Succeeded);

        let none_available = aggregate(
            &ids(&["a", "b"]),
            vec![ExecutionOutcome::unavailable("a", "missing"), ExecutionOutcome::unavailable("b", "missing")],
        );
        assert_eq!(none_available.status(), RunStatus::TotalFailure);
        assert_eq!(none_available.counts().unavailable, 2);
    }

    #[test]
    fn exactly_one_outcome_per_selected_engine() {
        let outcomes = vec![
            ExecutionOutcome::succeeded("a", Vec::new(), Duration::ZERO),
            ExecutionOutcome::failed("a", "late duplicate", Duration::ZERO),
            ExecutionOutcome::succeeded("stray", Vec::new(), Duration::ZERO),
        ];
        let report = aggregate(&ids(&["a", "b"]), outcomes);
        assert_eq!(report.outcomes().len(), 2);
        assert!(report.outcomes()[0].is_success());
        assert_eq!(report.outcomes()[1].status(), OutcomeStatus::Failed);
        assert_eq!(report.outcomes()[1].error(), Some("no outcome was recorded"));
    }

    #[test]
    fn manifest_lists_every_engine() {
        let dir = tempfile::tempdir().unwrap();
        let report = aggregate(
            &ids(&["summary", "ydata"]),
            vec![
                ExecutionOutcome::unavailable("ydata", "conda not found"),
                ExecutionOutcome::succeeded("summary", vec![dir.path().join("summary/dataset_summary.json")], Duration::from_millis(1500)),
            ],
        );
        let handle = DatasetHandle {
            path: dir.path().join("data.csv"),
            delimiter: Delimiter::TAB,
            confidence: 1.0,
            size_bytes: 10,
            size_class: SizeClass::Small,
        };
        let path = write_manifest(dir.path(), &handle, &report).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(json["status"], "PartialFailure");
        assert_eq!(json["dataset"]["delimiter"], "\t");
        assert_eq!(json["engines"][0]["engine_id"], "summary");
        assert_eq!(json["engines"][0]["duration_ms"], 1500);
        assert_eq!(json["engines"][1]["status"], "Unavailable");
        assert_eq!(json["engines"][1]["error"], "conda not found");
    }
}

//! 单个引擎的终态结果
use std::path::PathBuf;
use std::time::Duration;

use serde::{Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    Unavailable,
    TimedOut,
}

/// 每个被请求的引擎在一次运行中恰好产生一个；创建后不可变
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionOutcome {
    engine_id: String,
    status: OutcomeStatus,
    artifacts: Vec<PathBuf>,
    error: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    duration: Duration,
}

fn as_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

impl ExecutionOutcome {
    pub fn succeeded(engine_id: impl Into<String>, artifacts: Vec<PathBuf>, duration: Duration) -> Self {
        Self { engine_id: engine_id.into(), status: OutcomeStatus::Succeeded, artifacts, error: None, duration }
    }

    pub fn failed(engine_id: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self::without_artifacts(engine_id, OutcomeStatus::Failed, error, duration)
    }

    pub fn unavailable(engine_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::without_artifacts(engine_id, OutcomeStatus::Unavailable, error, Duration::ZERO)
    }

    pub fn timed_out(engine_id: impl Into<String>, error: impl Into<String>, duration: Duration) -> Self {
        Self::without_artifacts(engine_id, OutcomeStatus::TimedOut, error, duration)
    }

    fn without_artifacts(engine_id: impl Into<String>, status: OutcomeStatus, error: impl Into<String>, duration: Duration) -> Self {
        Self { engine_id: engine_id.into(), status, artifacts: Vec::new(), error: Some(error.into()), duration }
    }

    pub fn engine_id(&self) -> &str {
        &self.engine_id
    }

    pub fn status(&self) -> OutcomeStatus {
        self.status
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Succeeded
    }
}

//! 引擎契约与两种实现
//!
//! - `ProcessEngine`：外部工具，每次运行一个子进程；与编排器之间只通过文件系统交互
//!   （数据集路径、分隔符字符串、私有输出目录，外加可选的分块行数与内存上限）。
//!   Unix 上子进程自成一个进程组，取消时整组终止，派生出的孙进程不会残留。
//! - `SummaryEngine`：静态链接的进程内引擎，自行重新读取数据集并写出概要 JSON。
use std::ffi::OsString;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use walkdir::WalkDir;

use crate::delimiter::Delimiter;
use crate::descriptor::Capabilities;
use crate::error::EngineFailure;
use crate::loader::{DatasetLoader, LoadOptions};
use crate::options::ResourceLimits;
use crate::summary::DatasetSummary;

/// 外部引擎 stdout/stderr 的落盘文件名（不计入产物）
pub const ENGINE_LOG: &str = "engine.log";
/// 子进程状态轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(25);
/// 失败时附带的日志尾部长度（字节）
const LOG_TAIL_BYTES: u64 = 2048;

/// 取消标记（超时或全局截止时由协调器置位）
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 单个引擎的一次运行所需的全部输入
#[derive(Debug, Clone)]
pub struct EngineJob {
    pub engine_id: String,
    pub dataset: PathBuf,
    pub delimiter: Delimiter,
    pub output_dir: PathBuf,
    pub limits: ResourceLimits,
    pub cancel: CancelFlag,
}

/// 成功运行的产物
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineReport {
    pub artifacts: Vec<PathBuf>,
}

/// 引擎契约
pub trait Engine: Send + Sync {
    fn id(&self) -> &str;

    /// 隔离运行时标识
    fn runtime(&self) -> String;

    /// 运行引擎；只允许写入 `job.output_dir`
    fn run(&self, job: &EngineJob) -> Result<EngineReport, EngineFailure>;
}

/// 外部进程引擎
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    id: String,
    program: PathBuf,
    args: Vec<OsString>,
    capabilities: Capabilities,
}

impl ProcessEngine {
    /// `args` 位于位置参数之前（启动器参数 + 入口脚本）
    pub fn new(id: impl Into<String>, program: PathBuf, args: Vec<OsString>, capabilities: Capabilities) -> Self {
        Self { id: id.into(), program, args, capabilities }
    }

    fn command(&self, job: &EngineJob, log: File) -> std::io::Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(&job.dataset)
            .arg(job.delimiter.as_arg())
            .arg(&job.output_dir);
        if self.capabilities.chunked {
            cmd.arg(job.limits.chunk_size_rows.to_string())
                .arg(job.limits.memory_limit_bytes.to_string());
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        Ok(cmd)
    }
}

/// 终止子进程及其派生的全部进程并回收
fn terminate(child: &mut Child) {
    #[cfg(unix)]
    unsafe {
        // 进程组 id 即子进程 pid（见 `process_group(0)`）
        libc::killpg(child.id() as libc::pid_t, libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}

impl Engine for ProcessEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime(&self) -> String {
        self.program.display().to_string()
    }

    fn run(&self, job: &EngineJob) -> Result<EngineReport, EngineFailure> {
        let log_path = job.output_dir.join(ENGINE_LOG);
        let log = File::create(&log_path)
            .map_err(|e| EngineFailure::Launch(format!("cannot create {}: {e}", log_path.display())))?;
        let mut child = self
            .command(job, log)
            .and_then(|mut cmd| cmd.spawn())
            .map_err(|e| EngineFailure::Launch(format!("{}: {e}", self.program.display())))?;
        debug!(engine = %self.id, pid = child.id(), "engine process spawned");

        loop {
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    return Ok(EngineReport { artifacts: collect_artifacts(&job.output_dir) });
                }
                return Err(EngineFailure::Exit { code: status.code(), detail: log_tail(&log_path) });
            }
            if job.cancel.is_cancelled() {
                terminate(&mut child);
                debug!(engine = %self.id, "engine process group killed");
                return Err(EngineFailure::Cancelled);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

/// 进程内概要引擎
#[derive(Debug, Clone)]
pub struct SummaryEngine {
    id: String,
    load: LoadOptions,
}

impl SummaryEngine {
    pub const ARTIFACT: &'static str = "dataset_summary.json";

    pub fn new(id: impl Into<String>, load: LoadOptions) -> Self {
        Self { id: id.into(), load }
    }
}

impl Engine for SummaryEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn runtime(&self) -> String {
        "linked".to_string()
    }

    fn run(&self, job: &EngineJob) -> Result<EngineReport, EngineFailure> {
        let opts = LoadOptions {
            chunk_size_rows: job.limits.chunk_size_rows,
            memory_limit_bytes: job.limits.memory_limit_bytes,
            ..self.load
        };
        let loaded = DatasetLoader::new(opts)
            .with_cancel(job.cancel.clone())
            .load(&job.dataset, job.delimiter)?;
        if job.cancel.is_cancelled() {
            return Err(EngineFailure::Cancelled);
        }
        let summary = DatasetSummary::from_loaded(&loaded);
        let path = job.output_dir.join(Self::ARTIFACT);
        let json = serde_json::to_vec_pretty(&summary).map_err(|e| EngineFailure::Raised(e.to_string()))?;
        std::fs::write(&path, json)?;
        Ok(EngineReport { artifacts: vec![path] })
    }
}

/// 枚举输出目录下的所有文件（排除日志），按路径排序
pub(crate) fn collect_artifacts(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() != ENGINE_LOG)
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}

/// 读取日志尾部作为失败详情
fn log_tail(path: &Path) -> String {
    let read_tail = || -> std::io::Result<String> {
        let mut f = File::open(path)?;
        let len = f.metadata()?.len();
        f.seek(SeekFrom::Start(len.saturating_sub(LOG_TAIL_BYTES)))?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).trim().to_string())
    };
    match read_tail() {
        Ok(s) if !s.is_empty() => s,
        _ => "no output captured".to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh_engine(script: &str, capabilities: Capabilities) -> ProcessEngine {
        ProcessEngine::new(
            "sh",
            PathBuf::from("/bin/sh"),
            vec!["-c".into(), script.into(), "engine".into()],
            capabilities,
        )
    }

    fn job(dir: &Path) -> EngineJob {
        let dataset = dir.join("data.csv");
        std::fs::write(&dataset, "a;b\n1;2\n").unwrap();
        let output_dir = dir.join("out");
        std::fs::create_dir_all(&output_dir).unwrap();
        EngineJob {
            engine_id: "sh".into(),
            dataset,
            delimiter: Delimiter::SEMICOLON,
            output_dir,
            limits: ResourceLimits { chunk_size_rows: 500, memory_limit_bytes: 4096 },
            cancel: CancelFlag::new(),
        }
    }

    #[test]
    fn positional_handoff_and_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        let engine = sh_engine(
            r#"printf '%s|%s|%s' "$2" "$4" "$5" > "$3/report.txt"; mkdir -p "$3/img"; touch "$3/img/plot.png"; echo done"#,
            Capabilities { chunked: true, interactive: false },
        );
        let report = engine.run(&job).unwrap();
        assert_eq!(
            report.artifacts,
            vec![job.output_dir.join("img").join("plot.png"), job.output_dir.join("report.txt")]
        );
        let written = std::fs::read_to_string(job.output_dir.join("report.txt")).unwrap();
        assert_eq!(written, ";|500|4096");
        let log = std::fs::read_to_string(job.output_dir.join(ENGINE_LOG)).unwrap();
        assert_eq!(log.trim(), "done");
    }

    #[test]
    fn optional_arguments_only_for_chunked_engines() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        let engine = sh_engine(r#"echo "$#" > "$3/argc""#, Capabilities::default());
        engine.run(&job).unwrap();
        let argc = std::fs::read_to_string(job.output_dir.join("argc")).unwrap();
        assert_eq!(argc.trim(), "3");
    }

    #[test]
    fn non_zero_exit_carries_stderr_tail() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        let engine = sh_engine("echo 'ImportError: no module named ydata' >&2; exit 3", Capabilities::default());
        match engine.run(&job) {
            Err(EngineFailure::Exit { code, detail }) => {
                assert_eq!(code, Some(3));
                assert!(detail.contains("ImportError"), "{detail}");
            }
            other => panic!("expected exit failure, got {other:?}"),
        }
    }

    #[test]
    fn cancellation_kills_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        let engine = sh_engine("sleep 30", Capabilities::default());
        let flag = job.cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            flag.cancel();
        });
        let started = Instant::now();
        assert_eq!(engine.run(&job), Err(EngineFailure::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
        canceller.join().unwrap();
    }

    #[test]
    fn cancellation_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        let engine = sh_engine(r#"(sleep 2; echo late > "$3/late.txt") & wait"#, Capabilities::default());
        let flag = job.cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            flag.cancel();
        });
        assert_eq!(engine.run(&job), Err(EngineFailure::Cancelled));
        canceller.join().unwrap();
        std::thread::sleep(Duration::from_secs(3));
        assert!(!job.output_dir.join("late.txt").exists());
    }

    #[test]
    fn missing_program_is_a_launch_failure() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        let engine = ProcessEngine::new("ghost", PathBuf::from("/nonexistent/ghost"), Vec::new(), Capabilities::default());
        assert!(matches!(engine.run(&job), Err(EngineFailure::Launch(_))));
    }

    #[test]
    fn summary_engine_writes_json() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        let engine = SummaryEngine::new("summary", LoadOptions::default());
        let report = engine.run(&job).unwrap();
        assert_eq!(report.artifacts, vec![job.output_dir.join(SummaryEngine::ARTIFACT)]);
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&report.artifacts[0]).unwrap()).unwrap();
        assert_eq!(json["rows"], 1);
        assert_eq!(json["column_names"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn summary_engine_stops_when_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        job.cancel.cancel();
        let engine = SummaryEngine::new("summary", LoadOptions::default());
        assert_eq!(engine.run(&job), Err(EngineFailure::Cancelled));
        assert!(!job.output_dir.join(SummaryEngine::ARTIFACT).exists());
    }
}

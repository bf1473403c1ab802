//! 引擎调度（串行 / 有界并行）
//!
//! - 每个引擎是一个独立的工作单元：一个 worker 从解析、建目录到等待结束全程负责。
//! - 并行路径：后台线程内创建 Rayon 线程池，worker 经 crossbeam 通道把 `(idx, outcome)`
//!   回传给收集端；收集端按 idx 重排，因此结果顺序与选择顺序一致。
//! - 单引擎超时只取消该引擎；全局截止时间到达后收集端不再等待，未完成的引擎记为 TimedOut
//!   并收到取消信号。
//! - 不做自动重试。
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use crossbeam_channel as channel;
use tracing::{debug, info, warn};

use crate::engine::{CancelFlag, EngineJob};
use crate::options::{ExecutionOptions, ExecutionRequest};
use crate::outcome::ExecutionOutcome;
use crate::registry::EngineRegistry;

pub struct ExecutionCoordinator {
    registry: Arc<EngineRegistry>,
    options: ExecutionOptions,
}

impl ExecutionCoordinator {
    pub fn new(registry: Arc<EngineRegistry>, options: ExecutionOptions) -> Self {
        Self { registry, options }
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    /// 实际 worker 数 = min(引擎数, 上限)，至少 1
    pub fn worker_count(&self, engines: usize) -> usize {
        engines.min(self.options.max_workers).max(1)
    }

    /// 运行请求中选中的全部引擎；每个 id 恰好返回一个结果，按选择顺序排列
    pub fn run(&self, request: &ExecutionRequest) -> Vec<ExecutionOutcome> {
        if request.engines.is_empty() {
            return Vec::new();
        }
        let dispatch = Arc::new(Dispatch {
            registry: Arc::clone(&self.registry),
            request: request.clone(),
            deadline: self.options.global_deadline.map(|d| Instant::now() + d),
            cancels: request.engines.iter().map(|_| CancelFlag::new()).collect(),
            started: request.engines.iter().map(|_| OnceLock::new()).collect(),
        });

        let workers = self.worker_count(request.engines.len());
        info!(engines = request.engines.len(), workers, "dispatching engines");
        if workers == 1 {
            return (0..request.engines.len()).map(|idx| dispatch.run_one(idx)).collect();
        }
        run_parallel(dispatch, workers)
    }
}

/// 一次运行中所有 worker 共享的只读上下文
struct Dispatch {
    registry: Arc<EngineRegistry>,
    request: ExecutionRequest,
    deadline: Option<Instant>,
    /// 与 `request.engines` 一一对应
    cancels: Vec<CancelFlag>,
    /// 引擎实际启动的时刻，未启动则为空
    started: Vec<OnceLock<Instant>>,
}

impl Dispatch {
    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// 单个引擎的完整生命周期：解析 → 建目录 → 运行 → 等待（受超时约束）
    fn run_one(&self, idx: usize) -> ExecutionOutcome {
        let id = self.request.engines[idx].as_str();
        let engine = match self.registry.get(id) {
            Ok(e) => e,
            Err(e) => {
                warn!(engine = id, error = %e, "engine unavailable");
                return ExecutionOutcome::unavailable(id, e.to_string());
            }
        };
        if self.deadline_passed() {
            warn!(engine = id, "global deadline reached before engine started");
            return ExecutionOutcome::timed_out(id, "global deadline reached before start", Duration::ZERO);
        }
        let timeout = self
            .registry
            .descriptor(id)
            .map(|d| d.timeout)
            .unwrap_or_else(|| ExecutionOptions::default().engine_timeout);

        let started = *self.started[idx].get_or_init(Instant::now);
        let output_dir = self.request.output_dir_for(id);
        if let Err(e) = fresh_dir(&output_dir) {
            warn!(engine = id, dir = %output_dir.display(), error = %e, "cannot prepare output directory");
            return ExecutionOutcome::failed(id, format!("cannot create {}: {e}", output_dir.display()), started.elapsed());
        }
        let cancel = self.cancels[idx].clone();
        let job = EngineJob {
            engine_id: id.to_string(),
            dataset: self.request.dataset.clone(),
            delimiter: self.request.delimiter,
            output_dir,
            limits: self.request.limits_for(id),
            cancel: cancel.clone(),
        };

        // 引擎在独立线程上运行，worker 只负责限时等待
        let (tx, rx) = channel::bounded(1);
        info!(engine = id, runtime = %engine.runtime(), "engine started");
        let spawned = std::thread::Builder::new()
            .name(format!("engine-{id}"))
            .spawn(move || {
                let _ = tx.send(engine.run(&job));
            });
        if let Err(e) = spawned {
            return ExecutionOutcome::failed(id, format!("cannot start engine thread: {e}"), started.elapsed());
        }

        let wait = match self.deadline {
            Some(d) => timeout.min(d.saturating_duration_since(Instant::now())),
            None => timeout,
        };
        match rx.recv_timeout(wait) {
            Ok(Ok(report)) => {
                let duration = started.elapsed();
                info!(engine = id, duration_ms = duration.as_millis() as u64, artifacts = report.artifacts.len(), "engine finished");
                ExecutionOutcome::succeeded(id, report.artifacts, duration)
            }
            Ok(Err(failure)) => {
                warn!(engine = id, error = %failure, "engine failed");
                ExecutionOutcome::failed(id, failure.to_string(), started.elapsed())
            }
            Err(channel::RecvTimeoutError::Timeout) => {
                cancel.cancel();
                let reason = if self.deadline_passed() {
                    "global deadline reached".to_string()
                } else {
                    format!("exceeded timeout of {}s", timeout.as_secs_f64())
                };
                warn!(engine = id, %reason, "engine timed out");
                ExecutionOutcome::timed_out(id, reason, started.elapsed())
            }
            Err(channel::RecvTimeoutError::Disconnected) => {
                warn!(engine = id, "engine panicked");
                ExecutionOutcome::failed(id, "engine panicked", started.elapsed())
            }
        }
    }

    fn cancel_all(&self) {
        for c in &self.cancels {
            c.cancel();
        }
    }

    /// 已启动引擎的运行时长；未启动为零
    fn elapsed(&self, idx: usize) -> Duration {
        self.started[idx].get().map(|s| s.elapsed()).unwrap_or(Duration::ZERO)
    }
}

/// 清空并重建引擎私有目录，上一次运行留下的文件不会被算作本次产物
fn fresh_dir(dir: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    std::fs::create_dir_all(dir)
}

/// 并行调度：Rayon 线程池执行，当前线程按 idx 收集
fn run_parallel(dispatch: Arc<Dispatch>, workers: usize) -> Vec<ExecutionOutcome> {
    let total = dispatch.request.engines.len();
    let (tx, rx) = channel::bounded::<(usize, ExecutionOutcome)>(total);

    let bg = Arc::clone(&dispatch);
    let spawned = std::thread::Builder::new().name("engine-dispatch".into()).spawn(move || {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("engine-worker-{i}"))
            .build();
        match pool {
            Ok(pool) => pool.scope(|s| {
                for idx in 0..total {
                    let tx = tx.clone();
                    let bg = &bg;
                    s.spawn(move |_| {
                        let _ = tx.send((idx, bg.run_one(idx)));
                    });
                }
            }),
            Err(e) => {
                warn!(error = %e, "cannot build worker pool, running engines serially");
                for idx in 0..total {
                    let _ = tx.send((idx, bg.run_one(idx)));
                }
            }
        }
        // 所有 Sender 在此被丢弃，收集端随之收到关闭信号
    });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot start dispatch thread, running engines serially");
        return (0..total).map(|idx| dispatch.run_one(idx)).collect();
    }

    // 收集端：结果可能以任意顺序到达
    let mut collected: BTreeMap<usize, ExecutionOutcome> = BTreeMap::new();
    while collected.len() < total {
        let received = match dispatch.deadline {
            Some(d) => rx.recv_deadline(d).map_err(|e| e.is_timeout()),
            None => rx.recv().map_err(|_| false),
        };
        match received {
            Ok((idx, outcome)) => {
                collected.entry(idx).or_insert(outcome);
            }
            Err(true) => {
                // 全局截止：先收下已送达的结果，其余标记超时并发出取消
                while let Ok((idx, outcome)) = rx.try_recv() {
                    collected.entry(idx).or_insert(outcome);
                }
                dispatch.cancel_all();
                warn!(pending = total - collected.len(), "global deadline reached, no longer waiting");
                for idx in 0..total {
                    collected.entry(idx).or_insert_with(|| {
                        ExecutionOutcome::timed_out(&dispatch.request.engines[idx], "global deadline reached", dispatch.elapsed(idx))
                    });
                }
            }
            Err(false) => {
                debug!("dispatch channel closed early");
                for idx in 0..total {
                    collected.entry(idx).or_insert_with(|| {
                        ExecutionOutcome::failed(&dispatch.request.engines[idx], "worker stopped before reporting", dispatch.elapsed(idx))
                    });
                }
            }
        }
    }
    collected.into_values().collect()
}

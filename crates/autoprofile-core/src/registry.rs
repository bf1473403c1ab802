//! 引擎注册表（懒解析 + 进程内缓存）
//!
//! - 首次 `get` 时才解析引擎（定位隔离运行时与入口），结果无论成败都缓存到进程结束。
//! - 同一 id 的并发首次调用合并为一次解析：每个 id 对应一个 `OnceLock` 槽位，
//!   后到的调用阻塞在同一个槽位上等待进行中的解析，而不是各自启动一次。
//! - `reload()` 显式清空缓存。
use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use serde::Serialize;
use tracing::{debug, warn};

use crate::descriptor::{Builtin, EngineDescriptor, EntryPoint, Runtime};
use crate::engine::{Engine, ProcessEngine, SummaryEngine};
use crate::error::{ProfilerError, Result};
use crate::loader::LoadOptions;

/// 解析结果：成功为引擎句柄，失败为原因
type Resolution = std::result::Result<Arc<dyn Engine>, String>;

/// 解析策略（把描述符变成可运行的引擎）
pub trait Resolver: Send + Sync {
    fn resolve(&self, descriptor: &EngineDescriptor) -> Resolution;
}

/// 默认解析：内置引擎直接构造；外部引擎检查启动器与入口脚本是否存在
#[derive(Debug, Clone)]
pub struct DefaultResolver {
    engines_root: PathBuf,
    load: LoadOptions,
    search_path: Option<OsString>,
}

impl DefaultResolver {
    pub fn new(engines_root: PathBuf, load: LoadOptions) -> Self {
        Self { engines_root, load, search_path: std::env::var_os("PATH") }
    }

    /// 指定可执行文件搜索路径（测试用）
    pub fn with_search_path(mut self, path: Option<OsString>) -> Self {
        self.search_path = path;
        self
    }

    fn locate_program(&self, program: &str) -> Option<PathBuf> {
        let p = Path::new(program);
        if p.components().count() > 1 || p.is_absolute() {
            return p.is_file().then(|| p.to_path_buf());
        }
        let paths = self.search_path.as_ref()?;
        std::env::split_paths(paths).map(|dir| dir.join(program)).find(|c| c.is_file())
    }
}

impl Resolver for DefaultResolver {
    fn resolve(&self, d: &EngineDescriptor) -> Resolution {
        if d.capabilities.interactive {
            return Err("interactive engines need a terminal and cannot run unattended".to_string());
        }
        match (&d.runtime, &d.entry) {
            (Runtime::Linked, EntryPoint::Builtin(Builtin::Summary)) => {
                Ok(Arc::new(SummaryEngine::new(d.id.clone(), self.load)))
            }
            (Runtime::Linked, _) => Err("linked runtime requires a builtin entry".to_string()),
            (Runtime::Launcher { .. }, EntryPoint::Builtin(_)) => {
                Err("builtin entries cannot run under a launcher".to_string())
            }
            (Runtime::Launcher { program, args }, entry) => {
                let exe = self
                    .locate_program(program)
                    .ok_or_else(|| format!("runtime launcher `{program}` not found"))?;
                let mut argv: Vec<OsString> = args.iter().map(OsString::from).collect();
                if let EntryPoint::Script(script) = entry {
                    let script = self.engines_root.join(script);
                    if !script.is_file() {
                        return Err(format!("entry script {} not found", script.display()));
                    }
                    argv.push(script.into_os_string());
                }
                Ok(Arc::new(ProcessEngine::new(d.id.clone(), exe, argv, d.capabilities)))
            }
        }
    }
}

/// 每个 id 的缓存槽位
#[derive(Default)]
struct Slot {
    started: AtomicBool,
    cell: OnceLock<Resolution>,
}

/// 槽位状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionState {
    Unresolved,
    Resolving,
    Available,
    Unavailable,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub id: String,
    pub name: String,
    pub runtime: String,
    pub state: ResolutionState,
    pub reason: Option<String>,
}

pub struct EngineRegistry {
    descriptors: Vec<EngineDescriptor>,
    resolver: Box<dyn Resolver>,
    cache: Mutex<HashMap<String, Arc<Slot>>>,
}

impl EngineRegistry {
    pub fn new(descriptors: Vec<EngineDescriptor>, resolver: Box<dyn Resolver>) -> Self {
        Self { descriptors, resolver, cache: Mutex::new(HashMap::new()) }
    }

    pub fn descriptors(&self) -> &[EngineDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, id: &str) -> Option<&EngineDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    /// 全部引擎 id（表顺序）
    pub fn ids(&self) -> Vec<String> {
        self.descriptors.iter().map(|d| d.id.clone()).collect()
    }

    fn slot(&self, id: &str) -> Arc<Slot> {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(cache.entry(id.to_string()).or_default())
    }

    /// 获取（必要时解析）引擎
    pub fn get(&self, id: &str) -> Result<Arc<dyn Engine>> {
        let Some(descriptor) = self.descriptor(id) else {
            return Err(ProfilerError::EngineUnavailable { id: id.to_string(), reason: "unknown engine id".to_string() });
        };
        // 取得槽位后立即释放表锁，解析期间不阻塞其他 id
        let slot = self.slot(id);
        let resolution = slot.cell.get_or_init(|| {
            slot.started.store(true, Ordering::SeqCst);
            debug!(engine = id, runtime = %descriptor.runtime.label(), "resolving engine");
            let r = self.resolver.resolve(descriptor);
            if let Err(reason) = &r {
                warn!(engine = id, %reason, "engine unavailable");
            }
            r
        });
        resolution
            .clone()
            .map_err(|reason| ProfilerError::EngineUnavailable { id: id.to_string(), reason })
    }

    /// 清空缓存；下一次 `get` 重新解析
    pub fn reload(&self) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache.clear();
        debug!("engine registry cache cleared");
    }

    /// 各引擎的解析状态
    pub fn status(&self) -> Vec<EngineStatus> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        self.descriptors
            .iter()
            .map(|d| {
                let (state, reason) = match cache.get(&d.id) {
                    None => (ResolutionState::Unresolved, None),
                    Some(slot) => match slot.cell.get() {
                        Some(Ok(_)) => (ResolutionState::Available, None),
                        Some(Err(r)) => (ResolutionState::Unavailable, Some(r.clone())),
                        None if slot.started.load(Ordering::SeqCst) => (ResolutionState::Resolving, None),
                        None => (ResolutionState::Unresolved, None),
                    },
                };
                EngineStatus {
                    id: d.id.clone(),
                    name: d.name.clone(),
                    runtime: d.runtime.label(),
                    state,
                    reason,
                }
            })
            .collect()
    }
}

//! 引擎描述符表（进程启动时构建，之后只读）
//!
//! 内置表对应四个引擎：进程内的 `summary`，以及通过隔离运行时启动的
//! `ydata`、`sweetviz`、`dataprep`。配置中的 `[[engines]]` 可覆盖同 id 的条目或追加新条目。
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::settings::Settings;

/// 能力标记
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    /// 接受可选的分块行数/内存上限两个位置参数
    #[serde(default)]
    pub chunked: bool,
    /// 需要交互式终端
    #[serde(default)]
    pub interactive: bool,
}

/// 静态链接的进程内引擎
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Builtin {
    Summary,
}

/// 引擎的隔离运行时
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Runtime {
    /// 与编排器同进程（静态链接）
    Linked,
    /// 外部进程：`program args..`，例如 `conda run -n <env> python`
    Launcher { program: String, args: Vec<String> },
}

impl Runtime {
    /// 便于日志展示的标识
    pub fn label(&self) -> String {
        match self {
            Runtime::Linked => "linked".to_string(),
            Runtime::Launcher { program, args } if args.is_empty() => program.clone(),
            Runtime::Launcher { program, args } => format!("{program} {}", args.join(" ")),
        }
    }
}

/// 入口
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryPoint {
    Builtin(Builtin),
    /// 交给运行时执行的脚本（相对 `engines_root`）
    Script(PathBuf),
    /// 运行时本身即是引擎，没有额外脚本
    Direct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineDescriptor {
    pub id: String,
    pub name: String,
    pub runtime: Runtime,
    pub entry: EntryPoint,
    pub capabilities: Capabilities,
    pub timeout: Duration,
}

/// 配置文件中的单个引擎条目
#[derive(Debug, Clone, Deserialize)]
struct EngineEntry {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    builtin: Option<Builtin>,
    /// 启动器命令（第一个元素为程序）
    #[serde(default)]
    launcher: Vec<String>,
    #[serde(default)]
    entry: Option<PathBuf>,
    #[serde(default)]
    chunked: bool,
    #[serde(default)]
    interactive: bool,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

fn engine_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("engine id pattern compiles"))
}

/// 校验引擎 id（同时用作输出子目录名）
pub fn validate_engine_id(id: &str) -> Result<(), ConfigError> {
    if engine_id_pattern().is_match(id) {
        Ok(())
    } else {
        Err(ConfigError::invalid("engines.id", format!("`{id}` must match [a-z0-9][a-z0-9_-]*")))
    }
}

fn conda_python(env: &str) -> Runtime {
    Runtime::Launcher {
        program: "conda".to_string(),
        args: ["run", "--no-capture-output", "-n", env, "python"].iter().map(|s| s.to_string()).collect(),
    }
}

/// 内置描述符表
pub fn builtin_descriptors(default_timeout: Duration) -> Vec<EngineDescriptor> {
    let chunked = Capabilities { chunked: true, interactive: false };
    vec![
        EngineDescriptor {
            id: "summary".to_string(),
            name: "Dataset Summary".to_string(),
            runtime: Runtime::Linked,
            entry: EntryPoint::Builtin(Builtin::Summary),
            capabilities: chunked,
            timeout: default_timeout,
        },
        EngineDescriptor {
            id: "ydata".to_string(),
            name: "YData Profiling".to_string(),
            runtime: conda_python("csv-profiler-profiling"),
            entry: EntryPoint::Script(PathBuf::from("engines/profiling/ydata_report.py")),
            capabilities: chunked,
            timeout: default_timeout,
        },
        EngineDescriptor {
            id: "sweetviz".to_string(),
            name: "SweetViz".to_string(),
            runtime: conda_python("csv-profiler-profiling"),
            entry: EntryPoint::Script(PathBuf::from("engines/profiling/sweetviz_report.py")),
            capabilities: chunked,
            timeout: default_timeout,
        },
        EngineDescriptor {
            id: "dataprep".to_string(),
            name: "DataPrep EDA".to_string(),
            runtime: conda_python("csv-profiler-dataprep"),
            entry: EntryPoint::Script(PathBuf::from("engines/dataprep/dataprep_report.py")),
            capabilities: chunked,
            timeout: default_timeout,
        },
    ]
}

impl EngineEntry {
    fn into_descriptor(self, default_timeout: Duration) -> Result<EngineDescriptor, ConfigError> {
        validate_engine_id(&self.id)?;
        let key = format!("engines.{}", self.id);
        let (runtime, entry) = match (self.builtin, self.launcher.split_first()) {
            (Some(b), None) => (Runtime::Linked, EntryPoint::Builtin(b)),
            (Some(_), Some(_)) => return Err(ConfigError::invalid(&key, "builtin engines cannot have a launcher")),
            (None, Some((program, args))) => {
                let runtime = Runtime::Launcher { program: program.clone(), args: args.to_vec() };
                let entry = match self.entry {
                    Some(p) => EntryPoint::Script(p),
                    None => EntryPoint::Direct,
                };
                (runtime, entry)
            }
            (None, None) => return Err(ConfigError::invalid(&key, "either `builtin` or `launcher` is required")),
        };
        if self.timeout_secs == Some(0) {
            return Err(ConfigError::invalid(&key, "timeout_secs must be positive"));
        }
        Ok(EngineDescriptor {
            name: self.name.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            runtime,
            entry,
            capabilities: Capabilities { chunked: self.chunked, interactive: self.interactive },
            timeout: self.timeout_secs.map(Duration::from_secs).unwrap_or(default_timeout),
        })
    }
}

/// 内置表 + 配置条目（同 id 覆盖，新 id 追加在末尾）
pub fn descriptors_from_settings(s: &Settings, default_timeout: Duration) -> Result<Vec<EngineDescriptor>, ConfigError> {
    let entries: Vec<EngineEntry> = s.get("engines", Vec::new())?;
    let mut table = builtin_descriptors(default_timeout);
    let mut seen = std::collections::HashSet::new();
    for entry in entries {
        if !seen.insert(entry.id.clone()) {
            return Err(ConfigError::invalid("engines.id", format!("duplicate engine id `{}`", entry.id)));
        }
        let desc = entry.into_descriptor(default_timeout)?;
        match table.iter_mut().find(|d| d.id == desc.id) {
            Some(slot) => *slot = desc,
            None => table.push(desc),
        }
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn builtin_table_has_unique_valid_ids() {
        let table = builtin_descriptors(HOUR);
        let ids: Vec<&str> = table.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["summary", "ydata", "sweetviz", "dataprep"]);
        for d in &table {
            validate_engine_id(&d.id).unwrap();
        }
        assert_eq!(table[1].runtime.label(), "conda run --no-capture-output -n csv-profiler-profiling python");
    }

    #[test]
    fn config_entries_override_and_extend() {
        let s = Settings::from_toml_str(
            r#"
[[engines]]
id = "ydata"
launcher = ["/opt/envs/profiling/bin/python"]
entry = "ydata_report.py"
chunked = true
timeout_secs = 90

[[engines]]
id = "great-expectations"
name = "Great Expectations"
launcher = ["ge-runner", "--quiet"]
"#,
        )
        .unwrap();
        let table = descriptors_from_settings(&s, HOUR).unwrap();
        assert_eq!(table.len(), 5);
        let ydata = table.iter().find(|d| d.id == "ydata").unwrap();
        assert_eq!(ydata.timeout, Duration::from_secs(90));
        assert_eq!(ydata.entry, EntryPoint::Script(PathBuf::from("ydata_report.py")));
        assert_eq!(ydata.name, "ydata");
        let ge = table.last().unwrap();
        assert_eq!(ge.id, "great-expectations");
        assert_eq!(ge.entry, EntryPoint::Direct);
        assert_eq!(ge.runtime, Runtime::Launcher { program: "ge-runner".into(), args: vec!["--quiet".into()] });
        assert_eq!(ge.timeout, HOUR);
    }

    #[test]
    fn invalid_entries_are_rejected() {
        for toml in [
            "[[engines]]\nid = \"Bad Id\"\nlauncher = [\"x\"]",
            "[[engines]]\nid = \"x\"",
            "[[engines]]\nid = \"x\"\nbuiltin = \"summary\"\nlauncher = [\"y\"]",
            "[[engines]]\nid = \"x\"\nlauncher = [\"y\"]\ntimeout_secs = 0",
            "[[engines]]\nid = \"x\"\nlauncher = [\"y\"]\n[[engines]]\nid = \"x\"\nlauncher = [\"z\"]",
        ] {
            let s = Settings::from_toml_str(toml).unwrap();
            assert!(descriptors_from_settings(&s, HOUR).is_err(), "{toml}");
        }
    }
}

//! 配置提供者（TOML 文件 + 环境变量覆盖）
//!
//! 键使用点路径（如 `performance.chunk_size`）。环境变量格式：
//! `AUTOPROFILE_<SECTION>__<KEY>`，双下划线分隔层级，例如
//! `AUTOPROFILE_PERFORMANCE__CHUNK_SIZE=5000`。
use serde::de::DeserializeOwned;
use std::path::Path;
use tracing::info;

use crate::error::ConfigError;

pub const ENV_PREFIX: &str = "AUTOPROFILE_";

#[derive(Debug, Clone, Default)]
pub struct Settings {
    root: toml::Table,
}

impl Settings {
    /// 空配置（全部取默认值）
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_toml_str(txt: &str) -> Result<Self, ConfigError> {
        let root: toml::Table = toml::from_str(txt)?;
        Ok(Self { root })
    }

    /// 从文件加载
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let txt = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&txt)
    }

    /// 应用进程环境变量中的覆盖项
    pub fn with_process_env(self) -> Self {
        self.with_env_overrides(std::env::vars())
    }

    /// 应用覆盖项（只处理带前缀的变量）
    pub fn with_env_overrides<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(ENV_PREFIX) else { continue };
            if rest.is_empty() {
                continue;
            }
            let path = rest.to_ascii_lowercase().replace("__", ".");
            let converted = convert_env_value(&value);
            info!(key = %path, value = %converted, "applied environment override");
            self.set(&path, converted);
        }
        self
    }

    /// 运行期写入（点路径，缺失的中间表自动创建）
    pub fn set(&mut self, key: &str, value: toml::Value) {
        let mut parts: Vec<&str> = key.split('.').collect();
        let Some(last) = parts.pop() else { return };
        let mut current = &mut self.root;
        for part in parts {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| toml::Value::Table(toml::Table::new()));
            if !entry.is_table() {
                *entry = toml::Value::Table(toml::Table::new());
            }
            current = match entry {
                toml::Value::Table(t) => t,
                _ => return,
            };
        }
        current.insert(last.to_string(), value);
    }

    /// 写入字符串形式的值（与环境变量覆盖相同的类型推断）
    pub fn set_parsed(&mut self, key: &str, raw: &str) {
        self.set(key, convert_env_value(raw));
    }

    /// 原始值查找
    pub fn get_raw(&self, key: &str) -> Option<&toml::Value> {
        let mut parts = key.split('.');
        let first = parts.next()?;
        let mut current = self.root.get(first)?;
        for part in parts {
            current = current.as_table()?.get(part)?;
        }
        Some(current)
    }

    /// 取值；缺失时返回 `default`，类型不符时报错
    pub fn get<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get_raw(key) {
            None => Ok(default),
            Some(v) => v
                .clone()
                .try_into()
                .map_err(|e: toml::de::Error| ConfigError::invalid(key, e.message().to_string())),
        }
    }
}

/// 环境变量字符串转为 TOML 值：布尔 → 整数 → 浮点 → 字符串
fn convert_env_value(value: &str) -> toml::Value {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" => return toml::Value::Boolean(true),
        "false" | "no" | "off" => return toml::Value::Boolean(false),
        _ => {}
    }
    if let Ok(i) = value.parse::<i64>() {
        return toml::Value::Integer(i);
    }
    if let Ok(f) = value.parse::<f64>() {
        return toml::Value::Float(f);
    }
    toml::Value::String(value.to_string())
}

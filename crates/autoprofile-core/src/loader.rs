//! 数据集加载（小文件整读 + 大文件按行分块）
//!
//! - 文件小于 `small_file_threshold_bytes`：单次读取，不进入分块循环。
//! - 否则按 `chunk_size_rows` 分块顺序读取；每块之后探测进程内存，超限即中止。
//! - 中止时不返回、不保留任何部分表格（全有或全无）。
//! - 设置了取消标记时，每读完一块检查一次，被取消即以 `Cancelled` 中止。
//! - 两条路径对同一文件产出完全相同的表格（行序保持）。
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Serialize;
use tracing::{debug, warn};

use crate::delimiter::Delimiter;
use crate::engine::CancelFlag;
use crate::error::{ProfilerError, Result};
use crate::memory::{self, MemoryProbe};

/// 内存中的表格：表头 + 行（字段为 UTF-8 文本）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[Vec<String>] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.headers.len()
    }

    /// 估算的内存占用（字节）
    pub fn estimated_bytes(&self) -> u64 {
        let cell = std::mem::size_of::<String>() as u64;
        let row = std::mem::size_of::<Vec<String>>() as u64;
        let text: u64 = self
            .headers
            .iter()
            .chain(self.rows.iter().flatten())
            .map(|s| s.capacity() as u64 + cell)
            .sum();
        text + self.rows.len() as u64 * row
    }
}

/// 表格大小分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Chunked,
}

/// 非致命解析告警（畸形行、非法 UTF-8 等）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParseWarning {
    pub line: u64,
    pub message: String,
}

/// 加载结果
#[derive(Debug, Clone)]
pub struct LoadedTable {
    pub table: Table,
    pub warnings: Vec<ParseWarning>,
    pub size_class: SizeClass,
    pub chunks_read: usize,
}

/// 加载参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadOptions {
    pub chunk_size_rows: usize,
    pub memory_limit_bytes: u64,
    pub small_file_threshold_bytes: u64,
    /// 畸形行比例上限；超过则整个加载按 FileProcessing 失败
    pub max_malformed_ratio: f64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            chunk_size_rows: 10_000,
            memory_limit_bytes: 1024 * 1024 * 1024,
            small_file_threshold_bytes: 50 * 1024 * 1024,
            max_malformed_ratio: 0.1,
        }
    }
}

impl LoadOptions {
    /// 小于阈值的文件整读，其余分块
    pub fn size_class(&self, size_bytes: u64) -> SizeClass {
        if size_bytes < self.small_file_threshold_bytes {
            SizeClass::Small
        } else {
            SizeClass::Chunked
        }
    }
}

/// 告警日志条数上限，其余只计数
const MAX_LOGGED_WARNINGS: usize = 5;

pub struct DatasetLoader {
    opts: LoadOptions,
    probe: Option<Box<dyn MemoryProbe>>,
    cancel: Option<CancelFlag>,
}

impl DatasetLoader {
    /// 使用平台默认内存探针（不可用时不监控）
    pub fn new(opts: LoadOptions) -> Self {
        Self { opts, probe: memory::default_probe(), cancel: None }
    }

    pub fn with_probe(opts: LoadOptions, probe: Box<dyn MemoryProbe>) -> Self {
        Self { opts, probe: Some(probe), cancel: None }
    }

    pub fn without_memory_monitoring(opts: LoadOptions) -> Self {
        Self { opts, probe: None, cancel: None }
    }

    /// 加载过程中响应取消
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn options(&self) -> &LoadOptions {
        &self.opts
    }

    /// 按文件大小选择整读或分块
    pub fn load(&self, path: &Path, delimiter: Delimiter) -> Result<LoadedTable> {
        let size = std::fs::metadata(path)
            .map_err(|e| ProfilerError::Input { path: path.to_path_buf(), reason: e.to_string() })?
            .len();
        if size == 0 {
            return Err(ProfilerError::EmptyInput(path.to_path_buf()));
        }
        match self.opts.size_class(size) {
            SizeClass::Small => self.load_single_pass(path, delimiter),
            SizeClass::Chunked => self.load_chunked(path, delimiter),
        }
    }

    /// 单次读取全部行（可取消时按块步进，但不探测内存）
    pub fn load_single_pass(&self, path: &Path, delimiter: Delimiter) -> Result<LoadedTable> {
        let step = match self.cancel {
            Some(_) => self.opts.chunk_size_rows.max(1),
            None => usize::MAX,
        };
        let mut rows = RowReader::open(path, delimiter)?;
        let mut table = Table { headers: rows.headers.clone(), rows: Vec::new() };
        loop {
            let n = rows.read_into(&mut table.rows, step)?;
            self.check_cancelled(&table)?;
            if n < step {
                break;
            }
        }
        self.finish(table, rows.warnings, SizeClass::Small, 1)
    }

    /// 分块读取；每块之后检查内存
    pub fn load_chunked(&self, path: &Path, delimiter: Delimiter) -> Result<LoadedTable> {
        let chunk_size = self.opts.chunk_size_rows.max(1);
        let mut rows = RowReader::open(path, delimiter)?;
        let mut table = Table { headers: rows.headers.clone(), rows: Vec::new() };
        let mut chunks = 0usize;

        loop {
            let n = rows.read_into(&mut table.rows, chunk_size)?;
            if n == 0 {
                break;
            }
            chunks += 1;
            debug!(chunk = chunks, rows = n, total_rows = table.rows.len(), "chunk loaded");
            self.check_cancelled(&table)?;

            if let Some(used) = self.probe.as_ref().and_then(|p| p.resident_bytes()) {
                debug!(used_bytes = used, limit_bytes = self.opts.memory_limit_bytes, "memory probe");
                if used > self.opts.memory_limit_bytes {
                    // table 在此处被丢弃，调用方拿不到任何部分结果
                    let rows_read = table.rows.len();
                    drop(table);
                    warn!(used_bytes = used, rows_read, "memory limit exceeded, aborting load");
                    return Err(ProfilerError::MemoryExceeded {
                        used,
                        limit: self.opts.memory_limit_bytes,
                        rows_read,
                    });
                }
            }
            if n < chunk_size {
                break;
            }
        }
        self.finish(table, rows.warnings, SizeClass::Chunked, chunks)
    }

    fn check_cancelled(&self, table: &Table) -> Result<()> {
        match &self.cancel {
            Some(c) if c.is_cancelled() => {
                debug!(rows_read = table.rows.len(), "load cancelled");
                Err(ProfilerError::Cancelled { rows_read: table.rows.len() })
            }
            _ => Ok(()),
        }
    }

    fn finish(&self, table: Table, warnings: Vec<ParseWarning>, size_class: SizeClass, chunks: usize) -> Result<LoadedTable> {
        let malformed = warnings.len();
        if malformed > 0 {
            for w in warnings.iter().take(MAX_LOGGED_WARNINGS) {
                warn!(line = w.line, message = %w.message, "parse warning");
            }
            if malformed > MAX_LOGGED_WARNINGS {
                warn!(suppressed = malformed - MAX_LOGGED_WARNINGS, "further parse warnings suppressed");
            }
            let total = table.rows.len().max(1);
            let ratio = malformed as f64 / total as f64;
            if ratio > self.opts.max_malformed_ratio {
                return Err(ProfilerError::FileProcessing {
                    line: warnings.first().map(|w| w.line),
                    message: format!(
                        "{malformed} of {} rows are malformed (ratio {ratio:.2} exceeds {:.2})",
                        table.rows.len(),
                        self.opts.max_malformed_ratio
                    ),
                });
            }
        }
        Ok(LoadedTable { table, warnings, size_class, chunks_read: chunks })
    }
}

/// 顺序行读取器：两条加载路径共用，保证逐行语义一致
struct RowReader {
    reader: csv::Reader<BufReader<File>>,
    headers: Vec<String>,
    record: csv::ByteRecord,
    warnings: Vec<ParseWarning>,
}

impl RowReader {
    fn open(path: &Path, delimiter: Delimiter) -> Result<Self> {
        let file = File::open(path).map_err(|e| ProfilerError::Input { path: path.to_path_buf(), reason: e.to_string() })?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter.as_byte())
            .has_headers(true)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let mut warnings = Vec::new();
        let raw = reader.byte_headers().map_err(to_processing_error)?.clone();
        if raw.is_empty() {
            return Err(ProfilerError::EmptyInput(path.to_path_buf()));
        }
        let headers = decode_record(&raw, 1, &mut warnings);
        Ok(Self { reader, headers, record: csv::ByteRecord::new(), warnings })
    }

    /// 追加至多 `limit` 行到 `out`，返回实际读取行数
    fn read_into(&mut self, out: &mut Vec<Vec<String>>, limit: usize) -> Result<usize> {
        let mut n = 0usize;
        while n < limit {
            let more = self.reader.read_byte_record(&mut self.record).map_err(to_processing_error)?;
            if !more {
                break;
            }
            let line = self.record.position().map(|p| p.line()).unwrap_or(0);
            if self.record.len() != self.headers.len() {
                self.warnings.push(ParseWarning {
                    line,
                    message: format!("expected {} fields, found {}", self.headers.len(), self.record.len()),
                });
            }
            out.push(decode_record(&self.record, line, &mut self.warnings));
            n += 1;
        }
        Ok(n)
    }
}

fn decode_record(record: &csv::ByteRecord, line: u64, warnings: &mut Vec<ParseWarning>) -> Vec<String> {
    let mut lossy = false;
    let fields = record
        .iter()
        .map(|f| match std::str::from_utf8(f) {
            Ok(s) => s.to_string(),
            Err(_) => {
                lossy = true;
                String::from_utf8_lossy(f).into_owned()
            }
        })
        .collect();
    if lossy {
        warnings.push(ParseWarning { line, message: "invalid UTF-8 replaced".to_string() });
    }
    fields
}

fn to_processing_error(e: csv::Error) -> ProfilerError {
    let line = e.position().map(|p| p.line());
    ProfilerError::FileProcessing { line, message: e.to_string() }
}

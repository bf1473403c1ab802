//! 分隔符识别（有界采样 + 引号感知切分）
//!
//! 做法：
//! - 只读取文件前 `sample_lines` 行，I/O 有上界。
//! - 对每个候选分隔符，用 `csv` 读取样本（引号内的分隔符不计数），得到每条记录的字段数。
//! - 置信度 = 字段数等于众数字段数的记录占比；字段数为 1 的记录视为"未切分"，不参与众数。
//! - 置信度最高者胜出；并列时按候选列表顺序，靠前者胜出。
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde::{Serialize, Serializer};
use tracing::debug;

use crate::error::{ProfilerError, Result};

/// 单字节字段分隔符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Delimiter(u8);

impl Delimiter {
    pub const COMMA: Delimiter = Delimiter(b',');
    pub const SEMICOLON: Delimiter = Delimiter(b';');
    pub const TAB: Delimiter = Delimiter(b'\t');
    pub const PIPE: Delimiter = Delimiter(b'|');
    pub const COLON: Delimiter = Delimiter(b':');
    pub const SPACE: Delimiter = Delimiter(b' ');

    /// 校验并构造；拒绝换行、NUL、引号以及非 ASCII 字节
    pub fn new(byte: u8) -> Result<Self> {
        let reason = match byte {
            b'\n' | b'\r' => Some("line breaks cannot separate fields"),
            0 => Some("NUL is not a valid delimiter"),
            b'"' => Some("the quote character cannot also be the delimiter"),
            b if !b.is_ascii() => Some("delimiter must be a single ASCII character"),
            _ => None,
        };
        match reason {
            Some(r) => Err(ProfilerError::InvalidDelimiter {
                value: (byte as char).escape_default().to_string(),
                reason: r.to_string(),
            }),
            None => Ok(Delimiter(byte)),
        }
    }

    /// 解析调用方传入的分隔符（支持 `\t`、`tab`、`space` 等写法）
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |reason: &str| ProfilerError::InvalidDelimiter { value: s.to_string(), reason: reason.to_string() };
        let byte = match s {
            "\\t" | "tab" | "TAB" => b'\t',
            "space" | "SPACE" => b' ',
            "" => return Err(invalid("delimiter cannot be empty")),
            _ => {
                let bytes = s.as_bytes();
                if bytes.len() != 1 {
                    return Err(invalid("delimiter must be exactly one character"));
                }
                bytes[0]
            }
        };
        Self::new(byte)
    }

    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// 交给引擎的原始字符串形式（位置参数）
    pub fn as_arg(self) -> String {
        (self.0 as char).to_string()
    }
}

impl fmt::Display for Delimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            b' ' => write!(f, "' '"),
            b => write!(f, "{}", (b as char).escape_default()),
        }
    }
}

impl Serialize for Delimiter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.as_arg())
    }
}

/// 识别参数
#[derive(Debug, Clone)]
pub struct DetectOptions {
    pub sample_lines: usize,
    pub candidates: Vec<Delimiter>,
    pub confidence_threshold: f64,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            sample_lines: 20,
            candidates: vec![
                Delimiter::COMMA,
                Delimiter::SEMICOLON,
                Delimiter::TAB,
                Delimiter::PIPE,
                Delimiter::COLON,
                Delimiter::SPACE,
            ],
            confidence_threshold: 0.7,
        }
    }
}

/// 识别结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Detection {
    pub delimiter: Delimiter,
    pub confidence: f64,
    pub lines_sampled: usize,
}

/// 识别文件分隔符
pub fn detect(path: &Path, opts: &DetectOptions) -> Result<Detection> {
    let file = File::open(path).map_err(|e| ProfilerError::Input { path: path.to_path_buf(), reason: e.to_string() })?;
    let (sample, lines) = read_sample(BufReader::new(file), opts.sample_lines)?;
    if lines == 0 {
        return Err(ProfilerError::EmptyInput(path.to_path_buf()));
    }

    let scores = score_candidates(&sample, &opts.candidates);
    let (delimiter, confidence) = pick_best(&scores).ok_or_else(|| ProfilerError::InvalidDelimiter {
        value: String::new(),
        reason: "no candidate delimiters configured".to_string(),
    })?;
    debug!(path = %path.display(), lines, ?scores, "delimiter candidates scored");

    if confidence < opts.confidence_threshold {
        return Err(ProfilerError::AmbiguousDelimiter {
            best_guess: delimiter,
            confidence,
            threshold: opts.confidence_threshold,
        });
    }
    Ok(Detection { delimiter, confidence, lines_sampled: lines })
}

/// 读取至多 `max_lines` 行，返回样本字节与其中非空行数
fn read_sample<R: BufRead>(mut reader: R, max_lines: usize) -> Result<(Vec<u8>, usize)> {
    let mut sample = Vec::new();
    let mut non_blank = 0usize;
    let mut line = Vec::new();
    for _ in 0..max_lines {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 {
            break;
        }
        // 空白行不计数，也不参与评分
        if line.iter().any(|b| !b.is_ascii_whitespace()) {
            non_blank += 1;
            sample.extend_from_slice(&line);
        }
    }
    Ok((sample, non_blank))
}

/// 为每个候选计算置信度（保持候选顺序）
pub(crate) fn score_candidates(sample: &[u8], candidates: &[Delimiter]) -> Vec<(Delimiter, f64)> {
    candidates.iter().map(|&d| (d, confidence_for(sample, d))).collect()
}

fn confidence_for(sample: &[u8], delimiter: Delimiter) -> f64 {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter.as_byte())
        .has_headers(false)
        .flexible(true)
        .from_reader(sample);

    let mut counts: Vec<usize> = Vec::new();
    for rec in reader.byte_records() {
        // 解析出错的记录按"不一致"计
        counts.push(rec.map(|r| r.len()).unwrap_or(0));
    }
    if counts.is_empty() {
        return 0.0;
    }
    match modal_field_count(&counts) {
        Some((_, hits)) => hits as f64 / counts.len() as f64,
        None => 0.0,
    }
}

/// 众数字段数（仅统计 >1 的字段数）；频次相同时取更大的字段数
fn modal_field_count(counts: &[usize]) -> Option<(usize, usize)> {
    let mut freq: std::collections::BTreeMap<usize, usize> = std::collections::BTreeMap::new();
    for &c in counts.iter().filter(|&&c| c > 1) {
        *freq.entry(c).or_insert(0) += 1;
    }
    freq.into_iter().max_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
}

/// 最高置信度者胜出；并列时靠前的候选胜出
fn pick_best(scores: &[(Delimiter, f64)]) -> Option<(Delimiter, f64)> {
    let mut best: Option<(Delimiter, f64)> = None;
    for &(d, c) in scores {
        match best {
            Some((_, bc)) if c <= bc => {}
            _ => best = Some((d, c)),
        }
    }
    best
}

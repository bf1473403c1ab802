use anyhow::{Context, Result};
use autoprofile_core::{
    Delimiter, ProfileRequest, ProfileRun, Profiler, ProfilerError, RunStatus, Settings,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info, warn};

/// 未指定 `--config` 时尝试读取的配置文件
const DEFAULT_CONFIG: &str = "autoprofile.toml";

/// 命令行入口（基于 clap）
#[derive(Parser, Debug)]
#[command(name = "autoprofile", version, about = "多引擎 CSV 数据剖析")]
struct Cli {
    /// 配置文件（TOML），默认读取当前目录下的 autoprofile.toml（若存在）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 识别分隔符并运行选中的引擎
    Run {
        /// 输入 CSV 文件
        input: PathBuf,

        /// 输出根目录，默认 <输入目录>/<文件名>/
        #[arg(long)]
        output: Option<PathBuf>,

        /// 引擎 id 列表（逗号分隔），默认全部
        #[arg(long, value_delimiter = ',')]
        engines: Vec<String>,

        /// 并行 worker 数（"auto"=按配置，否则为正整数）
        #[arg(long, default_value = "auto", value_parser = parse_workers)]
        workers: Workers,

        /// 全局截止时间（秒）
        #[arg(long)]
        deadline_secs: Option<u64>,

        /// 显式分隔符（如 ";"、"\t"、"tab"、"space"），跳过识别
        #[arg(long)]
        delimiter: Option<String>,

        /// 分块行数
        #[arg(long)]
        chunk_size: Option<usize>,

        /// 内存上限（GB）
        #[arg(long)]
        memory_limit_gb: Option<f64>,

        /// 额外写出编排器自身的数据集概要 summary.json
        #[arg(long)]
        summary: bool,
    },
    /// 只识别分隔符
    Detect {
        input: PathBuf,
    },
    /// 列出引擎表与解析状态
    Engines {
        /// 立即解析全部引擎（检查运行时与入口是否就绪）
        #[arg(long)]
        check: bool,
    },
}

fn main() -> ExitCode {
    // 初始化日志（支持通过 RUST_LOG 控制等级，例如 info、debug）
    init_tracing();
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let mut settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Run { input, output, engines, workers, deadline_secs, delimiter, chunk_size, memory_limit_gb, summary } => {
            // 命令行参数覆盖配置文件与环境变量
            if let Some(n) = chunk_size {
                settings.set_parsed("performance.chunk_size", &n.to_string());
            }
            if let Some(gb) = memory_limit_gb {
                settings.set_parsed("performance.memory_limit_gb", &gb.to_string());
            }
            let profiler = Profiler::from_settings(&settings).context("invalid configuration")?;

            let delimiter = delimiter
                .as_deref()
                .map(Delimiter::parse)
                .transpose()
                .context("invalid --delimiter")?;
            let request = ProfileRequest {
                input,
                output_root: output,
                engines,
                delimiter,
                max_workers: workers.0,
                global_deadline: deadline_secs.map(Duration::from_secs),
                summarize: summary,
                ..ProfileRequest::default()
            };
            info!(input = ?request.input, "starting profiling run");

            let run = match profiler.profile(&request) {
                Ok(run) => run,
                Err(e @ ProfilerError::AmbiguousDelimiter { .. }) => {
                    error!("{e}");
                    warn!("pass --delimiter to choose one explicitly");
                    return Ok(ExitCode::from(2));
                }
                Err(e) => return Err(e).context("profiling run aborted"),
            };
            print_report(&run);
            Ok(match run.report.status() {
                RunStatus::Succeeded | RunStatus::PartialFailure => ExitCode::SUCCESS,
                RunStatus::TotalFailure => ExitCode::from(1),
            })
        }
        Commands::Detect { input } => {
            let profiler = Profiler::from_settings(&settings).context("invalid configuration")?;
            match profiler.detect(&input) {
                Ok(d) => {
                    println!("delimiter: {}", d.delimiter);
                    println!("confidence: {:.2}", d.confidence);
                    println!("lines sampled: {}", d.lines_sampled);
                    Ok(ExitCode::SUCCESS)
                }
                Err(ProfilerError::AmbiguousDelimiter { best_guess, confidence, threshold }) => {
                    println!("ambiguous: best guess {best_guess} scored {confidence:.2} (threshold {threshold:.2})");
                    Ok(ExitCode::from(2))
                }
                Err(e) => Err(e).context("delimiter detection failed"),
            }
        }
        Commands::Engines { check } => {
            let profiler = Profiler::from_settings(&settings).context("invalid configuration")?;
            let registry = profiler.registry();
            if check {
                for id in registry.ids() {
                    let _ = registry.get(&id);
                }
            }
            for s in registry.status() {
                let state = format!("{:?}", s.state).to_lowercase();
                match s.reason {
                    Some(reason) => println!("{:<12} {:<12} {:<24} {} ({reason})", s.id, state, s.name, s.runtime),
                    None => println!("{:<12} {:<12} {:<24} {}", s.id, state, s.name, s.runtime),
                }
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// 配置来源优先级：命令行 > 环境变量 > 配置文件 > 内置默认值
fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = match path {
        Some(p) => Settings::load(p).with_context(|| format!("load config {}", p.display()))?,
        None if Path::new(DEFAULT_CONFIG).is_file() => {
            Settings::load(Path::new(DEFAULT_CONFIG)).context("load ./autoprofile.toml")?
        }
        None => Settings::empty(),
    };
    Ok(settings.with_process_env())
}

fn print_report(run: &ProfileRun) {
    println!(
        "dataset: {} (delimiter {}, confidence {:.2})",
        run.dataset.path.display(),
        run.dataset.delimiter,
        run.dataset.confidence
    );
    for o in run.report.outcomes() {
        let secs = o.duration().as_secs_f64();
        match o.error() {
            Some(err) => println!("  {:<12} {:<12} {:>8.2}s  {err}", o.engine_id(), format!("{:?}", o.status()), secs),
            None => println!(
                "  {:<12} {:<12} {:>8.2}s  {} artifact(s)",
                o.engine_id(),
                format!("{:?}", o.status()),
                secs,
                o.artifacts().len()
            ),
        }
    }
    let c = run.report.counts();
    println!(
        "status: {:?} ({} succeeded, {} failed, {} unavailable, {} timed out)",
        run.report.status(),
        c.succeeded,
        c.failed,
        c.unavailable,
        c.timed_out
    );
    println!("manifest: {}", run.manifest.display());
}

/// `--workers` 的取值；`None` 表示按配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Workers(Option<usize>);

/// 解析 worker 参数："auto" 表示按配置；其他必须为正整数
fn parse_workers(s: &str) -> std::result::Result<Workers, String> {
    if s.eq_ignore_ascii_case("auto") {
        return Ok(Workers(None));
    }
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(Workers(Some(n))),
        Err(_) => Err(format!("expected a positive integer or \"auto\", got {s:?}")),
    }
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, FmtSubscriber};
    // 支持通过环境变量 RUST_LOG 控制日志等级，如：RUST_LOG=debug
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // 日志写 stderr，stdout 只留给报告
    let subscriber = FmtSubscriber::builder().with_env_filter(env_filter).with_writer(std::io::stderr).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

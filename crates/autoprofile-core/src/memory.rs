//! 进程内存探针（可选能力，不可用时退化为不监控）
use std::fs;

/// 读取当前进程常驻内存（字节）；返回 None 表示本次读取失败
pub trait MemoryProbe: Send + Sync {
    fn resident_bytes(&self) -> Option<u64>;
}

/// 基于 `/proc/self/status` 的 VmRSS（Linux）
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcStatusProbe;

impl MemoryProbe for ProcStatusProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let status = fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

/// 解析形如 `VmRSS:     12345 kB` 的行
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let mut parts = line["VmRSS:".len()..].split_whitespace();
    let value: u64 = parts.next()?.parse().ok()?;
    let unit = parts.next().unwrap_or("kB");
    let factor = match unit {
        "kB" | "KB" => 1024,
        "mB" | "MB" => 1024 * 1024,
        _ => 1,
    };
    Some(value * factor)
}

/// 平台默认探针：首次读取成功才启用
pub fn default_probe() -> Option<Box<dyn MemoryProbe>> {
    let probe = ProcStatusProbe;
    probe.resident_bytes().map(|_| Box::new(probe) as Box<dyn MemoryProbe>)
}

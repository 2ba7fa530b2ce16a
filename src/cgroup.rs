//! Container-aware CPU detection for sizing the worker pool.

use std::fs;
use std::sync::OnceLock;

/// Environment variable overriding the detected CPU count.
pub const MAX_CPUS_ENV: &str = "TSLAB_MAX_CPUS";

static AVAILABLE_CPUS: OnceLock<usize> = OnceLock::new();

/// Number of CPUs available to the process, honouring cgroup quotas.
pub fn available_cpus() -> usize {
    *AVAILABLE_CPUS.get_or_init(detect_cpus)
}

fn detect_cpus() -> usize {
    if let Some(n) = parse_positive(std::env::var(MAX_CPUS_ENV).ok().as_deref()) {
        return n;
    }

    let logical = num_cpus::get();
    match cpu_quota() {
        // A fractional quota still gets one worker.
        Some(quota) if (quota.ceil() as usize) > 0 && (quota.ceil() as usize) < logical => {
            quota.ceil() as usize
        }
        _ => logical,
    }
}

fn parse_positive(value: Option<&str>) -> Option<usize> {
    value?.trim().parse::<usize>().ok().filter(|n| *n > 0)
}

/// CPU quota in cores from cgroup v2, falling back to v1.
fn cpu_quota() -> Option<f64> {
    fs::read_to_string("/sys/fs/cgroup/cpu.max")
        .ok()
        .and_then(|content| parse_cpu_max(&content))
        .or_else(cpu_quota_v1)
}

/// Parses a cgroup v2 `cpu.max` line: `<quota> <period>` or `max <period>`.
fn parse_cpu_max(content: &str) -> Option<f64> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?.parse::<f64>().ok()?;
    if quota == "max" || period <= 0.0 {
        return None;
    }
    Some(quota.parse::<f64>().ok()? / period)
}

fn cpu_quota_v1() -> Option<f64> {
    let quota = read_i64("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")?;
    if quota <= 0 {
        return None;
    }
    let period = read_i64("/sys/fs/cgroup/cpu/cpu.cfs_period_us")?;
    (period > 0).then(|| quota as f64 / period as f64)
}

fn read_i64(path: &str) -> Option<i64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Default number of decode workers.
pub fn default_workers_limit() -> usize {
    available_cpus()
}

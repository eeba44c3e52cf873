/// Container-aware CPU limit detection for sizing the tokio worker pool.
///
/// Detection order: explicit `CHARON_CPU_LIMIT` env var (supports "4" or
/// "4000m"), then cgroup v2 `cpu.max`, then the host CPU count. Without
/// this, tokio sizes its pool from the host, which over-provisions threads
/// when a container is limited to a few cores on a large machine.
pub fn worker_threads() -> usize {
    if let Ok(value) = std::env::var("CHARON_CPU_LIMIT") {
        if let Some(cores) = parse_cpu_value(&value) {
            return cores.max(1);
        }
    }

    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let Some(cores) = parse_cgroup_cpu_max(&max) {
            return cores.max(1);
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

/// "4" (cores) or "4000m" (millicores).
fn parse_cpu_value(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(stripped) = value.strip_suffix('m') {
        stripped.parse::<usize>().ok().map(|m| m / 1000)
    } else {
        value.parse::<usize>().ok()
    }
}

/// cgroup v2 `cpu.max` — "quota period" or "max period" (unlimited).
fn parse_cgroup_cpu_max(content: &str) -> Option<usize> {
    let mut parts = content.split_whitespace();
    let quota = parts.next()?;
    let period = parts.next()?;
    if quota == "max" {
        return None;
    }
    let quota: i64 = quota.parse().ok()?;
    let period: i64 = period.parse().ok()?;
    (quota > 0 && period > 0).then(|| (quota / period) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_value() {
        assert_eq!(parse_cpu_value("4"), Some(4));
        assert_eq!(parse_cpu_value(" 8 "), Some(8));
        assert_eq!(parse_cpu_value("4000m"), Some(4));
        assert_eq!(parse_cpu_value("500m"), Some(0)); // caller clamps to 1
        assert_eq!(parse_cpu_value("x"), None);
    }

    #[test]
    fn test_parse_cgroup_cpu_max() {
        assert_eq!(parse_cgroup_cpu_max("400000 100000"), Some(4));
        assert_eq!(parse_cgroup_cpu_max("max 100000"), None);
        assert_eq!(parse_cgroup_cpu_max(""), None);
        assert_eq!(parse_cgroup_cpu_max("-1 100000"), None);
    }
}

//! The `host` handler: one row of machine statistics from procfs.

use std::sync::Arc;

use crate::cli::{Handler, Response};
use crate::daemon::Daemon;
use crate::vm::VmState;

/// Columns reported by `host`.
const HOST_COLUMNS: &[&str] = &["name", "cpus", "load", "memused", "memtotal", "vms"];

/// Handlers contributed by this module.
pub fn handlers() -> Vec<Handler> {
    vec![Handler::simple(
        "print statistics about this host",
        "Print the host's name, CPU count, load averages, memory usage in \
         MB, and the number of VMs it is running. Combine with \"mesh send \
         all host\" for a fleet overview.",
        vec!["host"],
        |daemon, _| async move { vec![host_row(&daemon)] },
    )]
}

fn host_row(daemon: &Arc<Daemon>) -> Response {
    let (used, total) = read_meminfo();
    let running = daemon
        .vms
        .list()
        .iter()
        .filter(|vm| vm.state().intersects(VmState::ALIVE))
        .count();

    let row = vec![
        daemon.hostname.clone(),
        cpu_count().to_string(),
        read_loadavg(),
        (used / (1024 * 1024)).to_string(),
        (total / (1024 * 1024)).to_string(),
        running.to_string(),
    ];
    Response::table(
        &daemon.hostname,
        HOST_COLUMNS.iter().map(|c| c.to_string()).collect(),
        vec![row],
    )
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}

/// First three fields of /proc/loadavg.
fn read_loadavg() -> String {
    let content = std::fs::read_to_string("/proc/loadavg").unwrap_or_default();
    content
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Memory (used, total) in bytes, with "used" counted the way `free` does:
/// everything the kernel could not hand back (MemTotal - MemAvailable).
fn read_meminfo() -> (u64, u64) {
    let contents = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
    let total = meminfo_field(&contents, "MemTotal:");
    let available = meminfo_field(&contents, "MemAvailable:");
    (total.saturating_sub(available), total)
}

/// One meminfo field (`MemTotal:   12345 kB`) scaled to bytes; 0 when the
/// field is absent or malformed.
fn meminfo_field(contents: &str, key: &str) -> u64 {
    contents
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse::<u64>().ok())
        .map_or(0, |kb| kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_fields_scale_to_bytes() {
        let sample = "MemTotal:       16384 kB\n\
                      MemFree:         1024 kB\n\
                      MemAvailable:    8192 kB\n";
        assert_eq!(meminfo_field(sample, "MemTotal:"), 16384 * 1024);
        assert_eq!(meminfo_field(sample, "MemAvailable:"), 8192 * 1024);
        assert_eq!(meminfo_field(sample, "SwapTotal:"), 0);
        assert_eq!(meminfo_field("MemTotal: junk kB", "MemTotal:"), 0);
    }

    #[test]
    fn cpu_count_is_positive() {
        assert!(cpu_count() >= 1);
    }
}

//! Host resource sampling
//!
//! CPU load is the one-minute load average relative to the number of
//! logical CPUs. Memory load comes from `/proc/meminfo` where available.

use crate::events::Timestamp;
use chrono::Utc;
use log::debug;
use serde::{Deserialize, Serialize};

/// One resource observation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ResourceSample {
    pub timestamp: Timestamp,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    /// Resident set size of this process
    pub process_rss_bytes: u64,
}

/// Static facts about the host
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub cpu_count: usize,
    pub total_memory_bytes: u64,
    pub pid: u32,
}

/// Source of resource samples
pub trait ResourceProbe: Send + Sync {
    /// Take a best-effort sample; unavailable readings are zero
    fn sample(&self) -> ResourceSample;

    fn host_info(&self) -> HostInfo;
}

/// Probe reading the local operating system
#[derive(Debug, Default)]
pub struct SystemProbe;

impl SystemProbe {
    pub fn new() -> Self {
        Self
    }

    fn cpu_count() -> usize {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn load_average() -> Option<f64> {
        let mut loads = [0.0f64; 3];
        // SAFETY: the buffer holds three doubles and we ask for at most one.
        let filled = unsafe { libc::getloadavg(loads.as_mut_ptr(), 1) };
        (filled >= 1).then_some(loads[0])
    }

    fn cpu_percent() -> f64 {
        match Self::load_average() {
            Some(load) => (load / Self::cpu_count() as f64 * 100.0).clamp(0.0, 100.0),
            None => 0.0,
        }
    }

    fn memory_percent() -> f64 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| parse_meminfo(&meminfo))
            .map(|(total_kb, available_kb)| {
                if total_kb == 0 {
                    0.0
                } else {
                    total_kb.saturating_sub(available_kb) as f64 / total_kb as f64 * 100.0
                }
            })
            .unwrap_or(0.0)
    }

    fn total_memory_bytes() -> u64 {
        if let Some((total_kb, _)) = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|meminfo| parse_meminfo(&meminfo))
        {
            return total_kb * 1024;
        }

        // SAFETY: sysconf has no memory-safety preconditions.
        let (pages, page_size) =
            unsafe { (libc::sysconf(libc::_SC_PHYS_PAGES), libc::sysconf(libc::_SC_PAGESIZE)) };
        if pages > 0 && page_size > 0 {
            pages as u64 * page_size as u64
        } else {
            0
        }
    }

    fn process_rss_bytes() -> u64 {
        if let Some(kb) = std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| parse_vm_rss_kb(&status))
        {
            return kb * 1024;
        }

        // Peak rather than current RSS, but better than nothing
        // SAFETY: rusage is plain old data and getrusage only writes into it.
        unsafe {
            let mut usage: libc::rusage = std::mem::zeroed();
            if libc::getrusage(libc::RUSAGE_SELF, &mut usage) == 0 {
                #[cfg(target_os = "macos")]
                return usage.ru_maxrss as u64;

                #[cfg(not(target_os = "macos"))]
                return usage.ru_maxrss as u64 * 1024;
            }
        }
        0
    }

    fn hostname() -> String {
        let mut buffer = [0u8; 256];
        // SAFETY: the length passed matches the buffer.
        let result = unsafe { libc::gethostname(buffer.as_mut_ptr().cast(), buffer.len()) };
        if result != 0 {
            return "unknown".to_string();
        }
        let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
        String::from_utf8_lossy(&buffer[..end]).into_owned()
    }
}

impl ResourceProbe for SystemProbe {
    fn sample(&self) -> ResourceSample {
        let sample = ResourceSample {
            timestamp: Utc::now(),
            cpu_percent: Self::cpu_percent(),
            memory_percent: Self::memory_percent(),
            process_rss_bytes: Self::process_rss_bytes(),
        };
        debug!(
            "Resource sample: cpu {:.1}%, memory {:.1}%, rss {} bytes",
            sample.cpu_percent, sample.memory_percent, sample.process_rss_bytes
        );
        sample
    }

    fn host_info(&self) -> HostInfo {
        HostInfo {
            hostname: Self::hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: Self::cpu_count(),
            total_memory_bytes: Self::total_memory_bytes(),
            pid: std::process::id(),
        }
    }
}

/// `(MemTotal, MemAvailable)` in kB from `/proc/meminfo` text
fn parse_meminfo(meminfo: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("MemTotal:") => total = fields.next().and_then(|v| v.parse().ok()),
            Some("MemAvailable:") => available = fields.next().and_then(|v| v.parse().ok()),
            _ => {}
        }
    }
    Some((total?, available?))
}

/// `VmRSS` in kB from `/proc/self/status` text
fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       16384000 kB\n\
                       MemFree:         1000000 kB\n\
                       MemAvailable:    4096000 kB\n";
        assert_eq!(parse_meminfo(meminfo), Some((16_384_000, 4_096_000)));
        assert_eq!(parse_meminfo("MemTotal: 10 kB\n"), None);
    }

    #[test]
    fn test_parse_vm_rss() {
        let status = "Name:\topsmon\nVmPeak:\t  9000 kB\nVmRSS:\t  5120 kB\n";
        assert_eq!(parse_vm_rss_kb(status), Some(5120));
        assert_eq!(parse_vm_rss_kb("Name:\topsmon\n"), None);
    }

    #[test]
    fn test_system_probe_ranges() {
        let probe = SystemProbe::new();
        let sample = probe.sample();
        assert!((0.0..=100.0).contains(&sample.cpu_percent));
        assert!((0.0..=100.0).contains(&sample.memory_percent));

        let host = probe.host_info();
        assert!(host.cpu_count >= 1);
        assert_eq!(host.pid, std::process::id());
    }
}

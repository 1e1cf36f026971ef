//! Per-task duration and resident-memory sampling.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use sysinfo::{Pid, System};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TaskProfile {
    pub duration_ms: f64,
    pub rss_before: u64,
    pub rss_after: u64,
    pub peak_rss: u64,
    pub rss_delta: i64,
}

/// Samples this process's RSS. Sampling failures yield `None`.
#[derive(Debug)]
pub struct ResourceProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl Default for ResourceProbe {
    fn default() -> Self {
        Self {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }
}

impl ResourceProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rss_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|p| p.memory())
    }

    pub fn profile(&self, rss_before: u64, elapsed: Duration) -> Option<TaskProfile> {
        let rss_after = self.rss_bytes()?;
        Some(TaskProfile {
            duration_ms: elapsed.as_secs_f64() * 1000.0,
            rss_before,
            rss_after,
            peak_rss: rss_before.max(rss_after),
            rss_delta: rss_after as i64 - rss_before as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_current_process() {
        let probe = ResourceProbe::new();
        let Some(before) = probe.rss_bytes() else {
            // Unsupported platform; profiling is optional.
            return;
        };
        let profile = probe.profile(before, Duration::from_millis(5)).unwrap();
        assert!(profile.peak_rss >= profile.rss_before);
        assert!((profile.duration_ms - 5.0).abs() < 1e-6);
    }
}

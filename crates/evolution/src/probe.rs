//! Host memory sampling.

use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// One memory reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemSample {
    /// Resident memory of this process in bytes
    pub memory_used_bytes: u64,
    /// Physical memory of the host in bytes
    pub memory_total_bytes: u64,
}

/// Source of host measurements.
pub trait SystemProbe: Send + Sync {
    /// Take a reading.
    fn sample(&self) -> SystemSample;
}

/// Probe backed by `sysinfo`, reporting this process's resident memory.
pub struct SysinfoProbe {
    sys: Mutex<System>,
    pid: Option<Pid>,
}

impl SysinfoProbe {
    /// Create a probe for the current process.
    pub fn new() -> Self {
        let pid = sysinfo::get_current_pid().ok();
        if pid.is_none() {
            tracing::warn!("current pid unavailable, reporting host memory instead");
        }
        Self {
            sys: Mutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProbe for SysinfoProbe {
    fn sample(&self) -> SystemSample {
        let mut sys = self.sys.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_memory();
        let used = match self.pid {
            Some(pid) => {
                sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                sys.process(pid).map(|p| p.memory()).unwrap_or(0)
            }
            None => sys.used_memory(),
        };
        SystemSample {
            memory_used_bytes: used,
            memory_total_bytes: sys.total_memory(),
        }
    }
}

/// Probe returning a fixed reading.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticProbe(pub SystemSample);

impl SystemProbe for StaticProbe {
    fn sample(&self) -> SystemSample {
        self.0
    }
}

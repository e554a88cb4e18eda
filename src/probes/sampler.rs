// Resource sampling of target processes during load probes

use parking_lot::Mutex;
use sysinfo::{Pid, System};

use crate::models::ResourceSample;

/// Reads memory and CPU of a set of processes.
pub trait ResourceSampler: Send + Sync {
    /// Combined reading of `pids`, or `None` when nothing could be measured.
    fn sample(&self, pids: &[u32]) -> Option<ResourceSample>;
}

/// Samples live processes via `sysinfo`.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SysinfoSampler {
    fn sample(&self, pids: &[u32]) -> Option<ResourceSample> {
        if pids.is_empty() {
            return None;
        }
        let mut system = self.system.lock();
        let mut memory_bytes = 0u64;
        let mut cpu_percent = 0.0f32;
        let mut seen = 0usize;
        for &raw in pids {
            let pid = Pid::from_u32(raw);
            if !system.refresh_process(pid) {
                continue;
            }
            if let Some(process) = system.process(pid) {
                memory_bytes += process.memory();
                cpu_percent += process.cpu_usage();
                seen += 1;
            }
        }
        (seen > 0).then_some(ResourceSample {
            memory_bytes,
            cpu_percent,
        })
    }
}

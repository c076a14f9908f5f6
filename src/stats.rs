//! Resource usage sampling for the server process and the host

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::sync::Mutex;

/// Resource usage at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Whether a server process was sampled
    pub running: bool,

    pub pid: Option<u32>,

    /// Server CPU usage, percent of one core
    pub cpu_percent: f32,

    /// Server resident memory in bytes
    pub memory_bytes: u64,

    /// Server uptime
    pub uptime: Duration,

    /// Host-wide CPU usage, percent
    pub host_cpu_percent: f32,

    pub host_memory_used: u64,

    pub host_memory_total: u64,

    pub timestamp: DateTime<Utc>,
}

struct ProbeState {
    system: System,
    primed: bool,
    last_pid: Option<u32>,
}

/// Pull-based resource probe.
///
/// Keeps its `System` between calls because CPU usage is a delta between two
/// refreshes. The first sample (and the first sample of a new pid) refreshes
/// twice, `MINIMUM_CPU_UPDATE_INTERVAL` apart.
pub struct StatsProbe {
    state: Mutex<ProbeState>,
}

impl StatsProbe {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProbeState {
                system: System::new(),
                primed: false,
                last_pid: None,
            }),
        }
    }

    /// Sample usage. With no pid, the process fields are zeroed.
    pub async fn sample(&self, pid: Option<u32>, uptime: Option<Duration>) -> StatsSnapshot {
        let mut state = self.state.lock().await;

        let needs_baseline = !state.primed || (pid.is_some() && pid != state.last_pid);
        refresh(&mut state.system, pid);
        if needs_baseline {
            tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;
            refresh(&mut state.system, pid);
        }
        state.primed = true;
        state.last_pid = pid;

        let system = &state.system;
        let process = pid.and_then(|pid| system.process(Pid::from_u32(pid)));

        let (cpu_percent, memory_bytes) = process
            .map(|p| (p.cpu_usage(), p.memory()))
            .unwrap_or((0.0, 0));
        let running = process.is_some();

        StatsSnapshot {
            running,
            pid: if running { pid } else { None },
            cpu_percent,
            memory_bytes,
            uptime: if running {
                uptime.unwrap_or_default()
            } else {
                Duration::ZERO
            },
            host_cpu_percent: system.global_cpu_usage(),
            host_memory_used: system.used_memory(),
            host_memory_total: system.total_memory(),
            timestamp: Utc::now(),
        }
    }
}

impl Default for StatsProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn refresh(system: &mut System, pid: Option<u32>) {
    system.refresh_cpu_usage();
    system.refresh_memory();
    if let Some(pid) = pid {
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[Pid::from_u32(pid)]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
    }
}

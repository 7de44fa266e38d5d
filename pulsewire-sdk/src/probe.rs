//! Host and process counters read once per sampler tick.

/// Raw counters from one probe read.
///
/// Any field the platform could not supply is `None`; the sampler reports
/// it as 0 rather than failing the tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HostReading {
    pub memory_rss_bytes: Option<u64>,
    pub system_memory_used_percent: Option<f64>,
    pub system_memory_total_bytes: Option<u64>,
    pub system_memory_free_bytes: Option<u64>,
    pub cpu_count: Option<usize>,
    /// Process CPU over the interval since the previous read, already
    /// divided by the core count.
    pub cpu_usage_percent: Option<f64>,
    pub load_average: Option<[f64; 3]>,
}

impl HostReading {
    pub fn memory_rss_mb(&self) -> f64 {
        mebibytes(self.memory_rss_bytes)
    }

    pub fn system_memory_total_mb(&self) -> f64 {
        mebibytes(self.system_memory_total_bytes)
    }

    pub fn system_memory_free_mb(&self) -> f64 {
        mebibytes(self.system_memory_free_bytes)
    }
}

fn mebibytes(bytes: Option<u64>) -> f64 {
    bytes
        .map(|bytes| bytes as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

/// Source of host counters.
///
/// `read` is called from the sampler's single writer, so implementations may
/// keep state between calls (CPU usage needs the previous sample).
pub trait HostProbe: Send {
    fn read(&mut self) -> HostReading;
}

impl<F> HostProbe for F
where
    F: FnMut() -> HostReading + Send,
{
    fn read(&mut self) -> HostReading {
        self()
    }
}

#[cfg(feature = "system")]
pub use system::SystemProbe;

#[cfg(feature = "system")]
mod system {
    use sysinfo::{Pid, ProcessesToUpdate, System};

    use super::{HostProbe, HostReading};

    /// Probe backed by `sysinfo`, scoped to the current process.
    pub struct SystemProbe {
        system: System,
        pid: Option<Pid>,
        num_cpus: usize,
    }

    impl SystemProbe {
        pub fn new() -> Self {
            let pid = sysinfo::get_current_pid().ok();
            let mut system = System::new();
            // Baseline so the first tick has something to diff CPU time against.
            if let Some(pid) = pid {
                system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            }
            let num_cpus = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1);

            Self {
                system,
                pid,
                num_cpus,
            }
        }
    }

    impl Default for SystemProbe {
        fn default() -> Self {
            Self::new()
        }
    }

    impl std::fmt::Debug for SystemProbe {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SystemProbe")
                .field("pid", &self.pid)
                .field("num_cpus", &self.num_cpus)
                .finish()
        }
    }

    impl HostProbe for SystemProbe {
        fn read(&mut self) -> HostReading {
            self.system.refresh_memory();
            let total = self.system.total_memory();
            let available = self.system.available_memory();
            let system_memory_used_percent = (total > 0).then(|| {
                let used = total.saturating_sub(available);
                used as f64 / total as f64 * 100.0
            });

            let (memory_rss_bytes, cpu_usage_percent) = match self.pid {
                Some(pid) => {
                    self.system
                        .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                    match self.system.process(pid) {
                        Some(process) => (
                            Some(process.memory()),
                            Some(process.cpu_usage() as f64 / self.num_cpus as f64),
                        ),
                        None => (None, None),
                    }
                }
                None => (None, None),
            };

            let load = System::load_average();

            HostReading {
                memory_rss_bytes,
                system_memory_used_percent,
                system_memory_total_bytes: (total > 0).then_some(total),
                system_memory_free_bytes: (total > 0).then_some(available),
                cpu_count: Some(self.num_cpus),
                cpu_usage_percent,
                load_average: Some([load.one, load.five, load.fifteen]),
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn reads_plausible_values_for_this_process() {
            let mut probe = SystemProbe::new();
            let reading = probe.read();

            assert!(reading.memory_rss_bytes.unwrap_or(0) > 0);
            assert!(reading.cpu_count.unwrap_or(0) >= 1);
            if let (Some(total), Some(free)) =
                (reading.system_memory_total_bytes, reading.system_memory_free_bytes)
            {
                assert!(free <= total);
            }
            if let Some(percent) = reading.system_memory_used_percent {
                assert!((0.0..=100.0).contains(&percent));
            }
        }
    }
}

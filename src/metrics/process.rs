use std::fmt::Write;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::warn;

use super::format_value;

/// Process-level metrics synthesised at each scrape: CPU seconds, resident
/// memory and start time, plus the `exposed_metrics` gauge counting the
/// sample lines of the current pass. These are never prefixed.
///
/// The `System` object is cached behind a mutex and refreshed per scrape;
/// the CPU counter is clamped so it never moves backwards even if the OS
/// reading jitters.
#[derive(Debug)]
pub struct ProcessMetrics {
    system: Mutex<System>,
    pid: Pid,
    start_time_seconds: f64,
    cpu_seconds: Mutex<f64>,
}

impl Default for ProcessMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessMetrics {
    pub fn new() -> Self {
        let start_time_seconds = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        Self {
            system: Mutex::new(System::new()),
            pid: Pid::from(std::process::id() as usize),
            start_time_seconds,
            cpu_seconds: Mutex::new(0.0),
        }
    }

    /// Refresh the OS view and return (cpu_seconds_total, resident_bytes).
    fn snapshot(&self) -> (f64, u64) {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        system.refresh_processes(ProcessesToUpdate::Some(&[self.pid]), true);

        let Some(process) = system.process(self.pid) else {
            warn!(pid = %self.pid, "own process missing from system table");
            return (*self.cpu_seconds.lock().unwrap_or_else(|p| p.into_inner()), 0);
        };

        let cpu = process.accumulated_cpu_time() as f64 / 1000.0;
        let rss = process.memory();
        drop(system);

        // Counter semantics: only ever move forward.
        let mut current = self
            .cpu_seconds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if cpu > *current {
            *current = cpu;
        }

        (*current, rss)
    }

    /// Append the process families to `out`. `exposed` is the number of
    /// instrument sample lines written so far this pass; `exposed_metrics`
    /// is emitted last so it reflects the whole response.
    pub fn expose_to(&self, out: &mut String, exposed: usize) {
        let (cpu_seconds, resident_bytes) = self.snapshot();

        let _ = writeln!(
            out,
            "# HELP process_cpu_seconds_total Total user and system CPU time spent in seconds"
        );
        let _ = writeln!(out, "# TYPE process_cpu_seconds_total counter");
        let _ = writeln!(
            out,
            "process_cpu_seconds_total {}",
            format_value(cpu_seconds)
        );

        let _ = writeln!(
            out,
            "# HELP process_resident_memory_bytes Resident memory size in bytes"
        );
        let _ = writeln!(out, "# TYPE process_resident_memory_bytes gauge");
        let _ = writeln!(out, "process_resident_memory_bytes {resident_bytes}");

        let _ = writeln!(
            out,
            "# HELP process_start_time_seconds Start time of the process since unix epoch in seconds"
        );
        let _ = writeln!(out, "# TYPE process_start_time_seconds gauge");
        let _ = writeln!(
            out,
            "process_start_time_seconds {}",
            format_value(self.start_time_seconds)
        );

        // Three process samples above are part of this pass as well.
        let _ = writeln!(
            out,
            "# HELP exposed_metrics Number of metric samples in this exposition"
        );
        let _ = writeln!(out, "# TYPE exposed_metrics gauge");
        let _ = writeln!(out, "exposed_metrics {}", exposed + 3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_time_is_set() {
        let process = ProcessMetrics::new();
        assert!(process.start_time_seconds > 0.0);
    }

    #[test]
    fn test_cpu_counter_is_monotonic() {
        let process = ProcessMetrics::new();

        let (first, _) = process.snapshot();
        // Burn a little CPU between snapshots.
        let mut x = 0u64;
        for i in 0..200_000u64 {
            x = x.wrapping_mul(31).wrapping_add(i);
        }
        std::hint::black_box(x);

        let (second, _) = process.snapshot();
        assert!(second >= first);
    }

    #[test]
    fn test_exposition_contains_all_process_families() {
        let process = ProcessMetrics::new();

        let mut out = String::new();
        process.expose_to(&mut out, 7);

        assert!(out.contains("# TYPE process_cpu_seconds_total counter"));
        assert!(out.contains("# TYPE process_resident_memory_bytes gauge"));
        assert!(out.contains("# TYPE process_start_time_seconds gauge"));
        assert!(out.contains("exposed_metrics 10"));
    }
}

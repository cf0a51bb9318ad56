//! Host resource sampling for heartbeats

use sysinfo::{Disks, System};

/// One resource usage sample, percentages in 0..=100
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: Option<f32>,
}

/// Source of resource usage samples
#[cfg_attr(test, mockall::automock)]
pub trait MetricsProbe: Send {
    fn sample(&mut self) -> ResourceUsage;
}

/// `MetricsProbe` backed by `sysinfo`
pub struct SysinfoProbe {
    system: System,
    disks: Disks,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl SysinfoProbe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: System::new_all(),
            disks: Disks::new_with_refreshed_list(),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn percent(used: u64, total: u64) -> Option<f32> {
    (total > 0).then(|| (used as f64 / total as f64 * 100.0) as f32)
}

impl MetricsProbe for SysinfoProbe {
    fn sample(&mut self) -> ResourceUsage {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();
        self.disks.refresh(true);

        let (total_disk, used_disk) = self
            .disks
            .iter()
            .map(|d| (d.total_space(), d.total_space().saturating_sub(d.available_space())))
            .fold((0u64, 0u64), |(t, u), (dt, du)| (t + dt, u + du));

        ResourceUsage {
            cpu_percent: self.system.global_cpu_usage(),
            memory_percent: percent(self.system.used_memory(), self.system.total_memory())
                .unwrap_or(0.0),
            disk_percent: percent(used_disk, total_disk),
        }
    }
}

/// Which resource thresholds a sample breaches, as freeze reasons
#[must_use]
pub fn threshold_breaches(usage: &ResourceUsage, cpu_max: f32, memory_max: f32) -> Vec<String> {
    let mut breaches = Vec::new();
    if usage.cpu_percent > cpu_max {
        breaches.push(format!(
            "cpu {:.1}% exceeds threshold {cpu_max:.1}%",
            usage.cpu_percent
        ));
    }
    if usage.memory_percent > memory_max {
        breaches.push(format!(
            "memory {:.1}% exceeds threshold {memory_max:.1}%",
            usage.memory_percent
        ));
    }
    breaches
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysinfo_probe_reports_sane_values() {
        let mut probe = SysinfoProbe::new();
        let usage = probe.sample();
        assert!(usage.cpu_percent >= 0.0);
        assert!((0.0..=100.0).contains(&usage.memory_percent));
    }

    #[test]
    fn test_threshold_breaches() {
        let usage = ResourceUsage {
            cpu_percent: 95.0,
            memory_percent: 40.0,
            disk_percent: None,
        };
        let breaches = threshold_breaches(&usage, 90.0, 85.0);
        assert_eq!(breaches.len(), 1);
        assert!(breaches[0].starts_with("cpu 95.0%"));

        assert!(threshold_breaches(&usage, 99.0, 85.0).is_empty());
    }

    #[test]
    fn test_percent_of_zero_total() {
        assert_eq!(percent(10, 0), None);
        assert_eq!(percent(50, 200), Some(25.0));
    }
}

//! Memory-pressure detection for in-memory feature accumulation.
//!
//! The monitor compares available system memory against a baseline taken at
//! session start (and again after every spill). Pressure is declared when
//! consuming as much memory again as was consumed since the baseline would
//! leave less than the policy's reserve available.

use log::debug;
use sysinfo::System;

use crate::options::MemoryPolicy;

/// Source of available-memory readings.
pub trait MemoryProbe: Send {
    /// Currently available system memory in bytes.
    fn available_bytes(&mut self) -> u64;
}

/// [`MemoryProbe`] reading the operating system's memory counters.
pub struct SystemMemoryProbe {
    system: System,
}

impl SystemMemoryProbe {
    #[must_use]
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn available_bytes(&mut self) -> u64 {
        self.system.refresh_memory();
        self.system.available_memory()
    }
}

/// Tracks memory consumed since the last baseline and decides when to spill.
pub struct MemoryPressureMonitor {
    probe: Box<dyn MemoryProbe>,
    policy: MemoryPolicy,
    baseline: u64,
}

impl MemoryPressureMonitor {
    /// Create a monitor and take the initial baseline.
    pub fn new(mut probe: Box<dyn MemoryProbe>, policy: MemoryPolicy) -> Self {
        let baseline = probe.available_bytes();
        debug!("Memory baseline: {baseline} bytes available");
        Self {
            probe,
            policy,
            baseline,
        }
    }

    /// Take a fresh available-memory reading.
    pub fn sample(&mut self) -> u64 {
        self.probe.available_bytes()
    }

    #[must_use]
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// Decide whether the drop from `baseline` to `current` warrants a spill.
    #[must_use]
    pub fn should_spill(&self, baseline: u64, current: u64) -> bool {
        let drop = baseline.saturating_sub(current);
        if drop == 0 {
            return false;
        }
        let projected = current.saturating_sub(drop);
        projected < self.policy.reserve_bytes
    }

    /// Sample and apply [`Self::should_spill`] against the current baseline.
    pub fn under_pressure(&mut self) -> bool {
        let current = self.sample();
        let pressure = self.should_spill(self.baseline, current);
        debug!(
            "Memory check: baseline {} bytes, available {current} bytes, pressure={pressure}",
            self.baseline
        );
        pressure
    }

    /// Reset the baseline, typically right after a spill.
    pub fn rebaseline(&mut self) {
        self.baseline = self.sample();
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedProbe;
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn monitor(readings: Vec<u64>, reserve_bytes: u64) -> MemoryPressureMonitor {
        MemoryPressureMonitor::new(
            Box::new(ScriptedProbe::new(readings)),
            MemoryPolicy { reserve_bytes },
        )
    }

    #[test]
    fn no_drop_means_no_pressure() {
        let monitor = monitor(vec![8 * GIB], GIB);
        assert!(!monitor.should_spill(8 * GIB, 8 * GIB));
        assert!(!monitor.should_spill(8 * GIB, 9 * GIB));
    }

    #[test]
    fn projected_drop_below_reserve_triggers() {
        let monitor = monitor(vec![8 * GIB], GIB);
        // 3 GiB used, another 3 GiB leaves 2 GiB: fine
        assert!(!monitor.should_spill(8 * GIB, 5 * GIB));
        // 4 GiB used, another 4 GiB leaves 0: spill
        assert!(monitor.should_spill(8 * GIB, 4 * GIB));
    }

    #[test]
    fn never_and_always_policies() {
        let never = monitor(vec![8 * GIB], MemoryPolicy::never_spill().reserve_bytes);
        assert!(!never.should_spill(8 * GIB, 1));

        let always = monitor(vec![8 * GIB], MemoryPolicy::always_spill().reserve_bytes);
        assert!(always.should_spill(8 * GIB, 8 * GIB - 1));
        assert!(!always.should_spill(8 * GIB, 8 * GIB));
    }

    #[test]
    fn rebaseline_measures_since_last_relief() {
        let mut monitor = monitor(vec![8 * GIB, 4 * GIB, 4 * GIB, 3 * GIB], 2 * GIB);
        assert_eq!(monitor.baseline(), 8 * GIB);

        assert!(monitor.under_pressure());
        monitor.rebaseline();
        assert_eq!(monitor.baseline(), 4 * GIB);

        // 1 GiB used since the spill; another leaves 2 GiB, equal to the reserve
        assert!(!monitor.under_pressure());
    }

    #[test]
    fn system_probe_reports_memory() {
        let mut probe = SystemMemoryProbe::new();
        assert!(probe.available_bytes() > 0);
    }
}

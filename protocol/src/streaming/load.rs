//! Host load sampling for admission.
//!
//! A node refuses new streams when free memory drops under a floor or the
//! one-minute load average exceeds `load_factor_limit × cpus`. Figures the
//! platform cannot provide are treated as healthy.

use tracing::debug;

use crate::config::AdmissionConfig;

pub trait LoadSource: Send + Sync {
    fn free_memory_bytes(&self) -> Option<u64>;

    /// One-minute load average.
    fn load_average(&self) -> Option<f64>;

    fn cpu_count(&self) -> usize;
}

/// Reads the running host via libc.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoad;

impl LoadSource for SystemLoad {
    #[cfg(target_os = "linux")]
    fn free_memory_bytes(&self) -> Option<u64> {
        // SAFETY: sysinfo is a plain C struct; zeroed is a valid value.
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        // SAFETY: info is a valid out pointer.
        if unsafe { libc::sysinfo(&mut info) } != 0 {
            return None;
        }
        #[allow(clippy::unnecessary_cast)]
        Some(info.freeram as u64 * info.mem_unit as u64)
    }

    #[cfg(not(target_os = "linux"))]
    fn free_memory_bytes(&self) -> Option<u64> {
        None
    }

    #[cfg(target_family = "unix")]
    fn load_average(&self) -> Option<f64> {
        let mut loads = [0f64; 3];
        // SAFETY: loads has room for the 3 samples requested.
        let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
        (n >= 1).then_some(loads[0])
    }

    #[cfg(not(target_family = "unix"))]
    fn load_average(&self) -> Option<f64> {
        None
    }

    fn cpu_count(&self) -> usize {
        num_cpus::get()
    }
}

/// Fixed readings.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoad {
    pub free_memory: Option<u64>,
    pub load: Option<f64>,
    pub cpus: usize,
}

impl FixedLoad {
    pub fn idle() -> Self {
        Self {
            free_memory: Some(u64::MAX),
            load: Some(0.0),
            cpus: 4,
        }
    }
}

impl LoadSource for FixedLoad {
    fn free_memory_bytes(&self) -> Option<u64> {
        self.free_memory
    }

    fn load_average(&self) -> Option<f64> {
        self.load
    }

    fn cpu_count(&self) -> usize {
        self.cpus
    }
}

/// Whether the host is too busy to admit another stream.
pub fn is_overloaded(source: &dyn LoadSource, config: &AdmissionConfig) -> bool {
    if let Some(free) = source.free_memory_bytes() {
        if free < config.min_free_memory_bytes {
            debug!(free, floor = config.min_free_memory_bytes, "free memory under floor");
            return true;
        }
    }
    if let Some(load) = source.load_average() {
        let limit = config.load_factor_limit * source.cpu_count().max(1) as f64;
        if load > limit {
            debug!(load, limit, "load average over limit");
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds() {
        let config = AdmissionConfig::default();
        assert!(!is_overloaded(&FixedLoad::idle(), &config));

        let low_memory = FixedLoad {
            free_memory: Some(config.min_free_memory_bytes - 1),
            ..FixedLoad::idle()
        };
        assert!(is_overloaded(&low_memory, &config));

        // 4 cpus × 0.8 = 3.2
        let busy = FixedLoad {
            load: Some(3.3),
            ..FixedLoad::idle()
        };
        assert!(is_overloaded(&busy, &config));
        let fine = FixedLoad {
            load: Some(3.2),
            ..FixedLoad::idle()
        };
        assert!(!is_overloaded(&fine, &config));
    }

    #[test]
    fn unknown_readings_are_healthy() {
        let blind = FixedLoad {
            free_memory: None,
            load: None,
            cpus: 0,
        };
        assert!(!is_overloaded(&blind, &AdmissionConfig::default()));
    }

    #[test]
    fn system_load_answers() {
        assert!(SystemLoad.cpu_count() >= 1);
        #[cfg(target_os = "linux")]
        assert!(SystemLoad.free_memory_bytes().is_some());
    }
}

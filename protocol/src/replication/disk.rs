//! Disk utilisation sampling.
//!
//! When usage cannot be determined the replication check fails open: an
//! unknown disk is treated as having room.

use std::path::Path;

use tracing::debug;

/// Source of filesystem usage figures.
pub trait DiskUsage: Send + Sync {
    /// Percent used (0-100) of the filesystem holding `path`, or `None`
    /// when unavailable.
    fn usage_percent(&self, path: &Path) -> Option<u64>;
}

/// Usage percentage from total and available bytes.
pub fn usage_percent(total: u64, available: u64) -> u64 {
    if total == 0 {
        return 0;
    }
    total.saturating_sub(available).saturating_mul(100) / total
}

/// `statvfs(3)` on unix; unavailable elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsUsage;

impl DiskUsage for StatvfsUsage {
    #[cfg(target_family = "unix")]
    fn usage_percent(&self, path: &Path) -> Option<u64> {
        use std::os::unix::ffi::OsStrExt;

        let path_cstr = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
        // SAFETY: statvfs is plain integers; zeroed is a valid value.
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: path_cstr is NUL-terminated and stat is a valid out pointer.
        let rc = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
        if rc != 0 {
            debug!(path = %path.display(), error = %std::io::Error::last_os_error(), "statvfs failed");
            return None;
        }

        #[allow(clippy::unnecessary_cast)]
        let (total, available) = (
            stat.f_blocks as u64 * stat.f_frsize as u64,
            stat.f_bavail as u64 * stat.f_frsize as u64,
        );
        Some(usage_percent(total, available))
    }

    #[cfg(not(target_family = "unix"))]
    fn usage_percent(&self, _path: &Path) -> Option<u64> {
        None
    }
}

/// Fixed answer, for tests and for operators who want to pin the check.
#[derive(Debug, Clone, Copy)]
pub struct FixedUsage(pub Option<u64>);

impl DiskUsage for FixedUsage {
    fn usage_percent(&self, _path: &Path) -> Option<u64> {
        self.0
    }
}

/// `true` when usage is below `threshold_percent` or unknown.
pub fn has_disk_budget(usage: &dyn DiskUsage, path: &Path, threshold_percent: u64) -> bool {
    match usage.usage_percent(path) {
        Some(used) => used < threshold_percent,
        None => {
            debug!(path = %path.display(), "disk usage unavailable, allowing replication");
            true
        }
    }
}

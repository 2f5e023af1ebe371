use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;
use std::thread;

use error_stack::Report;
use error_stack::ResultExt;

use super::DiskInfo;
use super::HostResources;
use super::MemoryInfo;
use super::PlatformError;

const GIB: u64 = 1024 * 1024 * 1024;

/// Capacity read from `/proc/meminfo`, the scheduler's CPU set and `statvfs`.
#[derive(Debug, Clone)]
pub struct LinuxHostResources {
    meminfo_path: PathBuf,
}

impl Default for LinuxHostResources {
    fn default() -> Self {
        Self {
            meminfo_path: PathBuf::from("/proc/meminfo"),
        }
    }
}

/// Parse the `MemTotal`, `MemFree`, `Buffers` and `Cached` lines, all in kB.
///
/// Free memory counts page cache and buffers as reclaimable.
pub fn parse_meminfo(content: &str) -> Option<MemoryInfo> {
    let mut total = None;
    let mut free = 0u64;
    for line in content.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(kb) = rest
            .split_whitespace()
            .next()
            .and_then(|v| v.parse::<u64>().ok())
        else {
            continue;
        };
        match key {
            "MemTotal" => total = Some(kb),
            "MemFree" | "Buffers" | "Cached" => free += kb,
            _ => {}
        }
    }
    total.map(|total_kb| MemoryInfo {
        total_mb: total_kb / 1024,
        free_mb: free / 1024,
    })
}

impl HostResources for LinuxHostResources {
    fn cpu_count(&self) -> u64 {
        thread::available_parallelism().map_or(1, |n| n.get() as u64)
    }

    fn memory(&self) -> Result<MemoryInfo, Report<PlatformError>> {
        let resource_error = || PlatformError::HostResource {
            resource: self.meminfo_path.display().to_string(),
        };
        let content = fs::read_to_string(&self.meminfo_path).change_context_lazy(resource_error)?;
        parse_meminfo(&content).ok_or_else(|| {
            Report::new(resource_error()).attach_printable("MemTotal line is missing")
        })
    }

    fn disk(&self, path: &Path) -> Result<DiskInfo, Report<PlatformError>> {
        let resource_error = || PlatformError::HostResource {
            resource: format!("statvfs({})", path.display()),
        };
        let c_path = CString::new(path.as_os_str().as_bytes()).change_context_lazy(resource_error)?;

        // SAFETY: `c_path` is NUL-terminated and `stat` is a valid out pointer.
        let (rc, stat) = unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            let rc = libc::statvfs(c_path.as_ptr(), &mut stat);
            (rc, stat)
        };
        if rc != 0 {
            return Err(Report::new(std::io::Error::last_os_error()).change_context(resource_error()));
        }

        let fragment = stat.f_frsize as u64;
        let total = stat.f_blocks as u64 * fragment;
        let free = stat.f_bfree as u64 * fragment;
        Ok(DiskInfo {
            total_gb: total / GIB,
            used_gb: total.saturating_sub(free) / GIB,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_counts_cache_as_free() {
        let content = "MemTotal:       32768000 kB\n\
                       MemFree:         1024000 kB\n\
                       MemAvailable:   20000000 kB\n\
                       Buffers:          102400 kB\n\
                       Cached:          2048000 kB\n";

        let info = parse_meminfo(content).expect("should parse meminfo");

        assert_eq!(info.total_mb, 32000);
        assert_eq!(info.free_mb, (1024000 + 102400 + 2048000) / 1024);
    }

    #[test]
    fn meminfo_without_total_is_rejected() {
        assert_eq!(parse_meminfo("MemFree: 10 kB\n"), None);
    }

    #[test]
    fn statvfs_of_temp_dir_reports_capacity() {
        let dir = tempfile::tempdir().expect("should create temp dir");

        let disk = LinuxHostResources::default()
            .disk(dir.path())
            .expect("statvfs should succeed on an existing directory");

        assert!(disk.used_gb <= disk.total_gb);
    }

    #[test]
    fn statvfs_of_missing_path_fails() {
        let result = LinuxHostResources::default().disk(Path::new("/definitely/not/here"));
        assert!(result.is_err());
    }
}

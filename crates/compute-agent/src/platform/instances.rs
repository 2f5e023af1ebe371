use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::PathBuf;

use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;
use uuid::Uuid;

use super::PlatformError;
use super::VirtDriver;

/// Lists instances from the per-instance directories the hypervisor keeps.
///
/// Every directory under `instances_path` whose name is a UUID is a live instance.
#[derive(Debug, Clone)]
pub struct DirectoryInstanceLister {
    instances_path: PathBuf,
}

impl DirectoryInstanceLister {
    pub fn new(instances_path: impl Into<PathBuf>) -> Self {
        Self {
            instances_path: instances_path.into(),
        }
    }
}

impl VirtDriver for DirectoryInstanceLister {
    fn list_live_instance_ids(&self) -> Result<HashSet<String>, Report<PlatformError>> {
        let io_error = || PlatformError::Io {
            path: self.instances_path.display().to_string(),
        };

        let entries = match fs::read_dir(&self.instances_path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.instances_path.display(), "instances path does not exist yet");
                return Ok(HashSet::new());
            }
            Err(e) => return Err(Report::new(e).change_context(io_error())),
        };

        let mut live = HashSet::new();
        for entry in entries {
            let entry = entry.change_context_lazy(io_error)?;
            if !entry.file_type().change_context_lazy(io_error)?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if Uuid::parse_str(name).is_ok() {
                live.insert(name.to_string());
            }
        }
        Ok(live)
    }
}

//! Container isolation through device cgroups and the guest root filesystem.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use api_types::InstanceSpec;
use error_stack::Report;
use error_stack::ResultExt;
use tracing::debug;

use super::InstanceIsolation;
use super::PlatformError;

#[derive(Debug, Clone)]
pub struct CgroupIsolation {
    dev_cgroups_path: PathBuf,
    instances_path: PathBuf,
    guest_environment_file: PathBuf,
}

impl CgroupIsolation {
    pub fn new(
        dev_cgroups_path: impl Into<PathBuf>,
        instances_path: impl Into<PathBuf>,
        guest_environment_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            dev_cgroups_path: dev_cgroups_path.into(),
            instances_path: instances_path.into(),
            guest_environment_file: guest_environment_file.into(),
        }
    }

    fn allow_list(&self, instance: &InstanceSpec) -> PathBuf {
        self.dev_cgroups_path
            .join(&instance.name)
            .join("devices.allow")
    }

    fn guest_environment(&self, instance: &InstanceSpec) -> PathBuf {
        let relative = self
            .guest_environment_file
            .strip_prefix("/")
            .unwrap_or(&self.guest_environment_file);
        self.instances_path
            .join(&instance.uuid)
            .join("rootfs")
            .join(relative)
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), Report<PlatformError>> {
    let io_error = || PlatformError::Io {
        path: path.display().to_string(),
    };
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .change_context_lazy(io_error)?;
    file.write_all(line.as_bytes()).change_context_lazy(io_error)?;
    Ok(())
}

impl InstanceIsolation for CgroupIsolation {
    fn grant_device_access(
        &self,
        instance: &InstanceSpec,
        major: u32,
        minor: u32,
    ) -> Result<(), Report<PlatformError>> {
        let path = self.allow_list(instance);
        debug!(instance_id = %instance.uuid, major, minor, path = %path.display(), "allowing device");
        append_line(&path, &format!("c {major}:{minor} rwm\n"))
    }

    fn write_guest_environment(
        &self,
        instance: &InstanceSpec,
        key: &str,
        value: &str,
    ) -> Result<(), Report<PlatformError>> {
        let path = self.guest_environment(instance);
        debug!(instance_id = %instance.uuid, key, value, path = %path.display(), "writing guest environment");
        append_line(&path, &format!("{key}={value}\n"))
    }
}

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::domain::gpu::GpuDeviceNodes;

#[derive(Parser, Clone, Debug)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "COMPUTE_HOST",
        help = "Host name this agent reports and registers devices under"
    )]
    pub host: String,

    #[arg(
        long = "capability",
        env = "INSTANCE_TYPE_EXTRA_SPECS",
        value_delimiter = ';',
        help = "Static host capability as key:value, repeatable, e.g. cpu_arch:x86_64"
    )]
    pub capabilities: Vec<String>,

    #[arg(
        long,
        env = "COMPUTE_AGENT_STATE_PATH",
        default_value = "/var/lib/compute-agent",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory holding the allocation files"
    )]
    pub state_path: PathBuf,

    #[arg(long, default_value = "ibs_allocated.json")]
    pub ib_usage_file: String,

    #[arg(long, default_value = "gpus_allocated.json")]
    pub gpu_usage_file: String,

    #[arg(long, default_value = "pci_devices.json", help = "PCI device records and their owners")]
    pub pci_usage_file: String,

    #[arg(
        long,
        default_value = "instances_claimed.json",
        help = "Resources claimed by each prepared instance"
    )]
    pub ledger_file: String,

    #[arg(
        long,
        env = "PCI_PASSTHROUGH_DEVICES",
        default_value = "[]",
        help = "JSON list of PCI passthrough devices, e.g. '[{\"label\": \"fpga\", \"address\": \"0000:04:00.0\"}]'"
    )]
    pub pci_passthrough_devices: String,

    #[arg(
        long,
        env = "COMPUTE_NODE_ID",
        help = "Compute node id owning the registered PCI devices, defaults to the host name"
    )]
    pub compute_node_id: Option<String>,

    #[arg(
        long,
        env = "INSTANCES_PATH",
        default_value = "/var/lib/compute-agent/instances",
        value_hint = clap::ValueHint::DirPath,
        help = "Directory with one sub-directory per instance UUID"
    )]
    pub instances_path: PathBuf,

    #[arg(
        long,
        env = "DEV_CGROUPS_PATH",
        default_value = "/sys/fs/cgroup/devices/lxc",
        value_hint = clap::ValueHint::DirPath,
        help = "Devices cgroup directory of the container instances"
    )]
    pub dev_cgroups_path: PathBuf,

    #[arg(long, default_value_t = 195, help = "Character device major number of the GPU driver")]
    pub gpu_dev_major_number: u32,

    #[arg(long, default_value_t = 255, help = "Minor number of the GPU control device")]
    pub gpu_control_minor: u32,

    #[arg(
        long,
        default_value = "/etc/environment",
        help = "Guest file receiving the device environment variables"
    )]
    pub guest_environment_file: PathBuf,

    #[arg(long, default_value_t = 10, help = "Seconds between capability reports")]
    pub report_interval_secs: u64,

    #[arg(
        long,
        env = "API_LISTEN_ADDR",
        default_value = "0.0.0.0:8080",
        help = "HTTP API server listen address"
    )]
    pub api_listen_addr: String,

    #[arg(
        long,
        env = "COMPUTE_AGENT_AUDIT_LOG",
        default_value = "/var/log/compute-agent/allocation.log",
        value_hint = clap::ValueHint::FilePath,
        help = "Rolling file receiving the allocation audit trail"
    )]
    pub audit_log_file: PathBuf,
}

impl DaemonArgs {
    pub fn compute_node_id(&self) -> &str {
        self.compute_node_id.as_deref().unwrap_or(&self.host)
    }

    pub fn ib_usage_path(&self) -> PathBuf {
        self.state_path.join(&self.ib_usage_file)
    }

    pub fn gpu_usage_path(&self) -> PathBuf {
        self.state_path.join(&self.gpu_usage_file)
    }

    pub fn pci_usage_path(&self) -> PathBuf {
        self.state_path.join(&self.pci_usage_file)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_path.join(&self.ledger_file)
    }

    pub fn gpu_device_nodes(&self) -> GpuDeviceNodes {
        GpuDeviceNodes {
            major: self.gpu_dev_major_number,
            control_minor: self.gpu_control_minor,
        }
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs.max(1))
    }

    pub fn audit_log_file(&self) -> &Path {
        &self.audit_log_file
    }
}

use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use utils::version;

use super::daemon::DaemonArgs;

#[derive(Parser)]
#[command(
    about = "Compute host agent for Infiniband, GPU and PCI passthrough devices",
    long_about = "Keeps the device allocation tables of a compute host, exposes devices to instances and reports host capabilities to the scheduler.",
    version = &**version::VERSION
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the compute agent daemon
    Daemon(Box<DaemonArgs>),
    /// Print the persisted allocation tables of this host
    #[command(name = "show-allocations")]
    ShowAllocations(ShowAllocationsArgs),
    /// Validate a PCI passthrough device list without registering anything
    #[command(name = "validate-pci")]
    ValidatePci(ValidatePciArgs),
}

#[derive(Parser, Clone)]
pub struct ShowAllocationsArgs {
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

    #[arg(long, default_value = "pci_devices.json")]
    pub pci_usage_file: String,
}

#[derive(Parser, Clone)]
pub struct ValidatePciArgs {
    #[arg(
        long,
        env = "PCI_PASSTHROUGH_DEVICES",
        help = "JSON list of PCI passthrough devices, e.g. '[{\"label\": \"fpga\", \"address\": \"0000:04:00.0\"}]'"
    )]
    pub devices: String,

    #[arg(long, env = "COMPUTE_HOST", default_value = "localhost")]
    pub host: String,
}

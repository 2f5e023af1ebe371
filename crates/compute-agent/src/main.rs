use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use compute_agent::allocation::AllocationStore;
use compute_agent::allocation::DeviceHandle;
use compute_agent::allocation::LoadOutcome;
use compute_agent::app::ApplicationBuilder;
use compute_agent::config::Cli;
use compute_agent::config::Commands;
use compute_agent::config::DaemonArgs;
use compute_agent::config::ShowAllocationsArgs;
use compute_agent::config::ValidatePciArgs;
use compute_agent::infiniband::IbFunction;
use compute_agent::logging;
use compute_agent::pci::validate_and_parse;
use compute_agent::platform::FilePciDeviceStore;
use serde::Serialize;
use serde_json::json;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(*daemon_args).await,
        Commands::ShowAllocations(args) => show_allocations(&args),
        Commands::ValidatePci(args) => validate_pci(&args),
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = logging::init(daemon_args.audit_log_file())?;

    tracing::info!("Starting compute agent daemon {}", &**version::VERSION);

    let app = ApplicationBuilder::new(daemon_args).build().await?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}

fn describe<T: Serialize>(path: &Path, outcome: LoadOutcome<T>) -> serde_json::Value {
    let path = path.display().to_string();
    match outcome {
        LoadOutcome::Loaded(entries) => json!({ "path": path, "status": "loaded", "entries": entries }),
        LoadOutcome::Missing => json!({ "path": path, "status": "missing" }),
        LoadOutcome::Corrupt(reason) => json!({ "path": path, "status": "corrupt", "reason": reason }),
        LoadOutcome::UnsupportedVersion(v) => {
            json!({ "path": path, "status": "unsupported_version", "version": v })
        }
    }
}

fn describe_table<H: DeviceHandle>(store: &AllocationStore) -> serde_json::Value {
    describe(store.path(), store.load_outcome::<H>())
}

fn show_allocations(args: &ShowAllocationsArgs) -> Result<()> {
    let infiniband = AllocationStore::new(args.state_path.join(&args.ib_usage_file));
    let gpus = AllocationStore::new(args.state_path.join(&args.gpu_usage_file));
    let pci_path = args.state_path.join(&args.pci_usage_file);

    let tables = json!({
        "infiniband": describe_table::<IbFunction>(&infiniband),
        "gpus": describe_table::<u32>(&gpus),
        "pci_devices": describe(&pci_path, FilePciDeviceStore::read(&pci_path)),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&tables).context("failed to render allocation tables")?
    );
    Ok(())
}

fn validate_pci(args: &ValidatePciArgs) -> Result<()> {
    let records = validate_and_parse(&args.devices, &args.host)
        .context("invalid PCI passthrough device list")?;
    for record in &records {
        println!("{}\t{}", record.address, record.label);
    }
    println!("{} PCI passthrough device(s) valid", records.len());
    Ok(())
}

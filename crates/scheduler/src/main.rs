use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use api_types::InstanceSpec;
use api_types::StringMap;
use clap::Parser;
use clap::Subcommand;
use hetero_scheduler::CapabilityCollector;
use hetero_scheduler::CapabilitySource;
use hetero_scheduler::HostStateManager;
use hetero_scheduler::HttpCapabilitySource;
use hetero_scheduler::PlacementRequest;
use hetero_scheduler::ResourceAwareScheduler;
use hetero_scheduler::SelectionPolicy;
use hetero_scheduler::COMPUTE_TOPIC;
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;
use utils::logging::LOG_PATH_ENV_VAR;
use utils::version;

#[derive(Parser)]
#[command(
    about = "Resource-aware scheduler for heterogeneous compute hosts",
    long_about = "Collects capability reports from compute agents and picks a host whose architecture, capacity, devices and tags satisfy an instance.",
    version = &**version::VERSION
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll the agents once and print the host chosen for an instance
    Place(PlaceArgs),
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))
}

#[derive(Parser)]
struct PlaceArgs {
    #[arg(
        long = "agent",
        env = "COMPUTE_AGENT_URLS",
        value_delimiter = ',',
        required = true,
        help = "Base URL of a compute agent API, repeatable, e.g. http://host1:8080"
    )]
    agents: Vec<String>,

    #[arg(long, default_value_t = 0)]
    vcpus: u64,

    #[arg(long, default_value_t = 0)]
    memory_mb: u64,

    #[arg(long, default_value_t = 0)]
    local_gb: u64,

    #[arg(
        long = "extra-spec",
        value_parser = parse_key_value,
        help = "Flavor extra spec as key=value, repeatable, e.g. cpu_arch=x86_64"
    )]
    extra_specs: Vec<(String, String)>,

    #[arg(
        long = "metadata",
        value_parser = parse_key_value,
        help = "Instance metadata as key=value, repeatable"
    )]
    metadata: Vec<(String, String)>,

    #[arg(
        long,
        default_value_t = 60,
        help = "Agent report interval in seconds, reports older than three intervals are stale"
    )]
    periodic_interval_secs: u64,

    #[arg(long, default_value_t = 16, help = "Agents polled concurrently")]
    max_concurrency: usize,

    #[arg(long, help = "Pick the first candidate by host name instead of a random one")]
    first_fit: bool,

    #[arg(long, default_value_t = 10, help = "Per-agent request timeout in seconds")]
    timeout_secs: u64,
}

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

fn init_logging() {
    let fmt_layer = utils::logging::get_fmt_layer(std::env::var(LOG_PATH_ENV_VAR).ok());
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();
    registry().with(fmt_layer.with_filter(env_filter)).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Commands::Place(args) => run_place(args).await,
    }
}

async fn run_place(args: PlaceArgs) -> Result<()> {
    tracing::info!("Starting hetero-scheduler {}", &**version::VERSION);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(args.timeout_secs))
        .build()?;
    let sources = args
        .agents
        .iter()
        .map(|url| Arc::new(HttpCapabilitySource::new(client.clone(), url)) as Arc<dyn CapabilitySource>)
        .collect();

    let hosts = Arc::new(HostStateManager::new(Duration::from_secs(
        args.periodic_interval_secs,
    )));
    let collector = CapabilityCollector::new(sources, hosts.clone(), args.max_concurrency);
    let recorded = collector.poll_once().await;
    tracing::info!(recorded, agents = args.agents.len(), "collected host capabilities");

    let spec = InstanceSpec {
        vcpus: args.vcpus,
        memory_mb: args.memory_mb,
        local_gb: args.local_gb,
        extra_specs: args.extra_specs.into_iter().collect::<StringMap>(),
        metadata: args.metadata.into_iter().collect::<StringMap>(),
        ..Default::default()
    };
    let request = PlacementRequest::from_instance(&spec)?;

    let policy = if args.first_fit {
        SelectionPolicy::FirstFit
    } else {
        SelectionPolicy::Random
    };
    let host = ResourceAwareScheduler::new(hosts, policy).schedule(COMPUTE_TOPIC, &request)?;
    println!("{host}");
    Ok(())
}

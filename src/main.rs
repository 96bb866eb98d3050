use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use etcd_shepherd::config::ShepherdConfig;
use etcd_shepherd::identity::NodeIdentity;
use etcd_shepherd::membership::MembershipClient;
use etcd_shepherd::planner::ClusterJoinPlanner;
use etcd_shepherd::shutdown::shutdown_token;
use etcd_shepherd::supervisor::ProcessSupervisor;
use etcd_shepherd::watcher::EventStreamWatcher;

#[derive(Parser, Debug)]
#[command(name = "etcd-shepherd")]
#[command(version)]
#[command(about = "Membership supervisor for etcd clusters running on Kubernetes")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Probe the cluster, register this node and launch the consensus engine
    Start(StartArgs),

    /// Watch pod lifecycle events and evict dead members
    Watch(WatchArgs),
}

#[derive(Parser, Debug)]
struct StartArgs {
    /// Path to the configuration file
    #[arg(long, short = 'c', default_value = "/etc/etcd-shepherd/config.json")]
    config: PathBuf,

    /// Also run the event watcher alongside the engine
    #[arg(long)]
    with_watcher: bool,
}

#[derive(Parser, Debug)]
struct WatchArgs {
    /// Path to the configuration file
    #[arg(long, short = 'c', default_value = "/etc/etcd-shepherd/config.json")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Start(start_args) => run_start(start_args).await?,
        Commands::Watch(watch_args) => run_watch(watch_args).await?,
    }
    Ok(())
}

/// One-shot join sequence followed by engine supervision. Any error here
/// aborts startup; the orchestrator observes the exit and restarts the node.
async fn run_start(args: StartArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ShepherdConfig::load(&args.config).await?;
    let identity = NodeIdentity::resolve(&config)?;
    tracing::info!(name = %identity.name, peer_url = %identity.peer_url, "resolved node identity");

    let membership = MembershipClient::from_config(&config).await?;
    let planner = ClusterJoinPlanner::new(
        membership.clone(),
        identity.clone(),
        config.bootstrap_gate.clone(),
    );
    let plan = planner.plan().await?;
    tracing::info!(plan = ?plan, "join plan decided");

    let shutdown = shutdown_token();
    if args.with_watcher {
        let watcher = EventStreamWatcher::from_config(&config, membership).await?;
        let watcher_shutdown = shutdown.clone();
        tokio::spawn(async move {
            watcher.run(watcher_shutdown).await;
        });
    }

    let supervisor = ProcessSupervisor::new(config, identity);
    supervisor.run(plan, shutdown).await?;
    Ok(())
}

/// Standalone watcher loop; runs until SIGTERM/SIGINT.
async fn run_watch(args: WatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = ShepherdConfig::load(&args.config).await?;
    let membership = MembershipClient::from_config(&config).await?;
    let watcher = EventStreamWatcher::from_config(&config, membership).await?;

    let shutdown = shutdown_token();
    watcher.run(shutdown).await;
    Ok(())
}

//! mesh-node: runs a self-organizing mesh node.
//!
//! `run` joins a mesh over UDP on the local network. `simulate` runs a
//! whole mesh on the in-memory radio, for watching discovery and eviction
//! without hardware.

use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mesh_core::protocol::preview;
use mesh_core::sim::{SimMedium, SimRadioConfig};
use mesh_core::{LinkAddress, MeshConfig, MeshController, Transport};
use mesh_node::{NodeConfig, UdpRadio};

#[derive(Parser, Debug)]
#[command(name = "mesh-node")]
#[command(about = "Self-organizing radio mesh node")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one node over UDP until Ctrl+C
    Run {
        /// Local address to bind (overrides the config file)
        #[arg(short, long)]
        bind: Option<SocketAddrV4>,

        /// Broadcast destination; repeat for several (overrides the config file)
        #[arg(long = "broadcast")]
        broadcast: Vec<SocketAddrV4>,

        /// Path to a JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Run several nodes on a simulated radio
    Simulate {
        /// Number of nodes
        #[arg(long, default_value_t = 4)]
        nodes: u8,

        /// Probability that a unicast frame is lost (0.0 - 1.0)
        #[arg(long, default_value_t = 0.0)]
        loss: f64,

        /// Total run time in seconds
        #[arg(long, default_value_t = 10)]
        seconds: u64,

        /// Node number (1-based) to power off halfway through
        #[arg(long)]
        kill: Option<u8>,

        /// Length of one protocol time unit in ms (beacon interval)
        #[arg(long, default_value_t = 100)]
        unit_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,mesh_node=debug,mesh_core=debug"
    } else {
        "info,mesh_node=info,mesh_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::Run {
            bind,
            broadcast,
            config,
        } => run(bind, broadcast, config).await,
        Command::Simulate {
            nodes,
            loss,
            seconds,
            kill,
            unit_ms,
        } => simulate(nodes, loss, seconds, kill, unit_ms).await,
    }
}

async fn run(
    bind: Option<SocketAddrV4>,
    broadcast: Vec<SocketAddrV4>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let mut config = NodeConfig::load_or_default(config_path.as_deref())?;
    if let Some(bind) = bind {
        config.radio.bind = bind;
    }
    if !broadcast.is_empty() {
        config.radio.broadcast_targets = broadcast;
    }
    config.validate()?;

    info!("Starting mesh-node");
    info!("Bind address: {}", config.radio.bind);
    info!("Broadcast targets: {:?}", config.radio.broadcast_targets);

    let radio = UdpRadio::bind(&config.radio)
        .await
        .with_context(|| format!("Failed to bind UDP socket on {}", config.radio.bind))?;
    info!("Node address: {}", radio.local_address());

    let (controller, mut inbound) = MeshController::new(Arc::new(radio), config.mesh_config());
    let controller = Arc::new(controller);
    let _events = controller
        .events()
        .subscribe(|event| info!("Mesh event: {}", event.to_json()));

    let mut node = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.start().await })
    };

    info!("Node running. Press Ctrl+C to stop.");

    let outcome = loop {
        tokio::select! {
            Some(frame) = inbound.recv() => {
                info!("Message from {}: {}", frame.from, preview(&frame.payload));
            }

            result = &mut node => break result,

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                controller.stop();
                break (&mut node).await;
            }
        }
    };

    outcome
        .context("Mesh task panicked")?
        .context("Mesh node failed")?;

    for peer in controller.peers().all() {
        info!("Peer {} (failures: {})", peer.address, peer.failure_count);
    }
    info!("Shutting down");
    Ok(())
}

fn sim_address(node: u8) -> LinkAddress {
    LinkAddress::new([0x24, 0x0a, 0xc4, 0x00, 0x00, node])
}

async fn simulate(nodes: u8, loss: f64, seconds: u64, kill: Option<u8>, unit_ms: u64) -> Result<()> {
    ensure!(nodes >= 1, "at least one node is required");
    ensure!((0.0..=1.0).contains(&loss), "loss must be between 0 and 1");
    ensure!(unit_ms > 0, "unit_ms must be positive");
    if let Some(kill) = kill {
        ensure!(
            (1..=nodes).contains(&kill),
            "--kill must name a node between 1 and {}",
            nodes
        );
    }

    let medium = SimMedium::new();
    let config = MeshConfig::with_time_unit(Duration::from_millis(unit_ms));
    info!(
        "Simulating {} node(s) for {}s (time unit {}ms, loss {})",
        nodes, seconds, unit_ms, loss
    );

    let mut controllers = Vec::new();
    let mut subscriptions = Vec::new();
    let mut tasks = Vec::new();

    for n in 1..=nodes {
        let address = sim_address(n);
        let radio = medium.join(
            address,
            SimRadioConfig {
                loss,
                ..Default::default()
            },
        );
        // Data frames are not used in the simulation; drop the receiver.
        let (controller, _) = MeshController::new(Arc::new(radio), config.clone());
        let controller = Arc::new(controller);

        subscriptions.push(
            controller
                .events()
                .subscribe(move |event| info!("[{}] {}", address, event.to_json())),
        );

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.start().await })
        };
        controllers.push(controller);
        tasks.push(task);
    }

    let total = Duration::from_secs(seconds);
    tokio::time::sleep(total / 2).await;

    if let Some(kill) = kill {
        let address = sim_address(kill);
        warn!("Powering off node {}", address);
        medium.power_off(address);
    }

    tokio::time::sleep(total - total / 2).await;

    for controller in &controllers {
        controller.stop();
    }
    for (n, result) in join_all(tasks).await.into_iter().enumerate() {
        if let Err(e) = result.context("Mesh task panicked")? {
            warn!("Node {} ended with error: {}", sim_address(n as u8 + 1), e);
        }
    }

    println!("{:<20} {:<7} peers", "node", "joined");
    for controller in &controllers {
        let peers: Vec<String> = controller
            .peers()
            .all()
            .iter()
            .map(|peer| peer.address.to_string())
            .collect();
        println!(
            "{:<20} {:<7} {}",
            controller.local_address().to_string(),
            controller.state().is_joined().to_string(),
            peers.join(", ")
        );
    }

    drop(subscriptions);
    Ok(())
}

pub mod config;
pub mod error;
pub mod message;
pub mod network;
pub mod peer;
pub mod registry;
pub mod service;
pub mod truststore;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use config::{Config, KnownPeers};
use error::AppError;
use network::discovery::Discovery;
use network::link::LinkContext;
use network::port_pool::PortPool;
use network::tls::TlsStack;
use registry::DeviceRegistry;
use service::{PingService, Service};
use truststore::{FileTrustStore, TrustStore};

#[derive(Parser, Debug)]
#[command(name = "tetherd", version, about = "LAN device companion daemon")]
struct Args {
    /// Configuration file (default: <data dir>/tether.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn setup_logging(configured: &str, verbose: u8) {
    let level = match verbose {
        0 => configured,
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let args = Args::parse();
    let data_dir = config::get_data_dir();
    let config_path = args.config.unwrap_or_else(|| data_dir.join("tether.toml"));
    let config = Config::load_or_create(&config_path)?;
    setup_logging(&config.logging.level, args.verbose);
    info!(
        "tetherd starting as {} ({})",
        config.device.name, config.device.id
    );

    let trust: Arc<dyn TrustStore> =
        Arc::new(FileTrustStore::new(&data_dir, &config.device.id));
    let tls = Arc::new(TlsStack::new(trust.host_identity()?));
    let peers = Arc::new(KnownPeers::load(data_dir.join("peers.toml")));
    let (payload_first, payload_last) = config.network.payload_ports;
    let ctx = Arc::new(LinkContext {
        trust,
        tls,
        pool: PortPool::new(payload_first..=payload_last),
        peers,
        pairing_timeout: config.pairing_timeout(),
        payload_timeout: config.payload_listen_timeout(),
    });

    let services: Vec<Arc<dyn Service>> = vec![Arc::new(PingService)];
    let registry = DeviceRegistry::new(config.clone(), Arc::clone(&ctx), services);

    let discovery = Discovery::new(
        config,
        ctx,
        registry.incoming_capabilities(),
        registry.outgoing_capabilities(),
    );
    let delegate = Arc::downgrade(&registry);
    discovery.set_delegate(delegate);
    registry.set_announcer(Arc::downgrade(&discovery));
    discovery.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    discovery.shutdown();
    registry.shutdown();
    Ok(())
}

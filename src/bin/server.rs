use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use assist_hub::auth::LogMailer;
use assist_hub::config::Config;
use assist_hub::server::Server;
use assist_hub::store::{MemoryStore, Persistence};

#[derive(Parser)]
#[command(name = "server", about = "Expert-assistance WebSocket hub")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the config file)
    #[arg(long)]
    addr: Option<String>,

    /// Directory with accounts.json, devices.json and areas.json
    #[arg(long)]
    data: Option<PathBuf>,

    /// Seconds without a command before a connection is logged out; 0 disables
    #[arg(long)]
    idle_timeout: Option<u64>,
}

fn init_logging(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cfg.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(addr) = args.addr {
        cfg.addr = addr;
    }
    if let Some(dir) = args.data {
        cfg.data_dir = Some(dir);
    }
    if let Some(secs) = args.idle_timeout {
        cfg.idle_timeout_secs = secs;
    }

    init_logging(&cfg);

    let store: Arc<dyn Persistence> = match &cfg.data_dir {
        Some(dir) => Arc::new(MemoryStore::open(dir)?),
        None => Arc::new(MemoryStore::new()),
    };
    let addr = cfg.addr.clone();
    let (srv, hub_task) = Server::start(cfg, store, Arc::new(LogMailer));

    let notifier = srv.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutting down");
        let _ = notifier.notify_all("server shutting down").await;
        // Let write pumps flush the notice.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::process::exit(0);
    });

    tokio::select! {
        res = srv.listen_and_serve(&addr) => res,
        res = hub_task => {
            error!(result = ?res, "hub stopped, exiting");
            std::process::exit(1);
        }
    }
}

#![warn(missing_docs)]

//! `iiod` binary.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use iio_model::xml;
use iio_transport::CancelToken;
use iiod::{demo, Announcement, Daemon, IiodConfig, MemoryBackend, Server};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Serves an IIO context over the network.
#[derive(Debug, Parser)]
#[command(name = "iiod", version, about)]
struct Cli {
    /// Configuration file (TOML or JSON).
    #[arg(short, long, env = "IIOD_CONFIG")]
    config: Option<PathBuf>,

    /// TCP port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to listen on.
    #[arg(short, long)]
    addr: Option<std::net::IpAddr>,

    /// Context description to serve instead of the demo context.
    #[arg(long)]
    xml: Option<PathBuf>,

    /// Refuse compressed context requests.
    #[arg(long)]
    no_zstd: bool,

    /// Log as JSON lines.
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn load_config(&self) -> Result<IiodConfig> {
        let mut config = match &self.config {
            Some(path) => IiodConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => IiodConfig::default(),
        };
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(addr) = self.addr {
            config.bind_addr = addr;
        }
        if let Some(xml) = &self.xml {
            config.xml_path = Some(xml.clone());
        }
        if self.no_zstd {
            config.zstd_level = None;
        }
        Ok(config)
    }
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_backend(config: &IiodConfig) -> Result<MemoryBackend> {
    match &config.xml_path {
        None => Ok(demo::demo_backend()?),
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let ctx = xml::parse(&text).with_context(|| format!("parsing {}", path.display()))?;
            Ok(MemoryBackend::new(ctx))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_logging(&config.log_level, cli.log_json);

    let backend = load_backend(&config)?;
    tracing::info!(
        devices = iiod::Backend::context(&backend).devices().len(),
        xml = ?config.xml_path,
        "context loaded"
    );
    let daemon = Arc::new(Daemon::new(
        Arc::new(backend),
        config.zstd_level,
        config.default_timeout_ms,
    )?);

    let server = Server::new(daemon, config.max_connections);
    let listener = server.bind(&config.listen_addr().to_string()).await?;
    if config.announce {
        Announcement::new(config.listen_addr(), &HashSet::new()).log();
    }

    let shutdown = CancelToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupted, shutting down");
        }
        stop.cancel();
    });

    server.run(listener, shutdown).await?;
    Ok(())
}

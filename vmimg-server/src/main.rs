//! vmimg-serve - serve a local image mirror over HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vmimg_core::ImageConfig;
use vmimg_server::ImageServer;

#[derive(Parser, Debug)]
#[command(name = "vmimg-serve")]
#[command(version)]
#[command(about = "Serve mirrored VM images over HTTP", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long, default_value_t = 0)]
    port: u16,

    /// Directory to serve (default: the configured image dir)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let dir = cli.dir.unwrap_or_else(|| ImageConfig::from_env().image_dir);
    let server = ImageServer::bind(&cli.host, cli.port, &dir)
        .await
        .with_context(|| format!("cannot serve {}", dir.display()))?;

    // printed for scripts that start the server on an ephemeral port
    println!("{}", server.base_url());

    let handle = server.spawn();
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.stop().await;
    Ok(())
}

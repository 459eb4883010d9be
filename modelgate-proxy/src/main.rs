//! Modelgate Binary
//!
//! Standalone binary for the modelgate proxy. For library usage, see
//! [`modelgate_proxy`].

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use modelgate_proxy::{run_server, Config, ServerConfig};

#[derive(Parser)]
#[command(name = "modelgate")]
#[command(about = "Model-aware admission-control reverse proxy", long_about = None)]
#[command(disable_version_flag = true)]
struct Cli {
    /// Path to the config file. Defaults to config.yml or config.yaml next
    /// to the executable.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Print version information and exit
    #[arg(short = 'v', long)]
    version: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.version {
        println!("modelgate {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let default_filter = if cli.debug {
        "modelgate=debug,modelgate_proxy=debug,modelgate_core=debug,tower_http=debug"
    } else {
        "modelgate=info,modelgate_proxy=info,modelgate_core=info,tower_http=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => discover_config()?,
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    run_server(ServerConfig::from(config)).await
}

/// Look for config.yml, then config.yaml, next to the executable.
fn discover_config() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot determine executable path")?;
    let dir = exe.parent().unwrap_or_else(|| Path::new("."));

    let yml = dir.join("config.yml");
    let yaml = dir.join("config.yaml");
    match (yml.exists(), yaml.exists()) {
        (true, true) => anyhow::bail!(
            "both config.yml and config.yaml exist in {}; pass --config to pick one",
            dir.display()
        ),
        (true, false) => Ok(yml),
        (false, true) => Ok(yaml),
        (false, false) => anyhow::bail!(
            "no config file found in {}; place config.yaml there or pass --config",
            dir.display()
        ),
    }
}

use std::{path::PathBuf, sync::OnceLock};

use clap::{Args as ClapArgs, Parser, Subcommand};

/// Update safety for self-hosted container orchestration.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, global = true, default_value = "drydock-guard.toml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Swap the orchestrator's own container. Configured through the
    /// environment only; meant to run inside the controller container.
    SelfUpdate,
    /// Watch one freshly updated container and roll it back if it turns
    /// unhealthy.
    Monitor(MonitorArgs),
    /// Run the HTTP service.
    Serve,
}

#[derive(ClapArgs, Debug)]
pub struct MonitorArgs {
    /// Name of the container to watch.
    #[arg(long)]
    pub container: String,
    /// Image tag the container was just updated to.
    #[arg(long)]
    pub current_tag: String,
    /// Monitoring window in milliseconds. Defaults to the config file.
    #[arg(long)]
    pub window_ms: Option<u64>,
    /// Poll interval in milliseconds. Defaults to the config file.
    #[arg(long)]
    pub interval_ms: Option<u64>,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}

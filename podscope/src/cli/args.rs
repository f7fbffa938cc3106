//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "podscope",
    about = "Host-resident observability agent for container fleets",
    after_help = "\
EXAMPLES:
    sudo podscope                                  Run with /etc/podscope/podscope.toml
    sudo podscope --config ./podscope.toml         Run with a local config
    sudo podscope --listen 0.0.0.0:19704           Override the control-plane address"
)]
pub struct Args {
    /// Path to the config file
    #[arg(long, value_name = "PATH", default_value = crate::config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Override the control-plane listen address
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Override the region label
    #[arg(long, value_name = "REGION")]
    pub region: Option<String>,

    /// Validate the environment and config, then exit
    #[arg(long)]
    pub dry_run: bool,
}

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use crate::cache::UPDATE_CACHE_TAG;

/// Command-line arguments for the Stashpoint binary.
#[derive(Debug, Parser)]
#[command(
    name = "stashpoint",
    version,
    about = "Offline-first caching agent for single-page applications"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "STASHPOINT_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Install and activate the current cache version, then run the interception proxy.
    Serve(Box<ServeArgs>),
    /// Warm the current cache version from the asset manifest.
    Install(AgentArgs),
    /// Delete every cache version other than the current one.
    Activate(AgentArgs),
    /// Deliver a background-sync event.
    Sync(SyncArgs),
    /// List stored cache versions and their entry counts.
    Caches(AgentArgs),
}

impl Command {
    pub fn overrides(&self) -> &AgentOverrides {
        match self {
            Command::Serve(args) => &args.agent,
            Command::Install(args) | Command::Activate(args) | Command::Caches(args) => {
                &args.overrides
            }
            Command::Sync(args) => &args.overrides,
        }
    }
}

/// Overrides accepted by every command.
#[derive(Debug, Args, Default, Clone)]
pub struct AgentOverrides {
    /// Override the application scope (absolute base URL).
    #[arg(long = "scope", value_name = "URL")]
    pub scope: Option<String>,

    /// Override the active cache version.
    #[arg(long = "cache-version", value_name = "NAME")]
    pub cache_version: Option<String>,

    /// Override the cache storage directory.
    #[arg(long = "cache-directory", value_name = "PATH")]
    pub cache_directory: Option<PathBuf>,

    /// Keep caches in memory only.
    #[arg(long = "ephemeral", value_name = "BOOL", value_parser = BoolishValueParser::new())]
    pub ephemeral: Option<bool>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct AgentArgs {
    #[command(flatten)]
    pub overrides: AgentOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub agent: AgentOverrides,

    /// Override the proxy listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the proxy listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct SyncArgs {
    #[command(flatten)]
    pub overrides: AgentOverrides,

    /// Background-sync tag to deliver.
    #[arg(long, default_value = UPDATE_CACHE_TAG)]
    pub tag: String,
}

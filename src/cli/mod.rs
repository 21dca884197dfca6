use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod call;
pub mod config;
pub mod run;
pub mod schema;

use call::CallArgs;
use config::ConfigArgs;
use run::RunArgs;
use schema::SchemaArgs;

use worker_bridge::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "worker-bridge",
    about = "Multiplex concurrent JSON-RPC callers onto one stdio worker",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the bridge and serve JSON-RPC lines from stdin
    Run(RunArgs),

    /// Send one request to the worker and print the response
    Call(CallArgs),

    /// Emit JSON-Schema
    Schema(SchemaArgs),

    /// Handle configuration
    Config(ConfigArgs),
}

#[derive(Clone)]
pub struct CliContext {
    pub root: PathBuf,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(root: PathBuf, config_manager: ConfigManager) -> Self {
        Self {
            root,
            config_manager,
        }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Call(args) => call::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
        Commands::Config(args) => config::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}

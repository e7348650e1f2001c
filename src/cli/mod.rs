use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub mod config;
pub mod init;
pub mod list;
pub mod run;
pub mod schema;

use config::ConfigArgs;
use list::ListArgs;
use run::RunArgs;
use schema::SchemaArgs;

use switchboard::config::ConfigManager;

#[derive(Parser, Debug)]
#[command(
    name = "switchboard",
    about = "Hot-reloadable extension host for HTTP, scheduled and chat events",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the host
    Run(RunArgs),

    /// Emit JSON‐Schema
    Schema(SchemaArgs),

    /// Initialize a fresh layout
    Init,

    /// Load every extension once and report what registered
    List(ListArgs),

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
        Self { root, config_manager }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
        Commands::Init => init::execute(context).await,
        Commands::List(args) => list::execute(args, context).await,
        Commands::Config(args) => config::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}

use clap::Parser;

mod cli;

use cli::{Cli, CliContext, default_command, execute};
use switchboard::config::{ConfigManager, EnvConfigManager, root_from_env};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = root_from_env();
    let config_manager = ConfigManager(EnvConfigManager::new(root.join(".env")));
    let context = CliContext::new(root, config_manager);
    execute(&context, cli.command.unwrap_or_else(default_command)).await
}

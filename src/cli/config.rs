use clap::{Args, Subcommand};

use super::CliContext;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print every key in `<root>/.env`
    List,
    Get { key: String },
    Set { key: String, value: String },
    Delete { key: String },
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    let config = &context.config_manager;
    match args.command {
        ConfigCommands::List => {
            for (key, value) in config.0.as_vec().await {
                println!("{key}={value}");
            }
        }
        ConfigCommands::Get { key } => match config.value(&key).await {
            Some(value) => println!("{value}"),
            None => anyhow::bail!("{key} is not set"),
        },
        ConfigCommands::Set { key, value } => {
            config.0.set(&key, &value).await.map_err(anyhow::Error::msg)?;
            println!("✅ {key} set.");
        }
        ConfigCommands::Delete { key } => {
            config.0.del(&key).await;
            println!("✅ {key} removed.");
        }
    }
    Ok(())
}

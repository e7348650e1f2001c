use clap::Args;
use serde_json::json;

use super::CliContext;
use switchboard::config::HostConfig;
use switchboard::host::Host;
use switchboard::logger::Telemetry;

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,

    #[arg(long, default_value = "warn")]
    pub log_level: String,
}

pub async fn execute(args: ListArgs, context: &CliContext) -> anyhow::Result<()> {
    let _ = Telemetry::init_files(
        &args.log_level,
        context.root.join("logs/switchboard-list.log"),
        context.root.join("logs/switchboard-list.json"),
    );
    let config = HostConfig::load(context.root.clone(), &context.config_manager).await?;
    let host = Host::bootstrap(config).await?;
    let lifecycle = host.lifecycle();
    let (extensions, failed) = (lifecycle.extensions(), lifecycle.failed());

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({ "extensions": extensions, "failed": failed }))?
        );
    } else {
        println!("{} extension(s) under {}", extensions.len(), lifecycle.root().display());
        for ext in &extensions {
            println!("  ✅ {:<24} {:<6} {}", ext.unique_name, ext.kind, ext.path.display());
        }
        for fail in &failed {
            println!("  ❌ {:<24} {:?}: {}", fail.name, fail.stage, fail.error);
        }
    }
    host.shutdown().await;
    Ok(())
}

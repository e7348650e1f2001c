use anyhow::{Context, bail};
use clap::Args;
use tokio::signal;
use tracing::{error, info};

use super::CliContext;
use switchboard::config::HostConfig;
use switchboard::host::Host;
use switchboard::logger::init_tracing;

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318/v1/logs)
    #[arg(long)]
    pub otel_logs_endpoint: Option<String>,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318/v1/metrics)
    #[arg(long)]
    pub otel_events_endpoint: Option<String>,

    /// Override `SWITCHBOARD_HTTP_ADDR`
    #[arg(long)]
    pub addr: Option<std::net::SocketAddr>,

    /// Disable hot reload regardless of configuration
    #[arg(long)]
    pub no_watch: bool,
}

impl RunArgs {
    pub fn default_runtime() -> Self {
        Self {
            log_level: "info".to_string(),
            otel_logs_endpoint: None,
            otel_events_endpoint: None,
            addr: None,
            no_watch: false,
        }
    }
}

pub async fn execute(args: RunArgs, context: &CliContext) -> anyhow::Result<()> {
    let root = context.root.clone();
    if !root.exists() {
        bail!(
            "Root directory `{}` does not exist. Please run `switchboard init` first.",
            root.display()
        );
    }

    let telemetry = init_tracing(
        root.clone(),
        "logs/switchboard.log".to_string(),
        "logs/switchboard-events.json".to_string(),
        args.log_level,
        args.otel_logs_endpoint,
        args.otel_events_endpoint,
    )
    .context("could not create logger")?;

    info!("Switchboard starting up…");
    println!("Switchboard starting up…");

    let mut config = HostConfig::load(root, &context.config_manager).await?;
    if let Some(addr) = args.addr {
        config.http_addr = addr;
    }
    if args.no_watch {
        config.hot_reload = false;
    }

    let host = Host::bootstrap(config).await?;
    if let Err(e) = host.start().await {
        error!("Failed to start switchboard: {:#}", e);
        host.shutdown().await;
        telemetry.shutdown();
        return Err(e);
    }

    for failed in host.lifecycle().failed() {
        println!("❌ {} failed at {:?}: {}", failed.name, failed.stage, failed.error);
    }
    println!(
        "Switchboard running on http://{} with {} extension(s); press Ctrl‐C to exit",
        host.config().http_addr,
        host.lifecycle().extensions().len()
    );

    signal::ctrl_c().await?;

    println!("\nShutting down…");
    host.shutdown().await;
    telemetry.shutdown();
    println!("Goodbye!");
    Ok(())
}

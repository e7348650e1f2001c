use std::fs;
use std::path::Path;

use anyhow::Context;
use tracing::info;

use super::CliContext;
use switchboard::config::{HOT_RELOAD_KEY, HTTP_ADDR_KEY, SIGNING_SECRET_KEY};
use switchboard::logger::Telemetry;
use switchboard::signature::Signer;

const STATUS_EXTENSION: &str = r#"let display_name = "Status";
let description = "Reports that the host is alive";

fn register(http) {
    http.get("/status", |event| #{ status: "ok" });
}
"#;

pub async fn execute(context: &CliContext) -> anyhow::Result<()> {
    let root = &context.root;
    fs::create_dir_all(root.join("logs")).with_context(|| format!("creating {}", root.display()))?;
    let _ = Telemetry::init_files(
        "info",
        root.join("logs/switchboard-init.log"),
        root.join("logs/switchboard-init.json"),
    );
    init_layout(root)?;
    println!(
        "Switchboard has been initialised at {}. You can start it with 'switchboard run'",
        root.display()
    );
    Ok(())
}

/// Create `plugins/core/status.rhai`, `logs/` and a `.env`, keeping anything already there.
pub fn init_layout(root: &Path) -> anyhow::Result<()> {
    let core = root.join("plugins").join("core");
    fs::create_dir_all(&core)?;
    fs::create_dir_all(root.join("logs"))?;

    let status = core.join("status.rhai");
    if !status.exists() {
        fs::write(&status, STATUS_EXTENSION)?;
        info!(path = %status.display(), "status extension created");
    }

    let env_file = root.join(".env");
    if !env_file.exists() {
        let secret = Signer::generate_secret();
        fs::write(
            &env_file,
            format!("{HTTP_ADDR_KEY}=127.0.0.1:8080\n{HOT_RELOAD_KEY}=true\n{SIGNING_SECRET_KEY}={secret}\n"),
        )?;
        info!(path = %env_file.display(), ".env created");
    }
    Ok(())
}

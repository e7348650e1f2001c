use clap::Args;

use super::CliContext;
use switchboard::logger::Telemetry;
use switchboard::schema::write_schema;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Optional log level override for the internal tracer
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Output directory. Default: `<root>/schemas`
    #[arg(long)]
    pub out: Option<std::path::PathBuf>,
}

pub async fn execute(args: SchemaArgs, context: &CliContext) -> anyhow::Result<()> {
    let out_dir = args.out.unwrap_or_else(|| context.root.join("schemas"));
    let _ = Telemetry::init_files(
        &args.log_level,
        context.root.join("logs/switchboard-schema.log"),
        context.root.join("logs/switchboard-schema.json"),
    );
    let files = write_schema(&out_dir)?;
    println!("{} schemas written to {}", files.len(), out_dir.display());
    Ok(())
}

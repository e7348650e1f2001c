// src/schema.rs
use std::{fs, path::Path};

use anyhow::Error;
use channel_api::ChannelMessage;
use schemars::{JsonSchema, schema_for};
use tracing::info;

use crate::config::HostConfig;
use crate::envelope::{JobEvent, MessageEvent, RequestEvent};
use crate::scheduler::TriggerSpec;

fn write_one<T: JsonSchema>(out_dir: &Path, file: &str) -> Result<(), Error> {
    let schema = schema_for!(T);
    fs::write(out_dir.join(file), serde_json::to_string_pretty(&schema)?)?;
    info!(file, "schema written");
    Ok(())
}

/// Write the host config schema and the `event` payload schemas into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;
    let files = [
        "host-config.schema.json",
        "event-request.schema.json",
        "event-scheduled.schema.json",
        "event-message.schema.json",
        "channel-message.schema.json",
        "trigger.schema.json",
    ];
    write_one::<HostConfig>(out_dir, files[0])?;
    write_one::<RequestEvent>(out_dir, files[1])?;
    write_one::<JobEvent>(out_dir, files[2])?;
    write_one::<MessageEvent>(out_dir, files[3])?;
    write_one::<ChannelMessage>(out_dir, files[4])?;
    write_one::<TriggerSpec>(out_dir, files[5])?;
    Ok(files.iter().map(|f| f.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tempfile::TempDir;

    #[test]
    fn schemas_are_written_as_json() {
        let dir = TempDir::new().unwrap();
        let files = write_schema(dir.path()).unwrap();
        assert_eq!(files.len(), 6);
        let config: Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("host-config.schema.json")).unwrap()).unwrap();
        assert!(config["properties"]["plugins_dir"].is_object());
        assert!(config["properties"]["http_addr"].is_object());
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    env, fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::{info, warn};

use crate::signature::Signer;

pub const ROOT_ENV: &str = "SWITCHBOARD_ROOT";
pub const DEFAULT_ROOT: &str = "./switchboard";

pub const PLUGINS_DIR_KEY: &str = "SWITCHBOARD_PLUGINS_DIR";
pub const HTTP_ADDR_KEY: &str = "SWITCHBOARD_HTTP_ADDR";
pub const SIGNING_SECRET_KEY: &str = "SWITCHBOARD_SIGNING_SECRET";
pub const CHANNEL_COMMAND_KEY: &str = "SWITCHBOARD_CHANNEL_COMMAND";
pub const CHANNEL_ARGS_KEY: &str = "SWITCHBOARD_CHANNEL_ARGS";
pub const DISABLED_EXTENSIONS_KEY: &str = "SWITCHBOARD_DISABLED_EXTENSIONS";
pub const HOT_RELOAD_KEY: &str = "SWITCHBOARD_HOT_RELOAD";
pub const POLL_INTERVAL_KEY: &str = "SWITCHBOARD_POLL_INTERVAL_MS";
pub const SCRIPT_MAX_OPERATIONS_KEY: &str = "SWITCHBOARD_SCRIPT_MAX_OPERATIONS";

/// A key/value source for host settings.
#[async_trait::async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn as_vec(&self) -> Vec<(String, String)> {
        let mut config = vec![];
        for key in self.keys().await {
            if let Some(value) = self.get(&key).await {
                config.push((key, value));
            }
        }
        config
    }
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn del(&self, key: &str);
    async fn set(&self, key: &str, value: &str) -> Result<(), String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
    }

    /// Trimmed value, with empty strings treated as unset.
    pub async fn value(&self, key: &str) -> Option<String> {
        self.0
            .get(key)
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    async fn parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.value(key).await {
            Some(raw) => raw
                .parse::<T>()
                .map(Some)
                .map_err(|e| anyhow::anyhow!("invalid {key}={raw}: {e}")),
            None => Ok(None),
        }
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file that `set`/`del` keep in sync.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => warn!(error = %e, "could not parse {}", env_file.display()),
            }
        } else {
            info!("no .env at {}; using the process environment", env_file.display());
        }
        Box::new(Self { env_file })
    }

    pub fn env_file(&self) -> &Path {
        &self.env_file
    }
}

/// Replace `key`'s line, or append one.
fn upsert_line(content: &str, key: &str, value: &str) -> String {
    let mut found = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| match line.split_once('=') {
            Some((k, _)) if k.trim() == key => {
                found = true;
                format!("{key}={value}")
            }
            _ => line.to_string(),
        })
        .collect();
    if !found {
        lines.push(format!("{key}={value}"));
    }
    lines.join("\n")
}

fn remove_line(content: &str, key: &str) -> String {
    content
        .lines()
        .filter(|line| line.split_once('=').is_none_or(|(k, _)| k.trim() != key))
        .collect::<Vec<_>>()
        .join("\n")
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        unsafe {
            env::set_var(key, value);
        };
        let content = fs::read_to_string(&self.env_file).unwrap_or_default();
        fs::write(&self.env_file, upsert_line(&content, key, value)).map_err(|e| e.to_string())
    }

    async fn del(&self, key: &str) {
        unsafe {
            env::remove_var(key);
        };
        if let Ok(content) = fs::read_to_string(&self.env_file) {
            if let Err(e) = fs::write(&self.env_file, remove_line(&content, key)) {
                warn!(error = %e, "could not update {}", self.env_file.display());
            }
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory settings, mostly for tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn with(self: Box<Self>, key: &str, value: &str) -> Box<Self> {
        self.map.insert(key.to_string(), value.to_string());
        self
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        self.map.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

/// Everything the host needs to boot.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HostConfig {
    /// Holds `plugins/`, `logs/` and `.env`.
    pub root: PathBuf,
    /// `SWITCHBOARD_PLUGINS_DIR`, default `<root>/plugins`.
    pub plugins_dir: PathBuf,
    /// `SWITCHBOARD_HTTP_ADDR`, default `127.0.0.1:8080`.
    #[schemars(with = "String")]
    pub http_addr: SocketAddr,
    /// `SWITCHBOARD_SIGNING_SECRET`. A random secret is generated when unset.
    #[serde(skip_serializing, default)]
    pub signing_secret: Option<String>,
    /// `SWITCHBOARD_CHANNEL_COMMAND`: transport process to spawn, if any.
    pub channel_command: Option<String>,
    /// `SWITCHBOARD_CHANNEL_ARGS`, whitespace separated.
    #[serde(default)]
    pub channel_args: Vec<String>,
    /// `SWITCHBOARD_DISABLED_EXTENSIONS`, comma separated names skipped by discovery.
    #[serde(default)]
    pub disabled_extensions: Vec<String>,
    /// `SWITCHBOARD_HOT_RELOAD`, default `true`.
    pub hot_reload: bool,
    /// `SWITCHBOARD_POLL_INTERVAL_MS`, default 2000.
    pub poll_interval_ms: u64,
    /// `SWITCHBOARD_SCRIPT_MAX_OPERATIONS`. Unset or 0 means unlimited.
    pub script_max_operations: Option<u64>,
}

impl HostConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            plugins_dir: root.join("plugins"),
            root,
            http_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            signing_secret: None,
            channel_command: None,
            channel_args: Vec::new(),
            disabled_extensions: Vec::new(),
            hot_reload: true,
            poll_interval_ms: 2_000,
            script_max_operations: None,
        }
    }

    pub async fn load(root: impl Into<PathBuf>, config: &ConfigManager) -> Result<Self> {
        let mut host = Self::new(root);
        if let Some(dir) = config.value(PLUGINS_DIR_KEY).await {
            let dir = PathBuf::from(dir);
            host.plugins_dir = if dir.is_absolute() { dir } else { host.root.join(dir) };
        }
        if let Some(addr) = config.parsed::<SocketAddr>(HTTP_ADDR_KEY).await? {
            host.http_addr = addr;
        }
        host.signing_secret = config.value(SIGNING_SECRET_KEY).await;
        host.channel_command = config.value(CHANNEL_COMMAND_KEY).await;
        host.channel_args = config
            .value(CHANNEL_ARGS_KEY)
            .await
            .map(|a| a.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        host.disabled_extensions = config
            .value(DISABLED_EXTENSIONS_KEY)
            .await
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(flag) = config.value(HOT_RELOAD_KEY).await {
            host.hot_reload = parse_flag(&flag).with_context(|| format!("invalid {HOT_RELOAD_KEY}"))?;
        }
        if let Some(ms) = config.parsed::<u64>(POLL_INTERVAL_KEY).await? {
            host.poll_interval_ms = ms.max(10);
        }
        host.script_max_operations = config.parsed::<u64>(SCRIPT_MAX_OPERATIONS_KEY).await?.filter(|n| *n > 0);
        Ok(host)
    }

    pub fn signer(&self) -> Signer {
        match &self.signing_secret {
            Some(secret) => Signer::new(secret),
            None => Signer::random(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(".env")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("expected a boolean, got `{other}`"),
    }
}

/// `SWITCHBOARD_ROOT`, or `./switchboard`.
pub fn root_from_env() -> PathBuf {
    env::var(ROOT_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT))
}

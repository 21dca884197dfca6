use async_trait::async_trait;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{env, fmt::Display, fs, path::PathBuf, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::{error, info};
use worker_channel::{WorkerCommand, WorkerOptions};

use crate::session::SessionConfig;

pub const WORKER_COMMAND: &str = "BRIDGE_WORKER_COMMAND";
pub const WORKER_ARGS: &str = "BRIDGE_WORKER_ARGS";
pub const REQUEST_TIMEOUT_MS: &str = "BRIDGE_REQUEST_TIMEOUT_MS";
pub const HANDSHAKE_DELAY_MS: &str = "BRIDGE_HANDSHAKE_DELAY_MS";
pub const SESSION_IDLE_SECS: &str = "BRIDGE_SESSION_IDLE_SECS";
pub const SESSION_SWEEP_SECS: &str = "BRIDGE_SESSION_SWEEP_SECS";
pub const SESSION_HISTORY: &str = "BRIDGE_SESSION_HISTORY";
pub const MAX_BUFFER_BYTES: &str = "BRIDGE_MAX_BUFFER_BYTES";
pub const REJECT_UNKNOWN_SESSIONS: &str = "BRIDGE_REJECT_UNKNOWN_SESSIONS";
pub const KEEPALIVE_SECS: &str = "BRIDGE_KEEPALIVE_SECS";
pub const PROTOCOL_VERSION: &str = "BRIDGE_PROTOCOL_VERSION";
pub const CLIENT_NAME: &str = "BRIDGE_CLIENT_NAME";

#[async_trait]
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

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub fn into_inner(self) -> Box<dyn ConfigManagerType> {
        self.0
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

/// Process environment seeded from a `.env` file. Edits go to both, so a later
/// `BridgeConfig::load` and the next start see the same values.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        match dotenvy::from_path(&env_file) {
            Ok(()) => info!(path = %env_file.display(), "loaded bridge settings"),
            Err(e) => error!(path = %env_file.display(), error = %e, "could not load .env"),
        }
        Box::new(Self { env_file })
    }

    /// Rewrite the `.env` file with `key` set to `value`, or removed when `value`
    /// is `None`. Comments and unrelated lines are kept in place.
    fn rewrite(&self, key: &str, value: Option<&str>) -> std::io::Result<()> {
        let content = match fs::read_to_string(&self.env_file) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e),
        };
        let entry = value.map(|value| format!("{key}={value}"));
        let mut placed = false;
        let mut lines: Vec<String> = Vec::new();
        for line in content.lines() {
            let is_key = line
                .split_once('=')
                .is_some_and(|(k, _)| k.trim() == key);
            match (is_key, &entry) {
                (false, _) => lines.push(line.to_string()),
                (true, Some(entry)) if !placed => {
                    lines.push(entry.clone());
                    placed = true;
                }
                (true, _) => {}
            }
        }
        if let Some(entry) = entry
            && !placed
        {
            lines.push(entry);
        }
        fs::write(&self.env_file, lines.join("\n"))
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        // SAFETY: config edits run from the CLI before any worker task is spawned.
        unsafe { env::set_var(key, value) };
        self.rewrite(key, Some(value))
            .map_err(|e| format!("could not update {}: {e}", self.env_file.display()))
    }

    async fn del(&self, key: &str) {
        // SAFETY: as for `set`.
        unsafe { env::remove_var(key) };
        if let Err(e) = self.rewrite(key, None) {
            error!(path = %self.env_file.display(), %key, error = %e, "could not remove setting");
        }
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory config, mostly for tests and embedders.
#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::new(Self::default())
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let mgr = Self::default();
        for (k, v) in pairs {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        Box::new(mgr)
    }
}

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

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required config key {0}")]
    MissingKey(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the bridge needs to start, resolved from a [`ConfigManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BridgeConfig {
    /// Program to launch as the worker.
    pub worker_command: Option<String>,
    /// Arguments passed to the worker.
    pub worker_args: Vec<String>,
    pub request_timeout_ms: u64,
    /// Delay before the `initialize` handshake is sent.
    pub handshake_delay_ms: u64,
    pub session_idle_secs: u64,
    pub session_sweep_secs: u64,
    /// Exchanges kept per session.
    pub session_history: usize,
    /// Ceiling for buffered, unparsed worker output.
    pub max_buffer_bytes: usize,
    /// Fail dispatches naming a session that does not exist instead of creating it.
    pub reject_unknown_sessions: bool,
    /// Interval of `: ping` comments on event-stream sinks.
    pub keepalive_secs: u64,
    pub protocol_version: String,
    pub client_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            worker_command: None,
            worker_args: vec![],
            request_timeout_ms: 30_000,
            handshake_delay_ms: 1_000,
            session_idle_secs: 300,
            session_sweep_secs: 60,
            session_history: 100,
            max_buffer_bytes: 10 * 1024 * 1024,
            reject_unknown_sessions: false,
            keepalive_secs: 15,
            protocol_version: "2024-11-05".to_string(),
            client_name: "worker-bridge".to_string(),
        }
    }
}

impl BridgeConfig {
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let store = config.0.as_ref();

        let worker_command = store
            .get(WORKER_COMMAND)
            .await
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let worker_args = store
            .get(WORKER_ARGS)
            .await
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();
        let reject_unknown_sessions = match store.get(REJECT_UNKNOWN_SESSIONS).await {
            Some(raw) => parse_bool(REJECT_UNKNOWN_SESSIONS, &raw)?,
            None => defaults.reject_unknown_sessions,
        };

        Ok(Self {
            worker_command,
            worker_args,
            request_timeout_ms: positive(store, REQUEST_TIMEOUT_MS, defaults.request_timeout_ms)
                .await?,
            handshake_delay_ms: parse_or(store, HANDSHAKE_DELAY_MS, defaults.handshake_delay_ms)
                .await?,
            session_idle_secs: positive(store, SESSION_IDLE_SECS, defaults.session_idle_secs)
                .await?,
            session_sweep_secs: positive(store, SESSION_SWEEP_SECS, defaults.session_sweep_secs)
                .await?,
            session_history: positive(store, SESSION_HISTORY, defaults.session_history).await?,
            max_buffer_bytes: positive(store, MAX_BUFFER_BYTES, defaults.max_buffer_bytes).await?,
            reject_unknown_sessions,
            keepalive_secs: positive(store, KEEPALIVE_SECS, defaults.keepalive_secs).await?,
            protocol_version: store
                .get(PROTOCOL_VERSION)
                .await
                .unwrap_or(defaults.protocol_version),
            client_name: store.get(CLIENT_NAME).await.unwrap_or(defaults.client_name),
        })
    }

    pub fn worker_command(&self) -> Result<WorkerCommand, ConfigError> {
        let program = self
            .worker_command
            .as_ref()
            .ok_or(ConfigError::MissingKey(WORKER_COMMAND))?;
        Ok(WorkerCommand::new(program.clone()).args(self.worker_args.iter().cloned()))
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            handshake_delay: Duration::from_millis(self.handshake_delay_ms),
            protocol_version: self.protocol_version.clone(),
            client_name: self.client_name.clone(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            max_buffer_bytes: self.max_buffer_bytes,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            idle_timeout: Duration::from_secs(self.session_idle_secs),
            sweep_interval: Duration::from_secs(self.session_sweep_secs),
            history_capacity: self.session_history,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }
}

async fn parse_or<T>(
    store: &dyn ConfigManagerType,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match store.get(key).await {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            }),
    }
}

async fn positive<T>(
    store: &dyn ConfigManagerType,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr + Default + PartialEq + Display,
    T::Err: Display,
{
    let value = parse_or(store, key, default).await?;
    if value == T::default() {
        return Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "expected true or false".to_string(),
        }),
    }
}

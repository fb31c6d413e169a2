use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{Context, bail};
use async_trait::async_trait;
use channel_webhook::WebhookConfig;
use channel_ws::{Resolution, WsConfig};
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::logger::LogSettings;

/// Read-only key/value source of configuration overrides.
#[async_trait]
pub trait ConfigManagerType: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    /// Parse the value under `key`, `None` when absent or blank.
    pub async fn parse<T>(&self, key: &str) -> anyhow::Result<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.0.get(key).await {
            Some(raw) if !raw.trim().is_empty() => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|err| anyhow::anyhow!("invalid value `{raw}` for {key}: {err}")),
            _ => Ok(None),
        }
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// What happened to the `.env` file when the manager was built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvFileStatus {
    Loaded,
    Missing,
    Invalid(String),
}

/// Process environment, after loading a `.env` file if there is one.
#[derive(Clone, Debug)]
pub struct EnvConfigManager {
    env_file: PathBuf,
    status: EnvFileStatus,
}

impl EnvConfigManager {
    /// Loads the file right away. Logging usually isn't set up yet at this
    /// point, so the outcome is kept for [`EnvConfigManager::report`].
    pub fn new(env_file: PathBuf) -> Box<Self> {
        let status = if !env_file.exists() {
            EnvFileStatus::Missing
        } else {
            match dotenvy::from_path(&env_file) {
                Ok(()) => EnvFileStatus::Loaded,
                Err(err) => EnvFileStatus::Invalid(err.to_string()),
            }
        };
        Box::new(Self { env_file, status })
    }

    pub fn status(&self) -> &EnvFileStatus {
        &self.status
    }

    pub fn report(&self) {
        let path = self.env_file.display();
        match &self.status {
            EnvFileStatus::Loaded => info!("Loaded .env from {path}"),
            EnvFileStatus::Missing => debug!("no .env at {path}"),
            EnvFileStatus::Invalid(err) => warn!("could not load .env from {path}: {err}"),
        }
    }
}

#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Box<Self> {
        let manager = Self::default();
        for (key, value) in pairs {
            manager.map.insert(key.to_string(), value.to_string());
        }
        Box::new(manager)
    }
}

#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct IngressSettings {
    /// Upper bound on concurrently running event handlers.
    pub max_concurrent_handlers: usize,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            max_concurrent_handlers: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct WebhookSettings {
    pub host: String,
    pub port: u16,
    pub endpoint: String,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        let defaults = WebhookConfig::default();
        Self {
            host: defaults.host,
            port: defaults.port,
            endpoint: defaults.endpoint,
        }
    }
}

/// Contents of `config.yaml`. Every key is optional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct RouterConfig {
    #[serde(rename = "INGRESS")]
    pub ingress: IngressSettings,
    #[serde(rename = "WS_URL")]
    pub ws_url: String,
    #[serde(rename = "WS_PORT")]
    pub ws_port: u16,
    #[serde(rename = "WS_CERTIFICATE_PATH")]
    pub ws_certificate_path: Option<PathBuf>,
    #[serde(rename = "WS_PRIVATE_KEY_PATH")]
    pub ws_private_key_path: Option<PathBuf>,
    #[serde(rename = "WEBHOOK")]
    pub webhook: WebhookSettings,
    #[serde(rename = "LOG")]
    pub log: LogSettings,
}

impl Default for RouterConfig {
    fn default() -> Self {
        let ws = WsConfig::default();
        Self {
            ingress: IngressSettings::default(),
            ws_url: ws.url,
            ws_port: ws.port,
            ws_certificate_path: None,
            ws_private_key_path: None,
            webhook: WebhookSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl RouterConfig {
    /// Read `path`, falling back to defaults when the file does not exist.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml_bw::from_str(&contents)
            .with_context(|| format!("could not parse {}", path.display()))
    }

    /// File, then overrides, then validation.
    pub async fn load(path: &Path, overrides: &ConfigManager) -> anyhow::Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(overrides).await?;
        config.validate()?;
        Ok(config)
    }

    pub async fn apply_overrides(&mut self, overrides: &ConfigManager) -> anyhow::Result<()> {
        if let Some(url) = overrides.parse("WS_URL").await? {
            self.ws_url = url;
        }
        if let Some(port) = overrides.parse("WS_PORT").await? {
            self.ws_port = port;
        }
        if let Some(path) = overrides.parse("WS_CERTIFICATE_PATH").await? {
            self.ws_certificate_path = Some(path);
        }
        if let Some(path) = overrides.parse("WS_PRIVATE_KEY_PATH").await? {
            self.ws_private_key_path = Some(path);
        }
        if let Some(host) = overrides.parse("WEBHOOK_HOST").await? {
            self.webhook.host = host;
        }
        if let Some(port) = overrides.parse("WEBHOOK_PORT").await? {
            self.webhook.port = port;
        }
        if let Some(endpoint) = overrides.parse("WEBHOOK_ENDPOINT").await? {
            self.webhook.endpoint = endpoint;
        }
        if let Some(max) = overrides.parse("MAX_CONCURRENT_HANDLERS").await? {
            self.ingress.max_concurrent_handlers = max;
        }
        if let Some(level) = overrides.parse("LOG_LEVEL").await? {
            self.log.level = level;
        }
        if let Some(dir) = overrides.parse("LOG_DIR").await? {
            self.log.dir = Some(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ingress.max_concurrent_handlers == 0 {
            bail!("INGRESS.max_concurrent_handlers must be greater than 0");
        }
        if !self.webhook.endpoint.starts_with('/') {
            bail!("WEBHOOK.endpoint `{}` must start with `/`", self.webhook.endpoint);
        }
        Ok(())
    }

    pub fn ws_config(&self, resolution: Resolution) -> WsConfig {
        WsConfig {
            url: self.ws_url.clone(),
            port: self.ws_port,
            certificate_path: self.ws_certificate_path.clone(),
            private_key_path: self.ws_private_key_path.clone(),
            resolution,
        }
    }

    pub fn webhook_config(&self) -> WebhookConfig {
        WebhookConfig {
            host: self.webhook.host.clone(),
            port: self.webhook.port,
            endpoint: self.webhook.endpoint.clone(),
        }
    }
}

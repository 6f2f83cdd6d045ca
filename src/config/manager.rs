use crate::config::GatewayConfig;
use crate::utils::errors::{McpError, McpResult};
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Prefix of environment overrides; `__` separates nested keys
pub const ENV_PREFIX: &str = "MCPHUB_";

/// Supported config file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Detect format from the file extension; unknown extensions are YAML
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => ConfigFormat::Json,
            Some("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfigEvent {
    Reloaded,
    Error(String),
}

/// Layered configuration: defaults, then the file, then `MCPHUB_*` variables
pub struct ConfigManager {
    path: PathBuf,
    format: ConfigFormat,
    config: Arc<RwLock<GatewayConfig>>,
    event_tx: broadcast::Sender<ConfigEvent>,
}

impl ConfigManager {
    pub fn new(path: impl AsRef<str>) -> McpResult<Self> {
        let path = PathBuf::from(shellexpand::tilde(path.as_ref()).as_ref());
        let format = ConfigFormat::from_path(&path);
        debug!("Detected config format: {:?}", format);

        let config = Self::load(&path)?;
        let (event_tx, _) = broadcast::channel(16);
        Ok(Self {
            path,
            format,
            config: Arc::new(RwLock::new(config)),
            event_tx,
        })
    }

    /// Merge defaults, the file at `path` and environment overrides.
    pub fn load(path: &Path) -> McpResult<GatewayConfig> {
        if !path.exists() {
            return Err(McpError::Configuration(format!(
                "configuration file {} does not exist",
                path.display()
            )));
        }

        let file = match ConfigFormat::from_path(path) {
            ConfigFormat::Json => Figment::new().merge(Json::file(path)),
            ConfigFormat::Yaml => Figment::new().merge(Yaml::file(path)),
            ConfigFormat::Toml => Figment::new().merge(Toml::file(path)),
        };

        let config: GatewayConfig = Figment::from(Serialized::defaults(GatewayConfig::default()))
            .merge(file)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| McpError::Configuration(format!("failed to load {}: {}", path.display(), e)))?;

        info!(
            "Loaded configuration from {} ({} servers, {} groups)",
            path.display(),
            config.servers.len(),
            config.groups.len()
        );
        Ok(config)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get_config(&self) -> GatewayConfig {
        self.config.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConfigEvent> {
        self.event_tx.subscribe()
    }

    /// Re-read the file; the previous configuration stays on failure.
    pub fn reload(&self) -> McpResult<()> {
        match Self::load(&self.path) {
            Ok(config) => {
                *self.config.write() = config;
                let _ = self.event_tx.send(ConfigEvent::Reloaded);
                Ok(())
            }
            Err(e) => {
                error!("Failed to reload config: {}", e);
                let _ = self.event_tx.send(ConfigEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    /// Write the configuration back in the file's format
    pub async fn save(&self, config: &GatewayConfig) -> McpResult<()> {
        let content = match self.format {
            ConfigFormat::Json => serde_json::to_string_pretty(config)?,
            ConfigFormat::Yaml => serde_yaml::to_string(config)
                .map_err(|e| McpError::Configuration(format!("failed to serialize YAML: {}", e)))?,
            ConfigFormat::Toml => toml::to_string_pretty(config)
                .map_err(|e| McpError::Configuration(format!("failed to serialize TOML: {}", e)))?,
        };
        tokio::fs::write(&self.path, content).await?;
        *self.config.write() = config.clone();
        Ok(())
    }
}

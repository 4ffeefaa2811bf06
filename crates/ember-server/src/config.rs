//! Server configuration.
//!
//! Configuration can be loaded from:
//! - A TOML file, or a directory whose `*.toml` files are concatenated
//! - Environment variables (EMBER_*) for the bind address

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// Top-level configuration document.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bind address and port.
    #[serde(default)]
    pub server: ServerConfig,

    /// In-memory event history per room.
    #[serde(default)]
    pub history: HistoryConfig,

    /// OIDC providers accepted for login.
    #[serde(default)]
    pub oidc: Vec<OidcConfig>,

    /// Durable store selection.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Named plugin configuration blocks, opaque beyond `name`.
    #[serde(default)]
    pub plugin: Vec<PluginConfig>,

    /// Metrics export.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Log level when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Owner of the default room created on first start.
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// Ring capacity; also the backfill depth for new clients.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

/// One OpenID Connect provider. Users present an ID token plus the provider
/// name; verification discovers the endpoints at `provider_url`.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcConfig {
    pub name: String,
    /// When empty, the audience check is skipped.
    #[serde(default)]
    pub client_id: String,
    /// e.g. "https://accounts.google.com"
    pub provider_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersistenceConfig {
    /// One of "sqlite", "memory", or empty for no store at all.
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub dsn: String,
    /// Accepted for compatibility with older deployments; unused.
    #[serde(default)]
    pub flock_path: String,
}

/// A named plugin block. Everything besides `name` is handed to the plugin
/// untouched via `configure`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub name: String,
    #[serde(flatten)]
    pub rest: toml::Table,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_host() -> String {
    std::env::var("EMBER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("EMBER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000)
}

fn default_history_size() -> usize {
    ember_core::DEFAULT_HISTORY_SIZE
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_admin_user() -> String {
    "admin".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            history: HistoryConfig::default(),
            oidc: Vec::new(),
            persistence: PersistenceConfig::default(),
            plugin: Vec::new(),
            metrics: MetricsConfig::default(),
            log_level: default_log_level(),
            admin_user: default_admin_user(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            history_size: default_history_size(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from `path`: a single TOML file, or a directory
    /// whose `*.toml` files are concatenated in name order. `None` yields
    /// the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when the path does not exist or the document does
    /// not parse; both are fatal at startup.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let expanded = shellexpand::tilde(&path.to_string_lossy().into_owned()).into_owned();
        let path = Path::new(&expanded);
        let meta = std::fs::metadata(path)
            .with_context(|| format!("config path not found: {}", path.display()))?;

        let mut contents = String::new();
        if meta.is_dir() {
            let mut files: Vec<_> = std::fs::read_dir(path)
                .with_context(|| format!("could not read config directory: {}", path.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
                .collect();
            files.sort();
            if files.is_empty() {
                bail!("no *.toml files in config directory: {}", path.display());
            }
            for file in files {
                contents.push_str(
                    &std::fs::read_to_string(&file)
                        .with_context(|| format!("could not read config file: {}", file.display()))?,
                );
                contents.push('\n');
            }
        } else {
            contents = std::fs::read_to_string(path)
                .with_context(|| format!("could not read config file: {}", path.display()))?;
        }

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("could not parse config at {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        match self.persistence.kind.as_str() {
            "" | "sqlite" | "memory" => {}
            other => bail!("unknown persistence type `{other}`"),
        }
        if self.persistence.kind == "sqlite" && self.persistence.dsn.is_empty() {
            bail!("persistence type `sqlite` requires a dsn");
        }
        Ok(())
    }

    /// The socket address to bind to.
    ///
    /// # Errors
    ///
    /// Fails when host/port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .with_context(|| {
                format!(
                    "invalid bind address {}:{}",
                    self.server.host, self.server.port
                )
            })
    }

    /// The configuration block for a plugin, as loose JSON for the wire.
    #[must_use]
    pub fn plugin_block(&self, name: &str) -> Option<serde_json::Value> {
        self.plugin
            .iter()
            .find(|p| p.name == name)
            .map(|p| serde_json::to_value(&p.rest).unwrap_or(serde_json::Value::Null))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.history.history_size, 100);
        assert_eq!(config.admin_user, "admin");
        assert_eq!(config.log_level, "info");
        assert!(config.persistence.kind.is_empty());
    }

    #[test]
    fn parses_a_full_document() {
        let doc = r#"
            log_level = "debug"
            admin_user = "root"

            [server]
            host = "0.0.0.0"
            port = 9001

            [history]
            history_size = 3

            [[oidc]]
            name = "google"
            provider_url = "https://accounts.google.com"

            [persistence]
            type = "sqlite"
            dsn = "/tmp/chat.db"

            [[plugin]]
            name = "translate"
            api_key = "secret"
            target_languages = ["de", "fr"]
        "#;
        let config: Config = toml::from_str(doc).unwrap();
        config.validate().unwrap();

        assert_eq!(config.history.history_size, 3);
        assert_eq!(config.oidc[0].name, "google");
        assert!(config.oidc[0].client_id.is_empty());
        assert_eq!(config.persistence.kind, "sqlite");

        let block = config.plugin_block("translate").unwrap();
        assert_eq!(block["api_key"], "secret");
        assert_eq!(block["target_languages"][0], "de");
        assert!(config.plugin_block("missing").is_none());
    }

    #[test]
    fn unknown_persistence_type_is_fatal() {
        let config: Config = toml::from_str("[persistence]\ntype = \"oracle\"").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn directory_concatenation() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("00-base.toml"), "log_level = \"warn\"\n").unwrap();
        std::fs::write(
            dir.path().join("10-history.toml"),
            "[history]\nhistory_size = 7\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let config = Config::load(Some(dir.path())).unwrap();
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.history.history_size, 7);
    }
}

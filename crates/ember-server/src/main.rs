//! # Ember
//!
//! Real-time multi-room chat server with a per-room event bus.
//!
//! ## Usage
//!
//! ```bash
//! # Run with defaults (memory-only, one `default` room)
//! ember
//!
//! # Run with a config file or directory and two plugins
//! ember --config /etc/ember/ \
//!       --plugin ./ember-translate-plugin \
//!       --plugin ./ember-commands-plugin
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use ember_core::Store;
use ember_filter::compile;
use ember_plugin::PluginHandle;
use ember_server::hub::PluginSpec;
use ember_server::{handlers, metrics, AppState, Config, HostBridge, Registry};
use ember_storage::{MemoryStore, SqliteStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "ember", about = "Real-time multi-room chat server")]
struct Args {
    /// Path to a config file, or a directory of *.toml files.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path(s) to event handler plugin executables.
    #[arg(short, long = "plugin")]
    plugins: Vec<String>,

    /// Override the configured bind address (host:port).
    #[arg(long)]
    addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut cfg = Config::load(args.config.as_deref())?;
    if let Some(addr) = &args.addr {
        let (host, port) = addr
            .rsplit_once(':')
            .with_context(|| format!("bad --addr `{addr}`, expected host:port"))?;
        cfg.server.host = host.to_string();
        cfg.server.port = port.parse().with_context(|| format!("bad port in `{addr}`"))?;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("ember={}", cfg.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cfg.metrics.enabled {
        metrics::init_metrics();
        if let Err(err) = metrics::start_metrics_server(cfg.metrics.port) {
            tracing::error!("failed to start metrics server: {err}");
        }
    }

    let store = open_store(&cfg)?;
    let cfg = Arc::new(cfg);
    let registry = Registry::new();

    // Launch and configure plugins before any hub exists; reverse calls
    // only start flowing once the hubs open their streams.
    let bridge = Arc::new(HostBridge::new(
        Arc::clone(&registry),
        store.clone(),
        Arc::clone(&cfg),
    ));
    let mut plugins = HashMap::new();
    for command in &args.plugins {
        let name = plugin_name(command);
        if name.is_empty() || name == "main" {
            tracing::warn!(command = %command, "`{name}` is not a valid plugin name, skipping");
            continue;
        }
        let handle = PluginHandle::launch(&name, command, bridge.clone())
            .await
            .with_context(|| format!("could not launch plugin `{name}`"))?;
        match handle.get_spec().await {
            Ok(schema) => tracing::debug!(plugin = %name, %schema, "plugin config schema"),
            Err(err) => tracing::warn!(plugin = %name, error = %err, "plugin has no config schema"),
        }

        let (cron_spec, filter_source) = match cfg.plugin_block(&name) {
            Some(block) => handle
                .configure(block)
                .await
                .with_context(|| format!("could not configure plugin `{name}`"))?,
            None => (String::new(), String::new()),
        };
        let event_filter = if filter_source.is_empty() {
            None
        } else {
            match compile(&filter_source) {
                Ok(program) => Some(program),
                Err(err) => {
                    tracing::warn!(plugin = %name, error = %err, "bad event filter, plugin sees everything");
                    None
                }
            }
        };
        plugins.insert(
            name.clone(),
            PluginSpec {
                name,
                handle,
                cron_spec,
                event_filter,
            },
        );
    }

    registry
        .bootstrap(Arc::clone(&cfg), store, Arc::new(plugins))
        .await
        .context("could not bootstrap rooms")?;

    let state = Arc::new(AppState { registry, cfg });
    handlers::run_server(state).await
}

/// Open the configured durable store; `None` means memory-only mode.
fn open_store(cfg: &Config) -> Result<Option<Arc<dyn Store>>> {
    match cfg.persistence.kind.as_str() {
        "" => Ok(None),
        "sqlite" => {
            let store = SqliteStore::open(&cfg.persistence.dsn)
                .with_context(|| format!("could not open sqlite at {}", cfg.persistence.dsn))?;
            let store: Arc<dyn Store> = Arc::new(store);
            Ok(Some(store))
        }
        "memory" => {
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            Ok(Some(store))
        }
        other => bail!("unknown persistence type `{other}`"),
    }
}

/// Derive a plugin name from its command: base name, lowercased, with the
/// `ember-` prefix and `-plugin` suffix stripped.
fn plugin_name(command: &str) -> String {
    let base = command
        .split_whitespace()
        .next()
        .unwrap_or(command)
        .rsplit('/')
        .next()
        .unwrap_or(command);
    let mut name = base.to_ascii_lowercase();
    if let Some(stripped) = name.strip_prefix("ember-") {
        name = stripped.to_string();
    }
    if let Some(stripped) = name.strip_suffix("-plugin") {
        name = stripped.to_string();
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_names_are_derived_from_paths() {
        assert_eq!(plugin_name("./bin/ember-translate-plugin"), "translate");
        assert_eq!(plugin_name("/usr/lib/ember-commands-plugin --flag"), "commands");
        assert_eq!(plugin_name("custom"), "custom");
    }
}

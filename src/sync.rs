//! Configuration synchronization.
//!
//! On startup the synchronizer fetches the authoritative configuration,
//! falling back to the on-disk cache when the source is unreachable. While
//! the gateway runs it polls the source and, when the configuration has
//! materially changed, persists the new snapshot and asks the running
//! instance to reload through its own control socket.

use crate::config::GatewayConfig;
use crate::control::send_command;
use crate::error::GatewayError;
use crate::ipc::{ControlCommand, ControlReply};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const KEY_HEADER: &str = "x-gateway-key";
const SECRET_HEADER: &str = "x-gateway-secret";

/// Where the authoritative configuration lives
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Remote document fetched over HTTPS, authenticated with the
    /// instance's key and secret
    Remote {
        url: String,
        key: String,
        secret: String,
    },
    /// Local file, used for development and air-gapped setups
    File(PathBuf),
}

pub struct ConfigSynchronizer {
    source: ConfigSource,
    cache_path: PathBuf,
    socket_path: PathBuf,
    poll_interval: Duration,
    client: reqwest::Client,
}

impl ConfigSynchronizer {
    pub fn new(
        source: ConfigSource,
        cache_path: PathBuf,
        socket_path: PathBuf,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            cache_path,
            socket_path,
            poll_interval,
            client: reqwest::Client::new(),
        }
    }

    /// Fetch and parse the current configuration from the source
    pub async fn fetch(&self) -> Result<GatewayConfig, GatewayError> {
        match &self.source {
            ConfigSource::Remote { url, key, secret } => {
                let response = self
                    .client
                    .get(url)
                    .header(KEY_HEADER, key)
                    .header(SECRET_HEADER, secret)
                    .send()
                    .await
                    .map_err(|err| GatewayError::ConfigFetch(err.to_string()))?;
                if !response.status().is_success() {
                    return Err(GatewayError::ConfigFetch(format!(
                        "{url} returned {}",
                        response.status()
                    )));
                }
                let body = response
                    .text()
                    .await
                    .map_err(|err| GatewayError::ConfigFetch(err.to_string()))?;
                GatewayConfig::parse(&body)
            }
            ConfigSource::File(path) => GatewayConfig::load(path),
        }
    }

    /// Resolve the configuration to start with: fresh from the source when
    /// possible, the cached copy when not, an error when neither exists.
    /// A successful fetch is written through to the cache.
    pub async fn initial_config(&self) -> Result<GatewayConfig, GatewayError> {
        match self.fetch().await {
            Ok(config) => {
                config.save(&self.cache_path)?;
                Ok(config)
            }
            Err(err) => {
                if self.cache_path.is_file() {
                    warn!(
                        error = %err,
                        cache = %self.cache_path.display(),
                        "Config fetch failed, using cached configuration"
                    );
                    GatewayConfig::load(&self.cache_path)
                } else {
                    warn!(error = %err, "Config fetch failed and no cache exists");
                    Err(GatewayError::NoCachedConfig(self.cache_path.clone()))
                }
            }
        }
    }

    /// Poll loop. Checks the source every interval and triggers a reload
    /// through the control socket when the configuration changed. Returns
    /// when the shutdown signal fires.
    pub async fn run(self, mut current: GatewayConfig, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.poll_interval.as_secs(),
            "Watching for configuration changes"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
            if let Some(updated) = self.poll_once(&current).await {
                current = updated;
            }
        }
    }

    /// One poll tick. Returns the new configuration when a change was
    /// detected and applied.
    async fn poll_once(&self, current: &GatewayConfig) -> Option<GatewayConfig> {
        let fetched = match self.fetch().await {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    error = %err,
                    retry_secs = self.poll_interval.as_secs(),
                    "Failed to check for change in config, will retry"
                );
                return None;
            }
        };
        if !current.differs_from(&fetched) {
            debug!("Configuration unchanged");
            return None;
        }

        info!("Configuration change detected, saving and reloading gateway");
        if let Err(err) = fetched.save(&self.cache_path) {
            warn!(error = %err, "Failed to persist updated configuration");
            return None;
        }
        match send_command(&self.socket_path, ControlCommand::Reload).await {
            Ok(ControlReply::Ok) => info!("Gateway reloaded with updated configuration"),
            Ok(ControlReply::Rejected(message)) => {
                warn!(%message, "Gateway refused to reload, will retry on next change")
            }
            Ok(reply) => warn!(?reply, "Unexpected reply to reload"),
            Err(err) => warn!(error = %err, "Failed to deliver reload command"),
        }
        Some(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE_YAML: &str = r#"
gateway:
  port: 8800
  plugins:
    sequence: [analytics, metrics]
"#;

    fn synchronizer(dir: &std::path::Path, source: ConfigSource) -> ConfigSynchronizer {
        ConfigSynchronizer::new(
            source,
            dir.join("cache-config.yaml"),
            dir.join("portcullis.sock"),
            Duration::from_secs(600),
        )
    }

    #[tokio::test]
    async fn test_initial_config_caches_fetched_copy() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source.yaml");
        std::fs::write(&source_path, SOURCE_YAML).unwrap();

        let sync = synchronizer(dir.path(), ConfigSource::File(source_path));
        let config = sync.initial_config().await.unwrap();
        assert_eq!(config.gateway.port, 8800);
        assert!(dir.path().join("cache-config.yaml").is_file());
    }

    #[tokio::test]
    async fn test_initial_config_falls_back_to_cache() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cache-config.yaml"), SOURCE_YAML).unwrap();

        let sync = synchronizer(
            dir.path(),
            ConfigSource::File(dir.path().join("missing.yaml")),
        );
        let config = sync.initial_config().await.unwrap();
        assert_eq!(config.gateway.port, 8800);
    }

    #[tokio::test]
    async fn test_initial_config_fails_without_fetch_or_cache() {
        let dir = tempfile::tempdir().unwrap();
        let sync = synchronizer(
            dir.path(),
            ConfigSource::File(dir.path().join("missing.yaml")),
        );
        let err = sync.initial_config().await.unwrap_err();
        assert!(matches!(err, GatewayError::NoCachedConfig(_)));
    }

    #[tokio::test]
    async fn test_poll_detects_change_and_updates_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source.yaml");
        std::fs::write(&source_path, SOURCE_YAML).unwrap();

        let sync = synchronizer(dir.path(), ConfigSource::File(source_path.clone()));
        let current = sync.initial_config().await.unwrap();

        // Unchanged source: no update
        assert!(sync.poll_once(&current).await.is_none());

        // Changed source: cache rewritten even though the reload cannot be
        // delivered (no instance is listening)
        std::fs::write(&source_path, SOURCE_YAML.replace("8800", "9900")).unwrap();
        let updated = sync.poll_once(&current).await.unwrap();
        assert_eq!(updated.gateway.port, 9900);
        let cached = GatewayConfig::load(&dir.path().join("cache-config.yaml")).unwrap();
        assert_eq!(cached.gateway.port, 9900);
    }
}

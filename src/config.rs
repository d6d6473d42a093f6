use crate::error::GatewayError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Environment variable overriding the instance configuration directory
pub const ENV_CONFIG_DIR: &str = "PORTCULLIS_CONFIG_DIR";
/// Environment variable overriding the worker listening port
pub const ENV_PORT: &str = "PORTCULLIS_PORT";
/// Key/secret pair authenticating the remote configuration fetch
pub const ENV_KEY: &str = "PORTCULLIS_KEY";
pub const ENV_SECRET: &str = "PORTCULLIS_SECRET";

/// Default period between configuration polls, in seconds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 600;

/// Full configuration tree for one gateway instance.
///
/// The `gateway` section is what the control plane itself consumes; every
/// other top-level key is a per-plugin settings block (`quota`, `oauth`, ...)
/// or an opaque section carried through save/load untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default)]
    pub gateway: GatewaySection,

    /// Run-scoped unique id, assigned after load. Never persisted and never
    /// part of change comparison.
    #[serde(skip_serializing, default)]
    pub uid: Option<String>,

    /// Per-plugin settings and any other sections we do not interpret.
    #[serde(flatten, default)]
    pub sections: BTreeMap<String, serde_yaml::Value>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway: GatewaySection::default(),
            uid: None,
            sections: BTreeMap::new(),
        }
    }
}

/// The `gateway:` section of the configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// Port the workers listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bind address for the workers
    #[serde(default = "default_address")]
    pub address: String,

    /// Worker pool size (default: host CPU core count)
    pub workers: Option<usize>,

    /// When a freshly spawned worker counts as ready
    #[serde(default)]
    pub ready_when: ReadyWhen,

    /// Remote source for configuration synchronization
    pub config_url: Option<String>,

    /// Period between configuration polls, in seconds
    #[serde(default = "default_poll_interval")]
    pub config_change_poll_interval: u64,

    /// Disable the configuration poll loop entirely
    #[serde(default)]
    pub disable_config_poll_interval: bool,

    /// Plugin chain configuration
    #[serde(default)]
    pub plugins: PluginChainConfig,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            port: default_port(),
            address: default_address(),
            workers: None,
            ready_when: ReadyWhen::default(),
            config_url: None,
            config_change_poll_interval: default_poll_interval(),
            disable_config_poll_interval: false,
            plugins: PluginChainConfig::default(),
        }
    }
}

impl GatewaySection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.config_change_poll_interval)
    }

    /// Pool size, defaulting to the host CPU core count
    pub fn num_workers(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }
}

/// Readiness policy for newly spawned workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyWhen {
    /// Ready on the first "listening" event (worker bound its socket)
    #[default]
    Listening,
    /// Ready as soon as the worker comes online
    Online,
}

/// The `gateway.plugins:` block
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginChainConfig {
    /// Ordered plugin ids; defines the default pre-flow execution order
    #[serde(default)]
    pub sequence: Vec<String>,

    /// Comma-separated URL patterns excluded from all but the minimal
    /// analytics + metrics sequence
    pub exclude_urls: Option<String>,

    /// Keep only the raw exclusion pattern strings and resolve sequences
    /// lazily instead of building the full URL cache up front
    #[serde(default)]
    pub disable_exclusion_cache: bool,
}

/// Settings block for a single plugin (top-level section keyed by plugin id)
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginSettings {
    /// Comma-separated URL patterns for which this plugin is skipped
    pub exclude_urls: Option<String>,

    #[serde(flatten, default)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

impl GatewayConfig {
    /// Parse a configuration document, substituting `<E>NAME</E>` tokens
    /// from the environment.
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(text)?;
        replace_env_tags(&mut value);
        let config: GatewayConfig = serde_yaml::from_value(value)?;
        Ok(config)
    }

    /// Load a configuration file from disk
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        if text.trim().is_empty() {
            return Err(GatewayError::Config(format!(
                "config {} is empty",
                path.display()
            )));
        }
        Self::parse(&text)
    }

    /// Persist the configuration to `target`. The run-scoped `uid` is never
    /// written out.
    pub fn save(&self, target: &Path) -> Result<(), GatewayError> {
        if let Some(dir) = target.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let dump = serde_yaml::to_string(self)?;
        std::fs::write(target, dump)?;
        Ok(())
    }

    /// Settings block for one plugin, if configured
    pub fn plugin_settings(&self, id: &str) -> Option<PluginSettings> {
        self.sections
            .get(id)
            .and_then(|v| serde_yaml::from_value(v.clone()).ok())
    }

    /// Structural comparison that ignores the run-scoped uid
    pub fn differs_from(&self, other: &GatewayConfig) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.uid = None;
        b.uid = None;
        a != b
    }
}

/// Walk the configuration tree and replace `<E>NAME</E>` tokens inside
/// string values with the value of the `NAME` environment variable. Tokens
/// with no matching variable are left untouched; a diagnostic is logged and
/// processing continues.
pub fn replace_env_tags(value: &mut serde_yaml::Value) {
    let re = Regex::new(r"<E>([A-Za-z_][A-Za-z0-9_]*)</E>").expect("env tag pattern");
    replace_env_tags_inner(value, &re);
}

fn replace_env_tags_inner(value: &mut serde_yaml::Value, re: &Regex) {
    match value {
        serde_yaml::Value::String(s) => {
            if !s.contains("<E>") {
                return;
            }
            let mut out = String::with_capacity(s.len());
            let mut last = 0;
            for caps in re.captures_iter(s) {
                let whole = caps.get(0).expect("match");
                let name = &caps[1];
                out.push_str(&s[last..whole.start()]);
                match std::env::var(name) {
                    Ok(v) => out.push_str(&v),
                    Err(_) => {
                        warn!(var = name, "No environment variable for tag, leaving as-is");
                        out.push_str(whole.as_str());
                    }
                }
                last = whole.end();
            }
            out.push_str(&s[last..]);
            *s = out;
        }
        serde_yaml::Value::Sequence(seq) => {
            for item in seq {
                replace_env_tags_inner(item, re);
            }
        }
        serde_yaml::Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                replace_env_tags_inner(v, re);
            }
        }
        _ => {}
    }
}

/// Well-known file locations for one gateway instance, all inside a single
/// configuration directory.
#[derive(Debug, Clone)]
pub struct InstancePaths {
    config_dir: PathBuf,
}

impl InstancePaths {
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    /// Resolve the configuration directory: explicit flag, then
    /// `PORTCULLIS_CONFIG_DIR`, then `~/.portcullis`.
    pub fn resolve(flag: Option<PathBuf>) -> Self {
        let dir = flag
            .or_else(|| std::env::var(ENV_CONFIG_DIR).ok().map(PathBuf::from))
            .or_else(|| dirs_next::home_dir().map(|h| h.join(".portcullis")))
            .unwrap_or_else(|| PathBuf::from(".portcullis"));
        Self::new(dir)
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Bootstrap configuration edited by the operator
    pub fn source_path(&self) -> PathBuf {
        self.config_dir.join("config.yaml")
    }

    /// Last successfully fetched configuration snapshot
    pub fn cache_path(&self) -> PathBuf {
        self.config_dir.join("cache-config.yaml")
    }

    /// Control socket, one per running instance
    pub fn socket_path(&self) -> PathBuf {
        self.config_dir.join("portcullis.sock")
    }

    /// PID marker file
    pub fn pid_path(&self) -> PathBuf {
        self.config_dir.join("portcullis.pid")
    }
}

// Default value functions
fn default_port() -> u16 {
    8000
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
gateway:
  port: 8800
  workers: 2
  config_change_poll_interval: 30
  plugins:
    sequence: [analytics, metrics, quota, oauth]
    exclude_urls: "/health,/metrics"

oauth:
  exclude_urls: "/public/*"
  allow_no_auth: false

quotas:
  exclude_urls: "/free/*"
"#;

    #[test]
    fn test_parse_config() {
        let config = GatewayConfig::parse(SAMPLE).unwrap();
        assert_eq!(config.gateway.port, 8800);
        assert_eq!(config.gateway.workers, Some(2));
        assert_eq!(config.gateway.config_change_poll_interval, 30);
        assert_eq!(
            config.gateway.plugins.sequence,
            vec!["analytics", "metrics", "quota", "oauth"]
        );
        assert_eq!(
            config.gateway.plugins.exclude_urls.as_deref(),
            Some("/health,/metrics")
        );
    }

    #[test]
    fn test_plugin_settings_lookup() {
        let config = GatewayConfig::parse(SAMPLE).unwrap();
        let oauth = config.plugin_settings("oauth").unwrap();
        assert_eq!(oauth.exclude_urls.as_deref(), Some("/public/*"));
        assert!(oauth.settings.contains_key("allow_no_auth"));
        assert!(config.plugin_settings("nosuch").is_none());
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = GatewayConfig::parse("gateway: {}").unwrap();
        assert_eq!(config.gateway.port, 8000);
        assert_eq!(config.gateway.address, "0.0.0.0");
        assert_eq!(config.gateway.config_change_poll_interval, 600);
        assert_eq!(config.gateway.ready_when, ReadyWhen::Listening);
        assert!(!config.gateway.disable_config_poll_interval);
        assert!(config.gateway.num_workers() >= 1);
    }

    #[test]
    fn test_ready_when_online() {
        let config = GatewayConfig::parse("gateway:\n  ready_when: online\n").unwrap();
        assert_eq!(config.gateway.ready_when, ReadyWhen::Online);
    }

    #[test]
    fn test_save_load_round_trip_excludes_uid() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cache-config.yaml");

        let mut config = GatewayConfig::parse(SAMPLE).unwrap();
        config.uid = Some("run-1".to_string());
        config.save(&target).unwrap();

        let loaded = GatewayConfig::load(&target).unwrap();
        assert!(loaded.uid.is_none());
        assert!(!loaded.differs_from(&config));
    }

    #[test]
    fn test_differs_ignores_uid() {
        let mut a = GatewayConfig::parse(SAMPLE).unwrap();
        let mut b = a.clone();
        a.uid = Some("one".to_string());
        b.uid = Some("two".to_string());
        assert!(!a.differs_from(&b));

        b.gateway.port = 9000;
        assert!(a.differs_from(&b));
    }

    #[test]
    fn test_load_rejects_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "  \n").unwrap();
        assert!(matches!(
            GatewayConfig::load(&path),
            Err(GatewayError::Config(_))
        ));
    }

    #[test]
    fn test_env_tag_substitution() {
        std::env::set_var("PORTCULLIS_TEST_TOKEN", "sekrit");
        let yaml = "gateway: {}\noauth:\n  public_key: \"<E>PORTCULLIS_TEST_TOKEN</E>\"\n";
        let config = GatewayConfig::parse(yaml).unwrap();
        let oauth = config.sections.get("oauth").unwrap();
        let key = oauth.get("public_key").unwrap().as_str().unwrap();
        assert_eq!(key, "sekrit");
        std::env::remove_var("PORTCULLIS_TEST_TOKEN");
    }

    #[test]
    fn test_env_tag_missing_variable_left_untouched() {
        let yaml = "gateway: {}\noauth:\n  public_key: \"<E>PORTCULLIS_NO_SUCH_VAR</E>\"\n";
        let config = GatewayConfig::parse(yaml).unwrap();
        let oauth = config.sections.get("oauth").unwrap();
        let key = oauth.get("public_key").unwrap().as_str().unwrap();
        assert_eq!(key, "<E>PORTCULLIS_NO_SUCH_VAR</E>");
    }

    #[test]
    fn test_env_tag_mixed_tokens() {
        std::env::set_var("PORTCULLIS_TEST_HOST", "example.com");
        let yaml =
            "gateway: {}\nupstream:\n  url: \"https://<E>PORTCULLIS_TEST_HOST</E>/<E>PORTCULLIS_MISSING</E>/v1\"\n";
        let config = GatewayConfig::parse(yaml).unwrap();
        let upstream = config.sections.get("upstream").unwrap();
        let url = upstream.get("url").unwrap().as_str().unwrap();
        assert_eq!(url, "https://example.com/<E>PORTCULLIS_MISSING</E>/v1");
        std::env::remove_var("PORTCULLIS_TEST_HOST");
    }

    #[test]
    fn test_instance_paths() {
        let paths = InstancePaths::new(PathBuf::from("/var/lib/portcullis"));
        assert_eq!(
            paths.socket_path(),
            PathBuf::from("/var/lib/portcullis/portcullis.sock")
        );
        assert_eq!(
            paths.pid_path(),
            PathBuf::from("/var/lib/portcullis/portcullis.pid")
        );
        assert_eq!(
            paths.cache_path(),
            PathBuf::from("/var/lib/portcullis/cache-config.yaml")
        );
        assert_eq!(
            paths.source_path(),
            PathBuf::from("/var/lib/portcullis/config.yaml")
        );
    }
}

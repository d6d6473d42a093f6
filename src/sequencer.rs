//! Per-URL plugin sequencing.
//!
//! Given the active configuration, computes the ordered plugin list for the
//! pre-response and post-response phases of a request. Each worker process
//! builds one sequencer from its configuration snapshot; resolution is pure
//! and deterministic, with two layers of caching so repeat URLs never
//! re-match patterns.

use crate::config::GatewayConfig;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

pub const ANALYTICS: &str = "analytics";
pub const METRICS: &str = "metrics";
const QUOTA: &str = "quota";
/// Legacy configuration key accepted for the quota plugin's exclusions
const QUOTA_LEGACY: &str = "quotas";

/// One configured plugin: identifier plus arbitrary settings. Ordering in
/// the configured sequence defines default execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginDescriptor {
    pub id: String,
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

impl PluginDescriptor {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            settings: BTreeMap::new(),
        }
    }
}

/// The resolved execution plan for one URL
#[derive(Debug, Clone, PartialEq)]
pub struct PluginSequence {
    pub preflow: Vec<PluginDescriptor>,
    pub postflow: Vec<PluginDescriptor>,
}

impl PluginSequence {
    pub fn preflow_ids(&self) -> Vec<&str> {
        self.preflow.iter().map(|p| p.id.as_str()).collect()
    }

    pub fn postflow_ids(&self) -> Vec<&str> {
        self.postflow.iter().map(|p| p.id.as_str()).collect()
    }
}

/// Resolves the plugin sequence for request URLs.
///
/// Resolution order: exact hit in the eager cache, hit in the pattern
/// memoization cache, ordered scan of the eager patterns, scan of the
/// exclusion pattern set, and finally the full default sequence. Every
/// non-exact resolution is memoized before returning.
pub struct PluginSequencer {
    plugins: Vec<PluginDescriptor>,
    default_sequence: Arc<PluginSequence>,
    /// Minimal analytics + metrics plan served for globally excluded URLs
    minimal: Arc<PluginSequence>,
    global_patterns: Vec<String>,
    /// Per-plugin exclusion patterns, legacy quota fallback already applied
    plugin_patterns: HashMap<String, Vec<String>>,
    /// Eager exact-URL cache built from all configured exclusion rules
    url_cache: HashMap<String, Arc<PluginSequence>>,
    /// Eager cache keys in registration order: global exclusions first,
    /// then per-plugin patterns in configured sequence order. Pattern scans
    /// walk this list so overlapping patterns always resolve the same way.
    eager_order: Vec<String>,
    /// Raw pattern strings, only populated when the eager cache is disabled
    lazy_patterns: Vec<String>,
    /// Memoization for URLs resolved through pattern matching
    pattern_cache: Mutex<HashMap<String, Arc<PluginSequence>>>,
    eager: bool,
}

impl PluginSequencer {
    pub fn new(config: &GatewayConfig) -> Self {
        let chain = &config.gateway.plugins;

        let plugins: Vec<PluginDescriptor> = chain
            .sequence
            .iter()
            .map(|id| PluginDescriptor {
                id: id.clone(),
                settings: config
                    .plugin_settings(id)
                    .map(|s| s.settings)
                    .unwrap_or_default(),
            })
            .collect();

        let minimal_plugins: Vec<PluginDescriptor> = plugins
            .iter()
            .filter(|p| p.id == ANALYTICS || p.id == METRICS)
            .cloned()
            .collect();
        // The minimal plan runs the same short list in both phases
        let minimal = Arc::new(PluginSequence {
            preflow: minimal_plugins.clone(),
            postflow: minimal_plugins,
        });

        let default_sequence = Arc::new(PluginSequence {
            preflow: plugins.clone(),
            postflow: postflow_for(&plugins),
        });

        let global_patterns = split_patterns(chain.exclude_urls.as_deref());

        let mut plugin_patterns = HashMap::new();
        for plugin in &plugins {
            if plugin.id == ANALYTICS || plugin.id == METRICS {
                continue;
            }
            let mut exclude = config
                .plugin_settings(&plugin.id)
                .and_then(|s| s.exclude_urls);
            if exclude.is_none() && plugin.id == QUOTA {
                exclude = config
                    .plugin_settings(QUOTA_LEGACY)
                    .and_then(|s| s.exclude_urls);
            }
            if let Some(list) = exclude.as_deref() {
                plugin_patterns.insert(plugin.id.clone(), split_patterns(Some(list)));
            }
        }

        let eager = !chain.disable_exclusion_cache;
        let mut sequencer = Self {
            plugins,
            default_sequence,
            minimal,
            global_patterns,
            plugin_patterns,
            url_cache: HashMap::new(),
            eager_order: Vec::new(),
            lazy_patterns: Vec::new(),
            pattern_cache: Mutex::new(HashMap::new()),
            eager,
        };

        if eager {
            sequencer.load_all_urls();
            debug!(
                urls = sequencer.url_cache.len(),
                "Loaded plugin exclusion URLs into cache"
            );
        } else {
            let mut unique: Vec<String> = sequencer.global_patterns.clone();
            for patterns in sequencer.plugin_patterns.values() {
                for p in patterns {
                    if !unique.contains(p) {
                        unique.push(p.clone());
                    }
                }
            }
            debug!(patterns = unique.len(), "Exclusion cache disabled, keeping raw patterns");
            sequencer.lazy_patterns = unique;
        }

        sequencer
    }

    /// Build the exact-URL cache from every configured exclusion rule
    fn load_all_urls(&mut self) {
        for pattern in &self.global_patterns {
            if self
                .url_cache
                .insert(pattern.clone(), Arc::clone(&self.minimal))
                .is_none()
            {
                self.eager_order.push(pattern.clone());
            }
        }
        for plugin in &self.plugins {
            let Some(patterns) = self.plugin_patterns.get(&plugin.id) else {
                continue;
            };
            for pattern in patterns {
                // A pattern shared by several plugins narrows the existing
                // entry further instead of starting over.
                let base: Vec<PluginDescriptor> = match self.url_cache.get(pattern) {
                    Some(existing) => existing.preflow.clone(),
                    None => self.plugins.clone(),
                };
                let preflow: Vec<PluginDescriptor> = base
                    .into_iter()
                    .filter(|p| p.id != plugin.id)
                    .collect();
                let sequence = PluginSequence {
                    postflow: postflow_for(&preflow),
                    preflow,
                };
                if self
                    .url_cache
                    .insert(pattern.clone(), Arc::new(sequence))
                    .is_none()
                {
                    self.eager_order.push(pattern.clone());
                }
            }
        }
    }

    /// Resolve the plugin execution plan for one request URL
    pub fn sequence_for(&self, url: &str) -> Arc<PluginSequence> {
        if self.eager {
            if let Some(sequence) = self.url_cache.get(url) {
                return Arc::clone(sequence);
            }
        }

        if let Some(sequence) = self.pattern_cache.lock().get(url) {
            return Arc::clone(sequence);
        }

        if self.eager {
            for pattern in &self.eager_order {
                if matches_pattern(url, pattern) {
                    let Some(sequence) = self.url_cache.get(pattern) else {
                        continue;
                    };
                    let sequence = Arc::clone(sequence);
                    self.pattern_cache
                        .lock()
                        .insert(url.to_string(), Arc::clone(&sequence));
                    return sequence;
                }
            }
        }

        for pattern in &self.lazy_patterns {
            if matches_pattern(url, pattern) {
                let sequence = self.build_lazy_sequence(url);
                self.pattern_cache
                    .lock()
                    .insert(url.to_string(), Arc::clone(&sequence));
                return sequence;
            }
        }

        Arc::clone(&self.default_sequence)
    }

    /// The URL hit an exclusion pattern while the eager cache is disabled:
    /// the global list wins outright, otherwise assemble a custom plan by
    /// testing every plugin's own patterns against the URL.
    fn build_lazy_sequence(&self, url: &str) -> Arc<PluginSequence> {
        if self
            .global_patterns
            .iter()
            .any(|pattern| matches_pattern(url, pattern))
        {
            return Arc::clone(&self.minimal);
        }

        let mut preflow = self.minimal.preflow.clone();
        for plugin in &self.plugins {
            if plugin.id == ANALYTICS || plugin.id == METRICS {
                continue;
            }
            let excluded = self
                .plugin_patterns
                .get(&plugin.id)
                .map(|patterns| patterns.iter().any(|p| matches_pattern(url, p)))
                .unwrap_or(false);
            if !excluded {
                preflow.push(plugin.clone());
            }
        }
        Arc::new(PluginSequence {
            postflow: postflow_for(&preflow),
            preflow,
        })
    }

    pub fn default_sequence(&self) -> Arc<PluginSequence> {
        Arc::clone(&self.default_sequence)
    }

    #[cfg(test)]
    fn cached_url_count(&self) -> usize {
        self.url_cache.len()
    }
}

/// Post-flow is the reverse of pre-flow, with one tie-break: analytics must
/// execute strictly last so it observes metrics' output. If the reversed
/// list would end analytics-then-metrics, the tail pair is swapped.
pub fn postflow_for(preflow: &[PluginDescriptor]) -> Vec<PluginDescriptor> {
    let mut reversed: Vec<PluginDescriptor> = preflow.iter().rev().cloned().collect();
    let len = reversed.len();
    if len >= 2 && reversed[len - 2].id == ANALYTICS && reversed[len - 1].id == METRICS {
        reversed.swap(len - 2, len - 1);
    }
    reversed
}

/// Exact string equality, or wildcard matching where `*` expands to zero or
/// more characters and every other regex metacharacter is escaped. Query
/// strings are stripped from both sides before matching.
pub fn matches_pattern(url: &str, pattern: &str) -> bool {
    let base_url = url.split('?').next().unwrap_or(url);
    if pattern.contains('*') {
        let mut source = String::with_capacity(pattern.len() + 8);
        source.push('^');
        for part in pattern.split('*') {
            source.push_str(&regex::escape(part));
            source.push_str(".*");
        }
        // One ".*" too many from the trailing split boundary
        source.truncate(source.len() - 2);
        source.push('$');
        match Regex::new(&source) {
            Ok(re) => re.is_match(base_url),
            Err(_) => false,
        }
    } else {
        let base_pattern = pattern.split('?').next().unwrap_or(pattern);
        base_pattern == base_url
    }
}

fn split_patterns(list: Option<&str>) -> Vec<String> {
    list.map(|s| {
        s.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

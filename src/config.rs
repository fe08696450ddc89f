use crate::errors::ConfigError;
use crate::router::BackendSettings;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

type Result<T> = std::result::Result<T, ConfigError>;

/// Metrics publisher configuration.
///
/// Selects the adapter (`noop` or `statsd`) and carries the StatsD
/// wiring when that adapter is chosen. Never fails to load: a missing
/// or unknown adapter falls back to `noop`.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub adapter: String,
    pub statsd_host: Option<String>,
    pub statsd_bind: String,
    pub prefix: String,
    pub default_tags: Option<String>,
}

impl MetricsConfig {
    pub fn from_env() -> Self {
        Self {
            adapter: default_env("METRICS_ADAPTER", "noop").to_lowercase(),
            statsd_host: std::env::var("METRICS_STATSD_HOST").ok(),
            statsd_bind: default_env("METRICS_STATSD_BIND", "0.0.0.0:0"),
            prefix: default_env("METRICS_PREFIX", "tldw"),
            default_tags: std::env::var("METRICS_TAGS").ok(),
        }
    }
}

/// Service configuration resolved from the environment.
///
/// Every variable has a workable default so the service starts with an
/// empty environment: fixture backends, a local `state/` directory, and
/// no-op metrics. Backend tables are the one strict surface, since a
/// typo'd entry would otherwise drop the backend it names silently.
#[derive(Clone, Debug)]
pub struct Config {
    pub version: String,
    pub state_dir: PathBuf,
    pub fixture_dir: PathBuf,
    pub llm_backends: HashMap<String, BackendSettings>,
    pub speech_backends: HashMap<String, BackendSettings>,
    pub summarize_keywords: Vec<String>,
    pub answer_keywords: Vec<String>,
    pub restart_backoff: Duration,
    pub blocking_pool_size: usize,
    pub token_ceiling: Option<u64>,
    pub touch_up_transcripts: bool,
    pub json_logs: bool,
    pub metrics: MetricsConfig,
}

impl Config {
    pub fn new() -> Result<Self> {
        let llm_backends = parse_backend_table(
            "TLDW_LLM_BACKENDS",
            &default_env("TLDW_LLM_BACKENDS", "canned=10"),
        )?;
        let speech_backends = parse_backend_table(
            "TLDW_SPEECH_BACKENDS",
            &default_env("TLDW_SPEECH_BACKENDS", "canned=10"),
        )?;

        let restart_backoff_secs = std::env::var("TLDW_RESTART_BACKOFF_SECS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<u64>()
            .unwrap_or(10)
            .max(1);

        let blocking_pool_size = std::env::var("TLDW_BLOCKING_POOL_SIZE")
            .unwrap_or_else(|_| "2".to_string())
            .parse::<usize>()
            .unwrap_or(2)
            .max(1);

        let token_ceiling = std::env::var("TLDW_TOKEN_CEILING")
            .ok()
            .and_then(|v| v.parse::<u64>().ok());

        Ok(Self {
            version: version(),
            state_dir: PathBuf::from(default_env("TLDW_STATE_DIR", "state")),
            fixture_dir: PathBuf::from(default_env("TLDW_FIXTURE_DIR", "fixtures")),
            llm_backends,
            speech_backends,
            summarize_keywords: parse_keywords(&default_env(
                "TLDW_SUMMARIZE_KEYWORDS",
                "summarize,tldw",
            )),
            answer_keywords: parse_keywords(&default_env("TLDW_ANSWER_KEYWORDS", "ask")),
            restart_backoff: Duration::from_secs(restart_backoff_secs),
            blocking_pool_size,
            token_ceiling,
            touch_up_transcripts: std::env::var("TLDW_TOUCH_UP_TRANSCRIPTS")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
            json_logs: std::env::var("JSON_LOGS")
                .map(|v| v.to_lowercase() == "true")
                .unwrap_or(false),
            metrics: MetricsConfig::from_env(),
        })
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.json")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.state_dir.join("cache.json")
    }

    pub fn queue_snapshot_path(&self) -> PathBuf {
        self.state_dir.join("queues.json")
    }

    pub fn metadata_fixture_dir(&self) -> PathBuf {
        self.fixture_dir.join("metadata")
    }

    pub fn trigger_fixture_dir(&self) -> PathBuf {
        self.fixture_dir.join("triggers")
    }

    pub fn llm_fixture_path(&self, alias: &str) -> PathBuf {
        self.fixture_dir.join("llm").join(format!("{alias}.json"))
    }

    pub fn speech_fixture_path(&self, alias: &str) -> PathBuf {
        self.fixture_dir.join("speech").join(format!("{alias}.json"))
    }
}

/// Parse a backend table such as `remote=90,local=10:off`.
///
/// Entries are comma separated `alias=priority` pairs with an optional
/// `:on` / `:off` flag; omitting the flag means enabled. Whitespace
/// around entries is ignored and fully blank entries are skipped, but a
/// table with no usable entries at all is an error.
pub fn parse_backend_table(
    var_name: &str,
    raw: &str,
) -> Result<HashMap<String, BackendSettings>> {
    let mut table = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (alias, value) =
            entry
                .split_once('=')
                .ok_or_else(|| ConfigError::InvalidBackendEntry {
                    var_name: var_name.to_string(),
                    entry: entry.to_string(),
                    details: "expected alias=priority".to_string(),
                })?;
        let alias = alias.trim();
        if alias.is_empty() {
            return Err(ConfigError::InvalidBackendEntry {
                var_name: var_name.to_string(),
                entry: entry.to_string(),
                details: "alias is empty".to_string(),
            });
        }
        let (priority_text, enabled) = match value.trim().split_once(':') {
            Some((priority, "off")) => (priority, false),
            Some((priority, "on")) => (priority, true),
            Some((_, flag)) => {
                return Err(ConfigError::InvalidBackendEntry {
                    var_name: var_name.to_string(),
                    entry: entry.to_string(),
                    details: format!("unknown flag {flag:?}, expected on or off"),
                });
            }
            None => (value.trim(), true),
        };
        let priority = priority_text.trim().parse::<i32>().map_err(|_| {
            ConfigError::InvalidBackendEntry {
                var_name: var_name.to_string(),
                entry: entry.to_string(),
                details: format!("priority {priority_text:?} is not an integer"),
            }
        })?;
        if table
            .insert(alias.to_string(), BackendSettings { priority, enabled })
            .is_some()
        {
            return Err(ConfigError::InvalidBackendEntry {
                var_name: var_name.to_string(),
                entry: entry.to_string(),
                details: "duplicate alias".to_string(),
            });
        }
    }
    if table.is_empty() {
        return Err(ConfigError::EmptyBackendTable {
            var_name: var_name.to_string(),
            raw: raw.to_string(),
        });
    }
    Ok(table)
}

/// Split a comma separated keyword list, dropping blanks.
pub fn parse_keywords(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn default_env(name: &str, default_value: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default_value.to_string())
}

pub fn version() -> String {
    option_env!("GIT_HASH")
        .unwrap_or(env!("CARGO_PKG_VERSION"))
        .to_string()
}

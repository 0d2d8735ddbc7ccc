// Application configuration, loaded from environment variables and CLI flags.

use std::path::PathBuf;
use std::time::Duration;

use crate::dispatch::MAX_RATE_PER_MINUTE;

/// Application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Port to bind the HTTP server to.
    pub port: u16,
    /// Root directory for store snapshots; each map gets a subdirectory.
    pub data_dir: PathBuf,
    /// Base URL of the official API, without a trailing slash.
    pub api_base: String,
    /// Maps to mirror; each one becomes a database in the registry.
    pub maps: Vec<String>,
    /// Requested request budget. Clamped to the API ceiling by the bucket.
    pub rate_per_minute: u32,
    /// How often every store is flushed to disk.
    pub flush_interval: Duration,
    /// How often the maps are re-synced. `None` disables the sync worker.
    pub sync_interval: Option<Duration>,
    /// Timeout for a single outbound request.
    pub request_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 3000,
            data_dir: PathBuf::from("./data"),
            api_base: "https://api.earthmc.net/v3".to_string(),
            maps: vec!["aurora".to_string()],
            rate_per_minute: MAX_RATE_PER_MINUTE,
            flush_interval: Duration::from_secs(300),
            sync_interval: Some(Duration::from_secs(600)),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from the process environment and arguments.
    ///
    /// Environment variables:
    /// - `PORT` - HTTP server port (default: 3000)
    /// - `EMCACHE_DATA_DIR` - snapshot directory (default: `./data`)
    /// - `EMCACHE_API_BASE` - official API base URL
    /// - `EMCACHE_MAPS` - comma-separated map names (default: `aurora`)
    /// - `EMCACHE_RATE_PER_MINUTE` - request budget (default: 180)
    /// - `EMCACHE_FLUSH_SECS` - flush period (default: 300)
    /// - `EMCACHE_SYNC_SECS` - sync period, `0` disables (default: 600)
    /// - `EMCACHE_REQUEST_TIMEOUT_SECS` - outbound timeout (default: 10)
    ///
    /// CLI flags:
    /// - `--port <PORT>` - Override the port
    /// - `--no-sync` - Do not start the sync worker
    pub fn load() -> Self {
        let args: Vec<String> = std::env::args().collect();
        Self::from_sources(&args, |key| std::env::var(key).ok())
    }

    /// Build a config from explicit arguments and an environment lookup.
    pub fn from_sources<F>(args: &[String], env: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        // Port: CLI flag --port takes precedence, then env var, then default
        let port = Self::parse_cli_value(args, "--port")
            .and_then(|v| v.parse().ok())
            .or_else(|| env("PORT").and_then(|v| v.parse().ok()))
            .unwrap_or(defaults.port);

        let data_dir = env("EMCACHE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);

        let api_base = env("EMCACHE_API_BASE")
            .map(|v| v.trim_end_matches('/').to_string())
            .unwrap_or(defaults.api_base);

        let maps = env("EMCACHE_MAPS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|maps| !maps.is_empty())
            .unwrap_or(defaults.maps);

        let rate_per_minute = env("EMCACHE_RATE_PER_MINUTE")
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.rate_per_minute);

        let flush_interval = env("EMCACHE_FLUSH_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.flush_interval);

        let sync_interval = if args.iter().any(|a| a == "--no-sync") {
            None
        } else {
            match env("EMCACHE_SYNC_SECS").and_then(|v| v.parse::<u64>().ok()) {
                Some(0) => None,
                Some(secs) => Some(Duration::from_secs(secs)),
                None => defaults.sync_interval,
            }
        };

        let request_timeout = env("EMCACHE_REQUEST_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(defaults.request_timeout);

        Config {
            port,
            data_dir,
            api_base,
            maps,
            rate_per_minute,
            flush_interval,
            sync_interval,
            request_timeout,
        }
    }

    /// Directory holding the stores of one map.
    pub fn map_dir(&self, map: &str) -> PathBuf {
        self.data_dir.join(map)
    }

    /// Parse a CLI flag value like `--port 8080`.
    fn parse_cli_value(args: &[String], flag: &str) -> Option<String> {
        args.windows(2).find_map(|pair| {
            if pair[0] == flag {
                Some(pair[1].clone())
            } else {
                None
            }
        })
    }
}

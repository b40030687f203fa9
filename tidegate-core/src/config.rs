//! Centralized configuration for the gateway.
//!
//! Defaults live here. `TIDEGATE_*` environment variables override them, and
//! the CLI overrides both.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Central configuration for all gateway components.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub http: HttpConfig,
    pub sessions: SessionConfig,
    pub cache: CacheConfig,
    pub storage: StorageConfig,
    pub trackers: TrackerConfig,
    pub upload: UploadConfig,
    pub lookup: LookupConfig,
}

#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Listen address
    pub addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:8080".to_string(),
        }
    }
}

/// Session lifetime after the last request releases it.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Delay between the last release and eviction
    pub grace: Duration,
    /// Drop torrents from the engine on eviction
    pub expire_torrents: bool,
    /// Delete stored pieces when a torrent is dropped
    pub cleanup_storage_on_drop: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(60),
            expire_torrents: true,
            cleanup_storage_on_drop: false,
        }
    }
}

/// Where cached metainfo blobs are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CacheBackend {
    /// One `<hex>.torrent` file per info hash
    File,
    /// Embedded sled database
    Sled,
    /// Process memory only
    Memory,
}

impl FromStr for CacheBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "file" => Ok(CacheBackend::File),
            "sled" => Ok(CacheBackend::Sled),
            "memory" => Ok(CacheBackend::Memory),
            _ => Err(format!("Invalid cache backend: {s}")),
        }
    }
}

impl fmt::Display for CacheBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CacheBackend::File => "file",
            CacheBackend::Sled => "sled",
            CacheBackend::Memory => "memory",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub backend: CacheBackend,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("torrents"),
            backend: CacheBackend::File,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Piece storage root
    pub dir: PathBuf,
    /// Keep pieces in memory instead of `dir`
    pub in_memory: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("filecache"),
            in_memory: false,
        }
    }
}

/// Operator tracker policy.
#[derive(Debug, Clone, Default)]
pub struct TrackerConfig {
    /// Trackers added to every new session and upload
    pub implicit: Vec<String>,
    /// Use only the implicit trackers, discarding cached and posted ones
    pub override_existing: bool,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Pieces buffered per consumer between the upload reader and hashing/storage
    pub pipe_capacity: usize,
    /// Largest accepted multipart body
    pub max_form_bytes: usize,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: 4,
            max_form_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Base URLs of peer gateways answering `/bep44`
    pub backends: Vec<String>,
    /// Deadline applied to every backend
    pub timeout: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            backends: Vec::new(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl GatewayConfig {
    /// Defaults with `TIDEGATE_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Applies overrides from a variable lookup. Unparseable values are
    /// logged and ignored.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("TIDEGATE_ADDR") {
            self.http.addr = addr;
        }
        if let Some(secs) = parse_var::<u64>(&var, "TIDEGATE_GRACE_SECS") {
            self.sessions.grace = Duration::from_secs(secs);
        }
        if let Some(expire) = parse_var(&var, "TIDEGATE_EXPIRE_TORRENTS") {
            self.sessions.expire_torrents = expire;
        }
        if let Some(cleanup) = parse_var(&var, "TIDEGATE_CLEANUP_STORAGE") {
            self.sessions.cleanup_storage_on_drop = cleanup;
        }
        if let Some(dir) = var("TIDEGATE_CACHE_DIR") {
            self.cache.dir = PathBuf::from(dir);
        }
        if let Some(backend) = parse_var(&var, "TIDEGATE_CACHE_BACKEND") {
            self.cache.backend = backend;
        }
        if let Some(dir) = var("TIDEGATE_STORAGE_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }
        if let Some(trackers) = var("TIDEGATE_IMPLICIT_TRACKERS") {
            self.trackers.implicit = split_list(&trackers);
        }
        if let Some(override_existing) = parse_var(&var, "TIDEGATE_OVERRIDE_TRACKERS") {
            self.trackers.override_existing = override_existing;
        }
        if let Some(capacity) = parse_var::<usize>(&var, "TIDEGATE_PIPE_CAPACITY") {
            self.upload.pipe_capacity = capacity.max(1);
        }
        if let Some(backends) = var("TIDEGATE_LOOKUP_BACKENDS") {
            self.lookup.backends = split_list(&backends);
        }
        if let Some(secs) = parse_var::<u64>(&var, "TIDEGATE_LOOKUP_TIMEOUT_SECS") {
            self.lookup.timeout = Duration::from_secs(secs);
        }
    }

    /// In-memory stores and a short grace window.
    pub fn for_testing() -> Self {
        let mut config = Self::default();
        config.sessions.grace = Duration::from_secs(1);
        config.cache.backend = CacheBackend::Memory;
        config.storage.in_memory = true;
        config.lookup.timeout = Duration::from_secs(1);
        config
    }
}

fn parse_var<T: FromStr>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let value = var(name)?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring {}={:?}: not a valid value", name, value);
            None
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = GatewayConfig::default();

        assert_eq!(config.http.addr, "localhost:8080");
        assert_eq!(config.sessions.grace, Duration::from_secs(60));
        assert!(config.sessions.expire_torrents);
        assert!(!config.sessions.cleanup_storage_on_drop);
        assert_eq!(config.cache.dir, PathBuf::from("torrents"));
        assert_eq!(config.cache.backend, CacheBackend::File);
        assert_eq!(config.storage.dir, PathBuf::from("filecache"));
        assert_eq!(config.upload.pipe_capacity, 4);
        assert!(config.lookup.backends.is_empty());
    }

    #[test]
    fn test_testing_preset() {
        let config = GatewayConfig::for_testing();
        assert!(config.storage.in_memory);
        assert_eq!(config.cache.backend, CacheBackend::Memory);
    }

    #[test]
    fn test_env_override() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TIDEGATE_ADDR", "0.0.0.0:9000"),
            ("TIDEGATE_GRACE_SECS", "5"),
            ("TIDEGATE_EXPIRE_TORRENTS", "false"),
            ("TIDEGATE_CACHE_BACKEND", "sled"),
            ("TIDEGATE_IMPLICIT_TRACKERS", "udp://a:1, http://b/announce,"),
            ("TIDEGATE_PIPE_CAPACITY", "0"),
            ("TIDEGATE_LOOKUP_TIMEOUT_SECS", "not-a-number"),
        ]);

        let mut config = GatewayConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.http.addr, "0.0.0.0:9000");
        assert_eq!(config.sessions.grace, Duration::from_secs(5));
        assert!(!config.sessions.expire_torrents);
        assert_eq!(config.cache.backend, CacheBackend::Sled);
        assert_eq!(
            config.trackers.implicit,
            vec!["udp://a:1".to_string(), "http://b/announce".to_string()]
        );
        assert_eq!(config.upload.pipe_capacity, 1);
        assert_eq!(config.lookup.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_from_env_reads_process_environment() {
        unsafe {
            std::env::set_var("TIDEGATE_STORAGE_DIR", "/tmp/tidegate-pieces");
        }

        let config = GatewayConfig::from_env();
        assert_eq!(config.storage.dir, PathBuf::from("/tmp/tidegate-pieces"));

        unsafe {
            std::env::remove_var("TIDEGATE_STORAGE_DIR");
        }
    }

    #[test]
    fn test_cache_backend_parsing() {
        assert_eq!("FILE".parse::<CacheBackend>().unwrap(), CacheBackend::File);
        assert!("redis".parse::<CacheBackend>().is_err());
        assert_eq!(CacheBackend::Sled.to_string(), "sled");
    }
}

//! Read path configuration and context.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use bytes::Bytes;
use nrt_core::{RecordKey, RecordStore, StoreConfig};
use tracing::info;

use crate::cache::{CacheConfig, DEFAULT_MAX_BYTES, RecordCache};
use crate::holdings::{DataSearch, PatternSyntax, holdings_search};

/// Read path configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the record store database.
    pub db_path: PathBuf,

    /// Store connections available to query handlers.
    pub db_max_connections: usize,

    /// Record cache byte budget.
    pub cache_bytes: u64,

    /// Record cache time-to-live; unset keeps entries until evicted.
    pub cache_ttl: Option<Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `NRT_DB_PATH`: store path (default: "./data/nrt.db")
    /// - `NRT_DB_MAX_CONNECTIONS`: store connections (default: 10)
    /// - `NRT_CACHE_BYTES`: cache budget in bytes (default: 1000000000)
    /// - `NRT_CACHE_TTL_SECS`: cache TTL in seconds (default: none, 0 disables)
    pub fn from_env() -> anyhow::Result<Self> {
        let db_path = std::env::var("NRT_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/nrt.db"));

        let db_max_connections = parse_var("NRT_DB_MAX_CONNECTIONS")?.unwrap_or(10);
        if db_max_connections == 0 {
            anyhow::bail!("NRT_DB_MAX_CONNECTIONS must be at least 1");
        }

        let cache_bytes = parse_var("NRT_CACHE_BYTES")?.unwrap_or(DEFAULT_MAX_BYTES);

        let cache_ttl = parse_var::<u64>("NRT_CACHE_TTL_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        info!(
            db_path = %db_path.display(),
            db_max_connections,
            cache_bytes,
            cache_ttl = ?cache_ttl,
            "read path configuration loaded"
        );

        Ok(Self {
            db_path,
            db_max_connections,
            cache_bytes,
            cache_ttl,
        })
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            path: self.db_path.clone(),
            max_connections: self.db_max_connections,
            ..Default::default()
        }
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            max_bytes: self.cache_bytes,
            ttl: self.cache_ttl,
        }
    }
}

fn parse_var<T>(name: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{name} is not a valid number: {value:?}")),
        _ => Ok(None),
    }
}

/// Everything a query handler needs, built once at startup and shared.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct ReadContext {
    store: Arc<RecordStore>,
    cache: RecordCache<RecordStore>,
}

impl ReadContext {
    /// Open the store and build the cache from configuration.
    pub fn open(config: &Config) -> anyhow::Result<Self> {
        let store = RecordStore::open(config.store_config())
            .with_context(|| format!("Failed to open record store at {:?}", config.db_path))?;
        Ok(Self::new(Arc::new(store), &config.cache_config()))
    }

    /// Build a context over an already open store.
    pub fn new(store: Arc<RecordStore>, cache: &CacheConfig) -> Self {
        let cache = RecordCache::new(Arc::clone(&store), cache);
        Self { store, cache }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn cache(&self) -> &RecordCache<RecordStore> {
        &self.cache
    }

    /// Keys matching a holdings query.
    pub fn holdings(
        &self,
        search: &DataSearch,
        syntax: PatternSyntax,
    ) -> nrt_core::Result<Vec<RecordKey>> {
        holdings_search(self.store.as_ref(), search, syntax)
    }

    /// Record bytes for a key, through the cache.
    pub fn record(&self, key: &RecordKey) -> nrt_core::Result<Bytes> {
        self.cache.get(key)
    }
}

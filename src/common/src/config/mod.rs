use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Connection parameters for a single data endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Data source name (PostgreSQL or SQLite DSN)
    pub dsn: String,
    /// Upper bound on pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
            max_connections: default_max_connections(),
        }
    }
}

impl DatabaseConfig {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            ..Default::default()
        }
    }
}

/// A named source/target pairing, both sides referring to keys in `databases`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PairConfig {
    pub source: String,
    pub target: String,
}

/// Defaults for the binary-search orphan removal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Target row count below which a segment is diffed directly
    pub threshold: u64,
    /// Segments narrower than this are never bisected further
    #[serde(with = "humantime_serde")]
    pub min_segment_size: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            threshold: 10_000,
            min_segment_size: Duration::from_secs(10),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Endpoint connection settings keyed by endpoint name
    #[serde(default)]
    pub databases: HashMap<String, DatabaseConfig>,
    /// Source/target pairs keyed by pair name
    #[serde(default)]
    pub pairs: HashMap<String, PairConfig>,
    /// Binary-search tuning
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl Configuration {
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file("eltsync.toml"))
            .merge(Env::prefixed("ELTSYNC__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ELTSYNC__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Look up the connection settings of an endpoint.
    pub fn database(&self, key: &str) -> Option<&DatabaseConfig> {
        self.databases.get(key)
    }

    /// Look up a pair by name.
    pub fn pair(&self, name: &str) -> Option<&PairConfig> {
        self.pairs.get(name)
    }
}

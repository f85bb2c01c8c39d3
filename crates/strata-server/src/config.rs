//! Server Configuration
//!
//! Loaded from the TOML file named by `STRATA_CONFIG` (all sections optional),
//! then overridden from the environment:
//!
//! - `STRATA_BIND_ADDR`: HTTP bind address (default: 0.0.0.0:9201)
//! - `STRATA_DATA_DIR`: Block Store data directory
//! - `STRATA_BUCKET`: Archive in this S3 bucket (credentials and region from the
//!   usual `AWS_*` variables, `S3_ENDPOINT` for S3-compatible stores)
//! - `STRATA_LOCAL_STORAGE_PATH`: Archive on the local filesystem instead
//!
//! ## Example
//!
//! ```toml
//! bind_addr = "0.0.0.0:9201"
//!
//! [store]
//! data_dir = "/var/lib/strata"
//! seal_interval = "2h"
//! max_future_skew = "10m"
//!
//! [store.wal]
//! sync_policy = { type = "interval", interval = "100ms" }
//!
//! [object_store]
//! backend = "s3"
//! bucket = "metrics-archive"
//!
//! [compactor.retention]
//! raw = "30d"
//! 5m = "90d"
//! 1h = "365d"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use object_store::aws::{AmazonS3Builder, S3ConditionalPut};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use strata_compactor::CompactorConfig;
use strata_query::QueryConfig;
use strata_storage::{ArchiveConfig, ReaderConfig, ShipperConfig, StoreConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub shipper: ShipperConfig,

    #[serde(default)]
    pub archive: ArchiveConfig,

    #[serde(default)]
    pub object_store: ObjectStoreConfig,

    #[serde(default)]
    pub reader: ReaderConfig,

    #[serde(default)]
    pub compactor: CompactorConfig,

    #[serde(default)]
    pub query: QueryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            store: StoreConfig::default(),
            shipper: ShipperConfig::default(),
            archive: ArchiveConfig::default(),
            object_store: ObjectStoreConfig::default(),
            reader: ReaderConfig::default(),
            compactor: CompactorConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:9201".to_string()
}

/// Backend holding the archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ObjectStoreConfig {
    Local {
        path: PathBuf,
    },
    S3 {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
    /// Process-local archive, lost on exit
    Memory,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        ObjectStoreConfig::Local {
            path: PathBuf::from("./data/archive"),
        }
    }
}

impl ObjectStoreConfig {
    pub fn build(&self) -> anyhow::Result<Arc<dyn ObjectStore>> {
        match self {
            ObjectStoreConfig::Local { path } => {
                std::fs::create_dir_all(path).with_context(|| {
                    format!("failed to create archive directory {}", path.display())
                })?;
                Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
            }
            ObjectStoreConfig::S3 {
                bucket,
                region,
                endpoint,
            } => {
                // Conditional puts back the compactor lease
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_conditional_put(S3ConditionalPut::ETagMatch);
                if let Some(region) = region {
                    builder = builder.with_region(region);
                }
                if let Some(endpoint) = endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_allow_http(endpoint.starts_with("http://"));
                }
                Ok(Arc::new(builder.build()?))
            }
            ObjectStoreConfig::Memory => Ok(Arc::new(InMemory::new())),
        }
    }

    /// Whether other processes can share this archive
    pub fn is_shared(&self) -> bool {
        matches!(self, ObjectStoreConfig::S3 { .. })
    }
}

impl ServerConfig {
    /// Read `path` if given, then apply environment overrides
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `STRATA_*` overrides looked up through `var`
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = var("STRATA_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(dir) = var("STRATA_DATA_DIR") {
            self.store.data_dir = PathBuf::from(dir);
        }
        if let Some(bucket) = var("STRATA_BUCKET") {
            self.object_store = ObjectStoreConfig::S3 {
                bucket,
                region: var("AWS_REGION"),
                endpoint: var("S3_ENDPOINT"),
            };
        }
        if let Some(path) = var("STRATA_LOCAL_STORAGE_PATH") {
            self.object_store = ObjectStoreConfig::Local {
                path: PathBuf::from(path),
            };
        }
    }
}

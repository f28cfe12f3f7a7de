use async_trait::async_trait;
use std::path::PathBuf;

/// Everything needed to open one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDescriptor {
    /// Routing key; unique across the fleet.
    pub key: String,
    /// Database location.
    pub path: PathBuf,
    /// Table namespace inside the store.
    pub table_prefix: String,
}

impl StoreDescriptor {
    pub fn new(key: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            key: key.into(),
            path: path.into(),
            table_prefix: "infra".to_string(),
        }
    }

    pub fn with_table_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.table_prefix = prefix.into();
        self
    }
}

/// Source of the store fleet: consulted at startup, on the periodic
/// refresh, and on demand. Membership may change between calls.
#[async_trait]
pub trait StoreDiscovery: Send + Sync {
    async fn discover(&self) -> anyhow::Result<Vec<StoreDescriptor>>;
}

/// Fixed fleet from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    stores: Vec<StoreDescriptor>,
}

impl StaticDiscovery {
    pub fn new(stores: Vec<StoreDescriptor>) -> Self {
        Self { stores }
    }
}

#[async_trait]
impl StoreDiscovery for StaticDiscovery {
    async fn discover(&self) -> anyhow::Result<Vec<StoreDescriptor>> {
        Ok(self.stores.clone())
    }
}

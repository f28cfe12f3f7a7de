use crate::discovery::StoreDescriptor;
use crate::discovery::StoreDiscovery;
use anyhow::bail;
use conveyor_otel::MetricsClient;
use conveyor_protocol::CONTROL_PLANE_STORE_KEY;
use conveyor_state::StoreRuntime;
use conveyor_state::TableNames;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use tracing::info;

/// One opened store with its routing key.
#[derive(Clone)]
pub struct StoreEntry {
    pub key: String,
    pub runtime: StoreRuntime,
}

/// Multiplexes the fleet: lazily opened store runtimes behind a
/// copy-on-write snapshot, with a round-robin offset so poll ticks start
/// at a different store each time and none is starved.
pub struct Router {
    discovery: Arc<dyn StoreDiscovery>,
    control_plane: Option<StoreDescriptor>,
    enable_schema_deployment: bool,
    metrics: Option<MetricsClient>,
    snapshot: Mutex<Arc<Vec<StoreEntry>>>,
    counter: AtomicU64,
}

impl Router {
    /// Discover and open the initial fleet.
    pub async fn connect(
        discovery: Arc<dyn StoreDiscovery>,
        control_plane: Option<StoreDescriptor>,
        enable_schema_deployment: bool,
        metrics: Option<MetricsClient>,
    ) -> anyhow::Result<Arc<Self>> {
        let router = Arc::new(Self {
            discovery,
            control_plane,
            enable_schema_deployment,
            metrics,
            snapshot: Mutex::new(Arc::new(Vec::new())),
            counter: AtomicU64::new(0),
        });
        router.refresh().await?;
        Ok(router)
    }

    /// Re-run discovery and swap in a new snapshot. Stores already open are
    /// reused by key; new ones are opened; departed ones drop with the old
    /// snapshot once its readers finish.
    pub async fn refresh(&self) -> anyhow::Result<()> {
        let mut descriptors = self.discovery.discover().await?;
        if let Some(control_plane) = &self.control_plane {
            let mut entry = control_plane.clone();
            entry.key = CONTROL_PLANE_STORE_KEY.to_string();
            descriptors.push(entry);
        }

        let current = self.snapshot();
        let mut entries: Vec<StoreEntry> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if entries.iter().any(|e| e.key == descriptor.key) {
                bail!("duplicate store key in discovery result: {}", descriptor.key);
            }
            if let Some(existing) = current.iter().find(|e| e.key == descriptor.key) {
                entries.push(existing.clone());
                continue;
            }
            let runtime = StoreRuntime::open(
                &descriptor.path,
                TableNames::new(&descriptor.table_prefix)?,
                self.enable_schema_deployment,
                self.metrics.clone(),
            )
            .await?;
            info!(key = %descriptor.key, "store joined the routing snapshot");
            entries.push(StoreEntry {
                key: descriptor.key,
                runtime,
            });
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let mut snapshot = self
            .snapshot
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *snapshot = Arc::new(entries);
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<Vec<StoreEntry>> {
        Arc::clone(
            &self
                .snapshot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    /// The full snapshot, rotated by a monotonic counter: every tick walks
    /// all stores but starts one further along.
    pub fn rotation(&self) -> Vec<StoreEntry> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return Vec::new();
        }
        let offset = self.counter.fetch_add(1, Ordering::Relaxed) as usize % snapshot.len();
        let mut rotated = Vec::with_capacity(snapshot.len());
        rotated.extend_from_slice(&snapshot[offset..]);
        rotated.extend_from_slice(&snapshot[..offset]);
        rotated
    }

    pub fn store(&self, key: &str) -> Option<StoreRuntime> {
        self.snapshot()
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.runtime.clone())
    }

    /// Convenience for single-store deployments; refuses when the choice
    /// would be ambiguous.
    pub fn single_store(&self) -> anyhow::Result<StoreRuntime> {
        let snapshot = self.snapshot();
        match snapshot.as_slice() {
            [] => bail!("no stores discovered"),
            [only] => Ok(only.runtime.clone()),
            many => bail!(
                "single_store is ambiguous: {} stores are configured",
                many.len()
            ),
        }
    }
}

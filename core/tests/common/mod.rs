use conveyor_core::DispatchConfig;
use conveyor_core::Router;
use conveyor_core::StaticDiscovery;
use conveyor_core::StoreDescriptor;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

pub async fn single_store_router(dir: &Path) -> Arc<Router> {
    Router::connect(
        Arc::new(StaticDiscovery::new(vec![StoreDescriptor::new(
            "store-a",
            dir.join("store-a.sqlite"),
        )])),
        None,
        true,
        None,
    )
    .await
    .expect("connect router")
}

/// Test-speed tuning: small batches, short leases, fast polls and tiny
/// backoff so retry scenarios settle in well under a second per attempt.
pub fn fast_config() -> DispatchConfig {
    DispatchConfig {
        batch_size: 20,
        lease_seconds: 5,
        poll_interval: Duration::from_millis(50),
        max_polling_interval: Duration::from_millis(200),
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(50),
        ..DispatchConfig::default()
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

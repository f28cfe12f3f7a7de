use crate::runtime::StoreRuntime;
use crate::tables::TableNames;
use std::path::PathBuf;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;
use uuid::Uuid;

pub(super) fn unique_temp_dir() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    std::env::temp_dir().join(format!("conveyor-state-test-{nanos}-{}", Uuid::new_v4()))
}

pub(super) async fn open_test_store() -> (StoreRuntime, PathBuf) {
    let dir = unique_temp_dir();
    tokio::fs::create_dir_all(&dir)
        .await
        .expect("create test dir");
    let store = StoreRuntime::open(&dir.join("store.sqlite"), TableNames::default(), true, None)
        .await
        .expect("open test store");
    (store, dir)
}

// Host-global locks
//
// The enforcement mode is one value per host, so a whole run holds the
// host-mode lock. Resource labels are locked per path: writes to distinct
// paths proceed concurrently, writes to the same path are serialized.

use futures::future::join_all;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, MutexGuard};

use crate::adapters::{AdapterResult, LabelStore};

lazy_static! {
    static ref HOST_MODE_LOCK: Mutex<()> = Mutex::new(());
    static ref PATH_LOCKS: StdMutex<HashMap<PathBuf, Arc<Mutex<()>>>> =
        StdMutex::new(HashMap::new());
}

/// Exclusive access to the host enforcement mode, released on drop
#[derive(Debug)]
pub struct HostLease {
    _guard: MutexGuard<'static, ()>,
}

/// Wait until no other run holds the host
pub async fn acquire_host() -> HostLease {
    HostLease {
        _guard: HOST_MODE_LOCK.lock().await,
    }
}

/// Handle on a path's lock; the registry entry goes away with the last handle
struct PathLock {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl PathLock {
    fn acquire(path: &Path) -> Self {
        let mut locks = PATH_LOCKS.lock().unwrap_or_else(|e| e.into_inner());
        let lock = locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Self {
            path: path.to_path_buf(),
            lock,
        }
    }
}

impl Drop for PathLock {
    fn drop(&mut self) {
        let mut locks = PATH_LOCKS.lock().unwrap_or_else(|e| e.into_inner());
        // Held only by the registry and this handle
        if Arc::strong_count(&self.lock) == 2 {
            locks.remove(&self.path);
        }
    }
}

/// Write one label while holding the path's lock
pub async fn write_label(store: &dyn LabelStore, path: &Path, label: &str) -> AdapterResult<()> {
    let entry = PathLock::acquire(path);
    let _held = entry.lock.lock().await;
    store.set_label(path, label).await
}

/// Write many labels, concurrently across paths; results keep input order
pub async fn write_labels(
    store: &dyn LabelStore,
    labels: &[(PathBuf, String)],
) -> Vec<(PathBuf, AdapterResult<()>)> {
    join_all(labels.iter().map(|(path, label)| async move {
        (path.clone(), write_label(store, path, label).await)
    }))
    .await
}

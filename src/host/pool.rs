//! Reference-counted pool of plugin subprocesses.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use super::client::PluginClient;
use super::error::PluginResult;

/// Upper bound on the best-effort Close RPC issued when a connection leaves
/// the pool. This is the only timeout the framework imposes on a running
/// plugin: it bounds how long one slow plugin can delay host shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

struct PoolEntry {
    client: Arc<PluginClient>,
    connection_count: AtomicI32,
}

/// Multiplexes many logical connections onto few subprocesses.
///
/// The pool guarantees at most one live subprocess per distinct executable
/// path. [`ConnectionPool::new_client`] increments a per-entry reference
/// count, spawning and handshaking only on first use; concurrent first-use
/// calls are serialized by the creation lock. Each `new_client` must be
/// paired with a [`ConnectionPool::close_connection`], otherwise the
/// subprocess is never killed.
#[derive(Default)]
pub struct ConnectionPool {
    // The map lock is held for entry creation and eviction only; refcount
    // traffic on an existing entry is a single atomic operation.
    entries: Mutex<HashMap<PathBuf, Arc<PoolEntry>>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the shared client for an executable, spawning it on first use.
    pub async fn new_client(&self, executable: impl AsRef<Path>) -> PluginResult<Arc<PluginClient>> {
        let path = executable.as_ref().to_path_buf();

        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(&path) {
            entry.connection_count.fetch_add(1, Ordering::SeqCst);
            return Ok(entry.client.clone());
        }

        tracing::debug!(path = %path.display(), "spawning plugin process");
        let client = Arc::new(PluginClient::connect(&path).await?);
        entries.insert(
            path,
            Arc::new(PoolEntry {
                client: client.clone(),
                connection_count: AtomicI32::new(1),
            }),
        );
        Ok(client)
    }

    /// Release one logical connection on an executable.
    ///
    /// A best-effort Close RPC is issued for `connection_id`, bounded by a
    /// short timeout and ignored on failure. When the last reference is
    /// released, the subprocess is killed and evicted from the pool.
    pub async fn close_connection(&self, executable: impl AsRef<Path>, connection_id: i64) {
        let path = executable.as_ref().to_path_buf();

        let entry = { self.entries.lock().await.get(&path).cloned() };
        let Some(entry) = entry else {
            return;
        };

        entry.connection_count.fetch_sub(1, Ordering::SeqCst);

        // Warn the plugin, but never let a wedged connector hold up the
        // host: proceed regardless after the timeout.
        let close = entry.client.close(connection_id);
        if tokio::time::timeout(CLOSE_TIMEOUT, close).await.is_err() {
            tracing::warn!(
                path = %path.display(),
                connection_id,
                "close RPC timed out, proceeding"
            );
        }

        if entry.connection_count.load(Ordering::SeqCst) <= 0 {
            // Re-check under the creation lock: a concurrent new_client may
            // have revived the entry since the unlocked read above.
            let evicted = {
                let mut entries = self.entries.lock().await;
                match entries.get(&path) {
                    Some(current)
                        if Arc::ptr_eq(current, &entry)
                            && entry.connection_count.load(Ordering::SeqCst) <= 0 =>
                    {
                        entries.remove(&path);
                        true
                    }
                    _ => false,
                }
            };

            if evicted {
                tracing::debug!(path = %path.display(), "last connection closed, killing plugin");
                entry.client.kill().await;
            }
        }
    }

    /// Number of live subprocesses in the pool.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether the pool currently holds no subprocess.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

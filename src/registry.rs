use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Asynchronous teardown of a live resource.
#[async_trait]
pub trait Release: Send + Sync {
    async fn release(&self) -> anyhow::Result<()>;
}

/// Live per-session resources keyed by session id.
///
/// At most one instance lives under a key. Replacing or removing an entry
/// releases the old instance first.
pub struct ResourceRegistry<R: Release + ?Sized> {
    kind: &'static str,
    entries: RwLock<HashMap<String, Arc<R>>>,
    // one gate per key being lazily built
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<R: Release + ?Sized> ResourceRegistry<R> {
    pub fn new(kind: &'static str) -> Self {
        Self { kind, entries: RwLock::new(HashMap::new()), gates: Mutex::new(HashMap::new()) }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<R>> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn put(&self, key: &str, instance: Arc<R>) {
        let previous = self.entries.write().await.remove(key);
        if let Some(old) = previous {
            debug!(kind = self.kind, key, "releasing replaced instance");
            self.release_one(key, old).await;
        }
        // another request may have installed an instance while we released
        let raced = self.entries.write().await.insert(key.to_string(), instance);
        if let Some(old) = raced {
            self.release_one(key, old).await;
        }
    }

    /// Returns the instance under `key`, building it with `init` if there is none.
    ///
    /// Concurrent callers for the same key wait for a single `init`; other keys
    /// are not held up. A failed `init` leaves the key empty.
    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: &str, init: F) -> Result<Arc<R>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<R>, E>>,
    {
        if let Some(found) = self.get(key).await {
            return Ok(found);
        }
        let gate = self.gates.lock().await.entry(key.to_string()).or_default().clone();
        let result = {
            let _building = gate.lock().await;
            match self.get(key).await {
                Some(found) => Ok(found),
                None => match init().await {
                    Ok(instance) => {
                        let raced = self.entries.write().await.insert(key.to_string(), instance.clone());
                        if let Some(old) = raced {
                            self.release_one(key, old).await;
                        }
                        debug!(kind = self.kind, key, "instance built on first use");
                        Ok(instance)
                    }
                    Err(e) => Err(e),
                },
            }
        };
        let mut gates = self.gates.lock().await;
        // the map and this call hold the only handles when nobody else is waiting
        if Arc::strong_count(&gate) == 2 {
            gates.remove(key);
        }
        result
    }

    /// Releases and drops the instance under `key`, if any.
    pub async fn remove(&self, key: &str) -> bool {
        let removed = self.entries.write().await.remove(key);
        match removed {
            Some(old) => {
                self.release_one(key, old).await;
                true
            }
            None => false,
        }
    }

    pub async fn release_all(&self) {
        let drained: Vec<(String, Arc<R>)> = self.entries.write().await.drain().collect();
        let count = drained.len();
        for (key, instance) in drained {
            self.release_one(&key, instance).await;
        }
        debug!(kind = self.kind, count, "released all instances");
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    async fn release_one(&self, key: &str, instance: Arc<R>) {
        if let Err(e) = instance.release().await {
            warn!(kind = self.kind, key, error = %e, "failed to release instance");
        }
    }
}

//! Short-lived cache for host round trips
//!
//! Host queries like `getVersion` or `getHostInfo` fan out to every open
//! admin page at once. Parameterless answers are kept for one TTL and the
//! sweep task stops by itself once the cache drains.

use crate::backend::BackendError;
use crate::config::CacheConfig;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

struct CacheEntry {
    stored_at: Instant,
    payload: String,
}

type Entries = Arc<Mutex<HashMap<(String, String), CacheEntry>>>;

pub struct ResultCache {
    config: CacheConfig,
    entries: Entries,
    gc: Mutex<Option<JoinHandle<()>>>,
}

fn is_empty_message(message: &Value) -> bool {
    match message {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

impl ResultCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            gc: Mutex::new(None),
        }
    }

    pub fn is_cacheable(&self, command: &str, message: &Value) -> bool {
        self.config.enabled && is_empty_message(message) && self.config.commands.iter().any(|c| c == command)
    }

    /// Answer from the cache or call `fetch` and remember its result
    pub async fn get<F, Fut>(&self, host: &str, command: &str, message: &Value, fetch: F) -> Result<Value, BackendError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, BackendError>>,
    {
        if !self.is_cacheable(command, message) {
            return fetch().await;
        }

        let key = (host.to_string(), command.to_string());
        if let Some(hit) = self.lookup(&key) {
            debug!(host = host, command = command, "Host cache hit");
            return Ok(hit);
        }

        let result = fetch().await?;
        match serde_json::to_string(&result) {
            Ok(payload) => {
                self.entries.lock().insert(
                    key,
                    CacheEntry {
                        stored_at: Instant::now(),
                        payload,
                    },
                );
                self.ensure_gc();
            }
            Err(e) => warn!(host = host, command = command, error = %e, "Host result not cacheable"),
        }
        Ok(result)
    }

    fn lookup(&self, key: &(String, String)) -> Option<Value> {
        let entries = self.entries.lock();
        let entry = entries.get(key)?;
        if entry.stored_at.elapsed() >= self.config.ttl() {
            return None;
        }
        serde_json::from_str(&entry.payload).ok()
    }

    fn ensure_gc(&self) {
        let mut gc = self.gc.lock();
        if gc.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let entries = self.entries.clone();
        let ttl = self.config.ttl();
        *gc = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(ttl).await;
                let mut entries = entries.lock();
                entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
                if entries.is_empty() {
                    debug!("Host cache drained, sweep stopped");
                    break;
                }
            }
        }));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gc_running(&self) -> bool {
        self.gc.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Drop all entries and stop the sweep
    pub fn shutdown(&self) {
        if let Some(handle) = self.gc.lock().take() {
            handle.abort();
        }
        self.entries.lock().clear();
    }
}

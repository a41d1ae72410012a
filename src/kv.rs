//! Key-value store seam.
//!
//! The external cluster client is a collaborator; the worker only depends
//! on [`Store`]. Every operation is synchronous and carries a fixed
//! timeout; retriable failures are retried by [`with_retries`] with a fixed
//! backoff. [`MemoryStore`] is the in-process backend used by tests and by
//! standalone runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

use crate::config::ServerSettings;

/// Per-operation timeout handed to the cluster client.
pub const OP_TIMEOUT: Duration = Duration::from_millis(2500);
/// Attempts for a retriable failure, including the first.
pub const RETRY_ATTEMPTS: u32 = 5;
/// Fixed pause between retries.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(200);

#[derive(Debug, Error, Clone)]
pub enum KvError {
    #[error("document not found")]
    NotFound,
    #[error("document already exists")]
    AlreadyExists,
    #[error("cas mismatch")]
    CasMismatch,
    #[error("operation timed out")]
    Timeout,
    #[error("transient failure: {reason}")]
    Transient { reason: String },
    #[error("failure: {reason}")]
    Fatal { reason: String },
}

impl KvError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, KvError::Timeout | KvError::Transient { .. })
    }
}

/// A fetched document and its CAS tag.
#[derive(Debug, Clone)]
pub struct Found {
    pub value: Value,
    pub cas: u64,
}

/// Synchronous document operations. One handle per worker thread.
pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Found, KvError>;
    /// Create; fails with `AlreadyExists` when present.
    fn insert(&self, key: &str, value: &Value) -> Result<u64, KvError>;
    fn upsert(&self, key: &str, value: &Value) -> Result<u64, KvError>;
    /// Replace iff the CAS tag still matches.
    fn replace(&self, key: &str, value: &Value, cas: u64) -> Result<u64, KvError>;
    /// Remove; `cas == 0` removes unconditionally.
    fn remove(&self, key: &str, cas: u64) -> Result<(), KvError>;
    /// Atomic counter; creates with `initial` when absent, else adds `delta`.
    fn counter(&self, key: &str, delta: i64, initial: i64) -> Result<i64, KvError>;
}

/// Opens one [`Store`] handle per worker.
pub trait StoreFactory: Send + Sync {
    fn open(&self, settings: &ServerSettings) -> Result<Arc<dyn Store>, KvError>;
}

/// Run `op`, retrying retriable failures with fixed backoff. The final
/// error is returned as-is; a retriable error after the last attempt means
/// the retry budget is exhausted.
pub fn with_retries<T>(mut op: impl FnMut() -> Result<T, KvError>) -> Result<T, KvError> {
    let mut last = None;
    for attempt in 0..RETRY_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() => {
                if attempt + 1 < RETRY_ATTEMPTS {
                    std::thread::sleep(RETRY_BACKOFF);
                }
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or(KvError::Timeout))
}

/// Stand-in handle used when opening the real store failed at `Init`;
/// every operation reports the outage so callers surface it through their
/// own counters.
pub struct UnavailableStore;

impl Store for UnavailableStore {
    fn get(&self, _key: &str) -> Result<Found, KvError> {
        Err(unavailable())
    }

    fn insert(&self, _key: &str, _value: &Value) -> Result<u64, KvError> {
        Err(unavailable())
    }

    fn upsert(&self, _key: &str, _value: &Value) -> Result<u64, KvError> {
        Err(unavailable())
    }

    fn replace(&self, _key: &str, _value: &Value, _cas: u64) -> Result<u64, KvError> {
        Err(unavailable())
    }

    fn remove(&self, _key: &str, _cas: u64) -> Result<(), KvError> {
        Err(unavailable())
    }

    fn counter(&self, _key: &str, _delta: i64, _initial: i64) -> Result<i64, KvError> {
        Err(unavailable())
    }
}

fn unavailable() -> KvError {
    KvError::Fatal {
        reason: "kv store handle was never opened".into(),
    }
}

/// In-process store. CAS tags come from a process-wide counter so a
/// replaced document never reuses its previous tag.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    docs: Mutex<HashMap<String, (Value, u64)>>,
    next_cas: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_cas(&self) -> u64 {
        self.inner.next_cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn len(&self) -> usize {
        self.inner.docs.lock().expect("kv lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner
            .docs
            .lock()
            .expect("kv lock poisoned")
            .contains_key(key)
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Found, KvError> {
        let docs = self.inner.docs.lock().expect("kv lock poisoned");
        match docs.get(key) {
            Some((value, cas)) => Ok(Found {
                value: value.clone(),
                cas: *cas,
            }),
            None => Err(KvError::NotFound),
        }
    }

    fn insert(&self, key: &str, value: &Value) -> Result<u64, KvError> {
        let cas = self.next_cas();
        let mut docs = self.inner.docs.lock().expect("kv lock poisoned");
        if docs.contains_key(key) {
            return Err(KvError::AlreadyExists);
        }
        docs.insert(key.to_string(), (value.clone(), cas));
        Ok(cas)
    }

    fn upsert(&self, key: &str, value: &Value) -> Result<u64, KvError> {
        let cas = self.next_cas();
        let mut docs = self.inner.docs.lock().expect("kv lock poisoned");
        docs.insert(key.to_string(), (value.clone(), cas));
        Ok(cas)
    }

    fn replace(&self, key: &str, value: &Value, cas: u64) -> Result<u64, KvError> {
        let next = self.next_cas();
        let mut docs = self.inner.docs.lock().expect("kv lock poisoned");
        match docs.get_mut(key) {
            Some((stored, stored_cas)) => {
                if *stored_cas != cas {
                    return Err(KvError::CasMismatch);
                }
                *stored = value.clone();
                *stored_cas = next;
                Ok(next)
            }
            None => Err(KvError::NotFound),
        }
    }

    fn remove(&self, key: &str, cas: u64) -> Result<(), KvError> {
        let mut docs = self.inner.docs.lock().expect("kv lock poisoned");
        match docs.get(key) {
            Some((_, stored_cas)) => {
                if cas != 0 && *stored_cas != cas {
                    return Err(KvError::CasMismatch);
                }
                docs.remove(key);
                Ok(())
            }
            None => Err(KvError::NotFound),
        }
    }

    fn counter(&self, key: &str, delta: i64, initial: i64) -> Result<i64, KvError> {
        let cas = self.next_cas();
        let mut docs = self.inner.docs.lock().expect("kv lock poisoned");
        match docs.get_mut(key) {
            Some((value, stored_cas)) => {
                let current = value.as_i64().ok_or_else(|| KvError::Fatal {
                    reason: format!("counter document {key} is not an integer"),
                })?;
                let next = current + delta;
                *value = Value::from(next);
                *stored_cas = cas;
                Ok(next)
            }
            None => {
                docs.insert(key.to_string(), (Value::from(initial), cas));
                Ok(initial)
            }
        }
    }
}

impl StoreFactory for MemoryStore {
    fn open(&self, _settings: &ServerSettings) -> Result<Arc<dyn Store>, KvError> {
        Ok(Arc::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn insert_get_remove() {
        let store = MemoryStore::new();
        let cas = store.insert("k", &json!({"a": 1})).unwrap();
        assert!(cas > 0);
        assert!(matches!(
            store.insert("k", &json!(2)),
            Err(KvError::AlreadyExists)
        ));

        let found = store.get("k").unwrap();
        assert_eq!(found.value, json!({"a": 1}));
        assert_eq!(found.cas, cas);

        store.remove("k", 0).unwrap();
        assert!(matches!(store.get("k"), Err(KvError::NotFound)));
    }

    #[test]
    fn replace_requires_matching_cas() {
        let store = MemoryStore::new();
        let cas = store.insert("k", &json!(1)).unwrap();
        assert!(matches!(
            store.replace("k", &json!(2), cas + 99),
            Err(KvError::CasMismatch)
        ));
        let new_cas = store.replace("k", &json!(2), cas).unwrap();
        assert_ne!(new_cas, cas);
        assert_eq!(store.get("k").unwrap().value, json!(2));
    }

    #[test]
    fn counter_initialises_then_adds() {
        let store = MemoryStore::new();
        assert_eq!(store.counter("c", 1, 7).unwrap(), 7);
        assert_eq!(store.counter("c", 1, 7).unwrap(), 8);
        assert_eq!(store.counter("c", -3, 7).unwrap(), 5);
    }

    #[test]
    fn retries_stop_on_permanent_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(|| {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(KvError::NotFound)
        });
        assert!(matches!(result, Err(KvError::NotFound)));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn retries_exhaust_on_transient_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retries(|| {
            calls.fetch_add(1, Ordering::Relaxed);
            Err(KvError::Transient {
                reason: "tmpfail".into(),
            })
        });
        assert!(matches!(result, Err(KvError::Transient { .. })));
        assert_eq!(calls.load(Ordering::Relaxed), RETRY_ATTEMPTS);
    }

    #[test]
    fn retries_recover_mid_way() {
        let calls = AtomicU32::new(0);
        let result = with_retries(|| {
            let n = calls.fetch_add(1, Ordering::Relaxed);
            if n < 2 {
                Err(KvError::Timeout)
            } else {
                Ok(n)
            }
        });
        assert_eq!(result.unwrap(), 2);
    }
}

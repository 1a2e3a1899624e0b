use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ObjectMeta, ObjectStore, StoreError, StoreErrorCode, validate_key};

#[derive(Default)]
struct MemoryState {
    objects: HashMap<String, Vec<u8>>,
    failing_gets: usize,
    get_calls: usize,
}

/// In-process bucket with failure injection, for tests and local rendering
#[derive(Clone)]
pub struct MemoryObjectStore {
    bucket: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    pub fn put(&self, key: &str, bytes: impl Into<Vec<u8>>) {
        if let Ok(mut state) = self.state.lock() {
            state.objects.insert(key.to_string(), bytes.into());
        }
    }

    pub fn remove(&self, key: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.objects.remove(key);
        }
    }

    /// The next `count` downloads fail with a network error
    pub fn fail_next_gets(&self, count: usize) {
        if let Ok(mut state) = self.state.lock() {
            state.failing_gets = count;
        }
    }

    pub fn get_calls(&self) -> usize {
        self.state.lock().map(|s| s.get_calls).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::new(StoreErrorCode::Io, "memory store poisoned"))
    }
}

impl ObjectStore for MemoryObjectStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn bucket(&self) -> String {
        self.bucket.clone()
    }

    fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        validate_key(key)?;
        let state = self.lock()?;
        Ok(state.objects.get(key).map(|bytes| ObjectMeta {
            key: key.to_string(),
            size: Some(bytes.len() as u64),
        }))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        let mut state = self.lock()?;
        state.get_calls += 1;
        if state.failing_gets > 0 {
            state.failing_gets -= 1;
            return Err(StoreError::new(
                StoreErrorCode::Network,
                format!("injected transfer failure for {}", key),
            ));
        }
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::new(StoreErrorCode::NotFound, format!("{} not found", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_injection() {
        let store = MemoryObjectStore::new("reports");
        store.put("r1/main.js", "x");
        store.fail_next_gets(1);

        assert_eq!(
            store.get("r1/main.js").unwrap_err().code,
            StoreErrorCode::Network
        );
        assert_eq!(store.get("r1/main.js").unwrap(), b"x");
        assert_eq!(store.get_calls(), 2);
    }

    #[test]
    fn test_head_reports_size() {
        let store = MemoryObjectStore::new("reports");
        store.put("r1/data.csv", "a,b\n1,2\n");
        let meta = store.head("r1/data.csv").unwrap().unwrap();
        assert_eq!(meta.size, Some(8));
        store.remove("r1/data.csv");
        assert!(store.head("r1/data.csv").unwrap().is_none());
    }
}

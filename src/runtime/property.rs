//! Per-connection property bag.
//!
//! Values are stored type-erased; callers pick the concrete type when they
//! read a key back and are responsible for keeping it consistent per key.

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// A type-erased property value.
pub type Property = Arc<dyn Any + Send + Sync>;

/// String-keyed store guarded by a reader/writer lock.
///
/// The lock is held for a single map operation only.
#[derive(Default)]
pub struct PropertyStore {
    values: RwLock<HashMap<String, Property>>,
}

impl PropertyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value stored under `key`.
    pub fn set<T>(&self, key: impl Into<String>, value: T)
    where
        T: Any + Send + Sync,
    {
        let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
        values.insert(key.into(), Arc::new(value));
    }

    /// Fetch the raw value stored under `key`.
    pub fn get(&self, key: &str) -> Result<Property> {
        let values = self.values.read().unwrap_or_else(|p| p.into_inner());
        values
            .get(key)
            .cloned()
            .ok_or_else(|| Error::PropertyNotFound(key.to_string()))
    }

    /// Fetch the value under `key` as a `T`.
    pub fn get_as<T>(&self, key: &str) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.get(key)?
            .downcast::<T>()
            .map_err(|_| Error::PropertyType(key.to_string()))
    }

    /// Remove `key`; removing a missing key is a no-op.
    pub fn remove(&self, key: &str) {
        let mut values = self.values.write().unwrap_or_else(|p| p.into_inner());
        values.remove(key);
    }

    pub fn len(&self) -> usize {
        self.values.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values = self.values.read().unwrap_or_else(|p| p.into_inner());
        f.debug_struct("PropertyStore")
            .field("keys", &values.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_set_get_del() {
        let store = PropertyStore::new();
        store.set("k", "v");

        let value = store.get_as::<&str>("k").unwrap();
        assert_eq!(*value, "v");

        store.remove("k");
        assert!(matches!(store.get("k"), Err(Error::PropertyNotFound(ref k)) if k == "k"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_overwrite_changes_type() {
        let store = PropertyStore::new();
        store.set("counter", 1u64);
        assert_eq!(*store.get_as::<u64>("counter").unwrap(), 1);

        store.set("counter", String::from("one"));
        assert!(matches!(
            store.get_as::<u64>("counter"),
            Err(Error::PropertyType(_))
        ));
        assert_eq!(store.get_as::<String>("counter").unwrap().as_str(), "one");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let store = PropertyStore::new();
        store.remove("absent");
        assert!(store.is_empty());
    }

    #[test]
    fn test_concurrent_access() {
        let store = Arc::new(PropertyStore::new());
        let mut handles = Vec::new();

        for i in 0..8u32 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for j in 0..100u32 {
                    let key = format!("key-{i}-{j}");
                    store.set(key.clone(), i * j);
                    assert_eq!(*store.get_as::<u32>(&key).unwrap(), i * j);
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len(), 800);
    }
}

//! Decrypted-model cache (§3 Ownership, §5 Shared-resource policy): weak
//! references keyed by UUID, so that at most one decrypted view of a given
//! record exists at a time.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use uuid::Uuid;

use crate::error::StoreError;

pub struct DecryptedCache<T> {
    entries: Mutex<HashMap<Uuid, Weak<T>>>,
}

impl<T> DecryptedCache<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached decrypted view for `id` if still alive, otherwise
    /// produce one with `decrypt` and cache a weak reference to it.
    pub fn get_or_insert_with<F>(&self, id: Uuid, decrypt: F) -> Result<Arc<T>, StoreError>
    where
        F: FnOnce() -> Result<T, StoreError>,
    {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(&id).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let value = Arc::new(decrypt()?);
        entries.insert(id, Arc::downgrade(&value));
        Ok(value)
    }

    /// Drop the cached entry for `id`, e.g. after the record is rewritten.
    pub fn invalidate(&self, id: Uuid) {
        self.entries.lock().remove(&id);
    }
}

impl<T> Default for DecryptedCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_the_same_instance_while_alive() {
        let cache: DecryptedCache<String> = DecryptedCache::new();
        let id = Uuid::new_v4();
        let mut calls = 0;
        let first = cache
            .get_or_insert_with(id, || {
                calls += 1;
                Ok("hello".to_string())
            })
            .unwrap();
        let second = cache.get_or_insert_with(id, || unreachable!("cache hit should not decrypt again")).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls, 1);
    }

    #[test]
    fn produces_a_fresh_instance_once_dropped() {
        let cache: DecryptedCache<String> = DecryptedCache::new();
        let id = Uuid::new_v4();
        {
            let _first = cache.get_or_insert_with(id, || Ok("one".to_string())).unwrap();
        }
        let second = cache.get_or_insert_with(id, || Ok("two".to_string())).unwrap();
        assert_eq!(*second, "two");
    }
}

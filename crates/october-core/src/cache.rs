//! # Cache Service
//!
//! Everything the engine remembers across requests goes through one
//! `CmsCache` passed around explicitly: route tables, URL resolutions,
//! parsed object snapshots and component property maps.
//!
//! The cache is best-effort. Backend failures are logged and treated as
//! misses; they never fail a request. Keys are namespaced by a hash of the
//! theme path so themes never collide. There is no stampede protection:
//! concurrent requests may recompute the same entry.

use crate::CmsError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// =============================================================================
// CACHE STORE TRAIT
// =============================================================================

/// An external key/value cache with per-entry time-to-live.
pub trait CacheStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CmsError>;

    fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CmsError>;

    fn forget(&self, key: &str) -> Result<(), CmsError>;

    /// Drop every entry.
    fn flush(&self) -> Result<(), CmsError>;
}

/// In-process store; entries expire lazily on read.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (Vec<u8>, Instant)>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .values()
            .filter(|(_, expires)| *expires > now)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, (Vec<u8>, Instant)>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CmsError> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some((value, expires)) if *expires > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), CmsError> {
        let expires = Instant::now()
            .checked_add(ttl)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400 * 365));
        self.lock().insert(key.to_string(), (value.to_vec(), expires));
        Ok(())
    }

    fn forget(&self, key: &str) -> Result<(), CmsError> {
        self.lock().remove(key);
        Ok(())
    }

    fn flush(&self) -> Result<(), CmsError> {
        self.lock().clear();
        Ok(())
    }
}

// =============================================================================
// CMS CACHE SERVICE
// =============================================================================

/// object code → component name → properties
type ObjectPropertyMap = HashMap<String, HashMap<String, Map<String, Value>>>;

/// Shared cache service.
pub struct CmsCache {
    store: Arc<dyn CacheStore>,
    /// Request-independent, in-process layer of the component property map.
    properties: Mutex<HashMap<String, ObjectPropertyMap>>,
    property_ttl: Duration,
}

impl fmt::Debug for CmsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CmsCache")
            .field("store", &self.store)
            .field("property_ttl", &self.property_ttl)
            .finish_non_exhaustive()
    }
}

impl CmsCache {
    #[must_use]
    pub fn new(store: Arc<dyn CacheStore>, property_ttl: Duration) -> Self {
        Self {
            store,
            properties: Mutex::new(HashMap::new()),
            property_ttl,
        }
    }

    /// A cache backed by a fresh `MemoryStore`.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()), Duration::from_secs(600))
    }

    #[must_use]
    pub fn store(&self) -> &dyn CacheStore {
        self.store.as_ref()
    }

    /// Namespace for everything cached about the theme at `path`.
    #[must_use]
    pub fn theme_key(path: &Path) -> String {
        let hash = blake3::hash(path.to_string_lossy().as_bytes());
        hash.to_hex()[..16].to_string()
    }

    // -------------------------------------------------------------------------
    // Typed access
    // -------------------------------------------------------------------------

    /// Read a postcard-encoded entry.
    pub fn get_postcard<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.read(key)?;
        match postcard::from_bytes(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding undecodable cache entry");
                self.forget(key);
                None
            }
        }
    }

    pub fn put_postcard<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match postcard::to_allocvec(value) {
            Ok(bytes) => self.write(key, &bytes, ttl),
            Err(e) => tracing::warn!(key, error = %e, "cannot encode cache entry"),
        }
    }

    /// Read a JSON-encoded entry.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.read(key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "discarding undecodable cache entry");
                self.forget(key);
                None
            }
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.write(key, &bytes, ttl),
            Err(e) => tracing::warn!(key, error = %e, "cannot encode cache entry"),
        }
    }

    pub fn forget(&self, key: &str) {
        if let Err(e) = self.store.forget(key) {
            tracing::warn!(key, error = %e, "cache forget failed");
        }
    }

    fn read(&self, key: &str) -> Option<Vec<u8>> {
        match self.store.get(key) {
            Ok(hit) => hit,
            Err(e) => {
                tracing::warn!(key, error = %e, "cache read failed");
                None
            }
        }
    }

    fn write(&self, key: &str, bytes: &[u8], ttl: Duration) {
        if let Err(e) = self.store.put(key, bytes, ttl) {
            tracing::warn!(key, error = %e, "cache write failed");
        }
    }

    // -------------------------------------------------------------------------
    // Component property map
    // -------------------------------------------------------------------------

    fn property_key(theme_key: &str) -> String {
        format!("{}component-properties", theme_key)
    }

    fn lock_properties(&self) -> std::sync::MutexGuard<'_, HashMap<String, ObjectPropertyMap>> {
        self.properties.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached properties of one component usage on one object.
    ///
    /// Consults the in-process map first, then the external store.
    pub fn component_properties(
        &self,
        theme_key: &str,
        object_code: &str,
        component: &str,
    ) -> Option<Map<String, Value>> {
        let mut properties = self.lock_properties();
        if !properties.contains_key(theme_key) {
            let loaded: ObjectPropertyMap = self
                .get_json(&Self::property_key(theme_key))
                .unwrap_or_default();
            properties.insert(theme_key.to_string(), loaded);
        }
        properties
            .get(theme_key)
            .and_then(|objects| objects.get(object_code))
            .and_then(|components| components.get(component))
            .cloned()
    }

    pub fn store_component_properties(
        &self,
        theme_key: &str,
        object_code: &str,
        component: &str,
        props: &Map<String, Value>,
    ) {
        let mut properties = self.lock_properties();
        let objects = properties.entry(theme_key.to_string()).or_default();
        objects
            .entry(object_code.to_string())
            .or_default()
            .insert(component.to_string(), props.clone());
        let snapshot = objects.clone();
        drop(properties);
        self.put_json(&Self::property_key(theme_key), &snapshot, self.property_ttl);
    }

    /// Drop the component property map of a theme from both layers.
    pub fn clear_component_properties(&self, theme_key: &str) {
        self.lock_properties().remove(theme_key);
        self.forget(&Self::property_key(theme_key));
    }
}

// =============================================================================
// TESTS
// =============================================================================

//! Bounded, shared cache of decoded class handles.
//!
//! The cache is the only owner of class resources. Callers receive a
//! [`CachedHandle`] and reach the resource through [`CachedHandle::with`],
//! which holds the slot's read lock for the duration of the closure; a
//! release (eviction or [`UnitCache::clear`]) takes the slot's write lock, so
//! it waits for in-flight readers and every later `with` observes the
//! release and returns `None`.
//!
//! Recency is tracked with a logical clock stamped on each slot, which lets
//! lookups run under the map's read lock. Insertion, eviction and clearing
//! take the write lock.

use log::{debug, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::archive::{archive_contains_entry, read_first_entry};
use crate::classfile::ClassFile;
use crate::config::CacheConfig;
use crate::errors::{ReleaseError, panic_message};
use crate::scan::class_entry_candidates;

/// Called with the class name each time a resource is released.
pub type ReleaseListener = Arc<dyn Fn(&str) + Send + Sync>;

/// The live, decoded form of one class.
#[derive(Debug)]
pub struct ClassResource {
    class: ClassFile,
    origin: PathBuf,
}

impl ClassResource {
    pub fn class_file(&self) -> &ClassFile {
        &self.class
    }

    /// Search path the class was resolved from.
    pub fn origin(&self) -> &Path {
        &self.origin
    }
}

#[derive(Debug)]
struct Slot {
    name: String,
    resource: RwLock<Option<ClassResource>>,
    last_used: AtomicU64,
}

impl Slot {
    fn touch(&self, tick: u64) {
        self.last_used.store(tick, Ordering::Relaxed);
    }

    fn release(&self, listener: Option<&ReleaseListener>) -> Result<(), ReleaseError> {
        let taken = self
            .resource
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if taken.is_none() {
            return Err(ReleaseError::AlreadyReleased(self.name.clone()));
        }
        drop(taken);

        if let Some(listener) = listener {
            catch_unwind(AssertUnwindSafe(|| listener(&self.name))).map_err(|payload| {
                ReleaseError::Listener {
                    name: self.name.clone(),
                    message: panic_message(payload.as_ref()),
                }
            })?;
        }
        Ok(())
    }
}

/// Borrowable reference to a cache-owned class resource.
#[derive(Debug, Clone)]
pub struct CachedHandle {
    slot: Arc<Slot>,
}

impl CachedHandle {
    pub fn name(&self) -> &str {
        &self.slot.name
    }

    pub fn is_released(&self) -> bool {
        self.slot
            .resource
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Runs `f` against the resource, or returns `None` once it has been
    /// released. `f` must not call back into the cache.
    pub fn with<R>(&self, f: impl FnOnce(&ClassResource) -> R) -> Option<R> {
        let guard = self
            .slot
            .resource
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        guard.as_ref().map(f)
    }
}

/// A location consulted when resolving a class name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchPath {
    Archive(PathBuf),
    Directory(PathBuf),
}

impl SearchPath {
    pub fn from_path(path: &Path) -> Self {
        if path.is_dir() {
            SearchPath::Directory(path.to_path_buf())
        } else {
            SearchPath::Archive(path.to_path_buf())
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            SearchPath::Archive(p) | SearchPath::Directory(p) => p,
        }
    }

    fn contains(&self, class_name: &str) -> bool {
        let candidates = class_entry_candidates(class_name);
        match self {
            SearchPath::Directory(dir) => candidates.iter().any(|c| dir.join(c).is_file()),
            SearchPath::Archive(jar) => candidates.iter().any(|c| {
                archive_contains_entry(jar, c).unwrap_or_else(|e| {
                    debug!("cache: {} unreadable: {e:#}", jar.display());
                    false
                })
            }),
        }
    }

    fn load(&self, class_name: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let candidates = class_entry_candidates(class_name);
        match self {
            SearchPath::Directory(dir) => {
                for c in &candidates {
                    let path = dir.join(c);
                    if path.is_file() {
                        return Ok(Some(std::fs::read(path)?));
                    }
                }
                Ok(None)
            }
            SearchPath::Archive(jar) => read_first_entry(jar, &candidates),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
    pub hit_rate: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClearSummary {
    pub released: usize,
    pub failed: usize,
}

pub struct UnitCache {
    capacity: usize,
    slots: RwLock<HashMap<String, Arc<Slot>>>,
    search_paths: RwLock<Vec<SearchPath>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    listener: Option<ReleaseListener>,
}

impl UnitCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.capacity)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            slots: RwLock::new(HashMap::new()),
            search_paths: RwLock::new(Vec::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            listener: None,
        }
    }

    pub fn with_release_listener(mut self, listener: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.listener = Some(Arc::new(listener));
        self
    }

    /// Returns `false` if the path was already registered.
    pub fn add_search_path(&self, path: impl AsRef<Path>) -> bool {
        let entry = SearchPath::from_path(path.as_ref());
        let mut paths = self
            .search_paths
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if paths.iter().any(|p| p.path() == entry.path()) {
            return false;
        }
        debug!("cache: search path added: {}", entry.path().display());
        paths.push(entry);
        true
    }

    pub fn search_paths(&self) -> Vec<SearchPath> {
        self.search_paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<CachedHandle> {
        if let Some(slot) = self.read_slots().get(name) {
            slot.touch(self.tick());
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(CachedHandle {
                slot: Arc::clone(slot),
            });
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let resource = self.materialize(name)?;

        let mut slots = self.write_slots();
        if let Some(slot) = slots.get(name) {
            // Another caller materialized it first; ours is dropped unused.
            slot.touch(self.tick());
            return Some(CachedHandle {
                slot: Arc::clone(slot),
            });
        }
        if slots.len() >= self.capacity {
            self.evict_lru(&mut slots);
        }

        let slot = Arc::new(Slot {
            name: name.to_string(),
            resource: RwLock::new(Some(resource)),
            last_used: AtomicU64::new(self.tick()),
        });
        slots.insert(name.to_string(), Arc::clone(&slot));
        Some(CachedHandle { slot })
    }

    /// Prefers residency; otherwise probes search paths without decoding.
    pub fn exists(&self, name: &str) -> bool {
        if self.read_slots().contains_key(name) {
            return true;
        }
        self.search_paths
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|p| p.contains(name))
    }

    /// Releases every resident handle once and resets the counters. A failed
    /// release is logged and does not stop the rest.
    pub fn clear(&self) -> ClearSummary {
        let drained: Vec<Arc<Slot>> = {
            let mut slots = self.write_slots();
            slots.drain().map(|(_, slot)| slot).collect()
        };

        let mut summary = ClearSummary::default();
        for slot in drained {
            match slot.release(self.listener.as_ref()) {
                Ok(()) => summary.released += 1,
                Err(e) => {
                    summary.failed += 1;
                    warn!("cache: release failed during clear: {e}");
                }
            }
        }

        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        if summary.released + summary.failed > 0 {
            debug!(
                "cache: cleared {} handles ({} failed)",
                summary.released + summary.failed,
                summary.failed
            );
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.read_slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            size: self.len(),
            capacity: self.capacity,
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    fn evict_lru(&self, slots: &mut HashMap<String, Arc<Slot>>) {
        let victim = slots
            .iter()
            .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
            .map(|(name, _)| name.clone());
        let Some(victim) = victim else {
            return;
        };
        if let Some(slot) = slots.remove(&victim) {
            debug!("cache: evicting {victim}");
            if let Err(e) = slot.release(self.listener.as_ref()) {
                warn!("cache: release failed during eviction: {e}");
            }
        }
    }

    fn materialize(&self, name: &str) -> Option<ClassResource> {
        let paths = self.search_paths();
        for path in &paths {
            let bytes = match path.load(name) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    debug!("cache: {} unreadable: {e:#}", path.path().display());
                    continue;
                }
            };
            match ClassFile::parse(&bytes) {
                Ok(class) => {
                    return Some(ClassResource {
                        class,
                        origin: path.path().to_path_buf(),
                    });
                }
                Err(e) => {
                    warn!("cache: {name} in {} failed to decode: {e}", path.path().display());
                    return None;
                }
            }
        }
        debug!("cache: {name} not found on {} search paths", paths.len());
        None
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Slot>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for UnitCache {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for UnitCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitCache")
            .field("capacity", &self.capacity)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

//! Cache hierarchy of the read path
//!
//! Every cache is best-effort: `set` may refuse an entry and `get` may miss
//! at any time. Values stored under a key are immutable, so concurrent
//! writers of the same key store identical data.

use std::collections::BTreeMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::changes::Change;
use crate::config::CacheConfig;
use crate::hash_dump::{DirEntry, DirectoryEntries, PropertyList};
use crate::ids::Revnum;
use crate::index::{L2pIndex, P2lIndex};
use crate::locator::FileKind;
use crate::noderev::NodeRevision;
use crate::window::CachedWindow;

/// Approximate heap footprint of a cached value
pub trait CacheWeight {
    fn weight(&self) -> usize;
}

impl<T: CacheWeight + ?Sized> CacheWeight for Arc<T> {
    fn weight(&self) -> usize {
        (**self).weight()
    }
}

impl CacheWeight for Bytes {
    fn weight(&self) -> usize {
        self.len() + 32
    }
}

impl CacheWeight for Vec<u64> {
    fn weight(&self) -> usize {
        self.len() * 8 + 24
    }
}

impl CacheWeight for NodeRevision {
    fn weight(&self) -> usize {
        let paths = self.created_path.as_ref().map_or(0, String::len)
            + self.copyfrom.as_ref().map_or(0, |(_, p)| p.len())
            + self.copyroot.as_ref().map_or(0, |(_, p)| p.len());
        std::mem::size_of::<NodeRevision>() + paths + 64
    }
}

impl CacheWeight for Vec<DirEntry> {
    fn weight(&self) -> usize {
        self.iter()
            .map(|e| std::mem::size_of::<DirEntry>() + e.name.len() + e.id.node_id.len() + e.id.copy_id.len())
            .sum::<usize>()
            + 24
    }
}

impl CacheWeight for PropertyList {
    fn weight(&self) -> usize {
        self.iter().map(|(k, v)| k.len() + v.len() + 48).sum::<usize>() + 24
    }
}

impl CacheWeight for Vec<Change> {
    fn weight(&self) -> usize {
        self.iter()
            .map(|c| std::mem::size_of::<Change>() + c.path.len() + c.copyfrom.as_ref().map_or(0, |(_, p)| p.len()))
            .sum::<usize>()
            + 24
    }
}

impl CacheWeight for L2pIndex {
    fn weight(&self) -> usize {
        L2pIndex::weight(self)
    }
}

impl CacheWeight for P2lIndex {
    fn weight(&self) -> usize {
        P2lIndex::weight(self)
    }
}

/// Counters of one cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub refusals: u64,
    pub entries: usize,
    pub bytes: usize,
}

/// A concurrent key/value cache
pub trait CacheProvider<K, V>: Send + Sync {
    fn get(&self, key: &K) -> Option<V>;

    /// Store `value`; returns false when the entry was refused.
    fn set(&self, key: K, value: V) -> bool;

    fn stats(&self) -> CacheStats;
}

pub type SharedCache<K, V> = Arc<dyn CacheProvider<K, V>>;

/// A cache that never stores anything
pub struct NullCache;

impl<K, V> CacheProvider<K, V> for NullCache {
    fn get(&self, _key: &K) -> Option<V> {
        None
    }

    fn set(&self, _key: K, _value: V) -> bool {
        false
    }

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

struct Lru<K: Hash + Eq, V> {
    entries: LruCache<K, (V, usize)>,
    bytes: usize,
}

/// Byte-budgeted LRU cache
pub struct MemoryCache<K: Hash + Eq, V> {
    name: &'static str,
    max_bytes: usize,
    max_entry: usize,
    inner: Mutex<Lru<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    refusals: AtomicU64,
}

impl<K: Hash + Eq, V: CacheWeight + Clone> MemoryCache<K, V> {
    /// `max_entry` caps a single value; larger values are refused.
    pub fn new(name: &'static str, max_bytes: usize, max_entry: usize) -> Self {
        Self {
            name,
            max_bytes,
            max_entry: max_entry.min(max_bytes),
            inner: Mutex::new(Lru {
                entries: LruCache::unbounded(),
                bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            refusals: AtomicU64::new(0),
        }
    }
}

impl<K, V> CacheProvider<K, V> for MemoryCache<K, V>
where
    K: Hash + Eq + Send,
    V: CacheWeight + Clone + Send,
{
    fn get(&self, key: &K) -> Option<V> {
        let value = self.inner.lock().entries.get(key).map(|(v, _)| v.clone());
        match value {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        value
    }

    fn set(&self, key: K, value: V) -> bool {
        let weight = value.weight();
        if weight > self.max_entry {
            self.refusals.fetch_add(1, Ordering::Relaxed);
            debug!("{} cache refused entry of {} bytes", self.name, weight);
            return false;
        }

        let mut inner = self.inner.lock();
        if let Some((_, (_, old))) = inner.entries.push(key, (value, weight)) {
            inner.bytes -= old;
        }
        inner.bytes += weight;
        while inner.bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, (_, evicted))) => inner.bytes -= evicted,
                None => break,
            }
        }
        drop(inner);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        true
    }

    fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            refusals: self.refusals.load(Ordering::Relaxed),
            entries: inner.entries.len(),
            bytes: inner.bytes,
        }
    }
}

/// Window cache key; only committed representations are cached
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub rev: Revnum,
    pub item: u64,
    pub chunk: u64,
}

/// A committed representation or node-revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RepKey {
    pub rev: Revnum,
    pub item: u64,
}

/// Key of directory and property caches. Transaction entries are keyed by
/// node id and the length of the node's file, which only grows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ItemKey {
    Rev { rev: Revnum, item: u64 },
    Txn { node: String, len: u64 },
}

/// All caches used by one or more open filesystems
pub struct CacheHierarchy {
    pub windows: SharedCache<WindowKey, Arc<CachedWindow>>,
    pub combined: SharedCache<RepKey, Bytes>,
    pub fulltexts: SharedCache<RepKey, Bytes>,
    pub nodes: SharedCache<RepKey, Arc<NodeRevision>>,
    pub dirs: SharedCache<ItemKey, DirectoryEntries>,
    pub props: SharedCache<ItemKey, Arc<PropertyList>>,
    pub changes: SharedCache<Revnum, Arc<Vec<Change>>>,
    pub l2p: SharedCache<FileKind, Arc<L2pIndex>>,
    pub p2l: SharedCache<FileKind, Arc<P2lIndex>>,
    pub manifests: SharedCache<u64, Arc<Vec<u64>>>,
    max_fulltext_size: u64,
    max_combined_size: u64,
}

fn memory<K, V>(name: &'static str, max_bytes: usize, max_entry: usize) -> SharedCache<K, V>
where
    K: Hash + Eq + Send + 'static,
    V: CacheWeight + Clone + Send + 'static,
{
    Arc::new(MemoryCache::new(name, max_bytes, max_entry))
}

impl CacheHierarchy {
    pub fn new(config: &CacheConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        let fulltext_entry = usize::try_from(config.max_fulltext_size).unwrap_or(usize::MAX);
        let combined_entry = usize::try_from(config.max_combined_size).unwrap_or(usize::MAX);
        Self {
            windows: memory("window", config.window_bytes, config.window_bytes / 4),
            // plus the weight of the buffer handle
            combined: memory("combined", config.combined_bytes, combined_entry.saturating_add(32)),
            fulltexts: memory("fulltext", config.fulltext_bytes, fulltext_entry.saturating_add(32)),
            nodes: memory("node", config.node_bytes, config.node_bytes),
            dirs: memory("dir", config.dir_bytes, config.dir_bytes / 2),
            props: memory("prop", config.prop_bytes, config.prop_bytes / 2),
            changes: memory("changes", config.changes_bytes, config.changes_bytes / 2),
            l2p: memory("l2p", config.index_bytes, config.index_bytes),
            p2l: memory("p2l", config.index_bytes, config.index_bytes),
            manifests: memory("manifest", config.index_bytes, config.index_bytes),
            max_fulltext_size: config.max_fulltext_size,
            max_combined_size: config.max_combined_size,
        }
    }

    /// Every cache always misses.
    pub fn disabled() -> Self {
        Self {
            windows: Arc::new(NullCache),
            combined: Arc::new(NullCache),
            fulltexts: Arc::new(NullCache),
            nodes: Arc::new(NullCache),
            dirs: Arc::new(NullCache),
            props: Arc::new(NullCache),
            changes: Arc::new(NullCache),
            l2p: Arc::new(NullCache),
            p2l: Arc::new(NullCache),
            manifests: Arc::new(NullCache),
            max_fulltext_size: 0,
            max_combined_size: 0,
        }
    }

    /// Representations above this size are never stored as fulltexts.
    pub fn max_fulltext_size(&self) -> u64 {
        self.max_fulltext_size
    }

    pub fn max_combined_size(&self) -> u64 {
        self.max_combined_size
    }

    pub fn stats(&self) -> BTreeMap<&'static str, CacheStats> {
        BTreeMap::from([
            ("window", self.windows.stats()),
            ("combined", self.combined.stats()),
            ("fulltext", self.fulltexts.stats()),
            ("node", self.nodes.stats()),
            ("dir", self.dirs.stats()),
            ("prop", self.props.stats()),
            ("changes", self.changes.stats()),
            ("l2p", self.l2p.stats()),
            ("p2l", self.p2l.stats()),
            ("manifest", self.manifests.stats()),
        ])
    }
}

impl Default for CacheHierarchy {
    fn default() -> Self {
        Self::new(&CacheConfig::default())
    }
}

//! Read-only filesystem facade
//!
//! [`FileSystem`] bundles the storage locator, delta codec, cache hierarchy
//! and configuration of one repository and exposes the read operations on
//! top of them. It is cheap to clone and safe to share between threads.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::block::{BlockReader, DecodedItem};
use crate::cache::{CacheHierarchy, CacheStats, ItemKey, RepKey};
use crate::chain::ReadContext;
use crate::changes::Change;
use crate::combiner::{DeltaStream, RepReader};
use crate::config::FsConfig;
use crate::error::{CorruptAt, FsError, Result};
use crate::format::FsFormat;
use crate::hash_dump::{dir_entries_from_hash, parse_hash, parse_incremental, DirectoryEntries, PropertyList};
use crate::ids::{ContainerId, NodeKind, NodeLocation, NodeRevId, Revnum, TxnId};
use crate::locator::{FsPaths, StorageLocator};
use crate::noderev::NodeRevision;
use crate::representation::{RepRef, Representation};
use crate::svndiff::{DeltaCodec, Svndiff};

/// An open FSFS repository
#[derive(Clone)]
pub struct FileSystem {
    ctx: ReadContext,
}

impl FileSystem {
    /// Open the repository at `root` with the configuration found in
    /// `db/fsfs.toml` and a private cache hierarchy.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let config = FsConfig::load(root)?;
        let caches = Arc::new(CacheHierarchy::new(&config.cache));
        Self::open_with(root, config, caches)
    }

    /// Open with explicit configuration and caches. A cache hierarchy must
    /// only be shared between handles of the same repository.
    pub fn open_with(root: impl AsRef<Path>, config: FsConfig, caches: Arc<CacheHierarchy>) -> Result<Self> {
        config.validate()?;
        let paths = FsPaths::new(root.as_ref());
        let format = FsFormat::read(&paths.format())?;
        info!(
            "opening repository {} (format {}, {:?} addressing)",
            root.as_ref().display(),
            format.number,
            format.addressing
        );
        let storage = StorageLocator::new(paths, format, &caches)?;
        Ok(Self {
            ctx: ReadContext {
                storage: Arc::new(storage),
                codec: Arc::new(Svndiff),
                caches,
                config: Arc::new(config),
            },
        })
    }

    /// Replace the delta codec.
    pub fn with_codec(mut self, codec: Arc<dyn DeltaCodec>) -> Self {
        self.ctx.codec = codec;
        self
    }

    pub fn root(&self) -> &Path {
        self.ctx.storage.paths().root()
    }

    pub fn format(&self) -> &FsFormat {
        self.ctx.storage.format()
    }

    pub fn config(&self) -> &FsConfig {
        &self.ctx.config
    }

    pub fn context(&self) -> &ReadContext {
        &self.ctx
    }

    pub fn youngest_rev(&self) -> Result<Revnum> {
        self.ctx.storage.youngest_rev()
    }

    pub fn ensure_revision_exists(&self, rev: Revnum) -> Result<()> {
        self.ctx.storage.ensure_revision_exists(rev)
    }

    /// Stream the fulltext of `rep`.
    pub fn read_rep(&self, rep: &Representation) -> Result<RepReader> {
        if let Some(rev) = rep.revision() {
            self.ensure_revision_exists(rev)?;
        }
        RepReader::open(&self.ctx, rep)
    }

    /// The whole fulltext of `rep`, verified.
    pub fn rep_contents(&self, rep: &Representation) -> Result<Bytes> {
        self.read_rep(rep)?.read_all()
    }

    pub fn node_rev(&self, id: &NodeRevId) -> Result<Arc<NodeRevision>> {
        let node = match &id.location {
            NodeLocation::Rev { rev, item } => self.committed_node_rev(*rev, *item)?,
            NodeLocation::Txn(txn) => self.txn_node_rev(id, txn)?,
        };
        if node.id != *id {
            return Err(FsError::corrupt(format!(
                "Node-revision '{}' was found where '{}' was expected",
                node.id, id
            )));
        }
        Ok(node)
    }

    fn committed_node_rev(&self, rev: Revnum, item: u64) -> Result<Arc<NodeRevision>> {
        self.ensure_revision_exists(rev)?;
        let key = RepKey { rev, item };
        if let Some(node) = self.ctx.caches.nodes.get(&key) {
            return Ok(node);
        }

        if let Some(block) = BlockReader::new(&self.ctx).read_block(rev, item)? {
            return match block.into_requested().decoded {
                DecodedItem::NodeRev(node) => Ok(node),
                other => Err(FsError::corrupt(format!(
                    "Item {} of r{} is not a node-revision ({:?})",
                    item, rev, other
                ))),
            };
        }

        let container = ContainerId::Rev(rev);
        let opened = self.ctx.storage.open_and_seek(&container, item, None)?;
        let node = {
            let mut file = opened.file.lock();
            NodeRevision::parse(file.reader())
                .map_err(|e| e.with_path(file.path()))
                .corrupt_at(&container, opened.offset)?
        };
        let node = Arc::new(node);
        self.ctx.caches.nodes.set(key, node.clone());
        Ok(node)
    }

    fn txn_node_rev(&self, id: &NodeRevId, txn: &TxnId) -> Result<Arc<NodeRevision>> {
        let path = self.ctx.storage.paths().txn_node(txn, &id.node_copy());
        let data = self.read_txn_file(txn, &path, || FsError::NoSuchNode(id.to_string()))?;
        let node = NodeRevision::parse(&mut &data[..]).map_err(|e| e.with_path(&path))?;
        Ok(Arc::new(node))
    }

    /// Read a file of `txn`, telling a missing transaction apart from a
    /// missing file.
    fn read_txn_file(&self, txn: &TxnId, path: &Path, missing: impl FnOnce() -> FsError) -> Result<Vec<u8>> {
        match fs::read(path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.ctx.storage.paths().txn_dir(txn).is_dir() {
                    Err(missing())
                } else {
                    Err(FsError::NoSuchTransaction(txn.to_string()))
                }
            }
            Err(e) => Err(FsError::io("reading", path, e)),
        }
    }

    /// Id of the root directory of `rev`
    pub fn rev_root_id(&self, rev: Revnum) -> Result<NodeRevId> {
        self.ensure_revision_exists(rev)?;
        let items = self.ctx.storage.rev_items(rev)?;
        let node = self.committed_node_rev(rev, items.root_node)?;
        if node.kind != NodeKind::Dir || node.id.revision() != Some(rev) {
            return Err(FsError::corrupt(format!(
                "Root node-revision of r{} is '{}'",
                rev, node.id
            )));
        }
        Ok(node.id.clone())
    }

    /// Entries of a directory node, sorted by name
    pub fn dir_entries(&self, node: &NodeRevision) -> Result<DirectoryEntries> {
        if node.kind != NodeKind::Dir {
            return Err(FsError::Unsupported(format!("'{}' is not a directory", node.id)));
        }
        let Some(text) = &node.text_rep else {
            return Ok(Arc::new(Vec::new()));
        };
        match text {
            RepRef::Mutable(txn) => {
                let path = self.ctx.storage.paths().txn_node_children(txn, &node.id.node_copy());
                let Some(key) = self.mutable_item_key(node, txn, &path)? else {
                    return Ok(Arc::new(Vec::new()));
                };
                if let Some(entries) = self.ctx.caches.dirs.get(&key) {
                    return Ok(entries);
                }
                let data = self.read_txn_file(txn, &path, || missing_file(&path))?;
                let entries = Arc::new(dir_entries_from_hash(parse_incremental(&data)?)?);
                self.ctx.caches.dirs.set(key, entries.clone());
                Ok(entries)
            }
            RepRef::Stored(rep) => {
                let key = rev_item_key(rep);
                if let Some(entries) = key.as_ref().and_then(|key| self.ctx.caches.dirs.get(key)) {
                    return Ok(entries);
                }
                let data = self.rep_contents(rep)?;
                let entries = Arc::new(dir_entries_from_hash(parse_hash(&data)?)?);
                if let Some(key) = key {
                    self.ctx.caches.dirs.set(key, entries.clone());
                }
                Ok(entries)
            }
        }
    }

    pub fn proplist(&self, node: &NodeRevision) -> Result<Arc<PropertyList>> {
        let Some(props) = &node.prop_rep else {
            return Ok(Arc::new(PropertyList::new()));
        };
        match props {
            RepRef::Mutable(txn) => {
                let path = self.ctx.storage.paths().txn_node_props(txn, &node.id.node_copy());
                let Some(key) = self.mutable_item_key(node, txn, &path)? else {
                    return Ok(Arc::new(PropertyList::new()));
                };
                if let Some(props) = self.ctx.caches.props.get(&key) {
                    return Ok(props);
                }
                let data = self.read_txn_file(txn, &path, || missing_file(&path))?;
                let props = Arc::new(parse_incremental(&data)?);
                self.ctx.caches.props.set(key, props.clone());
                Ok(props)
            }
            RepRef::Stored(rep) => {
                let key = rev_item_key(rep);
                if let Some(props) = key.as_ref().and_then(|key| self.ctx.caches.props.get(key)) {
                    return Ok(props);
                }
                let data = self.rep_contents(rep)?;
                let props = Arc::new(parse_hash(&data)?);
                if let Some(key) = key {
                    self.ctx.caches.props.set(key, props.clone());
                }
                Ok(props)
            }
        }
    }

    /// Cache key of a transaction node file; `None` when the file does not
    /// exist yet. These files only ever grow, so their length identifies
    /// their contents.
    fn mutable_item_key(&self, node: &NodeRevision, txn: &TxnId, path: &Path) -> Result<Option<ItemKey>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(ItemKey::Txn {
                node: node.id.to_string(),
                len: meta.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.ctx.storage.paths().txn_dir(txn).is_dir() {
                    debug!("no {} yet, treating as empty", path.display());
                    Ok(None)
                } else {
                    Err(FsError::NoSuchTransaction(txn.to_string()))
                }
            }
            Err(e) => Err(FsError::io("inspecting", path, e)),
        }
    }

    /// Stream the contents of a file node.
    pub fn file_contents(&self, node: &NodeRevision) -> Result<RepReader> {
        if node.kind != NodeKind::File {
            return Err(FsError::Unsupported(format!("'{}' is not a file", node.id)));
        }
        match &node.text_rep {
            None => Ok(RepReader::empty(&self.ctx)),
            Some(RepRef::Stored(rep)) => self.read_rep(rep),
            Some(RepRef::Mutable(_)) => Err(FsError::corrupt(format!(
                "File node-revision '{}' has a mutable text representation",
                node.id
            ))),
        }
    }

    /// Changed paths of committed revision `rev`, in stored order
    pub fn paths_changed(&self, rev: Revnum) -> Result<Arc<Vec<Change>>> {
        self.ensure_revision_exists(rev)?;
        if let Some(changes) = self.ctx.caches.changes.get(&rev) {
            return Ok(changes);
        }
        let items = self.ctx.storage.rev_items(rev)?;

        if let Some(block) = BlockReader::new(&self.ctx).read_block(rev, items.changes)? {
            return match block.into_requested().decoded {
                DecodedItem::Changes(changes) => Ok(changes),
                other => Err(FsError::corrupt(format!(
                    "Changes item of r{} holds {:?}",
                    rev, other
                ))),
            };
        }

        let container = ContainerId::Rev(rev);
        let opened = self.ctx.storage.open_and_seek(&container, items.changes, None)?;
        let with_mergeinfo = self.format().changes_have_mergeinfo();
        let changes = {
            let mut file = opened.file.lock();
            Change::parse_list(file.reader(), with_mergeinfo)
                .map_err(|e| e.with_path(file.path()))
                .corrupt_at(&container, opened.offset)?
        };
        let changes = Arc::new(changes);
        self.ctx.caches.changes.set(rev, changes.clone());
        Ok(changes)
    }

    /// Raw change records of a transaction, one per write, not folded
    pub fn txn_changes(&self, txn: &TxnId) -> Result<Vec<Change>> {
        let path = self.ctx.storage.paths().txn_changes(txn);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if self.ctx.storage.paths().txn_dir(txn).is_dir() {
                    return Ok(Vec::new());
                }
                return Err(FsError::NoSuchTransaction(txn.to_string()));
            }
            Err(e) => return Err(FsError::io("reading", &path, e)),
        };
        Change::parse_list(&mut &data[..], self.format().changes_have_mergeinfo())
    }

    /// The stored delta of `target` against `source`, if that is how it was
    /// written. `source == None` asks for a self-delta.
    pub fn delta_stream(&self, source: Option<&Representation>, target: &Representation) -> Result<Option<DeltaStream>> {
        if let Some(rev) = target.revision() {
            self.ensure_revision_exists(rev)?;
        }
        DeltaStream::open(&self.ctx, source, target)
    }

    pub fn cache_stats(&self) -> BTreeMap<&'static str, CacheStats> {
        self.ctx.caches.stats()
    }
}

fn missing_file(path: &Path) -> FsError {
    FsError::io(
        "reading",
        PathBuf::from(path),
        std::io::Error::new(std::io::ErrorKind::NotFound, "file disappeared"),
    )
}

fn rev_item_key(rep: &Representation) -> Option<ItemKey> {
    rep.revision().map(|rev| ItemKey::Rev { rev, item: rep.item })
}

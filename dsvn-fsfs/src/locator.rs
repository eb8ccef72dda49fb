//! Mapping containers and item addresses to open, seeked files
//!
//! Committed revisions live either in their own file or, once packed, in a
//! shard-wide pack file. Transactions keep their items in a proto-revision
//! file. How an item address becomes a byte offset depends on the
//! addressing mode and is delegated to an [`ItemLocator`].

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::cache::{CacheHierarchy, SharedCache};
use crate::error::{CorruptAt, FsError, Result};
use crate::format::FsFormat;
use crate::ids::{ContainerId, Revnum, TxnId};
use crate::index::{Footer, L2pIndex, P2lIndex, ITEM_INDEX_CHANGES, ITEM_INDEX_ROOT_NODE};
use crate::noderev::read_header_line;
use crate::representation::parse_number;

/// Longest revision trailer line
const MAX_TRAILER_LEN: u64 = 64;

/// Layout of a repository on disk
#[derive(Debug, Clone)]
pub struct FsPaths {
    root: PathBuf,
    db: PathBuf,
}

impl FsPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let db = root.join("db");
        Self { root, db }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn db(&self) -> &Path {
        &self.db
    }

    pub fn format(&self) -> PathBuf {
        self.db.join("format")
    }

    pub fn current(&self) -> PathBuf {
        self.db.join("current")
    }

    pub fn min_unpacked_rev(&self) -> PathBuf {
        self.db.join("min-unpacked-rev")
    }

    pub fn revs_dir(&self) -> PathBuf {
        self.db.join("revs")
    }

    /// Unpacked revision file
    pub fn rev(&self, rev: Revnum, format: &FsFormat) -> PathBuf {
        match format.shard_size {
            Some(size) => self.revs_dir().join((rev / size).to_string()).join(rev.to_string()),
            None => self.revs_dir().join(rev.to_string()),
        }
    }

    pub fn pack_dir(&self, shard: u64) -> PathBuf {
        self.revs_dir().join(format!("{}.pack", shard))
    }

    pub fn pack(&self, shard: u64) -> PathBuf {
        self.pack_dir(shard).join("pack")
    }

    pub fn manifest(&self, shard: u64) -> PathBuf {
        self.pack_dir(shard).join("manifest")
    }

    pub fn txn_dir(&self, txn: &TxnId) -> PathBuf {
        self.db.join("txns").join(format!("{}.txn", txn))
    }

    /// Node-revision file of a transaction node (`node.<node>.<copy>`)
    pub fn txn_node(&self, txn: &TxnId, node_copy: &str) -> PathBuf {
        self.txn_dir(txn).join(format!("node.{}", node_copy))
    }

    pub fn txn_node_children(&self, txn: &TxnId, node_copy: &str) -> PathBuf {
        self.txn_dir(txn).join(format!("node.{}.children", node_copy))
    }

    pub fn txn_node_props(&self, txn: &TxnId, node_copy: &str) -> PathBuf {
        self.txn_dir(txn).join(format!("node.{}.props", node_copy))
    }

    pub fn txn_changes(&self, txn: &TxnId) -> PathBuf {
        self.txn_dir(txn).join("changes")
    }

    pub fn proto_rev(&self, txn: &TxnId, format: &FsFormat) -> PathBuf {
        if format.has_protorevs_dir() {
            self.db.join("txn-protorevs").join(format!("{}.rev", txn))
        } else {
            self.txn_dir(txn).join("rev")
        }
    }
}

/// Which physical file a container's bytes are in
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Unpacked revision file
    Rev(Revnum),
    /// Pack file of a shard
    Pack(u64),
    /// Proto-revision file of a transaction
    ProtoRev(TxnId),
}

/// An open revision, pack or proto-revision file
pub struct RevFile {
    kind: FileKind,
    path: PathBuf,
    reader: BufReader<File>,
    len: u64,
}

/// A file handle handed from one chain link to the next
pub type SharedFile = Arc<Mutex<RevFile>>;

impl RevFile {
    pub fn open(kind: FileKind, path: PathBuf) -> std::io::Result<Self> {
        let file = File::open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            kind,
            path,
            reader: BufReader::new(file),
            len,
        })
    }

    pub fn kind(&self) -> &FileKind {
        &self.kind
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn position(&mut self) -> Result<u64> {
        self.reader
            .stream_position()
            .map_err(|e| FsError::io("querying position in", &self.path, e))
    }

    /// Seek to an absolute offset, keeping buffered data when possible.
    pub fn seek(&mut self, offset: u64) -> Result<()> {
        let current = self.position()?;
        let delta = offset as i64 - current as i64;
        if delta != 0 {
            self.reader
                .seek_relative(delta)
                .map_err(|e| FsError::io("seeking in", &self.path, e))?;
        }
        Ok(())
    }

    /// One header line, without its newline
    pub fn read_line(&mut self) -> Result<String> {
        read_header_line(&mut self.reader).map_err(|e| e.with_path(&self.path))
    }

    /// Fill `buf`; running into EOF is corruption.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FsError::corrupt(format!("Unexpected end of file '{}'", self.path.display()))
            } else {
                FsError::io("reading", &self.path, e)
            }
        })
    }

    pub fn read_vec(&mut self, len: u64) -> Result<Vec<u8>> {
        if len > self.len {
            return Err(FsError::corrupt(format!(
                "Read of {} bytes exceeds the size of '{}'",
                len,
                self.path.display()
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// The buffered reader, for parsers and codecs
    pub fn reader(&mut self) -> &mut BufReader<File> {
        &mut self.reader
    }
}

/// Absolute position of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemAddress {
    pub offset: u64,
}

/// Item addresses of a revision's root node-revision and changes list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RevItems {
    pub root_node: u64,
    pub changes: u64,
}

/// Result of [`StorageLocator::open_and_seek`]
pub struct OpenedItem {
    pub file: SharedFile,
    pub offset: u64,
}

/// Turns item addresses into file offsets for one addressing mode
pub trait ItemLocator: Send + Sync {
    /// Absolute position of `item` of committed revision `rev` in `file`.
    fn resolve(&self, file: &mut RevFile, rev: Revnum, item: u64) -> Result<ItemAddress>;

    /// Where to find the root node and changes list of `rev`.
    fn rev_items(&self, file: &mut RevFile, rev: Revnum) -> Result<RevItems>;

    /// The P2L index of `file`, for block reads
    fn p2l_index(&self, _file: &mut RevFile) -> Result<Option<Arc<P2lIndex>>> {
        Ok(None)
    }
}

/// Item addresses are byte offsets relative to the revision's start
pub struct PhysicalLocator {
    paths: FsPaths,
    shard_size: u64,
    manifests: SharedCache<u64, Arc<Vec<u64>>>,
}

impl PhysicalLocator {
    pub fn new(paths: FsPaths, format: &FsFormat, caches: &CacheHierarchy) -> Self {
        Self {
            paths,
            shard_size: format.shard_size.unwrap_or(1),
            manifests: caches.manifests.clone(),
        }
    }

    fn manifest(&self, shard: u64) -> Result<Arc<Vec<u64>>> {
        if let Some(manifest) = self.manifests.get(&shard) {
            return Ok(manifest);
        }
        let path = self.paths.manifest(shard);
        let text = fs::read_to_string(&path).map_err(|e| FsError::io("reading manifest", &path, e))?;
        let manifest = Arc::new(parse_manifest(&text)?);
        self.manifests.set(shard, manifest.clone());
        Ok(manifest)
    }

    /// Byte range of `rev`'s data inside `file`
    fn rev_range(&self, file: &RevFile, rev: Revnum) -> Result<(u64, u64)> {
        match file.kind() {
            FileKind::Pack(shard) => {
                let manifest = self.manifest(*shard)?;
                let idx = (rev - shard * self.shard_size) as usize;
                let start = *manifest.get(idx).ok_or_else(|| {
                    FsError::corrupt(format!("Revision {} is missing from the pack manifest", rev))
                })?;
                let end = manifest.get(idx + 1).copied().unwrap_or(file.len());
                if start > end || end > file.len() {
                    return Err(FsError::corrupt(format!("Pack manifest of shard {} is inconsistent", shard)));
                }
                Ok((start, end))
            }
            FileKind::Rev(_) | FileKind::ProtoRev(_) => Ok((0, file.len())),
        }
    }
}

impl ItemLocator for PhysicalLocator {
    fn resolve(&self, file: &mut RevFile, rev: Revnum, item: u64) -> Result<ItemAddress> {
        let (start, end) = self.rev_range(file, rev)?;
        let offset = start
            .checked_add(item)
            .filter(|&offset| offset < end)
            .ok_or_else(|| FsError::corrupt(format!("Item offset {} lies outside revision {}", item, rev)))?;
        Ok(ItemAddress { offset })
    }

    fn rev_items(&self, file: &mut RevFile, rev: Revnum) -> Result<RevItems> {
        let (start, end) = self.rev_range(file, rev)?;
        let tail_start = end.saturating_sub(MAX_TRAILER_LEN).max(start);
        file.seek(tail_start)?;
        let tail = file.read_vec(end - tail_start)?;
        let (root_node, changes) = parse_trailer(&tail).corrupt_at(&ContainerId::Rev(rev), tail_start)?;
        Ok(RevItems { root_node, changes })
    }
}

/// Item addresses are indexes resolved through the L2P index
pub struct LogicalLocator {
    l2p: SharedCache<FileKind, Arc<L2pIndex>>,
    p2l: SharedCache<FileKind, Arc<P2lIndex>>,
}

impl LogicalLocator {
    pub fn new(caches: &CacheHierarchy) -> Self {
        Self {
            l2p: caches.l2p.clone(),
            p2l: caches.p2l.clone(),
        }
    }

    fn indexes(&self, file: &mut RevFile) -> Result<(Arc<L2pIndex>, Arc<P2lIndex>)> {
        let key = file.kind().clone();
        if let (Some(l2p), Some(p2l)) = (self.l2p.get(&key), self.p2l.get(&key)) {
            return Ok((l2p, p2l));
        }

        let len = file.len();
        if len < 2 {
            return Err(FsError::corrupt(format!("File '{}' is too short to hold an index footer", file.path().display())));
        }
        file.seek(len - 1)?;
        let mut footer_len = [0u8; 1];
        file.read_exact(&mut footer_len)?;
        let footer_len = u64::from(footer_len[0]);
        let footer_start = (len - 1)
            .checked_sub(footer_len)
            .ok_or_else(|| FsError::corrupt("Index footer length exceeds the file size"))?;
        file.seek(footer_start)?;
        let text = file.read_vec(footer_len)?;
        let footer = Footer::parse(&text, footer_start)?;

        file.seek(footer.l2p_offset)?;
        let l2p_bytes = file.read_vec(footer.p2l_offset - footer.l2p_offset)?;
        let p2l_bytes = file.read_vec(footer_start - footer.p2l_offset)?;
        let l2p = Arc::new(L2pIndex::decode(&l2p_bytes, &footer.l2p_md5)?);
        let p2l = Arc::new(P2lIndex::decode(&p2l_bytes, &footer.p2l_md5)?);

        self.l2p.set(key.clone(), l2p.clone());
        self.p2l.set(key, p2l.clone());
        Ok((l2p, p2l))
    }
}

impl ItemLocator for LogicalLocator {
    fn resolve(&self, file: &mut RevFile, rev: Revnum, item: u64) -> Result<ItemAddress> {
        if let FileKind::ProtoRev(_) = file.kind() {
            return Ok(ItemAddress { offset: item });
        }
        let (l2p, _) = self.indexes(file)?;
        Ok(ItemAddress {
            offset: l2p.lookup(rev, item)?,
        })
    }

    fn rev_items(&self, _file: &mut RevFile, _rev: Revnum) -> Result<RevItems> {
        Ok(RevItems {
            root_node: ITEM_INDEX_ROOT_NODE,
            changes: ITEM_INDEX_CHANGES,
        })
    }

    fn p2l_index(&self, file: &mut RevFile) -> Result<Option<Arc<P2lIndex>>> {
        let (_, p2l) = self.indexes(file)?;
        Ok(Some(p2l))
    }
}

/// Entry point for every file access of the read path
pub struct StorageLocator {
    paths: FsPaths,
    format: FsFormat,
    youngest: AtomicU64,
    min_unpacked: AtomicU64,
    items: Box<dyn ItemLocator>,
}

impl StorageLocator {
    pub fn new(paths: FsPaths, format: FsFormat, caches: &CacheHierarchy) -> Result<Self> {
        let items: Box<dyn ItemLocator> = if format.is_logical() {
            Box::new(LogicalLocator::new(caches))
        } else {
            Box::new(PhysicalLocator::new(paths.clone(), &format, caches))
        };
        let locator = Self {
            paths,
            format,
            youngest: AtomicU64::new(0),
            min_unpacked: AtomicU64::new(0),
            items,
        };
        locator.youngest_rev()?;
        locator.refresh_min_unpacked()?;
        Ok(locator)
    }

    pub fn paths(&self) -> &FsPaths {
        &self.paths
    }

    pub fn format(&self) -> &FsFormat {
        &self.format
    }

    pub fn item_locator(&self) -> &dyn ItemLocator {
        self.items.as_ref()
    }

    /// Re-read `db/current`.
    pub fn youngest_rev(&self) -> Result<Revnum> {
        let path = self.paths.current();
        let text = fs::read_to_string(&path).map_err(|e| FsError::io("reading", &path, e))?;
        let first = text.split_whitespace().next().unwrap_or("");
        let youngest = parse_number(first)
            .ok_or_else(|| FsError::corrupt(format!("Corrupt 'current' file: '{}'", text.trim_end())))?;
        self.youngest.fetch_max(youngest, Ordering::AcqRel);
        Ok(youngest)
    }

    /// `NoSuchRevision` unless `rev` has been committed.
    pub fn ensure_revision_exists(&self, rev: Revnum) -> Result<()> {
        if rev <= self.youngest.load(Ordering::Acquire) {
            return Ok(());
        }
        if rev <= self.youngest_rev()? {
            return Ok(());
        }
        Err(FsError::NoSuchRevision(rev))
    }

    pub fn min_unpacked_rev(&self) -> Revnum {
        self.min_unpacked.load(Ordering::Acquire)
    }

    /// Re-read `db/min-unpacked-rev`; a concurrent pack may have moved it.
    pub fn refresh_min_unpacked(&self) -> Result<()> {
        if !self.format.supports_packing() {
            return Ok(());
        }
        let path = self.paths.min_unpacked_rev();
        let value = match fs::read_to_string(&path) {
            Ok(text) => parse_number(text.trim_end()).ok_or_else(|| {
                FsError::corrupt(format!("Corrupt 'min-unpacked-rev' file: '{}'", text.trim_end()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(FsError::io("reading", &path, e)),
        };
        let old = self.min_unpacked.swap(value, Ordering::AcqRel);
        if old != value {
            debug!("min-unpacked-rev changed from {} to {}", old, value);
        }
        Ok(())
    }

    pub fn is_packed(&self, rev: Revnum) -> bool {
        self.format.supports_packing() && rev < self.min_unpacked_rev()
    }

    /// The file a container's bytes are currently in
    pub fn file_kind(&self, container: &ContainerId) -> FileKind {
        match container {
            ContainerId::Rev(rev) if self.is_packed(*rev) => {
                FileKind::Pack(rev / self.format.shard_size.unwrap_or(1))
            }
            ContainerId::Rev(rev) => FileKind::Rev(*rev),
            ContainerId::Txn(txn) => FileKind::ProtoRev(txn.clone()),
        }
    }

    fn path_of(&self, kind: &FileKind) -> PathBuf {
        match kind {
            FileKind::Rev(rev) => self.paths.rev(*rev, &self.format),
            FileKind::Pack(shard) => self.paths.pack(*shard),
            FileKind::ProtoRev(txn) => self.paths.proto_rev(txn, &self.format),
        }
    }

    /// Open the file holding committed revision `rev`.
    pub fn open_rev_file(&self, rev: Revnum) -> Result<RevFile> {
        self.ensure_revision_exists(rev)?;
        let mut retried = false;
        loop {
            let kind = self.file_kind(&ContainerId::Rev(rev));
            let path = self.path_of(&kind);
            match RevFile::open(kind, path.clone()) {
                Ok(file) => return Ok(file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && !retried => {
                    debug!("revision {} not found at {}, re-reading min-unpacked-rev", rev, path.display());
                    self.refresh_min_unpacked()?;
                    retried = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FsError::NoSuchRevision(rev));
                }
                Err(e) => return Err(FsError::io("opening", &path, e)),
            }
        }
    }

    /// Open the proto-revision file of `txn`.
    pub fn open_txn_file(&self, txn: &TxnId) -> Result<RevFile> {
        let kind = FileKind::ProtoRev(txn.clone());
        let path = self.path_of(&kind);
        RevFile::open(kind, path.clone()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FsError::NoSuchTransaction(txn.to_string())
            } else {
                FsError::io("opening", &path, e)
            }
        })
    }

    fn open_container(&self, container: &ContainerId, hint: Option<&SharedFile>) -> Result<SharedFile> {
        if let Some(hint) = hint {
            let kind = self.file_kind(container);
            if *hint.lock().kind() == kind {
                debug!("reusing open file for {}", container);
                return Ok(hint.clone());
            }
        }
        let file = match container {
            ContainerId::Rev(rev) => self.open_rev_file(*rev)?,
            ContainerId::Txn(txn) => self.open_txn_file(txn)?,
        };
        Ok(Arc::new(Mutex::new(file)))
    }

    /// Open the file holding `item` of `container` and seek to it. `hint` is
    /// the previous link's file; it is reused when it is the same file.
    pub fn open_and_seek(
        &self,
        container: &ContainerId,
        item: u64,
        hint: Option<&SharedFile>,
    ) -> Result<OpenedItem> {
        let file = self.open_container(container, hint)?;
        let address = {
            let mut guard = file.lock();
            let address = match container {
                ContainerId::Rev(rev) => self.items.resolve(&mut guard, *rev, item)?,
                ContainerId::Txn(_) => ItemAddress { offset: item },
            };
            guard.seek(address.offset)?;
            address
        };
        Ok(OpenedItem {
            file,
            offset: address.offset,
        })
    }

    /// Root node and changes item addresses of `rev`
    pub fn rev_items(&self, rev: Revnum) -> Result<RevItems> {
        let mut file = self.open_rev_file(rev)?;
        self.items.rev_items(&mut file, rev)
    }
}

/// One start offset per line
pub fn parse_manifest(text: &str) -> Result<Vec<u64>> {
    let offsets = text
        .lines()
        .map(|line| {
            parse_number(line).ok_or_else(|| FsError::corrupt(format!("Malformed manifest line '{}'", line)))
        })
        .collect::<Result<Vec<u64>>>()?;
    if offsets.windows(2).any(|pair| pair[0] > pair[1]) {
        return Err(FsError::corrupt("Manifest offsets are not ascending"));
    }
    Ok(offsets)
}

/// Parse the `<root-offset> <changes-offset>\n` line ending `tail`.
pub fn parse_trailer(tail: &[u8]) -> Result<(u64, u64)> {
    let body = tail
        .strip_suffix(b"\n")
        .ok_or_else(|| FsError::corrupt("Revision file lacks trailing newline"))?;
    let line = match body.iter().rposition(|&b| b == b'\n') {
        Some(pos) => &body[pos + 1..],
        None if (tail.len() as u64) < MAX_TRAILER_LEN => body,
        None => {
            return Err(FsError::corrupt(format!(
                "Final line in revision file longer than {} characters",
                MAX_TRAILER_LEN
            )))
        }
    };
    let line = std::str::from_utf8(line).map_err(|_| FsError::corrupt("Final line in revision file is not text"))?;
    let (root, changes) = line
        .split_once(' ')
        .ok_or_else(|| FsError::corrupt("Final line in revision file missing space"))?;
    let root = parse_number(root).ok_or_else(|| FsError::corrupt(format!("Malformed root offset '{}'", root)))?;
    let changes = parse_number(changes)
        .ok_or_else(|| FsError::corrupt(format!("Malformed changes offset '{}'", changes)))?;
    Ok((root, changes))
}

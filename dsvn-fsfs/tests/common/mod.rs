//! Shared fixtures: writes real FSFS repositories into temporary directories

#![allow(dead_code)]

mod index_writer;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dsvn_fsfs::checksum::{fnv1a_32x4, Md5Digest, Sha1Digest};
use dsvn_fsfs::format::{Addressing, FsFormat};
use dsvn_fsfs::hash_dump::{write_dir_entries, write_entry, write_hash};
use dsvn_fsfs::index::{ItemType, P2lEntry, ITEM_INDEX_CHANGES, ITEM_INDEX_FIRST_USER, ITEM_INDEX_ROOT_NODE};
use dsvn_fsfs::locator::FsPaths;
use dsvn_fsfs::{
    CacheConfig, CacheHierarchy, Change, ChangeKind, ContainerId, DeltaCodec, DeltaOp, DeltaWindow, DirEntry,
    FileSystem, FsConfig, NodeKind, NodeRevId, NodeRevision, RepHeader, RepRef, Representation, Revnum,
    Svndiff, TxnId,
};
use tempfile::TempDir;

pub use index_writer::{append_indexes, encode_container, write_int, write_uvarint, L2pWriter, P2lWriter};

pub const SHARD_SIZE: u64 = 4;
pub const P2L_PAGE: u64 = 256;
const L2P_PAGE: u64 = 4;

/// Encode `windows` as a complete svndiff stream.
pub fn svndiff(version: u8, windows: &[DeltaWindow]) -> Vec<u8> {
    let codec = Svndiff;
    let mut out = codec.stream_header(version).unwrap().to_vec();
    for window in windows {
        codec.write_window(&mut out, window, version).unwrap();
    }
    out
}

/// A window that copies `[offset, offset + len)` of the source, then
/// appends `new`.
pub fn copy_then_insert(sview_len: u64, offset: u64, len: u64, new: &[u8]) -> DeltaWindow {
    let mut ops = Vec::new();
    if len > 0 {
        ops.push(DeltaOp::Source { offset, len });
    }
    if !new.is_empty() {
        ops.push(DeltaOp::New { len: new.len() as u64 });
    }
    DeltaWindow {
        sview_offset: 0,
        sview_len,
        tview_len: len + new.len() as u64,
        ops,
        new_data: new.to_vec().into(),
    }
}

/// A window holding only new data
pub fn literal(data: &[u8]) -> DeltaWindow {
    DeltaWindow {
        sview_offset: 0,
        sview_len: 0,
        tview_len: data.len() as u64,
        ops: vec![DeltaOp::New { len: data.len() as u64 }],
        new_data: data.to_vec().into(),
    }
}

pub fn md5(data: &[u8]) -> Md5Digest {
    Md5Digest::of(data)
}

pub fn uncached_config() -> FsConfig {
    FsConfig {
        cache: CacheConfig::disabled(),
        ..FsConfig::default()
    }
}

/// Data of one committed revision, kept for packing
#[derive(Clone)]
struct RevData {
    rev: Revnum,
    data: Vec<u8>,
    l2p: Vec<(u64, u64)>,
    p2l: Vec<P2lEntry>,
    root: u64,
    changes: u64,
}

impl RevData {
    fn physical_file(&self) -> Vec<u8> {
        let mut file = self.data.clone();
        file.extend_from_slice(format!("{} {}\n", self.root, self.changes).as_bytes());
        file
    }

    fn logical_file(&self) -> Vec<u8> {
        let mut file = self.data.clone();
        let mut l2p = L2pWriter::new(self.rev, L2P_PAGE);
        l2p.begin_revision();
        for &(item, offset) in &self.l2p {
            l2p.set(item, offset);
        }
        let mut p2l = P2lWriter::new(self.rev, P2L_PAGE);
        for entry in &self.p2l {
            p2l.add(*entry);
        }
        append_indexes(&mut file, &l2p, &p2l);
        file
    }
}

/// Builds a repository revision by revision
pub struct RepoBuilder {
    dir: TempDir,
    format: FsFormat,
    revs: Vec<RevData>,
}

impl RepoBuilder {
    pub fn physical() -> Self {
        Self::with_format(FsFormat {
            number: 6,
            shard_size: Some(SHARD_SIZE),
            addressing: Addressing::Physical,
        })
    }

    pub fn logical() -> Self {
        Self::with_format(FsFormat {
            number: 7,
            shard_size: Some(SHARD_SIZE),
            addressing: Addressing::Logical,
        })
    }

    /// A fresh repository holding revision 0 (an empty root directory).
    pub fn with_format(format: FsFormat) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = FsPaths::new(dir.path());
        fs::create_dir_all(paths.revs_dir()).unwrap();
        fs::create_dir_all(paths.db().join("txns")).unwrap();
        if format.has_protorevs_dir() {
            fs::create_dir_all(paths.db().join("txn-protorevs")).unwrap();
        }
        fs::write(paths.format(), format.to_file_contents()).unwrap();
        if format.supports_packing() {
            fs::write(paths.min_unpacked_rev(), "0\n").unwrap();
        }
        fs::write(paths.current(), "0\n").unwrap();

        let mut builder = Self {
            dir,
            format,
            revs: Vec::new(),
        };
        let mut r0 = builder.revision();
        r0.root_dir(&[]);
        r0.changes(&[]);
        builder.commit(r0);
        builder
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn paths(&self) -> FsPaths {
        FsPaths::new(self.dir.path())
    }

    pub fn format(&self) -> FsFormat {
        self.format
    }

    pub fn youngest(&self) -> Revnum {
        self.revs.len() as Revnum - 1
    }

    pub fn rev_path(&self, rev: Revnum) -> PathBuf {
        self.paths().rev(rev, &self.format)
    }

    /// Start writing the next revision.
    pub fn revision(&self) -> RevWriter {
        RevWriter::new(self.revs.len() as Revnum, self.format.is_logical())
    }

    pub fn commit(&mut self, writer: RevWriter) -> Revnum {
        let data = writer.finish();
        assert_eq!(data.rev, self.revs.len() as Revnum, "revisions must be committed in order");
        let path = self.rev_path(data.rev);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let file = if self.format.is_logical() {
            data.logical_file()
        } else {
            data.physical_file()
        };
        fs::write(&path, file).unwrap();
        fs::write(self.paths().current(), format!("{}\n", data.rev)).unwrap();
        let rev = data.rev;
        self.revs.push(data);
        rev
    }

    /// Pack a complete shard and move `min-unpacked-rev` past it.
    pub fn pack_shard(&mut self, shard: u64) {
        let first = shard * SHARD_SIZE;
        let revs: Vec<RevData> = self.revs[first as usize..(first + SHARD_SIZE) as usize].to_vec();
        let paths = self.paths();
        fs::create_dir_all(paths.pack_dir(shard)).unwrap();

        let mut pack = Vec::new();
        if self.format.is_logical() {
            let mut l2p = L2pWriter::new(first, L2P_PAGE);
            let mut p2l = P2lWriter::new(first, P2L_PAGE);
            for rev in &revs {
                let base = pack.len() as u64;
                pack.extend_from_slice(&rev.data);
                l2p.begin_revision();
                for &(item, offset) in &rev.l2p {
                    l2p.set(item, offset + base);
                }
                for entry in &rev.p2l {
                    p2l.add(P2lEntry {
                        offset: entry.offset + base,
                        ..*entry
                    });
                }
            }
            append_indexes(&mut pack, &l2p, &p2l);
        } else {
            let mut manifest = String::new();
            for rev in &revs {
                manifest.push_str(&format!("{}\n", pack.len()));
                pack.extend_from_slice(&rev.physical_file());
            }
            fs::write(paths.manifest(shard), manifest).unwrap();
        }
        fs::write(paths.pack(shard), pack).unwrap();
        fs::remove_dir_all(paths.revs_dir().join(shard.to_string())).unwrap();
        fs::write(paths.min_unpacked_rev(), format!("{}\n", first + SHARD_SIZE)).unwrap();
    }

    pub fn open(&self) -> FileSystem {
        FileSystem::open(self.root()).unwrap()
    }

    pub fn open_with(&self, config: FsConfig) -> FileSystem {
        let caches = Arc::new(CacheHierarchy::new(&config.cache));
        FileSystem::open_with(self.root(), config, caches).unwrap()
    }

    pub fn open_uncached(&self) -> FileSystem {
        self.open_with(uncached_config())
    }

    pub fn txn(&self, name: &str) -> TxnWriter {
        let txn = TxnId::new(name).unwrap();
        let paths = self.paths();
        fs::create_dir_all(paths.txn_dir(&txn)).unwrap();
        TxnWriter {
            proto_path: paths.proto_rev(&txn, &self.format),
            paths,
            txn,
            proto: Vec::new(),
        }
    }
}

/// Items of one revision being written
pub struct RevWriter {
    rev: Revnum,
    logical: bool,
    data: Vec<u8>,
    next_item: u64,
    l2p: Vec<(u64, u64)>,
    p2l: Vec<P2lEntry>,
    root: Option<u64>,
    changes: Option<u64>,
}

impl RevWriter {
    fn new(rev: Revnum, logical: bool) -> Self {
        Self {
            rev,
            logical,
            data: Vec::new(),
            next_item: ITEM_INDEX_FIRST_USER,
            l2p: Vec::new(),
            p2l: Vec::new(),
            root: None,
            changes: None,
        }
    }

    pub fn rev(&self) -> Revnum {
        self.rev
    }

    /// Item address the next item will get
    fn allocate(&mut self, fixed: Option<u64>) -> u64 {
        if !self.logical {
            return self.data.len() as u64;
        }
        match fixed {
            Some(item) => item,
            None => {
                let item = self.next_item;
                self.next_item += 1;
                item
            }
        }
    }

    fn push(&mut self, item: u64, item_type: ItemType, bytes: &[u8]) {
        let offset = self.data.len() as u64;
        self.data.extend_from_slice(bytes);
        self.l2p.push((item, offset));
        self.p2l.push(P2lEntry {
            offset,
            size: bytes.len() as u64,
            item_type,
            fnv1_checksum: fnv1a_32x4(bytes),
            rev: self.rev,
            item,
        });
    }

    /// Store `payload` under `header`; `fulltext` is what it expands to.
    pub fn raw_rep(&mut self, item_type: ItemType, header: RepHeader, payload: &[u8], fulltext: &[u8]) -> Representation {
        let item = self.allocate(None);
        let mut bytes = header.to_line().into_bytes();
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(b"ENDREP\n");
        self.push(item, item_type, &bytes);
        Representation {
            container: ContainerId::Rev(self.rev),
            item,
            size: payload.len() as u64,
            expanded_size: fulltext.len() as u64,
            md5: md5(fulltext),
            sha1: Some(Sha1Digest::of(fulltext)),
            uniquifier: None,
        }
    }

    pub fn plain(&mut self, content: &[u8]) -> Representation {
        self.raw_rep(ItemType::FileRep, RepHeader::Plain, content, content)
    }

    pub fn self_delta(&mut self, content: &[u8]) -> Representation {
        let payload = svndiff(0, &[literal(content)]);
        self.raw_rep(ItemType::FileRep, RepHeader::SelfDelta, &payload, content)
    }

    /// A delta against the committed `base`
    pub fn delta(&mut self, base: &Representation, windows: &[DeltaWindow], fulltext: &[u8]) -> Representation {
        self.delta_with_version(base, windows, fulltext, 1)
    }

    pub fn delta_with_version(
        &mut self,
        base: &Representation,
        windows: &[DeltaWindow],
        fulltext: &[u8],
        version: u8,
    ) -> Representation {
        let header = RepHeader::Delta {
            base_rev: base.revision().unwrap(),
            base_item: base.item,
            base_size: base.size,
        };
        let payload = svndiff(version, windows);
        self.raw_rep(ItemType::FileRep, header, &payload, fulltext)
    }

    pub fn dir_rep(&mut self, entries: &[DirEntry]) -> Representation {
        let dump = write_dir_entries(entries);
        self.raw_rep(ItemType::DirRep, RepHeader::Plain, &dump, &dump)
    }

    pub fn props_rep(&mut self, props: &[(&str, &[u8])]) -> Representation {
        let dump = write_hash(props.iter().copied());
        self.raw_rep(ItemType::FileProps, RepHeader::Plain, &dump, &dump)
    }

    /// A representation container; one representation per packed item.
    /// The container's P2L entry carries the first packed item number.
    pub fn container(&mut self, items: &[&[u8]]) -> Vec<Representation> {
        assert!(self.logical, "containers need logical addressing");
        let numbered: Vec<(u64, &[u8])> = items.iter().map(|content| (self.allocate(None), *content)).collect();
        let offset = self.data.len() as u64;
        let bytes = encode_container(&numbered);
        self.data.extend_from_slice(&bytes);
        self.p2l.push(P2lEntry {
            offset,
            size: bytes.len() as u64,
            item_type: ItemType::AnyRep,
            fnv1_checksum: fnv1a_32x4(&bytes),
            rev: self.rev,
            item: numbered[0].0,
        });
        numbered
            .into_iter()
            .map(|(item, content)| {
                self.l2p.push((item, offset));
                Representation {
                    container: ContainerId::Rev(self.rev),
                    item,
                    size: content.len() as u64,
                    expanded_size: content.len() as u64,
                    md5: md5(content),
                    sha1: None,
                    uniquifier: None,
                }
            })
            .collect()
    }

    /// Write a node-revision; `edit` fills in everything but id and kind.
    pub fn node(
        &mut self,
        node_id: &str,
        copy_id: &str,
        kind: NodeKind,
        root: bool,
        edit: impl FnOnce(&mut NodeRevision),
    ) -> NodeRevId {
        let item = self.allocate(root.then_some(ITEM_INDEX_ROOT_NODE));
        let id = NodeRevId::committed(node_id, copy_id, self.rev, item);
        let mut node = NodeRevision::new(id.clone(), kind);
        edit(&mut node);
        let text = node.serialize();
        self.push(item, ItemType::NodeRev, text.as_bytes());
        if root {
            self.root = Some(item);
        }
        id
    }

    /// Root directory holding `entries`
    pub fn root_dir(&mut self, entries: &[DirEntry]) -> NodeRevId {
        let text = if entries.is_empty() { None } else { Some(self.dir_rep(entries)) };
        let rev = self.rev;
        self.node("0", "0", NodeKind::Dir, true, |node| {
            node.text_rep = text.map(RepRef::Stored);
            node.predecessor_count = rev;
            node.created_path = Some("/".to_string());
        })
    }

    /// A file node with `text`
    pub fn file(&mut self, node_id: &str, path: &str, text: Option<Representation>) -> NodeRevId {
        let path = path.to_string();
        self.node(node_id, "0", NodeKind::File, false, |node| {
            node.text_rep = text.map(RepRef::Stored);
            node.created_path = Some(path);
        })
    }

    pub fn changes(&mut self, changes: &[Change]) {
        let item = self.allocate(Some(ITEM_INDEX_CHANGES));
        let text = Change::serialize_list(changes);
        self.push(item, ItemType::Changes, text.as_bytes());
        self.changes = Some(item);
    }

    /// Offset the next item will be written at
    pub fn next_offset(&self) -> u64 {
        self.data.len() as u64
    }

    /// Append arbitrary bytes as an item of `item_type`; returns its address.
    pub fn raw(&mut self, item_type: ItemType, bytes: &[u8]) -> u64 {
        let item = self.allocate(None);
        self.push(item, item_type, bytes);
        item
    }

    /// Bytes that no index mentions
    pub fn padding(&mut self, len: usize) {
        self.data.extend(std::iter::repeat(b'\n').take(len));
    }

    fn finish(self) -> RevData {
        RevData {
            rev: self.rev,
            root: self.root.expect("revision needs a root node"),
            changes: self.changes.expect("revision needs a changes list"),
            data: self.data,
            l2p: self.l2p,
            p2l: self.p2l,
        }
    }
}

pub fn change(id: &NodeRevId, kind: ChangeKind, node_kind: NodeKind, path: &str, mergeinfo: bool) -> Change {
    Change {
        node_rev_id: id.clone(),
        kind,
        node_kind: Some(node_kind),
        text_mod: node_kind == NodeKind::File,
        prop_mod: false,
        mergeinfo_mod: mergeinfo.then_some(false),
        path: path.to_string(),
        copyfrom: None,
    }
}

pub fn dir_entry(name: &str, kind: NodeKind, id: &NodeRevId) -> DirEntry {
    DirEntry {
        name: name.to_string(),
        kind,
        id: id.clone(),
    }
}

/// Files of one transaction
pub struct TxnWriter {
    paths: FsPaths,
    pub txn: TxnId,
    proto_path: PathBuf,
    proto: Vec<u8>,
}

impl TxnWriter {
    /// A representation in the proto-revision file
    pub fn plain(&mut self, content: &[u8]) -> Representation {
        self.stored(RepHeader::Plain, content, content)
    }

    pub fn delta(&mut self, base: &Representation, windows: &[DeltaWindow], fulltext: &[u8]) -> Representation {
        let header = RepHeader::Delta {
            base_rev: base.revision().unwrap(),
            base_item: base.item,
            base_size: base.size,
        };
        self.stored(header, &svndiff(1, windows), fulltext)
    }

    fn stored(&mut self, header: RepHeader, payload: &[u8], fulltext: &[u8]) -> Representation {
        let item = self.proto.len() as u64;
        self.proto.extend_from_slice(header.to_line().as_bytes());
        self.proto.extend_from_slice(payload);
        self.proto.extend_from_slice(b"ENDREP\n");
        Representation {
            container: ContainerId::Txn(self.txn.clone()),
            item,
            size: payload.len() as u64,
            expanded_size: fulltext.len() as u64,
            md5: md5(fulltext),
            sha1: None,
            uniquifier: None,
        }
    }

    pub fn node(&mut self, node_id: &str, kind: NodeKind, edit: impl FnOnce(&mut NodeRevision)) -> NodeRevId {
        let id = NodeRevId::in_txn(node_id, "0", self.txn.clone());
        let mut node = NodeRevision::new(id.clone(), kind);
        edit(&mut node);
        fs::write(self.paths.txn_node(&self.txn, &id.node_copy()), node.serialize()).unwrap();
        id
    }

    /// Append raw incremental hash-dump data to a node's children file.
    pub fn append_children(&self, id: &NodeRevId, data: &[u8]) {
        append(&self.paths.txn_node_children(&self.txn, &id.node_copy()), data);
    }

    pub fn append_props(&self, id: &NodeRevId, data: &[u8]) {
        append(&self.paths.txn_node_props(&self.txn, &id.node_copy()), data);
    }

    pub fn changes(&self, changes: &[Change]) {
        let text: String = changes.iter().map(Change::serialize).collect();
        fs::write(self.paths.txn_changes(&self.txn), text).unwrap();
    }

    /// Write the proto-revision file.
    pub fn flush(&self) {
        fs::write(&self.proto_path, &self.proto).unwrap();
    }
}

fn append(path: &Path, data: &[u8]) {
    let mut current = fs::read(path).unwrap_or_default();
    current.extend_from_slice(data);
    fs::write(path, current).unwrap();
}

/// Incremental `K`/`V` record
pub fn entry_record(key: &str, value: &str) -> Vec<u8> {
    let mut out = Vec::new();
    write_entry(&mut out, key, value.as_bytes());
    out
}

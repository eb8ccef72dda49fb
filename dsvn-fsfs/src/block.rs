//! Block reads for logically addressed revisions
//!
//! Reading one item pulls in the whole storage block around it. Every item
//! that lies completely inside the block is decoded and put into its cache,
//! so that neighbouring node-revisions, change lists and small
//! representations are served without further I/O. A neighbour that fails
//! its checksum or does not decode is left out of the block; only the
//! requested item's errors are returned.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use crate::cache::{RepKey, WindowKey};
use crate::chain::ReadContext;
use crate::changes::Change;
use crate::checksum::fnv1a_32x4;
use crate::container::{is_container_header, RepsContainer};
use crate::error::{CorruptAt, FsError, Result};
use crate::ids::{ContainerId, Revnum};
use crate::index::{ItemType, P2lEntry};
use crate::noderev::{read_header_line, NodeRevision};
use crate::representation::{RepHeader, ENDREP};
use crate::window::CachedWindow;

/// What a block item turned out to be
#[derive(Debug, Clone)]
pub enum DecodedItem {
    NodeRev(Arc<NodeRevision>),
    Changes(Arc<Vec<Change>>),
    /// A representation; plain ones went to the combined cache, deltas had
    /// their windows cached
    Rep { header: RepHeader, windows: u64 },
    /// A representation container and its number of sub-items
    Container(usize),
    Unused,
}

#[derive(Debug, Clone)]
pub struct BlockItem {
    pub entry: P2lEntry,
    pub decoded: DecodedItem,
}

/// Items decoded from one block
#[derive(Debug, Clone)]
pub struct Block {
    pub items: Vec<BlockItem>,
    requested: usize,
}

impl Block {
    /// The item the read was issued for
    pub fn requested(&self) -> &BlockItem {
        &self.items[self.requested]
    }

    pub fn into_requested(mut self) -> BlockItem {
        self.items.swap_remove(self.requested)
    }
}

pub struct BlockReader<'a> {
    ctx: &'a ReadContext,
}

impl<'a> BlockReader<'a> {
    pub fn new(ctx: &'a ReadContext) -> Self {
        Self { ctx }
    }

    /// Whether block reads apply to items of `container`
    pub fn applies_to(&self, container: &ContainerId) -> bool {
        self.ctx.config.block_read && self.ctx.storage.format().is_logical() && !container.is_txn()
    }

    /// Read the block holding `item` of `rev`. `Ok(None)` when block reads
    /// are not available for it.
    pub fn read_block(&self, rev: Revnum, item: u64) -> Result<Option<Block>> {
        let container = ContainerId::Rev(rev);
        if !self.applies_to(&container) {
            return Ok(None);
        }

        let opened = self.ctx.storage.open_and_seek(&container, item, None)?;
        let mut file = opened.file.lock();
        let Some(p2l) = self.ctx.storage.item_locator().p2l_index(&mut file)? else {
            return Ok(None);
        };
        let requested = *p2l.entry_at(opened.offset).ok_or_else(|| {
            FsError::corrupt(format!("No P2L entry starts at offset {}", opened.offset))
                .located(&container, opened.offset)
        })?;

        let (block_start, block_end) = p2l.block_range(requested.offset, self.ctx.config.block_size);
        let start = block_start.min(requested.offset);
        let end = block_end.max(requested.end());
        let entries: Vec<P2lEntry> = p2l
            .entries_overlapping(start, end)
            .iter()
            .filter(|e| e.offset >= start && e.end() <= end)
            .copied()
            .collect();

        file.seek(start)?;
        let data = Bytes::from(file.read_vec(end - start)?);
        drop(file);
        trace!(
            "block read of r{} item {}: {} bytes, {} items",
            rev,
            item,
            data.len(),
            entries.len()
        );

        let mut items = Vec::with_capacity(entries.len());
        let mut requested_index = None;
        for entry in entries {
            let bytes = data.slice((entry.offset - start) as usize..(entry.end() - start) as usize);
            let is_requested = entry.offset == requested.offset;
            let decoded = match verify_item(&entry, &bytes).and_then(|()| self.decode(&entry, &bytes)) {
                Ok(decoded) => decoded,
                Err(e) if is_requested => return Err(e).corrupt_at(&ContainerId::Rev(entry.rev), entry.offset),
                Err(e) => {
                    debug!(
                        "skipping r{} item {} at offset {} in block read: {}",
                        entry.rev, entry.item, entry.offset, e
                    );
                    continue;
                }
            };
            if is_requested {
                requested_index = Some(items.len());
            }
            items.push(BlockItem { entry, decoded });
        }
        let requested = requested_index
            .ok_or_else(|| FsError::corrupt("Requested item missing from its block").located(&container, opened.offset))?;
        Ok(Some(Block { items, requested }))
    }

    fn decode(&self, entry: &P2lEntry, bytes: &Bytes) -> Result<DecodedItem> {
        let key = RepKey {
            rev: entry.rev,
            item: entry.item,
        };
        match entry.item_type {
            ItemType::Unused => Ok(DecodedItem::Unused),
            ItemType::NodeRev => {
                let node = Arc::new(NodeRevision::parse(&mut &bytes[..])?);
                self.ctx.caches.nodes.set(key, node.clone());
                Ok(DecodedItem::NodeRev(node))
            }
            ItemType::Changes => {
                let with_mergeinfo = self.ctx.storage.format().changes_have_mergeinfo();
                let changes = Arc::new(Change::parse_list(&mut &bytes[..], with_mergeinfo)?);
                self.ctx.caches.changes.set(entry.rev, changes.clone());
                Ok(DecodedItem::Changes(changes))
            }
            ItemType::FileRep | ItemType::DirRep | ItemType::FileProps | ItemType::DirProps | ItemType::AnyRep => {
                self.decode_rep(key, bytes)
            }
        }
    }

    fn decode_rep(&self, key: RepKey, bytes: &Bytes) -> Result<DecodedItem> {
        let mut cursor = &bytes[..];
        let line = read_header_line(&mut cursor)?;
        if is_container_header(&line) {
            let reps = RepsContainer::read_body(&line, &mut cursor)?;
            for item in reps.item_numbers() {
                let contents = reps.get(item)?;
                if contents.len() as u64 <= self.ctx.caches.max_combined_size() {
                    self.ctx.caches.combined.set(RepKey { rev: key.rev, item }, contents);
                }
            }
            return Ok(DecodedItem::Container(reps.len()));
        }
        let header = RepHeader::parse(line.as_bytes())?;
        let payload_start = bytes.len() - cursor.len();
        let payload_end = bytes
            .len()
            .checked_sub(ENDREP.len())
            .filter(|&end| end >= payload_start && &bytes[end..] == ENDREP)
            .ok_or_else(|| FsError::corrupt("Representation in block lacks its ENDREP marker"))?;
        let payload = bytes.slice(payload_start..payload_end);

        if !header.is_delta() {
            if payload.len() as u64 <= self.ctx.caches.max_combined_size() {
                self.ctx.caches.combined.set(key, payload);
            }
            return Ok(DecodedItem::Rep { header, windows: 0 });
        }

        let codec = &self.ctx.codec;
        let empty = codec.empty_delta_size() as usize;
        let magic: [u8; 4] = payload
            .get(..empty)
            .and_then(|magic| magic.try_into().ok())
            .ok_or_else(|| FsError::corrupt("Delta representation is too small"))?;
        let version = codec.read_header(&magic)?;

        let mut stream = &payload[empty..];
        let mut chunk = 0;
        while !stream.is_empty() {
            let window = codec.read_window(&mut stream, version)?;
            let end_offset = (payload.len() - stream.len()) as u64;
            self.ctx.caches.windows.set(
                WindowKey {
                    rev: key.rev,
                    item: key.item,
                    chunk,
                },
                Arc::new(CachedWindow { window, end_offset }),
            );
            chunk += 1;
        }
        Ok(DecodedItem::Rep { header, windows: chunk })
    }
}

/// Compare an item's bytes against the checksum its P2L entry records.
fn verify_item(entry: &P2lEntry, bytes: &[u8]) -> Result<()> {
    if entry.item_type == ItemType::Unused {
        return Ok(());
    }
    let actual = fnv1a_32x4(bytes);
    if actual != entry.fnv1_checksum {
        return Err(FsError::ChecksumMismatch {
            context: format!("item {} of r{}", entry.item, entry.rev),
            expected: format!("{:08x}", entry.fnv1_checksum),
            actual: format!("{:08x}", actual),
        });
    }
    Ok(())
}

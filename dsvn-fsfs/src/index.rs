//! Log-to-phys (L2P) and phys-to-log (P2L) indexes of logically addressed
//! revision and pack files (FSFS format 7)
//!
//! File layout:
//!
//! ```text
//! <items...> <L2P index> <P2L index> <footer> <footer-len byte>
//! footer = "<l2p-offset> <l2p-md5> <p2l-offset> <p2l-md5>"
//! ```
//!
//! Numbers are 7-bit groups, least significant first, with the high bit
//! marking continuation. Signed values are zigzag encoded.
//!
//! L2P stream:
//!
//! ```text
//! "L2P-INDEX\n" first-rev page-size rev-count page-count
//! page-count per revision
//! per page: byte-len entry-count
//! page data: per entry the signed difference of (offset + 1) to the
//!            previous entry of the page; zero means unused
//! ```
//!
//! P2L stream:
//!
//! ```text
//! "P2L-INDEX\n" first-rev file-size page-size page-count
//! per page: byte-len
//! page data: absolute offset of the first entry, then per entry:
//!            size, signed delta of (item * 8 + type), signed revision
//!            delta, FNV-1a checksum
//! ```
//!
//! P2L entries are contiguous; an entry is stored in the page it ends in.

use std::collections::BTreeMap;

use crate::checksum::Md5Digest;
use crate::error::{FsError, Result};
use crate::ids::Revnum;
use crate::representation::parse_number;

pub const L2P_MAGIC: &[u8] = b"L2P-INDEX\n";
pub const P2L_MAGIC: &[u8] = b"P2L-INDEX\n";

/// Item number of a revision's changes list
pub const ITEM_INDEX_CHANGES: u64 = 1;
/// Item number of a revision's root node-revision
pub const ITEM_INDEX_ROOT_NODE: u64 = 2;
/// First item number available for other items
pub const ITEM_INDEX_FIRST_USER: u64 = 3;

/// What a P2L entry holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    Unused,
    FileRep,
    DirRep,
    FileProps,
    DirProps,
    NodeRev,
    Changes,
    AnyRep,
}

impl ItemType {
    pub fn code(self) -> u64 {
        match self {
            ItemType::Unused => 0,
            ItemType::FileRep => 1,
            ItemType::DirRep => 2,
            ItemType::FileProps => 3,
            ItemType::DirProps => 4,
            ItemType::NodeRev => 5,
            ItemType::Changes => 6,
            ItemType::AnyRep => 7,
        }
    }

    /// Type held in the low three bits of a P2L compound value
    pub fn from_code(code: u64) -> Self {
        match code & 7 {
            0 => ItemType::Unused,
            1 => ItemType::FileRep,
            2 => ItemType::DirRep,
            3 => ItemType::FileProps,
            4 => ItemType::DirProps,
            5 => ItemType::NodeRev,
            6 => ItemType::Changes,
            _ => ItemType::AnyRep,
        }
    }

    /// Items that hold a stored representation
    pub fn is_rep(self) -> bool {
        matches!(
            self,
            ItemType::FileRep | ItemType::DirRep | ItemType::FileProps | ItemType::DirProps | ItemType::AnyRep
        )
    }
}

/// One item as seen by the P2L index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct P2lEntry {
    pub offset: u64,
    pub size: u64,
    pub item_type: ItemType,
    /// FNV-1a (4-way interleaved) checksum of the item's bytes
    pub fnv1_checksum: u32,
    pub rev: Revnum,
    pub item: u64,
}

impl P2lEntry {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Read an unsigned number, advancing `data`
pub(crate) fn read_uvarint(data: &mut &[u8]) -> Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let (&byte, rest) = data
            .split_first()
            .ok_or_else(|| FsError::corrupt("Index data ends inside a number"))?;
        *data = rest;
        if shift >= 64 || (shift == 63 && byte & 0x7e != 0) {
            return Err(FsError::corrupt("Index number overflows 64 bits"));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Undo the zigzag mapping of signed to unsigned numbers.
pub fn decode_int(value: u64) -> i64 {
    if value & 1 == 0 {
        (value >> 1) as i64
    } else {
        -((value >> 1) as i64) - 1
    }
}

fn read_int(data: &mut &[u8]) -> Result<i64> {
    read_uvarint(data).map(decode_int)
}

fn apply_delta(base: u64, delta: i64, what: &str) -> Result<u64> {
    base.checked_add_signed(delta)
        .ok_or_else(|| FsError::corrupt(format!("{} out of range in index", what)))
}

fn take<'a>(data: &mut &'a [u8], len: u64) -> Result<&'a [u8]> {
    let len = usize::try_from(len).map_err(|_| FsError::corrupt("Index page length overflow"))?;
    if len > data.len() {
        return Err(FsError::corrupt("Index page extends past the index stream"));
    }
    let (head, rest) = data.split_at(len);
    *data = rest;
    Ok(head)
}

fn expect_magic(data: &mut &[u8], magic: &[u8]) -> Result<()> {
    match data.strip_prefix(magic) {
        Some(rest) => {
            *data = rest;
            Ok(())
        }
        None => Err(FsError::corrupt(format!(
            "Index stream does not start with '{}'",
            String::from_utf8_lossy(magic).trim_end()
        ))),
    }
}

fn verify_md5(data: &[u8], expected: &Md5Digest, what: &str) -> Result<()> {
    let actual = Md5Digest::of(data);
    if actual != *expected {
        tracing::warn!("{} checksum mismatch", what);
        return Err(FsError::ChecksumMismatch {
            context: what.to_string(),
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

/// Decoded L2P index of one revision or pack file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2pIndex {
    pub first_rev: Revnum,
    pub page_size: u64,
    /// Per revision, per item number: absolute file offset
    revisions: Vec<Vec<Option<u64>>>,
}

impl L2pIndex {
    /// Decode a stream whose digest must equal `expected`.
    pub fn decode(data: &[u8], expected: &Md5Digest) -> Result<Self> {
        verify_md5(data, expected, "L2P index")?;
        let mut cursor = data;
        expect_magic(&mut cursor, L2P_MAGIC)?;
        let first_rev = read_uvarint(&mut cursor)?;
        let page_size = read_uvarint(&mut cursor)?;
        let rev_count = read_uvarint(&mut cursor)?;
        let page_count = read_uvarint(&mut cursor)?;
        if page_size == 0 {
            return Err(FsError::corrupt("L2P index page size is zero"));
        }
        if rev_count > data.len() as u64 || page_count > data.len() as u64 {
            return Err(FsError::corrupt("L2P index table sizes are implausible"));
        }

        let mut page_counts = Vec::with_capacity(rev_count as usize);
        for _ in 0..rev_count {
            page_counts.push(read_uvarint(&mut cursor)?);
        }
        if page_counts.iter().try_fold(0u64, |sum, &n| sum.checked_add(n)) != Some(page_count) {
            return Err(FsError::corrupt("L2P revision table does not match the page count"));
        }

        let mut pages = Vec::with_capacity(page_count as usize);
        for _ in 0..page_count {
            let byte_len = read_uvarint(&mut cursor)?;
            let entry_count = read_uvarint(&mut cursor)?;
            if entry_count > page_size {
                return Err(FsError::corrupt("L2P page holds more entries than the page size"));
            }
            pages.push((byte_len, entry_count));
        }

        let mut revisions = Vec::with_capacity(page_counts.len());
        let mut pages = pages.into_iter();
        for count in page_counts {
            let mut entries = Vec::new();
            for (byte_len, entry_count) in pages.by_ref().take(count as usize) {
                let mut page = take(&mut cursor, byte_len)?;
                let mut last = 0u64;
                for _ in 0..entry_count {
                    let value = apply_delta(last, read_int(&mut page)?, "L2P offset")?;
                    last = value;
                    entries.push(value.checked_sub(1));
                }
                if !page.is_empty() {
                    return Err(FsError::corrupt("L2P page has trailing data"));
                }
            }
            revisions.push(entries);
        }
        if !cursor.is_empty() {
            return Err(FsError::corrupt("L2P index has trailing data"));
        }

        Ok(Self {
            first_rev,
            page_size,
            revisions,
        })
    }

    pub fn rev_count(&self) -> u64 {
        self.revisions.len() as u64
    }

    /// File offset of item number `item` of `rev`.
    pub fn lookup(&self, rev: Revnum, item: u64) -> Result<u64> {
        let entries = rev
            .checked_sub(self.first_rev)
            .and_then(|rel| self.revisions.get(rel as usize))
            .ok_or_else(|| FsError::corrupt(format!("Revision {} is not covered by this L2P index", rev)))?;
        entries
            .get(item as usize)
            .copied()
            .flatten()
            .ok_or_else(|| FsError::corrupt(format!("Item {} of r{} is not in the L2P index", item, rev)))
    }

    pub fn weight(&self) -> usize {
        self.revisions.iter().map(|r| r.len() * 16 + 24).sum::<usize>() + 64
    }
}

/// Decoded P2L index of one revision or pack file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2lIndex {
    pub first_rev: Revnum,
    /// Bytes of item data covered by the index
    pub covered_len: u64,
    pub page_size: u64,
    entries: Vec<P2lEntry>,
}

impl P2lIndex {
    pub fn decode(data: &[u8], expected: &Md5Digest) -> Result<Self> {
        verify_md5(data, expected, "P2L index")?;
        let mut cursor = data;
        expect_magic(&mut cursor, P2L_MAGIC)?;
        let first_rev = read_uvarint(&mut cursor)?;
        let covered_len = read_uvarint(&mut cursor)?;
        let page_size = read_uvarint(&mut cursor)?;
        let page_count = read_uvarint(&mut cursor)?;
        if page_size == 0 {
            return Err(FsError::corrupt("P2L page size is zero"));
        }
        if page_count > data.len() as u64 {
            return Err(FsError::corrupt("P2L page count is implausible"));
        }
        let limit = page_count
            .checked_mul(page_size)
            .filter(|&limit| limit >= covered_len)
            .ok_or_else(|| FsError::corrupt("P2L pages do not cover the file"))?;

        let mut page_lens = Vec::with_capacity(page_count as usize);
        for _ in 0..page_count {
            page_lens.push(read_uvarint(&mut cursor)?);
        }

        let mut by_offset: BTreeMap<u64, P2lEntry> = BTreeMap::new();
        for len in page_lens {
            let mut page = take(&mut cursor, len)?;
            if page.is_empty() {
                continue;
            }
            let mut offset = read_uvarint(&mut page)?;
            let mut last_rev = first_rev;
            let mut last_compound = 0u64;
            while !page.is_empty() {
                let size = read_uvarint(&mut page)?;
                last_compound = apply_delta(last_compound, read_int(&mut page)?, "P2L item number")?;
                last_rev = apply_delta(last_rev, read_int(&mut page)?, "P2L revision")?;
                let fnv1_checksum = u32::try_from(read_uvarint(&mut page)?)
                    .map_err(|_| FsError::corrupt("P2L checksum exceeds 32 bits"))?;
                let entry = P2lEntry {
                    offset,
                    size,
                    item_type: ItemType::from_code(last_compound),
                    fnv1_checksum,
                    rev: last_rev,
                    item: last_compound >> 3,
                };
                offset = offset
                    .checked_add(size)
                    .filter(|&end| end <= limit)
                    .ok_or_else(|| FsError::corrupt("P2L entry extends past the indexed pages"))?;
                if let Some(existing) = by_offset.insert(entry.offset, entry) {
                    if existing != entry {
                        return Err(FsError::corrupt(format!(
                            "P2L pages disagree about the item at offset {}",
                            entry.offset
                        )));
                    }
                }
            }
        }
        if !cursor.is_empty() {
            return Err(FsError::corrupt("P2L index has trailing data"));
        }

        let entries: Vec<P2lEntry> = by_offset.into_values().collect();
        let mut end = 0;
        for entry in &entries {
            if entry.offset < end {
                return Err(FsError::corrupt(format!("P2L entries overlap at offset {}", entry.offset)));
            }
            end = entry.end();
        }

        Ok(Self {
            first_rev,
            covered_len,
            page_size,
            entries,
        })
    }

    pub fn entries(&self) -> &[P2lEntry] {
        &self.entries
    }

    /// The item starting exactly at `offset`
    pub fn entry_at(&self, offset: u64) -> Option<&P2lEntry> {
        self.entries
            .binary_search_by_key(&offset, |e| e.offset)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Byte range `[start, end)` of the block containing `offset`, clamped
    /// to the covered data
    pub fn block_range(&self, offset: u64, block_size: u64) -> (u64, u64) {
        let start = offset - offset % block_size;
        (start, (start + block_size).min(self.covered_len))
    }

    /// Entries overlapping `[start, end)`, in file order
    pub fn entries_overlapping(&self, start: u64, end: u64) -> &[P2lEntry] {
        let first = self.entries.partition_point(|e| e.end() <= start);
        let last = self.entries.partition_point(|e| e.offset < end);
        &self.entries[first..last.max(first)]
    }

    pub fn weight(&self) -> usize {
        self.entries.len() * std::mem::size_of::<P2lEntry>() + 64
    }
}

/// Location and digests of both index streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub l2p_offset: u64,
    pub l2p_md5: Md5Digest,
    pub p2l_offset: u64,
    pub p2l_md5: Md5Digest,
}

impl Footer {
    /// Parse the footer text (without the trailing length byte). `footer_start`
    /// is where the footer begins in the file.
    pub fn parse(text: &[u8], footer_start: u64) -> Result<Self> {
        let malformed = || {
            FsError::corrupt(format!(
                "Malformed index footer '{}'",
                String::from_utf8_lossy(text)
            ))
        };
        let text = std::str::from_utf8(text).map_err(|_| malformed())?;
        let tokens: Vec<&str> = text.split(' ').collect();
        let [l2p_offset, l2p_md5, p2l_offset, p2l_md5] = tokens.as_slice() else {
            return Err(malformed());
        };
        let footer = Footer {
            l2p_offset: parse_number(l2p_offset).ok_or_else(malformed)?,
            l2p_md5: Md5Digest::from_hex(l2p_md5)?,
            p2l_offset: parse_number(p2l_offset).ok_or_else(malformed)?,
            p2l_md5: Md5Digest::from_hex(p2l_md5)?,
        };
        if footer.l2p_offset > footer.p2l_offset || footer.p2l_offset > footer_start {
            return Err(FsError::corrupt("Index footer offsets are out of order"));
        }
        Ok(footer)
    }
}

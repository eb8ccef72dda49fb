//! Writers for the format 7 index streams, the index footer and
//! representation containers

use dsvn_fsfs::checksum::Md5Digest;
use dsvn_fsfs::index::{ItemType, P2lEntry, L2P_MAGIC, P2L_MAGIC};
use dsvn_fsfs::Revnum;

pub fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value & 0x7f) as u8 | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Zigzag-encoded signed number
pub fn write_int(out: &mut Vec<u8>, value: i64) {
    let zigzag = if value < 0 {
        (value.unsigned_abs() << 1) - 1
    } else {
        (value as u64) << 1
    };
    write_uvarint(out, zigzag);
}

/// Builds an L2P stream, one revision at a time
#[derive(Debug, Clone)]
pub struct L2pWriter {
    first_rev: Revnum,
    page_size: u64,
    revisions: Vec<Vec<Option<u64>>>,
}

impl L2pWriter {
    pub fn new(first_rev: Revnum, page_size: u64) -> Self {
        Self {
            first_rev,
            page_size,
            revisions: Vec::new(),
        }
    }

    pub fn begin_revision(&mut self) {
        self.revisions.push(Vec::new());
    }

    /// Map `item` of the current revision to `offset`.
    pub fn set(&mut self, item: u64, offset: u64) {
        let entries = self.revisions.last_mut().expect("begin_revision first");
        let idx = item as usize;
        if entries.len() <= idx {
            entries.resize(idx + 1, None);
        }
        entries[idx] = Some(offset);
    }

    pub fn encode(&self) -> Vec<u8> {
        let page_size = self.page_size as usize;
        let mut page_counts = Vec::new();
        let mut table = Vec::new();
        let mut data = Vec::new();
        for entries in &self.revisions {
            page_counts.push(entries.chunks(page_size).count() as u64);
            for page in entries.chunks(page_size) {
                let mut bytes = Vec::new();
                let mut last = 0i64;
                for entry in page {
                    let value = entry.map_or(0, |offset| offset as i64 + 1);
                    write_int(&mut bytes, value - last);
                    last = value;
                }
                write_uvarint(&mut table, bytes.len() as u64);
                write_uvarint(&mut table, page.len() as u64);
                data.extend_from_slice(&bytes);
            }
        }

        let mut out = L2P_MAGIC.to_vec();
        write_uvarint(&mut out, self.first_rev);
        write_uvarint(&mut out, self.page_size);
        write_uvarint(&mut out, page_counts.len() as u64);
        write_uvarint(&mut out, page_counts.iter().sum());
        for count in page_counts {
            write_uvarint(&mut out, count);
        }
        out.extend_from_slice(&table);
        out.extend_from_slice(&data);
        out
    }
}

/// Builds a P2L stream
#[derive(Debug, Clone)]
pub struct P2lWriter {
    first_rev: Revnum,
    page_size: u64,
    entries: Vec<P2lEntry>,
}

impl P2lWriter {
    pub fn new(first_rev: Revnum, page_size: u64) -> Self {
        Self {
            first_rev,
            page_size,
            entries: Vec::new(),
        }
    }

    pub fn add(&mut self, entry: P2lEntry) {
        self.entries.push(entry);
    }

    fn unused(&self, offset: u64, size: u64) -> P2lEntry {
        P2lEntry {
            offset,
            size,
            item_type: ItemType::Unused,
            fnv1_checksum: 0,
            rev: self.first_rev,
            item: 0,
        }
    }

    /// Entries covering `[0, covered_len)` without gaps, padded to a page
    /// boundary with an unused entry
    fn contiguous(&self, covered_len: u64) -> Vec<P2lEntry> {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|e| e.offset);
        let mut out = Vec::new();
        let mut end = 0;
        for entry in entries {
            if entry.offset > end {
                out.push(self.unused(end, entry.offset - end));
            }
            end = entry.end();
            out.push(entry);
        }
        let padded = covered_len.max(end).div_ceil(self.page_size).max(1) * self.page_size;
        if padded > end {
            out.push(self.unused(end, padded - end));
        }
        out
    }

    /// Encode for a file whose item data ends at `covered_len`. Every entry
    /// goes into the page it ends in.
    pub fn encode(&self, covered_len: u64) -> Vec<u8> {
        let mut pages: Vec<Vec<u8>> = vec![Vec::new()];
        let mut page_end = self.page_size;
        let mut new_page = true;
        let mut last_rev = self.first_rev;
        let mut last_compound = 0u64;
        for entry in self.contiguous(covered_len) {
            while entry.end() > page_end {
                pages.push(Vec::new());
                page_end += self.page_size;
                new_page = true;
            }
            let page = pages.last_mut().unwrap();
            if new_page {
                write_uvarint(page, entry.offset);
                last_rev = self.first_rev;
                last_compound = 0;
                new_page = false;
            }
            let compound = entry.item * 8 + entry.item_type.code();
            write_uvarint(page, entry.size);
            write_int(page, compound as i64 - last_compound as i64);
            write_int(page, entry.rev as i64 - last_rev as i64);
            write_uvarint(page, u64::from(entry.fnv1_checksum));
            last_compound = compound;
            last_rev = entry.rev;
        }

        let mut out = P2L_MAGIC.to_vec();
        write_uvarint(&mut out, self.first_rev);
        write_uvarint(&mut out, covered_len);
        write_uvarint(&mut out, self.page_size);
        write_uvarint(&mut out, pages.len() as u64);
        for page in &pages {
            write_uvarint(&mut out, page.len() as u64);
        }
        for page in pages {
            out.extend_from_slice(&page);
        }
        out
    }
}

/// Append both indexes and the footer to a file holding item data only.
pub fn append_indexes(file: &mut Vec<u8>, l2p: &L2pWriter, p2l: &P2lWriter) {
    let covered_len = file.len() as u64;
    let l2p_bytes = l2p.encode();
    let p2l_bytes = p2l.encode(covered_len);
    let footer = format!(
        "{} {} {} {}",
        covered_len,
        Md5Digest::of(&l2p_bytes),
        covered_len + l2p_bytes.len() as u64,
        Md5Digest::of(&p2l_bytes)
    );
    file.extend_from_slice(&l2p_bytes);
    file.extend_from_slice(&p2l_bytes);
    file.extend_from_slice(footer.as_bytes());
    file.push(footer.len() as u8);
}

/// A complete container item holding `items` (item number, contents).
pub fn encode_container(items: &[(u64, &[u8])]) -> Vec<u8> {
    let mut raw = Vec::new();
    for (item, data) in items {
        write_uvarint(&mut raw, *item);
        write_uvarint(&mut raw, data.len() as u64);
    }
    for (_, data) in items {
        raw.extend_from_slice(data);
    }
    let packed = zstd::encode_all(&raw[..], 3).unwrap();
    let mut out = format!("CONTAINER {} {} {}\n", items.len(), packed.len(), raw.len()).into_bytes();
    out.extend_from_slice(&packed);
    out
}

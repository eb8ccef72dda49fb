//! Representation containers
//!
//! An extension of logically addressed revisions: several small plain
//! representations packed into one item. Each packed representation keeps
//! its own item number. The L2P index maps all of them to the container's
//! offset and the container lists which item numbers it holds.
//!
//! ```text
//! CONTAINER <count> <packed-len> <expanded-len>\n
//! <zstd frame expanding to expanded-len bytes:
//!  per sub-item its item number and length, then the concatenated bytes>
//! ```
//!
//! Numbers inside the frame use the index encoding (7-bit groups, least
//! significant first).

use std::io::{BufRead, Read};

use bytes::Bytes;

use crate::error::{FsError, Result};
use crate::index::read_uvarint;
use crate::noderev::read_header_line;
use crate::representation::parse_number;

pub const CONTAINER_TAG: &str = "CONTAINER";

/// Largest packed or expanded frame accepted before the item is declared
/// corrupt
const MAX_FRAME_LEN: u64 = 256 * 1024 * 1024;

/// Whether a header line opens a container rather than a representation
pub fn is_container_header(line: &str) -> bool {
    line.split(' ').next() == Some(CONTAINER_TAG)
}

/// Decoded container; sub-items share one buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepsContainer {
    items: Vec<(u64, Bytes)>,
}

impl RepsContainer {
    /// Read a container item from its first byte.
    pub fn read<R: BufRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let line = read_header_line(reader)?;
        Self::read_body(&line, reader)
    }

    /// Read the frame following an already consumed `header` line.
    pub fn read_body<R: Read + ?Sized>(header: &str, reader: &mut R) -> Result<Self> {
        let malformed = || FsError::corrupt(format!("Malformed container header '{}'", header));
        let tokens: Vec<&str> = header.split(' ').collect();
        let ["CONTAINER", count, packed_len, expanded_len] = tokens.as_slice() else {
            return Err(malformed());
        };
        let count = parse_number(count).ok_or_else(malformed)?;
        let packed_len = parse_number(packed_len)
            .filter(|&len| len <= MAX_FRAME_LEN)
            .ok_or_else(malformed)?;
        let expanded_len = parse_number(expanded_len)
            .filter(|&len| len <= MAX_FRAME_LEN)
            .ok_or_else(malformed)?;

        let mut packed = vec![0u8; packed_len as usize];
        reader.read_exact(&mut packed).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                FsError::corrupt("Container data is truncated")
            } else {
                FsError::io("reading container", "", e)
            }
        })?;

        let data = zstd::bulk::decompress(&packed, expanded_len as usize)
            .map_err(|e| FsError::corrupt(format!("Failed to decompress container: {}", e)))?;
        if data.len() as u64 != expanded_len {
            return Err(FsError::corrupt(format!(
                "Container expands to {} bytes instead of {}",
                data.len(),
                expanded_len
            )));
        }
        Self::unpack(Bytes::from(data), count)
    }

    fn unpack(data: Bytes, count: u64) -> Result<Self> {
        let mut cursor = &data[..];
        if count > cursor.len() as u64 {
            return Err(FsError::corrupt("Container sub-item count is implausible"));
        }
        let mut table = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let item = read_uvarint(&mut cursor)?;
            let len = read_uvarint(&mut cursor)?;
            table.push((item, len));
        }

        let mut pos = data.len() - cursor.len();
        let mut items = Vec::with_capacity(table.len());
        for (item, len) in table {
            let end = usize::try_from(len)
                .ok()
                .and_then(|len| pos.checked_add(len))
                .filter(|&end| end <= data.len())
                .ok_or_else(|| FsError::corrupt("Container sub-item extends past its data"))?;
            if items.iter().any(|(existing, _)| *existing == item) {
                return Err(FsError::corrupt(format!("Container lists item {} twice", item)));
            }
            items.push((item, data.slice(pos..end)));
            pos = end;
        }
        if pos != data.len() {
            return Err(FsError::corrupt("Container has trailing data"));
        }
        Ok(Self { items })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Item numbers held, in storage order
    pub fn item_numbers(&self) -> impl Iterator<Item = u64> + '_ {
        self.items.iter().map(|(item, _)| *item)
    }

    /// Contents of the representation stored as `item`
    pub fn get(&self, item: u64) -> Result<Bytes> {
        self.items
            .iter()
            .find(|(number, _)| *number == item)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| FsError::corrupt(format!("Container does not hold item {}", item)))
    }
}

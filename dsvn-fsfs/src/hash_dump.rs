//! Hash-dump encoding used by directory and property representations
//!
//! ```text
//! K 5
//! trunk
//! V 18
//! dir 1.0.r1/120
//! END
//! ```
//!
//! Transaction node files use the incremental form: no `END`, and
//! `D <len>\n<key>\n` removes an earlier key.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{FsError, Result};
use crate::ids::{NodeKind, NodeRevId};
use crate::representation::parse_number;

/// Property name to raw value
pub type PropertyList = BTreeMap<String, Vec<u8>>;

/// One directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
    pub id: NodeRevId,
}

/// Sorted by name
pub type DirectoryEntries = Arc<Vec<DirEntry>>;

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn line(&mut self) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| FsError::corrupt("Unterminated line in hash dump"))?;
        self.pos += end + 1;
        Ok(&rest[..end])
    }

    fn counted(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end < self.data.len() && self.data[end] == b'\n')
            .ok_or_else(|| FsError::corrupt("Hash dump entry length does not match its data"))?;
        let value = &self.data[self.pos..end];
        self.pos = end + 1;
        Ok(value)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }
}

fn length_line(line: &[u8], tag: &str) -> Option<usize> {
    let text = std::str::from_utf8(line).ok()?;
    let len = text.strip_prefix(tag)?.strip_prefix(' ')?;
    parse_number(len).and_then(|len| usize::try_from(len).ok())
}

fn key_string(key: &[u8]) -> Result<String> {
    String::from_utf8(key.to_vec()).map_err(|_| FsError::corrupt("Hash dump key is not valid UTF-8"))
}

fn parse_entries(data: &[u8], incremental: bool) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut cursor = Cursor { data, pos: 0 };
    let mut map = BTreeMap::new();
    loop {
        if incremental && cursor.at_end() {
            return Ok(map);
        }
        let line = cursor.line()?;
        if line == b"END" {
            return Ok(map);
        }
        if let Some(len) = length_line(line, "K") {
            let key = key_string(cursor.counted(len)?)?;
            let value_line = cursor.line()?;
            let value_len = length_line(value_line, "V")
                .ok_or_else(|| FsError::corrupt("Hash dump key without value"))?;
            let value = cursor.counted(value_len)?;
            map.insert(key, value.to_vec());
        } else if let (true, Some(len)) = (incremental, length_line(line, "D")) {
            let key = key_string(cursor.counted(len)?)?;
            map.remove(&key);
        } else {
            return Err(FsError::corrupt(format!(
                "Malformed hash dump line '{}'",
                String::from_utf8_lossy(line)
            )));
        }
    }
}

/// Parse an `END`-terminated dump
pub fn parse_hash(data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    parse_entries(data, false)
}

/// Parse an incremental dump, applying deletions in order
pub fn parse_incremental(data: &[u8]) -> Result<BTreeMap<String, Vec<u8>>> {
    parse_entries(data, true)
}

/// Serialize entries with the `END` terminator
pub fn write_hash<'a, I>(entries: I) -> Vec<u8>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let mut out = Vec::new();
    for (key, value) in entries {
        write_entry(&mut out, key, value);
    }
    out.extend_from_slice(b"END\n");
    out
}

/// One `K`/`V` pair, as appended to transaction node files
pub fn write_entry(out: &mut Vec<u8>, key: &str, value: &[u8]) {
    out.extend_from_slice(format!("K {}\n{}\nV {}\n", key.len(), key, value.len()).as_bytes());
    out.extend_from_slice(value);
    out.push(b'\n');
}

/// One incremental deletion
pub fn write_delete(out: &mut Vec<u8>, key: &str) {
    out.extend_from_slice(format!("D {}\n{}\n", key.len(), key).as_bytes());
}

/// Decode directory values (`<kind> <node-rev-id>`)
pub fn dir_entries_from_hash(map: BTreeMap<String, Vec<u8>>) -> Result<Vec<DirEntry>> {
    map.into_iter()
        .map(|(name, value)| {
            let value = String::from_utf8(value)
                .map_err(|_| FsError::corrupt(format!("Directory entry '{}' is not UTF-8", name)))?;
            let (kind, id) = value.split_once(' ').ok_or_else(|| {
                FsError::corrupt(format!("Directory entry '{}' has malformed value '{}'", name, value))
            })?;
            Ok(DirEntry {
                kind: kind.parse()?,
                id: id.parse()?,
                name,
            })
        })
        .collect()
}

/// Encode directory entries as a complete dump
pub fn write_dir_entries(entries: &[DirEntry]) -> Vec<u8> {
    let values: Vec<(String, String)> = entries
        .iter()
        .map(|entry| (entry.name.clone(), format!("{} {}", entry.kind, entry.id)))
        .collect();
    write_hash(values.iter().map(|(name, value)| (name.as_str(), value.as_bytes())))
}

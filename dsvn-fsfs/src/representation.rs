//! Representation locators and representation headers
//!
//! A locator is the `text:` / `props:` value of a node-revision:
//!
//! ```text
//! <rev|-1> <item> <size> <expanded-size> <md5> [<sha1> [<uniquifier>]]
//! ```
//!
//! A header is the first line of the stored bytes:
//!
//! ```text
//! PLAIN
//! DELTA
//! DELTA <base-rev> <base-item> <base-size>
//! ```

use std::fmt;

use crate::checksum::{Md5Digest, Sha1Digest};
use crate::error::{FsError, Result};
use crate::ids::{ContainerId, Revnum, TxnId};

/// Size of the svndiff stream header; a delta of exactly this size has no
/// windows and therefore expands to nothing.
pub const EMPTY_DELTA_SIZE: u64 = 4;

/// Terminator written after every stored representation
pub const ENDREP: &[u8] = b"ENDREP\n";

/// One stored blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Representation {
    pub container: ContainerId,
    /// Byte offset (physical addressing) or item index (logical addressing)
    pub item: u64,
    /// Bytes stored on disk, excluding header line and `ENDREP`
    pub size: u64,
    /// Decoded length; zero means "not recorded" in older formats
    pub expanded_size: u64,
    pub md5: Md5Digest,
    pub sha1: Option<Sha1Digest>,
    /// `<txn-id>/<number>`, only written together with a SHA-1
    pub uniquifier: Option<String>,
}

/// A node-revision's reference to its text or property representation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepRef {
    /// Stored representation, committed or in a proto-revision file
    Stored(Representation),
    /// Bare `-1`: the contents live in the transaction's node files
    Mutable(TxnId),
}

impl Representation {
    /// Parse a locator. `txn` is the transaction of the owning node-revision;
    /// it is required when the revision field is `-1`.
    pub fn parse(text: &str, txn: Option<&TxnId>) -> Result<Self> {
        let malformed = |what: &str| {
            FsError::corrupt(format!("Malformed representation locator '{}': {}", text, what))
        };

        let fields: Vec<&str> = text.split(' ').collect();
        if fields.len() < 5 || fields.len() > 7 {
            return Err(malformed("wrong number of fields"));
        }

        let container = if fields[0] == "-1" {
            match txn {
                Some(txn) => ContainerId::Txn(txn.clone()),
                None => return Err(malformed("transaction representation outside a transaction")),
            }
        } else {
            ContainerId::Rev(parse_number(fields[0]).ok_or_else(|| malformed("bad revision"))?)
        };

        let item = parse_number(fields[1]).ok_or_else(|| malformed("bad item address"))?;
        let size = parse_number(fields[2]).ok_or_else(|| malformed("bad size"))?;
        let expanded_size = parse_number(fields[3]).ok_or_else(|| malformed("bad expanded size"))?;
        let md5 = Md5Digest::from_hex(fields[4])?;
        let sha1 = match fields.get(5) {
            Some(hex_str) => Some(Sha1Digest::from_hex(hex_str)?),
            None => None,
        };
        let uniquifier = match fields.get(6) {
            Some(uniq) if uniq.is_empty() => return Err(malformed("empty uniquifier")),
            Some(uniq) => Some(uniq.to_string()),
            None => None,
        };

        Ok(Self {
            container,
            item,
            size,
            expanded_size,
            md5,
            sha1,
            uniquifier,
        })
    }

    pub fn revision(&self) -> Option<Revnum> {
        self.container.revision()
    }

    /// Whether this and `other` are the same stored bytes
    pub fn same_location(&self, other: &Representation) -> bool {
        self.container == other.container && self.item == other.item
    }
}

impl fmt::Display for Representation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container {
            ContainerId::Rev(rev) => write!(f, "{}", rev)?,
            ContainerId::Txn(_) => f.write_str("-1")?,
        }
        write!(
            f,
            " {} {} {} {}",
            self.item, self.size, self.expanded_size, self.md5
        )?;
        if let Some(sha1) = &self.sha1 {
            write!(f, " {}", sha1)?;
            if let Some(uniq) = &self.uniquifier {
                write!(f, " {}", uniq)?;
            }
        }
        Ok(())
    }
}

impl RepRef {
    pub fn parse(text: &str, txn: Option<&TxnId>) -> Result<Self> {
        if text == "-1" {
            return match txn {
                Some(txn) => Ok(RepRef::Mutable(txn.clone())),
                None => Err(FsError::corrupt(
                    "Mutable representation referenced outside a transaction",
                )),
            };
        }
        Representation::parse(text, txn).map(RepRef::Stored)
    }

    pub fn stored(&self) -> Option<&Representation> {
        match self {
            RepRef::Stored(rep) => Some(rep),
            RepRef::Mutable(_) => None,
        }
    }
}

impl fmt::Display for RepRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepRef::Stored(rep) => rep.fmt(f),
            RepRef::Mutable(_) => f.write_str("-1"),
        }
    }
}

/// Decoded first line of a stored representation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepHeader {
    Plain,
    SelfDelta,
    Delta {
        base_rev: Revnum,
        base_item: u64,
        base_size: u64,
    },
}

impl RepHeader {
    /// Parse a header line without its trailing newline.
    pub fn parse(line: &[u8]) -> Result<Self> {
        let malformed = || {
            FsError::corrupt(format!(
                "Malformed representation header '{}'",
                String::from_utf8_lossy(line)
            ))
        };

        let text = std::str::from_utf8(line).map_err(|_| malformed())?;
        let tokens: Vec<&str> = text.split(' ').collect();
        match tokens.as_slice() {
            ["PLAIN"] => Ok(RepHeader::Plain),
            ["DELTA"] => Ok(RepHeader::SelfDelta),
            ["DELTA", rev, item, size] => Ok(RepHeader::Delta {
                base_rev: parse_number(rev).ok_or_else(malformed)?,
                base_item: parse_number(item).ok_or_else(malformed)?,
                base_size: parse_number(size).ok_or_else(malformed)?,
            }),
            _ => Err(malformed()),
        }
    }

    /// The header line including its newline
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }

    pub fn is_delta(&self) -> bool {
        !matches!(self, RepHeader::Plain)
    }
}

impl fmt::Display for RepHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepHeader::Plain => f.write_str("PLAIN"),
            RepHeader::SelfDelta => f.write_str("DELTA"),
            RepHeader::Delta {
                base_rev,
                base_item,
                base_size,
            } => write!(f, "DELTA {} {} {}", base_rev, base_item, base_size),
        }
    }
}

/// Strict decimal: digits only, no sign, no whitespace
pub(crate) fn parse_number(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

//! Repository format file (`db/format`)
//!
//! ```text
//! 7
//! layout sharded 1000
//! addressing logical
//! ```

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::{FsError, Result};
use crate::representation::parse_number;

pub const MIN_FORMAT: u32 = 1;
pub const MAX_FORMAT: u32 = 8;

/// How item addresses inside a revision are interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Item addresses are byte offsets
    Physical,
    /// Item addresses are indexes resolved through L2P/P2L
    Logical,
}

/// Parsed `db/format`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsFormat {
    pub number: u32,
    /// Revisions per shard; `None` for the linear layout
    pub shard_size: Option<u64>,
    pub addressing: Addressing,
}

impl FsFormat {
    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| FsError::io("reading format file", path, e))?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();
        let first = lines.next().unwrap_or("").trim();
        let number = parse_number(first)
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| FsError::corrupt(format!("Format file has malformed first line '{}'", first)))?;
        if !(MIN_FORMAT..=MAX_FORMAT).contains(&number) {
            return Err(FsError::Unsupported(format!("filesystem format {}", number)));
        }

        let mut format = FsFormat {
            number,
            shard_size: None,
            addressing: Addressing::Physical,
        };
        for line in lines {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.as_slice() {
                [] => {}
                ["layout", "linear"] => format.shard_size = None,
                ["layout", "sharded", size] => {
                    let size = parse_number(size)
                        .filter(|&size| size > 0)
                        .ok_or_else(|| FsError::corrupt(format!("Invalid shard size in '{}'", line)))?;
                    format.shard_size = Some(size);
                }
                ["addressing", mode] if number >= 7 => {
                    format.addressing = match *mode {
                        "physical" => Addressing::Physical,
                        "logical" => Addressing::Logical,
                        other => {
                            return Err(FsError::corrupt(format!("Unknown addressing mode '{}'", other)))
                        }
                    };
                }
                _ => {
                    return Err(FsError::corrupt(format!(
                        "Unrecognized option '{}' in format file",
                        line
                    )))
                }
            }
        }
        Ok(format)
    }

    pub fn to_file_contents(&self) -> String {
        let mut out = format!("{}\n", self.number);
        if self.number >= 3 {
            match self.shard_size {
                Some(size) => {
                    let _ = writeln!(out, "layout sharded {}", size);
                }
                None => out.push_str("layout linear\n"),
            }
        }
        if self.number >= 7 {
            let mode = match self.addressing {
                Addressing::Physical => "physical",
                Addressing::Logical => "logical",
            };
            let _ = writeln!(out, "addressing {}", mode);
        }
        out
    }

    pub fn is_logical(&self) -> bool {
        self.addressing == Addressing::Logical
    }

    /// Proto-revision files live in `db/txn-protorevs`.
    pub fn has_protorevs_dir(&self) -> bool {
        self.number >= 3
    }

    /// Packing (and `db/min-unpacked-rev`) exists.
    pub fn supports_packing(&self) -> bool {
        self.number >= 4 && self.shard_size.is_some()
    }

    /// Change records carry the mergeinfo-mod flag.
    pub fn changes_have_mergeinfo(&self) -> bool {
        self.number >= 7
    }
}

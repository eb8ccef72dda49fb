//! Changed-path records
//!
//! Each record is two lines:
//!
//! ```text
//! <node-rev-id> <action>[-<kind>] <text-mod> <prop-mod> [<mergeinfo-mod>] <path>
//! [<copyfrom-rev> <copyfrom-path>]
//! ```
//!
//! The second line is empty when there is no copy source. A blank first
//! line (or EOF) ends the list.

use std::fmt::{self, Write as _};
use std::io::BufRead;

use crate::error::{FsError, Result};
use crate::ids::{NodeKind, NodeRevId, Revnum};
use crate::noderev::read_header_line;
use crate::representation::parse_number;

/// What happened to a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modify,
    Add,
    Delete,
    Replace,
    Reset,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Modify => "modify",
            ChangeKind::Add => "add",
            ChangeKind::Delete => "delete",
            ChangeKind::Replace => "replace",
            ChangeKind::Reset => "reset",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "modify" => Some(ChangeKind::Modify),
            "add" => Some(ChangeKind::Add),
            "delete" => Some(ChangeKind::Delete),
            "replace" => Some(ChangeKind::Replace),
            "reset" => Some(ChangeKind::Reset),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One changed-path record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub node_rev_id: NodeRevId,
    pub kind: ChangeKind,
    pub node_kind: Option<NodeKind>,
    pub text_mod: bool,
    pub prop_mod: bool,
    /// Only recorded by format 7 and later
    pub mergeinfo_mod: Option<bool>,
    pub path: String,
    pub copyfrom: Option<(Revnum, String)>,
}

fn parse_flag(s: &str, what: &str) -> Result<bool> {
    match s {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(FsError::corrupt(format!("Invalid {} flag '{}' in changes line", what, other))),
    }
}

fn flag(value: bool) -> &'static str {
    if value { "true" } else { "false" }
}

impl Change {
    /// Parse the next record; `Ok(None)` at the end of the list.
    /// `with_mergeinfo_flag` selects the format 7 layout.
    pub fn parse<R: BufRead + ?Sized>(reader: &mut R, with_mergeinfo_flag: bool) -> Result<Option<Self>> {
        let next = reader
            .fill_buf()
            .map_err(|e| FsError::io("reading changes", "", e))?
            .first()
            .copied();
        match next {
            None => return Ok(None),
            Some(b'\n') => {
                reader.consume(1);
                return Ok(None);
            }
            Some(_) => {}
        }

        let line = read_header_line(reader)?;
        let malformed = |why: &str| FsError::corrupt(format!("Invalid changes line '{}': {}", line, why));

        let flag_count = if with_mergeinfo_flag { 3 } else { 2 };
        let mut tokens = line.splitn(3 + flag_count, ' ');
        let id = tokens.next().ok_or_else(|| malformed("missing node id"))?;
        let node_rev_id: NodeRevId = id.parse().map_err(|_| malformed("bad node id"))?;

        let action = tokens.next().ok_or_else(|| malformed("missing change kind"))?;
        let (kind, node_kind) = match action.split_once('-') {
            Some((kind, node_kind)) => (kind, Some(node_kind.parse::<NodeKind>()?)),
            None => (action, None),
        };
        let kind = ChangeKind::parse(kind).ok_or_else(|| malformed("unknown change kind"))?;

        let text_mod = parse_flag(tokens.next().ok_or_else(|| malformed("missing text-mod flag"))?, "text-mod")?;
        let prop_mod = parse_flag(tokens.next().ok_or_else(|| malformed("missing prop-mod flag"))?, "prop-mod")?;
        let mergeinfo_mod = if with_mergeinfo_flag {
            let value = tokens.next().ok_or_else(|| malformed("missing mergeinfo-mod flag"))?;
            Some(parse_flag(value, "mergeinfo-mod")?)
        } else {
            None
        };
        let path = tokens.next().ok_or_else(|| malformed("missing path"))?;
        if path.is_empty() {
            return Err(malformed("empty path"));
        }
        let path = path.to_string();

        let copy_line = read_header_line(reader)?;
        let copyfrom = if copy_line.is_empty() {
            None
        } else {
            let (rev, from) = copy_line
                .split_once(' ')
                .ok_or_else(|| FsError::corrupt(format!("Invalid copyfrom line '{}'", copy_line)))?;
            let rev = parse_number(rev)
                .ok_or_else(|| FsError::corrupt(format!("Invalid copyfrom revision '{}'", rev)))?;
            Some((rev, from.to_string()))
        };

        Ok(Some(Self {
            node_rev_id,
            kind,
            node_kind,
            text_mod,
            prop_mod,
            mergeinfo_mod,
            path,
            copyfrom,
        }))
    }

    /// Read records until the list terminator.
    pub fn parse_list<R: BufRead + ?Sized>(reader: &mut R, with_mergeinfo_flag: bool) -> Result<Vec<Self>> {
        let mut changes = Vec::new();
        while let Some(change) = Self::parse(reader, with_mergeinfo_flag)? {
            changes.push(change);
        }
        Ok(changes)
    }

    /// Both lines of the record
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let _ = write!(out, "{} {}", self.node_rev_id, self.kind);
        if let Some(node_kind) = self.node_kind {
            let _ = write!(out, "-{}", node_kind);
        }
        let _ = write!(out, " {} {}", flag(self.text_mod), flag(self.prop_mod));
        if let Some(mergeinfo_mod) = self.mergeinfo_mod {
            let _ = write!(out, " {}", flag(mergeinfo_mod));
        }
        let _ = writeln!(out, " {}", self.path);
        if let Some((rev, path)) = &self.copyfrom {
            let _ = write!(out, "{} {}", rev, path);
        }
        out.push('\n');
        out
    }

    /// A whole list, including the terminating blank line
    pub fn serialize_list(changes: &[Change]) -> String {
        let mut out: String = changes.iter().map(Change::serialize).collect();
        out.push('\n');
        out
    }
}

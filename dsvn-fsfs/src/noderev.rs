//! Node-revision header blocks
//!
//! ```text
//! id: 0.0.r1/17
//! type: dir
//! count: 1
//! text: 1 0 54 54 <md5>
//! cpath: /
//!
//! ```

use std::fmt::Write as _;
use std::io::BufRead;

use crate::error::{FsError, Result};
use crate::ids::{NodeKind, NodeRevId, Revnum};
use crate::representation::{parse_number, RepRef};

/// Longest header line accepted before the block is declared corrupt
const MAX_LINE_LEN: usize = 64 * 1024;

/// Versioned metadata for one file or directory state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRevision {
    pub id: NodeRevId,
    pub kind: NodeKind,
    pub predecessor_id: Option<NodeRevId>,
    pub predecessor_count: u64,
    pub text_rep: Option<RepRef>,
    pub prop_rep: Option<RepRef>,
    pub created_path: Option<String>,
    pub copyfrom: Option<(Revnum, String)>,
    /// `None` means the node is its own copy root
    pub copyroot: Option<(Revnum, String)>,
    pub is_fresh_txn_root: bool,
    pub mergeinfo_count: u64,
    pub has_mergeinfo: bool,
}

impl NodeRevision {
    pub fn new(id: NodeRevId, kind: NodeKind) -> Self {
        Self {
            id,
            kind,
            predecessor_id: None,
            predecessor_count: 0,
            text_rep: None,
            prop_rep: None,
            created_path: None,
            copyfrom: None,
            copyroot: None,
            is_fresh_txn_root: false,
            mergeinfo_count: 0,
            has_mergeinfo: false,
        }
    }

    /// Parse one header block, consuming its blank-line terminator.
    pub fn parse<R: BufRead + ?Sized>(reader: &mut R) -> Result<Self> {
        let mut fields: Vec<(String, String)> = Vec::new();
        loop {
            let line = read_header_line(reader)?;
            if line.is_empty() {
                break;
            }
            let (key, value) = line.split_once(": ").ok_or_else(|| {
                FsError::corrupt(format!("Malformed node-revision header line '{}'", line))
            })?;
            fields.push((key.to_string(), value.to_string()));
        }
        Self::from_fields(fields)
    }

    fn from_fields(fields: Vec<(String, String)>) -> Result<Self> {
        let field = |name: &str| {
            fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };

        let id: NodeRevId = field("id")
            .ok_or_else(|| FsError::corrupt("Missing id field in node-rev"))?
            .parse()?;
        let kind = field("type")
            .ok_or_else(|| FsError::corrupt(format!("Missing kind field in node-rev '{}'", id)))?
            .parse()?;

        let mut noderev = NodeRevision::new(id, kind);
        let txn = noderev.id.txn_id().cloned();

        if let Some(pred) = field("pred") {
            noderev.predecessor_id = Some(pred.parse()?);
        }
        if let Some(count) = field("count") {
            noderev.predecessor_count = parse_number(count).ok_or_else(|| {
                FsError::corrupt(format!("Malformed predecessor count '{}'", count))
            })?;
        }
        if let Some(text) = field("text") {
            noderev.text_rep = Some(RepRef::parse(text, txn.as_ref())?);
        }
        if let Some(props) = field("props") {
            noderev.prop_rep = Some(RepRef::parse(props, txn.as_ref())?);
        }
        noderev.created_path = field("cpath").map(str::to_string);
        if let Some(copyfrom) = field("copyfrom") {
            noderev.copyfrom = Some(parse_rev_path(copyfrom, "copyfrom")?);
        }
        if let Some(copyroot) = field("copyroot") {
            noderev.copyroot = Some(parse_rev_path(copyroot, "copyroot")?);
        }
        noderev.is_fresh_txn_root = field("is-fresh-txn-root").is_some();
        if let Some(count) = field("minfo-cnt") {
            noderev.mergeinfo_count = parse_number(count).ok_or_else(|| {
                FsError::corrupt(format!("Malformed mergeinfo count '{}'", count))
            })?;
        }
        noderev.has_mergeinfo = field("minfo-here").is_some();

        Ok(noderev)
    }

    /// The exact inverse of [`NodeRevision::parse`], blank line included
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "id: {}", self.id);
        let _ = writeln!(out, "type: {}", self.kind);
        if let Some(pred) = &self.predecessor_id {
            let _ = writeln!(out, "pred: {}", pred);
        }
        if self.predecessor_count > 0 {
            let _ = writeln!(out, "count: {}", self.predecessor_count);
        }
        if let Some(text) = &self.text_rep {
            let _ = writeln!(out, "text: {}", text);
        }
        if let Some(props) = &self.prop_rep {
            let _ = writeln!(out, "props: {}", props);
        }
        if let Some(cpath) = &self.created_path {
            let _ = writeln!(out, "cpath: {}", cpath);
        }
        if let Some((rev, path)) = &self.copyfrom {
            let _ = writeln!(out, "copyfrom: {} {}", rev, path);
        }
        if let Some((rev, path)) = &self.copyroot {
            let _ = writeln!(out, "copyroot: {} {}", rev, path);
        }
        if self.is_fresh_txn_root {
            out.push_str("is-fresh-txn-root: y\n");
        }
        if self.mergeinfo_count > 0 {
            let _ = writeln!(out, "minfo-cnt: {}", self.mergeinfo_count);
        }
        if self.has_mergeinfo {
            out.push_str("minfo-here: y\n");
        }
        out.push('\n');
        out
    }
}

fn parse_rev_path(value: &str, field: &str) -> Result<(Revnum, String)> {
    let malformed = || FsError::corrupt(format!("Malformed {} line '{}' in node-rev", field, value));
    let (rev, path) = value.split_once(' ').ok_or_else(malformed)?;
    let rev = parse_number(rev).ok_or_else(malformed)?;
    if path.is_empty() {
        return Err(malformed());
    }
    Ok((rev, path.to_string()))
}

/// Read one `\n`-terminated line; EOF before the newline is corruption.
pub(crate) fn read_header_line<R: BufRead + ?Sized>(reader: &mut R) -> Result<String> {
    let mut buf = Vec::new();
    let mut limited = std::io::Read::take(&mut *reader, MAX_LINE_LEN as u64 + 1);
    limited
        .read_until(b'\n', &mut buf)
        .map_err(|e| FsError::io("reading header line", "", e))?;
    if buf.last() != Some(&b'\n') {
        return Err(if buf.len() > MAX_LINE_LEN {
            FsError::corrupt("Header line too long")
        } else {
            FsError::corrupt("Unexpected end of header block (missing blank-line terminator)")
        });
    }
    buf.pop();
    String::from_utf8(buf).map_err(|_| FsError::corrupt("Header line is not valid UTF-8"))
}

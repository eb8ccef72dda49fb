//! Identifiers: revisions, transactions, containers and node-revision ids

use std::fmt;
use std::str::FromStr;

use crate::error::{FsError, Result};

/// Committed revision number
pub type Revnum = u64;

/// Name of an uncommitted transaction (e.g. `12-3`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(String);

impl TxnId {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let valid = !name.is_empty()
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
        if !valid {
            return Err(FsError::corrupt(format!("Malformed transaction id '{}'", name)));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The file an item lives in: a committed revision or a transaction's
/// proto-revision
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContainerId {
    Rev(Revnum),
    Txn(TxnId),
}

impl ContainerId {
    pub fn revision(&self) -> Option<Revnum> {
        match self {
            ContainerId::Rev(rev) => Some(*rev),
            ContainerId::Txn(_) => None,
        }
    }

    pub fn is_txn(&self) -> bool {
        matches!(self, ContainerId::Txn(_))
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerId::Rev(rev) => write!(f, "r{}", rev),
            ContainerId::Txn(txn) => write!(f, "transaction '{}'", txn),
        }
    }
}

/// Node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }
}

impl FromStr for NodeKind {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(NodeKind::File),
            "dir" => Ok(NodeKind::Dir),
            other => Err(FsError::corrupt(format!("Unknown node kind '{}'", other))),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a node-revision is stored
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeLocation {
    /// Committed: revision plus item address (offset or item index)
    Rev { rev: Revnum, item: u64 },
    /// Still part of a transaction
    Txn(TxnId),
}

/// `<node-id>.<copy-id>.r<rev>/<item>` or `<node-id>.<copy-id>.t<txn-id>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeRevId {
    pub node_id: String,
    pub copy_id: String,
    pub location: NodeLocation,
}

impl NodeRevId {
    pub fn committed(node_id: &str, copy_id: &str, rev: Revnum, item: u64) -> Self {
        Self {
            node_id: node_id.to_string(),
            copy_id: copy_id.to_string(),
            location: NodeLocation::Rev { rev, item },
        }
    }

    pub fn in_txn(node_id: &str, copy_id: &str, txn: TxnId) -> Self {
        Self {
            node_id: node_id.to_string(),
            copy_id: copy_id.to_string(),
            location: NodeLocation::Txn(txn),
        }
    }

    pub fn revision(&self) -> Option<Revnum> {
        match &self.location {
            NodeLocation::Rev { rev, .. } => Some(*rev),
            NodeLocation::Txn(_) => None,
        }
    }

    pub fn txn_id(&self) -> Option<&TxnId> {
        match &self.location {
            NodeLocation::Txn(txn) => Some(txn),
            NodeLocation::Rev { .. } => None,
        }
    }

    pub fn container(&self) -> ContainerId {
        match &self.location {
            NodeLocation::Rev { rev, .. } => ContainerId::Rev(*rev),
            NodeLocation::Txn(txn) => ContainerId::Txn(txn.clone()),
        }
    }

    /// `<node-id>.<copy-id>`, the stem of a transaction's node files
    pub fn node_copy(&self) -> String {
        format!("{}.{}", self.node_id, self.copy_id)
    }
}

fn valid_id_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

impl FromStr for NodeRevId {
    type Err = FsError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || FsError::corrupt(format!("Malformed node revision id '{}'", s));

        let mut parts = s.splitn(3, '.');
        let node_id = parts.next().ok_or_else(malformed)?;
        let copy_id = parts.next().ok_or_else(malformed)?;
        let rest = parts.next().ok_or_else(malformed)?;
        if !valid_id_part(node_id) || !valid_id_part(copy_id) {
            return Err(malformed());
        }

        let location = if let Some(rev_part) = rest.strip_prefix('r') {
            let (rev, item) = rev_part.split_once('/').ok_or_else(malformed)?;
            NodeLocation::Rev {
                rev: rev.parse().map_err(|_| malformed())?,
                item: item.parse().map_err(|_| malformed())?,
            }
        } else if let Some(txn) = rest.strip_prefix('t') {
            NodeLocation::Txn(TxnId::new(txn).map_err(|_| malformed())?)
        } else {
            return Err(malformed());
        };

        Ok(Self {
            node_id: node_id.to_string(),
            copy_id: copy_id.to_string(),
            location,
        })
    }
}

impl fmt::Display for NodeRevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            NodeLocation::Rev { rev, item } => {
                write!(f, "{}.{}.r{}/{}", self.node_id, self.copy_id, rev, item)
            }
            NodeLocation::Txn(txn) => write!(f, "{}.{}.t{}", self.node_id, self.copy_id, txn),
        }
    }
}

//! DSvn FSFS read path
//!
//! Reads representations, node-revisions, directories, property lists and
//! change lists out of an FSFS repository:
//! - Storage location of revisions, packs and transactions
//! - Header codecs for representations, node-revisions and changes
//! - Delta chain resolution and window combination (svndiff)
//! - Process-wide cache hierarchy
//! - Checksum verification of every fulltext read
//! - Block reads for logically addressed repositories

pub mod block;
pub mod cache;
pub mod chain;
pub mod changes;
pub mod checksum;
pub mod combiner;
pub mod config;
pub mod container;
pub mod error;
pub mod format;
pub mod fs;
pub mod hash_dump;
pub mod ids;
pub mod index;
pub mod locator;
pub mod noderev;
pub mod representation;
pub mod svndiff;
pub mod window;

pub use block::{Block, BlockItem, BlockReader, DecodedItem};
pub use cache::{CacheHierarchy, CacheProvider, CacheStats, MemoryCache, NullCache, SharedCache};
pub use chain::{Chain, ChainResolver, ReadContext, ReadState};
pub use changes::{Change, ChangeKind};
pub use checksum::{ChecksumVerifier, Md5Digest, Sha1Digest};
pub use combiner::{DeltaStream, RepReader, WindowCombiner};
pub use config::{CacheConfig, FsConfig};
pub use error::{Corruption, FsError, Result};
pub use format::{Addressing, FsFormat};
pub use fs::FileSystem;
pub use hash_dump::{DirEntry, DirectoryEntries, PropertyList};
pub use ids::{ContainerId, NodeKind, NodeLocation, NodeRevId, Revnum, TxnId};
pub use locator::{FileKind, FsPaths, StorageLocator};
pub use noderev::NodeRevision;
pub use representation::{RepHeader, RepRef, Representation};
pub use svndiff::{DeltaCodec, DeltaOp, DeltaWindow, Svndiff};

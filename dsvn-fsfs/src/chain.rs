//! Delta chain discovery
//!
//! Starting from the requested representation, every link's header is read
//! and the chain is followed through its `DELTA <rev> <item> <size>` base
//! pointers until a plain base, a self-delta, a container-embedded base or
//! a cached combined window ends it.

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::cache::{CacheHierarchy, RepKey, WindowKey};
use crate::config::FsConfig;
use crate::container::{is_container_header, RepsContainer};
use crate::error::{CorruptAt, FsError, Result};
use crate::ids::ContainerId;
use crate::locator::{SharedFile, StorageLocator};
use crate::representation::{RepHeader, Representation};
use crate::svndiff::DeltaCodec;

/// Everything a read needs, cheap to clone
#[derive(Clone)]
pub struct ReadContext {
    pub storage: Arc<StorageLocator>,
    pub codec: Arc<dyn DeltaCodec>,
    pub caches: Arc<CacheHierarchy>,
    pub config: Arc<FsConfig>,
}

/// One delta link of a chain, bound to an open file
pub struct ReadState {
    pub file: SharedFile,
    pub container: ContainerId,
    pub item: u64,
    pub header: RepHeader,
    /// Absolute offset of the delta stream (its `SVN` magic)
    pub start: u64,
    /// Stored size, svndiff header included
    pub size: u64,
    /// Bytes of the stream consumed so far
    pub current: u64,
    pub version: u8,
    /// Index of the next window to be read
    pub chunk_index: u64,
}

impl ReadState {
    /// Windows are only cached for committed representations.
    pub fn window_key(&self, chunk: u64) -> Option<WindowKey> {
        self.container.revision().map(|rev| WindowKey {
            rev,
            item: self.item,
            chunk,
        })
    }

    pub fn rep_key(&self) -> Option<RepKey> {
        rep_key(&self.container, self.item)
    }

    pub fn is_exhausted(&self) -> bool {
        self.current >= self.size
    }
}

pub(crate) fn rep_key(container: &ContainerId, item: u64) -> Option<RepKey> {
    container.revision().map(|rev| RepKey { rev, item })
}

/// Where the base of a chain comes from
pub enum BaseSource {
    /// A `PLAIN` representation on disk
    Plain { file: SharedFile, start: u64 },
    /// A combined window from the cache; it holds the link's whole contents
    Cached(Bytes),
    /// A sub-item of a representation container
    Container(Bytes),
}

/// Plain bytes at the bottom of a chain
pub struct BaseState {
    pub source: BaseSource,
    pub size: u64,
    pub current: u64,
}

impl BaseState {
    fn cached(bytes: Bytes) -> Self {
        Self {
            size: bytes.len() as u64,
            source: BaseSource::Cached(bytes),
            current: 0,
        }
    }

    fn container(bytes: Bytes) -> Self {
        Self {
            size: bytes.len() as u64,
            source: BaseSource::Container(bytes),
            current: 0,
        }
    }
}

/// Resolved chain, head link first
pub struct Chain {
    pub links: Vec<ReadState>,
    pub base: Option<BaseState>,
}

impl Chain {
    /// The expanded size of the head representation. Old formats record
    /// zero for "unknown"; the size is then taken from the chain itself.
    pub fn expanded_size(&self, ctx: &ReadContext, rep: &Representation) -> Result<u64> {
        if rep.expanded_size != 0 {
            return Ok(rep.expanded_size);
        }
        let Some(head) = self.links.first() else {
            return Ok(self.base.as_ref().map_or(0, |base| base.size));
        };
        if head.size == ctx.codec.empty_delta_size() {
            return Ok(0);
        }

        // sum the target lengths of the head's windows
        let mut file = head.file.lock();
        file.seek(head.start + head.current)?;
        let mut pos = head.current;
        let mut total = 0u64;
        while pos < head.size {
            total += ctx
                .codec
                .skip_window(file.reader(), head.version)
                .map_err(|e| e.into_fs(file.path()))
                .corrupt_at(&head.container, head.start + pos)?;
            pos = file.position()? - head.start;
        }
        if pos != head.size {
            return Err(FsError::corrupt("Delta windows overrun the representation"))
                .corrupt_at(&head.container, head.start);
        }
        trace!("inferred expanded size {} for {}", total, rep);
        Ok(total)
    }
}

/// One opened link, before it is placed in a chain
pub enum Link {
    Delta(ReadState),
    Plain { file: SharedFile, start: u64 },
    Container(Bytes),
}

/// Builds [`Chain`]s
pub struct ChainResolver<'a> {
    ctx: &'a ReadContext,
}

impl<'a> ChainResolver<'a> {
    pub fn new(ctx: &'a ReadContext) -> Self {
        Self { ctx }
    }

    /// Open the representation stored at `item` of `container` and read its
    /// header (and svndiff header, for deltas).
    pub fn open_link(
        &self,
        container: &ContainerId,
        item: u64,
        size: u64,
        hint: Option<&SharedFile>,
    ) -> Result<Link> {
        let opened = self.ctx.storage.open_and_seek(container, item, hint)?;
        let mut file = opened.file.lock();

        let line = file.read_line().corrupt_at(container, opened.offset)?;
        if is_container_header(&line) {
            if container.is_txn() || !self.ctx.storage.format().is_logical() {
                return Err(FsError::corrupt("Representation container outside a logically addressed revision"))
                    .corrupt_at(container, opened.offset);
            }
            let reps = RepsContainer::read_body(&line, file.reader())
                .map_err(|e| e.with_path(file.path()))
                .corrupt_at(container, opened.offset)?;
            return Ok(Link::Container(reps.get(item).corrupt_at(container, opened.offset)?));
        }
        let header = RepHeader::parse(line.as_bytes()).corrupt_at(container, opened.offset)?;
        let start = file.position()?;
        if !header.is_delta() {
            drop(file);
            return Ok(Link::Plain {
                file: opened.file,
                start,
            });
        }

        let empty = self.ctx.codec.empty_delta_size();
        if size < empty {
            return Err(FsError::corrupt(format!(
                "Delta representation of {} bytes is too small",
                size
            )))
            .corrupt_at(container, opened.offset);
        }
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic).corrupt_at(container, start)?;
        let version = self
            .ctx
            .codec
            .read_header(&magic)
            .map_err(FsError::from)
            .corrupt_at(container, start)?;
        drop(file);

        Ok(Link::Delta(ReadState {
            file: opened.file,
            container: container.clone(),
            item,
            header,
            start,
            size,
            current: empty,
            version,
            chunk_index: 0,
        }))
    }

    pub fn resolve(&self, rep: &Representation) -> Result<Chain> {
        let max = self.ctx.config.max_chain_length;
        let mut links: Vec<ReadState> = Vec::new();
        let mut container = rep.container.clone();
        let mut item = rep.item;
        let mut size = rep.size;

        loop {
            if let Some(key) = rep_key(&container, item) {
                if let Some(bytes) = self.ctx.caches.combined.get(&key) {
                    trace!("chain for {} ends at cached combined window r{}/{}", rep, key.rev, key.item);
                    return Ok(Chain {
                        links,
                        base: Some(BaseState::cached(bytes)),
                    });
                }
            }

            let hint = links.last().map(|link| link.file.clone());
            let link = match self.open_link(&container, item, size, hint.as_ref())? {
                Link::Delta(link) => link,
                Link::Plain { file, start } => {
                    let base = BaseState {
                        source: BaseSource::Plain { file, start },
                        size,
                        current: 0,
                    };
                    return Ok(Chain { links, base: Some(base) });
                }
                Link::Container(bytes) => {
                    self.cache_combined(&container, item, &bytes);
                    return Ok(Chain {
                        links,
                        base: Some(BaseState::container(bytes)),
                    });
                }
            };

            let next = match link.header {
                RepHeader::Delta {
                    base_rev,
                    base_item,
                    base_size,
                } => Some((base_rev, base_item, base_size)),
                _ => None,
            };
            links.push(link);
            if links.len() > max {
                tracing::warn!("delta chain starting at {} exceeds {} links", rep, max);
                return Err(FsError::ChainTooLong {
                    start: rep.to_string(),
                    max,
                });
            }

            match next {
                Some((base_rev, base_item, base_size)) => {
                    container = ContainerId::Rev(base_rev);
                    item = base_item;
                    size = base_size;
                }
                None => return Ok(Chain { links, base: None }),
            }
        }
    }

    fn cache_combined(&self, container: &ContainerId, item: u64, bytes: &Bytes) {
        if let Some(key) = rep_key(container, item) {
            if bytes.len() as u64 <= self.ctx.caches.max_combined_size() {
                self.ctx.caches.combined.set(key, bytes.clone());
            }
        }
    }
}

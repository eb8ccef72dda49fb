//! Combining delta windows into fulltext, and the streaming representation
//! reader built on top of it

use std::io::{self, Read};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use tracing::{debug, trace};

use crate::cache::RepKey;
use crate::chain::{rep_key, Chain, ChainResolver, Link, ReadContext, ReadState};
use crate::checksum::{ChecksumVerifier, Md5Digest};
use crate::error::{CorruptAt, FsError, Result};
use crate::representation::{RepHeader, Representation};
use crate::svndiff::DeltaWindow;
use crate::window::{read_base_view, read_plain, read_window, CachedWindow};

/// Bytes handed out per call when the chain has no delta links
const PLAIN_CHUNK: u64 = 64 * 1024;

/// Upper bound on the buffer reserved up front by [`RepReader::read_all`];
/// the recorded expanded size is not trusted beyond this.
const READ_ALL_RESERVE: u64 = 4 * 1024 * 1024;

/// Produces the output of a chain one window index at a time
pub struct WindowCombiner<'a> {
    ctx: &'a ReadContext,
}

impl<'a> WindowCombiner<'a> {
    pub fn new(ctx: &'a ReadContext) -> Self {
        Self { ctx }
    }

    /// Output of window `chunk` of the head link, or `None` once the head
    /// has no more windows.
    pub fn produce_chunk(&self, chain: &mut Chain, chunk: u64) -> Result<Option<Bytes>> {
        let mut windows: Vec<Arc<CachedWindow>> = Vec::with_capacity(chain.links.len());
        for (depth, link) in chain.links.iter_mut().enumerate() {
            match read_window(self.ctx, link, chunk)? {
                Some(window) => {
                    let self_contained = window.window.src_ops() == 0;
                    windows.push(window);
                    if self_contained {
                        break;
                    }
                }
                None if depth == 0 => return Ok(None),
                None => {
                    return Err(FsError::corrupt(format!("Delta base has no window {}", chunk))
                        .located(&link.container, link.start))
                }
            }
        }
        if windows.is_empty() {
            return Ok(None);
        }

        let deepest = windows.len() - 1;
        let mut buf: Option<Bytes> = None;
        for (depth, cached) in windows.iter().enumerate().rev() {
            let window = &cached.window;
            let link = &chain.links[depth];
            let source = if depth < deepest {
                buf.take()
            } else if window.src_ops() == 0 {
                None
            } else {
                let base = chain.base.as_mut().ok_or_else(|| {
                    FsError::corrupt("Self-delta window copies from a source").located(&link.container, link.start)
                })?;
                Some(read_base_view(base, window.sview_offset, window.sview_len).corrupt_at(&link.container, link.start)?)
            };

            let out = self
                .ctx
                .codec
                .apply_instructions(window, source.as_deref())
                .map_err(FsError::from)
                .corrupt_at(&link.container, link.start)?;
            if out.len() as u64 != window.tview_len {
                return Err(FsError::corrupt("svndiff window length is corrupt").located(&link.container, link.start));
            }
            let out = Bytes::from(out);
            if depth == 0 {
                self.cache_combined(link, chunk, &out);
            }
            buf = Some(out);
        }
        trace!("combined chunk {} over {} windows", chunk, windows.len());
        Ok(buf)
    }

    /// The head link's single window has just produced the whole
    /// representation.
    fn cache_combined(&self, link: &ReadState, chunk: u64, out: &Bytes) {
        if chunk != 0 || link.current != link.size {
            return;
        }
        if let Some(key) = link.rep_key() {
            if out.len() as u64 <= self.ctx.caches.max_combined_size() {
                self.ctx.caches.combined.set(key, out.clone());
            }
        }
    }
}

enum Source {
    /// Nothing left to read from disk
    Memory,
    Chain(Chain),
}

/// Streaming reader of one representation's fulltext
///
/// Every byte passes through the checksum verifier; the stored digest is
/// compared once the expanded size has been produced. A fulltext is only
/// cached after that check succeeded.
pub struct RepReader {
    ctx: ReadContext,
    context: String,
    source: Source,
    len: u64,
    off: u64,
    chunk_index: u64,
    pending: Bytes,
    verifier: Option<ChecksumVerifier>,
    stored_md5: Md5Digest,
    fulltext: Option<(RepKey, Vec<u8>)>,
    finished: bool,
    failed: bool,
}

impl RepReader {
    pub fn open(ctx: &ReadContext, rep: &Representation) -> Result<Self> {
        let context = rep.to_string();
        let key = rep_key(&rep.container, rep.item);

        if let Some(key) = &key {
            if let Some(bytes) = ctx.caches.fulltexts.get(key) {
                trace!("fulltext of {} from cache", context);
                return Ok(Self {
                    ctx: ctx.clone(),
                    context,
                    source: Source::Memory,
                    len: bytes.len() as u64,
                    off: bytes.len() as u64,
                    chunk_index: 0,
                    pending: bytes,
                    verifier: None,
                    stored_md5: rep.md5,
                    fulltext: None,
                    finished: true,
                    failed: false,
                });
            }
        }

        let chain = ChainResolver::new(ctx).resolve(rep)?;
        let len = chain.expanded_size(ctx, rep)?;
        let sha1 = if ctx.config.verify_sha1 { rep.sha1 } else { None };
        let ceiling = ctx.caches.max_fulltext_size();
        let fulltext = key
            .filter(|_| len <= ceiling)
            .map(|key| (key, Vec::with_capacity(len.min(READ_ALL_RESERVE) as usize)));

        let mut reader = Self {
            ctx: ctx.clone(),
            context: context.clone(),
            source: Source::Chain(chain),
            len,
            off: 0,
            chunk_index: 0,
            pending: Bytes::new(),
            verifier: Some(ChecksumVerifier::new(context, rep.md5, sha1)),
            stored_md5: rep.md5,
            fulltext,
            finished: false,
            failed: false,
        };
        if len == 0 {
            reader.finish()?;
        }
        Ok(reader)
    }

    /// Reader of a node without contents
    pub fn empty(ctx: &ReadContext) -> Self {
        Self {
            ctx: ctx.clone(),
            context: "empty contents".to_string(),
            source: Source::Memory,
            len: 0,
            off: 0,
            chunk_index: 0,
            pending: Bytes::new(),
            verifier: None,
            stored_md5: Md5Digest::of(b""),
            fulltext: None,
            finished: true,
            failed: false,
        }
    }

    /// Expanded size of the representation
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The recorded digest, without verifying anything
    pub fn stored_md5(&self) -> Md5Digest {
        self.verifier
            .as_ref()
            .map_or(self.stored_md5, ChecksumVerifier::stored_md5)
    }

    /// Next span of the fulltext, `None` at the end
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        if !self.pending.is_empty() {
            return Ok(Some(std::mem::take(&mut self.pending)));
        }
        if self.failed {
            return Err(FsError::corrupt(format!("Earlier read of {} failed", self.context)));
        }
        match self.produce() {
            Ok(chunk) => Ok(chunk),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    fn produce(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.off == self.len {
                self.finish()?;
                return Ok(None);
            }
            let Source::Chain(chain) = &mut self.source else {
                return Err(FsError::corrupt(format!("Cached contents of {} are truncated", self.context)));
            };

            let bytes = if chain.links.is_empty() {
                let base = chain
                    .base
                    .as_mut()
                    .ok_or_else(|| FsError::corrupt("Representation chain has neither links nor a base"))?;
                read_plain(base, (self.len - self.off).min(PLAIN_CHUNK))?
            } else {
                let chunk = WindowCombiner::new(&self.ctx).produce_chunk(chain, self.chunk_index)?;
                self.chunk_index += 1;
                chunk.ok_or_else(|| {
                    FsError::corrupt(format!(
                        "Representation {} ended after {} of {} bytes",
                        self.context, self.off, self.len
                    ))
                })?
            };
            if bytes.is_empty() {
                continue;
            }
            if self.off + bytes.len() as u64 > self.len {
                return Err(FsError::corrupt(format!(
                    "Representation {} expands to more than {} bytes",
                    self.context, self.len
                )));
            }

            if let Some(verifier) = self.verifier.as_mut() {
                verifier.update(&bytes);
            }
            if let Some((_, fulltext)) = self.fulltext.as_mut() {
                fulltext.extend_from_slice(&bytes);
            }
            self.off += bytes.len() as u64;
            if self.off == self.len {
                self.finish()?;
            }
            return Ok(Some(bytes));
        }
    }

    fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if let Some(verifier) = self.verifier.as_mut() {
            verifier.finish()?;
        }
        self.finished = true;
        if let Some((key, fulltext)) = self.fulltext.take() {
            if self.ctx.caches.fulltexts.set(key, Bytes::from(fulltext)) {
                debug!("cached fulltext of {}", self.context);
            }
        }
        Ok(())
    }

    /// Read everything that is left.
    pub fn read_all(mut self) -> Result<Bytes> {
        let first = match self.next_chunk()? {
            Some(chunk) => chunk,
            None => return Ok(Bytes::new()),
        };
        if first.len() as u64 == self.len {
            return Ok(first);
        }
        let mut out = Vec::with_capacity(self.len.min(READ_ALL_RESERVE) as usize);
        out.extend_from_slice(&first);
        while let Some(chunk) = self.next_chunk()? {
            out.extend_from_slice(&chunk);
        }
        Ok(Bytes::from(out))
    }
}

impl Read for RepReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pending.is_empty() {
            match self.next_chunk() {
                Ok(Some(chunk)) => self.pending = chunk,
                Ok(None) => return Ok(0),
                Err(e) => return Err(into_io(e)),
            }
        }
        let n = out.len().min(self.pending.len());
        out[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        Ok(n)
    }
}

/// Corruption becomes `InvalidData`; the `FsError` stays reachable through
/// `get_ref`.
fn into_io(e: FsError) -> io::Error {
    match e {
        FsError::Io { source, .. } => source,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

/// The stored windows of a delta whose base is exactly the requested
/// source, for callers that forward deltas instead of decoding them
pub struct DeltaStream {
    ctx: ReadContext,
    link: ReadState,
    md5: Md5Digest,
    expanded_size: u64,
    next: u64,
}

impl DeltaStream {
    /// `None` when `target` is not stored as a delta against `source`
    /// (a self-delta when `source` is `None`).
    pub fn open(ctx: &ReadContext, source: Option<&Representation>, target: &Representation) -> Result<Option<Self>> {
        let resolver = ChainResolver::new(ctx);
        let link = match resolver.open_link(&target.container, target.item, target.size, None)? {
            Link::Delta(link) => link,
            Link::Plain { .. } | Link::Container(_) => return Ok(None),
        };
        let matches = match (link.header, source) {
            (RepHeader::SelfDelta, None) => true,
            (
                RepHeader::Delta {
                    base_rev,
                    base_item,
                    base_size,
                },
                Some(source),
            ) => source.revision() == Some(base_rev) && source.item == base_item && source.size == base_size,
            _ => false,
        };
        if !matches {
            return Ok(None);
        }

        let chain = Chain {
            links: vec![link],
            base: None,
        };
        let expanded_size = chain.expanded_size(ctx, target)?;
        let link = chain.links.into_iter().next().ok_or_else(|| FsError::corrupt("empty chain"))?;
        Ok(Some(Self {
            ctx: ctx.clone(),
            md5: target.md5,
            link,
            expanded_size,
            next: 0,
        }))
    }

    /// svndiff version of the stored windows
    pub fn version(&self) -> u8 {
        self.link.version
    }

    /// Digest of the target's fulltext, as recorded
    pub fn md5(&self) -> Md5Digest {
        self.md5
    }

    pub fn expanded_size(&self) -> u64 {
        self.expanded_size
    }

    pub fn next_window(&mut self) -> Result<Option<DeltaWindow>> {
        let window = read_window(&self.ctx, &mut self.link, self.next)?;
        self.next += 1;
        Ok(window.map(|cached| cached.window.clone()))
    }
}

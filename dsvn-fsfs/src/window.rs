//! Reading single windows from delta links and raw spans from plain bases

use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::cache::CacheWeight;
use crate::chain::{BaseSource, BaseState, ReadContext, ReadState};
use crate::error::{CorruptAt, FsError, Result};
use crate::svndiff::DeltaWindow;

/// A decoded window together with the stream position just past it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedWindow {
    pub window: DeltaWindow,
    /// Value of the link's `current` after reading this window
    pub end_offset: u64,
}

impl CacheWeight for CachedWindow {
    fn weight(&self) -> usize {
        self.window.weight() + 16
    }
}

fn beyond_end(state: &ReadState) -> FsError {
    FsError::corrupt("Reading one svndiff window read beyond the end of the representation")
        .located(&state.container, state.start)
}

/// Read window `desired` of `state`, skipping earlier windows that were not
/// consumed. `Ok(None)` means the link has no further windows.
pub fn read_window(ctx: &ReadContext, state: &mut ReadState, desired: u64) -> Result<Option<Arc<CachedWindow>>> {
    if state.chunk_index > desired {
        return Err(FsError::corrupt(format!(
            "Window {} requested after window {} was consumed",
            desired, state.chunk_index
        )));
    }

    let key = state.window_key(desired);
    if let Some(key) = &key {
        if let Some(cached) = ctx.caches.windows.get(key) {
            trace!("window {} of r{}/{} from cache", desired, key.rev, key.item);
            state.current = cached.end_offset;
            state.chunk_index = desired + 1;
            return Ok(Some(cached));
        }
    }

    if state.chunk_index == desired && state.is_exhausted() {
        return Ok(None);
    }

    let window = {
        let mut file = state.file.lock();
        file.seek(state.start + state.current)?;
        while state.chunk_index < desired {
            ctx.codec
                .skip_window(file.reader(), state.version)
                .map_err(|e| e.into_fs(file.path()))
                .corrupt_at(&state.container, state.start + state.current)?;
            state.chunk_index += 1;
            state.current = file.position()? - state.start;
            if state.is_exhausted() {
                if state.current == state.size && state.chunk_index == desired {
                    return Ok(None);
                }
                return Err(beyond_end(state));
            }
        }

        let window = ctx
            .codec
            .read_window(file.reader(), state.version)
            .map_err(|e| e.into_fs(file.path()))
            .corrupt_at(&state.container, state.start + state.current)?;
        state.current = file.position()? - state.start;
        window
    };
    state.chunk_index += 1;
    if state.current > state.size {
        return Err(beyond_end(state));
    }

    let cached = Arc::new(CachedWindow {
        window,
        end_offset: state.current,
    });
    if let Some(key) = key {
        ctx.caches.windows.set(key, cached.clone());
    }
    Ok(Some(cached))
}

/// Read `len` bytes at the base's cursor and advance it.
pub fn read_plain(base: &mut BaseState, len: u64) -> Result<Bytes> {
    let end = base
        .current
        .checked_add(len)
        .filter(|&end| end <= base.size)
        .ok_or_else(|| {
            FsError::corrupt(format!(
                "Reading {} bytes at offset {} of a {} byte plain representation",
                len, base.current, base.size
            ))
        })?;
    let bytes = match &base.source {
        BaseSource::Plain { file, start } => {
            let mut file = file.lock();
            file.seek(start + base.current)?;
            Bytes::from(file.read_vec(len)?)
        }
        BaseSource::Cached(data) | BaseSource::Container(data) => {
            let range = base.current as usize..end as usize;
            if range.end > data.len() {
                return Err(FsError::corrupt("Cached base is shorter than its recorded size"));
            }
            data.slice(range)
        }
    };
    base.current = end;
    Ok(bytes)
}

/// Source view of a window read from the base: `len` bytes at `offset`.
pub fn read_base_view(base: &mut BaseState, offset: u64, len: u64) -> Result<Bytes> {
    base.current = offset;
    read_plain(base, len)
}

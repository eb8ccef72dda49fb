//! svndiff delta codec
//!
//! A stream starts with `SVN` plus a version byte and is followed by windows:
//!
//! ```text
//! <sview-offset> <sview-len> <tview-len> <instr-len> <new-len>   (varints)
//! <instructions> <new data>
//! ```
//!
//! Version 1 zlib-compresses both sections; version 2 (LZ4) is not supported.

use std::io::{self, Read, Write};
use std::path::Path;

use bytes::Bytes;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::FsError;

pub const SVNDIFF_MAGIC: &[u8; 3] = b"SVN";

/// Upper bound for any single window dimension or section
pub const MAX_WINDOW_LEN: u64 = 64 * 1024 * 1024;

const MAX_VARINT_BYTES: usize = 10;

/// Errors raised while decoding or encoding svndiff data
#[derive(Debug, thiserror::Error)]
pub enum SvndiffError {
    #[error("Unexpected end of svndiff data")]
    Truncated,

    #[error("Malformed svndiff data: {0}")]
    Malformed(String),

    #[error("Unsupported svndiff version {0}")]
    UnsupportedVersion(u8),

    #[error(transparent)]
    Io(io::Error),
}

impl SvndiffError {
    fn malformed(msg: impl Into<String>) -> Self {
        SvndiffError::Malformed(msg.into())
    }

    /// Convert with the path of the file being read
    pub fn into_fs(self, path: &Path) -> FsError {
        match self {
            SvndiffError::Io(e) => FsError::io("reading svndiff data", path, e),
            other => other.into(),
        }
    }
}

impl From<io::Error> for SvndiffError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            SvndiffError::Truncated
        } else {
            SvndiffError::Io(e)
        }
    }
}

impl From<SvndiffError> for FsError {
    fn from(e: SvndiffError) -> Self {
        match e {
            SvndiffError::UnsupportedVersion(v) => {
                FsError::Unsupported(format!("svndiff version {}", v))
            }
            SvndiffError::Io(e) => FsError::io("reading svndiff data", "", e),
            other => FsError::corrupt(other.to_string()),
        }
    }
}

type Result<T> = std::result::Result<T, SvndiffError>;

/// One delta instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    /// Copy `len` bytes from the source view at `offset`
    Source { offset: u64, len: u64 },
    /// Copy `len` bytes from the target produced so far, starting at `offset`
    Target { offset: u64, len: u64 },
    /// Copy the next `len` bytes of new data
    New { len: u64 },
}

/// One decoded window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaWindow {
    pub sview_offset: u64,
    pub sview_len: u64,
    pub tview_len: u64,
    pub ops: Vec<DeltaOp>,
    pub new_data: Bytes,
}

impl DeltaWindow {
    /// Number of instructions that read the source view
    pub fn src_ops(&self) -> usize {
        self.ops
            .iter()
            .filter(|op| matches!(op, DeltaOp::Source { .. }))
            .count()
    }

    /// Approximate memory footprint, for cache accounting
    pub fn weight(&self) -> usize {
        self.new_data.len() + self.ops.len() * std::mem::size_of::<DeltaOp>() + 64
    }

    /// Check that the instructions exactly produce `tview_len` bytes.
    pub fn validate(&self) -> Result<()> {
        let mut tpos = 0u64;
        let mut npos = 0u64;
        for op in &self.ops {
            let len = match *op {
                DeltaOp::Source { offset, len } => {
                    if offset.checked_add(len).map_or(true, |end| end > self.sview_len) {
                        return Err(SvndiffError::malformed("source copy outside the source view"));
                    }
                    len
                }
                DeltaOp::Target { offset, len } => {
                    if offset >= tpos {
                        return Err(SvndiffError::malformed("target copy from unwritten data"));
                    }
                    len
                }
                DeltaOp::New { len } => {
                    npos = npos
                        .checked_add(len)
                        .filter(|&end| end <= self.new_data.len() as u64)
                        .ok_or_else(|| SvndiffError::malformed("instruction runs past new data"))?;
                    len
                }
            };
            if len == 0 {
                return Err(SvndiffError::malformed("zero-length instruction"));
            }
            tpos = tpos
                .checked_add(len)
                .filter(|&end| end <= self.tview_len)
                .ok_or_else(|| SvndiffError::malformed("instructions overflow the target view"))?;
        }
        if tpos != self.tview_len {
            return Err(SvndiffError::malformed("delta does not fill the target window"));
        }
        if npos != self.new_data.len() as u64 {
            return Err(SvndiffError::malformed("delta leaves new data unused"));
        }
        Ok(())
    }
}

/// The operations the read path needs from a delta format
pub trait DeltaCodec: Send + Sync {
    /// Validate a stream header and return its version
    fn read_header(&self, header: &[u8; 4]) -> Result<u8>;

    fn stream_header(&self, version: u8) -> Result<[u8; 4]>;

    /// Stored size of a delta that has a header but no windows
    fn empty_delta_size(&self) -> u64;

    fn read_window(&self, reader: &mut dyn Read, version: u8) -> Result<DeltaWindow>;

    /// Advance past one window without decoding its sections; returns the
    /// window's target length.
    fn skip_window(&self, reader: &mut dyn Read, version: u8) -> Result<u64>;

    fn write_window(&self, out: &mut Vec<u8>, window: &DeltaWindow, version: u8) -> Result<()>;

    /// Produce the target view of `window`
    fn apply_instructions(&self, window: &DeltaWindow, source: Option<&[u8]>) -> Result<Vec<u8>>;
}

/// The svndiff codec (versions 0 and 1)
#[derive(Debug, Default, Clone, Copy)]
pub struct Svndiff;

impl DeltaCodec for Svndiff {
    fn read_header(&self, header: &[u8; 4]) -> Result<u8> {
        if &header[..3] != SVNDIFF_MAGIC {
            return Err(SvndiffError::malformed("svndiff data does not start with 'SVN'"));
        }
        match header[3] {
            v @ (0 | 1) => Ok(v),
            v => Err(SvndiffError::UnsupportedVersion(v)),
        }
    }

    fn stream_header(&self, version: u8) -> Result<[u8; 4]> {
        if version > 1 {
            return Err(SvndiffError::UnsupportedVersion(version));
        }
        Ok([b'S', b'V', b'N', version])
    }

    fn empty_delta_size(&self) -> u64 {
        4
    }

    fn read_window(&self, reader: &mut dyn Read, version: u8) -> Result<DeltaWindow> {
        let header = read_window_header(reader)?;
        let instructions = read_section(reader, header.instr_len)?;
        let new_data = read_section(reader, header.new_len)?;
        let instructions = decode_section(instructions, version)?;
        let new_data = decode_section(new_data, version)?;

        let window = DeltaWindow {
            sview_offset: header.sview_offset,
            sview_len: header.sview_len,
            tview_len: header.tview_len,
            ops: decode_instructions(&instructions)?,
            new_data: Bytes::from(new_data),
        };
        window.validate()?;
        Ok(window)
    }

    fn skip_window(&self, reader: &mut dyn Read, _version: u8) -> Result<u64> {
        let header = read_window_header(reader)?;
        let skip = header.instr_len + header.new_len;
        let skipped = io::copy(&mut reader.take(skip), &mut io::sink())?;
        if skipped != skip {
            return Err(SvndiffError::Truncated);
        }
        Ok(header.tview_len)
    }

    fn write_window(&self, out: &mut Vec<u8>, window: &DeltaWindow, version: u8) -> Result<()> {
        if version > 1 {
            return Err(SvndiffError::UnsupportedVersion(version));
        }
        let instructions = encode_section(encode_instructions(&window.ops), version)?;
        let new_data = encode_section(window.new_data.to_vec(), version)?;

        write_varint(out, window.sview_offset);
        write_varint(out, window.sview_len);
        write_varint(out, window.tview_len);
        write_varint(out, instructions.len() as u64);
        write_varint(out, new_data.len() as u64);
        out.extend_from_slice(&instructions);
        out.extend_from_slice(&new_data);
        Ok(())
    }

    fn apply_instructions(&self, window: &DeltaWindow, source: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut target: Vec<u8> = Vec::with_capacity(window.tview_len as usize);
        let mut npos = 0usize;
        for op in &window.ops {
            match *op {
                DeltaOp::Source { offset, len } => {
                    let source = source.ok_or_else(|| {
                        SvndiffError::malformed("window copies from a source that does not exist")
                    })?;
                    let (start, end) = (offset as usize, (offset + len) as usize);
                    let bytes = source.get(start..end).ok_or_else(|| {
                        SvndiffError::malformed("source copy beyond the available source data")
                    })?;
                    target.extend_from_slice(bytes);
                }
                DeltaOp::Target { offset, len } => {
                    let start = offset as usize;
                    if start >= target.len() {
                        return Err(SvndiffError::malformed("target copy from unwritten data"));
                    }
                    let end = start + len as usize;
                    if end <= target.len() {
                        target.extend_from_within(start..end);
                    } else {
                        // overlapping copy repeats the pattern byte by byte
                        for i in start..end {
                            let byte = target[i];
                            target.push(byte);
                        }
                    }
                }
                DeltaOp::New { len } => {
                    let end = npos + len as usize;
                    let bytes = window.new_data.get(npos..end).ok_or_else(|| {
                        SvndiffError::malformed("instruction runs past new data")
                    })?;
                    target.extend_from_slice(bytes);
                    npos = end;
                }
            }
        }
        Ok(target)
    }
}

struct WindowHeader {
    sview_offset: u64,
    sview_len: u64,
    tview_len: u64,
    instr_len: u64,
    new_len: u64,
}

fn read_window_header(reader: &mut dyn Read) -> Result<WindowHeader> {
    let header = WindowHeader {
        sview_offset: read_varint(reader)?,
        sview_len: read_varint(reader)?,
        tview_len: read_varint(reader)?,
        instr_len: read_varint(reader)?,
        new_len: read_varint(reader)?,
    };
    if header.sview_len > MAX_WINDOW_LEN
        || header.tview_len > MAX_WINDOW_LEN
        || header.instr_len > MAX_WINDOW_LEN
        || header.new_len > MAX_WINDOW_LEN
    {
        return Err(SvndiffError::malformed("svndiff window exceeds size limits"));
    }
    Ok(header)
}

fn read_section(reader: &mut dyn Read, len: u64) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

fn decode_section(data: Vec<u8>, version: u8) -> Result<Vec<u8>> {
    if version == 0 {
        return Ok(data);
    }
    let mut rest = &data[..];
    let original_len = read_varint(&mut rest)?;
    if original_len > MAX_WINDOW_LEN {
        return Err(SvndiffError::malformed("compressed section exceeds size limits"));
    }
    if rest.len() as u64 == original_len {
        return Ok(rest.to_vec());
    }
    let mut out = Vec::with_capacity(original_len as usize);
    ZlibDecoder::new(rest)
        .take(original_len + 1)
        .read_to_end(&mut out)
        .map_err(|e| SvndiffError::malformed(format!("zlib section: {}", e)))?;
    if out.len() as u64 != original_len {
        return Err(SvndiffError::malformed("decompressed section has the wrong length"));
    }
    Ok(out)
}

fn encode_section(data: Vec<u8>, version: u8) -> Result<Vec<u8>> {
    if version == 0 {
        return Ok(data);
    }
    let mut out = Vec::new();
    write_varint(&mut out, data.len() as u64);
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&data)?;
    let compressed = encoder.finish()?;
    if compressed.len() < data.len() {
        out.extend_from_slice(&compressed);
    } else {
        out.extend_from_slice(&data);
    }
    Ok(out)
}

fn decode_instructions(mut data: &[u8]) -> Result<Vec<DeltaOp>> {
    let mut ops = Vec::new();
    while let Some((&byte, rest)) = data.split_first() {
        data = rest;
        let mut len = u64::from(byte & 0x3f);
        if len == 0 {
            len = read_varint(&mut data)?;
        }
        let op = match byte >> 6 {
            0 => DeltaOp::Source {
                offset: read_varint(&mut data)?,
                len,
            },
            1 => DeltaOp::Target {
                offset: read_varint(&mut data)?,
                len,
            },
            2 => DeltaOp::New { len },
            _ => return Err(SvndiffError::malformed("invalid instruction opcode")),
        };
        ops.push(op);
    }
    Ok(ops)
}

fn encode_instructions(ops: &[DeltaOp]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        let (opcode, len, offset) = match *op {
            DeltaOp::Source { offset, len } => (0u8, len, Some(offset)),
            DeltaOp::Target { offset, len } => (1u8, len, Some(offset)),
            DeltaOp::New { len } => (2u8, len, None),
        };
        if len > 0 && len < 0x40 {
            out.push((opcode << 6) | len as u8);
        } else {
            out.push(opcode << 6);
            write_varint(&mut out, len);
        }
        if let Some(offset) = offset {
            write_varint(&mut out, offset);
        }
    }
    out
}

/// Big-endian base-128 varint, high bit set on every byte but the last
pub fn read_varint<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let mut result: u64 = 0;
    for _ in 0..MAX_VARINT_BYTES {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        if result > (u64::MAX >> 7) {
            return Err(SvndiffError::malformed("varint overflow"));
        }
        result = (result << 7) | u64::from(byte[0] & 0x7f);
        if byte[0] & 0x80 == 0 {
            return Ok(result);
        }
    }
    Err(SvndiffError::malformed("varint too long"))
}

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    let mut groups = [0u8; MAX_VARINT_BYTES];
    let mut n = 0;
    loop {
        groups[n] = (value & 0x7f) as u8;
        n += 1;
        value >>= 7;
        if value == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let continuation = if i > 0 { 0x80 } else { 0 };
        out.push(groups[i] | continuation);
    }
}

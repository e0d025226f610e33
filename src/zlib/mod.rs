//! Incremental zlib/gzip codecs operating stream-to-stream.
//!
//! Thin stateful wrappers around `flate2`'s raw `Compress`/`Decompress`
//! objects. Input is consumed through the buffer's contiguous views and
//! output lands through its scratch interface, so nothing is staged in
//! intermediate vectors. Each wrapper is resumable: feed it data as it
//! arrives and watch the returned [`ZStatus`].

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::stream::MemoryStream;

/// Condensed zlib status triple.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ZStatus {
    /// Progress made (or more input needed); the stream is not finished.
    Ok,
    /// The compressed stream ended cleanly; trailing input is untouched.
    StreamEnd,
    /// The compressed data is broken.
    Corrupt,
}

const GZIP_WINDOW_BITS: u8 = 15;

// ── Shared plumbing ──────────────────────────────────────────────────────────

/// Runs one `compress` step from `input` into a scratch span of `output`.
/// Returns `(consumed, produced, status)`.
fn compress_step(
    c: &mut Compress,
    input: &[u8],
    output: &mut MemoryStream,
    flush: FlushCompress,
) -> Result<(usize, usize, Status), ()> {
    let before_in = c.total_in();
    let before_out = c.total_out();
    let status = {
        let scratch = output.get_scratch();
        match c.compress(input, scratch, flush) {
            Ok(status) => status,
            Err(_) => {
                output.confirm_scratch(0);
                return Err(());
            }
        }
    };
    let produced = (c.total_out() - before_out) as usize;
    output.confirm_scratch(produced);
    Ok(((c.total_in() - before_in) as usize, produced, status))
}

fn decompress_step(
    d: &mut Decompress,
    input: &[u8],
    output: &mut MemoryStream,
) -> Result<(usize, usize, Status), ()> {
    let before_in = d.total_in();
    let before_out = d.total_out();
    let status = {
        let scratch = output.get_scratch();
        match d.decompress(input, scratch, FlushDecompress::None) {
            Ok(status) => status,
            Err(_) => {
                output.confirm_scratch(0);
                return Err(());
            }
        }
    };
    let produced = (d.total_out() - before_out) as usize;
    output.confirm_scratch(produced);
    Ok(((d.total_in() - before_in) as usize, produced, status))
}

/// Drives `compress_step` with empty input until `flush` has fully drained.
fn compress_drain(c: &mut Compress, output: &mut MemoryStream, flush: FlushCompress) -> bool {
    loop {
        match compress_step(c, &[], output, flush) {
            Ok((_, _, Status::StreamEnd)) => return true,
            Ok((_, _, Status::BufError)) => return true,
            Ok((_, produced, Status::Ok)) => {
                // A sync flush is drained once no further output appears; a
                // finish keeps going until StreamEnd.
                if produced == 0 {
                    return true;
                }
            }
            Err(()) => return false,
        }
    }
}

// ── Deflate (zlib-wrapped) ───────────────────────────────────────────────────

/// Streaming zlib compressor.
pub struct ZlibDeflate {
    c: Compress,
}

impl ZlibDeflate {
    pub fn new() -> Self {
        Self::with_level(Compression::default())
    }

    pub fn with_level(level: Compression) -> Self {
        Self { c: Compress::new(level, true) }
    }

    pub fn reset(&mut self) {
        self.c.reset();
    }

    /// Compresses the whole content of `input`, finishing the zlib stream.
    pub fn deflate(&mut self, input: &mut MemoryStream, output: &mut MemoryStream) -> bool {
        self.reset();
        let mut remaining = input.size();
        self.deflate_size(input, output, &mut remaining)
    }

    /// Compresses `input` bytes directly, finishing the zlib stream.
    pub fn deflate_bytes(&mut self, input: &[u8], output: &mut MemoryStream) -> bool {
        self.reset();
        let mut offset = 0;
        while offset < input.len() {
            match compress_step(&mut self.c, &input[offset..], output, FlushCompress::None) {
                Ok((0, 0, _)) => break,
                Ok((consumed, _, _)) => offset += consumed,
                Err(()) => return false,
            }
        }
        compress_drain(&mut self.c, output, FlushCompress::Finish)
    }

    /// Consumes at most `*remaining` bytes from `input`. When the budget is
    /// fully consumed the zlib stream is finished (trailer flushed);
    /// otherwise pending output is sync-flushed so every call produces
    /// decodable bytes. `*remaining` is decremented by the bytes consumed.
    pub fn deflate_size(
        &mut self,
        input: &mut MemoryStream,
        output: &mut MemoryStream,
        remaining: &mut usize,
    ) -> bool {
        while *remaining > 0 && !input.is_empty() {
            let step = {
                let chunk = match input.chunks().next() {
                    Some(c) => c,
                    None => break,
                };
                let take = chunk.len().min(*remaining);
                compress_step(&mut self.c, &chunk[..take], output, FlushCompress::None)
            };
            match step {
                Ok((consumed, produced, _)) => {
                    input.skip(consumed);
                    *remaining -= consumed;
                    if consumed == 0 && produced == 0 {
                        break;
                    }
                }
                Err(()) => return false,
            }
        }
        let flush = if *remaining == 0 { FlushCompress::Finish } else { FlushCompress::Sync };
        compress_drain(&mut self.c, output, flush)
    }
}

impl Default for ZlibDeflate {
    fn default() -> Self {
        Self::new()
    }
}

// ── Inflate (zlib-wrapped) ───────────────────────────────────────────────────

/// Streaming zlib decompressor.
pub struct ZlibInflate {
    d: Decompress,
}

impl ZlibInflate {
    pub fn new() -> Self {
        Self { d: Decompress::new(true) }
    }

    pub fn reset(&mut self) {
        self.d.reset(true);
    }

    /// Decompresses one whole zlib stream from `input`. Resets first; a
    /// clean end returns [`ZStatus::StreamEnd`].
    pub fn inflate(&mut self, input: &mut MemoryStream, output: &mut MemoryStream) -> ZStatus {
        self.reset();
        self.inflate_chunk(input, output)
    }

    /// Resumable decompression: consumes what it can from `input`, appends
    /// plaintext to `output`, and reports whether the stream finished.
    pub fn inflate_chunk(&mut self, input: &mut MemoryStream, output: &mut MemoryStream) -> ZStatus {
        pump_decompress(&mut self.d, input, output)
    }
}

impl Default for ZlibInflate {
    fn default() -> Self {
        Self::new()
    }
}

fn pump_decompress(
    d: &mut Decompress,
    input: &mut MemoryStream,
    output: &mut MemoryStream,
) -> ZStatus {
    loop {
        let step = {
            let chunk = match input.chunks().next() {
                Some(c) => c,
                None => return ZStatus::Ok,
            };
            decompress_step(d, chunk, output)
        };
        match step {
            Ok((consumed, produced, status)) => {
                input.skip(consumed);
                match status {
                    Status::StreamEnd => return ZStatus::StreamEnd,
                    Status::BufError => return ZStatus::Ok,
                    Status::Ok => {
                        // Zero progress on both sides means "need more
                        // input"; a full scratch span alone does not.
                        if consumed == 0 && produced == 0 {
                            return ZStatus::Ok;
                        }
                    }
                }
            }
            Err(()) => return ZStatus::Corrupt,
        }
    }
}

// ── Gzip ─────────────────────────────────────────────────────────────────────

/// Streaming gzip compressor with explicit begin / continue / end phases
/// for chunked transfer, plus a one-shot `encode`.
pub struct GzipEncoder {
    c: Compress,
}

impl GzipEncoder {
    pub fn new() -> Self {
        Self::with_level(Compression::default())
    }

    pub fn with_level(level: Compression) -> Self {
        Self { c: Compress::new_gzip(level, GZIP_WINDOW_BITS) }
    }

    /// Starts a fresh gzip member; header bytes appear with the first
    /// produced output.
    pub fn begin_encoding(&mut self) {
        self.c.reset();
    }

    /// Feeds the whole of `input` into the current member and sync-flushes
    /// so the bytes written so far decode on the receiving side.
    pub fn continue_encoding(&mut self, input: &mut MemoryStream, output: &mut MemoryStream) -> bool {
        while !input.is_empty() {
            let step = {
                let chunk = match input.chunks().next() {
                    Some(c) => c,
                    None => break,
                };
                compress_step(&mut self.c, chunk, output, FlushCompress::None)
            };
            match step {
                Ok((consumed, produced, _)) => {
                    input.skip(consumed);
                    if consumed == 0 && produced == 0 {
                        break;
                    }
                }
                Err(()) => return false,
            }
        }
        compress_drain(&mut self.c, output, FlushCompress::Sync)
    }

    /// Finishes the member, emitting the gzip trailer.
    pub fn end_encoding(&mut self, output: &mut MemoryStream) -> bool {
        compress_drain(&mut self.c, output, FlushCompress::Finish)
    }

    /// One-shot: encodes the whole of `input` as a complete gzip member.
    pub fn encode(&mut self, input: &mut MemoryStream, output: &mut MemoryStream) -> bool {
        self.begin_encoding();
        if !self.continue_encoding(input, output) {
            return false;
        }
        self.end_encoding(output)
    }
}

impl Default for GzipEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Streaming gzip decompressor.
pub struct GzipDecoder {
    d: Decompress,
}

impl GzipDecoder {
    /// Bytes worth accumulating before a decode attempt — smaller inputs
    /// cannot even hold the gzip header.
    pub const MIN_DECODE_SIZE: usize = 10;

    pub fn new() -> Self {
        Self { d: Decompress::new_gzip(GZIP_WINDOW_BITS) }
    }

    pub fn reset(&mut self) {
        self.d = Decompress::new_gzip(GZIP_WINDOW_BITS);
    }

    /// Resumable decode; consumes what it can from `input` and appends the
    /// plaintext to `output`. Input past a clean stream end is untouched.
    pub fn decode(&mut self, input: &mut MemoryStream, output: &mut MemoryStream) -> ZStatus {
        pump_decompress(&mut self.d, input, output)
    }
}

impl Default for GzipDecoder {
    fn default() -> Self {
        Self::new()
    }
}

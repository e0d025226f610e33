//! Record framing — length-delimited records inside CRC-chained fixed-size
//! blocks.
//!
//! # On-disk layout
//!
//! ```text
//! block := fragment* zero-padding trailer
//! fragment := flags(1) payload_len(3 BE) payload
//!   flags: HAS_CONT=1  payload continues in the next fragment
//!          IS_ZIPPED=2 record payload is zlib-deflated
//!          IS_FIRST=4  first fragment of a record
//! trailer (12 octets at the end of every block):
//!   content_size  i32 BE   bytes of fragment data in this block
//!   prev_crc      u32 BE   crc of the previous block (0 at a chain start)
//!   crc           u32 BE   crc32(content ∥ padding ∥ content_size ∥ prev_crc)
//! ```
//!
//! Records may span blocks; a record with a deflated payload is compressed
//! first and fragmented after. The writer stages fragments into a block
//! buffer and emits the block once a record forces an overflow or the
//! staged content passes the dumpable threshold.
//!
//! # Corruption recovery
//!
//! Corruption is local to a block: the reader drops the bad block, discards
//! any half-assembled record, and skips fragments until the next `IS_FIRST`.
//! A broken chain with a partial record in flight recovers silently; with
//! no partial record it is reported (callers count it and continue).

use byteorder::BigEndian;
use tracing::warn;

use crate::stream::MemoryStream;
use crate::zlib::{ZStatus, ZlibDeflate, ZlibInflate};

/// Default block size used by the log and checkpoint layers.
pub const DEFAULT_BLOCK_SIZE: usize = 65536;
/// Blocks must stay under 16 MiB so fragment lengths fit in 24 bits.
pub const MAX_BLOCK_SIZE: usize = 0x00FF_FFFF;

pub(crate) const BLOCK_TRAILER_SIZE: usize = 12;
const RECORD_HEADER_SIZE: usize = 4;

pub const FLAG_HAS_CONT: u8 = 1;
pub const FLAG_IS_ZIPPED: u8 = 2;
pub const FLAG_IS_FIRST: u8 = 4;

const ZERO_PAD: [u8; 4096] = [0u8; 4096];

/// CRC-32 over everything currently buffered, nothing consumed.
pub(crate) fn stream_crc(buf: &MemoryStream) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    for chunk in buf.chunks() {
        hasher.update(chunk);
    }
    hasher.finalize()
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct RecordWriter {
    block_size: usize,
    /// Finalize the staged block once its content passes this.
    dumpable_size: usize,
    content: MemoryStream,
    zlib: Option<ZlibDeflate>,
    zlib_content: MemoryStream,
    /// Fragments staged in the current block.
    record_count: u32,
    prev_block_crc: u32,
}

impl RecordWriter {
    pub fn new(block_size: usize) -> Self {
        Self::with_options(block_size, false, 0.9)
    }

    pub fn with_options(block_size: usize, deflate: bool, dumpable_percent: f32) -> Self {
        assert!(block_size < MAX_BLOCK_SIZE, "block size over 24-bit limit");
        assert!(
            block_size > BLOCK_TRAILER_SIZE + RECORD_HEADER_SIZE,
            "block size too small for a fragment"
        );
        let dumpable_size =
            (dumpable_percent * (block_size - BLOCK_TRAILER_SIZE) as f32) as usize;
        Self {
            block_size,
            dumpable_size,
            content: MemoryStream::with_block_size(block_size),
            zlib: deflate.then(ZlibDeflate::new),
            zlib_content: MemoryStream::with_block_size(block_size),
            record_count: 0,
            prev_block_crc: 0,
        }
    }

    /// Appends one record. Returns true when `out` received at least one
    /// finished block ready to be written out in one shot.
    pub fn append_record(&mut self, data: &[u8], out: &mut MemoryStream) -> bool {
        if self.zlib.is_some() {
            debug_assert!(self.zlib_content.is_empty());
            let mut zipped = std::mem::take(&mut self.zlib_content);
            let ok = self.zlib.as_mut().unwrap().deflate_bytes(data, &mut zipped);
            assert!(ok, "deflate of record payload failed");
            let produced = self.append_fragments(&mut zipped, out, true);
            self.zlib_content = zipped;
            return produced;
        }
        let mut input = MemoryStream::with_block_size(self.block_size);
        input.write(data);
        self.append_fragments(&mut input, out, false)
    }

    /// As [`append_record`](Self::append_record), consuming a stream.
    pub fn append_stream_record(&mut self, input: &mut MemoryStream, out: &mut MemoryStream) -> bool {
        if self.zlib.is_some() {
            debug_assert!(self.zlib_content.is_empty());
            let mut zipped = std::mem::take(&mut self.zlib_content);
            let ok = self.zlib.as_mut().unwrap().deflate(input, &mut zipped);
            assert!(ok, "deflate of record payload failed");
            let produced = self.append_fragments(&mut zipped, out, true);
            self.zlib_content = zipped;
            return produced;
        }
        self.append_fragments(input, out, false)
    }

    fn append_fragments(
        &mut self,
        input: &mut MemoryStream,
        out: &mut MemoryStream,
        is_zipped: bool,
    ) -> bool {
        let mut is_first = true;
        let mut blocks_written = 0u32;
        // A zero-length record is a legal (empty) value, hence the do-while
        // shape: always emit at least one fragment.
        loop {
            let available = self.block_size
                - BLOCK_TRAILER_SIZE
                - RECORD_HEADER_SIZE
                - self.content.size();
            let mut flags = if is_first { FLAG_IS_FIRST } else { 0 };
            if is_zipped {
                flags |= FLAG_IS_ZIPPED;
            }
            if input.size() <= available {
                // Whole remainder fits in the current block.
                self.content.write_u8(flags);
                self.content.write_u24::<BigEndian>(input.size() as u32);
                self.content.append_stream(input, None);
                self.record_count += 1;
                break;
            }
            // Partial fragment, then seal the block and keep going.
            self.content.write_u8(flags | FLAG_HAS_CONT);
            self.content.write_u24::<BigEndian>(available as u32);
            self.content.append_stream(input, Some(available));
            self.record_count += 1;
            is_first = false;
            self.finalize_content(out);
            blocks_written += 1;
        }
        if self.content.size() > self.dumpable_size {
            self.finalize_content(out);
            blocks_written += 1;
        }
        blocks_written >= 1
    }

    /// Seals the staged block: zero padding, trailer, CRC chain. No-op when
    /// nothing is staged.
    pub fn finalize_content(&mut self, out: &mut MemoryStream) {
        if self.content.is_empty() {
            return;
        }
        let content_size = self.content.size();
        let mut padding = self.block_size - content_size - BLOCK_TRAILER_SIZE;
        while padding > 0 {
            let n = padding.min(ZERO_PAD.len());
            self.content.write(&ZERO_PAD[..n]);
            padding -= n;
        }
        self.content.write_i32::<BigEndian>(content_size as i32);
        self.content.write_u32::<BigEndian>(self.prev_block_crc);
        let crc = stream_crc(&self.content);
        self.content.write_u32::<BigEndian>(crc);
        out.append_stream(&mut self.content, None);
        self.prev_block_crc = crc;
        debug_assert!(self.content.is_empty());
        self.record_count = 0;
    }

    /// Fragments staged in the not-yet-sealed block.
    pub fn pending_record_count(&self) -> u32 {
        self.record_count
    }

    /// Bytes staged in the not-yet-sealed block.
    pub fn leftover(&self) -> usize {
        self.content.size()
    }

    /// Restarts the CRC chain; the next sealed block carries `prev_crc = 0`.
    pub fn reset_chain(&mut self) {
        self.prev_block_crc = 0;
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Outcome of one [`RecordReader::read_record`] call.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReadResult {
    /// A complete record landed in `out` (or was consumed and dropped).
    Ok,
    /// Not enough input buffered for the next whole block.
    NoData,
    /// Block CRC mismatch or fragment stream inconsistency.
    CrcCorrupted,
    /// Record decompression failed.
    ZipCorrupted,
    /// The previous-block CRC chain does not line up.
    CrcBlockBroken,
}

impl ReadResult {
    pub fn name(self) -> &'static str {
        match self {
            ReadResult::Ok => "READ_OK",
            ReadResult::NoData => "READ_NO_DATA",
            ReadResult::CrcCorrupted => "READ_CRC_CORRUPTED",
            ReadResult::ZipCorrupted => "READ_ZIP_CORRUPTED",
            ReadResult::CrcBlockBroken => "READ_CRC_BLOCK_BROKEN",
        }
    }
}

pub struct RecordReader {
    block_size: usize,
    /// Verified fragment data from the block being consumed.
    content: MemoryStream,
    /// Accumulates one record across fragments (and blocks).
    record_content: MemoryStream,
    zlib: ZlibInflate,
    prev_block_crc: u32,
    /// Set while discarding the fragments of a record known to be bad.
    skip_record: bool,
    /// Fragments consumed from the block currently in `content`; this is
    /// the in-block record index the log layer reports from `tell`.
    fragments_consumed: u32,
}

impl RecordReader {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            content: MemoryStream::with_block_size(block_size),
            record_content: MemoryStream::with_block_size(block_size),
            zlib: ZlibInflate::new(),
            prev_block_crc: 0,
            skip_record: false,
            fragments_consumed: 0,
        }
    }

    /// Back to the post-open state (used by seek). The CRC chain restarts,
    /// so the next block's `prev_crc` is not checked.
    pub fn reset(&mut self) {
        self.content.clear();
        self.record_content.clear();
        self.prev_block_crc = 0;
        self.skip_record = false;
        self.fragments_consumed = 0;
    }

    /// True while part of a block is still being consumed.
    pub fn has_block_content(&self) -> bool {
        !self.content.is_empty()
    }

    /// Fragments consumed so far from the block being consumed.
    pub fn block_record_index(&self) -> u32 {
        self.fragments_consumed
    }

    /// Pulls the next whole block out of `input` and verifies it.
    fn read_next_block(&mut self, input: &mut MemoryStream) -> ReadResult {
        if input.size() < self.block_size {
            return ReadResult::NoData;
        }
        let mut block = MemoryStream::with_block_size(self.block_size);
        block.append_stream(input, Some(self.block_size - BLOCK_TRAILER_SIZE));
        let content_size = input.read_i32::<BigEndian>();
        let prev_crc = input.read_u32::<BigEndian>();
        let crc = input.read_u32::<BigEndian>();
        block.write_i32::<BigEndian>(content_size);
        block.write_u32::<BigEndian>(prev_crc);
        let expected_crc = stream_crc(&block);

        if expected_crc != crc
            || content_size < 0
            || content_size as usize > self.block_size - BLOCK_TRAILER_SIZE
        {
            warn!(
                crc,
                expected_crc, content_size, "block failed CRC verification"
            );
            return ReadResult::CrcCorrupted;
        }
        let mut ret = ReadResult::Ok;
        // prev_crc is 0 when a writer continued an existing log; our own
        // prev is 0 right after open or seek. Neither is an error.
        if prev_crc != 0 && self.prev_block_crc != 0 && prev_crc != self.prev_block_crc {
            warn!(
                prev_crc,
                expected = self.prev_block_crc,
                "block chain out of order"
            );
            ret = ReadResult::CrcBlockBroken;
        }
        self.prev_block_crc = crc;
        self.content.append_stream(&mut block, Some(content_size as usize));
        self.fragments_consumed = 0;
        ret
    }

    fn skip_one_fragment(&mut self) {
        let flags = self.content.read_u8();
        let len = self.content.read_u24::<BigEndian>() as usize;
        self.content.skip(len);
        self.fragments_consumed += 1;
        self.skip_record = flags & FLAG_HAS_CONT != 0;
    }

    /// Skips exactly `n` fragments inside the current block, feeding a
    /// block from `input` first when needed. Used by positioned seeks.
    pub fn skip_record_fragments(&mut self, input: &mut MemoryStream, n: u32) -> ReadResult {
        for _ in 0..n {
            if self.content.is_empty() {
                let ret = self.read_next_block(input);
                if ret != ReadResult::Ok {
                    return ret;
                }
            }
            let _flags = self.content.read_u8();
            let len = self.content.read_u24::<BigEndian>() as usize;
            self.content.skip(len);
            self.fragments_consumed += 1;
        }
        ReadResult::Ok
    }

    /// Reads the next record. With `out = None` the record is consumed and
    /// discarded. `num_skipped` accumulates skipped fragments; a nonzero
    /// `max_skips` bounds the work done in one call (the call then returns
    /// `Ok` early without a record).
    pub fn read_record(
        &mut self,
        input: &mut MemoryStream,
        mut out: Option<&mut MemoryStream>,
        num_skipped: &mut usize,
        max_skips: usize,
    ) -> ReadResult {
        loop {
            if self.content.is_empty() {
                let mut ret = self.read_next_block(input);
                if ret == ReadResult::CrcBlockBroken && !self.record_content.is_empty() {
                    // A record was in flight across the break: drop it and
                    // resynchronize silently.
                    self.skip_record = true;
                    ret = ReadResult::Ok;
                }
                if ret != ReadResult::Ok {
                    return ret;
                }
            }
            // Discard the remainder of a record known to be bad.
            while self.skip_record && !self.content.is_empty() {
                *num_skipped += 1;
                self.skip_one_fragment();
                if max_skips != 0 && *num_skipped >= max_skips {
                    return ReadResult::Ok;
                }
            }
            if self.content.is_empty() {
                continue;
            }

            let flags = self.content.read_u8();
            let len = self.content.read_u24::<BigEndian>() as usize;
            self.fragments_consumed += 1;

            if flags & FLAG_IS_FIRST != 0 && !self.record_content.is_empty() {
                // IS_FIRST in the middle of a record: stream inconsistency.
                *num_skipped += 1;
                self.content.skip(len);
                self.record_content.clear();
                return ReadResult::CrcCorrupted;
            }
            if out.is_some() && self.record_content.is_empty() && flags & FLAG_IS_FIRST == 0 {
                // A continuation with no record in progress: the stream was
                // entered mid-record (seek landed after an IS_FIRST).
                self.content.skip(len);
                *num_skipped += 1;
                if max_skips != 0 && *num_skipped >= max_skips {
                    return ReadResult::Ok;
                }
                continue;
            }
            if out.is_some() {
                self.record_content.append_stream(&mut self.content, Some(len));
            } else {
                self.content.skip(len);
            }
            if flags & FLAG_HAS_CONT != 0 {
                continue;
            }

            // Record complete.
            let Some(out) = out.as_deref_mut() else {
                self.record_content.clear();
                return ReadResult::Ok;
            };
            if flags & FLAG_IS_ZIPPED != 0 {
                let status = self.zlib.inflate(&mut self.record_content, out);
                self.record_content.clear();
                return if status == ZStatus::StreamEnd {
                    ReadResult::Ok
                } else {
                    ReadResult::ZipCorrupted
                };
            }
            out.append_stream(&mut self.record_content, None);
            debug_assert!(self.record_content.is_empty());
            return ReadResult::Ok;
        }
    }
}

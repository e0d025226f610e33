//! Chunked byte buffer — the memory stream every other subsystem reads and
//! writes through.
//!
//! # Model
//!
//! A [`MemoryStream`] is an ordered run of octets stored as a deque of
//! reference-counted blocks plus one uniquely-owned, still-growing tail
//! block. Published blocks are immutable and can be shared between streams
//! without copying; the tail freezes into a shared block the moment it is
//! filled, shared, or followed by an appended block.
//!
//! The stream owns a read pointer `(block id, offset)`, an implicit write
//! pointer (the end of the last block), and a stack of markers. Setting a
//! marker pins every block at or after the marked position; restoring
//! rewinds the read side; clearing commits forgetting. Blocks strictly
//! before both the read pointer and the earliest live marker are retired.
//!
//! # Failure model
//!
//! All failures here are caller bugs (an unconfirmed scratch, a marker
//! underflow, clearing with a marker outstanding) and panic. Running out of
//! data is not a failure: reads return short counts, line reads return
//! `None` until a full line is buffered.
//!
//! Not thread safe. Shared (`&`) access from several threads is fine as
//! long as nobody mutates.

mod block;
mod num;

pub use block::{BlockId, DataBlock, Disposer};

use std::collections::VecDeque;
use std::io::IoSlice;
use std::sync::Arc;

/// Default allocation size for blocks created by the write path.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Read pointer / marker position: block id plus offset inside that block.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct Pointer {
    id: BlockId,
    pos: usize,
}

struct Marker {
    size: usize,
    ptr: Pointer,
}

/// Still-writable tail block. `buf` is fully allocated (and zeroed) up
/// front; `used` marks the published prefix.
struct Tail {
    buf: Box<[u8]>,
    used: usize,
}

/// Outcome of [`MemoryStream::read_next_ascii_token`].
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum TokenRead {
    /// A complete token: a separator by itself, a blank-delimited word, or
    /// the unquoted, unescaped content of a quoted string.
    Ok(Vec<u8>),
    /// Not enough buffered data to produce a token; nothing was consumed
    /// except leading blanks.
    NoData,
}

pub struct MemoryStream {
    block_size: usize,
    blocks: VecDeque<Arc<DataBlock>>,
    /// Id of `blocks[0]`; the tail (when present) is `begin_id + blocks.len()`.
    begin_id: BlockId,
    tail: Option<Tail>,
    read: Pointer,
    markers: Vec<Marker>,
    /// Appends after `marker_set` invalidate the size snapshots; restore
    /// then recomputes from pointer distance.
    markers_size_invalid: bool,
    /// Offset inside the tail where the outstanding scratch began.
    scratch: Option<usize>,
    size: usize,
}

impl MemoryStream {
    pub fn new() -> Self {
        Self::with_block_size(DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self {
            block_size,
            blocks: VecDeque::new(),
            begin_id: 0,
            tail: None,
            read: Pointer { id: 0, pos: 0 },
            markers: Vec::new(),
            markers_size_invalid: false,
            scratch: None,
            size: 0,
        }
    }

    #[inline]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Drops all content. Ids keep increasing across a clear, so stale
    /// markers can never alias new blocks — which is also why clearing with
    /// a live marker is rejected.
    pub fn clear(&mut self) {
        assert!(self.markers.is_empty(), "clear with a marker outstanding");
        assert!(self.scratch.is_none(), "clear with an unconfirmed scratch");
        self.begin_id = self.end_id();
        self.blocks.clear();
        self.tail = None;
        self.read = Pointer { id: self.begin_id, pos: 0 };
        self.size = 0;
    }

    // ── Block geometry ──────────────────────────────────────────────────────

    fn end_id(&self) -> BlockId {
        self.begin_id + self.blocks.len() as BlockId + u64::from(self.tail.is_some())
    }

    fn tail_id(&self) -> BlockId {
        self.begin_id + self.blocks.len() as BlockId
    }

    fn block_len(&self, id: BlockId) -> usize {
        let idx = (id - self.begin_id) as usize;
        if idx < self.blocks.len() {
            self.blocks[idx].len()
        } else {
            self.tail.as_ref().map_or(0, |t| t.used)
        }
    }

    fn block_slice(&self, id: BlockId) -> &[u8] {
        let idx = (id - self.begin_id) as usize;
        if idx < self.blocks.len() {
            self.blocks[idx].as_slice()
        } else {
            let tail = self.tail.as_ref().expect("block id out of range");
            &tail.buf[..tail.used]
        }
    }

    /// Bytes between `from` and the write pointer. The write pointer always
    /// sits at the end of the last block, so this is a plain suffix sum.
    fn distance_to_end(&self, from: Pointer) -> usize {
        let end = self.end_id();
        if from.id >= end {
            return 0;
        }
        let mut total = 0usize;
        let mut id = from.id;
        while id < end {
            total += self.block_len(id);
            id += 1;
        }
        total - from.pos
    }

    /// Skips the read pointer over exhausted blocks.
    fn normalize_read(&mut self) {
        let end = self.end_id();
        while self.read.id < end
            && self.read.pos >= self.block_len(self.read.id)
            && self.read.id + 1 < end
        {
            self.read = Pointer { id: self.read.id + 1, pos: 0 };
        }
    }

    /// Publishes the tail as a frozen, shareable block. An empty tail is
    /// simply dropped; its id is inherited by whatever block comes next,
    /// which denotes the same byte position.
    fn freeze_tail(&mut self) {
        if let Some(tail) = self.tail.take() {
            if tail.used > 0 {
                let mut data = tail.buf.into_vec();
                data.truncate(tail.used);
                self.blocks.push_back(DataBlock::shared(data));
            }
        }
    }

    fn ensure_tail(&mut self, at_least: usize) {
        let full = self.tail.as_ref().map_or(true, |t| t.used == t.buf.len());
        if full {
            self.freeze_tail();
            let cap = at_least.max(self.block_size);
            self.tail = Some(Tail { buf: vec![0u8; cap].into_boxed_slice(), used: 0 });
        }
    }

    /// Retires blocks that are behind the read pointer and behind the
    /// earliest live marker.
    fn maybe_dispose_blocks(&mut self) {
        let floor = match self.markers.first() {
            Some(marker) => marker.ptr.id.min(self.read.id),
            None => self.read.id,
        };
        while !self.blocks.is_empty() && self.begin_id < floor {
            self.blocks.pop_front();
            self.begin_id += 1;
        }
    }

    // ── Fast interface: block-level appends and reads ───────────────────────

    /// Shares an existing block; the stream takes one reference.
    pub fn append_block(&mut self, block: Arc<DataBlock>) {
        assert!(self.scratch.is_none(), "append with an unconfirmed scratch");
        self.freeze_tail();
        self.markers_size_invalid = true;
        self.size += block.len();
        self.blocks.push_back(block);
    }

    /// Adopts externally produced bytes as a block without copying. The
    /// disposer, if any, runs when the last stream referencing the block
    /// drops it. Never append the same allocation to two streams; share the
    /// block or use [`append_stream`](Self::append_stream) instead.
    pub fn append_external(&mut self, data: Box<[u8]>, disposer: Option<Disposer>) {
        self.append_block(Arc::new(DataBlock::external(data, disposer)));
    }

    /// Hands out the next contiguous span and retires it from the read side.
    /// Returns `None` at end of buffer.
    pub fn read_next(&mut self) -> Option<&[u8]> {
        assert!(self.scratch.is_none(), "read with an unconfirmed scratch");
        self.maybe_dispose_blocks();
        self.normalize_read();
        let start = self.read;
        let len = self.block_len(start.id);
        if start.pos >= len {
            return None;
        }
        self.read = Pointer { id: start.id, pos: len };
        self.size -= len - start.pos;
        Some(&self.block_slice(start.id)[start.pos..len])
    }

    /// A vectored-write view over the buffered spans, up to `max_size`
    /// bytes. Nothing is consumed; commit with [`skip`](Self::skip) after
    /// the `writev`.
    pub fn read_for_writev(&self, max_size: usize) -> Vec<IoSlice<'_>> {
        assert!(self.scratch.is_none(), "read with an unconfirmed scratch");
        let mut out = Vec::new();
        let mut left = max_size;
        for chunk in self.chunks() {
            if left == 0 {
                break;
            }
            let take = chunk.len().min(left);
            out.push(IoSlice::new(&chunk[..take]));
            left -= take;
        }
        out
    }

    /// Reserves a writable span inside the active write block. The span is
    /// committed (in full or in part) by [`confirm_scratch`](Self::confirm_scratch);
    /// requesting a second scratch before confirming the first is a bug.
    pub fn get_scratch(&mut self) -> &mut [u8] {
        assert!(self.scratch.is_none(), "scratch requested twice");
        self.markers_size_invalid = true;
        self.ensure_tail(1);
        let used = self.tail.as_ref().unwrap().used;
        self.scratch = Some(used);
        &mut self.tail.as_mut().unwrap().buf[used..]
    }

    /// Commits `used` bytes of the outstanding scratch span.
    pub fn confirm_scratch(&mut self, used: usize) {
        let start = self.scratch.take().expect("confirm without a scratch");
        let tail = self.tail.as_mut().expect("scratch tail vanished");
        assert!(start + used <= tail.buf.len(), "scratch overrun");
        tail.used = start + used;
        self.markers_size_invalid = true;
        self.size += used;
    }

    // ── Copying interface ───────────────────────────────────────────────────

    /// Copies bytes in, growing the last block up to its capacity and then
    /// allocating `max(remaining, block_size)` blocks.
    pub fn write(&mut self, data: &[u8]) -> usize {
        assert!(self.scratch.is_none(), "write with an unconfirmed scratch");
        self.markers_size_invalid = true;
        let mut rest = data;
        while !rest.is_empty() {
            self.ensure_tail(rest.len());
            let tail = self.tail.as_mut().unwrap();
            let n = rest.len().min(tail.buf.len() - tail.used);
            tail.buf[tail.used..tail.used + n].copy_from_slice(&rest[..n]);
            tail.used += n;
            self.size += n;
            rest = &rest[n..];
        }
        data.len()
    }

    /// Bulk copy out; may span blocks. Returns the bytes actually read.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        assert!(self.scratch.is_none(), "read with an unconfirmed scratch");
        let mut done = 0;
        while done < dst.len() {
            self.normalize_read();
            let len = self.block_len(self.read.id);
            if self.read.pos >= len {
                break;
            }
            let n = (len - self.read.pos).min(dst.len() - done);
            let src = &self.block_slice(self.read.id)[self.read.pos..self.read.pos + n];
            dst[done..done + n].copy_from_slice(src);
            self.read.pos += n;
            self.size -= n;
            done += n;
        }
        self.maybe_dispose_blocks();
        done
    }

    /// Reads exactly `len` bytes into a fresh vector (short at end of data).
    pub fn read_vec(&mut self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len.min(self.size)];
        let n = self.read(&mut out);
        out.truncate(n);
        out
    }

    /// Consumes and returns everything buffered.
    pub fn read_all(&mut self) -> Vec<u8> {
        self.read_vec(self.size)
    }

    /// As [`read`](Self::read), without advancing the read side.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let mut done = 0;
        for chunk in self.chunks() {
            if done == dst.len() {
                break;
            }
            let n = chunk.len().min(dst.len() - done);
            dst[done..done + n].copy_from_slice(&chunk[..n]);
            done += n;
        }
        done
    }

    /// Copy of the whole buffered content, nothing consumed.
    pub fn peek_all(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.size];
        let n = self.peek(&mut out);
        debug_assert_eq!(n, out.len());
        out
    }

    /// Advances the read pointer without copying. Returns the bytes skipped.
    pub fn skip(&mut self, len: usize) -> usize {
        let mut left = len;
        while left > 0 {
            self.normalize_read();
            let blen = self.block_len(self.read.id);
            if self.read.pos >= blen {
                break;
            }
            let n = (blen - self.read.pos).min(left);
            self.read.pos += n;
            self.size -= n;
            left -= n;
        }
        self.maybe_dispose_blocks();
        len - left
    }

    // ── Stream-to-stream appends ────────────────────────────────────────────

    /// Moves up to `size` bytes (all of `src` when `None`) from `src` to
    /// the end of this stream. Whole frozen blocks are shared instead of
    /// copied; partial ranges are copied into fresh blocks.
    pub fn append_stream(&mut self, src: &mut MemoryStream, size: Option<usize>) {
        assert!(self.scratch.is_none(), "append with an unconfirmed scratch");
        let mut left = size.unwrap_or(src.size).min(src.size);
        self.markers_size_invalid = true;
        while left > 0 {
            src.normalize_read();
            let id = src.read.id;
            let blen = src.block_len(id);
            // A full tail about to be moved wholesale freezes first so the
            // share path applies to it too.
            if src.read.pos == 0
                && blen > 0
                && blen <= left
                && src.tail.is_some()
                && id == src.tail_id()
                && src.markers.is_empty()
            {
                src.freeze_tail();
            }
            let idx = (id - src.begin_id) as usize;
            if src.read.pos == 0 && blen > 0 && blen <= left && idx < src.blocks.len() {
                // Exact block range: share the reference.
                let block = Arc::clone(&src.blocks[idx]);
                src.read = Pointer { id, pos: blen };
                src.size -= blen;
                left -= blen;
                self.freeze_tail();
                self.size += block.len();
                self.blocks.push_back(block);
            } else {
                let n = (blen - src.read.pos).min(left);
                if n == 0 {
                    break;
                }
                let start = src.read.pos;
                // Copy via a temporary to end the borrow of src's storage.
                let piece = src.block_slice(id)[start..start + n].to_vec();
                self.write(&piece);
                src.read.pos += n;
                src.size -= n;
                left -= n;
            }
        }
        src.maybe_dispose_blocks();
    }

    /// As [`append_stream`](Self::append_stream), but leaves `src` intact.
    pub fn append_stream_non_destructive(&mut self, src: &MemoryStream, size: Option<usize>) {
        assert!(self.scratch.is_none(), "append with an unconfirmed scratch");
        let mut left = size.unwrap_or(src.size).min(src.size);
        self.markers_size_invalid = true;
        let mut ptr = src.read;
        let end = src.end_id();
        while left > 0 && ptr.id < end {
            let blen = src.block_len(ptr.id);
            if ptr.pos >= blen {
                ptr = Pointer { id: ptr.id + 1, pos: 0 };
                continue;
            }
            let idx = (ptr.id - src.begin_id) as usize;
            if ptr.pos == 0 && blen <= left && idx < src.blocks.len() {
                let block = Arc::clone(&src.blocks[idx]);
                ptr = Pointer { id: ptr.id, pos: blen };
                left -= blen;
                self.freeze_tail();
                self.size += block.len();
                self.blocks.push_back(block);
            } else {
                let n = (blen - ptr.pos).min(left);
                let piece = src.block_slice(ptr.id)[ptr.pos..ptr.pos + n].to_vec();
                self.write(&piece);
                ptr.pos += n;
                left -= n;
            }
        }
    }

    // ── Markers ─────────────────────────────────────────────────────────────

    /// Saves the read position (and size) on the marker stack.
    pub fn marker_set(&mut self) {
        if self.markers.is_empty() {
            self.markers_size_invalid = false;
        }
        self.markers.push(Marker { size: self.size, ptr: self.read });
    }

    pub fn marker_is_set(&self) -> bool {
        !self.markers.is_empty()
    }

    /// Rewinds the read side to the most recent marker. If an append
    /// invalidated the snapshot, the size is recomputed from the pointers.
    pub fn marker_restore(&mut self) {
        let marker = self.markers.pop().expect("marker underflow");
        self.read = marker.ptr;
        self.size = if self.markers_size_invalid {
            self.distance_to_end(self.read)
        } else {
            marker.size
        };
    }

    /// Forgets the most recent marker, allowing its blocks to retire.
    pub fn marker_clear(&mut self) {
        self.markers.pop().expect("marker underflow");
        self.maybe_dispose_blocks();
    }

    // ── Line and token reads ────────────────────────────────────────────────

    /// Length of the prefix ending in the first `needle` byte (LF), with an
    /// optional required preceding CR. `None` when no terminator is buffered.
    fn find_line_end(&self, require_cr: bool) -> Option<usize> {
        let mut offset = 0usize;
        let mut prev_cr = false;
        for chunk in self.chunks() {
            for (i, &b) in chunk.iter().enumerate() {
                if b == b'\n' && (!require_cr || prev_cr) {
                    return Some(offset + i + 1);
                }
                prev_cr = b == b'\r';
            }
            offset += chunk.len();
        }
        None
    }

    /// Reads up to and including the first CRLF. Returns `None` (consuming
    /// nothing) until a full line is buffered.
    pub fn read_crlf_line(&mut self) -> Option<Vec<u8>> {
        let len = self.find_line_end(true)?;
        Some(self.read_vec(len))
    }

    /// Reads up to and including the first LF.
    pub fn read_lf_line(&mut self) -> Option<Vec<u8>> {
        let len = self.find_line_end(false)?;
        Some(self.read_vec(len))
    }

    /// Reads a CRLF line and strips every trailing CR/LF byte.
    pub fn read_line(&mut self) -> Option<Vec<u8>> {
        let mut line = self.read_crlf_line()?;
        while matches!(line.last(), Some(b'\r') | Some(b'\n')) {
            line.pop();
        }
        Some(line)
    }

    /// Reads the next ASCII token: leading blanks are consumed, a separator
    /// char is a token by itself, a `"`/`'` quoted string is returned with
    /// quotes stripped and backslash escapes resolved, anything else is a
    /// run of non-blank, non-separator bytes. An unterminated quote leaves
    /// the quoted bytes unconsumed and returns [`TokenRead::NoData`].
    pub fn read_next_ascii_token(&mut self) -> TokenRead {
        fn is_blank(b: u8) -> bool {
            b == b' ' || b == b'\t'
        }
        fn is_separator(b: u8) -> bool {
            matches!(b, b'(' | b')' | b'[' | b']' | b'{' | b'}' | b'<' | b'>'
                | b'@' | b',' | b';' | b':' | b'=' | b'?' | b'/')
        }

        // Pass over blanks first; these are consumed even when no token
        // materializes.
        loop {
            let Some(&b) = self.chunks().flatten().next() else {
                return TokenRead::NoData;
            };
            if !is_blank(b) {
                break;
            }
            self.skip(1);
        }

        let first = self.chunks().flatten().next().copied().unwrap();
        if is_separator(first) {
            self.skip(1);
            return TokenRead::Ok(vec![first]);
        }
        if first == b'"' || first == b'\'' {
            // Scan for the matching quote, honoring backslash escapes.
            let quote = first;
            let mut token = Vec::new();
            let mut escaped = false;
            let mut consumed = 1usize;
            let mut closed = false;
            for &b in self.chunks().flatten().skip(1) {
                consumed += 1;
                if escaped {
                    token.push(b);
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == quote {
                    closed = true;
                    break;
                } else {
                    token.push(b);
                }
            }
            if !closed {
                return TokenRead::NoData;
            }
            self.skip(consumed);
            return TokenRead::Ok(token);
        }
        let mut token = Vec::new();
        for &b in self.chunks().flatten() {
            if is_blank(b) || is_separator(b) || b == b'"' || b == b'\'' {
                break;
            }
            token.push(b);
        }
        self.skip(token.len());
        TokenRead::Ok(token)
    }

    // ── Non-consuming views ─────────────────────────────────────────────────

    /// Iterator over the buffered contiguous spans, read pointer to end.
    pub fn chunks(&self) -> Chunks<'_> {
        Chunks { stream: self, ptr: self.read, left: self.size }
    }

    /// Hex dump of up to `max` buffered bytes (diagnostics only).
    pub fn dump_hex(&self, max: usize) -> String {
        let mut data = self.peek_all();
        data.truncate(max);
        hex::encode(data)
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for MemoryStream {
    fn eq(&self, other: &Self) -> bool {
        if self.size != other.size {
            return false;
        }
        let mut a = self.chunks().flatten();
        let mut b = other.chunks().flatten();
        loop {
            match (a.next(), b.next()) {
                (None, None) => return true,
                (Some(x), Some(y)) if x == y => continue,
                _ => return false,
            }
        }
    }
}

impl Eq for MemoryStream {}

impl std::fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStream")
            .field("size", &self.size)
            .field("blocks", &self.blocks.len())
            .field("markers", &self.markers.len())
            .finish()
    }
}

impl Drop for MemoryStream {
    fn drop(&mut self) {
        debug_assert!(self.markers.is_empty(), "stream dropped with a live marker");
    }
}

impl std::io::Write for MemoryStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        Ok(MemoryStream::write(self, buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl std::io::Read for MemoryStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        Ok(MemoryStream::read(self, buf))
    }
}

/// See [`MemoryStream::chunks`].
pub struct Chunks<'a> {
    stream: &'a MemoryStream,
    ptr: Pointer,
    left: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let end = self.stream.end_id();
        while self.left > 0 && self.ptr.id < end {
            let blen = self.stream.block_len(self.ptr.id);
            if self.ptr.pos >= blen {
                self.ptr = Pointer { id: self.ptr.id + 1, pos: 0 };
                continue;
            }
            let n = (blen - self.ptr.pos).min(self.left);
            let chunk = &self.stream.block_slice(self.ptr.id)[self.ptr.pos..self.ptr.pos + n];
            self.ptr.pos += n;
            self.left -= n;
            return Some(chunk);
        }
        None
    }
}

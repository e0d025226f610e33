//! Durable record log over rolling numbered files.
//!
//! A log is a directory of files named `<base>_<file_num:010>_<first_block:010>`,
//! each holding up to `blocks_per_file` framed blocks (see [`crate::recordio`]).
//! The writer owns exclusive append access; readers open files read-only
//! and tolerate a live writer being ahead of them (a short read is "try
//! again later", never an error).
//!
//! Positions are `(file_num, block_num, record_num)` triples: the file, the
//! block within it, and the fragment index within that block at which the
//! next record starts. Every position handed out by [`LogWriter::tell`]
//! during writing is a valid [`LogReader::seek`] target.
//!
//! The prev-CRC chain never crosses a file boundary: the writer restamps
//! block trailers as it assigns blocks to files, so the first block of each
//! file carries `prev_crc = 0` and a reader can start at any file.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::recordio::{ReadResult, RecordReader, RecordWriter, BLOCK_TRAILER_SIZE};
use crate::stream::MemoryStream;

// ── Positions ────────────────────────────────────────────────────────────────

/// A point in the record stream: file, block within the file, fragment
/// index within the block.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
pub struct LogPos {
    pub file_num: u32,
    pub block_num: u32,
    pub record_num: u32,
}

impl LogPos {
    pub fn new(file_num: u32, block_num: u32, record_num: u32) -> Self {
        Self { file_num, block_num, record_num }
    }

    pub fn is_null(&self) -> bool {
        *self == Self::default()
    }

    /// Compact text form, stable on disk (stored inside checkpoints).
    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.file_num, self.block_num, self.record_num)
    }

    pub fn decode(text: &str) -> Option<Self> {
        let mut parts = text.split(':');
        let file_num = parts.next()?.parse().ok()?;
        let block_num = parts.next()?.parse().ok()?;
        let record_num = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { file_num, block_num, record_num })
    }
}

impl std::fmt::Display for LogPos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.file_num, self.block_num, self.record_num)
    }
}

// ── File naming ──────────────────────────────────────────────────────────────

fn log_file_name(base: &str, file_num: u32, blocks_per_file: u32) -> String {
    let first_block = u64::from(file_num) * u64::from(blocks_per_file);
    format!("{base}_{file_num:010}_{first_block:010}")
}

/// Splits `<base>_<file_num:010>_<first_block:010>`; `None` when the name
/// does not match.
pub fn parse_log_file_name(name: &str) -> Option<(String, u32, u64)> {
    let (rest, first_block) = name.rsplit_once('_')?;
    let (base, file_num) = rest.rsplit_once('_')?;
    if file_num.len() != 10 || first_block.len() != 10 || base.is_empty() {
        return None;
    }
    let file_num = file_num.parse().ok()?;
    let first_block = first_block.parse().ok()?;
    Some((base.to_owned(), file_num, first_block))
}

/// All log files for `base` in `dir`, sorted by file number.
pub fn list_log_files(dir: &Path, base: &str) -> std::io::Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((file_base, file_num, _)) = parse_log_file_name(name) {
            if file_base == base {
                files.push((file_num, entry.path()));
            }
        }
    }
    files.sort();
    Ok(files)
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct LogWriter {
    dir: PathBuf,
    base: String,
    block_size: usize,
    blocks_per_file: u32,
    writer: RecordWriter,
    buf: MemoryStream,
    file: Option<File>,
    file_num: u32,
    /// Blocks already written to the current file.
    block_num: u32,
    /// CRC of the last block written to the current file.
    chain_crc: u32,
    initialized: bool,
}

impl LogWriter {
    pub fn new(
        dir: impl Into<PathBuf>,
        base: impl Into<String>,
        block_size: usize,
        blocks_per_file: u32,
        deflate: bool,
    ) -> Self {
        assert!(blocks_per_file > 0, "blocks_per_file must be positive");
        Self {
            dir: dir.into(),
            base: base.into(),
            block_size,
            blocks_per_file,
            writer: RecordWriter::with_options(block_size, deflate, 0.9),
            buf: MemoryStream::with_block_size(block_size),
            file: None,
            file_num: 0,
            block_num: 0,
            chain_crc: 0,
            initialized: false,
        }
    }

    /// Scans the directory and resumes after the last existing block. A
    /// partially filled file is continued; a torn trailing partial block is
    /// truncated away.
    pub fn initialize(&mut self) -> std::io::Result<()> {
        let files = list_log_files(&self.dir, &self.base)?;
        if let Some((file_num, path)) = files.last() {
            let len = fs::metadata(path)?.len();
            let whole = len / self.block_size as u64;
            if len % self.block_size as u64 != 0 {
                warn!(path = %path.display(), len, "truncating torn block at log tail");
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(whole * self.block_size as u64)?;
            }
            if whole >= u64::from(self.blocks_per_file) {
                self.file_num = file_num + 1;
                self.block_num = 0;
            } else {
                self.file_num = *file_num;
                self.block_num = whole as u32;
                self.file = Some(OpenOptions::new().append(true).open(path)?);
            }
        }
        // The chain restarts on reopen; readers accept prev_crc = 0.
        self.chain_crc = 0;
        self.writer.reset_chain();
        self.initialized = true;
        info!(base = %self.base, file = self.file_num, block = self.block_num, "log writer ready");
        Ok(())
    }

    /// Position at which the next appended record will start.
    pub fn tell(&self) -> LogPos {
        if self.writer.leftover() > 0 {
            if self.block_num == self.blocks_per_file {
                return LogPos::new(self.file_num + 1, 0, self.writer.pending_record_count());
            }
            return LogPos::new(self.file_num, self.block_num, self.writer.pending_record_count());
        }
        if self.block_num == self.blocks_per_file {
            LogPos::new(self.file_num + 1, 0, 0)
        } else {
            LogPos::new(self.file_num, self.block_num, 0)
        }
    }

    pub fn write_record(&mut self, data: &[u8]) -> std::io::Result<()> {
        assert!(self.initialized, "write before initialize");
        if self.writer.append_record(data, &mut self.buf) {
            self.drain_blocks()?;
        }
        Ok(())
    }

    pub fn write_stream_record(&mut self, data: &mut MemoryStream) -> std::io::Result<()> {
        assert!(self.initialized, "write before initialize");
        if self.writer.append_stream_record(data, &mut self.buf) {
            self.drain_blocks()?;
        }
        Ok(())
    }

    /// Seals the staged partial block and pushes everything to disk.
    pub fn flush(&mut self) -> std::io::Result<()> {
        assert!(self.initialized, "flush before initialize");
        self.writer.finalize_content(&mut self.buf);
        self.drain_blocks()?;
        if let Some(file) = &mut self.file {
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> std::io::Result<()> {
        self.flush()?;
        self.file = None;
        Ok(())
    }

    fn drain_blocks(&mut self) -> std::io::Result<()> {
        while self.buf.size() >= self.block_size {
            if self.file.is_none() || self.block_num == self.blocks_per_file {
                self.roll_file()?;
            }
            let mut block = self.buf.read_vec(self.block_size);
            self.restamp_chain(&mut block);
            self.file.as_mut().unwrap().write_all(&block)?;
            self.block_num += 1;
        }
        debug_assert!(self.buf.is_empty());
        Ok(())
    }

    fn roll_file(&mut self) -> std::io::Result<()> {
        if self.file.take().is_some() {
            self.file_num += 1;
        }
        self.block_num = 0;
        let path = self.dir.join(log_file_name(&self.base, self.file_num, self.blocks_per_file));
        debug!(path = %path.display(), "starting log file");
        self.file = Some(OpenOptions::new().create(true).append(true).open(path)?);
        Ok(())
    }

    /// Rewrites the trailer chain fields for the file the block actually
    /// lands in. The framer chains blocks in production order; a block that
    /// opens a new file must restart the chain at 0 instead.
    fn restamp_chain(&mut self, block: &mut [u8]) {
        let n = block.len();
        let prev = if self.block_num == 0 { 0 } else { self.chain_crc };
        BigEndian::write_u32(&mut block[n - 8..n - 4], prev);
        let crc = {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&block[..n - 4]);
            hasher.finalize()
        };
        BigEndian::write_u32(&mut block[n - 4..], crc);
        self.chain_crc = crc;
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct LogReader {
    dir: PathBuf,
    base: String,
    block_size: usize,
    blocks_per_file: u32,
    reader: RecordReader,
    buf: MemoryStream,
    file: Option<File>,
    file_num: u32,
    /// Blocks of the current file already fed to the framer.
    blocks_fed: u32,
    num_errors: usize,
}

impl LogReader {
    pub fn new(
        dir: impl Into<PathBuf>,
        base: impl Into<String>,
        block_size: usize,
        blocks_per_file: u32,
    ) -> Self {
        assert!(blocks_per_file > 0, "blocks_per_file must be positive");
        Self {
            dir: dir.into(),
            base: base.into(),
            block_size,
            blocks_per_file,
            reader: RecordReader::new(block_size),
            buf: MemoryStream::with_block_size(block_size),
            file: None,
            file_num: 0,
            blocks_fed: 0,
            num_errors: 0,
        }
    }

    /// Recovered-from framing errors since open.
    pub fn num_errors(&self) -> usize {
        self.num_errors
    }

    /// Position of the next record to be returned.
    pub fn tell(&self) -> LogPos {
        if self.reader.has_block_content() {
            return LogPos::new(self.file_num, self.blocks_fed - 1, self.reader.block_record_index());
        }
        if self.blocks_fed == self.blocks_per_file {
            LogPos::new(self.file_num + 1, 0, 0)
        } else {
            LogPos::new(self.file_num, self.blocks_fed, 0)
        }
    }

    /// Reads the next record into `out`. Returns false when no complete
    /// record is available yet — at end of log, or when a live writer has
    /// not finished the next block; the caller retries later.
    pub fn get_next_record(&mut self, out: &mut MemoryStream) -> bool {
        loop {
            let mut skipped = 0usize;
            match self.reader.read_record(&mut self.buf, Some(out), &mut skipped, 0) {
                ReadResult::Ok => return true,
                ReadResult::NoData => {
                    if !self.fetch_block() {
                        return false;
                    }
                }
                err => {
                    warn!(error = err.name(), pos = %self.tell(), "log record error, resyncing");
                    self.num_errors += 1;
                }
            }
        }
    }

    /// Repositions at `pos`: open the file, skip to the block, skip the
    /// leading fragments. The chain check restarts from the seek point.
    pub fn seek(&mut self, pos: LogPos) -> bool {
        self.reader.reset();
        self.buf.clear();
        self.file = None;
        self.file_num = pos.file_num;
        self.blocks_fed = pos.block_num;
        if pos.record_num > 0 {
            if !self.fetch_block() {
                return false;
            }
            if self.reader.skip_record_fragments(&mut self.buf, pos.record_num) != ReadResult::Ok {
                return false;
            }
        }
        true
    }

    /// Feeds one whole block from the current file position, rolling to the
    /// next file when this one is exhausted. False when the bytes are not
    /// there yet.
    fn fetch_block(&mut self) -> bool {
        if self.blocks_fed == self.blocks_per_file {
            let next = self.file_num + 1;
            let path = self.dir.join(log_file_name(&self.base, next, self.blocks_per_file));
            match File::open(&path) {
                Ok(file) => {
                    self.file = Some(file);
                    self.file_num = next;
                    self.blocks_fed = 0;
                }
                Err(_) => return false,
            }
        }
        if self.file.is_none() {
            let path =
                self.dir.join(log_file_name(&self.base, self.file_num, self.blocks_per_file));
            match File::open(&path) {
                Ok(file) => self.file = Some(file),
                Err(_) => return false,
            }
        }
        let file = self.file.as_mut().unwrap();
        let offset = u64::from(self.blocks_fed) * self.block_size as u64;
        if file.seek(SeekFrom::Start(offset)).is_err() {
            return false;
        }
        let mut block = vec![0u8; self.block_size];
        match file.read_exact(&mut block) {
            Ok(()) => {
                self.buf.write(&block);
                self.blocks_fed += 1;
                true
            }
            Err(_) => false,
        }
    }
}

// ── Maintenance helpers ──────────────────────────────────────────────────────

/// Deletes log files wholly before `pos`. Returns how many were removed.
pub fn clean_log(dir: &Path, base: &str, pos: LogPos) -> std::io::Result<usize> {
    let mut removed = 0;
    for (file_num, path) in list_log_files(dir, base)? {
        if file_num < pos.file_num {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(base, %pos, removed, "cleaned old log files");
    }
    Ok(removed)
}

/// Log geometry recovered from an existing directory.
#[derive(Clone, Debug, Serialize)]
pub struct LogSettings {
    pub base: String,
    pub block_size: usize,
    pub blocks_per_file: u32,
}

/// Recovers `(base, block_size, blocks_per_file)` from file names and
/// sizes. Needs at least two files of the same base (the second file's
/// name pins blocks-per-file, a full file's size pins the block size).
pub fn detect_log_settings(dir: &Path) -> std::io::Result<Option<LogSettings>> {
    let mut named: Vec<(String, u32, u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some((base, file_num, first_block)) = parse_log_file_name(name) {
            named.push((base, file_num, first_block, entry.path()));
        }
    }
    named.sort();
    for window in named.windows(2) {
        let (ref base_a, num_a, _, ref path_a) = window[0];
        let (ref base_b, num_b, first_block_b, _) = window[1];
        if base_a != base_b || num_b != num_a + 1 || num_b == 0 {
            continue;
        }
        let blocks_per_file = (first_block_b / u64::from(num_b)) as u32;
        if blocks_per_file == 0 {
            continue;
        }
        let len = fs::metadata(path_a)?.len();
        if len == 0 || len % u64::from(blocks_per_file) != 0 {
            continue;
        }
        let block_size = (len / u64::from(blocks_per_file)) as usize;
        if block_size <= BLOCK_TRAILER_SIZE {
            continue;
        }
        return Ok(Some(LogSettings { base: base_a.clone(), block_size, blocks_per_file }));
    }
    Ok(None)
}

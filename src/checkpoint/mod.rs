//! Atomic snapshots of a name→value map, stored as a record stream.
//!
//! A checkpoint file is a sequence of framed record blocks (see
//! [`crate::recordio`]): the literal record `__checkpoint_begin__`, then
//! strictly alternating name and value records, then the literal
//! `__checkpoint_end__`. Files are named `<base>_<seq:010>` with a
//! monotonically growing sequence number; the newest file that verifies
//! wins. A file missing either sentinel, failing record framing, or cut
//! short is not a checkpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::recordio::{ReadResult, RecordReader, RecordWriter, DEFAULT_BLOCK_SIZE};
use crate::stream::MemoryStream;

pub const CHECKPOINT_BEGIN: &[u8] = b"__checkpoint_begin__";
pub const CHECKPOINT_END: &[u8] = b"__checkpoint_end__";

/// Block size of every checkpoint file.
pub const CHECKPOINT_BLOCK_SIZE: usize = DEFAULT_BLOCK_SIZE;

pub type CheckpointMap = BTreeMap<String, Vec<u8>>;

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("no checkpoint in progress")]
    NotStarted,
    #[error("checkpoint already in progress")]
    AlreadyStarted,
    #[error("duplicate checkpoint name: {0}")]
    DuplicateName(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn checkpoint_file_name(base: &str, seq: u32) -> String {
    format!("{base}_{seq:010}")
}

fn parse_checkpoint_name<'a>(name: &'a str, base: &str) -> Option<u32> {
    let rest = name.strip_prefix(base)?.strip_prefix('_')?;
    if rest.len() != 10 {
        return None;
    }
    rest.parse().ok()
}

/// Checkpoint files for `base` in `dir`, sorted by sequence number.
pub fn checkpoint_files(dir: &Path, base: &str) -> std::io::Result<Vec<(u32, PathBuf)>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(seq) = parse_checkpoint_name(name, base) {
            files.push((seq, entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

// ── Writer ───────────────────────────────────────────────────────────────────

struct OpenCheckpoint {
    file: File,
    path: PathBuf,
    recorder: RecordWriter,
    names: BTreeSet<String>,
    buf: MemoryStream,
}

pub struct CheckpointWriter {
    dir: PathBuf,
    base: String,
    open: Option<OpenCheckpoint>,
}

impl CheckpointWriter {
    pub fn new(dir: impl Into<PathBuf>, base: impl Into<String>) -> Self {
        Self { dir: dir.into(), base: base.into(), open: None }
    }

    /// Starts a new checkpoint file at the next free sequence number;
    /// returns that number.
    pub fn begin(&mut self) -> Result<u32, CheckpointError> {
        if self.open.is_some() {
            return Err(CheckpointError::AlreadyStarted);
        }
        let seq = match checkpoint_files(&self.dir, &self.base)?.last() {
            Some((last, _)) => last + 1,
            None => 0,
        };
        let path = self.dir.join(checkpoint_file_name(&self.base, seq));
        let file = File::create(&path)?;
        info!(path = %path.display(), "starting checkpoint");
        let mut open = OpenCheckpoint {
            file,
            path,
            recorder: RecordWriter::new(CHECKPOINT_BLOCK_SIZE),
            names: BTreeSet::new(),
            buf: MemoryStream::with_block_size(CHECKPOINT_BLOCK_SIZE),
        };
        open.recorder.append_record(CHECKPOINT_BEGIN, &mut open.buf);
        self.open = Some(open);
        Ok(seq)
    }

    /// Adds one name/value pair. Names must be unique per checkpoint.
    pub fn add(&mut self, name: &str, value: &[u8]) -> Result<(), CheckpointError> {
        let open = self.open.as_mut().ok_or(CheckpointError::NotStarted)?;
        if !open.names.insert(name.to_owned()) {
            return Err(CheckpointError::DuplicateName(name.to_owned()));
        }
        let full_name = open.recorder.append_record(name.as_bytes(), &mut open.buf);
        let full_value = open.recorder.append_record(value, &mut open.buf);
        if full_name || full_value {
            Self::write_buffer(open)?;
        }
        Ok(())
    }

    /// Writes the end sentinel, seals the final block, and closes the file.
    pub fn end(&mut self) -> Result<(), CheckpointError> {
        let mut open = self.open.take().ok_or(CheckpointError::NotStarted)?;
        open.recorder.append_record(CHECKPOINT_END, &mut open.buf);
        open.recorder.finalize_content(&mut open.buf);
        Self::write_buffer(&mut open)?;
        open.file.sync_data()?;
        info!(path = %open.path.display(), names = open.names.len(), "checkpoint sealed");
        Ok(())
    }

    /// Abandons a checkpoint mid-write; the partial file is removed.
    pub fn abort(&mut self) {
        if let Some(open) = self.open.take() {
            drop(open.file);
            let _ = fs::remove_file(&open.path);
        }
    }

    /// Removes all but the newest `keep` checkpoints.
    pub fn clean_old(&self, keep: usize) -> std::io::Result<()> {
        clean_checkpoint_files(&self.dir, &self.base, keep)
    }

    fn write_buffer(open: &mut OpenCheckpoint) -> Result<(), CheckpointError> {
        debug_assert_eq!(open.buf.size() % CHECKPOINT_BLOCK_SIZE, 0);
        while let Some(chunk) = open.buf.read_next() {
            open.file.write_all(chunk)?;
        }
        Ok(())
    }
}

impl Drop for CheckpointWriter {
    fn drop(&mut self) {
        self.abort();
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Reads and fully verifies one checkpoint file.
pub fn read_checkpoint_file(path: &Path) -> Option<CheckpointMap> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(err) => {
            warn!(path = %path.display(), %err, "cannot open checkpoint");
            return None;
        }
    };
    let mut map = CheckpointMap::new();
    let mut reader = RecordReader::new(CHECKPOINT_BLOCK_SIZE);
    let mut input = MemoryStream::with_block_size(CHECKPOINT_BLOCK_SIZE);
    let mut chunk = vec![0u8; CHECKPOINT_BLOCK_SIZE];

    let mut first_record = true;
    let mut pending_name: Option<String> = None;
    let mut saw_end = false;

    // Reads a whole block, or 0 at clean EOF.
    fn read_block(file: &mut File, chunk: &mut [u8]) -> std::io::Result<usize> {
        let mut got = 0;
        while got < chunk.len() {
            let cb = file.read(&mut chunk[got..])?;
            if cb == 0 {
                break;
            }
            got += cb;
        }
        Ok(got)
    }

    loop {
        let cb = match read_block(&mut file, &mut chunk) {
            Ok(cb) => cb,
            Err(err) => {
                warn!(path = %path.display(), %err, "checkpoint read error");
                return None;
            }
        };
        if cb == 0 {
            // Clean EOF: the end sentinel must have been the last record.
            if !saw_end {
                warn!(path = %path.display(), "checkpoint missing end sentinel");
                return None;
            }
            return Some(map);
        }
        if cb != CHECKPOINT_BLOCK_SIZE {
            warn!(path = %path.display(), cb, "short checkpoint block");
            return None;
        }
        input.write(&chunk[..cb]);

        loop {
            let mut record = MemoryStream::with_block_size(CHECKPOINT_BLOCK_SIZE);
            let mut skipped = 0usize;
            match reader.read_record(&mut input, Some(&mut record), &mut skipped, 0) {
                ReadResult::NoData => break,
                ReadResult::Ok => {}
                err => {
                    warn!(path = %path.display(), error = err.name(), "corrupted checkpoint");
                    return None;
                }
            }
            let bytes = record.read_all();
            if first_record {
                first_record = false;
                if bytes != CHECKPOINT_BEGIN {
                    warn!(path = %path.display(), "checkpoint missing begin sentinel");
                    return None;
                }
                continue;
            }
            if saw_end {
                warn!(path = %path.display(), "data after checkpoint end sentinel");
                return None;
            }
            match pending_name.take() {
                None => {
                    if bytes == CHECKPOINT_END {
                        saw_end = true;
                    } else {
                        pending_name = Some(String::from_utf8_lossy(&bytes).into_owned());
                    }
                }
                Some(name) => {
                    map.insert(name, bytes);
                }
            }
        }
    }
}

/// Loads the newest valid checkpoint. A file that fails verification is
/// deleted before falling back to the next lower sequence.
pub fn read_checkpoint(dir: &Path, base: &str) -> std::io::Result<Option<CheckpointMap>> {
    let files = checkpoint_files(dir, base)?;
    for (_, path) in files.iter().rev() {
        if let Some(map) = read_checkpoint_file(path) {
            info!(path = %path.display(), values = map.len(), "checkpoint loaded");
            return Ok(Some(map));
        }
        warn!(path = %path.display(), "deleting corrupted checkpoint");
        let _ = fs::remove_file(path);
    }
    Ok(None)
}

/// Writes `map` as a single new checkpoint under `dir`/`base`.
pub fn write_checkpoint_file(
    dir: &Path,
    base: &str,
    map: &CheckpointMap,
) -> Result<u32, CheckpointError> {
    let mut writer = CheckpointWriter::new(dir, base);
    let seq = writer.begin()?;
    for (name, value) in map {
        writer.add(name, value)?;
    }
    writer.end()?;
    Ok(seq)
}

/// Removes all but the newest `keep` checkpoints of `base`.
pub fn clean_checkpoint_files(dir: &Path, base: &str, keep: usize) -> std::io::Result<()> {
    let files = checkpoint_files(dir, base)?;
    if files.len() <= keep {
        return Ok(());
    }
    for (_, path) in &files[..files.len() - keep] {
        fs::remove_file(path)?;
    }
    Ok(())
}

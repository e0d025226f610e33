//! Log-structured key/value state keeper.
//!
//! The authoritative state is an in-memory ordered map. Every mutation is
//! also encoded as a change-log record and appended, through a bounded
//! queue, by a dedicated writer thread that owns the log writer and the
//! checkpointer — durability never blocks the calling thread. Restart
//! recovery loads the newest valid checkpoint and replays the change log
//! from the position captured inside it.
//!
//! # Change-log record layout
//!
//! ```text
//! op := key_size(i16 BE) key op_code(u8) [value_size(i32 BE) value]
//!   op_code: SET=0 (value follows), DELETE=1, DELETE_PREFIX=2
//! ```
//!
//! One record carries one op, or a whole transaction's ops back to back.
//!
//! # Reserved names
//!
//! `__checkpoint_pos__`, the checkpoint sentinels, and everything under
//! `__t__/` (the TTL tracking namespace) are rejected as user keys.
//!
//! # Thread model
//!
//! A keeper is owned by the thread that called [`StateKeeper::initialize`];
//! every public method checks this. The writer thread is an internal
//! detail, shut down by a sentinel message on drop.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use byteorder::BigEndian;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{self, CheckpointError, CheckpointMap, CheckpointWriter};
use crate::logio::{clean_log, LogPos, LogReader, LogWriter};
use crate::stream::MemoryStream;

pub const DEFAULT_BLOCK_SIZE: usize = 128;
pub const DEFAULT_BLOCKS_PER_FILE: u32 = 100_000;
pub const MIN_CHECKPOINTS_TO_KEEP: usize = 2;
pub const DEFAULT_CHECKPOINTS_TO_KEEP: usize = 4;

/// Keys must fit a signed 16-bit length prefix.
pub const MAX_KEY_SIZE: usize = i16::MAX as usize;

const WRITER_QUEUE_SIZE: usize = 1000;
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Reserved checkpoint name carrying the log position of the snapshot.
pub const CHECKPOINT_POS_KEY: &str = "__checkpoint_pos__";
/// Reserved namespace for TTL tracking keys.
pub const TIMEOUT_KEY: &str = "__t__";

const OP_SET: u8 = 0;
const OP_DELETE: u8 = 1;
const OP_DELETE_PREFIX: u8 = 2;

pub fn checkpoint_base(state_name: &str) -> String {
    format!("{state_name}_checkpoint")
}

pub fn log_base(state_name: &str) -> String {
    format!("{state_name}_statelog")
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("checkpoint is missing a usable {CHECKPOINT_POS_KEY}")]
    CorruptCheckpoint,
    #[error("reserved key: {0}")]
    ReservedKey(String),
    #[error("key too long: {0} bytes")]
    KeyTooLong(usize),
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Smallest string greater than every string with this prefix, if any.
fn next_prefix(prefix: &str) -> Option<String> {
    let mut bytes = prefix.as_bytes().to_vec();
    while let Some(&last) = bytes.last() {
        if last == 0xff {
            bytes.pop();
        } else {
            *bytes.last_mut().unwrap() += 1;
            return Some(String::from_utf8_lossy(&bytes).into_owned());
        }
    }
    None
}

fn prefix_end_bound(prefix: &str) -> Bound<String> {
    match next_prefix(prefix) {
        Some(end) => Bound::Excluded(end),
        None => Bound::Unbounded,
    }
}

// ── Restart recovery ─────────────────────────────────────────────────────────

/// Loads the map for `state_name`: newest valid checkpoint plus a replay of
/// the change log from the position the checkpoint was taken at.
pub fn read_state(
    state_dir: &Path,
    state_name: &str,
    block_size: usize,
    blocks_per_file: u32,
) -> Result<BTreeMap<String, Vec<u8>>, StateError> {
    let mut map = BTreeMap::new();
    let mut pos = LogPos::default();
    if let Some(mut loaded) = checkpoint::read_checkpoint(state_dir, &checkpoint_base(state_name))? {
        let Some(pos_value) = loaded.remove(CHECKPOINT_POS_KEY) else {
            error!(state_name, "checkpoint has no log position");
            return Err(StateError::CorruptCheckpoint);
        };
        let pos_text = String::from_utf8_lossy(&pos_value).into_owned();
        let Some(decoded) = LogPos::decode(&pos_text) else {
            error!(state_name, pos = %pos_text, "checkpoint log position unparsable");
            return Err(StateError::CorruptCheckpoint);
        };
        pos = decoded;
        map = loaded;
    }
    info!(state_name, keys = map.len(), %pos, "state loaded from checkpoint, replaying log");

    let mut reader =
        LogReader::new(state_dir, log_base(state_name), block_size, blocks_per_file);
    if !reader.seek(pos) {
        warn!(state_name, %pos, "cannot seek the change log; keeping checkpoint state");
        return Ok(map);
    }
    let mut changed = 0usize;
    let mut buf = MemoryStream::new();
    while reader.get_next_record(&mut buf) {
        while !buf.is_empty() {
            if buf.size() < 2 {
                warn!(state_name, "truncated change-log op");
                buf.clear();
                break;
            }
            let key_size = buf.read_i16::<BigEndian>();
            let key_bytes = buf.read_vec(key_size.max(0) as usize);
            if key_bytes.len() != key_size.max(0) as usize || buf.is_empty() {
                warn!(state_name, "short key in change-log op");
                buf.clear();
                break;
            }
            let key = String::from_utf8_lossy(&key_bytes).into_owned();
            let op = buf.read_u8();
            match op {
                OP_SET => {
                    if buf.size() < 4 {
                        warn!(state_name, key, "change-log SET missing value size");
                        buf.clear();
                        break;
                    }
                    let value_size = buf.read_i32::<BigEndian>();
                    let value = buf.read_vec(value_size.max(0) as usize);
                    if value.len() != value_size.max(0) as usize {
                        warn!(state_name, key, "short value in change-log SET");
                        buf.clear();
                        break;
                    }
                    changed += 1;
                    map.insert(key, value);
                }
                OP_DELETE => {
                    map.remove(&key);
                }
                OP_DELETE_PREFIX => {
                    let keys: Vec<String> = map
                        .range::<String, _>((Bound::Included(key.clone()), prefix_end_bound(&key)))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in keys {
                        map.remove(&k);
                    }
                }
                other => warn!(state_name, op = other, "ignoring unknown change-log op"),
            }
        }
    }
    info!(
        state_name,
        keys = map.len(),
        changed,
        errors = reader.num_errors(),
        "state replay complete"
    );
    Ok(map)
}

// ── Keeper ───────────────────────────────────────────────────────────────────

enum WriterCmd {
    Append(Vec<u8>),
    Checkpoint(CheckpointMap),
    Shutdown,
}

pub struct StateKeeper {
    state_dir: PathBuf,
    state_name: String,
    block_size: usize,
    blocks_per_file: u32,
    checkpoints_to_keep: usize,
    data: BTreeMap<String, Vec<u8>>,
    in_transaction: bool,
    op_buf: MemoryStream,
    tx: Option<flume::Sender<WriterCmd>>,
    writer_thread: Option<JoinHandle<()>>,
    owner: Option<ThreadId>,
}

impl StateKeeper {
    pub fn new(state_dir: impl Into<PathBuf>, state_name: impl Into<String>) -> Self {
        Self::with_options(
            state_dir,
            state_name,
            DEFAULT_BLOCK_SIZE,
            DEFAULT_BLOCKS_PER_FILE,
            DEFAULT_CHECKPOINTS_TO_KEEP,
        )
    }

    /// Pick the geometry with care: together with the value sizes it
    /// determines the wasted space per block.
    pub fn with_options(
        state_dir: impl Into<PathBuf>,
        state_name: impl Into<String>,
        block_size: usize,
        blocks_per_file: u32,
        checkpoints_to_keep: usize,
    ) -> Self {
        Self {
            state_dir: state_dir.into(),
            state_name: state_name.into(),
            block_size,
            blocks_per_file,
            checkpoints_to_keep,
            data: BTreeMap::new(),
            in_transaction: false,
            op_buf: MemoryStream::new(),
            tx: None,
            writer_thread: None,
            owner: None,
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn state_name(&self) -> &str {
        &self.state_name
    }

    /// Loads the saved state and starts the writer thread. Must be called
    /// once, before any other method, on the thread that will own the
    /// keeper.
    pub fn initialize(&mut self) -> Result<(), StateError> {
        assert!(self.owner.is_none(), "initialize called twice");
        self.owner = Some(thread::current().id());

        self.data =
            read_state(&self.state_dir, &self.state_name, self.block_size, self.blocks_per_file)?;

        let mut log_writer = LogWriter::new(
            &self.state_dir,
            log_base(&self.state_name),
            self.block_size,
            self.blocks_per_file,
            false,
        );
        log_writer.initialize()?;
        let checkpointer =
            CheckpointWriter::new(&self.state_dir, checkpoint_base(&self.state_name));

        let (tx, rx) = flume::bounded(WRITER_QUEUE_SIZE);
        let ctx = WriterContext {
            state_dir: self.state_dir.clone(),
            checkpoint_base: checkpoint_base(&self.state_name),
            log_base: log_base(&self.state_name),
            checkpoints_to_keep: self.checkpoints_to_keep,
        };
        self.writer_thread = Some(thread::spawn(move || {
            writer_loop(rx, log_writer, checkpointer, ctx);
        }));
        self.tx = Some(tx);
        Ok(())
    }

    fn check_owner(&self) {
        assert_eq!(
            self.owner,
            Some(thread::current().id()),
            "state keeper used off its owner thread"
        );
    }

    fn check_user_key(&self, key: &str) -> Result<(), StateError> {
        if key == CHECKPOINT_POS_KEY
            || key.as_bytes() == checkpoint::CHECKPOINT_BEGIN
            || key.as_bytes() == checkpoint::CHECKPOINT_END
            || key.starts_with("__t__/")
        {
            return Err(StateError::ReservedKey(key.to_owned()));
        }
        if key.len() >= MAX_KEY_SIZE {
            return Err(StateError::KeyTooLong(key.len()));
        }
        Ok(())
    }

    // ── Reads (served from memory, owner thread only) ───────────────────────

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.check_owner();
        self.data.get(key).map(Vec::as_slice)
    }

    pub fn has(&self, key: &str) -> bool {
        self.check_owner();
        self.data.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.check_owner();
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn bounds<'a>(
        &'a self,
        prefix: &str,
    ) -> impl Iterator<Item = (&'a String, &'a Vec<u8>)> + 'a {
        self.check_owner();
        self.data
            .range::<String, _>((Bound::Included(prefix.to_owned()), prefix_end_bound(prefix)))
    }

    // ── Mutations ───────────────────────────────────────────────────────────

    pub fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StateError> {
        self.check_owner();
        self.check_user_key(key)?;
        self.set_internal(key, value)
    }

    pub fn delete(&mut self, key: &str) -> Result<(), StateError> {
        self.check_owner();
        self.check_user_key(key)?;
        self.delete_internal(key)
    }

    pub fn delete_prefix(&mut self, prefix: &str) -> Result<(), StateError> {
        self.check_owner();
        self.check_user_key(prefix)?;
        self.delete_prefix_internal(prefix)
    }

    pub(crate) fn set_internal(&mut self, key: &str, value: &[u8]) -> Result<(), StateError> {
        if key.len() >= MAX_KEY_SIZE {
            return Err(StateError::KeyTooLong(key.len()));
        }
        if self.data.get(key).map(Vec::as_slice) == Some(value) {
            // The value is already there; skip the useless SET.
            return Ok(());
        }
        self.data.insert(key.to_owned(), value.to_vec());
        self.queue_op(key, OP_SET, Some(value));
        Ok(())
    }

    pub(crate) fn delete_internal(&mut self, key: &str) -> Result<(), StateError> {
        if self.data.remove(key).is_none() {
            return Ok(());
        }
        self.queue_op(key, OP_DELETE, None);
        Ok(())
    }

    pub(crate) fn delete_prefix_internal(&mut self, prefix: &str) -> Result<(), StateError> {
        let keys: Vec<String> = self
            .data
            .range::<String, _>((Bound::Included(prefix.to_owned()), prefix_end_bound(prefix)))
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            self.data.remove(&k);
        }
        self.queue_op(prefix, OP_DELETE_PREFIX, None);
        Ok(())
    }

    fn queue_op(&mut self, key: &str, op: u8, value: Option<&[u8]>) {
        debug_assert!(key.len() < MAX_KEY_SIZE);
        self.op_buf.write_i16::<BigEndian>(key.len() as i16);
        self.op_buf.write(key.as_bytes());
        self.op_buf.write_u8(op);
        if let Some(value) = value {
            self.op_buf.write_i32::<BigEndian>(value.len() as i32);
            self.op_buf.write(value);
        }
        if !self.in_transaction {
            self.queue_write();
        }
    }

    fn queue_write(&mut self) {
        let bytes = self.op_buf.read_all();
        if bytes.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx {
            if tx.send(WriterCmd::Append(bytes)).is_err() {
                error!(state = %self.state_name, "writer thread is gone; change not persisted");
            }
        }
    }

    // ── Transactions ────────────────────────────────────────────────────────

    /// Accumulates subsequent mutations into one log record. Transactions
    /// cannot be aborted and must not span a checkpoint.
    pub fn begin_transaction(&mut self) {
        self.check_owner();
        assert!(!self.in_transaction, "transaction already open");
        self.in_transaction = true;
    }

    pub fn commit_transaction(&mut self) {
        self.check_owner();
        assert!(self.in_transaction, "commit without begin");
        self.in_transaction = false;
        self.queue_write();
    }

    // ── Checkpoints ─────────────────────────────────────────────────────────

    /// Snapshots the current map. The writer thread flushes the log first
    /// and records the flush position inside the checkpoint, so everything
    /// submitted before this call is covered.
    pub fn checkpoint(&mut self) -> Result<(), StateError> {
        self.check_owner();
        assert!(!self.in_transaction, "checkpoint during a transaction");
        self.expire_timeouts();
        let snapshot = self.data.clone();
        if let Some(tx) = &self.tx {
            if tx.send(WriterCmd::Checkpoint(snapshot)).is_err() {
                error!(state = %self.state_name, "writer thread is gone; checkpoint dropped");
            }
        }
        Ok(())
    }

    /// Removes old checkpoints (always keeping at least
    /// [`MIN_CHECKPOINTS_TO_KEEP`]) and the log files none of them need.
    pub fn clean_old_state(&self, checkpoints_to_keep: usize) {
        self.check_owner();
        clean_old_state_impl(
            &self.state_dir,
            &checkpoint_base(&self.state_name),
            &log_base(&self.state_name),
            checkpoints_to_keep,
        );
    }

    // ── TTL expiry ──────────────────────────────────────────────────────────

    /// Deletes every prefix whose tracked deadline has passed. Returns the
    /// number of expired prefixes.
    pub fn expire_timeouts(&mut self) -> usize {
        self.check_owner();
        let now = now_ms();
        let scan_prefix = format!("{TIMEOUT_KEY}//");
        let deadline_end = scan_prefix.len() + TIMEOUT_DIGITS;

        let mut expired_keys = Vec::new();
        let mut expired_prefixes = Vec::new();
        for (key, value) in self
            .data
            .range::<String, _>((Bound::Included(scan_prefix.clone()), prefix_end_bound(&scan_prefix)))
        {
            // Tracking keys sort by deadline; a malformed key is treated as
            // expired so it cannot wedge the scan.
            let mut expired = true;
            if key.len() > deadline_end {
                if let Ok(deadline) = key[scan_prefix.len()..deadline_end].parse::<i64>() {
                    expired = deadline < now;
                }
            }
            if !expired {
                break;
            }
            expired_keys.push(key.clone());
            expired_prefixes.push(String::from_utf8_lossy(value).into_owned());
        }

        self.begin_transaction();
        for (key, prefix) in expired_keys.iter().zip(&expired_prefixes) {
            debug!(state = %self.state_name, %prefix, "prefix expired");
            let _ = self.delete_prefix_internal(prefix);
            let _ = self.delete_internal(key);
        }
        self.commit_transaction();
        expired_keys.len()
    }
}

impl Drop for StateKeeper {
    fn drop(&mut self) {
        if self.in_transaction {
            warn!(state = %self.state_name, "dropping a keeper with an open transaction");
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(WriterCmd::Shutdown);
        }
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

// ── Writer thread ────────────────────────────────────────────────────────────

struct WriterContext {
    state_dir: PathBuf,
    checkpoint_base: String,
    log_base: String,
    checkpoints_to_keep: usize,
}

fn writer_loop(
    rx: flume::Receiver<WriterCmd>,
    mut log_writer: LogWriter,
    mut checkpointer: CheckpointWriter,
    ctx: WriterContext,
) {
    info!(log = %ctx.log_base, "state writer thread started");
    loop {
        match rx.recv_timeout(FLUSH_INTERVAL) {
            Ok(WriterCmd::Append(bytes)) => {
                if let Err(err) = log_writer.write_record(&bytes) {
                    error!(log = %ctx.log_base, %err, "change-log append failed");
                }
            }
            Ok(WriterCmd::Checkpoint(map)) => {
                match write_checkpoint(&mut log_writer, &mut checkpointer, &map) {
                    Ok(pos) => {
                        info!(log = %ctx.log_base, keys = map.len(), %pos, "checkpoint done");
                        clean_old_state_impl(
                            &ctx.state_dir,
                            &ctx.checkpoint_base,
                            &ctx.log_base,
                            ctx.checkpoints_to_keep,
                        );
                    }
                    Err(err) => {
                        error!(log = %ctx.log_base, %err, "checkpoint failed");
                        checkpointer.abort();
                    }
                }
            }
            Ok(WriterCmd::Shutdown) | Err(flume::RecvTimeoutError::Disconnected) => {
                if let Err(err) = log_writer.flush() {
                    error!(log = %ctx.log_base, %err, "final flush failed");
                }
                info!(log = %ctx.log_base, "state writer thread ended");
                return;
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                // Idle: make whatever accumulated durable.
                if let Err(err) = log_writer.flush() {
                    error!(log = %ctx.log_base, %err, "idle flush failed");
                }
            }
        }
    }
}

fn write_checkpoint(
    log_writer: &mut LogWriter,
    checkpointer: &mut CheckpointWriter,
    map: &CheckpointMap,
) -> Result<LogPos, StateError> {
    log_writer.flush()?;
    let pos = log_writer.tell();
    checkpointer.begin()?;
    checkpointer.add(CHECKPOINT_POS_KEY, pos.encode().as_bytes())?;
    for (key, value) in map {
        checkpointer.add(key, value)?;
    }
    checkpointer.end()?;
    Ok(pos)
}

fn clean_old_state_impl(state_dir: &Path, ckpt_base: &str, log_base: &str, keep: usize) {
    let keep = keep.max(MIN_CHECKPOINTS_TO_KEEP);
    let files = match checkpoint::checkpoint_files(state_dir, ckpt_base) {
        Ok(files) => files,
        Err(err) => {
            error!(ckpt_base, %err, "cannot scan checkpoints");
            return;
        }
    };
    // First pass: drop checkpoints that no longer verify.
    let mut valid = Vec::new();
    for (_, path) in files {
        match checkpoint::read_checkpoint_file(&path) {
            Some(map) => valid.push((path, map)),
            None => {
                warn!(path = %path.display(), "deleting corrupted checkpoint");
                let _ = std::fs::remove_file(&path);
            }
        }
    }
    if valid.len() <= keep {
        return;
    }
    // Second pass: retire the oldest ones, and the log files they pinned.
    let retire = valid.len() - keep;
    for (path, map) in valid.into_iter().take(retire) {
        if let Some(pos_value) = map.get(CHECKPOINT_POS_KEY) {
            let pos_text = String::from_utf8_lossy(pos_value);
            if let Some(pos) = LogPos::decode(&pos_text) {
                let _ = clean_log(state_dir, log_base, pos);
            }
        }
        let _ = std::fs::remove_file(&path);
    }
}

const TIMEOUT_DIGITS: usize = 25;
/// Deadline refreshes closer than this to the previous one are skipped.
const MIN_UPDATE_TIMEOUT_THRESHOLD_MS: i64 = 1000;

// ── Per-prefix TTL users ─────────────────────────────────────────────────────

/// A view of the keeper under one key prefix, optionally expiring the whole
/// prefix after a period of write inactivity.
///
/// TTL bookkeeping lives in two places: a tracking key
/// `__t__//<deadline:025>/<prefix>` mapping back to the prefix (scanned in
/// deadline order by [`StateKeeper::expire_timeouts`]), and `<prefix>__t__`
/// holding the current deadline so a restarted user resumes it. Refreshing
/// writes the new tracking key before deleting the old one: a crash in
/// between leaves a harmless duplicate that the next sweep removes.
pub struct StateKeepUser {
    prefix: String,
    /// Positive: expire the prefix this long after the last write.
    /// Zero: do not persist at all. Negative: persist without a TTL.
    timeout_ms: i64,
    current_deadline: i64,
}

impl StateKeepUser {
    pub fn new(keeper: &StateKeeper, prefix: impl Into<String>, timeout_ms: i64) -> Self {
        let prefix = prefix.into();
        assert!(!prefix.is_empty(), "a user needs a prefix");
        let mut user = Self { prefix, timeout_ms, current_deadline: 0 };
        if let Some(saved) = keeper.get(&user.deadline_marker_key()) {
            if let Ok(deadline) = String::from_utf8_lossy(saved).parse::<i64>() {
                user.current_deadline = deadline;
            }
        }
        user
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn timeout_ms(&self) -> i64 {
        self.timeout_ms
    }

    fn tracking_key(&self, deadline: i64) -> String {
        format!("{TIMEOUT_KEY}//{deadline:025}/{}", self.prefix)
    }

    fn deadline_marker_key(&self) -> String {
        format!("{}{TIMEOUT_KEY}", self.prefix)
    }

    pub fn set(&mut self, keeper: &mut StateKeeper, key: &str, value: &[u8]) -> Result<(), StateError> {
        if self.timeout_ms == 0 {
            // This user keeps no state at all.
            return Ok(());
        }
        keeper.set_internal(&format!("{}{key}", self.prefix), value)?;
        if self.timeout_ms > 0 {
            self.update_timeout(keeper)?;
        }
        Ok(())
    }

    pub fn get<'a>(&self, keeper: &'a StateKeeper, key: &str) -> Option<&'a [u8]> {
        keeper.get(&format!("{}{key}", self.prefix))
    }

    pub fn has(&self, keeper: &StateKeeper, key: &str) -> bool {
        keeper.has(&format!("{}{key}", self.prefix))
    }

    pub fn delete(&self, keeper: &mut StateKeeper, key: &str) -> Result<(), StateError> {
        keeper.delete_internal(&format!("{}{key}", self.prefix))
    }

    pub fn delete_prefix(
        &mut self,
        keeper: &mut StateKeeper,
        prefix: &str,
    ) -> Result<(), StateError> {
        if prefix.is_empty() {
            self.clean_timeout(keeper)?;
        }
        keeper.delete_prefix_internal(&format!("{}{prefix}", self.prefix))
    }

    pub fn delete_all(&mut self, keeper: &mut StateKeeper) -> Result<(), StateError> {
        self.delete_prefix(keeper, "")
    }

    /// Pushes the deadline `timeout_ms` into the future. New tracking key
    /// first, old one deleted only after.
    pub fn update_timeout(&mut self, keeper: &mut StateKeeper) -> Result<(), StateError> {
        if self.timeout_ms <= 0 {
            return Ok(());
        }
        let new_deadline = now_ms() + self.timeout_ms;
        if new_deadline - self.current_deadline < MIN_UPDATE_TIMEOUT_THRESHOLD_MS {
            return Ok(());
        }
        let old_key =
            (self.current_deadline > 0).then(|| self.tracking_key(self.current_deadline));
        self.current_deadline = new_deadline;
        keeper.set_internal(&self.tracking_key(new_deadline), self.prefix.as_bytes())?;
        keeper.set_internal(
            &self.deadline_marker_key(),
            new_deadline.to_string().as_bytes(),
        )?;
        if let Some(old_key) = old_key {
            keeper.delete_internal(&old_key)?;
        }
        Ok(())
    }

    fn clean_timeout(&mut self, keeper: &mut StateKeeper) -> Result<(), StateError> {
        if self.current_deadline <= 0 {
            return Ok(());
        }
        let key = self.tracking_key(self.current_deadline);
        keeper.delete_internal(&key)?;
        self.current_deadline = 0;
        Ok(())
    }
}

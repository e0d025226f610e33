use std::path::Path;

use tempfile::TempDir;

use wharf::logio::{clean_log, detect_log_settings, list_log_files, LogPos, LogReader, LogWriter};
use wharf::stream::MemoryStream;

const BLOCK_SIZE: usize = 4096;
const BLOCKS_PER_FILE: u32 = 13;

fn make_record(rid: u64, len: usize) -> Vec<u8> {
    let mut rec = Vec::with_capacity(len.max(8));
    rec.extend_from_slice(&rid.to_be_bytes());
    let mut x = rid.wrapping_mul(0x9E37_79B9_7F4A_7C15).wrapping_add(1);
    while rec.len() < len.max(8) {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        rec.push((x >> 56) as u8);
    }
    rec
}

/// Deterministic pseudo-random record length in `[1, 4 * BLOCK_SIZE]`.
fn record_len(rid: u64) -> usize {
    let x = rid.wrapping_mul(0x2545_F491_4F6C_DD1D).wrapping_add(0xB5);
    1 + (x % (4 * BLOCK_SIZE as u64)) as usize
}

fn verify_record(rid: u64, data: &[u8]) {
    let expected = make_record(rid, record_len(rid));
    assert_eq!(data, &expected[..], "record {rid} mismatch");
}

fn writer(dir: &Path) -> LogWriter {
    LogWriter::new(dir, "testlog", BLOCK_SIZE, BLOCKS_PER_FILE, false)
}

fn reader(dir: &Path) -> LogReader {
    LogReader::new(dir, "testlog", BLOCK_SIZE, BLOCKS_PER_FILE)
}

#[test]
fn seek_works_at_every_position() {
    let dir = TempDir::new().unwrap();
    const N: u64 = 300;

    let mut log = writer(dir.path());
    log.initialize().unwrap();
    let mut positions: Vec<LogPos> = Vec::new();
    for rid in 0..N {
        positions.push(log.tell());
        log.write_record(&make_record(rid, record_len(rid))).unwrap();
    }
    log.close().unwrap();

    for rid in 0..N {
        let mut log = reader(dir.path());
        assert!(log.seek(positions[rid as usize]), "seek to {} failed", positions[rid as usize]);
        assert_eq!(log.tell(), positions[rid as usize]);
        let mut rec = MemoryStream::new();
        assert!(log.get_next_record(&mut rec), "no record at {}", positions[rid as usize]);
        verify_record(rid, &rec.read_all());
        // After the read we must sit exactly at the next record, whenever
        // that position is exact (mid-block).
        if rid + 1 < N && positions[(rid + 1) as usize].record_num != 0 {
            assert_eq!(log.tell(), positions[(rid + 1) as usize]);
        }
        assert_eq!(log.num_errors(), 0);
    }
}

#[test]
fn sequential_read_returns_all_records_in_order() {
    let dir = TempDir::new().unwrap();
    const N: u64 = 500;

    let mut log = writer(dir.path());
    log.initialize().unwrap();
    for rid in 0..N {
        log.write_record(&make_record(rid, record_len(rid))).unwrap();
    }
    log.close().unwrap();

    // Files rolled: this many records at these sizes cannot fit one file.
    assert!(list_log_files(dir.path(), "testlog").unwrap().len() > 1);

    let mut log = reader(dir.path());
    let mut rec = MemoryStream::new();
    for rid in 0..N {
        assert!(log.get_next_record(&mut rec), "missing record {rid}");
        verify_record(rid, &rec.read_all());
    }
    assert!(!log.get_next_record(&mut rec));
    assert_eq!(log.num_errors(), 0);
}

#[test]
fn reader_tolerates_a_lagging_writer() {
    let dir = TempDir::new().unwrap();
    let mut log = writer(dir.path());
    log.initialize().unwrap();
    let mut tail = reader(dir.path());
    let mut rec = MemoryStream::new();

    // Nothing written yet: not an error, just not there yet.
    assert!(!tail.get_next_record(&mut rec));

    for rid in 0..40u64 {
        log.write_record(&make_record(rid, record_len(rid))).unwrap();
    }
    log.flush().unwrap();
    for rid in 0..40u64 {
        assert!(tail.get_next_record(&mut rec), "missing record {rid}");
        verify_record(rid, &rec.read_all());
        rec.clear();
    }
    assert!(!tail.get_next_record(&mut rec));

    // More data shows up; the same reader picks it up where it stopped.
    for rid in 40..80u64 {
        log.write_record(&make_record(rid, record_len(rid))).unwrap();
    }
    log.flush().unwrap();
    for rid in 40..80u64 {
        assert!(tail.get_next_record(&mut rec), "missing record {rid}");
        verify_record(rid, &rec.read_all());
        rec.clear();
    }
    assert_eq!(tail.num_errors(), 0);
}

#[test]
fn kill_after_flush_loses_nothing_before_the_flush() {
    let dir = TempDir::new().unwrap();
    const FLUSHED: u64 = 777;

    let mut log = writer(dir.path());
    log.initialize().unwrap();
    for rid in 0..1000u64 {
        log.write_record(&make_record(rid, record_len(rid))).unwrap();
        if rid + 1 == FLUSHED {
            log.flush().unwrap();
            break;
        }
    }
    // Kill: drop without flush or close. The flushed prefix is durable.
    drop(log);

    let mut log = reader(dir.path());
    let mut rec = MemoryStream::new();
    for rid in 0..FLUSHED {
        assert!(log.get_next_record(&mut rec), "missing record {rid}");
        verify_record(rid, &rec.read_all());
        rec.clear();
    }
    assert!(!log.get_next_record(&mut rec));
    assert_eq!(log.num_errors(), 0);
}

#[test]
fn reopened_writer_continues_the_log() {
    let dir = TempDir::new().unwrap();
    let mut log = writer(dir.path());
    log.initialize().unwrap();
    for rid in 0..100u64 {
        log.write_record(&make_record(rid, record_len(rid))).unwrap();
    }
    log.close().unwrap();
    drop(log);

    let mut log = writer(dir.path());
    log.initialize().unwrap();
    for rid in 100..200u64 {
        log.write_record(&make_record(rid, record_len(rid))).unwrap();
    }
    log.close().unwrap();

    let mut log = reader(dir.path());
    let mut rec = MemoryStream::new();
    for rid in 0..200u64 {
        assert!(log.get_next_record(&mut rec), "missing record {rid}");
        verify_record(rid, &rec.read_all());
        rec.clear();
    }
    assert_eq!(log.num_errors(), 0);
}

#[test]
fn tell_positions_are_monotonic() {
    let dir = TempDir::new().unwrap();
    let mut log = writer(dir.path());
    log.initialize().unwrap();
    let mut last = log.tell();
    for rid in 0..200u64 {
        log.write_record(&make_record(rid, record_len(rid))).unwrap();
        let pos = log.tell();
        assert!(pos >= last, "{pos} went backwards from {last}");
        last = pos;
    }
}

#[test]
fn clean_log_removes_files_before_position() {
    let dir = TempDir::new().unwrap();
    let mut log = writer(dir.path());
    log.initialize().unwrap();
    for rid in 0..400u64 {
        log.write_record(&make_record(rid, record_len(rid))).unwrap();
    }
    log.close().unwrap();
    let end = log.tell();
    assert!(end.file_num >= 2);

    let removed = clean_log(dir.path(), "testlog", LogPos::new(end.file_num, 0, 0)).unwrap();
    assert!(removed >= 2);
    let left = list_log_files(dir.path(), "testlog").unwrap();
    assert!(left.iter().all(|(num, _)| *num >= end.file_num));

    // Seeking to the retained position still works.
    let mut log = reader(dir.path());
    assert!(log.seek(LogPos::new(end.file_num, 0, 0)));
}

#[test]
fn detect_settings_from_directory() {
    let dir = TempDir::new().unwrap();
    let mut log = writer(dir.path());
    log.initialize().unwrap();
    for rid in 0..400u64 {
        log.write_record(&make_record(rid, record_len(rid))).unwrap();
    }
    log.close().unwrap();

    let settings = detect_log_settings(dir.path()).unwrap().expect("settings detectable");
    assert_eq!(settings.base, "testlog");
    assert_eq!(settings.block_size, BLOCK_SIZE);
    assert_eq!(settings.blocks_per_file, BLOCKS_PER_FILE);
}

#[test]
fn log_pos_codec_roundtrip() {
    let pos = LogPos::new(3, 12, 7);
    assert_eq!(LogPos::decode(&pos.encode()), Some(pos));
    assert!(LogPos::decode("junk").is_none());
    assert!(LogPos::decode("1:2").is_none());
    assert!(LogPos::new(0, 0, 0).is_null());
    assert!(!pos.is_null());
}

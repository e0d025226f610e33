use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};

use tempfile::TempDir;

use wharf::checkpoint::{
    checkpoint_files, clean_checkpoint_files, read_checkpoint, read_checkpoint_file,
    write_checkpoint_file, CheckpointError, CheckpointMap, CheckpointWriter,
};

fn sample_map(tag: &str, keys: usize) -> CheckpointMap {
    (0..keys)
        .map(|i| (format!("key/{i:04}"), format!("{tag}-value-{i}").into_bytes()))
        .collect()
}

#[test]
fn write_then_read_back() {
    let dir = TempDir::new().unwrap();
    let map = sample_map("a", 100);
    let seq = write_checkpoint_file(dir.path(), "ckpt", &map).unwrap();
    assert_eq!(seq, 0);

    let loaded = read_checkpoint(dir.path(), "ckpt").unwrap().expect("checkpoint present");
    assert_eq!(loaded, map);
}

#[test]
fn sequence_numbers_grow() {
    let dir = TempDir::new().unwrap();
    assert_eq!(write_checkpoint_file(dir.path(), "ckpt", &sample_map("a", 5)).unwrap(), 0);
    assert_eq!(write_checkpoint_file(dir.path(), "ckpt", &sample_map("b", 5)).unwrap(), 1);
    assert_eq!(write_checkpoint_file(dir.path(), "ckpt", &sample_map("c", 5)).unwrap(), 2);
    assert_eq!(checkpoint_files(dir.path(), "ckpt").unwrap().len(), 3);

    // The newest one wins.
    let loaded = read_checkpoint(dir.path(), "ckpt").unwrap().unwrap();
    assert_eq!(loaded, sample_map("c", 5));
}

#[test]
fn duplicate_names_are_rejected() {
    let dir = TempDir::new().unwrap();
    let mut writer = CheckpointWriter::new(dir.path(), "ckpt");
    writer.begin().unwrap();
    writer.add("once", b"1").unwrap();
    match writer.add("once", b"2") {
        Err(CheckpointError::DuplicateName(name)) => assert_eq!(name, "once"),
        other => panic!("expected DuplicateName, got {other:?}"),
    }
}

#[test]
fn missing_end_sentinel_invalidates_the_file() {
    let dir = TempDir::new().unwrap();
    // An aborted checkpoint leaves nothing behind; build a torn one by
    // hand: begin + data, never sealed, then bytes forced out.
    let mut writer = CheckpointWriter::new(dir.path(), "ckpt");
    writer.begin().unwrap();
    for i in 0..2000 {
        writer.add(&format!("k{i}"), b"vvvvvvvvvvvvvvvv").unwrap();
    }
    // Blocks have been written, but no end sentinel: abandon it mid-way by
    // leaking the open state through a fresh writer on the same path.
    std::mem::forget(writer);

    let files = checkpoint_files(dir.path(), "ckpt").unwrap();
    assert_eq!(files.len(), 1);
    assert!(read_checkpoint_file(&files[0].1).is_none());
    assert!(read_checkpoint(dir.path(), "ckpt").unwrap().is_none());
    // The broken file was deleted by the fallback scan.
    assert!(checkpoint_files(dir.path(), "ckpt").unwrap().is_empty());
}

#[test]
fn corrupt_latest_falls_back_to_previous() {
    let dir = TempDir::new().unwrap();
    write_checkpoint_file(dir.path(), "ckpt", &sample_map("old", 50)).unwrap();
    write_checkpoint_file(dir.path(), "ckpt", &sample_map("new", 50)).unwrap();

    // Flip a byte in the newest file.
    let files = checkpoint_files(dir.path(), "ckpt").unwrap();
    let latest = &files.last().unwrap().1;
    let mut file = OpenOptions::new().read(true).write(true).open(latest).unwrap();
    file.seek(SeekFrom::Start(100)).unwrap();
    file.write_all(&[0xFF]).unwrap();
    drop(file);

    let loaded = read_checkpoint(dir.path(), "ckpt").unwrap().unwrap();
    assert_eq!(loaded, sample_map("old", 50));
    // The corrupted one is gone.
    assert_eq!(checkpoint_files(dir.path(), "ckpt").unwrap().len(), 1);
}

#[test]
fn clean_old_keeps_the_newest() {
    let dir = TempDir::new().unwrap();
    for tag in ["a", "b", "c", "d", "e"] {
        write_checkpoint_file(dir.path(), "ckpt", &sample_map(tag, 3)).unwrap();
    }
    clean_checkpoint_files(dir.path(), "ckpt", 2).unwrap();
    let files = checkpoint_files(dir.path(), "ckpt").unwrap();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].0, 3);
    assert_eq!(files[1].0, 4);
}

#[test]
fn empty_checkpoint_roundtrips() {
    let dir = TempDir::new().unwrap();
    write_checkpoint_file(dir.path(), "ckpt", &CheckpointMap::new()).unwrap();
    let loaded = read_checkpoint(dir.path(), "ckpt").unwrap().unwrap();
    assert!(loaded.is_empty());
}

use byteorder::{BigEndian, ByteOrder};

use wharf::recordio::{ReadResult, RecordReader, RecordWriter};
use wharf::stream::MemoryStream;

const BLOCK_SIZE: usize = 1024;

fn record(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| seed.wrapping_add(i as u8)).collect()
}

/// Writes `records` and returns the finalized block stream.
fn frame(records: &[Vec<u8>], deflate: bool) -> MemoryStream {
    let mut writer = RecordWriter::with_options(BLOCK_SIZE, deflate, 0.9);
    let mut out = MemoryStream::with_block_size(BLOCK_SIZE);
    for rec in records {
        writer.append_record(rec, &mut out);
    }
    writer.finalize_content(&mut out);
    assert_eq!(out.size() % BLOCK_SIZE, 0);
    out
}

fn read_all(input: &mut MemoryStream) -> (Vec<Vec<u8>>, usize, usize) {
    let mut reader = RecordReader::new(BLOCK_SIZE);
    let mut records = Vec::new();
    let mut skipped = 0usize;
    let mut errors = 0usize;
    loop {
        let mut out = MemoryStream::new();
        match reader.read_record(input, Some(&mut out), &mut skipped, 0) {
            ReadResult::Ok => records.push(out.read_all()),
            ReadResult::NoData => break,
            _ => errors += 1,
        }
    }
    (records, skipped, errors)
}

#[test]
fn roundtrip_small_records() {
    let records: Vec<Vec<u8>> = (0..50).map(|i| record(i, 10 + i as usize)).collect();
    let mut framed = frame(&records, false);
    let (read, skipped, errors) = read_all(&mut framed);
    assert_eq!(read, records);
    assert_eq!(skipped, 0);
    assert_eq!(errors, 0);
}

#[test]
fn roundtrip_records_spanning_blocks() {
    // Each record needs several blocks; fragments must reassemble exactly.
    let records: Vec<Vec<u8>> =
        (0..7).map(|i| record(i * 31, BLOCK_SIZE * 3 + i as usize * 97)).collect();
    let mut framed = frame(&records, false);
    let (read, skipped, errors) = read_all(&mut framed);
    assert_eq!(read, records);
    assert_eq!(skipped, 0);
    assert_eq!(errors, 0);
}

#[test]
fn empty_record_is_legal() {
    let records = vec![Vec::new(), record(9, 5), Vec::new()];
    let mut framed = frame(&records, false);
    let (read, _, errors) = read_all(&mut framed);
    assert_eq!(read, records);
    assert_eq!(errors, 0);
}

#[test]
fn deflated_records_roundtrip() {
    let records: Vec<Vec<u8>> = (0..20).map(|i| record(i, 600)).collect();
    let mut framed = frame(&records, true);
    // Repetitive payloads compress well: fewer blocks than the raw size.
    assert!(framed.size() < records.iter().map(Vec::len).sum::<usize>());
    let (read, _, errors) = read_all(&mut framed);
    assert_eq!(read, records);
    assert_eq!(errors, 0);
}

#[test]
fn append_returns_true_only_when_blocks_are_emitted() {
    let mut writer = RecordWriter::new(BLOCK_SIZE);
    let mut out = MemoryStream::new();
    assert!(!writer.append_record(&record(1, 16), &mut out));
    assert!(out.is_empty());
    assert_eq!(writer.pending_record_count(), 1);
    assert!(writer.leftover() > 0);

    // Overflow forces at least one full block out.
    assert!(writer.append_record(&record(2, BLOCK_SIZE * 2), &mut out));
    assert!(out.size() >= BLOCK_SIZE);
    assert_eq!(out.size() % BLOCK_SIZE, 0);
}

#[test]
fn no_data_until_a_whole_block_arrives() {
    let mut framed = frame(&[record(3, 100)], false);
    let block = framed.read_all();

    let mut reader = RecordReader::new(BLOCK_SIZE);
    let mut input = MemoryStream::new();
    let mut skipped = 0usize;
    input.write(&block[..BLOCK_SIZE - 1]);
    let mut out = MemoryStream::new();
    assert_eq!(
        reader.read_record(&mut input, Some(&mut out), &mut skipped, 0),
        ReadResult::NoData
    );
    input.write(&block[BLOCK_SIZE - 1..]);
    assert_eq!(
        reader.read_record(&mut input, Some(&mut out), &mut skipped, 0),
        ReadResult::Ok
    );
    assert_eq!(out.read_all(), record(3, 100));
}

#[test]
fn corrupted_block_is_reported_and_skipped() {
    let records: Vec<Vec<u8>> = (0..40).map(|i| record(i, 90)).collect();
    let mut framed = frame(&records, false);
    let mut raw = framed.read_all();
    // Smash a byte in the middle of the second block's content.
    raw[BLOCK_SIZE + 37] ^= 0xFF;

    let mut input = MemoryStream::new();
    input.write(&raw);
    let (read, _skipped, errors) = read_all(&mut input);
    assert!(errors >= 1);
    // Corruption stays local: a couple of blocks' worth of records are
    // lost, everything after the resynchronization point comes through.
    assert!(read.len() >= records.len() - 2 * (BLOCK_SIZE / 94));
    for rec in &records[records.len() - 5..] {
        assert!(read.contains(rec));
    }
}

#[test]
fn chain_break_recovers_mid_record() {
    // A record spanning blocks 0..2, with block 1 replaced by a block from
    // a different chain: the partial record is dropped silently and the
    // reader resynchronizes at the next record start.
    let mut writer = RecordWriter::new(BLOCK_SIZE);
    let mut out = MemoryStream::new();
    writer.append_record(&record(5, BLOCK_SIZE * 2), &mut out);
    writer.append_record(&record(77, 50), &mut out);
    writer.append_record(&record(88, 60), &mut out);
    writer.finalize_content(&mut out);
    let mut raw = out.read_all();

    // Overwrite block 1 with a freshly framed block of its own chain.
    let alien = frame(&[record(200, 64)], false).read_all();
    raw[BLOCK_SIZE..2 * BLOCK_SIZE].copy_from_slice(&alien[..BLOCK_SIZE]);
    // Restamp its prev-crc to break the chain explicitly (prev = junk).
    let trailer = 2 * BLOCK_SIZE - 8;
    BigEndian::write_u32(&mut raw[trailer..trailer + 4], 0xDEAD_BEEF);
    let crc = crc32fast::hash(&raw[BLOCK_SIZE..2 * BLOCK_SIZE - 4]);
    BigEndian::write_u32(&mut raw[2 * BLOCK_SIZE - 4..2 * BLOCK_SIZE], crc);

    let mut input = MemoryStream::new();
    input.write(&raw);
    let (read, skipped, _errors) = read_all(&mut input);
    assert!(skipped > 0);
    // The spanning record is gone, and the first record start after the
    // break is sacrificed to the resynchronization; the next one survives.
    assert!(read.contains(&record(88, 60)));
    assert!(!read.contains(&record(5, BLOCK_SIZE * 2)));
    assert!(!read.contains(&record(77, 50)));
}

#[test]
fn discard_mode_consumes_records() {
    let records: Vec<Vec<u8>> = (0..10).map(|i| record(i, 200)).collect();
    let mut framed = frame(&records, false);
    let mut reader = RecordReader::new(BLOCK_SIZE);
    let mut skipped = 0usize;
    for _ in 0..10 {
        assert_eq!(
            reader.read_record(&mut framed, None, &mut skipped, 0),
            ReadResult::Ok
        );
    }
    assert_eq!(
        reader.read_record(&mut framed, None, &mut skipped, 0),
        ReadResult::NoData
    );
}

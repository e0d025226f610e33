use byteorder::{BigEndian, LittleEndian};
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use wharf::stream::{MemoryStream, TokenRead};

#[test]
fn write_then_read_across_blocks() {
    let mut stream = MemoryStream::with_block_size(16);
    let data: Vec<u8> = (0..200u8).collect();
    assert_eq!(stream.write(&data), 200);
    assert_eq!(stream.size(), 200);

    let mut out = [0u8; 200];
    assert_eq!(stream.read(&mut out), 200);
    assert_eq!(&out[..], &data[..]);
    assert!(stream.is_empty());
}

#[test]
fn interleaved_pipe_preserves_order_and_size() {
    // Alternate writes and reads with sizes that do not line up with the
    // block size; the stream must behave as a perfect pipe.
    let mut stream = MemoryStream::with_block_size(32);
    let mut next_write = 0u32;
    let mut next_read = 0u32;
    for round in 0..500 {
        let burst = 1 + (round * 7) % 13;
        for _ in 0..burst {
            stream.write_u32::<BigEndian>(next_write);
            next_write += 1;
        }
        let drains = 1 + (round * 5) % 11;
        for _ in 0..drains {
            if stream.size() < 4 {
                break;
            }
            assert_eq!(stream.read_u32::<BigEndian>(), next_read);
            next_read += 1;
        }
        assert_eq!(stream.size(), (next_write - next_read) as usize * 4);
    }
    while stream.size() >= 4 {
        assert_eq!(stream.read_u32::<BigEndian>(), next_read);
        next_read += 1;
    }
    assert_eq!(next_read, next_write);
}

#[test]
fn peek_and_skip() {
    let mut stream = MemoryStream::with_block_size(8);
    stream.write(b"hello world");

    let mut peeked = [0u8; 5];
    assert_eq!(stream.peek(&mut peeked), 5);
    assert_eq!(&peeked, b"hello");
    assert_eq!(stream.size(), 11);

    assert_eq!(stream.skip(6), 6);
    assert_eq!(stream.read_all(), b"world");
    assert_eq!(stream.skip(10), 0);
}

#[test]
fn read_next_returns_contiguous_spans() {
    let mut stream = MemoryStream::with_block_size(4);
    stream.write(b"abcdefgh");
    let mut collected = Vec::new();
    while let Some(chunk) = stream.read_next() {
        assert!(!chunk.is_empty());
        collected.extend_from_slice(chunk);
    }
    assert_eq!(collected, b"abcdefgh");
    assert!(stream.is_empty());
}

#[test]
fn scratch_write_roundtrip() {
    let mut stream = MemoryStream::with_block_size(64);
    stream.write(b"head:");
    {
        let scratch = stream.get_scratch();
        assert!(scratch.len() >= 4);
        scratch[..4].copy_from_slice(b"body");
    }
    stream.confirm_scratch(4);
    assert_eq!(stream.read_all(), b"head:body");
}

#[test]
#[should_panic(expected = "scratch")]
fn nested_scratch_panics() {
    let mut stream = MemoryStream::new();
    let _ = stream.get_scratch();
    stream.confirm_scratch(0);
    let _ = stream.get_scratch();
    let _ = stream.get_scratch(); // second hand-out without a confirm
}

#[test]
fn markers_restore_read_position() {
    let mut stream = MemoryStream::with_block_size(8);
    stream.write(b"0123456789");

    stream.marker_set();
    assert_eq!(stream.read_vec(4), b"0123");
    stream.marker_restore();
    assert_eq!(stream.size(), 10);
    assert_eq!(stream.read_vec(4), b"0123");

    // A marker outlives appends; size is recomputed on restore.
    stream.marker_set();
    assert_eq!(stream.read_vec(3), b"456");
    stream.write(b"ab");
    stream.marker_restore();
    assert_eq!(stream.read_all(), b"456789ab");
}

#[test]
fn marker_stack_nests() {
    let mut stream = MemoryStream::new();
    stream.write(b"abcdef");
    stream.marker_set();
    stream.skip(2);
    stream.marker_set();
    stream.skip(2);
    stream.marker_restore(); // back to offset 2
    assert_eq!(stream.read_vec(1), b"c");
    stream.marker_restore(); // back to offset 0
    assert_eq!(stream.read_all(), b"abcdef");
}

#[test]
fn external_block_disposer_runs_on_last_release() {
    static DISPOSED: AtomicUsize = AtomicUsize::new(0);
    DISPOSED.store(0, Ordering::SeqCst);

    let mut a = MemoryStream::new();
    a.append_external(
        b"shared payload".to_vec().into_boxed_slice(),
        Some(Box::new(|| {
            DISPOSED.fetch_add(1, Ordering::SeqCst);
        })),
    );
    let mut b = MemoryStream::new();
    b.append_stream_non_destructive(&a, None);
    assert_eq!(DISPOSED.load(Ordering::SeqCst), 0);

    drop(a);
    assert_eq!(DISPOSED.load(Ordering::SeqCst), 0); // b still references it
    assert_eq!(b.read_all(), b"shared payload");
    drop(b);
    assert_eq!(DISPOSED.load(Ordering::SeqCst), 1);
}

#[test]
fn append_stream_shares_whole_blocks() {
    let block = Arc::new(wharf::DataBlock::from_vec(vec![7u8; 1024]));
    let mut src = MemoryStream::with_block_size(1024);
    src.append_block(Arc::clone(&block));
    assert_eq!(Arc::strong_count(&block), 2);

    let mut dst = MemoryStream::with_block_size(1024);
    dst.append_stream(&mut src, None);
    assert!(src.is_empty());
    assert_eq!(dst.size(), 1024);
    // Moved by reference, not copied.
    drop(src);
    assert_eq!(Arc::strong_count(&block), 2);
    assert_eq!(dst.read_all(), vec![7u8; 1024]);
}

#[test]
fn append_stream_partial_copies() {
    let mut src = MemoryStream::with_block_size(16);
    src.write(b"0123456789abcdef");
    let mut dst = MemoryStream::new();
    dst.append_stream(&mut src, Some(10));
    assert_eq!(dst.read_all(), b"0123456789");
    assert_eq!(src.read_all(), b"abcdef");
}

#[test]
fn append_stream_non_destructive_keeps_source() {
    let mut src = MemoryStream::with_block_size(8);
    src.write(b"keep me around");
    let mut dst = MemoryStream::new();
    dst.append_stream_non_destructive(&src, Some(7));
    assert_eq!(dst.read_all(), b"keep me");
    assert_eq!(src.size(), 14);
}

#[test]
fn crlf_line_reading() {
    let mut stream = MemoryStream::with_block_size(4);
    stream.write(b"GET / HTTP/1.1\r\nHost: h\r\n\r\ntail");

    assert_eq!(stream.read_crlf_line().unwrap(), b"GET / HTTP/1.1\r\n");
    assert_eq!(stream.read_line().unwrap(), b"Host: h");
    assert_eq!(stream.read_crlf_line().unwrap(), b"\r\n");
    // No CRLF in what remains.
    assert!(stream.read_crlf_line().is_none());
    assert_eq!(stream.size(), 4);
}

#[test]
fn lf_line_reading() {
    let mut stream = MemoryStream::new();
    stream.write(b"one\ntwo\n");
    assert_eq!(stream.read_lf_line().unwrap(), b"one\n");
    assert_eq!(stream.read_lf_line().unwrap(), b"two\n");
    assert!(stream.read_lf_line().is_none());
}

#[test]
fn partial_line_waits_for_terminator() {
    let mut stream = MemoryStream::new();
    stream.write(b"incomplete");
    assert!(stream.read_crlf_line().is_none());
    assert_eq!(stream.size(), 10);
    stream.write(b" line\r\n");
    assert_eq!(stream.read_line().unwrap(), b"incomplete line");
}

#[test]
fn ascii_tokens() {
    let mut stream = MemoryStream::new();
    stream.write(b"  alpha, \"quo \\\"ted\\\"\"  beta");
    assert_eq!(stream.read_next_ascii_token(), TokenRead::Ok(b"alpha".to_vec()));
    assert_eq!(stream.read_next_ascii_token(), TokenRead::Ok(b",".to_vec()));
    assert_eq!(stream.read_next_ascii_token(), TokenRead::Ok(b"quo \"ted\"".to_vec()));
    assert_eq!(stream.read_next_ascii_token(), TokenRead::Ok(b"beta".to_vec()));
    assert_eq!(stream.read_next_ascii_token(), TokenRead::NoData);
}

#[test]
fn unterminated_quote_is_no_data() {
    let mut stream = MemoryStream::new();
    stream.write(b"\"open");
    assert_eq!(stream.read_next_ascii_token(), TokenRead::NoData);
    stream.write(b" end\"");
    assert_eq!(stream.read_next_ascii_token(), TokenRead::Ok(b"open end".to_vec()));
}

#[test]
fn numeric_codec_both_endians() {
    let mut stream = MemoryStream::new();
    stream.write_u8(0xAB);
    stream.write_u16::<BigEndian>(0x1234);
    stream.write_u24::<BigEndian>(0x00AB_CDEF);
    stream.write_i32::<LittleEndian>(-123_456);
    stream.write_u64::<BigEndian>(0x0123_4567_89AB_CDEF);
    stream.write_f64::<BigEndian>(2.5);

    assert_eq!(stream.read_u8(), 0xAB);
    assert_eq!(stream.peek_u16::<BigEndian>(), 0x1234);
    assert_eq!(stream.read_u16::<BigEndian>(), 0x1234);
    assert_eq!(stream.read_u24::<BigEndian>(), 0x00AB_CDEF);
    assert_eq!(stream.read_i32::<LittleEndian>(), -123_456);
    assert_eq!(stream.read_u64::<BigEndian>(), 0x0123_4567_89AB_CDEF);
    assert_eq!(stream.read_f64::<BigEndian>(), 2.5);
    assert!(stream.is_empty());
}

#[test]
fn read_for_writev_commits_via_skip() {
    let mut stream = MemoryStream::with_block_size(4);
    stream.write(b"0123456789");
    let slices = stream.read_for_writev(7);
    let total: usize = slices.iter().map(|s| s.len()).sum();
    assert_eq!(total, 7);
    drop(slices);
    stream.skip(7);
    assert_eq!(stream.read_all(), b"789");
}

#[test]
fn stream_equality() {
    let mut a = MemoryStream::with_block_size(3);
    let mut b = MemoryStream::with_block_size(64);
    a.write(b"same content");
    b.write(b"same ");
    b.write(b"content");
    assert_eq!(a, b);
    b.write(b"!");
    assert_ne!(a, b);
}

proptest! {
    // Any mix of writes and reads behaves exactly like one flat byte queue.
    #[test]
    fn pipe_equivalence(ops in prop::collection::vec((any::<bool>(), 1usize..300), 1..60),
                        block_size in 1usize..128) {
        let mut stream = MemoryStream::with_block_size(block_size);
        let mut model: Vec<u8> = Vec::new();
        let mut counter = 0u8;
        let mut read_off = 0usize;
        for (is_write, amount) in ops {
            if is_write {
                let data: Vec<u8> = (0..amount).map(|_| { counter = counter.wrapping_add(1); counter }).collect();
                stream.write(&data);
                model.extend_from_slice(&data);
            } else {
                let got = stream.read_vec(amount);
                let want = &model[read_off..(read_off + amount).min(model.len())];
                prop_assert_eq!(&got[..], want);
                read_off += got.len();
            }
            prop_assert_eq!(stream.size(), model.len() - read_off);
        }
    }
}

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use wharf::recordio::{RecordReader, RecordWriter};
use wharf::stream::MemoryStream;

fn bench_stream_pipe(c: &mut Criterion) {
    let payload = vec![0x42u8; 64 * 1024];
    c.bench_function("stream_write_read_64k", |b| {
        b.iter(|| {
            let mut stream = MemoryStream::new();
            stream.write(black_box(&payload));
            let mut out = vec![0u8; payload.len()];
            stream.read(&mut out);
            out
        })
    });
}

fn bench_record_framing(c: &mut Criterion) {
    let record = vec![0x17u8; 900];
    c.bench_function("frame_1000_records", |b| {
        b.iter(|| {
            let mut writer = RecordWriter::new(65536);
            let mut out = MemoryStream::new();
            for _ in 0..1000 {
                writer.append_record(black_box(&record), &mut out);
            }
            writer.finalize_content(&mut out);
            out.size()
        })
    });
    // Pre-frame once for the read side.
    let mut writer = RecordWriter::new(65536);
    let mut framed = MemoryStream::new();
    for _ in 0..1000 {
        writer.append_record(&record, &mut framed);
    }
    writer.finalize_content(&mut framed);
    let raw = framed.read_all();
    c.bench_function("read_1000_records", |b| {
        b.iter(|| {
            let mut reader = RecordReader::new(65536);
            let mut input = MemoryStream::new();
            input.write(&raw);
            let mut skipped = 0;
            let mut count = 0;
            loop {
                let mut out = MemoryStream::new();
                match reader.read_record(&mut input, Some(&mut out), &mut skipped, 0) {
                    wharf::ReadResult::Ok => count += 1,
                    _ => break,
                }
            }
            count
        })
    });
}

criterion_group!(benches, bench_stream_pipe, bench_record_framing);
criterion_main!(benches);

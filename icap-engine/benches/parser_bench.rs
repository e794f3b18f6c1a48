use criterion::{Criterion, black_box, criterion_group, criterion_main};
use icap_engine::exchange::ExchangeState;
use icap_engine::parser::parse_encapsulated_value;
use icap_engine::parser::wire::write_chunks_into;

fn sample_respmod(body_len: usize, preview: Option<usize>) -> Vec<u8> {
    let req_head = "GET http://origin.test/file.bin HTTP/1.1\r\nHost: origin.test\r\nUser-Agent: bench\r\n\r\n";
    let res_head = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {body_len}\r\n\r\n"
    );
    let preview_line = preview.map(|p| format!("Preview: {p}\r\n")).unwrap_or_default();
    let icap = format!(
        "RESPMOD icap://127.0.0.1:1344/echo ICAP/1.0\r\nHost: 127.0.0.1\r\nAllow: 204\r\n{preview_line}Encapsulated: req-hdr=0, res-hdr={}, res-body={}\r\n\r\n",
        req_head.len(),
        req_head.len() + res_head.len()
    );

    let body = vec![b'x'; body_len];
    let mut raw = icap.into_bytes();
    raw.extend_from_slice(req_head.as_bytes());
    raw.extend_from_slice(res_head.as_bytes());
    let sent = preview.map_or(body_len, |p| p.min(body_len));
    write_chunks_into(&mut raw, 0, &body[..sent]);
    raw
}

fn bench_parse(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let raw = sample_respmod(16 * 1024, Some(4096));
    let mut state = ExchangeState::new();

    c.bench_function("parse_respmod_with_preview_4k", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut input: &[u8] = black_box(&raw);
                state.parse(&mut input).await.expect("parse");
                state.read_preview(&mut input).await.expect("preview");
                black_box(state.body().len())
            })
        })
    });
}

fn bench_encapsulated(c: &mut Criterion) {
    c.bench_function("parse_encapsulated_value", |b| {
        b.iter(|| parse_encapsulated_value(black_box("req-hdr=0, res-hdr=137, res-body=296")).expect("valid"))
    });
}

fn bench_chunk_writer(c: &mut Criterion) {
    let body = vec![0u8; 256 * 1024];
    let mut out = Vec::with_capacity(body.len() + 4096);
    c.bench_function("write_chunks_256k", |b| {
        b.iter(|| {
            out.clear();
            write_chunks_into(&mut out, 120, black_box(&body));
            out.len()
        })
    });
}

criterion_group!(benches, bench_parse, bench_encapsulated, bench_chunk_writer);
criterion_main!(benches);

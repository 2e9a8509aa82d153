//! Benchmarks for TLS ClientHello sniffing.
//!
//! Run with: `cargo bench --bench sniff_parsing`
//!
//! Every CONNECT tunnel inspects the client's first flight before dialing,
//! and transparent TLS peeks every new connection, so these run once per
//! client connection.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use racing_proxy::sniff::{build_client_hello, extract_sni, is_client_hello, server_name, sniff_tls, sniff_tls_sni};

// ============================================================================
// Test Data
// ============================================================================

/// ClientHello captured from a real browser
const CAPTURED_HELLO: &[u8] = include_bytes!("../tests/fixtures/client_hello_example_com.bin");

/// Synthetic hellos of increasing name length
fn synthetic_hellos() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("short_sni", build_client_hello("a.io", &[])),
        ("alpn", build_client_hello("www.example.com", &["h2", "http/1.1"])),
        (
            "long_sni",
            build_client_hello("very-long-subdomain-name.cdn.static.assets.example-cloud-provider.com", &["http/1.1"]),
        ),
    ]
}

/// A plain HTTP request, the common negative case
fn http_request() -> Vec<u8> {
    b"GET http://example.com/index.html HTTP/1.1\r\nHost: example.com\r\nUser-Agent: bench\r\n\r\n".to_vec()
}

// ============================================================================
// Detection
// ============================================================================

fn bench_detection(c: &mut Criterion) {
    let mut group = c.benchmark_group("hello_detection");

    group.bench_function("captured_hello", |b| {
        b.iter(|| black_box(is_client_hello(black_box(CAPTURED_HELLO))));
    });

    let http = http_request();
    group.bench_function("http_request", |b| {
        b.iter(|| black_box(is_client_hello(black_box(&http))));
    });

    group.finish();
}

// ============================================================================
// SNI Extraction
// ============================================================================

fn bench_sni(c: &mut Criterion) {
    let mut group = c.benchmark_group("sni_extraction");

    group.throughput(Throughput::Bytes(CAPTURED_HELLO.len() as u64));
    group.bench_with_input(
        BenchmarkId::new("extract_sni", "captured"),
        CAPTURED_HELLO,
        |b, hello| b.iter(|| black_box(extract_sni(black_box(hello)))),
    );
    group.bench_with_input(
        BenchmarkId::new("sniff_tls_sni", "captured"),
        CAPTURED_HELLO,
        |b, hello| b.iter(|| black_box(sniff_tls_sni(black_box(hello)))),
    );

    for (name, hello) in synthetic_hellos() {
        group.throughput(Throughput::Bytes(hello.len() as u64));
        group.bench_with_input(BenchmarkId::new("extract_sni", name), &hello, |b, hello| {
            b.iter(|| black_box(extract_sni(black_box(hello))));
        });
        group.bench_with_input(BenchmarkId::new("server_name", name), &hello, |b, hello| {
            b.iter(|| black_box(server_name(black_box(hello))));
        });
    }

    group.finish();
}

// ============================================================================
// Full Sniff
// ============================================================================

fn bench_full_sniff(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_sniff");

    group.bench_function("captured_hello", |b| {
        b.iter(|| black_box(sniff_tls(black_box(CAPTURED_HELLO))));
    });

    // Truncated records must be rejected without panicking
    let truncated = &CAPTURED_HELLO[..CAPTURED_HELLO.len() / 2];
    group.bench_function("truncated_hello", |b| {
        b.iter(|| black_box(sniff_tls(black_box(truncated))));
    });

    group.finish();
}

criterion_group!(benches, bench_detection, bench_sni, bench_full_sniff);
criterion_main!(benches);

//! Criterion microbenchmarks for the per-request and per-PDU work done on
//! the federation ingress path.
//!
//! Run with:
//!   cargo bench -p hearth-api
//!
//! HTML reports are written to `target/criterion/`.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use hearth_common::Event;
use hearth_federation::{
    ServerKeyPair,
    signatures::{FedAuth, sign_event, sign_request, verify_event_signature, verify_request},
};
use serde_json::{Value, json};

fn message(n: usize, body_len: usize) -> Event {
    let mut event = Event {
        event_id: String::new(),
        room_id: "!bench:b.test".into(),
        sender: "@bob:b.test".into(),
        event_type: "m.room.message".into(),
        state_key: None,
        content: json!({ "body": "x".repeat(body_len), "n": n }),
        prev_events: vec!["$prev-a".into(), "$prev-b".into()],
        auth_events: vec!["$create".into(), "$power".into(), "$member".into()],
        depth: n as u64,
        origin_server_ts: 1_700_000_000_000 + n as i64,
        signatures: Default::default(),
    };
    event.seal().unwrap();
    event
}

// ── PDU parsing ──────────────────────────────────────────────────────────────

/// Parse a wire PDU and recompute its reference hash.
fn bench_from_pdu(c: &mut Criterion) {
    let mut group = c.benchmark_group("pdu/from_pdu");
    for body_len in [64, 1024, 16 * 1024] {
        let pdu = serde_json::to_value(message(1, body_len)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(body_len), &pdu, |b, pdu| {
            b.iter(|| Event::from_pdu(black_box(pdu.clone())).unwrap())
        });
    }
    group.finish();
}

// ── Signatures ───────────────────────────────────────────────────────────────

fn bench_event_signatures(c: &mut Criterion) {
    let keys = ServerKeyPair::generate();
    let public = keys.public_key_base64();
    let mut event = message(1, 256);

    c.bench_function("signature/sign_event", |b| {
        b.iter(|| {
            let mut ev = event.clone();
            sign_event(&keys, "b.test", black_box(&mut ev)).unwrap();
        })
    });

    sign_event(&keys, "b.test", &mut event).unwrap();
    c.bench_function("signature/verify_event", |b| {
        b.iter(|| verify_event_signature(black_box(&event), "b.test", &keys.key_id, &public).unwrap())
    });
}

/// Authenticate a full 50-PDU transaction request.
fn bench_request_auth(c: &mut Criterion) {
    let keys = ServerKeyPair::generate();
    let public = keys.public_key_base64();
    let pdus: Vec<Value> = (0..50).map(|n| serde_json::to_value(message(n, 256)).unwrap()).collect();
    let body = json!({ "origin": "b.test", "origin_server_ts": 0, "pdus": pdus });
    let uri = "/_hearth/federation/v1/send/bench";
    let header = sign_request(&keys, "b.test", "a.test", "PUT", uri, Some(&body)).to_header();

    c.bench_function("request/verify_50_pdus", |b| {
        b.iter(|| {
            let auth = FedAuth::parse(black_box(&header)).unwrap();
            verify_request(&auth, "a.test", "PUT", uri, Some(&body), &public).unwrap()
        })
    });
}

criterion_group!(benches, bench_from_pdu, bench_event_signatures, bench_request_auth);
criterion_main!(benches);

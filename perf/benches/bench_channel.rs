use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::time::Duration;
use tandem_icc::Endpoint;
use tandem_perf::{EchoPair, make_payload, unique_channel_ids};

/// Send then receive on the same thread: the uncontended cost of both
/// handshakes plus two copies.
fn bench_send_receive_local(c: &mut Criterion) {
    let (client_id, server_id) = unique_channel_ids("l");
    let mut server = Endpoint::init(&client_id, &server_id).expect("failed to init server");
    let mut client = Endpoint::connect(&client_id, &server_id).expect("failed to connect client");
    let payload = make_payload(64);
    let mut buf = [0u8; 64];

    let mut group = c.benchmark_group("channel");
    group.throughput(Throughput::Elements(1));

    group.bench_function("send_receive_local", |b| {
        b.iter(|| {
            server
                .send(black_box(&payload), Duration::from_secs(1))
                .expect("send");
            black_box(client.receive(&mut buf, Duration::from_secs(1)).expect("receive"));
        });
    });

    drop(group);
    drop(client);
    drop(server);
}

/// Full request/response against an echo thread.
fn bench_round_trip(c: &mut Criterion) {
    let mut pair = EchoPair::start("r", 4096).expect("failed to start echo pair");
    let payload = make_payload(64);
    let mut reply = [0u8; 64];

    let mut group = c.benchmark_group("channel");
    group.throughput(Throughput::Elements(1));

    group.bench_function("round_trip", |b| {
        b.iter(|| black_box(pair.round_trip(black_box(&payload), &mut reply).expect("round trip")));
    });

    drop(group);
    pair.finish().expect("echo thread failed");
}

fn bench_round_trip_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("channel_payload");

    for &size in &[8usize, 256, 4096, 65536] {
        let mut pair = EchoPair::start("z", size).expect("failed to start echo pair");
        let payload = make_payload(size);
        let mut reply = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::new("round_trip", size), &size, |b, _| {
            b.iter(|| black_box(pair.round_trip(&payload, &mut reply).expect("round trip")));
        });

        pair.finish().expect("echo thread failed");
    }

    group.finish();
}

fn bench_timeout_empty(c: &mut Criterion) {
    let (client_id, server_id) = unique_channel_ids("e");
    let _server = Endpoint::init(&client_id, &server_id).expect("failed to init server");
    let mut client = Endpoint::connect(&client_id, &server_id).expect("failed to connect client");
    let mut buf = [0u8; 8];

    let mut group = c.benchmark_group("channel");
    group.bench_function("receive_zero_timeout_empty", |b| {
        b.iter(|| black_box(client.receive(&mut buf, Duration::ZERO).is_err()));
    });
    group.finish();
}

criterion_group!(
    benches,
    bench_send_receive_local,
    bench_round_trip,
    bench_round_trip_sizes,
    bench_timeout_empty,
);
criterion_main!(benches);

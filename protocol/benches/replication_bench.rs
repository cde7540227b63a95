// Replica selection and signature recovery benchmarks.
//
// Bucketing runs once per campaign per node and claim recovery once per
// gossiped peer, so both sit on hot paths during catch-up.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use driftcast_protocol::crypto::keys::NodeKeypair;
use driftcast_protocol::crypto::signatures::{node_claim_message, recover, sign_node_claim};
use driftcast_protocol::replication::{bucket, ReplicaDecision, ReplicaKind};

fn bench_bucket(c: &mut Criterion) {
    let address = NodeKeypair::from_seed(&[1u8; 32]).address();

    c.bench_function("replication/bucket", |b| {
        b.iter(|| bucket(&address, ReplicaKind::Data, "c0ffee-content-id"));
    });
}

fn bench_decision_sweep(c: &mut Criterion) {
    let address = NodeKeypair::from_seed(&[2u8; 32]).address();
    let mut group = c.benchmark_group("replication/decision_sweep");

    for size in [100usize, 1_000, 10_000] {
        let ids: Vec<String> = (0..size).map(|i| format!("content-{}", i)).collect();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &ids, |b, ids| {
            b.iter(|| {
                ids.iter()
                    .filter(|id| ReplicaDecision::evaluate(&address, id, 0.35, 0.10).data)
                    .count()
            });
        });
    }
    group.finish();
}

fn bench_claim_recovery(c: &mut Criterion) {
    let keypair = NodeKeypair::generate();
    let endpoint = "http://203.0.113.10:7440";
    let signature = sign_node_claim(&keypair, "relay-one", endpoint);
    let message = node_claim_message("relay-one", endpoint);

    c.bench_function("signatures/recover_node_claim", |b| {
        b.iter(|| recover(&message, &signature));
    });
}

criterion_group!(benches, bench_bucket, bench_decision_sweep, bench_claim_recovery);
criterion_main!(benches);

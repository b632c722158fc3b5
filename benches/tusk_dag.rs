//! Tusk DAG benchmarks.
//!
//! Measures block proposal, ack-quorum certification, and anchor
//! linearization cost as the DAG grows across several rounds.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resilientdb_core::crypto::{Ed25519Verifier, SignatureVerifier};
use resilientdb_core::message::Batch;
use resilientdb_core::tusk::{Ack, TuskEngine};

fn verifiers(n: usize) -> Vec<Ed25519Verifier> {
    (1..=n as u32).map(|i| Ed25519Verifier::from_seed(i, [i as u8; 32])).collect()
}

/// Drive `rounds` of propose+certify for proposer 1 among `n` replicas,
/// returning the fully advanced engine.
fn run_rounds(n: usize, rounds: u64) -> TuskEngine {
    let engine = TuskEngine::new(1, n);
    let vs = verifiers(n);
    for _ in 0..rounds {
        let block = engine.propose(Batch::new(0, 0, vec![])).unwrap();
        for v in &vs {
            let signature = v.sign(&block.hash).unwrap();
            engine.on_ack(Ack { block_hash: block.hash, voter: v.self_id(), signature });
        }
    }
    engine
}

fn bench_propose_and_certify(c: &mut Criterion) {
    let mut group = c.benchmark_group("tusk_propose_and_certify");

    for n in [4usize, 7, 13] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                black_box(run_rounds(n, 1));
            });
        });
    }

    group.finish();
}

fn bench_linearize_growing_dag(c: &mut Criterion) {
    let mut group = c.benchmark_group("tusk_linearize");

    for rounds in [4u64, 16, 64] {
        group.throughput(Throughput::Elements(rounds));
        group.bench_with_input(BenchmarkId::from_parameter(rounds), &rounds, |b, &rounds| {
            b.iter(|| {
                let engine = run_rounds(4, rounds);
                black_box(engine.try_commit(rounds.saturating_sub(rounds % 2)));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_propose_and_certify, bench_linearize_growing_dag);
criterion_main!(benches);

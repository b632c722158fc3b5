//! chained-HotStuff pipeline benchmarks.
//!
//! Measures the vote-aggregation hot path (`on_vote`, QC formation) and a
//! full PREPARE→PRECOMMIT→COMMIT→DECIDE round for small-to-moderate
//! replica counts.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use resilientdb_core::crypto::{Ed25519Verifier, SignatureVerifier};
use resilientdb_core::hotstuff::{HotStuffEngine, Phase, ProposalNode, Vote};
use resilientdb_core::message::Batch;

fn verifiers(n: usize) -> Vec<Ed25519Verifier> {
    (1..=n as u32).map(|i| Ed25519Verifier::from_seed(i, [i as u8; 32])).collect()
}

fn bench_vote_aggregation(c: &mut Criterion) {
    let mut group = c.benchmark_group("hotstuff_vote_aggregation");

    for n in [4usize, 7, 13] {
        group.throughput(Throughput::Elements(n as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let engine = HotStuffEngine::new(1, n);
                let vs = verifiers(n);
                let node = ProposalNode::genesis();
                for v in &vs {
                    let signature = v.sign(&node.hash).unwrap();
                    let vote = Vote { phase: Phase::Prepare, view: 1, node_hash: node.hash, voter: v.self_id(), signature };
                    black_box(engine.on_vote(vote));
                }
            });
        });
    }

    group.finish();
}

fn bench_proposal_node_hashing(c: &mut Criterion) {
    let mut group = c.benchmark_group("hotstuff_proposal_hashing");
    group.throughput(Throughput::Elements(1));

    group.bench_function("new_node_over_empty_batch", |b| {
        let parent = ProposalNode::genesis();
        b.iter(|| {
            let node = black_box(ProposalNode::new(1, parent.hash, Batch::new(0, 0, vec![])));
            black_box(node.hash);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_vote_aggregation, bench_proposal_node_hashing);
criterion_main!(benches);

//! Benchmarks for key rewriting.
//!
//! The rewriter runs once per conversion over the full key set of a
//! checkpoint, so per-key cost barely matters in production; the benchmark
//! exists to catch accidental quadratic behavior in the corpus-based
//! substitution when tables or checkpoints grow.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use graft_core::rewrite::{KeyMapping, Rule};

/// A mapping table shaped like the real ones: prefix renames, indexed
/// renumbering and one drop rule.
fn sample_mapping() -> KeyMapping {
    KeyMapping::new(vec![
        Rule::template(r"encoder.layer(\d+).conv(\d+)", r"backbone.stages.$1.blocks.$2").unwrap(),
        Rule::rename(r"attention.layers.(\d*[02468]).proj", |caps| {
            let idx: usize = caps[1].parse().unwrap_or(0);
            format!("transformer.layers.{}.self_attention.proj", idx / 2)
        })
        .unwrap(),
        Rule::rename(r"attention.layers.(\d*[13579]).proj", |caps| {
            let idx: usize = caps[1].parse().unwrap_or(0);
            format!("transformer.layers.{}.cross_attention.proj", idx / 2)
        })
        .unwrap(),
        Rule::template(r"head.final", "matching.final").unwrap(),
        Rule::drop(r"aux_loss.*").unwrap(),
    ])
}

/// Synthetic checkpoint key corpus of a realistic size.
fn sample_keys(layers: usize) -> Vec<String> {
    let mut keys = Vec::new();
    for layer in 0..layers {
        for conv in 0..4 {
            keys.push(format!("encoder.layer{layer}.conv{conv}.weight"));
            keys.push(format!("encoder.layer{layer}.conv{conv}.bias"));
        }
        keys.push(format!("attention.layers.{layer}.proj.weight"));
    }
    keys.push("head.final.weight".to_string());
    keys.push("aux_loss.weight".to_string());
    keys
}

fn bench_rewrite(c: &mut Criterion) {
    let mapping = sample_mapping();

    let mut group = c.benchmark_group("rewrite");
    for layers in [8, 32, 128] {
        let keys = sample_keys(layers);
        group.throughput(Throughput::Elements(keys.len() as u64));
        group.bench_function(format!("{}_keys", keys.len()), |b| {
            b.iter(|| {
                let map = mapping.apply(black_box(&keys));
                black_box(map.len())
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_rewrite);
criterion_main!(benches);

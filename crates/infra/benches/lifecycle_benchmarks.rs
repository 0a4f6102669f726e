use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;

use aetos_core::ScrapeJobId;
use aetos_events::{EventEnvelope, InMemoryEventBus};
use aetos_infra::ingestion::{IngestionProcessor, ScrapeBatch, ScrapeMatch};
use aetos_infra::outbox::{Relay, RelayConfig};
use aetos_infra::store::InMemoryLifecycleStore;
use aetos_infra::transition::{TransitionConfig, TransitionEngine, TransitionRequest};
use aetos_lifecycle::{ListingState, Trigger};
use serde_json::Value as JsonValue;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn batch(size: usize) -> ScrapeBatch {
    ScrapeBatch {
        job_id: ScrapeJobId::new(),
        brand: "Nikon".into(),
        matches: (0..size)
            .map(|i| ScrapeMatch {
                url: format!("https://marketplace.test/item/{i}"),
                title: "Nikon F3 HP".into(),
                price: 320.0,
                product_id: i as i64,
                brand: "Nikon".into(),
                model: "F3".into(),
                confidence: 85.0,
                potential_profit: 110.0,
            })
            .collect(),
    }
}

fn bench_state_graph(c: &mut Criterion) {
    c.bench_function("state_graph_full_grid", |b| {
        b.iter(|| {
            let mut valid = 0;
            for from in ListingState::ALL {
                for to in ListingState::ALL {
                    if black_box(from).validate(black_box(to)).is_ok() {
                        valid += 1;
                    }
                }
            }
            valid
        })
    });
}

fn bench_ingestion_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("ingest_batch");

    for size in [10usize, 100, 500] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let store = Arc::new(InMemoryLifecycleStore::new());
                    let processor = IngestionProcessor::new(store);
                    processor.ingest_batch(batch(size)).await.unwrap()
                })
            })
        });
    }

    group.finish();
}

fn bench_transition_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("transition");
    group.sample_size(500);

    group.bench_function("found_to_messaging", |b| {
        b.iter(|| {
            rt.block_on(async {
                let store = Arc::new(InMemoryLifecycleStore::new());
                let outcome = IngestionProcessor::new(store.clone())
                    .ingest_batch(batch(1))
                    .await
                    .unwrap();
                let engine = TransitionEngine::new(store, TransitionConfig::default());
                engine
                    .transition(TransitionRequest::new(
                        outcome.created_ids[0],
                        ListingState::Messaging,
                        Trigger::System,
                    ))
                    .await
                    .unwrap()
            })
        })
    });

    group.finish();
}

fn bench_relay_drain(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("relay_drain");

    for size in [100usize, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                rt.block_on(async {
                    let store = Arc::new(InMemoryLifecycleStore::new());
                    IngestionProcessor::new(store.clone())
                        .ingest_batch(batch(size))
                        .await
                        .unwrap();
                    let bus: Arc<InMemoryEventBus<EventEnvelope<JsonValue>>> =
                        Arc::new(InMemoryEventBus::new());
                    let relay = Relay::new(
                        store,
                        bus,
                        RelayConfig::default().with_batch_size(size),
                    );
                    relay.drain_once().await.unwrap()
                })
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_state_graph,
    bench_ingestion_throughput,
    bench_transition_latency,
    bench_relay_drain
);
criterion_main!(benches);

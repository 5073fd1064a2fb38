//! Merge and dispatch throughput benchmark

use searchdispatch::cluster::{HealthPinger, Node, Pong, TopologyDescriptor, TopologySnapshot};
use searchdispatch::config::DispatchConfig;
use searchdispatch::dispatcher::Dispatcher;
use searchdispatch::search::{
    merge_lean_hits, Coverage, FillReply, FillRequest, GlobalId, LeanHit, Query, SearchReply,
    SearchRequest, TopKEstimator,
};
use searchdispatch::transport::{ConnectionPool, NodeConnection, Transport};
use searchdispatch::Result;

use async_trait::async_trait;
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;

fn partial_lists(nodes: u32, hits_per_node: usize, seed: u64) -> Vec<Vec<LeanHit>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..nodes)
        .map(|key| {
            let mut hits: Vec<LeanHit> = (0..hits_per_node)
                .map(|i| {
                    let mut gid = [0u8; 12];
                    gid[..4].copy_from_slice(&key.to_be_bytes());
                    gid[4..12].copy_from_slice(&(i as u64).to_be_bytes());
                    LeanHit::with_relevance(GlobalId::new(gid), rng.gen_range(0.0..100.0), 0, key)
                })
                .collect();
            hits.sort();
            hits
        })
        .collect()
}

fn benchmark_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_lean_hits");

    for (nodes, hits_per_node) in [(4u32, 100usize), (16, 100), (64, 50)] {
        let lists = partial_lists(nodes, hits_per_node, 42);
        group.throughput(Throughput::Elements(u64::from(nodes) * hits_per_node as u64));
        group.bench_function(format!("{nodes}x{hits_per_node}"), |b| {
            b.iter_batched(
                || lists.clone(),
                |lists| {
                    let merged = lists
                        .into_iter()
                        .fold(Vec::new(), |acc, partial| merge_lean_hits(acc, partial, 100));
                    black_box(merged);
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn benchmark_top_k(c: &mut Criterion) {
    let estimator = TopKEstimator::new(30.0, 0.9999).unwrap();
    let mut group = c.benchmark_group("top_k");

    group.bench_function("cached_probability", |b| {
        b.iter(|| black_box(estimator.estimate_k(black_box(400), black_box(32))));
    });
    group.bench_function("query_probability", |b| {
        b.iter(|| black_box(estimator.estimate_k_with(black_box(400), black_box(32), 0.999)));
    });

    group.finish();
}

struct InstantNode {
    hits: Vec<LeanHit>,
}

#[async_trait]
impl NodeConnection for InstantNode {
    async fn search(&self, request: SearchRequest) -> Result<SearchReply> {
        let hits: Vec<LeanHit> = self.hits.iter().take(request.hits as usize).cloned().collect();
        Ok(SearchReply {
            total_hits: self.hits.len() as u64,
            hits,
            coverage: Coverage::for_node(10_000, 10_000, 10_000),
            ..Default::default()
        })
    }

    async fn fill(&self, _request: FillRequest) -> Result<FillReply> {
        Ok(FillReply::default())
    }
}

struct InstantPool {
    lists: Vec<Vec<LeanHit>>,
}

impl ConnectionPool for InstantPool {
    fn open(&self, node: &Node) -> Result<Arc<dyn NodeConnection>> {
        let hits = self
            .lists
            .get(node.key() as usize)
            .cloned()
            .unwrap_or_default();
        Ok(Arc::new(InstantNode { hits }))
    }

    fn close(&self) {}
}

struct InstantTransport {
    lists: Vec<Vec<LeanHit>>,
}

impl Transport for InstantTransport {
    fn create_pool(&self, _topology: &TopologySnapshot) -> Result<Arc<dyn ConnectionPool>> {
        Ok(Arc::new(InstantPool {
            lists: self.lists.clone(),
        }))
    }
}

struct AlwaysUp;

#[async_trait]
impl HealthPinger for AlwaysUp {
    async fn ping(&self, _node: &Node) -> Result<Pong> {
        Ok(Pong {
            active_docs: 10_000,
            target_active_docs: 10_000,
            blocking_writes: false,
        })
    }
}

fn benchmark_dispatch(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("dispatch");
    group.throughput(Throughput::Elements(1));

    let nodes = 16;
    let dispatcher = rt.block_on(async {
        let dispatcher = Dispatcher::new(
            DispatchConfig::default(),
            &TopologyDescriptor::uniform(2, nodes),
            Arc::new(InstantTransport {
                lists: partial_lists(2 * nodes, 200, 7),
            }),
            Arc::new(AlwaysUp),
        )
        .unwrap();
        dispatcher.ping_once().await;
        dispatcher
    });

    group.bench_function("interleaved_16_nodes", |b| {
        b.to_async(&rt).iter(|| async {
            let query = Query::new(Bytes::from_static(b"bench"), 100, Duration::from_secs(5));
            black_box(dispatcher.search(&query).await);
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_merge, benchmark_top_k, benchmark_dispatch);

criterion_main!(benches);

// Copyright 2025 Penne Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Fan-out Dispatch Benchmarks
//!
//! Measures the cost of delivering one event to several sinks concurrently,
//! with and without simulated sink latency.
//!
//! # Running Benchmarks
//!
//! ```bash
//! cargo bench --package penne-benches --bench fanout_dispatch
//! ```

use bson::doc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use penne_core::dispatcher::FanoutDispatcher;
use penne_core::event::{ChangeEvent, Namespace, OperationType};
use penne_core::sink::{MockSink, SinkAdapter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn events(count: usize) -> Vec<Arc<ChangeEvent>> {
    (0..count)
        .map(|i| {
            Arc::new(
                ChangeEvent::new(format!("token-{i}"), OperationType::Insert, Namespace::new("bench_db", "orders"))
                    .with_cluster_time(1_700_000_000, i as u32)
                    .with_document_key(doc! { "_id": i as i64 })
                    .with_full_document(doc! { "_id": i as i64, "qty": i as i32, "status": "new" }),
            )
        })
        .collect()
}

fn dispatcher(sinks: usize, delay: Option<Duration>) -> FanoutDispatcher {
    let sinks = (0..sinks)
        .map(|i| {
            let sink = MockSink::new(format!("sink-{i}"));
            let sink = match delay {
                Some(d) => sink.with_delay(d),
                None => sink,
            };
            Arc::new(sink) as Arc<dyn SinkAdapter>
        })
        .collect();
    FanoutDispatcher::new(sinks)
}

fn bench_fanout_no_io(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("fanout_no_io");
    let batch = events(100);

    for sinks in [1, 2, 4, 8].iter() {
        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sinks), sinks, |b, &sinks| {
            let dispatcher = dispatcher(sinks, None);
            let cancel = CancellationToken::new();
            b.to_async(&runtime).iter(|| async {
                for event in &batch {
                    black_box(dispatcher.dispatch(event, &cancel).await.unwrap());
                }
            });
        });
    }

    group.finish();
}

fn bench_fanout_with_latency(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("fanout_with_latency");
    group.sample_size(10);
    let batch = events(10);

    for sinks in [1, 4].iter() {
        group.throughput(Throughput::Elements(batch.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(sinks), sinks, |b, &sinks| {
            let dispatcher = dispatcher(sinks, Some(Duration::from_millis(1)));
            let cancel = CancellationToken::new();
            b.to_async(&runtime).iter(|| async {
                for event in &batch {
                    black_box(dispatcher.dispatch(event, &cancel).await.unwrap());
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_fanout_no_io, bench_fanout_with_latency);
criterion_main!(benches);

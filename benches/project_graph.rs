//! Criterion benchmarks for project graph resolution and compilation
//!
//! Resolution and compilation run on every start and resume, so both should
//! stay cheap for the graph sizes users actually build.

use std::collections::BTreeMap;

use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::prelude::*;
use uuid::Uuid;

use canopy::compiler::ProjectCompiler;
use canopy::config::EngineConfig;
use canopy::graph;
use canopy::model::{
    Container, ContainerConnection, ContainerRole, ContainerStatus, EnvironmentStatus, Project,
    DEFAULT_CONNECTION_TYPE,
};
use canopy::routing::RoutingGenerator;

// =============================================================================
// Fixtures
// =============================================================================

fn project() -> Project {
    Project {
        id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        slug: "bench".to_string(),
        namespace: None,
        environment_status: EnvironmentStatus::Active,
        last_activity: Utc::now(),
        hibernated_at: None,
        archive_size_bytes: None,
    }
}

fn container(project_id: Uuid, index: usize) -> Container {
    let role = if index % 3 == 0 {
        ContainerRole::Service
    } else {
        ContainerRole::Application
    };
    Container {
        id: Uuid::new_v4(),
        project_id,
        base_id: None,
        name: format!("svc-{index}"),
        image: "node:20".to_string(),
        directory: format!("svc-{index}"),
        workload_name: None,
        port: Some(3000),
        internal_port: 3000,
        environment_vars: BTreeMap::from([("NODE_ENV".to_string(), "development".to_string())]),
        role,
        position_x: 0.0,
        position_y: 0.0,
        status: ContainerStatus::Stopped,
        last_started_at: None,
    }
}

fn connection(project_id: Uuid, source: &Container, target: &Container) -> ContainerConnection {
    ContainerConnection {
        id: Uuid::new_v4(),
        project_id,
        source_container_id: source.id,
        target_container_id: target.id,
        connection_type: DEFAULT_CONNECTION_TYPE.to_string(),
        label: None,
    }
}

/// Each container depends on the previous one
fn chain(size: usize) -> (Project, Vec<Container>, Vec<ContainerConnection>) {
    let p = project();
    let containers: Vec<Container> = (0..size).map(|i| container(p.id, i)).collect();
    let connections = containers
        .windows(2)
        .map(|w| connection(p.id, &w[0], &w[1]))
        .collect();
    (p, containers, connections)
}

/// Random DAG: edges only point from lower to higher index
fn random_dag(size: usize, edges: usize) -> (Project, Vec<Container>, Vec<ContainerConnection>) {
    let p = project();
    let containers: Vec<Container> = (0..size).map(|i| container(p.id, i)).collect();
    let mut rng = StdRng::seed_from_u64(42);
    let connections = (0..edges)
        .filter_map(|_| {
            let a = rng.gen_range(0..size);
            let b = rng.gen_range(0..size);
            (a < b).then(|| connection(p.id, &containers[a], &containers[b]))
        })
        .collect();
    (p, containers, connections)
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve");

    for size in [5, 20, 100] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("chain", size), &size, |b, &size| {
            let (_, containers, connections) = chain(size);
            b.iter(|| black_box(graph::resolve(&containers, &connections)));
        });
        group.bench_with_input(BenchmarkId::new("random_dag", size), &size, |b, &size| {
            let (_, containers, connections) = random_dag(size, size * 2);
            b.iter(|| black_box(graph::resolve(&containers, &connections)));
        });
        group.bench_with_input(BenchmarkId::new("cycle", size), &size, |b, &size| {
            let (p, containers, mut connections) = chain(size);
            connections.push(connection(p.id, &containers[size - 1], &containers[0]));
            b.iter(|| black_box(graph::resolve(&containers, &connections)));
        });
    }
    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let config = EngineConfig::default();

    for size in [5, 20, 100] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("random_dag", size), &size, |b, &size| {
            let (p, containers, connections) = random_dag(size, size * 2);
            let plan = graph::resolve(&containers, &connections);
            let compiler = ProjectCompiler::new(&config);
            b.iter(|| black_box(compiler.compile(&p, &containers, &plan)));
        });
    }
    group.finish();
}

fn bench_routing(c: &mut Criterion) {
    let mut group = c.benchmark_group("routing");
    let config = EngineConfig {
        region_count: 4,
        ..Default::default()
    };
    let generator = RoutingGenerator::new(&config);

    for projects in [10, 1_000] {
        let slugs: Vec<String> = (0..projects).map(|i| format!("project-{i}")).collect();
        group.throughput(Throughput::Elements(projects as u64));
        group.bench_with_input(BenchmarkId::new("render", projects), &slugs, |b, slugs| {
            b.iter(|| black_box(generator.render(slugs)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_resolve, bench_compile, bench_routing);
criterion_main!(benches);

//! Ticks/sec on a uniform-traffic workload (§8 scenario 4): a 4x4 mesh where
//! every tile sends a batch of packets to deterministically-scattered
//! destinations, tracked for throughput regressions.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use std::any::Any;
use tessera_sim::engine::Engine;
use tessera_sim::event::{Event, EventKind, Payload, RoutablePayload};
use tessera_sim::ids::{Coord, PortId, ProgramName, VcId};
use tessera_sim::mesh::{AttachKind, Mesh};
use tessera_sim::module::{CreditBuffer, Module};
use tessera_sim::router::LOCAL;

struct Sink {
    name: ProgramName,
    credit: CreditBuffer,
}

impl Module for Sink {
    fn name(&self) -> &ProgramName {
        &self.name
    }
    fn frequency_mhz(&self) -> u32 {
        1000
    }
    fn buffer_capacity(&self) -> u32 {
        self.credit.capacity()
    }
    fn buffer_occupancy(&self) -> u32 {
        self.credit.occupancy()
    }
    fn reserve_credit(&mut self) -> bool {
        self.credit.reserve()
    }
    fn release_credit(&mut self) {
        self.credit.release()
    }
    fn on_event(&mut self, _engine: &mut Engine, _event: Event) {}
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Builds a `side x side` mesh, attaches a `Sink` to every tile, fires
/// `sends_per_tile` packets from each tile to deterministically-scattered
/// destinations, and drains the queue.
fn run_uniform_traffic(side: u16, sends_per_tile: u32) -> u64 {
    let num_vcs: u8 = 2;
    let mut engine = Engine::new();
    let mut mesh = Mesh::create(&mut engine, side, side, 1000, num_vcs, 16).expect("mesh construction");

    let n = (side as u32) * (side as u32);
    let mut sink_ids = Vec::with_capacity(n as usize);
    let mut coords = Vec::with_capacity(n as usize);
    for y in 0..side {
        for x in 0..side {
            let coord = Coord::new(x, y);
            let name: ProgramName = format!("sink_{x}_{y}").into();
            let id = mesh
                .attach(
                    &mut engine,
                    coord,
                    AttachKind::Npu,
                    Box::new(Sink {
                        name,
                        credit: CreditBuffer::new(64),
                    }),
                )
                .expect("attach sink");
            sink_ids.push(id);
            coords.push(coord);
        }
    }

    for (s, &src_coord) in coords.iter().enumerate() {
        let router_id = mesh.router_id(src_coord).unwrap();
        let sink_id = sink_ids[s];
        for k in 0..sends_per_tile {
            let mut dst_idx = (s as u32 * 7 + k * 3 + 1) % n;
            if dst_idx == s as u32 {
                dst_idx = (dst_idx + 1) % n;
            }
            let dst_coord = coords[dst_idx as usize];
            let payload = RoutablePayload {
                dst_coords: Some(dst_coord),
                input_port: PortId(LOCAL),
                input_vc: VcId((k % num_vcs as u32) as u8),
                data_size: 8,
                ..Default::default()
            };
            // Spread arrivals across cycles so a tile's own burst doesn't
            // outrun its router's per-(port, vc) buffer before draining
            // starts.
            let event = Event::new(router_id, EventKind::Packet, Payload::Routable(payload)).with_cycle((k * 2) as u64);
            engine.send(sink_id, 1000, event);
        }
    }

    let report = engine.run_until_idle(Some(1_000_000));
    assert!(report.queue_drained, "benchmark mesh failed to drain within the tick bound");
    report.ticks
}

fn bench_mesh_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("mesh_uniform_traffic");
    group.sample_size(20);

    for &side in &[2u16, 4] {
        group.bench_with_input(BenchmarkId::new("side", side), &side, |b, &side| {
            b.iter(|| run_uniform_traffic(side, 8));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_mesh_throughput);
criterion_main!(benches);

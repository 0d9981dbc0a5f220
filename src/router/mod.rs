//! The virtual-channel router: RC/VA/SA/ST over a bounded per-(port, vc)
//! buffer, credit-based flow control toward neighbor routers, and a plain
//! credited `Engine::send` toward the one attached LOCAL module (§4.3).
//!
//! A flit advances at most one stage per tick, processed in reverse pipeline
//! order (SA+ST, then VA, then RC) so nothing skips a stage within a single
//! cycle — the same shape as the NES PPU's fetch/shift pipeline in the
//! teacher repo, one stage transition per tick, no stage ever double-fires.
//!
//! Two credit systems meet at this boundary, and keeping them separate is
//! the whole trick:
//! - router-to-router hops use the per-(out_port, vc) `credit_count` table
//!   VA consumes and ST's `RECV_CRED` replenishes;
//! - router-to-LOCAL-module hops use the generic `Engine::send` credit the
//!   attached module already exposes through `Module::reserve_credit`, so
//!   the router never needs to track a separate credit pool for its own
//!   attached tile. `RECV_CRED` is therefore only ever emitted toward
//!   another router — an upstream LOCAL module has no symmetric credit pool
//!   to replenish, matching the no-op discard already specified for a
//!   downstream that isn't VC-tracked (§4.3 failure clause).

mod arbiter;

use crate::engine::Engine;
use crate::event::{ControlPayload, Event, EventKind, Payload};
use crate::ids::{Coord, ModuleId, PortId, ProgramName, VcId};
use crate::module::Module;
use arbiter::lrg_round_robin;
use std::any::Any;
use std::collections::VecDeque;

pub const LOCAL: u8 = 0;
pub const EAST: u8 = 1;
pub const WEST: u8 = 2;
pub const NORTH: u8 = 3;
pub const SOUTH: u8 = 4;
pub const NUM_PORTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Rc,
    Va,
    SaSt,
}

#[derive(Debug, Clone)]
struct Flit {
    event: Event,
    in_port: PortId,
    in_vc: VcId,
    out_port: Option<PortId>,
    out_vc: Option<VcId>,
    stage: Stage,
}

pub struct Router {
    self_id: Option<ModuleId>,
    name: ProgramName,
    coord: Coord,
    freq_mhz: u32,
    num_vcs: u8,
    buffer_capacity: u32,
    /// `[port][vc]` neighbor wired to that port — `None` means unattached.
    neighbors: [Option<(ModuleId, PortId)>; NUM_PORTS],
    /// `[port][vc]` input buffers; only the front of each is RC/VA/SA-active.
    input_buffers: Vec<Vec<VecDeque<Flit>>>,
    /// `[out_port][vc]` downstream free-slot count; meaningless for LOCAL.
    credit_counts: Vec<Vec<u32>>,
    /// `[out_port][vc]` which (in_port, in_vc) currently owns this output VC.
    vc_allocated: Vec<Vec<Option<(PortId, VcId)>>>,
    va_ptr: Vec<usize>,
    sa_ptr: Vec<usize>,
    crossbar_busy: Vec<bool>,
    tick_scheduled: bool,
}

impl Router {
    pub fn new(name: impl Into<ProgramName>, coord: Coord, freq_mhz: u32, num_vcs: u8, buffer_capacity: u32) -> Self {
        let nv = num_vcs as usize;
        Router {
            self_id: None,
            name: name.into(),
            coord,
            freq_mhz,
            num_vcs,
            buffer_capacity,
            neighbors: [None; NUM_PORTS],
            input_buffers: (0..NUM_PORTS).map(|_| (0..nv).map(|_| VecDeque::new()).collect()).collect(),
            credit_counts: (0..NUM_PORTS).map(|_| vec![buffer_capacity; nv]).collect(),
            vc_allocated: (0..NUM_PORTS).map(|_| vec![None; nv]).collect(),
            va_ptr: vec![0; NUM_PORTS],
            sa_ptr: vec![0; NUM_PORTS],
            crossbar_busy: vec![false; NUM_PORTS],
            tick_scheduled: false,
        }
    }

    pub fn set_id(&mut self, id: ModuleId) {
        self.self_id = Some(id);
    }

    pub fn coord(&self) -> Coord {
        self.coord
    }

    pub fn set_neighbor(&mut self, port: u8, module: ModuleId, facing_port: PortId) {
        self.neighbors[port as usize] = Some((module, facing_port));
    }

    pub fn neighbor_at(&self, port: u8) -> Option<(ModuleId, PortId)> {
        self.neighbors[port as usize]
    }

    /// Downstream free-slot count for `(out_port, vc)` — exposed for the
    /// credit-conservation property tests (§8).
    pub fn credit_count(&self, out_port: u8, vc: VcId) -> u32 {
        self.credit_counts[out_port as usize][vc.0 as usize]
    }

    pub fn buffer_capacity_per_vc(&self) -> u32 {
        self.buffer_capacity
    }

    pub fn is_idle(&self) -> bool {
        !self.has_work() && self.crossbar_busy.iter().all(|b| !b)
    }

    fn has_work(&self) -> bool {
        self.input_buffers.iter().any(|port| port.iter().any(|q| !q.is_empty()))
    }

    fn schedule_tick(&mut self, engine: &mut Engine) {
        if self.tick_scheduled {
            return;
        }
        self.tick_scheduled = true;
        let id = self.self_id.expect("router dispatched before registration");
        engine.schedule_after(
            self.freq_mhz,
            1,
            Event::new(id, EventKind::PipelineTick, Payload::Control(ControlPayload::PipelineTick)),
        );
    }

    fn route_dimension_order(&self, dst: Coord) -> PortId {
        if dst == self.coord {
            PortId(LOCAL)
        } else if dst.x != self.coord.x {
            PortId(if dst.x > self.coord.x { EAST } else { WEST })
        } else {
            PortId(if dst.y > self.coord.y { SOUTH } else { NORTH })
        }
    }

    fn admit(&mut self, engine: &mut Engine, event: Event) {
        let (in_port, in_vc) = {
            let rp = event.routable();
            (rp.input_port, rp.input_vc)
        };
        let q = &mut self.input_buffers[in_port.0 as usize][in_vc.0 as usize];
        debug_assert!(
            (q.len() as u32) < self.buffer_capacity,
            "router {} input buffer overflow on port {:?} vc {:?}",
            self.name,
            in_port,
            in_vc
        );
        q.push_back(Flit {
            event,
            in_port,
            in_vc,
            out_port: None,
            out_vc: None,
            stage: Stage::Rc,
        });
        self.schedule_tick(engine);
    }

    fn handle_recv_cred(&mut self, event: Event) {
        let (port, vc) = match event.payload {
            Payload::Control(ControlPayload::RecvCred { port, vc }) => (port, vc),
            _ => panic!("RECV_CRED event missing its port/vc payload"),
        };
        if port.0 as usize == LOCAL as usize || port.0 as usize >= NUM_PORTS {
            return; // no symmetric credit pool upstream of LOCAL; no-op per §4.3.
        }
        let vc_idx = vc.0 as usize;
        if let Some(slot) = self.credit_counts[port.0 as usize].get_mut(vc_idx) {
            *slot = (*slot + 1).min(self.buffer_capacity);
        }
    }

    fn run_rc(&mut self) {
        for port in 0..NUM_PORTS {
            for vc in 0..self.num_vcs as usize {
                if let Some(flit) = self.input_buffers[port][vc].front_mut() {
                    if flit.stage == Stage::Rc {
                        let dst = flit.event.dst_coords();
                        flit.out_port = Some(self.route_dimension_order(dst));
                        flit.stage = Stage::Va;
                    }
                }
            }
        }
    }

    fn run_va(&mut self) {
        for port in 0..NUM_PORTS {
            for vc in 0..self.num_vcs as usize {
                let ready = self.input_buffers[port][vc]
                    .front()
                    .is_some_and(|f| f.stage == Stage::Va);
                if !ready {
                    continue;
                }
                let out_port = self.input_buffers[port][vc].front().unwrap().out_port.unwrap();
                let op = out_port.0 as usize;
                if op == LOCAL as usize {
                    let flit = self.input_buffers[port][vc].front_mut().unwrap();
                    flit.out_vc = Some(VcId(0));
                    flit.stage = Stage::SaSt;
                    continue;
                }
                let nv = self.num_vcs as usize;
                let eligible: Vec<usize> = (0..nv)
                    .filter(|&v| self.credit_counts[op][v] > 0 && self.vc_allocated[op][v].is_none())
                    .collect();
                if let Some(chosen) = lrg_round_robin(&mut self.va_ptr[op], nv, &eligible) {
                    self.credit_counts[op][chosen] -= 1;
                    self.vc_allocated[op][chosen] = Some((PortId(port as u8), VcId(vc as u8)));
                    let flit = self.input_buffers[port][vc].front_mut().unwrap();
                    flit.out_vc = Some(VcId(chosen as u8));
                    flit.stage = Stage::SaSt;
                }
            }
        }
    }

    fn run_sa_st(&mut self, engine: &mut Engine) {
        for out_port in 0..NUM_PORTS {
            let candidates: Vec<usize> = (0..NUM_PORTS)
                .filter(|&in_port| {
                    (0..self.num_vcs as usize).any(|vc| {
                        self.input_buffers[in_port][vc]
                            .front()
                            .is_some_and(|f| f.stage == Stage::SaSt && f.out_port == Some(PortId(out_port as u8)))
                    })
                })
                .collect();
            let Some(winner_port) = lrg_round_robin(&mut self.sa_ptr[out_port], NUM_PORTS, &candidates) else {
                continue;
            };
            let winner_vc = (0..self.num_vcs as usize)
                .find(|&vc| {
                    self.input_buffers[winner_port][vc]
                        .front()
                        .is_some_and(|f| f.stage == Stage::SaSt && f.out_port == Some(PortId(out_port as u8)))
                })
                .expect("SA candidate vanished between scan and grant");

            self.crossbar_busy[out_port] = true;
            let flit = self.input_buffers[winner_port][winner_vc].pop_front().unwrap();
            self.traverse(engine, flit, PortId(out_port as u8));
            self.crossbar_busy[out_port] = false;
        }
    }

    fn traverse(&mut self, engine: &mut Engine, flit: Flit, out_port: PortId) {
        let out_vc = flit.out_vc.expect("SA-stage flit missing its allocated out_vc");
        let (neighbor_id, neighbor_port) = self.neighbors[out_port.0 as usize]
            .unwrap_or_else(|| panic!("router {} has no neighbor wired on port {:?}", self.name, out_port));

        let mut next_event = flit.event.clone();
        next_event.dst = neighbor_id;
        if let Some(rp) = next_event.payload.as_routable_mut() {
            rp.input_port = neighbor_port;
            rp.input_vc = out_vc;
            rp.prev_out_port = Some(out_port);
            rp.prev_out_vc = Some(out_vc);
            rp.last_hop = self.self_id;
        }

        if out_port.0 == LOCAL {
            engine.send(self.self_id.unwrap(), self.freq_mhz, next_event.with_cycle(1));
        } else {
            engine.schedule_after(self.freq_mhz, 1, next_event);
            self.vc_allocated[out_port.0 as usize][out_vc.0 as usize] = None;
        }

        if flit.in_port.0 != LOCAL {
            if let Some((upstream_id, upstream_port)) = self.neighbors[flit.in_port.0 as usize] {
                let recv_cred = Event::new(
                    upstream_id,
                    EventKind::RecvCred,
                    Payload::Control(ControlPayload::RecvCred {
                        port: upstream_port,
                        vc: flit.in_vc,
                    }),
                );
                engine.schedule_after(self.freq_mhz, 1, recv_cred);
            }
        }
    }

    fn tick(&mut self, engine: &mut Engine) {
        self.tick_scheduled = false;
        self.run_sa_st(engine);
        self.run_va();
        self.run_rc();
        if self.has_work() {
            self.schedule_tick(engine);
        }
    }
}

impl Module for Router {
    fn name(&self) -> &ProgramName {
        &self.name
    }

    fn frequency_mhz(&self) -> u32 {
        self.freq_mhz
    }

    fn buffer_capacity(&self) -> u32 {
        self.buffer_capacity
    }

    fn buffer_occupancy(&self) -> u32 {
        self.input_buffers
            .iter()
            .flat_map(|port| port.iter())
            .map(|q| q.len() as u32)
            .sum()
    }

    fn reserve_credit(&mut self) -> bool {
        true // real admission control is the per-(port, vc) buffer, not this.
    }

    fn release_credit(&mut self) {
        // Never called: `releases_credit_itself` is true.
    }

    fn releases_credit_itself(&self) -> bool {
        true
    }

    fn on_event(&mut self, engine: &mut Engine, event: Event) {
        match event.kind {
            EventKind::RecvCred => self.handle_recv_cred(event),
            EventKind::PipelineTick => self.tick(engine),
            kind if kind.is_routable() => self.admit(engine, event),
            other => panic!("router {} received unroutable event {other}", self.name),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

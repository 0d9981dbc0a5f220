//! Simple DRAM mode (§4.5): `num_channels` independent FIFO pipelines, each
//! request timed by a flat `opcode_cycles`. Channel selection is
//! program-scoped round-robin, falling back to a global round-robin when the
//! request carries no `program` (e.g. a bare test probe).

use crate::engine::Engine;
use crate::event::{ControlPayload, Event, EventKind, Payload, RoutablePayload};
use crate::ids::{ChannelId, Coord, ModuleId, PortId, ProgramName, StreamId, VcId};
use crate::module::{CreditBuffer, LatencyPipeline, Module};
use std::any::Any;
use std::collections::HashMap;

struct PendingReq {
    read: bool,
    program: Option<ProgramName>,
    stream_id: StreamId,
    data_size: u32,
    requester_coords: Coord,
}

pub struct Dram {
    name: ProgramName,
    self_id: Option<ModuleId>,
    router_id: Option<ModuleId>,
    freq_mhz: u32,
    credit: CreditBuffer,
    channels: Vec<LatencyPipeline<PendingReq>>,
    program_rr: HashMap<ProgramName, u32>,
    global_rr: u32,
    tick_scheduled: bool,
}

impl Dram {
    pub fn new(name: impl Into<ProgramName>, freq_mhz: u32, buffer_capacity: u32, num_channels: u32) -> Self {
        let num_channels = num_channels.max(1);
        Dram {
            name: name.into(),
            self_id: None,
            router_id: None,
            freq_mhz,
            credit: CreditBuffer::new(buffer_capacity),
            channels: (0..num_channels).map(|_| LatencyPipeline::new(buffer_capacity as usize)).collect(),
            program_rr: HashMap::new(),
            global_rr: 0,
            tick_scheduled: false,
        }
    }

    pub fn set_id(&mut self, id: ModuleId) {
        self.self_id = Some(id);
    }

    pub fn attach_to_router(&mut self, router_id: ModuleId) {
        self.router_id = Some(router_id);
    }

    fn pick_channel(&mut self, program: Option<&ProgramName>) -> usize {
        let n = self.channels.len() as u32;
        let idx = match program {
            Some(p) => {
                let ctr = self.program_rr.entry(p.clone()).or_insert(0);
                let chosen = *ctr % n;
                *ctr = (*ctr + 1) % n;
                chosen
            }
            None => {
                let chosen = self.global_rr % n;
                self.global_rr = (self.global_rr + 1) % n;
                chosen
            }
        };
        idx as usize
    }

    fn schedule_tick(&mut self, engine: &mut Engine) {
        if self.tick_scheduled {
            return;
        }
        self.tick_scheduled = true;
        let id = self.self_id.expect("DRAM dispatched before registration");
        engine.schedule_after(
            self.freq_mhz,
            1,
            Event::new(id, EventKind::PipelineTick, Payload::Control(ControlPayload::PipelineTick)),
        );
    }

    fn admit(&mut self, engine: &mut Engine, event: Event, read: bool) {
        let rp = event.routable();
        let program = rp.program.clone();
        let stream_id = rp.stream_id.expect("DMA request missing stream_id");
        let data_size = rp.data_size;
        let requester_coords = rp.requester_coords.expect("DMA request missing requester_coords");
        let remaining = rp.opcode_cycles.max(1);

        let idx = self.pick_channel(program.as_ref());
        let req = PendingReq {
            read,
            program,
            stream_id,
            data_size,
            requester_coords,
        };
        let pushed = self.channels[idx].push(req, remaining);
        debug_assert!(pushed, "DRAM {} channel {} overflowed", self.name, idx);
        self.schedule_tick(engine);
    }

    fn emit_reply(&self, engine: &mut Engine, req: PendingReq, channel_idx: usize) {
        let self_id = self.self_id.expect("DRAM dispatched before registration");
        let router_id = self.router_id.expect("DRAM not attached to a router");
        let kind = if req.read { EventKind::DmaReadReply } else { EventKind::WriteReply };
        let payload = RoutablePayload {
            dst_coords: Some(req.requester_coords),
            input_port: PortId(crate::router::LOCAL),
            input_vc: VcId(0),
            src_name: Some(self.name.clone()),
            program: req.program,
            stream_id: Some(req.stream_id),
            data_size: req.data_size,
            channel_id: Some(ChannelId {
                stack: 0,
                channel: channel_idx as u8,
            }),
            ..Default::default()
        };
        let event = Event::new(router_id, kind, Payload::Routable(payload)).with_src(self_id);
        engine.send(self_id, self.freq_mhz, event);
    }

    fn tick(&mut self, engine: &mut Engine) {
        self.tick_scheduled = false;
        for idx in 0..self.channels.len() {
            if let Some(req) = self.channels[idx].tick() {
                self.emit_reply(engine, req, idx);
            }
        }
        if self.channels.iter().any(|c| !c.is_empty()) {
            self.schedule_tick(engine);
        }
    }
}

impl Module for Dram {
    fn name(&self) -> &ProgramName {
        &self.name
    }

    fn frequency_mhz(&self) -> u32 {
        self.freq_mhz
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

    fn on_event(&mut self, engine: &mut Engine, event: Event) {
        match event.kind {
            EventKind::DmaRead => self.admit(engine, event, true),
            EventKind::DmaWrite => self.admit(engine, event, false),
            EventKind::PipelineTick => self.tick(engine),
            other => panic!("DRAM {} received unexpected event kind {other}", self.name),
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_scoped_round_robin_cycles_channels() {
        let mut dram = Dram::new("dram0", 1000, 8, 2);
        let prog: ProgramName = "p".into();
        assert_eq!(dram.pick_channel(Some(&prog)), 0);
        assert_eq!(dram.pick_channel(Some(&prog)), 1);
        assert_eq!(dram.pick_channel(Some(&prog)), 0);
    }

    #[test]
    fn global_round_robin_used_when_program_absent() {
        let mut dram = Dram::new("dram0", 1000, 8, 3);
        assert_eq!(dram.pick_channel(None), 0);
        assert_eq!(dram.pick_channel(None), 1);
        assert_eq!(dram.pick_channel(None), 2);
        assert_eq!(dram.pick_channel(None), 0);
    }
}

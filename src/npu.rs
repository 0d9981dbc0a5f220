//! NPU compute tile (§4.4): issues DMA_IN/CMD/DMA_OUT instructions fanned
//! out by the CP, tracks byte-count completion (replies may arrive out of
//! order across memory channels, so only the running total matters), and
//! runs a single in-flight compute command at a time through a
//! self-rescheduling countdown.

use crate::engine::Engine;
use crate::event::{ControlPayload, Event, EventKind, Payload, RoutablePayload};
use crate::ids::{Coord, ModuleId, PortId, ProgramName, StreamId, VcId};
use crate::module::{CreditBuffer, Module};
use std::any::Any;
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
struct DmaTracker {
    expected: u32,
    received: u32,
    requester: ModuleId,
    requester_coords: Coord,
}

#[derive(Debug, Clone)]
struct ComputeCmd {
    program: ProgramName,
    stream_id: StreamId,
    requester: ModuleId,
    requester_coords: Coord,
    remaining: u32,
}

pub struct Npu {
    name: ProgramName,
    self_id: Option<ModuleId>,
    router_id: Option<ModuleId>,
    own_coords: Option<Coord>,
    freq_mhz: u32,
    txn_bytes: u32,
    credit: CreditBuffer,
    expected_reads: HashMap<(ProgramName, StreamId), DmaTracker>,
    expected_writes: HashMap<(ProgramName, StreamId), DmaTracker>,
    compute_queue: VecDeque<ComputeCmd>,
    current_cmd: Option<ComputeCmd>,
    tick_scheduled: bool,
}

impl Npu {
    pub fn new(name: impl Into<ProgramName>, freq_mhz: u32, buffer_capacity: u32, txn_bytes: u32) -> Self {
        Npu {
            name: name.into(),
            self_id: None,
            router_id: None,
            own_coords: None,
            freq_mhz,
            txn_bytes: txn_bytes.max(1),
            credit: CreditBuffer::new(buffer_capacity),
            expected_reads: HashMap::new(),
            expected_writes: HashMap::new(),
            compute_queue: VecDeque::new(),
            current_cmd: None,
            tick_scheduled: false,
        }
    }

    pub fn set_id(&mut self, id: ModuleId) {
        self.self_id = Some(id);
    }

    pub fn attach_to_router(&mut self, router_id: ModuleId) {
        self.router_id = Some(router_id);
    }

    pub fn set_coords(&mut self, coords: Coord) {
        self.own_coords = Some(coords);
    }

    fn schedule_tick(&mut self, engine: &mut Engine) {
        if self.tick_scheduled {
            return;
        }
        self.tick_scheduled = true;
        let id = self.self_id.expect("NPU dispatched before registration");
        engine.schedule_after(
            self.freq_mhz,
            1,
            Event::new(id, EventKind::PipelineTick, Payload::Control(ControlPayload::PipelineTick)),
        );
    }

    fn send_into_mesh(&self, engine: &mut Engine, kind: EventKind, mut payload: RoutablePayload, dst_coords: Coord) {
        let self_id = self.self_id.expect("NPU dispatched before registration");
        let router_id = self.router_id.expect("NPU not attached to a router");
        payload.dst_coords = Some(dst_coords);
        payload.input_port = PortId(crate::router::LOCAL);
        payload.input_vc = VcId(0);
        payload.src_name = Some(self.name.clone());
        let event = Event::new(router_id, kind, Payload::Routable(payload)).with_src(self_id);
        engine.send(self_id, self.freq_mhz, event);
    }

    fn emit_done(&self, engine: &mut Engine, kind: EventKind, program: ProgramName, stream_id: StreamId, requester_coords: Coord) {
        let payload = RoutablePayload {
            program: Some(program),
            stream_id: Some(stream_id),
            npu_name: Some(self.name.clone()),
            ..Default::default()
        };
        self.send_into_mesh(engine, kind, payload, requester_coords);
    }

    fn split_dma(
        &mut self,
        engine: &mut Engine,
        event: &Event,
        read: bool,
    ) {
        let rp = event.routable().clone();
        let program = rp.program.clone().expect("DMA instruction missing program");
        let stream_id = rp.stream_id.expect("DMA instruction missing stream_id");
        let requester = event.src.expect("DMA instruction missing sender");
        let requester_coords = rp.requester_coords.expect("DMA instruction missing requester_coords");
        let forward = rp.forward_coords.expect("DMA instruction missing forward_coords");
        let total = rp.data_size;

        let tracker = DmaTracker {
            expected: total,
            received: 0,
            requester,
            requester_coords,
        };
        let key = (program.clone(), stream_id);
        if read {
            self.expected_reads.insert(key, tracker);
        } else {
            self.expected_writes.insert(key, tracker);
        }

        let mut remaining = total;
        let mut eaddr = rp.eaddr;
        let kind = if read { EventKind::DmaRead } else { EventKind::DmaWrite };
        while remaining > 0 {
            let chunk = remaining.min(self.txn_bytes);
            let payload = RoutablePayload {
                stream_id: Some(stream_id),
                program: Some(program.clone()),
                opcode_cycles: rp.opcode_cycles,
                eaddr,
                data_size: chunk,
                need_reply: true,
                requester_coords: Some(self.own_coords.expect("NPU dispatched before its coords were set")),
                ..Default::default()
            };
            self.send_into_mesh(engine, kind, payload, forward);
            eaddr += chunk as u64;
            remaining -= chunk;
        }
    }

    fn handle_reply(&mut self, event: Event, read: bool) -> Option<(ProgramName, StreamId, Coord)> {
        let rp = event.routable();
        let program = rp.program.clone().expect("reply missing program");
        let stream_id = rp.stream_id.expect("reply missing stream_id");
        let key = (program.clone(), stream_id);
        let table = if read { &mut self.expected_reads } else { &mut self.expected_writes };
        let tracker = table
            .get_mut(&key)
            .unwrap_or_else(|| panic!("reply for untracked (program, stream_id) {:?}", key));
        tracker.received += rp.data_size;
        debug_assert!(
            tracker.received <= tracker.expected,
            "NPU {} received more bytes than requested for {:?}",
            self.name,
            key
        );
        if tracker.received == tracker.expected {
            let tracker = table.remove(&key).unwrap();
            Some((program, stream_id, tracker.requester_coords))
        } else {
            None
        }
    }

    fn start_next_cmd(&mut self, engine: &mut Engine) {
        if self.current_cmd.is_none() {
            self.current_cmd = self.compute_queue.pop_front();
            if self.current_cmd.is_some() {
                self.schedule_tick(engine);
            }
        }
    }

    fn tick(&mut self, engine: &mut Engine) {
        self.tick_scheduled = false;
        if let Some(cmd) = self.current_cmd.as_mut() {
            cmd.remaining -= 1;
            if cmd.remaining == 0 {
                let cmd = self.current_cmd.take().unwrap();
                self.emit_done(engine, EventKind::NpuCmdDone, cmd.program, cmd.stream_id, cmd.requester_coords);
                self.start_next_cmd(engine);
                return;
            }
        }
        if self.current_cmd.is_some() {
            self.schedule_tick(engine);
        }
    }

    fn handle_cmd(&mut self, engine: &mut Engine, event: Event) {
        let rp = event.routable();
        let program = rp.program.clone().expect("NPU_CMD missing program");
        let stream_id = rp.stream_id.expect("NPU_CMD missing stream_id");
        let requester = event.src.expect("NPU_CMD missing sender");
        let requester_coords = rp.requester_coords.expect("NPU_CMD missing requester_coords");
        let remaining = rp.opcode_cycles.max(1);
        self.compute_queue.push_back(ComputeCmd {
            program,
            stream_id,
            requester,
            requester_coords,
            remaining,
        });
        self.start_next_cmd(engine);
    }
}

impl Module for Npu {
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
            EventKind::NpuDmaIn => self.split_dma(engine, &event, true),
            EventKind::NpuDmaOut => self.split_dma(engine, &event, false),
            EventKind::NpuCmd => self.handle_cmd(engine, event),
            EventKind::DmaReadReply => {
                if let Some((program, stream_id, coords)) = self.handle_reply(event, true) {
                    self.emit_done(engine, EventKind::NpuDmaInDone, program, stream_id, coords);
                }
            }
            EventKind::WriteReply => {
                if let Some((program, stream_id, coords)) = self.handle_reply(event, false) {
                    self.emit_done(engine, EventKind::NpuDmaOutDone, program, stream_id, coords);
                }
            }
            EventKind::PipelineTick => self.tick(engine),
            other => panic!("NPU {} received unexpected event kind {other}", self.name),
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

    fn dma_in_event(npu_id: ModuleId, cp_id: ModuleId, data_size: u32, txn_opcode: u32) -> Event {
        Event::new(
            npu_id,
            EventKind::NpuDmaIn,
            Payload::Routable(RoutablePayload {
                program: Some("prog".into()),
                stream_id: Some(StreamId(0)),
                data_size,
                opcode_cycles: txn_opcode,
                eaddr: 0,
                requester_coords: Some(Coord::new(2, 0)),
                forward_coords: Some(Coord::new(1, 0)),
                ..Default::default()
            }),
        )
        .with_src(cp_id)
    }

    #[test]
    fn dma_in_splits_into_txn_bytes_chunks() {
        let mut engine = Engine::new();
        let router_id = engine
            .register_module(Box::new(Sink {
                name: "router_stub".into(),
                credit: CreditBuffer::new(64),
            }))
            .unwrap();
        let mut npu = Npu::new("npu0", 1000, 4, 8);
        let npu_id = ModuleId(5);
        let cp_id = ModuleId(99);
        npu.set_id(npu_id);
        npu.attach_to_router(router_id);
        let event = dma_in_event(npu_id, cp_id, 20, 2);
        npu.split_dma(&mut engine, &event, true);
        assert_eq!(engine.queue_len(), 3); // 8 + 8 + 4 bytes
    }

    #[test]
    fn dma_in_done_only_after_full_byte_count() {
        let mut engine = Engine::new();
        let router_id = engine
            .register_module(Box::new(Sink {
                name: "router_stub".into(),
                credit: CreditBuffer::new(64),
            }))
            .unwrap();
        let mut npu = Npu::new("npu0", 1000, 4, 8);
        let npu_id = ModuleId(5);
        let cp_id = ModuleId(99);
        npu.set_id(npu_id);
        npu.attach_to_router(router_id);
        let event = dma_in_event(npu_id, cp_id, 16, 2);
        npu.split_dma(&mut engine, &event, true);

        let partial_reply = Event::new(
            npu_id,
            EventKind::DmaReadReply,
            Payload::Routable(RoutablePayload {
                program: Some("prog".into()),
                stream_id: Some(StreamId(0)),
                data_size: 8,
                ..Default::default()
            }),
        );
        assert!(npu.handle_reply(partial_reply, true).is_none());

        let final_reply = Event::new(
            npu_id,
            EventKind::DmaReadReply,
            Payload::Routable(RoutablePayload {
                program: Some("prog".into()),
                stream_id: Some(StreamId(0)),
                data_size: 8,
                ..Default::default()
            }),
        );
        let done = npu.handle_reply(final_reply, true);
        assert!(done.is_some());
    }
}

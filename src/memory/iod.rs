//! Detailed IOD mode (§4.5, §6 address layout): HBM stack -> channel ->
//! bank-group -> bank, open-row timing, and row-boundary chunk splitting.
//! Each `(stack, channel)` pair is an independent pipeline, exactly like a
//! DRAM channel, but the per-request latency is computed from bank state
//! instead of a flat `opcode_cycles`.

use crate::engine::Engine;
use crate::event::{ControlPayload, Event, EventKind, Payload, RoutablePayload};
use crate::ids::{ChannelId, Coord, ModuleId, PortId, ProgramName, StreamId, VcId};
use crate::module::{CreditBuffer, LatencyPipeline, Module};
use std::any::Any;
use std::collections::HashMap;

const ROW_SIZE_BYTES: u64 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedAddr {
    pub stack: u8,
    pub channel: u8,
    pub bank_group: u8,
    pub bank: u8,
    pub row: u16,
    pub column: u8,
    pub byte_offset: u8,
}

/// Bit layout from §6: [35]=stack(1) [34:31]=channel(4) [30:29]=bank_group(2)
/// [28:27]=bank(2) [26:11]=row(16) [10:3]=column(8) [2:0]=byte_offset(3).
pub fn decode_eaddr(eaddr: u64) -> DecodedAddr {
    DecodedAddr {
        stack: ((eaddr >> 35) & 0x1) as u8,
        channel: ((eaddr >> 31) & 0xF) as u8,
        bank_group: ((eaddr >> 29) & 0x3) as u8,
        bank: ((eaddr >> 27) & 0x3) as u8,
        row: ((eaddr >> 11) & 0xFFFF) as u16,
        column: ((eaddr >> 3) & 0xFF) as u8,
        byte_offset: (eaddr & 0x7) as u8,
    }
}

struct PendingReq {
    read: bool,
    program: Option<ProgramName>,
    stream_id: StreamId,
    data_size: u32,
    requester_coords: Coord,
    stack: u8,
    channel: u8,
}

pub struct IodTiming {
    pub t_rp: u32,
    pub t_rcd: u32,
    pub t_cl: u32,
}

pub struct Iod {
    name: ProgramName,
    self_id: Option<ModuleId>,
    router_id: Option<ModuleId>,
    freq_mhz: u32,
    credit: CreditBuffer,
    timing: IodTiming,
    /// `[stack][channel]`.
    pipelines: Vec<Vec<LatencyPipeline<PendingReq>>>,
    /// `(stack, channel, bank_group, bank) -> active row`.
    active_row: HashMap<(u8, u8, u8, u8), u16>,
    tick_scheduled: bool,
}

impl Iod {
    pub fn new(
        name: impl Into<ProgramName>,
        freq_mhz: u32,
        buffer_capacity: u32,
        num_stacks: u8,
        channels_per_stack: u8,
        timing: IodTiming,
    ) -> Self {
        let pipelines = (0..num_stacks.max(1))
            .map(|_| {
                (0..channels_per_stack.max(1))
                    .map(|_| LatencyPipeline::new(buffer_capacity as usize))
                    .collect()
            })
            .collect();
        Iod {
            name: name.into(),
            self_id: None,
            router_id: None,
            freq_mhz,
            credit: CreditBuffer::new(buffer_capacity),
            timing,
            pipelines,
            active_row: HashMap::new(),
            tick_scheduled: false,
        }
    }

    pub fn set_id(&mut self, id: ModuleId) {
        self.self_id = Some(id);
    }

    pub fn attach_to_router(&mut self, router_id: ModuleId) {
        self.router_id = Some(router_id);
    }

    fn compute_latency(&mut self, d: DecodedAddr, chunk_bytes: u32) -> u32 {
        let key = (d.stack, d.channel, d.bank_group, d.bank);
        let bursts = chunk_bytes.div_ceil(8);
        let same_row = self.active_row.get(&key) == Some(&d.row);
        let latency = if same_row {
            self.timing.t_cl + bursts
        } else {
            self.timing.t_rp + self.timing.t_rcd + self.timing.t_cl + bursts
        };
        self.active_row.insert(key, d.row);
        latency.max(1)
    }

    fn schedule_tick(&mut self, engine: &mut Engine) {
        if self.tick_scheduled {
            return;
        }
        self.tick_scheduled = true;
        let id = self.self_id.expect("IOD dispatched before registration");
        engine.schedule_after(
            self.freq_mhz,
            1,
            Event::new(id, EventKind::PipelineTick, Payload::Control(ControlPayload::PipelineTick)),
        );
    }

    fn admit(&mut self, engine: &mut Engine, event: Event, read: bool) {
        let rp = event.routable().clone();
        let program = rp.program.clone();
        let stream_id = rp.stream_id.expect("IOD request missing stream_id");
        let requester_coords = rp.requester_coords.expect("IOD request missing requester_coords");

        let mut remaining = rp.data_size;
        let mut eaddr = rp.eaddr;
        while remaining > 0 {
            let row_offset = eaddr % ROW_SIZE_BYTES;
            let chunk = remaining.min((ROW_SIZE_BYTES - row_offset) as u32);
            let decoded = decode_eaddr(eaddr);
            let latency = self.compute_latency(decoded, chunk);

            let req = PendingReq {
                read,
                program: program.clone(),
                stream_id,
                data_size: chunk,
                requester_coords,
                stack: decoded.stack,
                channel: decoded.channel,
            };
            let pipeline = &mut self.pipelines[decoded.stack as usize][decoded.channel as usize];
            let pushed = pipeline.push(req, latency);
            debug_assert!(
                pushed,
                "IOD {} pipeline stack={} channel={} overflowed",
                self.name, decoded.stack, decoded.channel
            );

            eaddr += chunk as u64;
            remaining -= chunk;
        }
        self.schedule_tick(engine);
    }

    fn emit_reply(&self, engine: &mut Engine, req: PendingReq) {
        let self_id = self.self_id.expect("IOD dispatched before registration");
        let router_id = self.router_id.expect("IOD not attached to a router");
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
                stack: req.stack,
                channel: req.channel,
            }),
            ..Default::default()
        };
        let event = Event::new(router_id, kind, Payload::Routable(payload)).with_src(self_id);
        engine.send(self_id, self.freq_mhz, event);
    }

    fn tick(&mut self, engine: &mut Engine) {
        self.tick_scheduled = false;
        let mut retired = Vec::new();
        for stack in self.pipelines.iter_mut() {
            for pipeline in stack.iter_mut() {
                if let Some(req) = pipeline.tick() {
                    retired.push(req);
                }
            }
        }
        for req in retired {
            self.emit_reply(engine, req);
        }
        let any_work = self.pipelines.iter().flatten().any(|p| !p.is_empty());
        if any_work {
            self.schedule_tick(engine);
        }
    }
}

impl Module for Iod {
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
            other => panic!("IOD {} received unexpected event kind {other}", self.name),
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
    fn decodes_known_address_fields() {
        // stack=1, channel=5, bank_group=2, bank=1, row=7, column=3, offset=4
        let eaddr: u64 = (1u64 << 35) | (5u64 << 31) | (2u64 << 29) | (1u64 << 27) | (7u64 << 11) | (3u64 << 3) | 4u64;
        let d = decode_eaddr(eaddr);
        assert_eq!(d.stack, 1);
        assert_eq!(d.channel, 5);
        assert_eq!(d.bank_group, 2);
        assert_eq!(d.bank, 1);
        assert_eq!(d.row, 7);
        assert_eq!(d.column, 3);
        assert_eq!(d.byte_offset, 4);
    }

    #[test]
    fn row_hit_is_cheaper_than_row_miss() {
        let mut iod = Iod::new(
            "iod0",
            1000,
            8,
            1,
            1,
            IodTiming {
                t_rp: 10,
                t_rcd: 10,
                t_cl: 5,
            },
        );
        let d = decode_eaddr(0);
        let miss = iod.compute_latency(d, 8);
        let hit = iod.compute_latency(d, 8);
        assert_eq!(miss, 10 + 10 + 5 + 1);
        assert_eq!(hit, 5 + 1);
    }

    #[test]
    fn row_crossing_request_splits_at_boundary() {
        let mut iod = Iod::new(
            "iod0",
            1000,
            8,
            1,
            1,
            IodTiming {
                t_rp: 1,
                t_rcd: 1,
                t_cl: 1,
            },
        );
        // Straddles the 2048-byte row boundary starting at offset 2040.
        let eaddr = 2040u64;
        let d1 = decode_eaddr(eaddr);
        assert_eq!(d1.row, 0);
        let d2 = decode_eaddr(eaddr + 2048 - 2040);
        assert_eq!(d2.row, 1);
    }
}

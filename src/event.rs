//! The closed event-kind set and its payload contract (§3, §6).
//!
//! The reference simulator keys events by a free-form `event_type` string
//! and stuffs every field into an untyped payload dict, so a missing field
//! is only discovered when a handler does `payload["eaddr"]` and blows up at
//! runtime. Here `EventKind` is a closed enum and `Payload` is a sum type:
//! the router-transported kinds (`PACKET`, `NPU_DMA_IN`, `DMA_READ`, ...)
//! share one `RoutablePayload` because the router treats all of them
//! identically — it only ever reads `dst_coords`/`input_port`/`input_vc`,
//! mirroring `router.py`'s single `event_types_to_route` branch — while the
//! self-ticking and credit-return kinds get their own narrow variants.

use crate::ids::{ChannelId, Coord, ModuleId, PortId, ProgramName, StreamId, VcId};

/// The closed set of event kinds the simulator ever schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Packet,
    NpuDmaIn,
    NpuCmd,
    NpuDmaOut,
    DmaRead,
    DmaWrite,
    DmaReadReply,
    WriteReply,
    NpuDmaInDone,
    NpuCmdDone,
    NpuDmaOutDone,
    RecvCred,
    RetrySend,
    PipelineTick,
    RunProgram,
}

impl EventKind {
    /// Whether this kind is carried through the router's RC/VA/SA/ST
    /// pipeline (as opposed to a self-event or a direct credit return).
    pub fn is_routable(self) -> bool {
        matches!(
            self,
            EventKind::Packet
                | EventKind::NpuDmaIn
                | EventKind::NpuCmd
                | EventKind::NpuDmaOut
                | EventKind::DmaRead
                | EventKind::DmaWrite
                | EventKind::DmaReadReply
                | EventKind::WriteReply
                | EventKind::NpuDmaInDone
                | EventKind::NpuCmdDone
                | EventKind::NpuDmaOutDone
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Packet => "PACKET",
            EventKind::NpuDmaIn => "NPU_DMA_IN",
            EventKind::NpuCmd => "NPU_CMD",
            EventKind::NpuDmaOut => "NPU_DMA_OUT",
            EventKind::DmaRead => "DMA_READ",
            EventKind::DmaWrite => "DMA_WRITE",
            EventKind::DmaReadReply => "DMA_READ_REPLY",
            EventKind::WriteReply => "WRITE_REPLY",
            EventKind::NpuDmaInDone => "NPU_DMA_IN_DONE",
            EventKind::NpuCmdDone => "NPU_CMD_DONE",
            EventKind::NpuDmaOutDone => "NPU_DMA_OUT_DONE",
            EventKind::RecvCred => "RECV_CRED",
            EventKind::RetrySend => "RETRY_SEND",
            EventKind::PipelineTick => "PIPELINE_TICK",
            EventKind::RunProgram => "RUN_PROGRAM",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload shared by every kind the router forwards (§6 table, row 1-3).
/// Fields unused by a particular kind default to their zero value; the
/// constructors in `Event` only fill in what that kind's contract requires.
#[derive(Debug, Clone, Default)]
pub struct RoutablePayload {
    pub dst_coords: Option<Coord>,
    pub input_port: PortId,
    pub input_vc: VcId,
    pub src_name: Option<ProgramName>,
    pub program: Option<ProgramName>,
    pub stream_id: Option<StreamId>,
    pub data_size: u32,
    pub opcode_cycles: u32,
    pub eaddr: u64,
    pub iaddr: u64,
    pub need_reply: bool,
    pub npu_name: Option<ProgramName>,
    pub channel_id: Option<ChannelId>,

    /// Where the CP's own LOCAL link sits, stamped onto every instruction it
    /// fans out so the eventual `*_DONE` can be routed back without the NPU
    /// needing any mesh-registry access of its own.
    pub requester_coords: Option<Coord>,
    /// Where an NPU should forward a DMA-kind instruction's `DMA_READ`/
    /// `DMA_WRITE`, resolved by the CP from the instruction's declared memory
    /// target at fan-out time.
    pub forward_coords: Option<Coord>,

    // Router-internal annotations accumulated as the flit crosses RC/VA/SA.
    // They travel on the payload (not a separate struct) because ST copies
    // the whole payload onto the next-hop event, exactly as `router.py`
    // forwards its payload dict hop to hop.
    pub prev_out_port: Option<PortId>,
    pub prev_out_vc: Option<VcId>,
    pub last_hop: Option<ModuleId>,
}

impl Default for PortId {
    fn default() -> Self {
        PortId(0)
    }
}
impl Default for VcId {
    fn default() -> Self {
        VcId(0)
    }
}

/// Payload for the non-routable, self-ticking and credit-return kinds.
#[derive(Debug, Clone)]
pub enum ControlPayload {
    RecvCred { port: PortId, vc: VcId },
    RetrySend(Box<Event>),
    PipelineTick,
    RunProgram { program: ProgramName },
}

#[derive(Debug, Clone)]
pub enum Payload {
    Routable(RoutablePayload),
    Control(ControlPayload),
}

impl Payload {
    pub fn as_routable(&self) -> Option<&RoutablePayload> {
        match self {
            Payload::Routable(p) => Some(p),
            Payload::Control(_) => None,
        }
    }

    pub fn as_routable_mut(&mut self) -> Option<&mut RoutablePayload> {
        match self {
            Payload::Routable(p) => Some(p),
            Payload::Control(_) => None,
        }
    }
}

/// An immutable-after-scheduling event record (§3). `scheduled_time` is
/// filled in by `Engine::schedule`; `priority` breaks ties among events
/// landing at the same time (lower first), and the engine further breaks
/// ties by insertion order so dispatch is fully deterministic.
#[derive(Debug, Clone)]
pub struct Event {
    pub src: Option<ModuleId>,
    pub dst: ModuleId,
    /// Cycle (in the *sender's* clock domain) this event is scheduled
    /// relative to; the engine converts this to absolute time.
    pub scheduled_cycle: u64,
    pub kind: EventKind,
    pub payload: Payload,
    pub byte_size: u32,
    pub priority: i32,
}

impl Event {
    pub fn new(dst: ModuleId, kind: EventKind, payload: Payload) -> Self {
        Event {
            src: None,
            dst,
            scheduled_cycle: 0,
            kind,
            payload,
            byte_size: 0,
            priority: 0,
        }
    }

    pub fn with_src(mut self, src: ModuleId) -> Self {
        self.src = Some(src);
        self
    }

    pub fn with_cycle(mut self, cycle: u64) -> Self {
        self.scheduled_cycle = cycle;
        self
    }

    pub fn with_byte_size(mut self, size: u32) -> Self {
        self.byte_size = size;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn routable(&self) -> &RoutablePayload {
        self.payload
            .as_routable()
            .expect("non-routable event asked for its routable payload")
    }

    pub fn routable_mut(&mut self) -> &mut RoutablePayload {
        self.payload
            .as_routable_mut()
            .expect("non-routable event asked for its routable payload")
    }

    /// Fatal per §7: an RC candidate with no destination coordinates is a
    /// programmer error, not a recoverable condition.
    pub fn dst_coords(&self) -> Coord {
        self.routable()
            .dst_coords
            .expect("routed event missing required dst_coords payload field")
    }
}

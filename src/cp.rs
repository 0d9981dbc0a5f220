//! Control Processor (§4.6): loads programs, runs a self-ticking scoreboard
//! issue loop respecting stream (RAW on `stream_id`) and structural (DMA
//! bus) hazards, fans out issued instructions to every attached NPU, and
//! reconciles per-stream completion across however many NPUs are listening.

use crate::engine::Engine;
use crate::error::{Result, SimError};
use crate::event::{ControlPayload, Event, EventKind, Payload, RoutablePayload};
use crate::ids::{Coord, ModuleId, PortId, ProgramName, StreamId, VcId};
use crate::module::{CreditBuffer, Module};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrKind {
    DmaIn,
    Cmd,
    DmaOut,
}

impl InstrKind {
    fn is_dma(self) -> bool {
        matches!(self, InstrKind::DmaIn | InstrKind::DmaOut)
    }

    fn event_kind(self) -> EventKind {
        match self {
            InstrKind::DmaIn => EventKind::NpuDmaIn,
            InstrKind::Cmd => EventKind::NpuCmd,
            InstrKind::DmaOut => EventKind::NpuDmaOut,
        }
    }
}

/// A program instruction as submitted by the (out-of-scope) ML front-end.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Instruction {
    pub kind: InstrKind,
    pub stream_id: u32,
    #[serde(default)]
    pub data_size: u32,
    #[serde(default)]
    pub eaddr: u64,
    pub opcode_cycles: u32,
    /// Required for `DmaIn`/`DmaOut`; the mesh coordinate of the memory
    /// tile this instruction's DMA traffic should be forwarded to.
    #[serde(default)]
    pub memory_coord: Option<Coord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Pending,
    Issued,
    Done,
}

struct ScoreboardEntry {
    kind: InstrKind,
    stream_id: StreamId,
    data_size: u32,
    eaddr: u64,
    opcode_cycles: u32,
    memory_coord: Option<Coord>,
    status: Status,
}

struct ProgramState {
    entries: Vec<ScoreboardEntry>,
    commit_pointer: usize,
    waiting_dma_in: HashMap<StreamId, HashSet<ProgramName>>,
    waiting_op: HashMap<StreamId, HashSet<ProgramName>>,
    waiting_dma_out: HashMap<StreamId, HashSet<ProgramName>>,
    tick_scheduled: bool,
}

impl ProgramState {
    fn waiting_for(&mut self, kind: InstrKind) -> &mut HashMap<StreamId, HashSet<ProgramName>> {
        match kind {
            InstrKind::DmaIn => &mut self.waiting_dma_in,
            InstrKind::Cmd => &mut self.waiting_op,
            InstrKind::DmaOut => &mut self.waiting_dma_out,
        }
    }

    fn all_done(&self) -> bool {
        self.entries.iter().all(|e| e.status == Status::Done)
    }

    fn advance_commit_pointer(&mut self) {
        while self.commit_pointer < self.entries.len() && self.entries[self.commit_pointer].status == Status::Done {
            self.commit_pointer += 1;
        }
    }
}

pub struct ControlProcessor {
    name: ProgramName,
    self_id: Option<ModuleId>,
    router_id: Option<ModuleId>,
    own_coords: Option<Coord>,
    freq_mhz: u32,
    credit: CreditBuffer,
    npu_targets: Vec<(ProgramName, Coord)>,
    programs: HashMap<ProgramName, ProgramState>,
    /// Structural hazard on the memory bus: process-wide across every
    /// program this CP runs, not per-program (§5) — only one DMA may be
    /// in flight across the whole scoreboard at a time.
    dma_busy: bool,
}

impl ControlProcessor {
    pub fn new(name: impl Into<ProgramName>, freq_mhz: u32, buffer_capacity: u32) -> Self {
        ControlProcessor {
            name: name.into(),
            self_id: None,
            router_id: None,
            own_coords: None,
            freq_mhz,
            credit: CreditBuffer::new(buffer_capacity),
            npu_targets: Vec::new(),
            programs: HashMap::new(),
            dma_busy: false,
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

    pub fn add_npu_target(&mut self, name: impl Into<ProgramName>, coord: Coord) {
        self.npu_targets.push((name.into(), coord));
    }

    /// A submitted program is removed from the scoreboard the instant every
    /// entry reaches `Done` (§4.6); external callers observe retirement this
    /// way rather than polling entry status directly.
    pub fn program_retired(&self, name: &str) -> bool {
        !self.programs.contains_key(name)
    }

    /// Loads `name`'s scoreboard from `instructions`. Per §4.2, `submit_program`
    /// only *builds* the scoreboard; `start` pushes the first tick.
    pub fn submit_program(&mut self, name: impl Into<ProgramName>, instructions: Vec<Instruction>) -> Result<()> {
        let name = name.into();
        if instructions.is_empty() {
            return Err(SimError::EmptyProgram { name: name.to_string() });
        }

        // Entries sharing a stream_id must form one contiguous run; a
        // stream_id reappearing after the program has moved on to another
        // stream can never be distinguished from the earlier, still-live
        // instructions on that same stream by the RAW hazard scan.
        let mut seen_streams: HashSet<u32> = HashSet::new();
        let mut last_stream: Option<u32> = None;
        for (index, instr) in instructions.iter().enumerate() {
            if Some(instr.stream_id) != last_stream {
                if !seen_streams.insert(instr.stream_id) {
                    return Err(SimError::NonContiguousStream {
                        stream_id: instr.stream_id,
                        index,
                    });
                }
                last_stream = Some(instr.stream_id);
            }
        }

        let entries = instructions
            .into_iter()
            .enumerate()
            .map(|(index, instr)| {
                if instr.kind != InstrKind::Cmd && instr.memory_coord.is_none() {
                    return Err(SimError::MissingMemoryTarget {
                        stream_id: instr.stream_id,
                        index,
                    });
                }
                Ok(ScoreboardEntry {
                    kind: instr.kind,
                    stream_id: StreamId(instr.stream_id),
                    data_size: instr.data_size,
                    eaddr: instr.eaddr,
                    opcode_cycles: instr.opcode_cycles,
                    memory_coord: instr.memory_coord,
                    status: Status::Pending,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        self.programs.insert(
            name,
            ProgramState {
                entries,
                commit_pointer: 0,
                waiting_dma_in: HashMap::new(),
                waiting_op: HashMap::new(),
                waiting_dma_out: HashMap::new(),
                tick_scheduled: false,
            },
        );
        Ok(())
    }

    /// Pushes `name`'s first `RUN_PROGRAM` self-event.
    pub fn start(&mut self, engine: &mut Engine, name: impl Into<ProgramName>) -> Result<()> {
        let name = name.into();
        if !self.programs.contains_key(&name) {
            return Err(SimError::UnknownProgram(name.to_string()));
        }
        self.schedule_tick(engine, name);
        Ok(())
    }

    fn schedule_tick(&mut self, engine: &mut Engine, program: ProgramName) {
        let id = self.self_id.expect("CP dispatched before registration");
        if let Some(state) = self.programs.get_mut(&program) {
            if state.tick_scheduled {
                return;
            }
            state.tick_scheduled = true;
        }
        engine.schedule_after(
            self.freq_mhz,
            1,
            Event::new(id, EventKind::RunProgram, Payload::Control(ControlPayload::RunProgram { program })),
        );
    }

    fn fan_out(&self, engine: &mut Engine, program: &ProgramName, entry: &ScoreboardEntry) {
        let self_id = self.self_id.expect("CP dispatched before registration");
        let router_id = self.router_id.expect("CP not attached to a router");
        let own_coords = self.own_coords.expect("CP dispatched before its coords were set");
        for (_npu_name, npu_coord) in &self.npu_targets {
            let payload = RoutablePayload {
                dst_coords: Some(*npu_coord),
                input_port: PortId(crate::router::LOCAL),
                input_vc: VcId(0),
                src_name: Some(self.name.clone()),
                program: Some(program.clone()),
                stream_id: Some(entry.stream_id),
                data_size: entry.data_size,
                opcode_cycles: entry.opcode_cycles,
                eaddr: entry.eaddr,
                requester_coords: Some(own_coords),
                forward_coords: entry.memory_coord,
                ..Default::default()
            };
            let event = Event::new(router_id, entry.kind.event_kind(), Payload::Routable(payload)).with_src(self_id);
            engine.send(self_id, self.freq_mhz, event);
        }
    }

    fn run_program_tick(&mut self, engine: &mut Engine, program: ProgramName) {
        let Some(state) = self.programs.get_mut(&program) else {
            return;
        };
        state.tick_scheduled = false;

        if state.all_done() {
            self.programs.remove(&program);
            return;
        }

        let npu_names: HashSet<ProgramName> = self.npu_targets.iter().map(|(n, _)| n.clone()).collect();
        let mut issued_entry: Option<(InstrKind, StreamId)> = None;
        {
            let state = self.programs.get_mut(&program).expect("program vanished mid-tick");
            let mut issue_idx = None;
            'scan: for idx in 0..state.entries.len() {
                if state.entries[idx].status != Status::Pending {
                    continue;
                }
                let stream_id = state.entries[idx].stream_id;
                let raw_hazard = state.entries[..idx]
                    .iter()
                    .any(|e| e.stream_id == stream_id && e.status != Status::Done);
                if raw_hazard {
                    continue;
                }
                if state.entries[idx].kind.is_dma() && self.dma_busy {
                    continue;
                }
                issue_idx = Some(idx);
                break 'scan;
            }

            if let Some(idx) = issue_idx {
                state.entries[idx].status = Status::Issued;
                let kind = state.entries[idx].kind;
                let stream_id = state.entries[idx].stream_id;
                if kind.is_dma() {
                    self.dma_busy = true;
                }
                state.waiting_for(kind).insert(stream_id, npu_names.clone());
                issued_entry = Some((kind, stream_id));
            }
        }

        if let Some((kind, stream_id)) = issued_entry {
            let entry_snapshot = {
                let state = self.programs.get(&program).unwrap();
                state
                    .entries
                    .iter()
                    .find(|e| e.kind == kind && e.stream_id == stream_id && e.status == Status::Issued)
                    .map(|e| ScoreboardEntry {
                        kind: e.kind,
                        stream_id: e.stream_id,
                        data_size: e.data_size,
                        eaddr: e.eaddr,
                        opcode_cycles: e.opcode_cycles,
                        memory_coord: e.memory_coord,
                        status: e.status,
                    })
                    .expect("just-issued entry missing")
            };
            self.fan_out(engine, &program, &entry_snapshot);
            self.schedule_tick(engine, program);
        }
    }

    fn handle_done(&mut self, event: &Event, kind: InstrKind, engine: &mut Engine) {
        let rp = event.routable();
        let program = match rp.program.clone() {
            Some(p) => p,
            None => return,
        };
        let stream_id = rp.stream_id.expect("*_DONE missing stream_id");
        let npu_name = rp.npu_name.clone().expect("*_DONE missing npu_name");

        let Some(state) = self.programs.get_mut(&program) else {
            // Unknown/already-retired program: a late DONE is an idempotent no-op.
            return;
        };

        let waiting = state.waiting_for(kind);
        let Some(set) = waiting.get_mut(&stream_id) else {
            return;
        };
        set.remove(&npu_name);
        if !set.is_empty() {
            return;
        }
        waiting.remove(&stream_id);

        if let Some(e) = state
            .entries
            .iter_mut()
            .find(|e| e.status == Status::Issued && e.kind == kind && e.stream_id == stream_id)
        {
            e.status = Status::Done;
        }
        if kind.is_dma() {
            self.dma_busy = false;
        }
        state.advance_commit_pointer();
        self.schedule_tick(engine, program);
    }
}

impl Module for ControlProcessor {
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
            EventKind::RunProgram => {
                let Payload::Control(ControlPayload::RunProgram { program }) = event.payload else {
                    panic!("RUN_PROGRAM event missing its program payload");
                };
                self.run_program_tick(engine, program);
            }
            EventKind::NpuDmaInDone => self.handle_done(&event, InstrKind::DmaIn, engine),
            EventKind::NpuCmdDone => self.handle_done(&event, InstrKind::Cmd, engine),
            EventKind::NpuDmaOutDone => self.handle_done(&event, InstrKind::DmaOut, engine),
            other => panic!("CP {} received unexpected event kind {other}", self.name),
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

    fn make_cp(engine: &mut Engine) -> ControlProcessor {
        let router_id = engine
            .register_module(Box::new(Sink {
                name: "router_stub".into(),
                credit: CreditBuffer::new(64),
            }))
            .unwrap();
        let mut cp = ControlProcessor::new("cp0", 1000, 8);
        cp.set_id(ModuleId(42));
        cp.attach_to_router(router_id);
        cp.set_coords(Coord::new(2, 0));
        cp.add_npu_target("npu0", Coord::new(0, 0));
        cp
    }

    #[test]
    fn rejects_empty_program() {
        let mut engine = Engine::new();
        let mut cp = make_cp(&mut engine);
        let err = cp.submit_program("p", vec![]).unwrap_err();
        assert!(matches!(err, SimError::EmptyProgram { .. }));
    }

    #[test]
    fn dma_instruction_without_memory_coord_is_rejected() {
        let mut engine = Engine::new();
        let mut cp = make_cp(&mut engine);
        let err = cp
            .submit_program(
                "p",
                vec![Instruction {
                    kind: InstrKind::DmaIn,
                    stream_id: 0,
                    data_size: 16,
                    eaddr: 0,
                    opcode_cycles: 2,
                    memory_coord: None,
                }],
            )
            .unwrap_err();
        assert!(matches!(err, SimError::MissingMemoryTarget { .. }));
    }

    #[test]
    fn reused_stream_id_after_switching_streams_is_rejected() {
        let mut engine = Engine::new();
        let mut cp = make_cp(&mut engine);
        let err = cp
            .submit_program(
                "p",
                vec![
                    Instruction {
                        kind: InstrKind::DmaIn,
                        stream_id: 0,
                        data_size: 16,
                        eaddr: 0,
                        opcode_cycles: 2,
                        memory_coord: Some(Coord::new(1, 0)),
                    },
                    Instruction {
                        kind: InstrKind::DmaIn,
                        stream_id: 1,
                        data_size: 16,
                        eaddr: 0,
                        opcode_cycles: 2,
                        memory_coord: Some(Coord::new(1, 0)),
                    },
                    Instruction {
                        kind: InstrKind::Cmd,
                        stream_id: 0,
                        data_size: 0,
                        eaddr: 0,
                        opcode_cycles: 1,
                        memory_coord: None,
                    },
                ],
            )
            .unwrap_err();
        assert!(matches!(err, SimError::NonContiguousStream { stream_id: 0, index: 2 }));
    }

    #[test]
    fn starting_unknown_program_errors() {
        let mut engine = Engine::new();
        let mut cp = make_cp(&mut engine);
        let err = cp.start(&mut engine, "ghost").unwrap_err();
        assert!(matches!(err, SimError::UnknownProgram(_)));
    }

    #[test]
    fn first_tick_issues_only_the_first_eligible_instruction() {
        let mut engine = Engine::new();
        let mut cp = make_cp(&mut engine);
        cp.submit_program(
            "p",
            vec![
                Instruction {
                    kind: InstrKind::DmaIn,
                    stream_id: 0,
                    data_size: 16,
                    eaddr: 0,
                    opcode_cycles: 2,
                    memory_coord: Some(Coord::new(1, 0)),
                },
                Instruction {
                    kind: InstrKind::DmaIn,
                    stream_id: 1,
                    data_size: 16,
                    eaddr: 0,
                    opcode_cycles: 2,
                    memory_coord: Some(Coord::new(1, 0)),
                },
            ],
        )
        .unwrap();
        let program: ProgramName = "p".into();
        cp.run_program_tick(&mut engine, program.clone());
        let state = cp.programs.get(&program).unwrap();
        // Second DMA is structurally hazarded behind dma_busy from the first.
        assert_eq!(state.entries[0].status, Status::Issued);
        assert_eq!(state.entries[1].status, Status::Pending);
        assert!(cp.dma_busy);
    }

    #[test]
    fn dma_busy_serializes_across_distinct_programs_on_the_same_cp() {
        let mut engine = Engine::new();
        let mut cp = make_cp(&mut engine);
        let dma_instr = |stream_id: u32| Instruction {
            kind: InstrKind::DmaIn,
            stream_id,
            data_size: 16,
            eaddr: 0,
            opcode_cycles: 2,
            memory_coord: Some(Coord::new(1, 0)),
        };
        cp.submit_program("a", vec![dma_instr(0)]).unwrap();
        cp.submit_program("b", vec![dma_instr(0)]).unwrap();

        cp.run_program_tick(&mut engine, "a".into());
        assert_eq!(cp.programs.get(&ProgramName::from("a")).unwrap().entries[0].status, Status::Issued);
        assert!(cp.dma_busy);

        // Program "b"'s DMA is structurally hazarded by "a"'s in-flight DMA,
        // even though the two are unrelated programs on unrelated streams.
        cp.run_program_tick(&mut engine, "b".into());
        assert_eq!(cp.programs.get(&ProgramName::from("b")).unwrap().entries[0].status, Status::Pending);
    }

    #[test]
    fn done_completion_clears_dma_busy_and_advances_commit_pointer() {
        let mut engine = Engine::new();
        let mut cp = make_cp(&mut engine);
        cp.submit_program(
            "p",
            vec![Instruction {
                kind: InstrKind::DmaIn,
                stream_id: 0,
                data_size: 16,
                eaddr: 0,
                opcode_cycles: 2,
                memory_coord: Some(Coord::new(1, 0)),
            }],
        )
        .unwrap();
        let program: ProgramName = "p".into();
        cp.run_program_tick(&mut engine, program.clone());

        let done_event = Event::new(
            ModuleId(42),
            EventKind::NpuDmaInDone,
            Payload::Routable(RoutablePayload {
                program: Some(program.clone()),
                stream_id: Some(StreamId(0)),
                npu_name: Some("npu0".into()),
                ..Default::default()
            }),
        );
        cp.handle_done(&done_event, InstrKind::DmaIn, &mut engine);
        let state = cp.programs.get(&program).unwrap();
        assert_eq!(state.entries[0].status, Status::Done);
        assert!(!cp.dma_busy);
        assert_eq!(state.commit_pointer, 1);
    }
}

#![doc = r#"
tessera-sim library crate.

A cycle-driven, discrete-event simulator for a tiled mesh accelerator: a 2-D
mesh NoC of virtual-channel routers, NPU compute tiles, a DRAM/IOD memory
subsystem, and a control processor that issues scoreboarded instruction
programs against the tiles.

Modules:
- time: femtosecond `SimTime` and cycle<->time conversions across clock domains
- ids: newtype handles (ModuleId, Coord, PortId, VcId, StreamId, ProgramName)
- error: the closed `SimError` type surfaced from construction/wiring APIs
- event: the closed `EventKind` set and its typed payload contract
- logger: append-only cycle-annotated event log
- module: the `Module` trait plus `CreditBuffer`/`LatencyPipeline`
- engine: the priority-queue event engine and credited send/dispatch loop
- router: the VC router (RC/VA/SA/ST) and LRG arbitration
- mesh: grid wiring and name/coordinate attachment registry
- npu: the NPU compute tile (DMA issue, compute pipeline, completion tracking)
- memory: DRAM (simple) and IOD (detailed, open-row) memory modes
- cp: the Control Processor's scoreboard issue loop
- config: `SimConfig`/`MemoryConfig` for JSON-driven runs
"#]

pub mod config;
pub mod cp;
pub mod engine;
pub mod error;
pub mod event;
pub mod ids;
pub mod logger;
pub mod memory;
pub mod mesh;
pub mod module;
pub mod npu;
pub mod router;
pub mod time;

pub use engine::Engine;
pub use error::{Result, SimError};
pub use mesh::Mesh;

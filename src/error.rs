//! Fatal, surfaced errors: everything a caller can observe at
//! construction/wiring time (mesh layout, module registration, program
//! load). Conditions only detectable mid-dispatch (a flit with no
//! `dst_coords`, a credit counter driven negative) have no `Result` plumbing
//! through `on_event` and instead panic, matching the reference engine's
//! `handle()`, which has no error return at all.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("module `{0}` is not registered with the engine")]
    UnknownModule(String),

    #[error("a module named `{0}` is already registered")]
    DuplicateModule(String),

    #[error("mesh dimensions must be positive, got {width}x{height}")]
    InvalidMeshDimensions { width: u16, height: u16 },

    #[error("no router at mesh coordinate {0}")]
    CoordOutOfBounds(crate::ids::Coord),

    #[error("router at {0} already has an attached module")]
    SlotOccupied(crate::ids::Coord),

    #[error("program `{0}` is unknown to this control processor")]
    UnknownProgram(String),

    #[error("program `{name}` has no instructions")]
    EmptyProgram { name: String },

    #[error("stream_id {stream_id} reused by instruction {index} while an earlier instruction on that stream is still live")]
    NonContiguousStream { stream_id: u32, index: usize },

    #[error("instruction {index} (stream_id {stream_id}) is a DMA kind but declares no memory_coord")]
    MissingMemoryTarget { stream_id: u32, index: usize },
}

pub type Result<T> = std::result::Result<T, SimError>;

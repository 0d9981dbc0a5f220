//! Small newtype identifiers shared across the engine, mesh, router and
//! hardware tiles. Kept separate from their owning modules because every one
//! of them crosses module boundaries inside an `Event`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Stable handle into the engine's module arena. Events carry this instead
/// of a reference or pointer so modules never need to borrow each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModuleId(pub u32);

/// Mesh grid coordinate, `x` increasing east, `y` increasing south.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
pub struct Coord {
    pub x: u16,
    pub y: u16,
}

impl Coord {
    pub const fn new(x: u16, y: u16) -> Self {
        Coord { x, y }
    }
}

impl std::fmt::Display for Coord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Router port index. Port 0 is always LOCAL; 1..5 are E, W, N, S.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PortId(pub u8);

/// Virtual channel index within a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VcId(pub u8);

/// Program-internal ordering tag. Instructions sharing a `StreamId` are
/// serialized RAW; distinct stream ids may issue and complete out of order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct StreamId(pub u32);

/// Interned program name. `Arc<str>` so it can be cloned into every fan-out
/// event and scoreboard entry without re-allocating.
pub type ProgramName = Arc<str>;

/// Memory channel identity carried on reply payloads so the requester can
/// observe concurrency across channels without re-decoding the address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub stack: u8,
    pub channel: u8,
}

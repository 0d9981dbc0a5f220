//! Grid wiring and attachment resolution (§4.7). `Mesh` owns no simulation
//! state itself — routers and attached tiles all live in the engine's module
//! arena — it only remembers the `Coord` <-> `ModuleId` bookkeeping the CP
//! needs to turn a program's NPU/memory names into routable destinations.

use crate::engine::Engine;
use crate::error::{Result, SimError};
use crate::ids::{Coord, ModuleId, PortId, ProgramName};
use crate::module::Module;
use crate::router::{Router, EAST, LOCAL, NORTH, SOUTH, WEST};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachKind {
    Npu,
    Cp,
    Memory,
}

pub struct Mesh {
    width: u16,
    height: u16,
    routers: HashMap<Coord, ModuleId>,
    npu_coords: HashMap<ProgramName, Coord>,
    cp_coords: HashMap<ProgramName, Coord>,
    iod_coords: HashMap<ProgramName, Coord>,
}

impl Mesh {
    pub fn create(
        engine: &mut Engine,
        width: u16,
        height: u16,
        freq_mhz: u32,
        num_vcs: u8,
        buffer_capacity: u32,
    ) -> Result<Mesh> {
        if width == 0 || height == 0 {
            return Err(SimError::InvalidMeshDimensions { width, height });
        }

        let mut routers = HashMap::new();
        for y in 0..height {
            for x in 0..width {
                let coord = Coord::new(x, y);
                let name: ProgramName = format!("router_{x}_{y}").into();
                let id = engine.register_module(Box::new(Router::new(
                    name,
                    coord,
                    freq_mhz,
                    num_vcs,
                    buffer_capacity,
                )))?;
                engine.downcast_mut::<Router>(id).unwrap().set_id(id);
                routers.insert(coord, id);
            }
        }

        for y in 0..height {
            for x in 0..width {
                let coord = Coord::new(x, y);
                let id = routers[&coord];
                if x + 1 < width {
                    let east_id = routers[&Coord::new(x + 1, y)];
                    engine
                        .downcast_mut::<Router>(id)
                        .unwrap()
                        .set_neighbor(EAST, east_id, PortId(WEST));
                    engine
                        .downcast_mut::<Router>(east_id)
                        .unwrap()
                        .set_neighbor(WEST, id, PortId(EAST));
                }
                if y + 1 < height {
                    let south_id = routers[&Coord::new(x, y + 1)];
                    engine
                        .downcast_mut::<Router>(id)
                        .unwrap()
                        .set_neighbor(SOUTH, south_id, PortId(NORTH));
                    engine
                        .downcast_mut::<Router>(south_id)
                        .unwrap()
                        .set_neighbor(NORTH, id, PortId(SOUTH));
                }
            }
        }

        Ok(Mesh {
            width,
            height,
            routers,
            npu_coords: HashMap::new(),
            cp_coords: HashMap::new(),
            iod_coords: HashMap::new(),
        })
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    pub fn router_id(&self, coord: Coord) -> Result<ModuleId> {
        self.routers.get(&coord).copied().ok_or(SimError::CoordOutOfBounds(coord))
    }

    /// Install `module` on the router at `coord`'s LOCAL link and register
    /// its name in the registry matching `kind` (§4.7).
    pub fn attach(&mut self, engine: &mut Engine, coord: Coord, kind: AttachKind, module: Box<dyn Module>) -> Result<ModuleId> {
        let router_id = self.router_id(coord)?;
        if engine.downcast_ref::<Router>(router_id).unwrap().has_local() {
            return Err(SimError::SlotOccupied(coord));
        }

        let name = module.name().clone();
        let module_id = engine.register_module(module)?;
        engine
            .downcast_mut::<Router>(router_id)
            .unwrap()
            .set_neighbor(LOCAL, module_id, PortId(0));

        match kind {
            AttachKind::Npu => {
                self.npu_coords.insert(name, coord);
            }
            AttachKind::Cp => {
                self.cp_coords.insert(name, coord);
            }
            AttachKind::Memory => {
                self.iod_coords.insert(name, coord);
            }
        }
        Ok(module_id)
    }

    pub fn npu_coord(&self, name: &str) -> Option<Coord> {
        self.npu_coords.get(name).copied()
    }

    pub fn cp_coord(&self, name: &str) -> Option<Coord> {
        self.cp_coords.get(name).copied()
    }

    pub fn memory_coord(&self, name: &str) -> Option<Coord> {
        self.iod_coords.get(name).copied()
    }

    pub fn npu_names(&self) -> impl Iterator<Item = &ProgramName> {
        self.npu_coords.keys()
    }
}

impl Router {
    pub fn has_local(&self) -> bool {
        self.neighbor_at(LOCAL).is_some()
    }
}

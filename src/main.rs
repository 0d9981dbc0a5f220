//! `tessera-sim`: loads a `SimConfig` and a program file, builds the mesh,
//! runs it to idle, and prints a summary (§10.4). The in-tree stand-in for
//! the out-of-scope ML front-end and timeline renderer.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use tessera_sim::config::{MemoryConfig, SimConfig};
use tessera_sim::cp::{ControlProcessor, Instruction};
use tessera_sim::ids::{Coord, VcId};
use tessera_sim::memory::{Dram, Iod, IodTiming};
use tessera_sim::mesh::{AttachKind, Mesh};
use tessera_sim::npu::Npu;
use tessera_sim::router::{Router, EAST, NORTH, NUM_PORTS, SOUTH, WEST};
use tessera_sim::Engine;

#[derive(Parser, Debug)]
#[command(name = "tessera-sim", about = "Cycle-driven mesh accelerator simulator")]
struct Cli {
    /// Path to a SimConfig JSON file.
    #[arg(long)]
    config: PathBuf,

    /// Path to a program JSON file: `{"name": "...", "instructions": [...]}`.
    #[arg(long)]
    program: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ProgramFile {
    name: String,
    instructions: Vec<Instruction>,
}

/// Places the CP at the mesh's NW corner, memory at the SE corner (or
/// colocated with the CP on a single-tile mesh), and an NPU on every other
/// coordinate. Real tile placement is an ML front-end concern out of scope
/// here (§1); this layout only needs to exercise every module kind.
fn build_mesh(engine: &mut Engine, cfg: &SimConfig) -> tessera_sim::Result<(Mesh, String)> {
    let mut mesh = Mesh::create(
        engine,
        cfg.width,
        cfg.height,
        cfg.router.frequency_mhz,
        cfg.router.num_vcs,
        cfg.router.buffer_capacity,
    )?;

    let cp_coord = Coord::new(0, 0);
    let mem_coord = if cfg.width * cfg.height > 1 {
        Coord::new(cfg.width - 1, cfg.height - 1)
    } else {
        cp_coord
    };

    let cp_name = "cp0".to_string();
    let cp_module_id = mesh.attach(
        engine,
        cp_coord,
        AttachKind::Cp,
        Box::new(ControlProcessor::new(cp_name.clone(), cfg.cp.frequency_mhz, cfg.cp.buffer_capacity)),
    )?;
    let cp_router_id = mesh.router_id(cp_coord)?;
    {
        let cp = engine.downcast_mut::<ControlProcessor>(cp_module_id).unwrap();
        cp.set_id(cp_module_id);
        cp.attach_to_router(cp_router_id);
        cp.set_coords(cp_coord);
    }

    let mem_name = "mem0".to_string();
    let mem_router_id = mesh.router_id(mem_coord)?;
    match &cfg.memory {
        MemoryConfig::Dram {
            frequency_mhz,
            buffer_capacity,
            num_channels,
            ..
        } => {
            let id = mesh.attach(
                engine,
                mem_coord,
                AttachKind::Memory,
                Box::new(Dram::new(mem_name.clone(), *frequency_mhz, *buffer_capacity, *num_channels)),
            )?;
            let dram = engine.downcast_mut::<Dram>(id).unwrap();
            dram.set_id(id);
            dram.attach_to_router(mem_router_id);
        }
        MemoryConfig::Iod {
            frequency_mhz,
            buffer_capacity,
            num_stacks,
            channels_per_stack,
            t_rp,
            t_rcd,
            t_cl,
        } => {
            let id = mesh.attach(
                engine,
                mem_coord,
                AttachKind::Memory,
                Box::new(Iod::new(
                    mem_name.clone(),
                    *frequency_mhz,
                    *buffer_capacity,
                    *num_stacks,
                    *channels_per_stack,
                    IodTiming {
                        t_rp: *t_rp,
                        t_rcd: *t_rcd,
                        t_cl: *t_cl,
                    },
                )),
            )?;
            let iod = engine.downcast_mut::<Iod>(id).unwrap();
            iod.set_id(id);
            iod.attach_to_router(mem_router_id);
        }
    };

    for y in 0..cfg.height {
        for x in 0..cfg.width {
            let coord = Coord::new(x, y);
            if coord == cp_coord || coord == mem_coord {
                continue;
            }
            let name = format!("npu_{x}_{y}");
            let router_id = mesh.router_id(coord)?;
            let npu_id = mesh.attach(
                engine,
                coord,
                AttachKind::Npu,
                Box::new(Npu::new(name.clone(), cfg.npu.frequency_mhz, cfg.npu.buffer_capacity, cfg.npu.txn_bytes)),
            )?;
            {
                let npu = engine.downcast_mut::<Npu>(npu_id).unwrap();
                npu.set_id(npu_id);
                npu.attach_to_router(router_id);
                npu.set_coords(coord);
            }
            engine
                .downcast_mut::<ControlProcessor>(cp_module_id)
                .unwrap()
                .add_npu_target(name, coord);
        }
    }

    Ok((mesh, cp_name))
}

fn credit_conservation_report(engine: &Engine, mesh: &Mesh, num_vcs: u8) -> (u32, u32) {
    let mut conserved = 0;
    let mut total = 0;
    for y in 0..mesh.height() {
        for x in 0..mesh.width() {
            let coord = Coord::new(x, y);
            let Ok(router_id) = mesh.router_id(coord) else { continue };
            let Some(router) = engine.downcast_ref::<Router>(router_id) else {
                continue;
            };
            for out_port in [EAST, WEST, NORTH, SOUTH] {
                if (out_port as usize) >= NUM_PORTS {
                    continue;
                }
                for vc in 0..num_vcs {
                    total += 1;
                    if router.credit_count(out_port, VcId(vc)) == router.buffer_capacity_per_vc() {
                        conserved += 1;
                    }
                }
            }
        }
    }
    (conserved, total)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let config_text = std::fs::read_to_string(&cli.config).expect("failed to read config file");
    let cfg: SimConfig = serde_json::from_str(&config_text).expect("failed to parse config JSON");

    let program_text = std::fs::read_to_string(&cli.program).expect("failed to read program file");
    let program_file: ProgramFile = serde_json::from_str(&program_text).expect("failed to parse program JSON");

    let mut engine = Engine::new();
    let (mesh, cp_name) = build_mesh(&mut engine, &cfg).expect("failed to build mesh");

    let cp_id = engine.module_id(&cp_name).expect("cp not registered");
    engine.with_downcast_mut::<ControlProcessor, _>(cp_id, |cp, engine| {
        cp.submit_program(program_file.name.clone(), program_file.instructions)
            .expect("failed to submit program");
        cp.start(engine, program_file.name.clone()).expect("failed to start program");
    });

    let report = engine.run_until_idle(cfg.max_ticks);
    let (conserved, total) = credit_conservation_report(&engine, &mesh, cfg.router.num_vcs);

    println!("ticks consumed: {}", report.ticks);
    println!("queue drained: {}", report.queue_drained);
    println!("events logged: {}", engine.logger().len());
    println!("final sim time (fs): {}", engine.now());
    println!("credit conservation: {conserved}/{total} (out_port, vc) pairs restored to capacity");
}

//! Memory subsystem (§4.5): a simple flat-latency DRAM mode and a detailed
//! IOD mode with open-row bank timing. Which one a mesh coordinate runs is a
//! config-time choice (`config::MemoryConfig`); both speak the same
//! `DMA_READ`/`DMA_WRITE` -> `DMA_READ_REPLY`/`WRITE_REPLY` contract, so an
//! NPU never needs to know which mode it is talking to.

pub mod dram;
pub mod iod;

pub use dram::Dram;
pub use iod::{decode_eaddr, DecodedAddr, Iod, IodTiming};

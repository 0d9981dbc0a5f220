//! Run configuration (§10.3): everything a CLI invocation needs besides the
//! program file itself, loaded once from JSON via `serde`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModuleConfig {
    pub frequency_mhz: u32,
    pub buffer_capacity: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouterConfig {
    pub frequency_mhz: u32,
    pub buffer_capacity: u32,
    pub num_vcs: u8,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NpuConfig {
    pub frequency_mhz: u32,
    pub buffer_capacity: u32,
    pub txn_bytes: u32,
    /// Depth of the reference's K-stage compute pipeline. The in-tree NPU
    /// models "a single command is in-flight at a time" (§4.4) directly, so
    /// this is accepted for config-file compatibility but not otherwise
    /// consulted — see DESIGN.md.
    #[serde(default = "default_pipeline_stages")]
    pub pipeline_stages: u32,
}

fn default_pipeline_stages() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MemoryConfig {
    Dram {
        frequency_mhz: u32,
        buffer_capacity: u32,
        num_channels: u32,
        opcode_cycles: u32,
    },
    Iod {
        frequency_mhz: u32,
        buffer_capacity: u32,
        num_stacks: u8,
        channels_per_stack: u8,
        t_rp: u32,
        t_rcd: u32,
        t_cl: u32,
    },
}

impl MemoryConfig {
    pub fn frequency_mhz(&self) -> u32 {
        match self {
            MemoryConfig::Dram { frequency_mhz, .. } => *frequency_mhz,
            MemoryConfig::Iod { frequency_mhz, .. } => *frequency_mhz,
        }
    }

    pub fn buffer_capacity(&self) -> u32 {
        match self {
            MemoryConfig::Dram { buffer_capacity, .. } => *buffer_capacity,
            MemoryConfig::Iod { buffer_capacity, .. } => *buffer_capacity,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimConfig {
    pub width: u16,
    pub height: u16,
    pub router: RouterConfig,
    pub npu: NpuConfig,
    pub cp: ModuleConfig,
    pub memory: MemoryConfig,
    /// Maximum ticks `run_until_idle` may spend before giving up; `None`
    /// means run to completion.
    #[serde(default)]
    pub max_ticks: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_a_dram_config_from_json() {
        let json = r#"{
            "width": 2, "height": 1,
            "router": {"frequency_mhz": 1000, "buffer_capacity": 8, "num_vcs": 2},
            "npu": {"frequency_mhz": 1000, "buffer_capacity": 8, "txn_bytes": 64},
            "cp": {"frequency_mhz": 1000, "buffer_capacity": 8},
            "memory": {"mode": "dram", "frequency_mhz": 800, "buffer_capacity": 8, "num_channels": 4, "opcode_cycles": 10}
        }"#;
        let cfg: SimConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.width, 2);
        assert_eq!(cfg.npu.pipeline_stages, 1);
        assert!(matches!(cfg.memory, MemoryConfig::Dram { num_channels: 4, .. }));
    }

    #[test]
    fn deserializes_an_iod_config_from_json() {
        let json = r#"{
            "width": 2, "height": 1,
            "router": {"frequency_mhz": 1000, "buffer_capacity": 8, "num_vcs": 2},
            "npu": {"frequency_mhz": 1000, "buffer_capacity": 8, "txn_bytes": 64, "pipeline_stages": 4},
            "cp": {"frequency_mhz": 1000, "buffer_capacity": 8},
            "memory": {"mode": "iod", "frequency_mhz": 800, "buffer_capacity": 8, "num_stacks": 1, "channels_per_stack": 8, "t_rp": 10, "t_rcd": 10, "t_cl": 8}
        }"#;
        let cfg: SimConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.npu.pipeline_stages, 4);
        assert!(matches!(cfg.memory, MemoryConfig::Iod { channels_per_stack: 8, .. }));
    }
}

use serde::{Deserialize, Serialize};

/// Arithmetic precision a plan is built for
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Int8,
}

/// Settings for building a plan from a model file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuilderConfig {
    pub precision: Precision,
    /// Scratch memory the builder may use, in bytes
    pub max_workspace_size: u64,
    pub avg_timing_iterations: u32,
    pub min_timing_iterations: u32,
    /// Offload to a deep learning accelerator core instead of the main device
    pub dla_core: Option<u32>,
}
impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            precision: Precision::Fp32,
            max_workspace_size: 1 << 30,
            avg_timing_iterations: 8,
            min_timing_iterations: 4,
            dla_core: None,
        }
    }
}
impl BuilderConfig {
    pub fn with_precision(precision: Precision) -> Self {
        Self {
            precision,
            ..Self::default()
        }
    }
}

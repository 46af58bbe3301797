mod compiled;
mod graph;

pub use compiled::{CompiledEngine, CALIBRATION_EXTENSION, PLAN_EXTENSION};
pub use graph::{GraphEngine, NetLoader};

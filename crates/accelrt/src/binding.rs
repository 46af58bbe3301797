use serde::{Deserialize, Serialize};

/// Element type of a plan binding as the device stores it
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Float,
    Half,
    Int8,
    Int32,
    Bool,
    Uint8,
}
impl DataType {
    /// Bytes reserved per element when staging this type ([None] if it can't be staged)
    ///
    /// Half precision bindings are staged as 32-bit floats on both sides of the bus.
    pub fn element_size(self) -> Option<usize> {
        match self {
            Self::Float | Self::Half | Self::Int32 => Some(4),
            Self::Int8 => Some(1),
            Self::Bool | Self::Uint8 => None,
        }
    }
}

/// Whether the network reads or writes a binding
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

/// One named, typed input or output slot of a compiled plan
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BindingInfo {
    pub name: String,
    pub direction: Direction,
    pub dims: Vec<usize>,
    pub data_type: DataType,
    /// Int8 scale recorded by calibration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<f32>,
}
impl BindingInfo {
    pub fn is_input(&self) -> bool {
        self.direction == Direction::Input
    }
    /// Number of elements
    pub fn volume(&self) -> usize {
        self.dims.iter().product()
    }
    /// Size of the staging buffers for this binding ([None] if the type can't be staged)
    pub fn byte_size(&self) -> Option<usize> {
        self.data_type
            .element_size()
            .map(|size| size * self.volume())
    }
}

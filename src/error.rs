use std::fmt;

use crate::engine::State;

/// Coarse failure categories every backend reports in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Descriptors, model files or parameters are wrong
    Configuration,
    /// A requested type, layout or color conversion isn't supported
    UnsupportedConversion,
    /// Host or device memory couldn't be reserved
    Allocation,
    /// The backend failed while running
    Execution,
    Io,
}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Debug>::fmt(self, f)
    }
}

/// Inference helper's error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("model has no tensor named `{name}`")]
    TensorNotFound { name: String },
    #[error("unsupported conversion from {from} to {to}")]
    UnsupportedConversion { from: String, to: String },
    #[error("allocation failed: {0}")]
    Allocation(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("expected {expected} output tensors, got {actual}")]
    OutputCountMismatch { expected: usize, actual: usize },
    #[error("staging buffer of `{name}` was reallocated during preprocessing")]
    StagingBufferMoved { name: String },
    #[error("can't {op} while {state}")]
    InvalidState { op: &'static str, state: State },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),
}
impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::TensorNotFound { .. } | Self::Toml(_) => {
                ErrorKind::Configuration
            }
            Self::UnsupportedConversion { .. } => ErrorKind::UnsupportedConversion,
            Self::Allocation(_) => ErrorKind::Allocation,
            Self::Execution(_)
            | Self::OutputCountMismatch { .. }
            | Self::StagingBufferMoved { .. }
            | Self::InvalidState { .. } => ErrorKind::Execution,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    pub(crate) fn unsupported(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self::UnsupportedConversion {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
impl From<accelrt::Error> for Error {
    fn from(err: accelrt::Error) -> Self {
        use accelrt::Error as E;

        match err {
            E::OutOfMemory { .. } | E::InvalidPointer(_) => Self::Allocation(err.to_string()),
            E::UnsupportedDataType { .. } => Self::Allocation(err.to_string()),
            E::Parse(_) | E::Build(_) | E::Calibration(_) | E::NoDevice(_) => {
                Self::Configuration(err.to_string())
            }
            E::Io(err) => Self::Io(err),
            E::SizeMismatch { .. }
            | E::Deserialize(_)
            | E::ContextCreation(_)
            | E::Launch(_)
            | E::Json(_) => Self::Execution(err.to_string()),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_errors_keep_their_category() {
        let oom = accelrt::Error::OutOfMemory {
            requested: 10,
            in_use: 0,
            limit: 4,
        };
        assert_eq!(Error::from(oom).kind(), ErrorKind::Allocation);

        let missing = std::io::Error::new(std::io::ErrorKind::NotFound, "model.onnx");
        assert_eq!(Error::from(accelrt::Error::Io(missing)).kind(), ErrorKind::Io);

        assert_eq!(
            Error::from(accelrt::Error::Launch("boom".into())).kind(),
            ErrorKind::Execution
        );
        assert_eq!(
            Error::from(accelrt::Error::Deserialize("not a plan file".into())).kind(),
            ErrorKind::Execution
        );
    }
}

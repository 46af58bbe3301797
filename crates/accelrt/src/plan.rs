use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{BindingInfo, CalibrationTable, Error, Precision};

const MAGIC: &[u8; 4] = b"AXPL";
const VERSION: u32 = 1;
/// Magic, version and header length
const PREAMBLE_LEN: usize = 12;

/// Everything about a plan except the network payload
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlanHeader {
    /// Name of the compiler that produced the network payload
    pub producer: String,
    pub precision: Precision,
    pub bindings: Vec<BindingInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<CalibrationTable>,
}

/// A compiled execution plan
///
/// On disk a plan is the magic `AXPL`, a little-endian `u32` version, a little-endian `u32`
/// header length, the JSON header, and finally the network payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Plan {
    pub header: PlanHeader,
    pub network: Vec<u8>,
}
impl Plan {
    /// Serialize the plan into bytes
    ///
    /// # Errors
    ///
    /// Returns an error if the header can't be encoded.
    pub fn serialize(&self) -> Result<Vec<u8>, Error> {
        let header = serde_json::to_vec(&self.header)?;
        let header_len = u32::try_from(header.len())
            .map_err(|_| Error::Build(format!("plan header of {} bytes", header.len())))?;

        let mut out = Vec::with_capacity(PREAMBLE_LEN + header.len() + self.network.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&header_len.to_le_bytes());
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.network);

        Ok(out)
    }

    /// Load a plan from a byte slice
    ///
    /// # Errors
    ///
    /// Returns [Error::Deserialize] if the bytes aren't a plan of a version this runtime reads.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < PREAMBLE_LEN || &bytes[..4] != MAGIC {
            return Err(Error::Deserialize("not a plan file".into()));
        }

        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != VERSION {
            return Err(Error::Deserialize(format!(
                "plan version {version} (expected {VERSION})"
            )));
        }

        let header_len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        let header_end = PREAMBLE_LEN
            .checked_add(header_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| Error::Deserialize("truncated plan header".into()))?;

        let header: PlanHeader = serde_json::from_slice(&bytes[PREAMBLE_LEN..header_end])
            .map_err(|err| Error::Deserialize(format!("bad plan header: {err}")))?;

        Ok(Self {
            header,
            network: bytes[header_end..].to_vec(),
        })
    }

    /// Load a plan from a file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        Self::deserialize(&fs::read(path)?)
    }

    /// Save the plan to a file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        fs::write(path, self.serialize()?)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DataType, Direction};

    fn plan() -> Plan {
        let mut calibration = CalibrationTable::default();
        calibration.insert("data", 2.5);

        Plan {
            header: PlanHeader {
                producer: "test".into(),
                precision: Precision::Int8,
                bindings: vec![
                    BindingInfo {
                        name: "data".into(),
                        direction: Direction::Input,
                        dims: vec![1, 3, 2, 2],
                        data_type: DataType::Float,
                        scale: Some(2.5 / 127.0),
                    },
                    BindingInfo {
                        name: "prob".into(),
                        direction: Direction::Output,
                        dims: vec![1, 10],
                        data_type: DataType::Float,
                        scale: None,
                    },
                ],
                calibration: Some(calibration),
            },
            network: vec![0xde, 0xad, 0xbe, 0xef],
        }
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.trt");

        let plan = plan();
        plan.save(&path).unwrap();
        assert_eq!(Plan::load(&path).unwrap(), plan);
    }

    #[test]
    fn rejects_foreign_bytes() {
        assert!(matches!(
            Plan::deserialize(b"ONNXnotaplan"),
            Err(Error::Deserialize(_))
        ));

        let mut bytes = plan().serialize().unwrap();
        bytes[4] = 9;
        assert!(matches!(
            Plan::deserialize(&bytes),
            Err(Error::Deserialize(_))
        ));

        let bytes = plan().serialize().unwrap();
        assert!(matches!(
            Plan::deserialize(&bytes[..20]),
            Err(Error::Deserialize(_))
        ));
    }
}

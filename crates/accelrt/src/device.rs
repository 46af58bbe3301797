/// Represents how an accelerator is attached
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    /// Device memory and kernels emulated in host memory
    Host,
    /// A discrete accelerator on a PCI slot
    Pci,
}

/// Default device memory limit of the host-emulated device
pub const DEFAULT_MEMORY_LIMIT: u64 = 4 << 30;

/// Environment variable overriding [DEFAULT_MEMORY_LIMIT], in bytes
pub const MEMORY_LIMIT_ENV: &str = "ACCELRT_MEMORY_LIMIT";

/// Represents an accelerator device
///
/// You'll primarily use this struct to pick the device a runtime is created on, and to check
/// how much memory it can hand out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    index: usize,
    name: String,
    kind: DeviceKind,
    memory_limit: u64,
}
impl DeviceInfo {
    pub fn new(index: usize, name: impl Into<String>, kind: DeviceKind, memory_limit: u64) -> Self {
        Self {
            index,
            name: name.into(),
            kind,
            memory_limit,
        }
    }
    /// Position of the device in [list_devices()]
    pub fn index(&self) -> usize {
        self.index
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn kind(&self) -> DeviceKind {
        self.kind
    }
    /// Total device memory in bytes
    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }
}

/// An iterator over available accelerator devices
///
/// Returned by [list_devices()].
pub struct DeviceList {
    devices: std::vec::IntoIter<DeviceInfo>,
}
impl Iterator for DeviceList {
    type Item = DeviceInfo;

    fn next(&mut self) -> Option<Self::Item> {
        self.devices.next()
    }
}

/// Lists all available accelerator devices
///
/// The host-emulated device is always present. Its memory limit can be lowered with the
/// `ACCELRT_MEMORY_LIMIT` environment variable.
pub fn list_devices() -> DeviceList {
    let memory_limit = match std::env::var(MEMORY_LIMIT_ENV) {
        Ok(raw) => match raw.trim().parse() {
            Ok(limit) => limit,
            Err(_) => {
                warn!("ignoring invalid {MEMORY_LIMIT_ENV}={raw:?}");
                DEFAULT_MEMORY_LIMIT
            }
        },
        Err(_) => DEFAULT_MEMORY_LIMIT,
    };

    let devices = vec![DeviceInfo::new(
        0,
        "host-emulated accelerator",
        DeviceKind::Host,
        memory_limit,
    )];
    debug!("found {} accelerator device(s)", devices.len());

    DeviceList {
        devices: devices.into_iter(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_device_is_listed() {
        let device = list_devices().next().unwrap();
        assert_eq!(device.index(), 0);
        assert_eq!(device.kind(), DeviceKind::Host);
        assert!(device.memory_limit() > 0);
    }
}

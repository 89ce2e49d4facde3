//! Collaborator seams: device enumeration and the NIC plugin.
//!
//! Discovery and the NIC override chain consume these traits; production
//! backends live outside this crate.

use crate::error::Result;

/// Static properties of one network device, as reported by the plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct NetProperties {
    pub name: String,
    /// PCI path of the device, e.g. "/0000:20:00.0/0000:21:00.0".
    pub pci_path: String,
    pub speed_mbps: i32,
    pub latency_us: f32,
    pub port: i32,
    pub guid: u64,
    pub max_comms: i32,
}

pub trait DeviceAdaptor {
    /// Logical device index for a PCI bus-id string.
    fn device_by_pci_bus_id(&self, bus_id: &str) -> Result<i32>;
}

pub trait NetPlugin {
    fn devices(&self) -> Result<usize>;

    fn properties(&self, index: usize) -> Result<NetProperties>;

    fn dev_from_name(&self, name: &str) -> Result<i32>;
}

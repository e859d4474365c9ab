//! PCI passthrough devices and host device probing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::error::HostletError;

/// Default sysfs location of PCI devices
pub const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Driver a device must be bound to before it can be passed through
pub const VFIO_DRIVER: &str = "vfio-pci";

/// A PCI address in `domain:bus:slot.function` form, e.g. `0000:01:00.0`
///
/// Stored lowercase so differently-cased spellings name the same device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PciAddress(String);

impl PciAddress {
    /// Get the address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PciAddress {
    type Err = HostletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        let hex = |range: std::ops::Range<usize>| bytes[range].iter().all(u8::is_ascii_hexdigit);

        let valid = bytes.len() == 12
            && hex(0..4)
            && bytes[4] == b':'
            && hex(5..7)
            && bytes[7] == b':'
            && hex(8..10)
            && bytes[10] == b'.'
            && (b'0'..=b'7').contains(&bytes[11]);

        if !valid {
            return Err(HostletError::Config(format!(
                "Invalid PCI address '{}': expected DDDD:BB:SS.F",
                s
            )));
        }

        Ok(Self(s.to_ascii_lowercase()))
    }
}

impl TryFrom<String> for PciAddress {
    type Error = HostletError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PciAddress> for String {
    fn from(addr: PciAddress) -> Self {
        addr.0
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of passthrough device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[default]
    Gpu,
    Audio,
    Other,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Gpu => write!(f, "gpu"),
            DeviceKind::Audio => write!(f, "audio"),
            DeviceKind::Other => write!(f, "other"),
        }
    }
}

/// A physical device assigned to a VM through passthrough
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Physical address, the device's identity
    pub pci_address: PciAddress,
    /// PCI vendor id (e.g. "10de")
    #[serde(default)]
    pub vendor_id: Option<String>,
    /// PCI product id (e.g. "2204")
    #[serde(default)]
    pub product_id: Option<String>,
    /// Device kind
    #[serde(default)]
    pub kind: DeviceKind,
    /// Human-readable model name
    #[serde(default)]
    pub model: Option<String>,
}

impl Device {
    /// Create a GPU device with only its address known
    pub fn gpu(pci_address: PciAddress) -> Self {
        Self {
            pci_address,
            vendor_id: None,
            product_id: None,
            kind: DeviceKind::Gpu,
            model: None,
        }
    }

    /// Whether the device takes part in cross-cluster sharing
    pub fn is_gpu(&self) -> bool {
        self.kind == DeviceKind::Gpu
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.pci_address)?;
        if let (Some(vendor), Some(product)) = (&self.vendor_id, &self.product_id) {
            write!(f, " ({}:{})", vendor, product)?;
        }
        if let Some(model) = &self.model {
            write!(f, " {}", model)?;
        }
        Ok(())
    }
}

/// Extract the PCI address from a device description such as
/// `0000:01:00.0 (10de:2204) NVIDIA RTX A6000`
pub fn extract_pci_address(description: &str) -> Option<PciAddress> {
    description
        .split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
}

/// A device as seen in the host's sysfs
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostDevice {
    pub address: PciAddress,
    pub vendor_id: String,
    pub product_id: String,
    /// PCI class code (e.g. "030000")
    pub class: String,
    /// Currently bound kernel driver
    pub driver: Option<String>,
}

impl HostDevice {
    /// Whether the device is bound to vfio-pci
    pub fn is_vfio_bound(&self) -> bool {
        self.driver.as_deref() == Some(VFIO_DRIVER)
    }

    /// Whether the class code is a display controller (VGA, 3D, ...)
    pub fn is_display_controller(&self) -> bool {
        self.class.starts_with("03")
    }
}

/// Read a device's identity and driver binding from sysfs
///
/// Returns `None` when the device does not exist under `sysfs_root`.
pub fn probe_device(sysfs_root: &Path, address: &PciAddress) -> Option<HostDevice> {
    let dir = sysfs_root.join(address.as_str());
    if !dir.is_dir() {
        return None;
    }

    let read_id = |name: &str| -> String {
        std::fs::read_to_string(dir.join(name))
            .map(|s| s.trim().trim_start_matches("0x").to_ascii_lowercase())
            .unwrap_or_default()
    };

    let driver = std::fs::read_link(dir.join("driver"))
        .ok()
        .and_then(|target| target.file_name().map(|n| n.to_string_lossy().into_owned()));

    Some(HostDevice {
        address: address.clone(),
        vendor_id: read_id("vendor"),
        product_id: read_id("device"),
        class: read_id("class"),
        driver,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pci_address() {
        let addr: PciAddress = "0000:0A:00.1".parse().unwrap();
        assert_eq!(addr.as_str(), "0000:0a:00.1");
        assert_eq!(addr, "0000:0a:00.1".parse().unwrap());
    }

    #[test]
    fn test_reject_invalid_pci_address() {
        for bad in ["01:00.0", "0000:01:00.8", "0000-01-00.0", "000g:01:00.0", ""] {
            assert!(bad.parse::<PciAddress>().is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_pci_address_serde() {
        let addr: PciAddress = serde_json::from_str("\"0000:01:00.0\"").unwrap();
        assert_eq!(serde_json::to_string(&addr).unwrap(), "\"0000:01:00.0\"");
        assert!(serde_json::from_str::<PciAddress>("\"bogus\"").is_err());
    }

    #[test]
    fn test_device_display_and_extract() {
        let device = Device {
            pci_address: "0000:01:00.0".parse().unwrap(),
            vendor_id: Some("10de".to_string()),
            product_id: Some("2204".to_string()),
            kind: DeviceKind::Gpu,
            model: Some("NVIDIA RTX A6000".to_string()),
        };
        let text = device.to_string();
        assert_eq!(text, "0000:01:00.0 (10de:2204) NVIDIA RTX A6000");
        assert_eq!(extract_pci_address(&text), Some(device.pci_address));
        assert_eq!(extract_pci_address("NVIDIA RTX A6000"), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_probe_device() {
        let root = tempfile::tempdir().unwrap();
        let addr: PciAddress = "0000:01:00.0".parse().unwrap();
        let dir = root.path().join(addr.as_str());
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("vendor"), "0x10de\n").unwrap();
        std::fs::write(dir.join("device"), "0x2204\n").unwrap();
        std::fs::write(dir.join("class"), "0x030000\n").unwrap();
        let driver_dir = root.path().join("drivers").join(VFIO_DRIVER);
        std::fs::create_dir_all(&driver_dir).unwrap();
        std::os::unix::fs::symlink(&driver_dir, dir.join("driver")).unwrap();

        let device = probe_device(root.path(), &addr).unwrap();
        assert_eq!(device.vendor_id, "10de");
        assert_eq!(device.product_id, "2204");
        assert!(device.is_display_controller());
        assert!(device.is_vfio_bound());

        let missing: PciAddress = "0000:02:00.0".parse().unwrap();
        assert!(probe_device(root.path(), &missing).is_none());
    }
}

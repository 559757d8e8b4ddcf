//! Specification model for a declared microvm.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::validate::{Violation, ViolationKind};

/// Desired-state description of a single microvm.
///
/// A `MicrovmSpec` is a pure value: it carries no lifecycle information and
/// is immutable once submitted for a given generation. Observed state lives
/// separately (see `skiff-core`), joined to the spec only by an external
/// identity.
///
/// Wire field names follow the declarative API (`memoryMb`, `rootVolume`,
/// `volumes`, `kernelCmdline`, `networkInterfaces`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrovmSpec {
    /// Number of virtual CPUs (minimum 1)
    pub vcpu: u32,
    /// Memory in MB (minimum 1024)
    pub memory_mb: u32,
    /// Root filesystem volume
    pub root_volume: Volume,
    /// Additional volumes, mounted after the root volume
    #[serde(default, rename = "volumes")]
    pub additional_volumes: Vec<Volume>,
    /// Kernel to boot, sourced from a container image
    pub kernel: ContainerFileSource,
    /// Kernel command line; empty means "use the platform default"
    #[serde(default)]
    pub kernel_cmdline: String,
    /// Optional initial ramdisk, sourced from a container image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<ContainerFileSource>,
    /// Guest network interfaces (at least one required)
    pub network_interfaces: Vec<NetworkInterface>,
}

impl MicrovmSpec {
    /// Start building a specification.
    pub fn builder() -> MicrovmSpecBuilder {
        MicrovmSpecBuilder::default()
    }

    /// List the top-level fields on which `self` and `other` differ.
    ///
    /// Returns wire field names (`memoryMb`, `rootVolume`, ...). Used by the
    /// reconciler to report which fields of a changed specification would
    /// require the instance to be recreated.
    pub fn changed_fields(&self, other: &MicrovmSpec) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.vcpu != other.vcpu {
            changed.push("vcpu");
        }
        if self.memory_mb != other.memory_mb {
            changed.push("memoryMb");
        }
        if self.root_volume != other.root_volume {
            changed.push("rootVolume");
        }
        if self.additional_volumes != other.additional_volumes {
            changed.push("volumes");
        }
        if self.kernel != other.kernel {
            changed.push("kernel");
        }
        if self.kernel_cmdline != other.kernel_cmdline {
            changed.push("kernelCmdline");
        }
        if self.initrd != other.initrd {
            changed.push("initrd");
        }
        if self.network_interfaces != other.network_interfaces {
            changed.push("networkInterfaces");
        }
        changed
    }
}

/// Builder for [`MicrovmSpec`].
///
/// The builder never fails: required fields left unset produce empty values
/// that the validator reports, so `build()` followed by
/// [`MicrovmSpec::admit`] gives a complete violation report in one pass.
#[derive(Debug, Clone, Default)]
pub struct MicrovmSpecBuilder {
    vcpu: u32,
    memory_mb: u32,
    root_volume: Option<Volume>,
    additional_volumes: Vec<Volume>,
    kernel: Option<ContainerFileSource>,
    kernel_cmdline: String,
    initrd: Option<ContainerFileSource>,
    network_interfaces: Vec<NetworkInterface>,
}

impl MicrovmSpecBuilder {
    /// Set the number of vCPUs.
    pub fn vcpu(mut self, vcpu: u32) -> Self {
        self.vcpu = vcpu;
        self
    }

    /// Set the memory in MB.
    pub fn memory_mb(mut self, memory_mb: u32) -> Self {
        self.memory_mb = memory_mb;
        self
    }

    /// Set the root volume.
    pub fn root_volume(mut self, volume: Volume) -> Self {
        self.root_volume = Some(volume);
        self
    }

    /// Add an additional volume.
    pub fn volume(mut self, volume: Volume) -> Self {
        self.additional_volumes.push(volume);
        self
    }

    /// Set the kernel source image.
    pub fn kernel(mut self, image: impl Into<String>) -> Self {
        self.kernel = Some(ContainerFileSource::new(image));
        self
    }

    /// Set the kernel source including a filename within the image.
    pub fn kernel_source(mut self, source: ContainerFileSource) -> Self {
        self.kernel = Some(source);
        self
    }

    /// Set the kernel command line.
    pub fn kernel_cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.kernel_cmdline = cmdline.into();
        self
    }

    /// Set the initrd source.
    pub fn initrd(mut self, source: ContainerFileSource) -> Self {
        self.initrd = Some(source);
        self
    }

    /// Add a network interface.
    pub fn network_interface(mut self, iface: NetworkInterface) -> Self {
        self.network_interfaces.push(iface);
        self
    }

    /// Build the specification.
    pub fn build(self) -> MicrovmSpec {
        MicrovmSpec {
            vcpu: self.vcpu,
            memory_mb: self.memory_mb,
            root_volume: self.root_volume.unwrap_or_else(|| Volume::new("", "")),
            additional_volumes: self.additional_volumes,
            kernel: self.kernel.unwrap_or_else(|| ContainerFileSource::new("")),
            kernel_cmdline: self.kernel_cmdline,
            initrd: self.initrd,
            network_interfaces: self.network_interfaces,
        }
    }
}

/// A block volume sourced from a container image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Unique volume identifier within the spec
    pub id: String,
    /// Container image providing the volume contents
    pub image: String,
    /// Mount the volume read-only
    #[serde(default)]
    pub read_only: bool,
    /// Mount point inside the guest; empty means "use the default" (`/`)
    #[serde(default)]
    pub mount_point: String,
}

impl Volume {
    /// Create a volume with the given id and image.
    pub fn new(id: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            read_only: false,
            mount_point: String::new(),
        }
    }

    /// Mark the volume read-only.
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Set the mount point.
    pub fn mount_point(mut self, mount_point: impl Into<String>) -> Self {
        self.mount_point = mount_point.into();
        self
    }
}

/// A file sourced from a container image (kernel, initrd).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerFileSource {
    /// Container image providing the file
    pub image: String,
    /// Path within the image; `None` means the image's default artifact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl ContainerFileSource {
    /// Create a source using the image's default artifact.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            filename: None,
        }
    }

    /// Select a specific file within the image.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }
}

/// Host-side attachment type of a guest network interface.
///
/// The set is closed: an unknown wire value fails deserialization rather
/// than being coerced into a string nobody can act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IfaceType {
    /// Userspace tap device
    Tap,
    /// Kernel macvtap device bridged onto a physical interface
    Macvtap,
}

impl fmt::Display for IfaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IfaceType::Tap => write!(f, "tap"),
            IfaceType::Macvtap => write!(f, "macvtap"),
        }
    }
}

impl FromStr for IfaceType {
    type Err = Violation;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tap" => Ok(IfaceType::Tap),
            "macvtap" => Ok(IfaceType::Macvtap),
            other => Err(Violation::new(
                "type",
                ViolationKind::InvalidEnumValue,
                format!("unknown interface type {other:?}, expected \"tap\" or \"macvtap\""),
            )),
        }
    }
}

/// A guest network interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkInterface {
    /// Device name visible inside the guest (e.g. `eth0`)
    pub guest_device_name: String,
    /// Guest MAC address; `None` means the runtime assigns one at creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
    /// Host-side attachment type
    #[serde(rename = "type")]
    pub kind: IfaceType,
    /// Static IP address; absence implies DHCP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl NetworkInterface {
    /// Create an interface of the given type.
    pub fn new(guest_device_name: impl Into<String>, kind: IfaceType) -> Self {
        Self {
            guest_device_name: guest_device_name.into(),
            guest_mac: None,
            kind,
            address: None,
        }
    }

    /// Pin the guest MAC address.
    pub fn guest_mac(mut self, mac: impl Into<String>) -> Self {
        self.guest_mac = Some(mac.into());
        self
    }

    /// Assign a static IP address instead of DHCP.
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }
}

/// A reusable template that stamps out microvm specifications.
///
/// Labels are cosmetic metadata: they live outside [`MicrovmSpec`] so they
/// can change without the reconciler treating the machine as drifted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplate {
    /// Free-form labels attached to machines stamped from this template
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// The specification template
    pub spec: MicrovmSpec,
}

impl MachineTemplate {
    /// Create a template around a specification.
    pub fn new(spec: MicrovmSpec) -> Self {
        Self {
            labels: HashMap::new(),
            spec,
        }
    }

    /// Attach a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Stamp out a specification from this template.
    pub fn stamp(&self) -> MicrovmSpec {
        self.spec.clone()
    }
}

//! Types for the hypervisor crate.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// State of a domain as reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DomainState {
    /// The hypervisor reports no state.
    NoState,
    /// The domain is running.
    Running,
    /// The domain is blocked on a resource.
    Blocked,
    /// The domain is paused.
    Paused,
    /// The domain is being shut down.
    ShuttingDown,
    /// The domain is shut off.
    ShutOff,
    /// The domain crashed.
    Crashed,
    /// The domain is suspended by guest power management.
    Suspended,
    /// Domain state cannot be determined.
    #[default]
    Unknown,
}

impl DomainState {
    /// Parse a domain state from `virsh domstate` output.
    #[must_use]
    pub fn from_virsh(state: &str) -> Self {
        match state.trim() {
            "no state" => Self::NoState,
            "running" => Self::Running,
            "idle" | "blocked" => Self::Blocked,
            "paused" => Self::Paused,
            "in shutdown" => Self::ShuttingDown,
            "shut off" => Self::ShutOff,
            "crashed" => Self::Crashed,
            "pmsuspended" => Self::Suspended,
            _ => Self::Unknown,
        }
    }

    /// Check if the domain counts as "up" for run-state bookkeeping.
    #[must_use]
    pub const fn is_up(&self) -> bool {
        matches!(self, Self::Running | Self::Blocked | Self::Paused)
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoState => "no state",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Paused => "paused",
            Self::ShuttingDown => "in shutdown",
            Self::ShutOff => "shut off",
            Self::Crashed => "crashed",
            Self::Suspended => "pmsuspended",
            Self::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// An opaque handle to a storage volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeRef {
    /// Volume name inside the storage pool.
    pub name: String,
    /// Path the hypervisor uses to attach the volume.
    pub path: String,
}

/// Everything needed to define a domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainSpec {
    /// Domain name.
    pub name: String,
    /// Memory in megabytes.
    pub memory_mb: u32,
    /// Virtual CPU count.
    pub vcpus: u32,
    /// Main disk.
    pub disk: VolumeRef,
    /// Boot payload disk.
    pub payload: VolumeRef,
    /// MAC address of the network interface.
    pub mac: String,
    /// Network the interface is attached to.
    pub network: String,
}

/// A static DHCP host assignment on the hypervisor network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
    /// Host name, equal to the domain name for leases this daemon owns.
    pub name: String,
    /// MAC address.
    pub mac: String,
    /// Assigned address.
    pub ip: Ipv4Addr,
}

impl Lease {
    /// Create a new lease.
    #[must_use]
    pub fn new(name: impl Into<String>, mac: impl Into<String>, ip: Ipv4Addr) -> Self {
        Self {
            name: name.into(),
            mac: mac.into(),
            ip,
        }
    }
}

/// Live description of the hypervisor network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Network name.
    pub name: String,
    /// First address of the DHCP range.
    pub range_start: Ipv4Addr,
    /// Last address of the DHCP range.
    pub range_end: Ipv4Addr,
    /// Configured static host leases.
    pub leases: Vec<Lease>,
}

impl NetworkInfo {
    /// Iterate over every address of the DHCP range, in order.
    pub fn range(&self) -> impl Iterator<Item = Ipv4Addr> {
        (u32::from(self.range_start)..=u32::from(self.range_end)).map(Ipv4Addr::from)
    }

    /// Find a configured lease by host name.
    #[must_use]
    pub fn lease(&self, name: &str) -> Option<&Lease> {
        self.leases.iter().find(|l| l.name == name)
    }
}

/// Configuration for the hypervisor connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// libvirt connection URI. Uses the virsh default when unset.
    pub connect_uri: Option<String>,
    /// Storage pool holding seeds, disks and boot payloads.
    pub storage_pool: String,
    /// Network VMs are attached to.
    pub network: String,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            connect_uri: Some("qemu:///system".to_string()),
            storage_pool: "vmfleet".to_string(),
            network: "vmfleet".to_string(),
        }
    }
}

impl HypervisorConfig {
    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `VMFLEET_LIBVIRT_URI`: libvirt connection URI (empty for the virsh default)
    /// - `VMFLEET_STORAGE_POOL`: storage pool name
    /// - `VMFLEET_NETWORK`: network name
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("VMFLEET_LIBVIRT_URI") {
            config.connect_uri = if val.is_empty() { None } else { Some(val) };
        }
        if let Ok(val) = std::env::var("VMFLEET_STORAGE_POOL") {
            config.storage_pool = val;
        }
        if let Ok(val) = std::env::var("VMFLEET_NETWORK") {
            config.network = val;
        }

        config
    }
}

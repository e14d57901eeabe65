//! Domain types stored in the database.
//!
//! These types represent the persisted state of VMs: the identity database
//! entries and the cold run state.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vmfleet_core::{SecretUuid, VmName};

/// The immutable provisioning specification of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConfig {
    /// Logical VM name (a valid name token).
    pub name: String,
    /// Seed volume the disk is cloned from.
    pub seed: String,
    /// Disk size in bytes.
    pub disk_size_bytes: u64,
    /// Memory in megabytes.
    pub ram_mb: u32,
    /// Virtual CPU count.
    pub cpu_count: u32,
    /// Guest hostname. Defaults to the VM name when empty.
    #[serde(default)]
    pub hostname: String,
    /// Unprivileged application user created inside the guest.
    #[serde(default = "VmConfig::default_app_user")]
    pub app_user: String,
    /// Upgrade guest packages during first boot.
    #[serde(default)]
    pub auto_upgrade: bool,
    /// Extra variables passed through to the boot payload.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl VmConfig {
    /// One gibibyte, for sizing shorthands.
    pub const GIB: u64 = 1024 * 1024 * 1024;

    /// Create a config with the given name and seed and default sizing
    /// (20 GiB disk, 1 GiB RAM, 1 vCPU).
    #[must_use]
    pub fn new(name: impl Into<String>, seed: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seed: seed.into(),
            disk_size_bytes: 20 * Self::GIB,
            ram_mb: 1024,
            cpu_count: 1,
            hostname: String::new(),
            app_user: Self::default_app_user(),
            auto_upgrade: false,
            variables: BTreeMap::new(),
        }
    }

    fn default_app_user() -> String {
        "app".to_string()
    }

    /// The hostname the guest will use.
    #[must_use]
    pub fn effective_hostname(&self) -> &str {
        if self.hostname.is_empty() {
            &self.name
        } else {
            &self.hostname
        }
    }
}

/// A provisioned VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
    /// Hypervisor-assigned domain UUID.
    pub libvirt_uuid: String,
    /// Correlation token presented by the VM when it phones home.
    pub secret_uuid: SecretUuid,
    /// Provisioning specification.
    pub config: VmConfig,
    /// MAC address of the VM's network interface.
    pub assigned_mac: String,
    /// Static address reserved for the VM on the hypervisor network.
    pub assigned_ip: Ipv4Addr,
    /// Last address the VM phoned home from.
    pub last_ip: Option<IpAddr>,
    /// Operator lock blocking destructive operations.
    pub locked: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// An entry of the identity database: a named revision of a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDatabaseEntry {
    /// Identity of this revision.
    pub name: VmName,
    /// The VM itself.
    pub vm: Vm,
    /// Whether this revision currently receives traffic and state-management
    /// attention.
    pub active: bool,
}

impl VmDatabaseEntry {
    /// Hypervisor domain name of this entry.
    #[must_use]
    pub fn domain_name(&self, prefix: &str) -> String {
        self.name.domain_name(prefix)
    }
}

/// Cold (persisted) run state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// The VM is, or should be, running.
    Up,
    /// The VM is, or should be, stopped.
    Down,
}

impl RunState {
    /// Return the state as a lowercase string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(format!("invalid run state '{other}' (expected: up, down)")),
        }
    }
}

/// A snapshot of run states, keyed by `VmName::id()`.
pub type RunStates = BTreeMap<String, RunState>;

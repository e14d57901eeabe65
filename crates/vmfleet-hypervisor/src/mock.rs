//! In-memory hypervisor for tests.
//!
//! `MockHypervisor` keeps domains, volumes and leases in memory. Tests drive
//! guest behaviour through [`MockHypervisor::on_boot`] and inject failures with
//! [`MockHypervisor::fail_on`].

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::types::{DomainSpec, DomainState, Lease, NetworkInfo, VolumeRef};
use crate::virsh::Hypervisor;
use crate::{HypervisorError, Result};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    /// `define_domain`
    DefineDomain,
    /// `undefine_domain`
    UndefineDomain,
    /// `start_domain`
    StartDomain,
    /// `shutdown_domain`
    ShutdownDomain,
    /// `destroy_domain`
    DestroyDomain,
    /// `clone_volume`
    CloneVolume,
    /// `resize_volume`
    ResizeVolume,
    /// `upload_volume`
    UploadVolume,
    /// `delete_volume`
    DeleteVolume,
    /// `network_info`
    NetworkInfo,
    /// `add_lease`
    AddLease,
    /// `remove_lease`
    RemoveLease,
}

/// Passed to the boot hook every time a domain is started.
#[derive(Debug, Clone)]
pub struct BootEvent {
    /// Domain name.
    pub domain: String,
    /// Number of times this domain has been started, including this one.
    pub boot_count: u32,
    /// Contents of the domain's boot payload volume.
    pub payload: Option<Vec<u8>>,
}

/// Callback invoked after a domain is started.
pub type BootHook = Arc<dyn Fn(BootEvent) + Send + Sync>;

struct MockDomain {
    spec: DomainSpec,
    uuid: String,
    state: DomainState,
    boot_count: u32,
}

struct MockState {
    domains: HashMap<String, MockDomain>,
    volumes: HashMap<String, Vec<u8>>,
    network: NetworkInfo,
    failures: HashSet<MockOp>,
    unreadable: HashSet<String>,
    ignore_shutdown: bool,
    lease_updates: usize,
    network_latency: Duration,
}

/// A mock hypervisor that stores everything in memory.
pub struct MockHypervisor {
    state: Mutex<MockState>,
    boot_hook: Mutex<Option<BootHook>>,
}

impl Default for MockHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockHypervisor {
    /// Create a mock with an empty `vmfleet` network on `10.104.0.100-199`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                domains: HashMap::new(),
                volumes: HashMap::new(),
                network: NetworkInfo {
                    name: "vmfleet".to_string(),
                    range_start: Ipv4Addr::new(10, 104, 0, 100),
                    range_end: Ipv4Addr::new(10, 104, 0, 199),
                    leases: Vec::new(),
                },
                failures: HashSet::new(),
                unreadable: HashSet::new(),
                ignore_shutdown: false,
                lease_updates: 0,
                network_latency: Duration::ZERO,
            }),
            boot_hook: Mutex::new(None),
        }
    }

    /// Add a volume, typically a seed image.
    pub fn add_volume(&self, name: &str, data: &[u8]) {
        self.state.lock().volumes.insert(name.to_string(), data.to_vec());
    }

    /// Make every call of `op` fail until [`clear_failures`](Self::clear_failures).
    pub fn fail_on(&self, op: MockOp) {
        self.state.lock().failures.insert(op);
    }

    /// Make `domain_state` fail for one domain only.
    pub fn fail_state_of(&self, name: &str) {
        self.state.lock().unreadable.insert(name.to_string());
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.unreadable.clear();
    }

    /// Delay every network call, so concurrent callers interleave.
    pub fn set_network_latency(&self, latency: Duration) {
        self.state.lock().network_latency = latency;
    }

    /// Make graceful shutdown requests have no effect.
    pub fn ignore_shutdown(&self, ignore: bool) {
        self.state.lock().ignore_shutdown = ignore;
    }

    /// Install the boot hook.
    pub fn on_boot(&self, hook: BootHook) {
        *self.boot_hook.lock() = Some(hook);
    }

    /// Force the state of a domain.
    pub fn set_domain_state(&self, name: &str, state: DomainState) {
        if let Some(domain) = self.state.lock().domains.get_mut(name) {
            domain.state = state;
        }
    }

    /// Define a bare domain directly, bypassing `define_domain`.
    pub fn insert_domain(&self, name: &str, state: DomainState) {
        let spec = DomainSpec {
            name: name.to_string(),
            memory_mb: 512,
            vcpus: 1,
            disk: VolumeRef {
                name: format!("{name}.qcow2"),
                path: format!("/mock/{name}.qcow2"),
            },
            payload: VolumeRef {
                name: format!("{name}-payload.img"),
                path: format!("/mock/{name}-payload.img"),
            },
            mac: "52:54:00:00:00:00".to_string(),
            network: "vmfleet".to_string(),
        };
        self.state.lock().domains.insert(
            name.to_string(),
            MockDomain {
                spec,
                uuid: uuid::Uuid::new_v4().to_string(),
                state,
                boot_count: 0,
            },
        );
    }

    /// Add a lease directly, bypassing `add_lease`.
    pub fn insert_lease(&self, lease: Lease) {
        self.state.lock().network.leases.push(lease);
    }

    /// Names of all defined domains, sorted.
    #[must_use]
    pub fn domain_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().domains.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of all volumes, sorted.
    #[must_use]
    pub fn volume_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.lock().volumes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Current leases.
    #[must_use]
    pub fn leases(&self) -> Vec<Lease> {
        self.state.lock().network.leases.clone()
    }

    /// Number of successful lease additions and removals so far.
    #[must_use]
    pub fn lease_updates(&self) -> usize {
        self.state.lock().lease_updates
    }

    /// Number of times a domain has been started.
    #[must_use]
    pub fn boot_count(&self, name: &str) -> u32 {
        self.state.lock().domains.get(name).map_or(0, |d| d.boot_count)
    }

    /// Get the spec a domain was defined with.
    #[must_use]
    pub fn domain_spec(&self, name: &str) -> Option<DomainSpec> {
        self.state.lock().domains.get(name).map(|d| d.spec.clone())
    }

    /// UUID the mock assigned to a domain.
    #[must_use]
    pub fn domain_uuid(&self, name: &str) -> Option<String> {
        self.state.lock().domains.get(name).map(|d| d.uuid.clone())
    }

    /// Contents of the boot payload volume attached to a domain.
    #[must_use]
    pub fn payload_of_domain(&self, name: &str) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let domain = state.domains.get(name)?;
        state.volumes.get(&domain.spec.payload.name).cloned()
    }

    fn check(state: &MockState, op: MockOp) -> Result<()> {
        if state.failures.contains(&op) {
            return Err(HypervisorError::command_failed(
                format!("{op:?}"),
                "injected failure",
            ));
        }
        Ok(())
    }

    async fn network_delay(&self) {
        let latency = self.state.lock().network_latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn volume_ref(name: &str) -> VolumeRef {
        VolumeRef {
            name: name.to_string(),
            path: format!("/mock/{name}"),
        }
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn domain_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().domains.contains_key(name))
    }

    async fn define_domain(&self, spec: &DomainSpec) -> Result<String> {
        let mut state = self.state.lock();
        Self::check(&state, MockOp::DefineDomain)?;

        if state.domains.contains_key(&spec.name) {
            return Err(HypervisorError::command_failed(
                "define",
                format!("domain '{}' already exists", spec.name),
            ));
        }

        let uuid = uuid::Uuid::new_v4().to_string();
        state.domains.insert(
            spec.name.clone(),
            MockDomain {
                spec: spec.clone(),
                uuid: uuid.clone(),
                state: DomainState::ShutOff,
                boot_count: 0,
            },
        );
        Ok(uuid)
    }

    async fn undefine_domain(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, MockOp::UndefineDomain)?;
        state
            .domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        let event = {
            let mut state = self.state.lock();
            Self::check(&state, MockOp::StartDomain)?;

            let domain = state
                .domains
                .get_mut(name)
                .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))?;
            if domain.state.is_up() {
                return Err(HypervisorError::command_failed(
                    "start",
                    "domain is already active",
                ));
            }
            domain.state = DomainState::Running;
            domain.boot_count += 1;

            let boot_count = domain.boot_count;
            let payload_name = domain.spec.payload.name.clone();
            BootEvent {
                domain: name.to_string(),
                boot_count,
                payload: state.volumes.get(&payload_name).cloned(),
            }
        };

        // Run the hook without holding any lock; it usually calls back in.
        let hook = self.boot_hook.lock().clone();
        if let Some(hook) = hook {
            hook(event);
        }
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, MockOp::ShutdownDomain)?;
        let ignore = state.ignore_shutdown;

        let domain = state
            .domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))?;
        if !domain.state.is_up() {
            return Err(HypervisorError::command_failed(
                "shutdown",
                "domain is not running",
            ));
        }
        if !ignore {
            domain.state = DomainState::ShutOff;
        }
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, MockOp::DestroyDomain)?;

        let domain = state
            .domains
            .get_mut(name)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))?;
        if domain.state == DomainState::ShutOff {
            return Err(HypervisorError::command_failed(
                "destroy",
                "domain is not running",
            ));
        }
        domain.state = DomainState::ShutOff;
        Ok(())
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState> {
        let state = self.state.lock();
        if state.unreadable.contains(name) {
            return Err(HypervisorError::command_failed(
                "domstate",
                "injected failure",
            ));
        }
        state
            .domains
            .get(name)
            .map(|d| d.state)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))
    }

    async fn clone_volume(&self, seed: &str, name: &str) -> Result<VolumeRef> {
        let mut state = self.state.lock();
        Self::check(&state, MockOp::CloneVolume)?;

        let data = state
            .volumes
            .get(seed)
            .cloned()
            .ok_or_else(|| HypervisorError::VolumeNotFound(seed.to_string()))?;
        if state.volumes.contains_key(name) {
            return Err(HypervisorError::command_failed(
                "vol-clone",
                format!("storage volume '{name}' exists already"),
            ));
        }
        state.volumes.insert(name.to_string(), data);
        Ok(Self::volume_ref(name))
    }

    async fn resize_volume(&self, name: &str, _size_bytes: u64) -> Result<()> {
        let state = self.state.lock();
        Self::check(&state, MockOp::ResizeVolume)?;
        if state.volumes.contains_key(name) {
            Ok(())
        } else {
            Err(HypervisorError::VolumeNotFound(name.to_string()))
        }
    }

    async fn upload_volume(&self, name: &str, data: &[u8]) -> Result<VolumeRef> {
        let mut state = self.state.lock();
        Self::check(&state, MockOp::UploadVolume)?;
        state.volumes.insert(name.to_string(), data.to_vec());
        Ok(Self::volume_ref(name))
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        Self::check(&state, MockOp::DeleteVolume)?;
        state
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| HypervisorError::VolumeNotFound(name.to_string()))
    }

    async fn network_info(&self) -> Result<NetworkInfo> {
        self.network_delay().await;
        let state = self.state.lock();
        Self::check(&state, MockOp::NetworkInfo)?;
        Ok(state.network.clone())
    }

    async fn add_lease(&self, lease: &Lease) -> Result<()> {
        self.network_delay().await;
        let mut state = self.state.lock();
        Self::check(&state, MockOp::AddLease)?;

        let clash = state
            .network
            .leases
            .iter()
            .any(|l| l.name == lease.name || l.mac == lease.mac || l.ip == lease.ip);
        if clash {
            return Err(HypervisorError::command_failed(
                "net-update",
                format!("there is an existing dhcp host entry matching {}", lease.name),
            ));
        }
        state.network.leases.push(lease.clone());
        state.lease_updates += 1;
        Ok(())
    }

    async fn remove_lease(&self, lease: &Lease) -> Result<()> {
        self.network_delay().await;
        let mut state = self.state.lock();
        Self::check(&state, MockOp::RemoveLease)?;

        let before = state.network.leases.len();
        state.network.leases.retain(|l| l != lease);
        if state.network.leases.len() == before {
            return Err(HypervisorError::command_failed(
                "net-update",
                format!("couldn't locate a matching dhcp host entry for {}", lease.name),
            ));
        }
        state.lease_updates += 1;
        Ok(())
    }
}

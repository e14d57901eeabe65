//! Orchestrator service implementation.
//!
//! This module provides the `Orchestrator` trait and `OrchestratorService`
//! implementation that the API layer drives: VM creation, start/stop, locking,
//! deletion, revision activation and the phone-home ingress.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};
use vmfleet_core::{SecretUuid, VmName};
use vmfleet_hypervisor::{DomainState, Hypervisor};
use vmfleet_store::{RunState, Store, VmDatabaseEntry};

use crate::error::{ControlError, Result};
use crate::leases::LeaseSynchronizer;
use crate::lifecycle;
use crate::payload::{BootPayload, JsonBootPayload};
use crate::phone_home::{PhoneCall, PhoneHomeBus};
use crate::provision::{disk_volume_name, payload_volume_name, Provisioner};
use crate::reconcile::{Reconciler, RestoreReport};
use crate::types::{ControlConfig, CreateVmRequest};

/// Trait defining the orchestrator operations.
///
/// Operations taking a `&str` name address the active revision of that
/// logical name, or exactly one revision when written as `name-rN`.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    // =========================================================================
    // Provisioning
    // =========================================================================

    /// Provision a new VM. Blocks until the VM has booted twice and
    /// confirmed both boots, which can take minutes.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::InvalidName` or `ControlError::AlreadyExists`
    /// before touching anything, or the error of the failed provisioning step
    /// after rolling everything back.
    async fn create_vm(&self, request: CreateVmRequest) -> Result<VmDatabaseEntry>;

    /// Delete a VM with its domain, volumes, lease and cold state.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Locked` if the VM is locked.
    async fn delete_by_name(&self, name: &str) -> Result<()>;

    /// Mark one revision active and every other revision of its name inactive.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::NotFound` if the revision does not exist.
    async fn activate(&self, name: &VmName) -> Result<()>;

    /// List every stored VM revision.
    async fn list_vms(&self) -> Result<Vec<VmDatabaseEntry>>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Boot a stopped VM and wait for it to phone home.
    async fn start_by_name(&self, name: &str) -> Result<()>;

    /// Shut down a running VM and wait for it to power off.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Locked` if the VM is locked.
    async fn stop_by_name(&self, name: &str) -> Result<()>;

    /// Set or clear the operator lock.
    async fn lock_unlock(&self, name: &str, locked: bool) -> Result<()>;

    // =========================================================================
    // Phone-home
    // =========================================================================

    /// Accept a phone-home call.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::UnknownCaller` if the secret belongs neither to
    /// a stored VM nor to one being provisioned.
    async fn receive_call(&self, call: PhoneCall) -> Result<()>;
}

/// Names being provisioned, with the secret each one was minted.
type InFlight = Mutex<HashMap<String, SecretUuid>>;

/// Holds a logical name for the duration of a provisioning.
struct NameReservation<'a> {
    in_flight: &'a InFlight,
    name: String,
}

impl Drop for NameReservation<'_> {
    fn drop(&mut self) {
        self.in_flight.lock().remove(&self.name);
    }
}

/// The main orchestrator service implementation.
pub struct OrchestratorService<H, S> {
    hypervisor: Arc<H>,
    store: Arc<S>,
    bus: Arc<PhoneHomeBus>,
    leases: Arc<LeaseSynchronizer<H, S>>,
    payload: Arc<dyn BootPayload>,
    config: ControlConfig,
    /// Guards every read-modify-write of the identity database.
    in_flight: InFlight,
}

impl<H: Hypervisor + 'static, S: Store + 'static> OrchestratorService<H, S> {
    /// Create a new orchestrator using the JSON boot payload.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(hypervisor: Arc<H>, store: Arc<S>, config: ControlConfig) -> Self {
        let leases = Arc::new(LeaseSynchronizer::new(
            Arc::clone(&hypervisor),
            Arc::clone(&store),
            config.domain_prefix.clone(),
        ));
        Self {
            hypervisor,
            store,
            bus: Arc::new(PhoneHomeBus::new()),
            leases,
            payload: Arc::new(JsonBootPayload),
            config,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the boot payload generator.
    #[must_use]
    pub fn with_payload(mut self, payload: Arc<dyn BootPayload>) -> Self {
        self.payload = payload;
        self
    }

    /// Get a reference to the store.
    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Get the configuration.
    #[must_use]
    pub const fn config(&self) -> &ControlConfig {
        &self.config
    }

    /// Get the phone-home bus.
    #[must_use]
    pub fn bus(&self) -> &PhoneHomeBus {
        &self.bus
    }

    /// Get the lease synchronizer.
    #[must_use]
    pub fn leases(&self) -> &LeaseSynchronizer<H, S> {
        &self.leases
    }

    /// Build a reconciler sharing this service's collaborators.
    #[must_use]
    pub fn reconciler(&self) -> Reconciler<H, S> {
        Reconciler::new(
            Arc::clone(&self.hypervisor),
            Arc::clone(&self.store),
            Arc::clone(&self.bus),
            self.config.clone(),
        )
    }

    /// Synchronize leases and restore the cold state. Run once at startup.
    ///
    /// # Errors
    ///
    /// Returns an error if leases cannot be synchronized or states cannot be
    /// read or written.
    pub async fn startup(&self) -> Result<RestoreReport> {
        let report = self.leases.sync().await?;
        info!(added = report.added, removed = report.removed, "Synchronized leases");
        self.reconciler().restore().await
    }

    /// Resolve a name to a stored entry.
    fn resolve(&self, name: &str) -> Result<VmDatabaseEntry> {
        let parsed: VmName = name.parse()?;
        if parsed.revision() > 0 {
            return self
                .store
                .get_entry(&parsed)?
                .ok_or_else(|| ControlError::NotFound(name.to_string()));
        }

        self.store
            .list_revisions(parsed.name())?
            .into_iter()
            .find(|e| e.active)
            .ok_or_else(|| ControlError::NotFound(name.to_string()))
    }

    fn domain(&self, entry: &VmDatabaseEntry) -> String {
        entry.domain_name(&self.config.domain_prefix)
    }

    /// Check the name is free (or may take a new revision) and reserve it.
    fn reserve(
        &self,
        request: &CreateVmRequest,
        secret: SecretUuid,
    ) -> Result<(VmName, bool, NameReservation<'_>)> {
        let base = VmName::new(request.config.name.clone(), 0)?;

        let mut in_flight = self.in_flight.lock();
        if in_flight.contains_key(base.name()) {
            return Err(ControlError::AlreadyExists(base.name().to_string()));
        }

        let revisions = self.store.list_revisions(base.name())?;
        let (revision, active) = match revisions.last() {
            None => (0, true),
            Some(_) if !request.new_revision => {
                return Err(ControlError::AlreadyExists(base.name().to_string()));
            }
            Some(latest) => (
                latest.name.revision() + 1,
                !revisions.iter().any(|e| e.active),
            ),
        };

        in_flight.insert(base.name().to_string(), secret);
        let reservation = NameReservation {
            in_flight: &self.in_flight,
            name: base.name().to_string(),
        };
        Ok((base.with_revision(revision), active, reservation))
    }
}

#[async_trait]
impl<H: Hypervisor + 'static, S: Store + 'static> Orchestrator for OrchestratorService<H, S> {
    // =========================================================================
    // Provisioning
    // =========================================================================

    async fn create_vm(&self, request: CreateVmRequest) -> Result<VmDatabaseEntry> {
        let secret = SecretUuid::generate();
        let (name, active, _reservation) = self.reserve(&request, secret)?;

        let provisioner = Provisioner {
            hypervisor: self.hypervisor.as_ref(),
            store: self.store.as_ref(),
            bus: &self.bus,
            leases: &self.leases,
            payload: self.payload.as_ref(),
            config: &self.config,
        };
        provisioner
            .provision(name, request.config, secret, active)
            .await
    }

    async fn delete_by_name(&self, name: &str) -> Result<()> {
        let entry = self.resolve(name)?;
        if entry.vm.locked {
            return Err(ControlError::Locked(entry.name.id()));
        }
        let domain = self.domain(&entry);

        match self.hypervisor.domain_state(&domain).await {
            Ok(state) => {
                if state != DomainState::ShutOff {
                    self.hypervisor.destroy_domain(&domain).await?;
                }
                self.hypervisor.undefine_domain(&domain).await?;
            }
            Err(e) if e.is_not_found() => {
                warn!(vm = %entry.name, domain = %domain, "Domain already gone");
            }
            Err(e) => return Err(e.into()),
        }

        for volume in [disk_volume_name(&domain), payload_volume_name(&domain)] {
            match self.hypervisor.delete_volume(&volume).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!(vm = %entry.name, volume = %volume, "Volume already gone");
                }
                Err(e) => return Err(e.into()),
            }
        }

        {
            let _guard = self.in_flight.lock();
            self.store.delete_entry(&entry.name)?;
        }
        info!(vm = %entry.name, domain = %domain, "Deleted VM");

        self.leases.sync().await?;
        Ok(())
    }

    async fn activate(&self, name: &VmName) -> Result<()> {
        let _guard = self.in_flight.lock();

        let revisions = self.store.list_revisions(name.name())?;
        if !revisions.iter().any(|e| e.name == *name) {
            return Err(ControlError::NotFound(name.id()));
        }

        for mut entry in revisions {
            let active = entry.name == *name;
            if entry.active != active {
                entry.active = active;
                self.store.put_entry(&entry)?;
            }
        }

        info!(vm = %name, "Activated revision");
        Ok(())
    }

    async fn list_vms(&self) -> Result<Vec<VmDatabaseEntry>> {
        Ok(self.store.list_entries()?)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn start_by_name(&self, name: &str) -> Result<()> {
        let entry = self.resolve(name)?;
        let domain = self.domain(&entry);

        lifecycle::start(
            self.hypervisor.as_ref(),
            &self.bus,
            &domain,
            &entry.vm.secret_uuid,
            self.config.start_timeout,
            self.config.poll_interval,
        )
        .await?;

        self.store.set_run_state(&entry.name, RunState::Up)?;
        Ok(())
    }

    async fn stop_by_name(&self, name: &str) -> Result<()> {
        let entry = self.resolve(name)?;
        if entry.vm.locked {
            return Err(ControlError::Locked(entry.name.id()));
        }
        let domain = self.domain(&entry);

        lifecycle::stop(
            self.hypervisor.as_ref(),
            &domain,
            self.config.stop_timeout,
            self.config.poll_interval,
        )
        .await?;

        self.store.set_run_state(&entry.name, RunState::Down)?;
        Ok(())
    }

    async fn lock_unlock(&self, name: &str, locked: bool) -> Result<()> {
        let _guard = self.in_flight.lock();

        let mut entry = self.resolve(name)?;
        if entry.vm.locked != locked {
            entry.vm.locked = locked;
            self.store.put_entry(&entry)?;
        }

        info!(vm = %entry.name, locked, "Updated lock");
        Ok(())
    }

    // =========================================================================
    // Phone-home
    // =========================================================================

    async fn receive_call(&self, call: PhoneCall) -> Result<()> {
        {
            let in_flight = self.in_flight.lock();
            if let Some(mut entry) = self.store.find_by_secret(&call.secret_uuid)? {
                entry.vm.last_ip = Some(call.remote_ip);
                self.store.put_entry(&entry)?;
                info!(vm = %entry.name, remote_ip = %call.remote_ip, "Phone-home from VM");
            } else if in_flight.values().any(|s| *s == call.secret_uuid) {
                info!(remote_ip = %call.remote_ip, "Phone-home from VM being provisioned");
            } else {
                warn!(remote_ip = %call.remote_ip, "Rejected phone-home with unknown secret");
                return Err(ControlError::UnknownCaller);
            }
        }

        self.bus.broadcast(call);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;
    use std::sync::Weak;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::sleep;
    use vmfleet_hypervisor::{BootEvent, MockHypervisor, MockOp};
    use vmfleet_store::{RocksStore, VmConfig};

    use crate::payload::secret_from_json_payload;

    type Service = OrchestratorService<MockHypervisor, RocksStore>;

    fn setup() -> (Arc<Service>, Arc<MockHypervisor>, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let hypervisor = Arc::new(MockHypervisor::new());
        hypervisor.add_volume("debian-12", b"seed");

        let config = ControlConfig {
            boot_timeout: Duration::from_secs(60),
            confirm_timeout: Duration::from_secs(30),
            start_timeout: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(30),
            ..Default::default()
        };
        let service = Arc::new(OrchestratorService::new(
            Arc::clone(&hypervisor),
            store,
            config,
        ));
        guest_phones_home(&service, &hypervisor);
        (service, hypervisor, dir)
    }

    /// Every boot phones home through `receive_call` two seconds later; the
    /// first boot of a domain then powers itself off.
    fn guest_phones_home(service: &Arc<Service>, hypervisor: &Arc<MockHypervisor>) {
        let service: Weak<Service> = Arc::downgrade(service);
        let hv: Weak<MockHypervisor> = Arc::downgrade(hypervisor);
        hypervisor.on_boot(Arc::new(move |event: BootEvent| {
            let Some(secret) = event.payload.as_deref().and_then(secret_from_json_payload) else {
                return;
            };
            let service = service.clone();
            let hv = hv.clone();
            tokio::spawn(async move {
                sleep(Duration::from_secs(2)).await;
                let (Some(service), Some(hv)) = (service.upgrade(), hv.upgrade()) else {
                    return;
                };
                let call = PhoneCall {
                    secret_uuid: secret,
                    remote_ip: "10.104.0.100".parse().unwrap(),
                    cloud_init: event.boot_count == 1,
                };
                service.receive_call(call).await.unwrap();
                if event.boot_count == 1 {
                    sleep(Duration::from_secs(1)).await;
                    hv.set_domain_state(&event.domain, DomainState::ShutOff);
                }
            });
        }));
    }

    fn web1() -> VmConfig {
        let mut config = VmConfig::new("web1", "debian-12");
        config.disk_size_bytes = 20 * VmConfig::GIB;
        config.ram_mb = 2048;
        config.cpu_count = 2;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn create_vm_success() {
        let (service, hypervisor, _dir) = setup();

        let entry = service
            .create_vm(CreateVmRequest::new(web1()))
            .await
            .unwrap();

        assert_eq!(entry.name.id(), "web1");
        assert!(entry.vm.last_ip.is_some());
        assert_eq!(hypervisor.domain_names(), vec!["vmf-web1"]);
        assert_eq!(
            service.store().load_run_states().unwrap().get("web1"),
            Some(&RunState::Up)
        );
        assert_eq!(service.list_vms().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn create_rejects_invalid_and_duplicate_names() {
        let (service, hypervisor, _dir) = setup();

        let result = service
            .create_vm(CreateVmRequest::new(VmConfig::new("9lives", "debian-12")))
            .await;
        assert!(matches!(result, Err(ControlError::InvalidName(_))));

        service.create_vm(CreateVmRequest::new(web1())).await.unwrap();
        let updates = hypervisor.lease_updates();

        let result = service.create_vm(CreateVmRequest::new(web1())).await;
        assert!(matches!(result, Err(ControlError::AlreadyExists(_))));
        assert_eq!(hypervisor.lease_updates(), updates);
        assert_eq!(hypervisor.domain_names(), vec!["vmf-web1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_creates_of_one_name_are_serialized() {
        let (service, hypervisor, _dir) = setup();

        let (a, b) = tokio::join!(
            service.create_vm(CreateVmRequest::new(web1())),
            service.create_vm(CreateVmRequest::new(web1())),
        );
        assert_eq!([&a, &b].iter().filter(|r| r.is_ok()).count(), 1);
        assert!(matches!(
            a.err().or(b.err()),
            Some(ControlError::AlreadyExists(_))
        ));
        assert_eq!(hypervisor.domain_names(), vec!["vmf-web1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn new_revision_stays_inactive_until_activated() {
        let (service, hypervisor, _dir) = setup();
        service.create_vm(CreateVmRequest::new(web1())).await.unwrap();

        let entry = service
            .create_vm(CreateVmRequest::new_revision(web1()))
            .await
            .unwrap();
        assert_eq!(entry.name.id(), "web1-r1");
        assert!(!entry.active);
        assert_eq!(hypervisor.domain_names(), vec!["vmf-web1", "vmf-web1-r1"]);
        // Both revisions hold a lease.
        assert_eq!(hypervisor.leases().len(), 2);

        // "web1" addresses the active revision.
        service.lock_unlock("web1", true).await.unwrap();
        let revisions = service.store().list_revisions("web1").unwrap();
        assert!(revisions[0].vm.locked);
        assert!(!revisions[1].vm.locked);

        service.activate(&entry.name).await.unwrap();
        let revisions = service.store().list_revisions("web1").unwrap();
        assert!(!revisions[0].active);
        assert!(revisions[1].active);

        assert!(matches!(
            service.activate(&VmName::new("web1", 7).unwrap()).await,
            Err(ControlError::NotFound(_))
        ));
    }

    /// The store does not enforce one active revision per name; only
    /// `activate` restores it.
    #[tokio::test(start_paused = true)]
    async fn activate_repairs_two_active_revisions() {
        let (service, _hypervisor, _dir) = setup();
        service.create_vm(CreateVmRequest::new(web1())).await.unwrap();
        let second = service
            .create_vm(CreateVmRequest::new_revision(web1()))
            .await
            .unwrap();

        let mut forced = second.clone();
        forced.active = true;
        service.store().put_entry(&forced).unwrap();
        let revisions = service.store().list_revisions("web1").unwrap();
        assert_eq!(revisions.iter().filter(|e| e.active).count(), 2);

        service.activate(&second.name).await.unwrap();
        let active: Vec<_> = service
            .store()
            .list_revisions("web1")
            .unwrap()
            .into_iter()
            .filter(|e| e.active)
            .map(|e| e.name.id())
            .collect();
        assert_eq!(active, vec!["web1-r1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_create_releases_name() {
        let (service, hypervisor, _dir) = setup();
        hypervisor.fail_on(MockOp::DefineDomain);

        let result = service.create_vm(CreateVmRequest::new(web1())).await;
        assert!(matches!(result, Err(ControlError::Hypervisor(_))));
        assert!(service.list_vms().await.unwrap().is_empty());
        assert_eq!(hypervisor.volume_names(), vec!["debian-12"]);

        hypervisor.clear_failures();
        service.create_vm(CreateVmRequest::new(web1())).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_caller_is_not_broadcast() {
        let (service, _hypervisor, _dir) = setup();
        let mut subscription = service.bus().register();

        let result = service
            .receive_call(PhoneCall {
                secret_uuid: SecretUuid::generate(),
                remote_ip: "10.104.0.200".parse().unwrap(),
                cloud_init: false,
            })
            .await;
        assert!(matches!(result, Err(ControlError::UnknownCaller)));

        let received = tokio::time::timeout(Duration::from_secs(1), subscription.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn phone_home_updates_last_ip() {
        let (service, _hypervisor, _dir) = setup();
        let entry = service.create_vm(CreateVmRequest::new(web1())).await.unwrap();

        let new_ip: IpAddr = "10.104.0.77".parse().unwrap();
        let call = PhoneCall {
            secret_uuid: entry.vm.secret_uuid,
            remote_ip: new_ip,
            cloud_init: false,
        };
        service.receive_call(call.clone()).await.unwrap();
        service.receive_call(call).await.unwrap();

        let stored = service.store().get_entry(&entry.name).unwrap().unwrap();
        assert_eq!(stored.vm.last_ip, Some(new_ip));
    }

    #[tokio::test(start_paused = true)]
    async fn stop_and_start_update_cold_state() {
        let (service, hypervisor, _dir) = setup();
        service.create_vm(CreateVmRequest::new(web1())).await.unwrap();

        service.stop_by_name("web1").await.unwrap();
        assert_eq!(
            hypervisor.domain_state("vmf-web1").await.unwrap(),
            DomainState::ShutOff
        );
        assert_eq!(
            service.store().load_run_states().unwrap().get("web1"),
            Some(&RunState::Down)
        );

        service.start_by_name("web1").await.unwrap();
        assert_eq!(hypervisor.boot_count("vmf-web1"), 3);
        assert_eq!(
            service.store().load_run_states().unwrap().get("web1"),
            Some(&RunState::Up)
        );

        assert!(matches!(
            service.start_by_name("nope").await,
            Err(ControlError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn lock_blocks_stop_and_delete() {
        let (service, hypervisor, _dir) = setup();
        service.create_vm(CreateVmRequest::new(web1())).await.unwrap();
        service.lock_unlock("web1", true).await.unwrap();

        assert!(matches!(
            service.stop_by_name("web1").await,
            Err(ControlError::Locked(_))
        ));
        assert!(matches!(
            service.delete_by_name("web1").await,
            Err(ControlError::Locked(_))
        ));
        assert_eq!(
            hypervisor.domain_state("vmf-web1").await.unwrap(),
            DomainState::Running
        );

        service.lock_unlock("web1", false).await.unwrap();
        service.stop_by_name("web1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delete_releases_everything() {
        let (service, hypervisor, _dir) = setup();
        let entry = service.create_vm(CreateVmRequest::new(web1())).await.unwrap();

        service.delete_by_name("web1").await.unwrap();

        assert!(hypervisor.domain_names().is_empty());
        assert_eq!(hypervisor.volume_names(), vec!["debian-12"]);
        assert!(hypervisor.leases().is_empty());
        assert!(service.list_vms().await.unwrap().is_empty());
        assert!(service.store().load_run_states().unwrap().is_empty());
        assert!(matches!(
            service
                .receive_call(PhoneCall {
                    secret_uuid: entry.vm.secret_uuid,
                    remote_ip: "10.104.0.100".parse().unwrap(),
                    cloud_init: false,
                })
                .await,
            Err(ControlError::UnknownCaller)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn startup_restores_cold_state() {
        let (service, hypervisor, _dir) = setup();
        service.create_vm(CreateVmRequest::new(web1())).await.unwrap();

        // Simulate the host rebooting while the daemon was down.
        hypervisor.set_domain_state("vmf-web1", DomainState::ShutOff);

        let report = service.startup().await.unwrap();
        assert_eq!(report.started, vec!["web1"]);
        assert_eq!(
            hypervisor.domain_state("vmf-web1").await.unwrap(),
            DomainState::Running
        );
    }
}

//! Provisioning transaction engine.
//!
//! Turning a `VmConfig` into a running VM takes several hypervisor steps. Each
//! step that allocates something pushes its undo action onto the
//! transaction; if any later step fails the stack is unwound in reverse, and
//! once the transaction commits nothing is undone.
//!
//! ```text
//! reserve lease ─▶ clone disk ─▶ resize ─▶ upload payload ─▶ define domain
//!                                                                │
//!      persist ◀── second boot + phone-home ◀── first boot + phone-home + shutoff
//! ```

use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use vmfleet_core::{SecretUuid, VmName};
use vmfleet_hypervisor::{DomainSpec, DomainState, Hypervisor};
use vmfleet_store::{RunState, Store, Vm, VmConfig, VmDatabaseEntry};

use crate::error::{ControlError, Result};
use crate::leases::LeaseSynchronizer;
use crate::lifecycle::{wait_for_boot, BootGoal};
use crate::payload::{payload_variables, BootPayload};
use crate::phone_home::{PhoneCall, PhoneHomeBus};
use crate::types::ControlConfig;

/// A compensating action registered by a completed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoAction {
    /// Drop a transient lease and resynchronize.
    ReleaseLease(String),
    /// Delete a volume.
    DeleteVolume(String),
    /// Power off (if needed) and undefine a domain.
    UndefineDomain(String),
    /// Remove an identity entry written before commit.
    DeleteEntry(VmName),
}

/// Ordered undo stack guarded by a commit flag.
#[derive(Debug, Default)]
pub struct Transaction {
    undo: Vec<UndoAction>,
    committed: bool,
}

impl Transaction {
    /// Start an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the undo action for a step that just succeeded.
    pub fn push(&mut self, action: UndoAction) {
        self.undo.push(action);
    }

    /// Mark the transaction as committed; rollback becomes a no-op.
    pub fn commit(&mut self) {
        self.committed = true;
    }

    /// Check whether the transaction has been committed.
    #[must_use]
    pub const fn is_committed(&self) -> bool {
        self.committed
    }

    /// Registered actions, oldest first.
    #[must_use]
    pub fn actions(&self) -> &[UndoAction] {
        &self.undo
    }

    /// Undo every registered step in reverse order.
    ///
    /// Failures are logged and do not stop the remaining actions.
    pub async fn rollback<H: Hypervisor, S: Store>(
        mut self,
        hypervisor: &H,
        store: &S,
        leases: &LeaseSynchronizer<H, S>,
    ) {
        if self.committed {
            return;
        }

        while let Some(action) = self.undo.pop() {
            info!(?action, "Rolling back");
            if let Err(e) = undo(&action, hypervisor, store, leases).await {
                error!(?action, error = %e, "Rollback action failed");
            }
        }
    }
}

async fn undo<H: Hypervisor, S: Store>(
    action: &UndoAction,
    hypervisor: &H,
    store: &S,
    leases: &LeaseSynchronizer<H, S>,
) -> Result<()> {
    match action {
        UndoAction::ReleaseLease(domain) => {
            leases.release_transient(domain);
            leases.sync().await?;
        }
        UndoAction::DeleteVolume(volume) => {
            hypervisor.delete_volume(volume).await?;
        }
        UndoAction::UndefineDomain(domain) => {
            let state = hypervisor.domain_state(domain).await?;
            if state != DomainState::ShutOff {
                hypervisor.destroy_domain(domain).await?;
            }
            hypervisor.undefine_domain(domain).await?;
        }
        UndoAction::DeleteEntry(name) => {
            store.delete_entry(name)?;
        }
    }
    Ok(())
}

/// Volume name of a domain's main disk.
#[must_use]
pub fn disk_volume_name(domain: &str) -> String {
    format!("{domain}.qcow2")
}

/// Volume name of a domain's boot payload.
#[must_use]
pub fn payload_volume_name(domain: &str) -> String {
    format!("{domain}-payload.img")
}

/// Everything the engine needs, borrowed from the owning service.
pub struct Provisioner<'a, H, S> {
    /// Hypervisor collaborator.
    pub hypervisor: &'a H,
    /// Identity and cold-state database.
    pub store: &'a S,
    /// Phone-home bus.
    pub bus: &'a PhoneHomeBus,
    /// Lease synchronizer.
    pub leases: &'a LeaseSynchronizer<H, S>,
    /// Boot payload generator.
    pub payload: &'a dyn BootPayload,
    /// Orchestrator configuration.
    pub config: &'a ControlConfig,
}

impl<H: Hypervisor, S: Store> Provisioner<'_, H, S> {
    /// Provision `name` from `config` as an all-or-nothing transaction.
    ///
    /// The caller must already have checked that `name` is free in the
    /// identity database; this also refuses names whose domain exists.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::AlreadyExists` before touching anything if the
    /// domain exists. Any later error is returned after everything allocated
    /// so far has been rolled back.
    pub async fn provision(
        &self,
        name: VmName,
        config: VmConfig,
        secret: SecretUuid,
        active: bool,
    ) -> Result<VmDatabaseEntry> {
        let domain = name.domain_name(&self.config.domain_prefix);
        if self.hypervisor.domain_exists(&domain).await? {
            return Err(ControlError::AlreadyExists(domain));
        }

        info!(vm = %name, domain = %domain, seed = %config.seed, "Provisioning VM");

        let mut tx = Transaction::new();
        match self
            .run(&mut tx, &domain, name.clone(), config, secret, active)
            .await
        {
            Ok(entry) => {
                tx.commit();
                info!(vm = %name, domain = %domain, ip = ?entry.vm.last_ip, "Provisioned VM");
                Ok(entry)
            }
            Err(e) => {
                error!(vm = %name, domain = %domain, error = %e, "Provisioning failed, rolling back");
                tx.rollback(self.hypervisor, self.store, self.leases).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        tx: &mut Transaction,
        domain: &str,
        name: VmName,
        config: VmConfig,
        secret: SecretUuid,
        active: bool,
    ) -> Result<VmDatabaseEntry> {
        let lease = self.leases.reserve_transient(domain).await?;
        tx.push(UndoAction::ReleaseLease(domain.to_string()));

        let disk_name = disk_volume_name(domain);
        let disk = self.hypervisor.clone_volume(&config.seed, &disk_name).await?;
        tx.push(UndoAction::DeleteVolume(disk_name.clone()));

        self.hypervisor
            .resize_volume(&disk_name, config.disk_size_bytes)
            .await?;

        let variables = payload_variables(&config, &secret, &self.config.phone_home_url);
        let bytes = self.payload.generate(&name, &variables)?;
        let payload_name = payload_volume_name(domain);
        let payload = self.hypervisor.upload_volume(&payload_name, &bytes).await?;
        tx.push(UndoAction::DeleteVolume(payload_name));

        let spec = DomainSpec {
            name: domain.to_string(),
            memory_mb: config.ram_mb,
            vcpus: config.cpu_count,
            disk,
            payload,
            mac: lease.mac.clone(),
            network: self
                .leases
                .cached_network()
                .map(|n| n.name)
                .ok_or_else(|| ControlError::Internal("network not loaded".to_string()))?,
        };
        let libvirt_uuid = self.hypervisor.define_domain(&spec).await?;
        tx.push(UndoAction::UndefineDomain(domain.to_string()));

        let first = self
            .boot(domain, &secret, BootGoal::PhoneHomeThenShutOff, self.config.boot_timeout)
            .await?;
        let second = self
            .boot(domain, &secret, BootGoal::PhoneHome, self.config.confirm_timeout)
            .await?;
        if first.remote_ip != second.remote_ip {
            warn!(
                domain = %domain,
                first_ip = %first.remote_ip,
                second_ip = %second.remote_ip,
                "Address changed between boots"
            );
        }

        let entry = VmDatabaseEntry {
            name: name.clone(),
            vm: Vm {
                libvirt_uuid,
                secret_uuid: secret,
                config,
                assigned_mac: lease.mac,
                assigned_ip: lease.ip,
                last_ip: Some(second.remote_ip),
                locked: false,
                created_at: Utc::now(),
            },
            active,
        };
        self.store.put_entry(&entry)?;
        tx.push(UndoAction::DeleteEntry(name));
        self.store.set_run_state(&entry.name, RunState::Up)?;

        // The stored entry now carries the lease.
        self.leases.release_transient(domain);
        if let Err(e) = self.leases.sync().await {
            warn!(domain = %domain, error = %e, "Lease sync after provisioning failed");
        }

        Ok(entry)
    }

    async fn boot(
        &self,
        domain: &str,
        secret: &SecretUuid,
        goal: BootGoal,
        timeout: Duration,
    ) -> Result<PhoneCall> {
        let mut subscription = self.bus.register();
        self.hypervisor.start_domain(domain).await?;
        info!(domain = %domain, ?goal, "Booted domain");

        wait_for_boot(
            self.hypervisor,
            &mut subscription,
            domain,
            secret,
            goal,
            timeout,
            self.config.poll_interval,
        )
        .await
        .map_err(|e| match e {
            ControlError::Timeout(_) => ControlError::Timeout(format!("provisioning of {domain}")),
            other => other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::time::{sleep, Instant};
    use vmfleet_hypervisor::{BootEvent, MockHypervisor, MockOp};
    use vmfleet_store::{RocksStore, RunStates, StoreError};

    use crate::payload::{secret_from_json_payload, JsonBootPayload};

    struct Fixture {
        hypervisor: Arc<MockHypervisor>,
        store: Arc<RocksStore>,
        bus: Arc<PhoneHomeBus>,
        leases: LeaseSynchronizer<MockHypervisor, RocksStore>,
        config: ControlConfig,
        _dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = Arc::new(RocksStore::open(dir.path()).unwrap());
            let hypervisor = Arc::new(MockHypervisor::new());
            hypervisor.add_volume("debian-12", b"seed");
            let leases =
                LeaseSynchronizer::new(Arc::clone(&hypervisor), Arc::clone(&store), "vmf-");
            Self {
                hypervisor,
                store,
                bus: Arc::new(PhoneHomeBus::new()),
                leases,
                config: ControlConfig {
                    boot_timeout: Duration::from_secs(60),
                    confirm_timeout: Duration::from_secs(30),
                    ..ControlConfig::default()
                },
                _dir: dir,
            }
        }

        fn provisioner(&self) -> Provisioner<'_, MockHypervisor, RocksStore> {
            Provisioner {
                hypervisor: self.hypervisor.as_ref(),
                store: self.store.as_ref(),
                bus: &self.bus,
                leases: &self.leases,
                payload: &JsonBootPayload,
                config: &self.config,
            }
        }

        fn well_behaved_guest(&self) {
            well_behaved_guest(&self.hypervisor, &self.bus);
        }

        fn assert_nothing_left(&self) {
            assert!(self.hypervisor.domain_names().is_empty());
            assert_eq!(self.hypervisor.volume_names(), vec!["debian-12"]);
            assert!(self.hypervisor.leases().is_empty());
            assert!(self.store.list_entries().unwrap().is_empty());
            assert!(self.leases.transient_leases().is_empty());
        }
    }

    /// Behave like a well-formed guest: phone home within two seconds
    /// of every boot and power off after the first one.
    fn well_behaved_guest(hypervisor: &Arc<MockHypervisor>, bus: &Arc<PhoneHomeBus>) {
        let bus = Arc::clone(bus);
        let hv = Arc::clone(hypervisor);
        hypervisor.on_boot(Arc::new(move |event: BootEvent| {
            let Some(secret) = event.payload.as_deref().and_then(secret_from_json_payload) else {
                return;
            };
            let bus = Arc::clone(&bus);
            let hv = Arc::clone(&hv);
            tokio::spawn(async move {
                sleep(Duration::from_secs(2)).await;
                bus.broadcast(PhoneCall {
                    secret_uuid: secret,
                    remote_ip: "10.104.0.100".parse().unwrap(),
                    cloud_init: event.boot_count == 1,
                });
                if event.boot_count == 1 {
                    sleep(Duration::from_secs(3)).await;
                    hv.set_domain_state(&event.domain, DomainState::ShutOff);
                }
            });
        }));
    }

    /// Delegates to `RocksStore` but cannot record run states.
    struct NoRunStates(RocksStore);

    impl Store for NoRunStates {
        fn put_entry(&self, entry: &VmDatabaseEntry) -> vmfleet_store::Result<()> {
            self.0.put_entry(entry)
        }

        fn get_entry(&self, name: &VmName) -> vmfleet_store::Result<Option<VmDatabaseEntry>> {
            self.0.get_entry(name)
        }

        fn delete_entry(&self, name: &VmName) -> vmfleet_store::Result<()> {
            self.0.delete_entry(name)
        }

        fn list_entries(&self) -> vmfleet_store::Result<Vec<VmDatabaseEntry>> {
            self.0.list_entries()
        }

        fn find_by_secret(
            &self,
            secret: &SecretUuid,
        ) -> vmfleet_store::Result<Option<VmDatabaseEntry>> {
            self.0.find_by_secret(secret)
        }

        fn load_run_states(&self) -> vmfleet_store::Result<RunStates> {
            self.0.load_run_states()
        }

        fn save_run_states(&self, states: &RunStates) -> vmfleet_store::Result<()> {
            self.0.save_run_states(states)
        }

        fn set_run_state(&self, _: &VmName, _: RunState) -> vmfleet_store::Result<()> {
            Err(StoreError::Database("no space left on device".into()))
        }
    }

    fn web1() -> VmConfig {
        let mut config = VmConfig::new("web1", "debian-12");
        config.disk_size_bytes = 20 * VmConfig::GIB;
        config.ram_mb = 2048;
        config.cpu_count = 2;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn provision_success() {
        let f = Fixture::new();
        f.well_behaved_guest();

        let name = VmName::new("web1", 0).unwrap();
        let entry = f
            .provisioner()
            .provision(name.clone(), web1(), SecretUuid::generate(), true)
            .await
            .unwrap();

        assert_eq!(entry.vm.last_ip, Some("10.104.0.100".parse().unwrap()));
        assert!(entry.active);
        assert_eq!(f.hypervisor.domain_names(), vec!["vmf-web1"]);
        assert_eq!(
            f.hypervisor.volume_names(),
            vec!["debian-12", "vmf-web1-payload.img", "vmf-web1.qcow2"]
        );
        assert_eq!(f.hypervisor.boot_count("vmf-web1"), 2);

        let spec = f.hypervisor.domain_spec("vmf-web1").unwrap();
        assert_eq!(spec.memory_mb, 2048);
        assert_eq!(spec.vcpus, 2);
        assert_eq!(spec.mac, entry.vm.assigned_mac);

        let stored = f.store.get_entry(&name).unwrap().unwrap();
        assert_eq!(stored.vm.secret_uuid, entry.vm.secret_uuid);
        assert_eq!(
            f.store.load_run_states().unwrap().get("web1"),
            Some(&RunState::Up)
        );

        // The transient lease became the VM's persistent lease.
        assert!(f.leases.transient_leases().is_empty());
        let leases = f.hypervisor.leases();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].name, "vmf-web1");
        assert_eq!(leases[0].ip, entry.vm.assigned_ip);
        assert_eq!(f.bus.subscriber_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn guest_reading_shut_off_throughout_is_provisioned() {
        let f = Fixture::new();
        let bus = Arc::clone(&f.bus);
        let hv = Arc::clone(&f.hypervisor);
        // Reads as shut off right after every boot, phones home two seconds in.
        f.hypervisor.on_boot(Arc::new(move |event: BootEvent| {
            hv.set_domain_state(&event.domain, DomainState::ShutOff);
            let Some(secret) = event.payload.as_deref().and_then(secret_from_json_payload) else {
                return;
            };
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                sleep(Duration::from_secs(2)).await;
                bus.broadcast(PhoneCall {
                    secret_uuid: secret,
                    remote_ip: "10.104.0.100".parse().unwrap(),
                    cloud_init: event.boot_count == 1,
                });
            });
        }));

        let entry = f
            .provisioner()
            .provision(
                VmName::new("web1", 0).unwrap(),
                web1(),
                SecretUuid::generate(),
                true,
            )
            .await
            .unwrap();

        assert!(entry.vm.last_ip.is_some());
        assert!(f.store.get_entry(&entry.name).unwrap().is_some());
        assert_eq!(f.hypervisor.domain_names(), vec!["vmf-web1"]);
        assert_eq!(
            f.hypervisor.volume_names(),
            vec!["debian-12", "vmf-web1-payload.img", "vmf-web1.qcow2"]
        );
        assert_eq!(f.hypervisor.boot_count("vmf-web1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_after_entry_is_written_removes_it() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(NoRunStates(RocksStore::open(dir.path()).unwrap()));
        let hypervisor = Arc::new(MockHypervisor::new());
        hypervisor.add_volume("debian-12", b"seed");
        let bus = Arc::new(PhoneHomeBus::new());
        let leases = LeaseSynchronizer::new(Arc::clone(&hypervisor), Arc::clone(&store), "vmf-");
        let config = ControlConfig {
            boot_timeout: Duration::from_secs(60),
            confirm_timeout: Duration::from_secs(30),
            ..ControlConfig::default()
        };
        well_behaved_guest(&hypervisor, &bus);

        let provisioner = Provisioner {
            hypervisor: hypervisor.as_ref(),
            store: store.as_ref(),
            bus: &bus,
            leases: &leases,
            payload: &JsonBootPayload,
            config: &config,
        };
        let result = provisioner
            .provision(
                VmName::new("web1", 0).unwrap(),
                web1(),
                SecretUuid::generate(),
                true,
            )
            .await;

        assert!(matches!(result, Err(ControlError::Store(_))));
        assert!(store.list_entries().unwrap().is_empty());
        assert!(hypervisor.domain_names().is_empty());
        assert_eq!(hypervisor.volume_names(), vec!["debian-12"]);
        assert!(hypervisor.leases().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_at_any_step_rolls_back_everything() {
        for op in [
            MockOp::CloneVolume,
            MockOp::ResizeVolume,
            MockOp::UploadVolume,
            MockOp::DefineDomain,
            MockOp::StartDomain,
        ] {
            let f = Fixture::new();
            f.well_behaved_guest();
            f.hypervisor.fail_on(op);

            let result = f
                .provisioner()
                .provision(
                    VmName::new("web1", 0).unwrap(),
                    web1(),
                    SecretUuid::generate(),
                    true,
                )
                .await;
            assert!(
                matches!(result, Err(ControlError::Hypervisor(_))),
                "{op:?}: {result:?}"
            );
            f.assert_nothing_left();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_guest_times_out_and_leaves_nothing() {
        let f = Fixture::new();

        let began = Instant::now();
        let result = f
            .provisioner()
            .provision(
                VmName::new("web1", 0).unwrap(),
                web1(),
                SecretUuid::generate(),
                true,
            )
            .await;

        assert!(matches!(result, Err(ControlError::Timeout(ref m)) if m.contains("vmf-web1")));
        assert!(began.elapsed() <= f.config.boot_timeout + f.config.poll_interval);
        f.assert_nothing_left();
        assert_eq!(f.bus.subscriber_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutoff_without_phone_home_fails_handshake() {
        let f = Fixture::new();
        let hv = Arc::clone(&f.hypervisor);
        // Powers off a few seconds into the first boot without phoning home.
        f.hypervisor.on_boot(Arc::new(move |event: BootEvent| {
            let hv = Arc::clone(&hv);
            tokio::spawn(async move {
                sleep(Duration::from_secs(3)).await;
                hv.set_domain_state(&event.domain, DomainState::ShutOff);
            });
        }));

        let result = f
            .provisioner()
            .provision(
                VmName::new("web1", 0).unwrap(),
                web1(),
                SecretUuid::generate(),
                true,
            )
            .await;
        assert!(matches!(result, Err(ControlError::HandshakeMissing(_))));
        f.assert_nothing_left();
    }

    #[tokio::test(start_paused = true)]
    async fn crash_during_first_boot_rolls_back_running_domain() {
        let f = Fixture::new();
        let hv = Arc::clone(&f.hypervisor);
        f.hypervisor.on_boot(Arc::new(move |event: BootEvent| {
            hv.set_domain_state(&event.domain, DomainState::Crashed);
        }));

        let result = f
            .provisioner()
            .provision(
                VmName::new("web1", 0).unwrap(),
                web1(),
                SecretUuid::generate(),
                true,
            )
            .await;
        assert!(matches!(result, Err(ControlError::Crashed(_))));
        f.assert_nothing_left();
    }

    #[tokio::test(start_paused = true)]
    async fn second_boot_timeout_rolls_back() {
        let f = Fixture::new();
        let bus = Arc::clone(&f.bus);
        let hv = Arc::clone(&f.hypervisor);
        // Phones home on first boot only.
        f.hypervisor.on_boot(Arc::new(move |event: BootEvent| {
            if event.boot_count > 1 {
                return;
            }
            let Some(secret) = event.payload.as_deref().and_then(secret_from_json_payload) else {
                return;
            };
            bus.broadcast(PhoneCall {
                secret_uuid: secret,
                remote_ip: "10.104.0.100".parse().unwrap(),
                cloud_init: true,
            });
            hv.set_domain_state(&event.domain, DomainState::ShutOff);
        }));

        let result = f
            .provisioner()
            .provision(
                VmName::new("web1", 0).unwrap(),
                web1(),
                SecretUuid::generate(),
                true,
            )
            .await;
        assert!(matches!(result, Err(ControlError::Timeout(_))));
        f.assert_nothing_left();
    }

    #[tokio::test(start_paused = true)]
    async fn existing_domain_is_refused_untouched() {
        let f = Fixture::new();
        f.hypervisor.insert_domain("vmf-web1", DomainState::Running);

        let result = f
            .provisioner()
            .provision(
                VmName::new("web1", 0).unwrap(),
                web1(),
                SecretUuid::generate(),
                true,
            )
            .await;
        assert!(matches!(result, Err(ControlError::AlreadyExists(_))));
        assert_eq!(f.hypervisor.domain_names(), vec!["vmf-web1"]);
        assert_eq!(f.hypervisor.lease_updates(), 0);
    }

    #[tokio::test]
    async fn committed_transaction_is_not_rolled_back() {
        let f = Fixture::new();
        f.hypervisor.add_volume("vmf-x.qcow2", b"disk");

        let mut tx = Transaction::new();
        tx.push(UndoAction::DeleteVolume("vmf-x.qcow2".into()));
        tx.commit();
        assert!(tx.is_committed());
        tx.rollback(f.hypervisor.as_ref(), f.store.as_ref(), &f.leases).await;
        assert!(f.hypervisor.volume_names().contains(&"vmf-x.qcow2".to_string()));
    }

    #[tokio::test]
    async fn rollback_continues_past_failures() {
        let f = Fixture::new();
        f.hypervisor.add_volume("vmf-x.qcow2", b"disk");

        let mut tx = Transaction::new();
        tx.push(UndoAction::DeleteVolume("vmf-x.qcow2".into()));
        tx.push(UndoAction::UndefineDomain("vmf-missing".into()));
        assert_eq!(tx.actions().len(), 2);
        tx.rollback(f.hypervisor.as_ref(), f.store.as_ref(), &f.leases).await;
        assert_eq!(f.hypervisor.volume_names(), vec!["debian-12"]);
    }
}

//! Static DHCP lease synchronization.
//!
//! The hypervisor network must carry exactly one static lease per stored VM
//! plus one per in-flight provisioning (a transient lease). Leases whose name
//! does not start with the domain prefix belong to someone else and are never
//! touched.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};
use vmfleet_hypervisor::{Hypervisor, Lease, NetworkInfo};
use vmfleet_store::Store;

use crate::error::{ControlError, Result};

/// Outcome of one synchronization pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Leases added to the network.
    pub added: usize,
    /// Leases removed from the network.
    pub removed: usize,
}

impl SyncReport {
    /// Check whether the pass changed anything.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Keeps the network's static leases in line with the identity database.
pub struct LeaseSynchronizer<H, S> {
    hypervisor: Arc<H>,
    store: Arc<S>,
    prefix: String,
    transient: Mutex<HashMap<String, Lease>>,
    network: RwLock<Option<NetworkInfo>>,
    sync_lock: tokio::sync::Mutex<()>,
}

impl<H: Hypervisor, S: Store> LeaseSynchronizer<H, S> {
    /// Create a synchronizer for leases named `<prefix>...`.
    #[must_use]
    pub fn new(hypervisor: Arc<H>, store: Arc<S>, prefix: impl Into<String>) -> Self {
        Self {
            hypervisor,
            store,
            prefix: prefix.into(),
            transient: Mutex::new(HashMap::new()),
            network: RwLock::new(None),
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// The network description as of the last synchronization.
    #[must_use]
    pub fn cached_network(&self) -> Option<NetworkInfo> {
        self.network.read().clone()
    }

    /// Currently held transient leases.
    #[must_use]
    pub fn transient_leases(&self) -> Vec<Lease> {
        self.transient.lock().values().cloned().collect()
    }

    /// Leases the network should carry: one per stored VM plus transients.
    fn desired(&self) -> Result<HashMap<String, Lease>> {
        let mut desired: HashMap<String, Lease> = self
            .store
            .list_entries()?
            .into_iter()
            .map(|entry| {
                let name = entry.domain_name(&self.prefix);
                let lease = Lease::new(name.clone(), entry.vm.assigned_mac, entry.vm.assigned_ip);
                (name, lease)
            })
            .collect();

        for (name, lease) in self.transient.lock().iter() {
            desired.entry(name.clone()).or_insert_with(|| lease.clone());
        }

        Ok(desired)
    }

    /// Bring the network's leases in line with the desired set.
    ///
    /// Stale or changed leases are removed first, then missing ones are
    /// added. A second call with nothing changed issues no updates.
    ///
    /// # Errors
    ///
    /// Returns an error if the database or the hypervisor fails. Updates
    /// applied before the failure stay applied and the cached network is
    /// refreshed before the error is returned.
    pub async fn sync(&self) -> Result<SyncReport> {
        let _guard = self.sync_lock.lock().await;

        let desired = self.desired()?;
        let network = self.hypervisor.network_info().await?;

        let current: Vec<&Lease> = network
            .leases
            .iter()
            .filter(|lease| lease.name.starts_with(&self.prefix))
            .collect();

        let to_delete: Vec<&Lease> = current
            .iter()
            .copied()
            .filter(|lease| desired.get(&lease.name) != Some(*lease))
            .collect();

        let to_add: Vec<&Lease> = desired
            .values()
            .filter(|lease| !current.contains(lease))
            .collect();

        let mut report = SyncReport::default();
        let applied = self.apply(&to_delete, &to_add, &mut report).await;

        let refreshed = if report.is_noop() {
            Ok(network)
        } else {
            self.hypervisor.network_info().await
        };
        match refreshed {
            Ok(network) => {
                *self.network.write() = Some(network);
                applied?;
            }
            Err(e) => {
                applied?;
                return Err(e.into());
            }
        }

        debug!(
            added = report.added,
            removed = report.removed,
            "Lease synchronization complete"
        );
        Ok(report)
    }

    /// Removals first, then additions. Stops at the first failure.
    async fn apply(
        &self,
        to_delete: &[&Lease],
        to_add: &[&Lease],
        report: &mut SyncReport,
    ) -> Result<()> {
        for lease in to_delete {
            info!(lease = %lease.name, mac = %lease.mac, ip = %lease.ip, "Removing static lease");
            self.hypervisor.remove_lease(lease).await?;
            report.removed += 1;
        }

        for lease in to_add {
            info!(lease = %lease.name, mac = %lease.mac, ip = %lease.ip, "Adding static lease");
            self.hypervisor.add_lease(lease).await?;
            report.added += 1;
        }
        Ok(())
    }

    /// Reserve an address and MAC for a domain being provisioned and push the
    /// lease to the network.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::AlreadyExists` if the domain already holds a
    /// transient lease, `ControlError::NoFreeAddress` if the DHCP range is
    /// exhausted, or an error from the follow-up synchronization (in which
    /// case the reservation is dropped again).
    pub async fn reserve_transient(&self, domain: &str) -> Result<Lease> {
        let network = match self.cached_network() {
            Some(network) => network,
            None => self.hypervisor.network_info().await?,
        };
        let entries = self.store.list_entries()?;

        let lease = {
            let mut transient = self.transient.lock();
            if transient.contains_key(domain) {
                return Err(ControlError::AlreadyExists(domain.to_string()));
            }

            let used_ips: HashSet<Ipv4Addr> = network
                .leases
                .iter()
                .map(|l| l.ip)
                .chain(entries.iter().map(|e| e.vm.assigned_ip))
                .chain(transient.values().map(|l| l.ip))
                .collect();
            let used_macs: HashSet<&str> = network
                .leases
                .iter()
                .map(|l| l.mac.as_str())
                .chain(entries.iter().map(|e| e.vm.assigned_mac.as_str()))
                .chain(transient.values().map(|l| l.mac.as_str()))
                .collect();

            let ip = network
                .range()
                .find(|ip| !used_ips.contains(ip))
                .ok_or_else(|| ControlError::NoFreeAddress(network.name.clone()))?;
            let mac = loop {
                let mac = random_mac();
                if !used_macs.contains(mac.as_str()) {
                    break mac;
                }
            };

            let lease = Lease::new(domain, mac, ip);
            transient.insert(domain.to_string(), lease.clone());
            lease
        };

        debug!(domain = %domain, ip = %lease.ip, mac = %lease.mac, "Reserved transient lease");

        if let Err(e) = self.sync().await {
            self.transient.lock().remove(domain);
            return Err(e);
        }
        Ok(lease)
    }

    /// Drop a transient lease. The network is updated on the next [`sync`](Self::sync).
    pub fn release_transient(&self, domain: &str) -> Option<Lease> {
        self.transient.lock().remove(domain)
    }
}

/// Generate a locally administered MAC in the QEMU/KVM OUI.
fn random_mac() -> String {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use vmfleet_core::{SecretUuid, VmName};
    use vmfleet_hypervisor::{MockHypervisor, MockOp};
    use vmfleet_store::{RocksStore, Vm, VmConfig, VmDatabaseEntry};

    struct Fixture {
        hypervisor: Arc<MockHypervisor>,
        store: Arc<RocksStore>,
        leases: LeaseSynchronizer<MockHypervisor, RocksStore>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let hypervisor = Arc::new(MockHypervisor::new());
        let leases = LeaseSynchronizer::new(Arc::clone(&hypervisor), Arc::clone(&store), "vmf-");
        Fixture {
            hypervisor,
            store,
            leases,
            _dir: dir,
        }
    }

    fn entry(name: &str, revision: u32, mac: &str, ip: Ipv4Addr) -> VmDatabaseEntry {
        VmDatabaseEntry {
            name: VmName::new(name, revision).unwrap(),
            vm: Vm {
                libvirt_uuid: String::new(),
                secret_uuid: SecretUuid::generate(),
                config: VmConfig::new(name, "debian-12"),
                assigned_mac: mac.to_string(),
                assigned_ip: ip,
                last_ip: None,
                locked: false,
                created_at: chrono::Utc::now(),
            },
            active: true,
        }
    }

    #[tokio::test]
    async fn second_sync_is_a_noop() {
        let f = fixture();
        f.store
            .put_entry(&entry("web1", 0, "52:54:00:00:00:01", Ipv4Addr::new(10, 104, 0, 100)))
            .unwrap();
        f.store
            .put_entry(&entry("web1", 1, "52:54:00:00:00:02", Ipv4Addr::new(10, 104, 0, 101)))
            .unwrap();

        let first = f.leases.sync().await.unwrap();
        assert_eq!(first, SyncReport { added: 2, removed: 0 });
        let updates = f.hypervisor.lease_updates();

        let second = f.leases.sync().await.unwrap();
        assert!(second.is_noop());
        assert_eq!(f.hypervisor.lease_updates(), updates);
        assert_eq!(f.leases.cached_network().unwrap().leases.len(), 2);
    }

    #[tokio::test]
    async fn removes_stale_and_keeps_foreign_leases() {
        let f = fixture();
        let printer = Lease::new("printer", "52:54:00:aa:aa:aa", Ipv4Addr::new(10, 104, 0, 150));
        f.hypervisor.insert_lease(printer.clone());
        f.hypervisor.insert_lease(Lease::new(
            "vmf-gone",
            "52:54:00:bb:bb:bb",
            Ipv4Addr::new(10, 104, 0, 151),
        ));

        let report = f.leases.sync().await.unwrap();
        assert_eq!(report, SyncReport { added: 0, removed: 1 });
        assert_eq!(f.hypervisor.leases(), vec![printer]);
    }

    #[tokio::test]
    async fn changed_address_is_replaced() {
        let f = fixture();
        f.hypervisor.insert_lease(Lease::new(
            "vmf-db",
            "52:54:00:00:00:09",
            Ipv4Addr::new(10, 104, 0, 120),
        ));
        f.store
            .put_entry(&entry("db", 0, "52:54:00:00:00:09", Ipv4Addr::new(10, 104, 0, 121)))
            .unwrap();

        let report = f.leases.sync().await.unwrap();
        assert_eq!(report, SyncReport { added: 1, removed: 1 });
        assert_eq!(
            f.hypervisor.leases()[0].ip,
            Ipv4Addr::new(10, 104, 0, 121)
        );
    }

    #[tokio::test]
    async fn transient_lease_skips_used_addresses() {
        let f = fixture();
        f.hypervisor.insert_lease(Lease::new(
            "printer",
            "52:54:00:aa:aa:aa",
            Ipv4Addr::new(10, 104, 0, 100),
        ));
        f.store
            .put_entry(&entry("web1", 0, "52:54:00:00:00:01", Ipv4Addr::new(10, 104, 0, 101)))
            .unwrap();

        let lease = f.leases.reserve_transient("vmf-web2").await.unwrap();
        assert_eq!(lease.ip, Ipv4Addr::new(10, 104, 0, 102));
        assert!(lease.mac.starts_with("52:54:00:"));
        assert!(f.hypervisor.leases().contains(&lease));

        let other = f.leases.reserve_transient("vmf-web3").await.unwrap();
        assert_eq!(other.ip, Ipv4Addr::new(10, 104, 0, 103));
        assert!(matches!(
            f.leases.reserve_transient("vmf-web3").await,
            Err(ControlError::AlreadyExists(_))
        ));

        assert!(f.leases.release_transient("vmf-web2").is_some());
        f.leases.sync().await.unwrap();
        assert!(!f.hypervisor.leases().contains(&lease));
        assert!(f.hypervisor.leases().contains(&other));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_syncs_add_each_lease_once() {
        let f = fixture();
        f.hypervisor.set_network_latency(Duration::from_millis(100));
        f.store
            .put_entry(&entry("web1", 0, "52:54:00:00:00:01", Ipv4Addr::new(10, 104, 0, 100)))
            .unwrap();
        f.store
            .put_entry(&entry("web2", 0, "52:54:00:00:00:02", Ipv4Addr::new(10, 104, 0, 101)))
            .unwrap();

        let (a, b) = tokio::join!(f.leases.sync(), f.leases.sync());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.added + b.added, 2);
        assert!(a.is_noop() || b.is_noop());
        assert_eq!(f.hypervisor.lease_updates(), 2);
        assert_eq!(f.hypervisor.leases().len(), 2);
    }

    #[tokio::test]
    async fn cache_is_refreshed_when_an_update_fails() {
        let f = fixture();
        f.hypervisor.insert_lease(Lease::new(
            "vmf-gone",
            "52:54:00:bb:bb:bb",
            Ipv4Addr::new(10, 104, 0, 151),
        ));
        f.store
            .put_entry(&entry("web1", 0, "52:54:00:00:00:01", Ipv4Addr::new(10, 104, 0, 100)))
            .unwrap();
        f.hypervisor.fail_on(MockOp::AddLease);

        assert!(f.leases.sync().await.is_err());
        // The removal went through and the cache reflects it.
        assert!(f.hypervisor.leases().is_empty());
        assert!(f.leases.cached_network().unwrap().leases.is_empty());
    }

    #[tokio::test]
    async fn failed_reservation_is_dropped() {
        let f = fixture();
        f.hypervisor.fail_on(MockOp::AddLease);
        assert!(f.leases.reserve_transient("vmf-web1").await.is_err());
        assert!(f.leases.transient_leases().is_empty());
    }
}

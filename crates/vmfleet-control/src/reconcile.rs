//! Cold/hot state reconciliation.
//!
//! The cold state (persisted `up`/`down` per VM) is authoritative across
//! restarts: on startup every active VM whose live state differs is started or
//! stopped to match it. Afterwards the loop only records the live state,
//! writing a new snapshot when something changed.

use std::sync::Arc;

use futures::future::join_all;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use vmfleet_hypervisor::Hypervisor;
use vmfleet_store::{RunState, RunStates, Store, VmDatabaseEntry};

use crate::error::{ControlError, Result};
use crate::lifecycle;
use crate::phone_home::PhoneHomeBus;
use crate::types::ControlConfig;

/// Outcome of a startup restore.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    /// VMs started to match their cold state.
    pub started: Vec<String>,
    /// VMs stopped to match their cold state.
    pub stopped: Vec<String>,
    /// VMs whose correction failed.
    pub failed: Vec<String>,
}

/// Supervises the run state of every active VM.
pub struct Reconciler<H, S> {
    hypervisor: Arc<H>,
    store: Arc<S>,
    bus: Arc<PhoneHomeBus>,
    config: ControlConfig,
}

impl<H: Hypervisor + 'static, S: Store + 'static> Reconciler<H, S> {
    /// Create a new reconciler.
    #[must_use]
    pub fn new(
        hypervisor: Arc<H>,
        store: Arc<S>,
        bus: Arc<PhoneHomeBus>,
        config: ControlConfig,
    ) -> Self {
        Self {
            hypervisor,
            store,
            bus,
            config,
        }
    }

    fn active_entries(&self) -> Result<Vec<VmDatabaseEntry>> {
        Ok(self
            .store
            .list_entries()?
            .into_iter()
            .filter(|e| e.active)
            .collect())
    }

    async fn live_state(&self, entry: &VmDatabaseEntry) -> Result<RunState> {
        let domain = entry.domain_name(&self.config.domain_prefix);
        match self.hypervisor.domain_state(&domain).await {
            Ok(state) if state.is_up() => Ok(RunState::Up),
            Ok(_) => Ok(RunState::Down),
            Err(e) if e.is_not_found() => {
                warn!(vm = %entry.name, domain = %domain, "Domain of stored VM is missing");
                Ok(RunState::Down)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Live run state of every active VM, keyed by `VmName::id()`.
    ///
    /// VMs whose state cannot be read are logged and left out.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be read.
    pub async fn hot_state(&self) -> Result<RunStates> {
        Ok(self.read_live_states().await?.0)
    }

    /// Live states, plus the IDs whose state query failed.
    async fn read_live_states(&self) -> Result<(RunStates, Vec<String>)> {
        let mut states = RunStates::new();
        let mut unreadable = Vec::new();
        for entry in self.active_entries()? {
            match self.live_state(&entry).await {
                Ok(state) => {
                    states.insert(entry.name.id(), state);
                }
                Err(e) => {
                    error!(vm = %entry.name, error = %e, "Could not read domain state");
                    unreadable.push(entry.name.id());
                }
            }
        }
        Ok((states, unreadable))
    }

    /// Snapshot to persist: the live states, with the cold entry kept for
    /// every VM that could not be read.
    async fn snapshot(&self, cold: &RunStates) -> Result<RunStates> {
        let (mut states, unreadable) = self.read_live_states().await?;
        for id in unreadable {
            if let Some(&state) = cold.get(&id) {
                states.insert(id, state);
            }
        }
        Ok(states)
    }

    /// Drive every active VM to its cold state, then persist the result.
    ///
    /// Corrections run concurrently and are all awaited. A VM whose state
    /// cannot be read or whose correction fails is logged, reported as failed
    /// and does not affect the others. VMs without a cold state are left as
    /// they are.
    ///
    /// # Errors
    ///
    /// Returns an error only if the states cannot be read or written.
    pub async fn restore(&self) -> Result<RestoreReport> {
        let cold = self.store.load_run_states()?;
        let entries = self.active_entries()?;

        let mut report = RestoreReport::default();
        let mut corrections = Vec::new();
        for entry in entries {
            let id = entry.name.id();
            let Some(&wanted) = cold.get(&id) else {
                continue;
            };
            let live = match self.live_state(&entry).await {
                Ok(live) => live,
                Err(e) => {
                    error!(vm = %id, error = %e, "Could not read domain state");
                    report.failed.push(id);
                    continue;
                }
            };
            if live == wanted {
                continue;
            }
            info!(vm = %id, cold = %wanted, hot = %live, "Correcting state drift");
            corrections.push(self.correct(entry, wanted));
        }

        for (id, wanted, result) in join_all(corrections).await {
            match result {
                Ok(()) if wanted == RunState::Up => report.started.push(id),
                Ok(()) => report.stopped.push(id),
                Err(e) => {
                    error!(vm = %id, error = %e, "State correction failed");
                    report.failed.push(id);
                }
            }
        }

        let snapshot = self.snapshot(&cold).await?;
        self.store.save_run_states(&snapshot)?;

        info!(
            started = report.started.len(),
            stopped = report.stopped.len(),
            failed = report.failed.len(),
            "Restored cold state"
        );
        Ok(report)
    }

    async fn correct(
        &self,
        entry: VmDatabaseEntry,
        wanted: RunState,
    ) -> (String, RunState, Result<()>) {
        let id = entry.name.id();
        let domain = entry.domain_name(&self.config.domain_prefix);
        let result = match wanted {
            RunState::Up => lifecycle::start(
                self.hypervisor.as_ref(),
                &self.bus,
                &domain,
                &entry.vm.secret_uuid,
                self.config.start_timeout,
                self.config.poll_interval,
            )
            .await
            .map(|_| ()),
            RunState::Down => {
                lifecycle::stop(
                    self.hypervisor.as_ref(),
                    &domain,
                    self.config.stop_timeout,
                    self.config.poll_interval,
                )
                .await
            }
        };
        (id, wanted, result)
    }

    /// Record the live state if it differs from the persisted snapshot.
    ///
    /// Returns whether a new snapshot was written. A VM whose state cannot be
    /// read keeps its persisted state.
    ///
    /// # Errors
    ///
    /// Returns an error if the states cannot be read or written.
    pub async fn refresh(&self) -> Result<bool> {
        let cold = self.store.load_run_states()?;
        let hot = self.snapshot(&cold).await?;
        if hot == cold {
            return Ok(false);
        }

        debug!(vms = hot.len(), "Persisting changed run states");
        self.store.save_run_states(&hot)?;
        Ok(true)
    }

    /// Refresh the cold state every `reconcile_interval`, forever.
    pub async fn run(self: Arc<Self>) {
        let period = self.config.reconcile_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                log_refresh_error(&e);
            }
        }
    }
}

fn log_refresh_error(e: &ControlError) {
    if e.is_retriable() {
        warn!(error = %e, "State refresh failed");
    } else {
        error!(error = %e, "State refresh failed");
    }
}

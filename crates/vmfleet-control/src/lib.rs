//! Orchestrator for a single-host VM fleet.
//!
//! This crate turns a declarative `VmConfig` into a running VM and keeps the
//! fleet where the operator left it. It coordinates the identity database
//! (`vmfleet-store`) with the hypervisor (`vmfleet-hypervisor`).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  API layer (vmfleetd, HTTP)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   OrchestratorService                       │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────┐    │
//! │  │ Provisioner │ │ Phone-home  │ │  Start / stop       │    │
//! │  │ (rollback)  │ │ bus         │ │  primitives         │    │
//! │  └─────────────┘ └─────────────┘ └─────────────────────┘    │
//! │  ┌─────────────┐ ┌─────────────────────────────────────┐    │
//! │  │ Lease sync  │ │ Reconciler (cold vs hot state)      │    │
//! │  └─────────────┘ └─────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                ┌─────────────┴─────────────┐
//!                ▼                           ▼
//!         ┌────────────┐              ┌────────────┐
//!         │   Store    │              │ Hypervisor │
//!         │ (RocksDB)  │              │  (virsh)   │
//!         └────────────┘              └────────────┘
//! ```
//!
//! # Provisioning
//!
//! Creating a VM is an all-or-nothing transaction. Every resource allocated
//! (transient lease, disk, payload volume, domain) pushes an undo action; a
//! failure at any step unwinds them in reverse order. The VM must boot,
//! phone home and power itself off, then boot again and phone home a second
//! time before it is committed to the identity database.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use vmfleet_control::{ControlConfig, CreateVmRequest, Orchestrator, OrchestratorService};
//! use vmfleet_hypervisor::{HypervisorConfig, VirshHypervisor};
//! use vmfleet_store::{RocksStore, VmConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RocksStore::open("/tmp/vmfleet")?);
//! let hypervisor = Arc::new(VirshHypervisor::new(HypervisorConfig::default()));
//! let service = OrchestratorService::new(hypervisor, store, ControlConfig::default());
//!
//! let entry = service
//!     .create_vm(CreateVmRequest::new(VmConfig::new("web1", "debian-12")))
//!     .await?;
//! println!("{} is up at {:?}", entry.name, entry.vm.last_ip);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod leases;
pub mod lifecycle;
pub mod payload;
pub mod phone_home;
pub mod provision;
pub mod reconcile;
pub mod service;
pub mod types;

pub use error::{ControlError, Result};
pub use leases::{LeaseSynchronizer, SyncReport};
pub use payload::{BootPayload, JsonBootPayload};
pub use phone_home::{PhoneCall, PhoneHomeBus, PhoneHomeSubscription};
pub use provision::{Provisioner, Transaction, UndoAction};
pub use reconcile::{Reconciler, RestoreReport};
pub use service::{Orchestrator, OrchestratorService};
pub use types::{ControlConfig, CreateVmRequest};

// Re-export commonly used types from dependencies for convenience
pub use vmfleet_core::{SecretUuid, VmName};
pub use vmfleet_store::{RunState, Vm, VmConfig, VmDatabaseEntry};

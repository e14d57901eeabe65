//! Hypervisor control-plane interface for vmfleet.
//!
//! This crate provides the [`Hypervisor`] trait and the [`VirshHypervisor`]
//! implementation that drives libvirt through `virsh`. It covers:
//!
//! - Domain definition and power management
//! - Storage volume cloning, resizing and upload
//! - Static DHCP host leases on the VM network
//!
//! # Example
//!
//! ```no_run
//! use vmfleet_hypervisor::{Hypervisor, HypervisorConfig, VirshHypervisor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hypervisor = VirshHypervisor::new(HypervisorConfig::from_env());
//!
//! let state = hypervisor.domain_state("vmf-web1").await?;
//! println!("vmf-web1 is {state}");
//!
//! for lease in hypervisor.network_info().await?.leases {
//!     println!("{} {} {}", lease.name, lease.mac, lease.ip);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! For testing without libvirt, enable the `test-utils` feature and use the
//! mock hypervisor:
//!
//! ```ignore
//! use vmfleet_hypervisor::{Hypervisor, MockHypervisor};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let hypervisor = MockHypervisor::new();
//! hypervisor.add_volume("debian-12", b"seed");
//!
//! hypervisor.clone_volume("debian-12", "vmf-web1.qcow2").await?;
//! assert_eq!(hypervisor.volume_names().len(), 2);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod types;
pub mod virsh;
pub mod xml;

#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use error::{HypervisorError, Result};
pub use types::{DomainSpec, DomainState, HypervisorConfig, Lease, NetworkInfo, VolumeRef};
pub use virsh::{Hypervisor, VirshHypervisor};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{BootEvent, BootHook, MockHypervisor, MockOp};

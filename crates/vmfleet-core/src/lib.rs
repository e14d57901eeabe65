//! Core types and utilities for vmfleet.
//!
//! This crate provides the identity model shared by every other vmfleet crate:
//!
//! - **`VmName`**: the stable `(name, revision)` identity of a VM
//! - **`SecretUuid`**: the correlation token a VM uses to phone home
//! - **`IdError`**: validation failures when parsing either of the above
//!
//! # Example
//!
//! ```
//! use vmfleet_core::{SecretUuid, VmName};
//!
//! let name = VmName::new("web1", 0).unwrap();
//! assert_eq!(name.id(), "web1");
//! assert_eq!(name.domain_name("vmf-"), "vmf-web1");
//!
//! let next = VmName::new("web1", 2).unwrap();
//! assert_eq!(next.id(), "web1-r2");
//!
//! let secret = SecretUuid::generate();
//! assert_ne!(secret, SecretUuid::generate());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod ids;

pub use ids::{is_valid_name, IdError, SecretUuid, VmName};

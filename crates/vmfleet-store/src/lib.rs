//! `RocksDB` storage layer for vmfleet.
//!
//! This crate provides persistent storage for the identity database and the
//! cold run-state database using `RocksDB` with column families.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `vms`: identity database entries, keyed by `VmName::id()`
//! - `vms_by_secret`: index from phone-home secret to `VmName::id()`
//! - `vm_states`: cold run state (`up` / `down`), keyed by `VmName::id()`
//!
//! # Example
//!
//! ```no_run
//! use vmfleet_store::{RocksStore, Store};
//!
//! let store = RocksStore::open("/tmp/vmfleet-db").unwrap();
//!
//! for entry in store.list_entries().unwrap() {
//!     println!("{} active={}", entry.name, entry.active);
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::{RunState, RunStates, Vm, VmConfig, VmDatabaseEntry};

use vmfleet_core::{SecretUuid, VmName};

/// The storage trait defining all database operations.
///
/// Implementations are internally synchronized; every method is safe to call
/// from concurrent tasks.
pub trait Store: Send + Sync {
    // =========================================================================
    // Identity Database
    // =========================================================================

    /// Insert or update an entry.
    ///
    /// This also maintains the secret index.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_entry(&self, entry: &VmDatabaseEntry) -> Result<()>;

    /// Get an entry by name and revision.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_entry(&self, name: &VmName) -> Result<Option<VmDatabaseEntry>>;

    /// Delete an entry, its secret index and its cold state.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the entry doesn't exist.
    fn delete_entry(&self, name: &VmName) -> Result<()>;

    /// List every entry, ordered by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_entries(&self) -> Result<Vec<VmDatabaseEntry>>;

    /// List every revision of a logical name, ordered by revision.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_revisions(&self, name: &str) -> Result<Vec<VmDatabaseEntry>> {
        let mut revisions: Vec<_> = self
            .list_entries()?
            .into_iter()
            .filter(|e| e.name.name() == name)
            .collect();
        revisions.sort_by_key(|e| e.name.revision());
        Ok(revisions)
    }

    /// Find the entry owning a phone-home secret.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_by_secret(&self, secret: &SecretUuid) -> Result<Option<VmDatabaseEntry>>;

    // =========================================================================
    // Cold State Database
    // =========================================================================

    /// Load the persisted run-state snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn load_run_states(&self) -> Result<RunStates>;

    /// Replace the persisted run-state snapshot atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn save_run_states(&self, states: &RunStates) -> Result<()>;

    /// Update the persisted run state of a single VM.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn set_run_state(&self, name: &VmName, state: RunState) -> Result<()>;
}

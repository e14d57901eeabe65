//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Identity database, keyed by `VmName::id()`.
    pub const VMS: &str = "vms";

    /// Index: VM ID by phone-home secret, keyed by the secret's UUID bytes.
    pub const VMS_BY_SECRET: &str = "vms_by_secret";

    /// Cold run state, keyed by `VmName::id()`.
    pub const VM_STATES: &str = "vm_states";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::VMS, cf::VMS_BY_SECRET, cf::VM_STATES]
}

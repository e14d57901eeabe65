//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, IteratorMode, MultiThreaded,
    Options, WriteBatch,
};
use vmfleet_core::{SecretUuid, VmName};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::{RunState, RunStates, VmDatabaseEntry};
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::MissingColumnFamily(name.to_string()))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn get_by_key(&self, key: &[u8]) -> Result<Option<VmDatabaseEntry>> {
        let cf = self.cf(cf::VMS)?;

        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }
}

impl Store for RocksStore {
    fn put_entry(&self, entry: &VmDatabaseEntry) -> Result<()> {
        let cf_vms = self.cf(cf::VMS)?;
        let cf_by_secret = self.cf(cf::VMS_BY_SECRET)?;

        let vm_key = keys::vm_key(&entry.name);
        let value = Self::serialize(entry)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_vms, &vm_key, &value);
        // The secret never changes for a given entry, so the index write is idempotent.
        batch.put_cf(&cf_by_secret, keys::secret_key(&entry.vm.secret_uuid), &vm_key);

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn get_entry(&self, name: &VmName) -> Result<Option<VmDatabaseEntry>> {
        self.get_by_key(&keys::vm_key(name))
    }

    fn delete_entry(&self, name: &VmName) -> Result<()> {
        let cf_vms = self.cf(cf::VMS)?;
        let cf_by_secret = self.cf(cf::VMS_BY_SECRET)?;
        let cf_states = self.cf(cf::VM_STATES)?;

        let entry = self
            .get_entry(name)?
            .ok_or_else(|| StoreError::NotFound(name.id()))?;
        let vm_key = keys::vm_key(name);

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_vms, &vm_key);
        batch.delete_cf(&cf_by_secret, keys::secret_key(&entry.vm.secret_uuid));
        batch.delete_cf(&cf_states, &vm_key);

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn list_entries(&self) -> Result<Vec<VmDatabaseEntry>> {
        let cf = self.cf(cf::VMS)?;

        let mut entries = Vec::new();
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);

        for item in iter {
            let (_, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            entries.push(Self::deserialize(&value)?);
        }

        Ok(entries)
    }

    fn find_by_secret(&self, secret: &SecretUuid) -> Result<Option<VmDatabaseEntry>> {
        let cf = self.cf(cf::VMS_BY_SECRET)?;

        let Some(vm_key) = self
            .db
            .get_cf(&cf, keys::secret_key(secret))
            .map_err(|e| StoreError::Database(e.to_string()))?
        else {
            return Ok(None);
        };

        self.get_by_key(&vm_key)
    }

    fn load_run_states(&self) -> Result<RunStates> {
        let cf = self.cf(cf::VM_STATES)?;

        let mut states = RunStates::new();
        let iter = self.db.iterator_cf(&cf, IteratorMode::Start);

        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let Some(id) = keys::decode_vm_key(&key) else {
                tracing::warn!(key = ?key, "Skipping run state with non UTF-8 key");
                continue;
            };
            states.insert(id, Self::deserialize(&value)?);
        }

        Ok(states)
    }

    fn save_run_states(&self, states: &RunStates) -> Result<()> {
        let cf = self.cf(cf::VM_STATES)?;

        let mut batch = WriteBatch::default();

        // Drop stale IDs first so the snapshot is replaced, not merged.
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            let stale = keys::decode_vm_key(&key).map_or(true, |id| !states.contains_key(&id));
            if stale {
                batch.delete_cf(&cf, &key);
            }
        }

        for (id, state) in states {
            batch.put_cf(&cf, id.as_bytes(), Self::serialize(state)?);
        }

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }

    fn set_run_state(&self, name: &VmName, state: RunState) -> Result<()> {
        let cf = self.cf(cf::VM_STATES)?;

        self.db
            .put_cf(&cf, keys::vm_key(name), Self::serialize(&state)?)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(())
    }
}

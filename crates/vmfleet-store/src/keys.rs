//! Key encoding utilities for `RocksDB`.

use vmfleet_core::{SecretUuid, VmName};

/// Encode a VM key: the UTF-8 bytes of `VmName::id()`.
#[must_use]
pub fn vm_key(name: &VmName) -> Vec<u8> {
    name.id().into_bytes()
}

/// Encode a secret index key: the 16 UUID bytes.
#[must_use]
pub fn secret_key(secret: &SecretUuid) -> Vec<u8> {
    secret.as_bytes().to_vec()
}

/// Decode a VM key back into a rendered ID.
#[must_use]
pub fn decode_vm_key(key: &[u8]) -> Option<String> {
    std::str::from_utf8(key).ok().map(str::to_owned)
}

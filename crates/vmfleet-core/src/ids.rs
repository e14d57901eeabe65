//! Core identifier types for vmfleet.
//!
//! This module provides the `(name, revision)` identity every VM carries and
//! the secret correlation token used to authenticate phone-home calls.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between a VM name and its revision number in rendered IDs.
const REVISION_SEPARATOR: &str = "-r";

/// Returns true if `name` is a valid VM name token.
///
/// A valid token is non-empty, made of ASCII letters, digits and underscores,
/// and does not start with a digit.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The identity of one VM: a logical name plus a revision number.
///
/// Revision 0 is the canonical instance of a name. Several revisions of the
/// same name may exist side by side; each one is a distinct VM with its own
/// domain, disks and lease.
///
/// Serialized as its [`id`](Self::id) string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VmName {
    name: String,
    revision: u32,
}

impl VmName {
    /// Create a new `VmName`, validating the name token.
    ///
    /// # Errors
    ///
    /// Returns `IdError::InvalidName` if the name is not a valid token.
    pub fn new(name: impl Into<String>, revision: u32) -> Result<Self, IdError> {
        let name = name.into();
        if !is_valid_name(&name) {
            return Err(IdError::InvalidName(name));
        }
        Ok(Self { name, revision })
    }

    /// Return the logical name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the revision number.
    #[must_use]
    pub const fn revision(&self) -> u32 {
        self.revision
    }

    /// Render the lookup key: `name` for revision 0, `name-r<revision>` otherwise.
    #[must_use]
    pub fn id(&self) -> String {
        if self.revision == 0 {
            self.name.clone()
        } else {
            format!("{}{REVISION_SEPARATOR}{}", self.name, self.revision)
        }
    }

    /// Render the hypervisor domain name for this VM.
    #[must_use]
    pub fn domain_name(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.id())
    }

    /// Return the same name at another revision.
    #[must_use]
    pub fn with_revision(&self, revision: u32) -> Self {
        Self {
            name: self.name.clone(),
            revision,
        }
    }
}

impl FromStr for VmName {
    type Err = IdError;

    /// Parse a `VmName` from its rendered ID (`web1` or `web1-r3`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(REVISION_SEPARATOR) {
            Some((name, revision)) if !revision.is_empty() => {
                let revision = revision
                    .parse::<u32>()
                    .map_err(|_| IdError::InvalidRevision(revision.to_string()))?;
                Self::new(name, revision)
            }
            _ => Self::new(s, 0),
        }
    }
}

impl fmt::Debug for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VmName({})", self.id())
    }
}

impl fmt::Display for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id())
    }
}

impl TryFrom<String> for VmName {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<VmName> for String {
    fn from(name: VmName) -> Self {
        name.id()
    }
}

/// A random correlation token minted when a VM is created.
///
/// The booting VM presents this token when it phones home, so the daemon never
/// has to trust a client-supplied identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SecretUuid(uuid::Uuid);

impl SecretUuid {
    /// Create a new `SecretUuid` from a UUID.
    #[must_use]
    pub const fn from_uuid(uuid: uuid::Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a new random `SecretUuid`.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Return the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    /// Return the bytes of the UUID.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl FromStr for SecretUuid {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = uuid::Uuid::parse_str(s).map_err(|_| IdError::InvalidUuid)?;
        Ok(Self(uuid))
    }
}

// Secrets are never printed in full.
impl fmt::Debug for SecretUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.0.to_string();
        write!(f, "SecretUuid({}…)", &text[..8])
    }
}

impl fmt::Display for SecretUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for SecretUuid {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SecretUuid> for String {
    fn from(id: SecretUuid) -> Self {
        id.0.to_string()
    }
}

impl AsRef<[u8]> for SecretUuid {
    fn as_ref(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The name is not a valid token (letters, digits, underscore, no leading digit).
    #[error("invalid VM name '{0}': expected letters, digits or '_', not starting with a digit")]
    InvalidName(String),

    /// The revision suffix is not a non-negative integer.
    #[error("invalid revision '{0}'")]
    InvalidRevision(String),

    /// The input is not a valid UUID.
    #[error("invalid UUID format")]
    InvalidUuid,
}

//! Boot payload generation.
//!
//! The payload is an opaque blob attached to the VM as a second disk. The
//! in-guest first-boot tooling reads it, configures the guest and phones home
//! with the secret it carries.

use std::collections::BTreeMap;

use serde::Serialize;
use vmfleet_core::{SecretUuid, VmName};
use vmfleet_store::VmConfig;

use crate::error::{ControlError, Result};

/// Variable carrying the phone-home secret.
pub const SECRET_UUID_VAR: &str = "__SECRET_UUID";
/// Variable carrying the phone-home URL.
pub const PHONE_HOME_URL_VAR: &str = "__PHONE_HOME_URL";

/// Produces the boot payload for a VM.
pub trait BootPayload: Send + Sync {
    /// Generate the payload bytes.
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Payload` if the payload cannot be produced.
    fn generate(&self, vm: &VmName, variables: &BTreeMap<String, String>) -> Result<Vec<u8>>;
}

/// Build the variables handed to the payload generator.
///
/// User variables come first; reserved `__` variables always win.
#[must_use]
pub fn payload_variables(
    config: &VmConfig,
    secret: &SecretUuid,
    phone_home_url: &str,
) -> BTreeMap<String, String> {
    let mut variables = config.variables.clone();
    variables.insert(SECRET_UUID_VAR.to_string(), secret.to_string());
    variables.insert(PHONE_HOME_URL_VAR.to_string(), phone_home_url.to_string());
    variables.insert("__HOSTNAME".to_string(), config.effective_hostname().to_string());
    variables.insert("__APP_USER".to_string(), config.app_user.clone());
    variables.insert("__AUTO_UPGRADE".to_string(), config.auto_upgrade.to_string());
    variables
}

/// Payload encoded as a JSON document.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBootPayload;

#[derive(Serialize)]
struct JsonDocument<'a> {
    vm: String,
    variables: &'a BTreeMap<String, String>,
}

impl BootPayload for JsonBootPayload {
    fn generate(&self, vm: &VmName, variables: &BTreeMap<String, String>) -> Result<Vec<u8>> {
        let document = JsonDocument {
            vm: vm.id(),
            variables,
        };
        serde_json::to_vec_pretty(&document).map_err(|e| ControlError::Payload(e.to_string()))
    }
}

/// Read the secret back out of a payload produced by [`JsonBootPayload`].
#[must_use]
pub fn secret_from_json_payload(payload: &[u8]) -> Option<SecretUuid> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    value
        .get("variables")?
        .get(SECRET_UUID_VAR)?
        .as_str()?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_variables_override_user_ones() {
        let mut config = VmConfig::new("web1", "debian-12");
        config.variables.insert("DOMAIN".into(), "example.org".into());
        config.variables.insert(SECRET_UUID_VAR.into(), "spoofed".into());
        let secret = SecretUuid::generate();

        let variables = payload_variables(&config, &secret, "http://10.104.0.1:8080/phone");
        assert_eq!(variables["DOMAIN"], "example.org");
        assert_eq!(variables[SECRET_UUID_VAR], secret.to_string());
        assert_eq!(variables["__HOSTNAME"], "web1");
        assert_eq!(variables["__AUTO_UPGRADE"], "false");
    }

    #[test]
    fn json_payload_carries_secret() {
        let config = VmConfig::new("web1", "debian-12");
        let secret = SecretUuid::generate();
        let name = VmName::new("web1", 3).unwrap();
        let variables = payload_variables(&config, &secret, "http://host/phone");

        let payload = JsonBootPayload.generate(&name, &variables).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["vm"], "web1-r3");
        assert_eq!(secret_from_json_payload(&payload), Some(secret));
        assert_eq!(secret_from_json_payload(b"not json"), None);
    }
}

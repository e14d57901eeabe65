//! Request and configuration types for orchestrator operations.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vmfleet_store::VmConfig;

/// Request to create a new VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmRequest {
    /// Provisioning specification.
    pub config: VmConfig,
    /// Create a new revision when the name already exists instead of failing.
    #[serde(default)]
    pub new_revision: bool,
}

impl CreateVmRequest {
    /// Create a request for a fresh name.
    #[must_use]
    pub fn new(config: VmConfig) -> Self {
        Self {
            config,
            new_revision: false,
        }
    }

    /// Create a request that adds a revision to an existing name.
    #[must_use]
    pub fn new_revision(config: VmConfig) -> Self {
        Self {
            config,
            new_revision: true,
        }
    }
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct ControlConfig {
    /// Prefix of every hypervisor domain, volume and lease this daemon owns.
    pub domain_prefix: String,
    /// First-boot wait: phone-home followed by the guest powering off.
    pub boot_timeout: Duration,
    /// Second-boot wait for the confirming phone-home.
    pub confirm_timeout: Duration,
    /// Start wait for the confirming phone-home.
    pub start_timeout: Duration,
    /// Stop wait for the domain to shut off.
    pub stop_timeout: Duration,
    /// Domain state polling interval.
    pub poll_interval: Duration,
    /// Interval of the periodic cold-state refresh.
    pub reconcile_interval: Duration,
    /// URL the boot payload calls back to.
    pub phone_home_url: String,
    /// HTTP listen address of the daemon.
    pub listen_addr: String,
    /// Database directory.
    pub data_dir: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            domain_prefix: "vmf-".to_string(),
            boot_timeout: Duration::from_secs(600),
            confirm_timeout: Duration::from_secs(300),
            start_timeout: Duration::from_secs(600),
            stop_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(10),
            phone_home_url: "http://10.104.0.1:8080/phone".to_string(),
            listen_addr: "0.0.0.0:8080".to_string(),
            data_dir: PathBuf::from("/var/lib/vmfleet/db"),
        }
    }
}

impl ControlConfig {
    /// Load configuration from environment variables.
    ///
    /// Supported environment variables:
    /// - `VMFLEET_DOMAIN_PREFIX`
    /// - `VMFLEET_BOOT_TIMEOUT_SECS`, `VMFLEET_CONFIRM_TIMEOUT_SECS`
    /// - `VMFLEET_START_TIMEOUT_SECS`, `VMFLEET_STOP_TIMEOUT_SECS`
    /// - `VMFLEET_POLL_INTERVAL_MS`, `VMFLEET_RECONCILE_INTERVAL_SECS`
    /// - `VMFLEET_PHONE_HOME_URL`, `VMFLEET_LISTEN_ADDR`, `VMFLEET_DATA_DIR`
    ///
    /// Unparsable numbers are ignored and keep the default.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("VMFLEET_DOMAIN_PREFIX") {
            config.domain_prefix = val;
        }
        if let Some(secs) = env_u64("VMFLEET_BOOT_TIMEOUT_SECS") {
            config.boot_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("VMFLEET_CONFIRM_TIMEOUT_SECS") {
            config.confirm_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("VMFLEET_START_TIMEOUT_SECS") {
            config.start_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("VMFLEET_STOP_TIMEOUT_SECS") {
            config.stop_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_u64("VMFLEET_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(secs) = env_u64("VMFLEET_RECONCILE_INTERVAL_SECS") {
            config.reconcile_interval = Duration::from_secs(secs.max(1));
        }
        if let Ok(val) = std::env::var("VMFLEET_PHONE_HOME_URL") {
            config.phone_home_url = val;
        }
        if let Ok(val) = std::env::var("VMFLEET_LISTEN_ADDR") {
            config.listen_addr = val;
        }
        if let Ok(val) = std::env::var("VMFLEET_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    let val = std::env::var(key).ok()?;
    match val.parse() {
        Ok(n) => Some(n),
        Err(_) => {
            tracing::warn!(key, value = %val, "Ignoring invalid numeric setting");
            None
        }
    }
}

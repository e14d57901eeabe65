//! `virsh`-backed hypervisor implementation.
//!
//! This module provides the `Hypervisor` trait and the `VirshHypervisor`
//! which drives libvirt through the `virsh` command-line client.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::types::{DomainSpec, DomainState, HypervisorConfig, Lease, NetworkInfo, VolumeRef};
use crate::xml::{domain_xml, host_xml, parse_network_xml};
use crate::{HypervisorError, Result};

/// The narrow hypervisor interface the orchestrator drives.
///
/// Domains and volumes are addressed by name; every call may be slow and is
/// awaited by the task that issued it.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Check whether a domain with this name is defined.
    ///
    /// # Errors
    ///
    /// Returns an error if the hypervisor cannot be queried.
    async fn domain_exists(&self, name: &str) -> Result<bool>;

    /// Define a persistent domain and return its hypervisor UUID.
    ///
    /// # Errors
    ///
    /// Returns an error if the definition is rejected.
    async fn define_domain(&self, spec: &DomainSpec) -> Result<String>;

    /// Remove a domain definition.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain cannot be undefined.
    async fn undefine_domain(&self, name: &str) -> Result<()>;

    /// Boot a defined domain.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain cannot be started.
    async fn start_domain(&self, name: &str) -> Result<()>;

    /// Ask the guest to shut down gracefully.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be delivered.
    async fn shutdown_domain(&self, name: &str) -> Result<()>;

    /// Power off a domain immediately.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain cannot be stopped.
    async fn destroy_domain(&self, name: &str) -> Result<()>;

    /// Get the current state of a domain.
    ///
    /// # Errors
    ///
    /// Returns `HypervisorError::DomainNotFound` if the domain does not exist.
    async fn domain_state(&self, name: &str) -> Result<DomainState>;

    /// Clone a seed volume into a new volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the seed is missing or the copy fails.
    async fn clone_volume(&self, seed: &str, name: &str) -> Result<VolumeRef>;

    /// Resize a volume to `size_bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error if the resize fails.
    async fn resize_volume(&self, name: &str, size_bytes: u64) -> Result<()>;

    /// Create a volume holding `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be created or written.
    async fn upload_volume(&self, name: &str, data: &[u8]) -> Result<VolumeRef>;

    /// Delete a volume.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume cannot be deleted.
    async fn delete_volume(&self, name: &str) -> Result<()>;

    /// Read the live network description.
    ///
    /// # Errors
    ///
    /// Returns an error if the network cannot be read.
    async fn network_info(&self) -> Result<NetworkInfo>;

    /// Add a static DHCP host entry to the live and persistent network config.
    ///
    /// # Errors
    ///
    /// Returns an error if the update is rejected.
    async fn add_lease(&self, lease: &Lease) -> Result<()>;

    /// Remove a static DHCP host entry from the live and persistent network config.
    ///
    /// # Errors
    ///
    /// Returns an error if the update is rejected.
    async fn remove_lease(&self, lease: &Lease) -> Result<()>;
}

/// libvirt hypervisor driven through `virsh`.
#[derive(Debug, Clone)]
pub struct VirshHypervisor {
    config: HypervisorConfig,
    scratch_dir: PathBuf,
}

impl VirshHypervisor {
    /// Create a new hypervisor client.
    #[must_use]
    pub fn new(config: HypervisorConfig) -> Self {
        Self {
            config,
            scratch_dir: std::env::temp_dir(),
        }
    }

    /// Get a reference to the hypervisor config.
    #[must_use]
    pub fn config(&self) -> &HypervisorConfig {
        &self.config
    }

    /// Create a virsh command with the configured connection URI.
    fn virsh_command(&self) -> Command {
        let mut cmd = Command::new("virsh");
        if let Some(uri) = &self.config.connect_uri {
            cmd.arg("-c").arg(uri);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a virsh command and return its stdout.
    async fn run(&self, operation: &str, args: &[&str]) -> Result<String> {
        debug!(operation, ?args, "Running virsh");

        let output = self.virsh_command().args(args).output().await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(classify_failure(operation, args, stderr))
        }
    }

    async fn volume_path(&self, name: &str) -> Result<String> {
        let path = self
            .run(
                "vol-path",
                &["vol-path", "--pool", &self.config.storage_pool, name],
            )
            .await?;
        Ok(path.trim().to_string())
    }

    /// Write `contents` to a scratch file, run `f` with its path, then remove it.
    async fn with_scratch_file<T, F, Fut>(&self, contents: &[u8], f: F) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let path = self
            .scratch_dir
            .join(format!("vmfleet-{}", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, contents).await?;

        let result = f(path.to_string_lossy().into_owned()).await;

        if let Err(e) = tokio::fs::remove_file(&path).await {
            warn!(path = %path.display(), error = %e, "Failed to remove scratch file");
        }
        result
    }

    async fn update_host(&self, action: &str, lease: &Lease) -> Result<()> {
        let host = host_xml(lease);
        self.run(
            "net-update",
            &[
                "net-update",
                &self.config.network,
                action,
                "ip-dhcp-host",
                &host,
                "--live",
                "--config",
            ],
        )
        .await?;
        Ok(())
    }
}

/// Map virsh error output to the most specific error.
fn classify_failure(operation: &str, args: &[&str], stderr: String) -> HypervisorError {
    let target = args.last().copied().unwrap_or_default().to_string();
    if stderr.contains("Domain not found") || stderr.contains("failed to get domain") {
        HypervisorError::DomainNotFound(target)
    } else if stderr.contains("Storage volume not found") || stderr.contains("failed to get vol") {
        HypervisorError::VolumeNotFound(target)
    } else {
        HypervisorError::command_failed(operation, stderr)
    }
}

#[async_trait]
impl Hypervisor for VirshHypervisor {
    async fn domain_exists(&self, name: &str) -> Result<bool> {
        match self.run("dominfo", &["dominfo", name]).await {
            Ok(_) => Ok(true),
            Err(HypervisorError::DomainNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn define_domain(&self, spec: &DomainSpec) -> Result<String> {
        let xml = domain_xml(spec);
        self.with_scratch_file(xml.as_bytes(), |path| async move {
            self.run("define", &["define", &path]).await
        })
        .await?;

        let uuid = self.run("domuuid", &["domuuid", &spec.name]).await?;
        let uuid = uuid.trim().to_string();

        info!(domain = %spec.name, uuid = %uuid, "Defined domain");
        Ok(uuid)
    }

    async fn undefine_domain(&self, name: &str) -> Result<()> {
        self.run("undefine", &["undefine", name]).await?;
        info!(domain = %name, "Undefined domain");
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        self.run("start", &["start", name]).await?;
        Ok(())
    }

    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.run("shutdown", &["shutdown", name]).await?;
        Ok(())
    }

    async fn destroy_domain(&self, name: &str) -> Result<()> {
        self.run("destroy", &["destroy", name]).await?;
        Ok(())
    }

    async fn domain_state(&self, name: &str) -> Result<DomainState> {
        let state = self.run("domstate", &["domstate", name]).await?;
        Ok(DomainState::from_virsh(&state))
    }

    async fn clone_volume(&self, seed: &str, name: &str) -> Result<VolumeRef> {
        self.run(
            "vol-clone",
            &["vol-clone", "--pool", &self.config.storage_pool, seed, name],
        )
        .await?;
        let path = self.volume_path(name).await?;
        Ok(VolumeRef {
            name: name.to_string(),
            path,
        })
    }

    async fn resize_volume(&self, name: &str, size_bytes: u64) -> Result<()> {
        let size = format!("{size_bytes}B");
        self.run(
            "vol-resize",
            &["vol-resize", "--pool", &self.config.storage_pool, name, &size],
        )
        .await?;
        Ok(())
    }

    async fn upload_volume(&self, name: &str, data: &[u8]) -> Result<VolumeRef> {
        let pool = &self.config.storage_pool;
        let size = format!("{}B", data.len().max(1));
        self.run(
            "vol-create-as",
            &["vol-create-as", pool, name, &size, "--format", "raw"],
        )
        .await?;

        let uploaded = self
            .with_scratch_file(data, |path| async move {
                self.run("vol-upload", &["vol-upload", "--pool", pool, name, &path])
                    .await
            })
            .await;

        if let Err(e) = uploaded {
            // Leave nothing half-written behind.
            if let Err(cleanup) = self.delete_volume(name).await {
                warn!(volume = %name, error = %cleanup, "Failed to delete volume after upload failure");
            }
            return Err(e);
        }

        let path = self.volume_path(name).await?;
        Ok(VolumeRef {
            name: name.to_string(),
            path,
        })
    }

    async fn delete_volume(&self, name: &str) -> Result<()> {
        self.run(
            "vol-delete",
            &["vol-delete", "--pool", &self.config.storage_pool, name],
        )
        .await?;
        Ok(())
    }

    async fn network_info(&self) -> Result<NetworkInfo> {
        let xml = self
            .run("net-dumpxml", &["net-dumpxml", &self.config.network])
            .await?;
        parse_network_xml(&xml)
    }

    async fn add_lease(&self, lease: &Lease) -> Result<()> {
        self.update_host("add-last", lease).await
    }

    async fn remove_lease(&self, lease: &Lease) -> Result<()> {
        self.update_host("delete", lease).await
    }
}

//! VM-level control for appliances that live on a virtualization provider.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::{Appliance, ConfigureOptions};
use crate::cache::Fact;
use crate::config::ConfigError;
use crate::errors::ApplianceError;
use crate::wait::WaitFor;

const SMARTPROXY_ROLE: &str = "smartproxy";
const CUSTOM_CONFIGURE_WEB_UI_TIMEOUT: Duration = Duration::from_secs(1800);
const ROLE_CRASH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("VM {vm_name} not found on provider {provider}")]
    VmNotFound { provider: String, vm_name: String },

    #[error("Provider {provider} failed to {action} VM {vm_name}: {message}")]
    Action {
        provider: String,
        vm_name: String,
        action: String,
        message: String,
    },

    #[error("Provider {provider} cannot {action}")]
    Unsupported { provider: String, action: String },
}

/// Virtualization platforms with provider-specific appliance setup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProviderFlavor {
    VSphere,
    Rhev,
    #[default]
    Other,
}

/// Power and inventory operations of a provider, keyed by VM name.
#[async_trait]
pub trait ProviderBackend: Send + Sync + fmt::Debug {
    fn key(&self) -> &str;

    /// First routable IP of the VM, if it has one yet.
    async fn vm_ip(&self, vm_name: &str) -> Result<Option<String>, ProviderError>;

    async fn does_vm_exist(&self, vm_name: &str) -> Result<bool, ProviderError>;

    async fn is_vm_running(&self, vm_name: &str) -> Result<bool, ProviderError>;

    async fn is_vm_stopped(&self, vm_name: &str) -> Result<bool, ProviderError>;

    async fn start_vm(&self, vm_name: &str) -> Result<(), ProviderError>;

    async fn stop_vm(&self, vm_name: &str) -> Result<(), ProviderError>;

    async fn delete_vm(&self, vm_name: &str) -> Result<(), ProviderError>;

    async fn mark_as_template(&self, vm_name: &str) -> Result<(), ProviderError>;

    fn flavor(&self) -> ProviderFlavor {
        ProviderFlavor::Other
    }

    /// Attach (or detach) the direct LUN disk used for SAN fleecing.
    async fn set_direct_lun(&self, vm_name: &str, attached: bool) -> Result<(), ProviderError> {
        let _ = (vm_name, attached);
        Err(ProviderError::Unsupported {
            provider: self.key().to_string(),
            action: "attach a direct LUN".to_string(),
        })
    }
}

/// Operations that only exist for provider-backed appliances.
///
/// Obtained through [`Appliance::provider_control`], which returns `None`
/// for bare-address appliances.
#[derive(Debug, Clone, Copy)]
pub struct ProviderControl<'a> {
    pub(super) appliance: &'a Appliance,
    pub(super) provider_key: &'a str,
    pub(super) vm_name: &'a str,
    pub(super) backend: &'a Arc<dyn ProviderBackend>,
}

impl<'a> ProviderControl<'a> {
    const POWER_DELAY: Duration = Duration::from_secs(5);
    const POWER_TIMEOUT: Duration = Duration::from_secs(900);

    pub fn provider_key(&self) -> &str {
        self.provider_key
    }

    pub fn vm_name(&self) -> &str {
        self.vm_name
    }

    pub async fn is_running(&self) -> Result<bool, ApplianceError> {
        Ok(self.backend.is_vm_running(self.vm_name).await?)
    }

    pub async fn does_vm_exist(&self) -> Result<bool, ApplianceError> {
        Ok(self.backend.does_vm_exist(self.vm_name).await?)
    }

    /// Power on and wait for the provider to report the VM running.
    pub async fn start(&self) -> Result<(), ApplianceError> {
        if !self.is_running().await? {
            info!(vm = %self.vm_name, provider = %self.provider_key, "Starting appliance VM");
            self.backend.start_vm(self.vm_name).await?;
        }
        let backend = self.backend;
        let vm_name = self.vm_name;
        WaitFor::new(format!("VM {vm_name} running"))
            .delay(Self::POWER_DELAY)
            .timeout(Self::POWER_TIMEOUT)
            .until(|| async move { backend.is_vm_running(vm_name).await })
            .await
            .map_err(ApplianceError::from)?;
        // The VM may come back with a different lease.
        self.appliance.cache.invalidate_fact(Fact::Address);
        Ok(())
    }

    /// Power off and wait for the provider to report the VM stopped.
    pub async fn stop(&self) -> Result<(), ApplianceError> {
        info!(vm = %self.vm_name, provider = %self.provider_key, "Stopping appliance VM");
        self.backend.stop_vm(self.vm_name).await?;
        let backend = self.backend;
        let vm_name = self.vm_name;
        WaitFor::new(format!("VM {vm_name} stopped"))
            .delay(Self::POWER_DELAY)
            .timeout(Self::POWER_TIMEOUT)
            .until(|| async move { backend.is_vm_stopped(vm_name).await })
            .await
            .map_err(ApplianceError::from)?;
        self.appliance.cache.invalidate_fact(Fact::Connection);
        Ok(())
    }

    /// Delete the backing VM. Missing VMs are not an error.
    ///
    /// On RHEV the direct LUN is detached first, best effort.
    pub async fn destroy(&self) -> Result<(), ApplianceError> {
        if self.does_vm_exist().await? {
            if self.is_on_rhev() {
                if let Err(e) = self.backend.set_direct_lun(self.vm_name, false).await {
                    warn!(vm = %self.vm_name, error = %e, "Could not detach direct LUN before destroy");
                }
            }
            info!(vm = %self.vm_name, provider = %self.provider_key, "Destroying appliance VM");
            self.backend.delete_vm(self.vm_name).await?;
        }
        self.appliance.cache.invalidate_fact(Fact::Address);
        Ok(())
    }

    /// Turn the VM into a template, optionally sealing it first.
    pub async fn templatize(&self, seal: bool) -> Result<(), ApplianceError> {
        if seal {
            if !self.is_running().await? {
                self.start().await?;
            }
            self.appliance.seal_for_templatizing().await?;
        }
        self.stop().await?;
        info!(vm = %self.vm_name, provider = %self.provider_key, "Marking appliance VM as template");
        self.backend.mark_as_template(self.vm_name).await?;
        Ok(())
    }

    pub fn is_on_vsphere(&self) -> bool {
        self.backend.flavor() == ProviderFlavor::VSphere
    }

    pub fn is_on_rhev(&self) -> bool {
        self.backend.flavor() == ProviderFlavor::Rhev
    }

    pub async fn add_direct_lun_disk(&self) -> Result<(), ApplianceError> {
        self.direct_lun(true).await
    }

    pub async fn remove_direct_lun_disk(&self) -> Result<(), ApplianceError> {
        self.direct_lun(false).await
    }

    async fn direct_lun(&self, attached: bool) -> Result<(), ApplianceError> {
        if !self.is_on_rhev() {
            return Err(ApplianceError::Unsupported(format!(
                "appliance VM {} is not on RHEV, no direct LUN to {}",
                self.vm_name,
                if attached { "attach" } else { "detach" }
            )));
        }
        info!(vm = %self.vm_name, attached, "Setting RHEV direct LUN");
        self.appliance.wait_for_ssh(None).await?;
        self.backend.set_direct_lun(self.vm_name, attached).await?;
        Ok(())
    }

    /// Configure the appliance, then optionally set up fleecing.
    ///
    /// Without options this is [`Appliance::configure`] with config defaults.
    /// With options, the database comes up before the web UI is awaited and
    /// the fixups run after it; a rename only happens when the name differs.
    pub async fn configure(
        &self,
        options: Option<&ConfigureOptions>,
        setup_fleece: bool,
    ) -> Result<(), ApplianceError> {
        info!(vm = %self.vm_name, provider = %self.provider_key, "Configuring appliance VM");
        match options {
            Some(options) => self.custom_configure(options).await?,
            None => {
                let defaults = ConfigureOptions::from_config(self.appliance.config());
                self.appliance.configure(&defaults).await?
            }
        }
        if setup_fleece {
            self.configure_fleecing().await?;
        }
        Ok(())
    }

    async fn custom_configure(&self, options: &ConfigureOptions) -> Result<(), ApplianceError> {
        let appliance = self.appliance;
        if options.fix_ntp_clock {
            appliance.fix_ntp_clock().await?;
        }
        match options.external_db() {
            None => {
                let result = appliance
                    .enable_internal_db(
                        options.region,
                        options.key_address.as_deref(),
                        options.db_password.as_deref(),
                        options.ssh_password.as_deref(),
                    )
                    .await?;
                if result.failed() {
                    warn!(appliance = %appliance, output = %result.output, "Internal DB enable reported failure");
                }
            }
            Some(external) => {
                appliance.enable_external_db(&external).await?;
            }
        }
        appliance
            .wait_for_web_ui(true, Some(CUSTOM_CONFIGURE_WEB_UI_TIMEOUT))
            .await?;
        if options.loosen_pgssl {
            appliance.loosen_pgssl(false).await?;
        }
        if let Some(name) = &options.name_to_set {
            if appliance.server_name().await?.as_deref() != Some(name.as_str()) {
                appliance.rename(name).await?;
                appliance.restart_evm_service(false).await?;
                appliance.wait_for_web_ui(true, None).await?;
            }
        }
        Ok(())
    }

    /// Install what SAN fleecing needs on this provider and enable the
    /// smart proxy role.
    ///
    /// vSphere needs the VDDK (`fleecing.vddk_url`), RHEV a direct LUN.
    pub async fn configure_fleecing(&self) -> Result<(), ApplianceError> {
        let appliance = self.appliance;
        if self.is_on_vsphere() {
            let url = appliance
                .config()
                .fleecing
                .vddk_url
                .as_deref()
                .ok_or_else(|| ConfigError::Missing("fleecing.vddk_url".to_string()))?;
            appliance.install_vddk(url, true, false).await?;
            appliance.wait_for_web_ui(true, None).await?;
        }
        if self.is_on_rhev() {
            self.add_direct_lun_disk().await?;
        }

        info!(appliance = %appliance, "Enabling smart proxy role");
        let mut roles = appliance.server_roles().await?;
        let enabled = roles.get(SMARTPROXY_ROLE).copied().ok_or_else(|| {
            ApplianceError::Unsupported(format!("{appliance} has no {SMARTPROXY_ROLE} server role"))
        })?;
        if !enabled {
            roles.insert(SMARTPROXY_ROLE.to_string(), true);
            appliance.set_server_roles(&roles).await?;
            if appliance.version().await?.series() == "5.5" {
                // The UI drops out while the role starts on this series.
                if let Err(e) = appliance
                    .wait_for_web_ui(false, Some(ROLE_CRASH_TIMEOUT))
                    .await
                {
                    info!(appliance = %appliance, error = %e, "Web UI stayed up after enabling smart proxy");
                }
                appliance.wait_for_web_ui(true, None).await?;
            }
        }
        Ok(())
    }
}

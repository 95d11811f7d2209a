//! The appliance model.
//!
//! An [`Appliance`] is one target machine: either a bare network address or
//! a VM on a provider. It owns the lazily opened SSH channels and database
//! handle, the cached facts derived from them, and every lifecycle operation.
//! Operations are split across submodules by concern; they all hang off the
//! same type.

mod lifecycle;
mod maintenance;
mod properties;
pub mod provider;
mod readiness;
pub mod repos;
mod scripts;
pub mod server;
mod settings;

pub use lifecycle::{ConfigureOptions, DbSetupPath, ExternalDb, UpdateOptions, chrony_config};
pub use maintenance::{DEFAULT_BACKUP_PATH, miqqe_patch_version};
pub use properties::POSTGRES_SCL;
pub use provider::{ProviderBackend, ProviderControl, ProviderError, ProviderFlavor};
pub use readiness::{WebUiState, idle_verdict};
pub use repos::RepoFile;
pub use server::ServerIdentity;
pub use settings::{set_yaml_path, yaml_path};

use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cache::{Fact, PropertyCache};
use crate::config::{HarnessConfig, OpenshiftCreds};
use crate::errors::{ApplianceError, ChannelError};
use crate::net::{NetworkProbe, Reachability};
use crate::remote::{CommandChannel, CommandResult, Connector, SshEndpoint};
use crate::store::{PsqlOpener, RelationalStore, StoreOpener};
use crate::util::{mask_sensitive_command, tail};
use crate::wait::WaitFor;

/// How an appliance is identified.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ApplianceKind {
    /// Reached directly by hostname or IP.
    BareAddress { address: String },
    /// A VM whose address is discovered through its provider.
    ProviderBacked {
        provider_key: String,
        vm_name: String,
    },
}

/// One managed appliance.
pub struct Appliance {
    kind: ApplianceKind,
    scheme: String,
    port: Option<u16>,
    config: Arc<HarnessConfig>,
    container: Option<String>,
    openshift: Option<OpenshiftCreds>,
    db_host: Option<String>,
    db_address_override: Mutex<Option<String>>,
    browser_steal: AtomicBool,
    connector: Arc<dyn Connector>,
    store_opener: Arc<dyn StoreOpener>,
    reachability: Arc<dyn Reachability>,
    provider: Option<Arc<dyn ProviderBackend>>,
    pub(crate) cache: PropertyCache,
}

/// Builds an [`Appliance`], filling unset collaborators with the real ones.
pub struct ApplianceBuilder {
    kind: ApplianceKind,
    scheme: String,
    port: Option<u16>,
    config: Option<Arc<HarnessConfig>>,
    container: Option<String>,
    openshift: Option<OpenshiftCreds>,
    db_host: Option<String>,
    browser_steal: bool,
    connector: Option<Arc<dyn Connector>>,
    store_opener: Option<Arc<dyn StoreOpener>>,
    reachability: Option<Arc<dyn Reachability>>,
    provider: Option<Arc<dyn ProviderBackend>>,
}

/// Split a URL or bare address into (host, scheme, explicit port).
pub fn parse_address(input: &str) -> Result<(String, String, Option<u16>), ApplianceError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ApplianceError::Address("empty address".to_string()));
    }
    let full = if input.contains("://") {
        input.to_string()
    } else {
        format!("https://{input}/")
    };
    let url = reqwest::Url::parse(&full)
        .map_err(|e| ApplianceError::Address(format!("{input}: {e}")))?;
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ApplianceError::Address(format!("{input}: no host")))?;
    Ok((host.to_string(), url.scheme().to_string(), url.port()))
}

impl ApplianceBuilder {
    pub fn config(mut self, config: Arc<HarnessConfig>) -> Self {
        self.config = Some(config);
        self
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }

    pub fn openshift(mut self, creds: OpenshiftCreds) -> Self {
        self.openshift = Some(creds);
        self
    }

    pub fn db_host(mut self, host: impl Into<String>) -> Self {
        self.db_host = Some(host.into());
        self
    }

    pub fn browser_steal(mut self, steal: bool) -> Self {
        self.browser_steal = steal;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn store_opener(mut self, opener: Arc<dyn StoreOpener>) -> Self {
        self.store_opener = Some(opener);
        self
    }

    pub fn reachability(mut self, probe: Arc<dyn Reachability>) -> Self {
        self.reachability = Some(probe);
        self
    }

    pub fn build(self) -> Result<Appliance, ApplianceError> {
        let config = self.config.unwrap_or_default();
        let connector = match self.connector {
            Some(c) => c,
            None => default_connector(&config)?,
        };
        let reachability: Arc<dyn Reachability> = match self.reachability {
            Some(r) => r,
            None => Arc::new(NetworkProbe::new().map_err(|e| {
                ApplianceError::Unsupported(format!("HTTP client unavailable: {e}"))
            })?),
        };
        let container = self.container.or_else(|| config.appliance.container.clone());
        let openshift = self.openshift.or_else(|| config.appliance.openshift.clone());
        let db_host = self.db_host.or_else(|| config.appliance.db_host.clone());

        let appliance = Appliance {
            kind: self.kind,
            scheme: self.scheme,
            port: self.port,
            config,
            container,
            openshift,
            db_host,
            db_address_override: Mutex::new(None),
            browser_steal: AtomicBool::new(self.browser_steal),
            connector,
            store_opener: self.store_opener.unwrap_or_else(|| Arc::new(PsqlOpener)),
            reachability,
            provider: self.provider,
            cache: PropertyCache::new(),
        };
        if let ApplianceKind::BareAddress { address } = &appliance.kind {
            appliance.cache.address.set(address.clone());
        }
        Ok(appliance)
    }
}

#[cfg(unix)]
fn default_connector(config: &HarnessConfig) -> Result<Arc<dyn Connector>, ApplianceError> {
    Ok(Arc::new(crate::remote::ssh::SshConnector::new(
        config.timeouts.ssh_connect(),
    )))
}

#[cfg(not(unix))]
fn default_connector(_config: &HarnessConfig) -> Result<Arc<dyn Connector>, ApplianceError> {
    Err(ApplianceError::Unsupported(
        "no built-in SSH transport on this platform; supply a connector".to_string(),
    ))
}

impl Appliance {
    /// An appliance reached by URL (`https://host[:port]/`) or bare address.
    pub fn from_url(url: &str) -> Result<ApplianceBuilder, ApplianceError> {
        let (address, scheme, port) = parse_address(url)?;
        Ok(ApplianceBuilder {
            kind: ApplianceKind::BareAddress { address },
            scheme,
            port,
            config: None,
            container: None,
            openshift: None,
            db_host: None,
            browser_steal: false,
            connector: None,
            store_opener: None,
            reachability: None,
            provider: None,
        })
    }

    /// The appliance described by the config's `[appliance]` section.
    pub fn from_config(config: Arc<HarnessConfig>) -> Result<ApplianceBuilder, ApplianceError> {
        let url = config.require_base_url()?.to_string();
        Ok(Self::from_url(&url)?.config(config))
    }

    /// An appliance VM on a provider; its address is looked up on demand.
    pub fn provider_backed(
        vm_name: impl Into<String>,
        backend: Arc<dyn ProviderBackend>,
    ) -> ApplianceBuilder {
        ApplianceBuilder {
            kind: ApplianceKind::ProviderBacked {
                provider_key: backend.key().to_string(),
                vm_name: vm_name.into(),
            },
            scheme: "https".to_string(),
            port: None,
            config: None,
            container: None,
            openshift: None,
            db_host: None,
            browser_steal: false,
            connector: None,
            store_opener: None,
            reachability: None,
            provider: Some(backend),
        }
    }

    pub fn kind(&self) -> &ApplianceKind {
        &self.kind
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn cache(&self) -> &PropertyCache {
        &self.cache
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn browser_steal(&self) -> bool {
        self.browser_steal.load(Ordering::SeqCst)
    }

    pub fn set_browser_steal(&self, steal: bool) {
        self.browser_steal.store(steal, Ordering::SeqCst);
    }

    /// Provider-only operations; `None` for bare-address appliances.
    pub fn provider_control(&self) -> Option<ProviderControl<'_>> {
        match (&self.kind, &self.provider) {
            (
                ApplianceKind::ProviderBacked {
                    provider_key,
                    vm_name,
                },
                Some(backend),
            ) => Some(ProviderControl {
                appliance: self,
                provider_key,
                vm_name,
                backend,
            }),
            _ => None,
        }
    }

    /// Address if already known, without touching the network.
    pub fn known_address(&self) -> Option<String> {
        self.cache.address.get()
    }

    /// Network address (hostname or IP, no port).
    pub async fn address(&self) -> Result<String, ApplianceError> {
        self.cache
            .address
            .get_or_try_init(|| async {
                match (&self.kind, &self.provider) {
                    (ApplianceKind::BareAddress { address }, _) => Ok(address.clone()),
                    (ApplianceKind::ProviderBacked { vm_name, .. }, Some(backend)) => {
                        let outcome = WaitFor::new(format!("IP address of VM {vm_name}"))
                            .delay(Duration::from_secs(5))
                            .timeout(Duration::from_secs(600))
                            .until(|| async move { backend.vm_ip(vm_name).await })
                            .await
                            .map_err(ApplianceError::from)?;
                        outcome.value.ok_or_else(|| {
                            ApplianceError::Address(format!("VM {vm_name} has no address"))
                        })
                    }
                    (ApplianceKind::ProviderBacked { vm_name, .. }, None) => Err(
                        ApplianceError::Unsupported(format!("no provider attached for VM {vm_name}")),
                    ),
                }
            })
            .await
    }

    /// Port the web UI listens on.
    pub fn ui_port(&self) -> Result<u16, ApplianceError> {
        match (self.port, self.scheme.as_str()) {
            (Some(port), _) => Ok(port),
            (None, "https") => Ok(443),
            (None, "http") => Ok(80),
            (None, other) => Err(ApplianceError::Address(format!(
                "unknown default port for scheme {other}"
            ))),
        }
    }

    /// Base URL of the web UI, always ending in `/`.
    pub async fn url(&self) -> Result<String, ApplianceError> {
        let address = self.address().await?;
        Ok(match self.port {
            Some(port) => format!("{}://{address}:{port}/", self.scheme),
            None => format!("{}://{address}/", self.scheme),
        })
    }

    pub(crate) fn label(&self) -> String {
        match (&self.kind, self.known_address()) {
            (_, Some(address)) => address,
            (ApplianceKind::ProviderBacked { vm_name, .. }, None) => vm_name.clone(),
            (ApplianceKind::BareAddress { address }, None) => address.clone(),
        }
    }

    async fn ssh_endpoint(&self) -> Result<SshEndpoint, ApplianceError> {
        let ssh = &self.config.credentials.ssh;
        if let Some(openshift) = &self.openshift {
            let pod = self.container.clone().ok_or_else(|| {
                ApplianceError::Config(crate::config::ConfigError::Missing(
                    "appliance.container (pod name for OpenShift)".to_string(),
                ))
            })?;
            return Ok(SshEndpoint::new(&openshift.hostname, &openshift.username)
                .with_identity_file(openshift.identity_file.clone())
                .with_container(pod, true));
        }
        let mut endpoint = SshEndpoint::new(self.address().await?, &ssh.username)
            .with_port(ssh.port)
            .with_identity_file(ssh.identity_file.clone());
        if let Some(container) = &self.container {
            endpoint = endpoint.with_container(container, false);
        }
        Ok(endpoint)
    }

    /// Shared SSH channel to the appliance, opened on first use.
    pub async fn ssh_client(&self) -> Result<Arc<dyn CommandChannel>, ApplianceError> {
        self.cache
            .ssh_client
            .get_or_try_init(|| async {
                let endpoint = self.ssh_endpoint().await?;
                if self.openshift.is_none() && !self.is_ssh_running().await {
                    return Err(ApplianceError::Channel(ChannelError::Connect {
                        host: endpoint.hostname.clone(),
                        message: "SSH port is not reachable".to_string(),
                    }));
                }
                Ok(self.connector.connect(&endpoint).await?)
            })
            .await
    }

    /// Channel to the database host: the appliance itself for an internal
    /// database, otherwise a separate SSH session.
    pub async fn db_ssh_client(&self) -> Result<Arc<dyn CommandChannel>, ApplianceError> {
        if self.is_db_internal().await? {
            return self.ssh_client().await;
        }
        self.cache
            .db_ssh_client
            .get_or_try_init(|| async {
                let ssh = &self.config.credentials.ssh;
                let endpoint = SshEndpoint::new(self.db_address().await?, &ssh.username)
                    .with_port(ssh.port)
                    .with_identity_file(ssh.identity_file.clone());
                Ok(self.connector.connect(&endpoint).await?)
            })
            .await
    }

    /// Where the region database lives.
    ///
    /// An address set by a database enable operation wins, then the
    /// configured `db_host`, then the settings' `server.host` (local
    /// addresses mean the appliance itself).
    pub async fn db_address(&self) -> Result<String, ApplianceError> {
        if let Some(address) = self.db_address_override() {
            return Ok(address);
        }
        self.cache
            .db_address
            .get_or_try_init(|| async {
                if let Some(host) = &self.db_host {
                    return Ok(host.clone());
                }
                match self.get_host_address().await {
                    Ok(Some(host)) if !self.is_local_address(&host).await => Ok(host),
                    Ok(_) => self.address().await,
                    Err(e) => {
                        warn!(appliance = %self, error = %e, "Could not read DB host from settings, assuming internal DB");
                        self.address().await
                    }
                }
            })
            .await
    }

    pub async fn is_db_internal(&self) -> Result<bool, ApplianceError> {
        Ok(self.db_address().await? == self.address().await?)
    }

    /// Handle on the region database.
    pub async fn db(&self) -> Result<Arc<dyn RelationalStore>, ApplianceError> {
        self.cache
            .db
            .get_or_try_init(|| async {
                let address = self.db_address().await?;
                let channel = self.db_ssh_client().await?;
                let name = &self.config.credentials.database.name;
                debug!(appliance = %self, db = %address, "Opening database handle");
                Ok(self.store_opener.open(&address, name, channel).await?)
            })
            .await
    }

    fn db_address_override(&self) -> Option<String> {
        self.db_address_override
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Point the appliance at a (new) database host and drop everything
    /// derived from the old one. `None` reverts to discovery.
    pub(crate) fn set_db_address(&self, address: Option<String>) {
        *self
            .db_address_override
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = address;
        self.cache.invalidate_fact(Fact::DbAddress);
    }

    /// Forget server identity and zone after the server record changed.
    pub fn server_details_changed(&self) {
        self.cache.invalidate_fact(Fact::ServerDetails);
    }

    /// Forget everything derived from the settings document.
    pub fn settings_changed(&self) {
        self.cache.invalidate_fact(Fact::Settings);
        self.server_details_changed();
    }

    /// Run a command on the appliance. Exit status is left to the caller.
    pub async fn run(&self, command: &str) -> Result<CommandResult, ApplianceError> {
        self.run_with_timeout(command, None).await
    }

    pub async fn run_with_timeout(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, ApplianceError> {
        let client = self.ssh_client().await?;
        let result = client.run(command, timeout).await?;
        debug!(
            appliance = %self,
            command = %mask_sensitive_command(command),
            exit_status = result.exit_status,
            "Command finished"
        );
        Ok(result)
    }

    /// Run a command, turning a non-zero exit into a lifecycle error.
    pub async fn run_checked(
        &self,
        operation: &str,
        command: &str,
    ) -> Result<CommandResult, ApplianceError> {
        let result = self.run(command).await?;
        self.check(operation, result)
    }

    pub(crate) fn check(
        &self,
        operation: &str,
        result: CommandResult,
    ) -> Result<CommandResult, ApplianceError> {
        if result.failed() {
            return Err(self.lifecycle_error(operation, &result.output));
        }
        Ok(result)
    }

    pub(crate) fn lifecycle_error(&self, operation: &str, output: &str) -> ApplianceError {
        ApplianceError::lifecycle(operation, self.label(), tail(output, 8192))
    }

    /// Log start and end of a named operation around `fut`.
    pub(crate) async fn logged<T, F>(&self, operation: &str, fut: F) -> Result<T, ApplianceError>
    where
        F: Future<Output = Result<T, ApplianceError>>,
    {
        let start = Instant::now();
        info!(appliance = %self, operation, "Starting");
        let result = fut.await;
        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => info!(appliance = %self, operation, elapsed_ms, "Completed"),
            Err(e) => warn!(appliance = %self, operation, elapsed_ms, error = %e, "Failed"),
        }
        result
    }
}

impl fmt::Display for Appliance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Appliance({})", self.label())
    }
}

impl fmt::Debug for Appliance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Appliance")
            .field("kind", &self.kind)
            .field("scheme", &self.scheme)
            .field("port", &self.port)
            .field("container", &self.container)
            .field("db_host", &self.db_host)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Appliance {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl Eq for Appliance {}

impl Hash for Appliance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockConnector, MockProvider, ScriptedProbe};

    fn bare(url: &str) -> Appliance {
        Appliance::from_url(url)
            .unwrap()
            .connector(Arc::new(MockConnector::new()))
            .reachability(Arc::new(ScriptedProbe::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_bare_address() {
        let (host, scheme, port) = parse_address("10.0.0.5").unwrap();
        assert_eq!((host.as_str(), scheme.as_str(), port), ("10.0.0.5", "https", None));
    }

    #[test]
    fn test_parse_full_url_with_port() {
        let (host, scheme, port) = parse_address("http://appliance.example.com:3000/dashboard").unwrap();
        assert_eq!(host, "appliance.example.com");
        assert_eq!(scheme, "http");
        assert_eq!(port, Some(3000));
        assert!(parse_address("  ").is_err());
    }

    #[tokio::test]
    async fn test_url_and_ui_port() {
        let app = bare("10.0.0.5");
        assert_eq!(app.url().await.unwrap(), "https://10.0.0.5/");
        assert_eq!(app.ui_port().unwrap(), 443);
        assert_eq!(app.to_string(), "Appliance(10.0.0.5)");

        let app = bare("http://10.0.0.5:8080");
        assert_eq!(app.url().await.unwrap(), "http://10.0.0.5:8080/");
        assert_eq!(app.ui_port().unwrap(), 8080);
    }

    #[test]
    fn test_equality_by_address() {
        assert_eq!(bare("10.0.0.5"), bare("https://10.0.0.5/"));
        assert_ne!(bare("10.0.0.5"), bare("10.0.0.6"));
    }

    #[tokio::test]
    async fn test_provider_backed_identity_and_address() {
        let provider = Arc::new(MockProvider::new("rhevm"));
        provider.add_vm("cfme-5.8", Some("10.1.1.1"));
        let build = || {
            Appliance::provider_backed("cfme-5.8", provider.clone())
                .connector(Arc::new(MockConnector::new()))
                .reachability(Arc::new(ScriptedProbe::new()))
                .build()
                .unwrap()
        };
        let a = build();
        let b = build();
        assert_eq!(a, b);
        assert!(a.provider_control().is_some());
        assert_eq!(a.to_string(), "Appliance(cfme-5.8)");
        assert_eq!(a.address().await.unwrap(), "10.1.1.1");
        assert_eq!(a.to_string(), "Appliance(10.1.1.1)");

        assert!(bare("10.0.0.5").provider_control().is_none());
    }

    #[tokio::test]
    async fn test_configured_db_host_wins() {
        let app = Appliance::from_url("10.0.0.5")
            .unwrap()
            .db_host("10.0.0.9")
            .connector(Arc::new(MockConnector::new()))
            .reachability(Arc::new(ScriptedProbe::new()))
            .build()
            .unwrap();
        assert_eq!(app.db_address().await.unwrap(), "10.0.0.9");
        assert!(!app.is_db_internal().await.unwrap());

        app.set_db_address(Some("10.0.0.5".into()));
        assert!(app.is_db_internal().await.unwrap());
        app.set_db_address(None);
        assert_eq!(app.db_address().await.unwrap(), "10.0.0.9");
    }
}

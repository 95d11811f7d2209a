//! Harness configuration.
//!
//! Loaded from a TOML file (default `~/.config/apl/config.toml`), then
//! overridden by `APL_*` environment variables. Everything has a default, so
//! a missing file is not an error.

pub mod env;

pub use env::{EnvError, EnvParser};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid environment overrides: {}", join_errors(.0))]
    Env(Vec<EnvError>),

    #[error("Missing configuration value: {0}")]
    Missing(String),

    #[error("Invalid configuration value for {key}: {message}")]
    Invalid { key: String, message: String },
}

fn join_errors(errors: &[EnvError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// How to reach the default appliance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplianceSection {
    /// Web UI URL, or a bare address.
    pub base_url: Option<String>,
    /// Container the appliance runs in on the SSH host.
    pub container: Option<String>,
    /// Dedicated database host, when not the appliance itself.
    pub db_host: Option<String>,
    /// Set when the appliance is a pod in an OpenShift project.
    pub openshift: Option<OpenshiftCreds>,
}

/// SSH login to the OpenShift master that hosts an appliance pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenshiftCreds {
    pub hostname: String,
    #[serde(default = "default_ssh_user")]
    pub username: String,
    pub identity_file: Option<PathBuf>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

/// SSH login used for appliances and dedicated database hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshCredentials {
    pub username: String,
    /// Passed to the console CLI when fetching keys from another appliance.
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub port: u16,
}

impl Default for SshCredentials {
    fn default() -> Self {
        Self {
            username: default_ssh_user(),
            password: None,
            identity_file: None,
            port: 22,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseCredentials {
    pub username: String,
    pub password: String,
    pub name: String,
}

impl Default for DatabaseCredentials {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            password: "smartvm".to_string(),
            name: "vmdb_production".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Credentials {
    pub ssh: SshCredentials,
    pub database: DatabaseCredentials,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClockSection {
    pub servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigureSection {
    pub fix_ntp_clock: bool,
    pub loosen_pgssl: bool,
}

impl Default for ConfigureSection {
    fn default() -> Self {
        Self {
            fix_ntp_clock: true,
            loosen_pgssl: true,
        }
    }
}

/// Wait budgets and probe timeouts, in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub ssh: u64,
    pub db: u64,
    pub evm: u64,
    pub web_ui: u64,
    pub roles: u64,
    pub ssh_connect: u64,
    pub tcp_probe: u64,
    pub http_probe: u64,
    pub web_ui_sample_interval: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ssh: 600,
            db: 600,
            evm: 900,
            web_ui: 900,
            roles: 300,
            ssh_connect: 30,
            tcp_probe: 5,
            http_probe: 15,
            web_ui_sample_interval: 3,
        }
    }
}

impl Timeouts {
    pub fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    pub fn ssh(&self) -> Duration {
        Self::secs(self.ssh)
    }

    pub fn db(&self) -> Duration {
        Self::secs(self.db)
    }

    pub fn evm(&self) -> Duration {
        Self::secs(self.evm)
    }

    pub fn web_ui(&self) -> Duration {
        Self::secs(self.web_ui)
    }

    pub fn roles(&self) -> Duration {
        Self::secs(self.roles)
    }

    pub fn ssh_connect(&self) -> Duration {
        Self::secs(self.ssh_connect)
    }

    pub fn tcp_probe(&self) -> Duration {
        Self::secs(self.tcp_probe)
    }

    pub fn http_probe(&self) -> Duration {
        Self::secs(self.http_probe)
    }

    pub fn web_ui_sample_interval(&self) -> Duration {
        Self::secs(self.web_ui_sample_interval)
    }
}

/// Subject fields for the generated VM console certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmConsoleCert {
    pub country: String,
    pub state: String,
    pub city: String,
    pub organization: String,
    pub organizational_unit: String,
    /// Local path of the certificate generator script uploaded to the appliance.
    pub generator: PathBuf,
    #[serde(default = "default_cert_install_dir")]
    pub install_dir: String,
}

fn default_cert_install_dir() -> String {
    "/var/www/miq/vmdb/certs".to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdatesSection {
    /// Yum repositories used by `update_rhel` when none are given.
    pub urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiqqeSection {
    /// Directory holding the test-helper patch set (`*.diff`).
    pub patch_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleecingSection {
    /// VDDK RPM installed on vSphere-hosted appliances.
    pub vddk_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub appliance: ApplianceSection,
    pub credentials: Credentials,
    pub clock: ClockSection,
    pub configure: ConfigureSection,
    pub timeouts: Timeouts,
    pub vm_console: Option<VmConsoleCert>,
    pub updates: UpdatesSection,
    pub miqqe: MiqqeSection,
    pub fleecing: FleecingSection,
    pub log_level: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            appliance: ApplianceSection::default(),
            credentials: Credentials::default(),
            clock: ClockSection::default(),
            configure: ConfigureSection::default(),
            timeouts: Timeouts::default(),
            vm_console: None,
            updates: UpdatesSection::default(),
            miqqe: MiqqeSection::default(),
            fleecing: FleecingSection::default(),
            log_level: "info".to_string(),
        }
    }
}

impl HarnessConfig {
    /// `$APL_CONFIG`, else `~/.config/apl/config.toml` on Linux.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("APL_CONFIG") {
            return Some(env::expand_home(&path));
        }
        dirs::config_dir().map(|dir| dir.join("apl").join("config.toml"))
    }

    /// Load file then environment. An explicit path must exist; the
    /// default path may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env(&mut EnvParser::new())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Apply `APL_*` overrides on top of the loaded values.
    pub fn apply_env(&mut self, parser: &mut EnvParser) -> Result<(), ConfigError> {
        if let Some(url) = parser.get_string("BASE_URL") {
            self.appliance.base_url = Some(url);
        }
        if let Some(host) = parser.get_string("DB_HOST") {
            self.appliance.db_host = Some(host);
        }
        if let Some(user) = parser.get_string("SSH_USER") {
            self.credentials.ssh.username = user;
        }
        if let Some(password) = parser.get_string("SSH_PASSWORD") {
            self.credentials.ssh.password = Some(password);
        }
        if let Some(path) = parser.get_path("SSH_IDENTITY") {
            self.credentials.ssh.identity_file = Some(path);
        }
        if let Some(port) = parser.get_u64_range("SSH_PORT", 1, u16::MAX as u64) {
            self.credentials.ssh.port = port as u16;
        }
        if let Some(user) = parser.get_string("DB_USER") {
            self.credentials.database.username = user;
        }
        if let Some(password) = parser.get_string("DB_PASSWORD") {
            self.credentials.database.password = password;
        }
        if let Some(servers) = parser.get_string_list("CLOCK_SERVERS") {
            self.clock.servers = servers;
        }
        if let Some(urls) = parser.get_string_list("UPDATE_URLS") {
            self.updates.urls = urls;
        }
        if let Some(loosen) = parser.get_bool("LOOSEN_PGSSL") {
            self.configure.loosen_pgssl = loosen;
        }
        if let Some(secs) = parser.get_u64_range("SSH_CONNECT_TIMEOUT", 1, 600) {
            self.timeouts.ssh_connect = secs;
        }
        if let Some(secs) = parser.get_u64_range("HTTP_PROBE_TIMEOUT", 1, 600) {
            self.timeouts.http_probe = secs;
        }
        if let Some(dir) = parser.get_path("MIQQE_PATCH_DIR") {
            self.miqqe.patch_dir = Some(dir);
        }
        if let Some(url) = parser.get_string("VDDK_URL") {
            self.fleecing.vddk_url = Some(url);
        }
        if let Some(level) = parser.get_string("LOG_LEVEL") {
            self.log_level = level;
        }

        if parser.has_errors() {
            return Err(ConfigError::Env(parser.take_errors()));
        }
        Ok(())
    }

    /// The configured base URL, rejecting the `none` placeholder.
    pub fn require_base_url(&self) -> Result<&str, ConfigError> {
        match self.appliance.base_url.as_deref().map(str::trim) {
            None | Some("") => Err(ConfigError::Missing("appliance.base_url".to_string())),
            Some(url) if url.eq_ignore_ascii_case("none") => Err(ConfigError::Invalid {
                key: "appliance.base_url".to_string(),
                message: "no appliance configured (base_url is 'none')".to_string(),
            }),
            Some(url) => Ok(url),
        }
    }
}

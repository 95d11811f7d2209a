//! Bring-up and service control.
//!
//! `configure` is the full sequence: SSH, clock, database, EVM service, the
//! one-time fixups, then the web UI. Each step is also public on its own.
//! Mutations return only after clearing whatever cached facts they changed.

use std::io::Write;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Appliance;
use super::properties::POSTGRES_SCL;
use super::scripts;
use crate::cache::Fact;
use crate::config::{ConfigError, HarnessConfig};
use crate::errors::{ApplianceError, ChannelError};
use crate::remote::{CommandResult, ShellExt};
use crate::util::{random_remote_path, render_template, ruby_escape, shell_quote, sql_identifier, sql_literal};
use crate::wait::WaitFor;

const MIQ_LIB: &str = "/var/www/miq/lib";
const V2_KEY: &str = "/var/www/miq/vmdb/certs/v2_key";
const CHRONY_CONF: &str = "/etc/chrony.conf";
const CERT_GENERATOR_REMOTE: &str = "/usr/bin/gen_ssl_cert.py";

const CONFIGURE_DB_TIMEOUT: Duration = Duration::from_secs(1200);
const CONFIGURE_EVM_TIMEOUT: Duration = Duration::from_secs(1200);
const CONFIGURE_WEB_UI_TIMEOUT: Duration = Duration::from_secs(1800);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(3600);

/// How the database can be set up on this appliance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbSetupPath {
    /// `appliance_console_cli` is installed.
    CliAvailable,
    /// Older builds: run a generated Ruby script instead.
    ScriptFallback,
}

/// Connection details of an external region database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalDb {
    pub address: String,
    pub region: u32,
    pub name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ExternalDb {
    pub fn new(address: impl Into<String>, region: u32) -> Self {
        Self {
            address: address.into(),
            region,
            name: None,
            username: None,
            password: None,
        }
    }
}

/// Parameters of [`Appliance::configure`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigureOptions {
    pub region: u32,
    /// External database host; `None` sets up the internal database.
    pub db_address: Option<String>,
    /// Fetch the encryption key from this appliance instead of generating one.
    pub key_address: Option<String>,
    pub db_name: Option<String>,
    pub db_username: Option<String>,
    pub db_password: Option<String>,
    pub ssh_password: Option<String>,
    pub fix_ntp_clock: bool,
    pub loosen_pgssl: bool,
    pub name_to_set: Option<String>,
}

impl Default for ConfigureOptions {
    fn default() -> Self {
        Self {
            region: 0,
            db_address: None,
            key_address: None,
            db_name: None,
            db_username: None,
            db_password: None,
            ssh_password: None,
            fix_ntp_clock: true,
            loosen_pgssl: true,
            name_to_set: None,
        }
    }
}

impl ConfigureOptions {
    /// Defaults taken from the `[configure]` section.
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            fix_ntp_clock: config.configure.fix_ntp_clock,
            loosen_pgssl: config.configure.loosen_pgssl,
            ..Self::default()
        }
    }

    /// The external database to join, if one was asked for.
    pub fn external_db(&self) -> Option<ExternalDb> {
        self.db_address.as_ref().map(|address| ExternalDb {
            address: address.clone(),
            region: self.region,
            name: self.db_name.clone(),
            username: self.db_username.clone(),
            password: self.db_password.clone(),
        })
    }
}

/// Options for [`Appliance::update_rhel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOptions {
    pub skip_broken: bool,
    pub reboot: bool,
    /// Remove every repo file except the base ones first.
    pub cleanup: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            skip_broken: false,
            reboot: true,
            cleanup: false,
        }
    }
}

/// chrony configuration for the given servers.
pub fn chrony_config(servers: &[String]) -> String {
    let mut lines = vec![
        "driftfile /var/lib/chrony/drift".to_string(),
        "makestep 10 10".to_string(),
        "rtcsync".to_string(),
    ];
    lines.extend(servers.iter().map(|s| format!("server {s} iburst")));
    lines.join("\n")
}

impl Appliance {
    /// Bring the appliance up from a fresh deployment to a serving web UI.
    pub async fn configure(&self, options: &ConfigureOptions) -> Result<(), ApplianceError> {
        self.logged("configure", async {
            self.wait_for_ssh(None).await?;
            if options.fix_ntp_clock {
                self.fix_ntp_clock().await?;
            }
            match options.external_db() {
                None => {
                    self.setup_database(
                        options.region,
                        options.key_address.as_deref(),
                        options.db_password.as_deref(),
                        options.ssh_password.as_deref(),
                    )
                    .await?
                }
                Some(external) => {
                    self.enable_external_db(&external).await?;
                    self.wait_for_db(Some(CONFIGURE_DB_TIMEOUT)).await?;
                }
            }
            self.wait_for_evm_service(Some(CONFIGURE_EVM_TIMEOUT)).await?;

            let mut restart_evm = false;
            if options.loosen_pgssl {
                self.loosen_pgssl(false).await?;
                restart_evm = true;
            }
            if self.version().await?.at_least("5.8") {
                if self.config.vm_console.is_some() {
                    self.configure_vm_console_cert().await?;
                    restart_evm = true;
                } else {
                    info!(appliance = %self, "No VM console certificate configured, skipping");
                }
            }
            if let Some(name) = &options.name_to_set {
                if self.server_name().await?.as_deref() != Some(name.as_str()) {
                    self.rename(name).await?;
                    restart_evm = true;
                }
            }
            if restart_evm {
                self.restart_evm_service(false).await?;
            }
            self.wait_for_web_ui(true, Some(CONFIGURE_WEB_UI_TIMEOUT))
                .await
        })
        .await
    }

    /// Which database setup mechanism this appliance offers.
    pub async fn db_setup_path(&self) -> Result<DbSetupPath, ApplianceError> {
        let result = self.run("ls -l /bin/appliance_console_cli").await?;
        Ok(if result.success() {
            DbSetupPath::CliAvailable
        } else {
            DbSetupPath::ScriptFallback
        })
    }

    /// Enable the internal database (not on the upstream stream), then wait
    /// until it is ready.
    pub async fn setup_database(
        &self,
        region: u32,
        key_address: Option<&str>,
        db_password: Option<&str>,
        ssh_password: Option<&str>,
    ) -> Result<(), ApplianceError> {
        self.logged("setup database", async {
            if !self.version().await?.is_latest() {
                let result = self
                    .enable_internal_db(region, key_address, db_password, ssh_password)
                    .await?;
                if result.failed() {
                    warn!(appliance = %self, output = %result.output, "Internal DB enable reported failure");
                }
            }
            self.wait_for_db(Some(CONFIGURE_DB_TIMEOUT)).await
        })
        .await
    }

    /// Create a region database on this appliance and point it there.
    ///
    /// The exit status is handed back as is; a non-zero result is for the
    /// caller to interpret.
    pub async fn enable_internal_db(
        &self,
        region: u32,
        key_address: Option<&str>,
        db_password: Option<&str>,
        ssh_password: Option<&str>,
    ) -> Result<CommandResult, ApplianceError> {
        self.logged("enable internal DB", async {
            let address = self.address().await?;
            info!(appliance = %self, region, "Enabling internal DB");
            self.set_db_address(Some(address));

            let db_password = db_password.unwrap_or(&self.config.credentials.database.password);
            match self.db_setup_path().await? {
                DbSetupPath::CliAvailable => {
                    let command = match key_address {
                        Some(key_address) => {
                            let ssh_password = ssh_password
                                .or(self.config.credentials.ssh.password.as_deref())
                                .ok_or_else(|| {
                                    ConfigError::Missing(
                                        "credentials.ssh.password (needed to fetch the key)"
                                            .to_string(),
                                    )
                                })?;
                            format!(
                                "appliance_console_cli --region {region} --internal --fetch-key {key_address} -p {} -a {}",
                                shell_quote(db_password),
                                shell_quote(ssh_password)
                            )
                        }
                        None => format!(
                            "appliance_console_cli --region {region} --internal --force-key -p {}",
                            shell_quote(db_password)
                        ),
                    };
                    self.run(&command).await
                }
                DbSetupPath::ScriptFallback => {
                    let region = region.to_string();
                    let service = format!("{POSTGRES_SCL}-postgresql");
                    self.run_generated_script(
                        scripts::ENABLE_INTERNAL_DB,
                        &[
                            ("miq_lib", MIQ_LIB),
                            ("region", &region),
                            ("password", db_password),
                            ("postgres_service", &service),
                        ],
                    )
                    .await
                }
            }
        })
        .await
    }

    /// Join the region database on another host.
    ///
    /// On a non-zero exit the previous database address is restored and a
    /// lifecycle error carrying the output is returned.
    pub async fn enable_external_db(&self, db: &ExternalDb) -> Result<CommandResult, ApplianceError> {
        self.logged("enable external DB", async {
            let previous = self.db_address_override();
            info!(appliance = %self, db = %db.address, region = db.region, "Enabling external DB");
            self.set_db_address(Some(db.address.clone()));

            let outcome = self.join_external_db(db).await;
            let failure = match outcome {
                Ok(result) if result.success() => return Ok(result),
                Ok(result) => self.lifecycle_error(
                    &format!("enable external DB on {}", db.address),
                    &result.output,
                ),
                Err(e) => e,
            };
            self.set_db_address(previous);
            Err(failure)
        })
        .await
    }

    async fn join_external_db(&self, db: &ExternalDb) -> Result<CommandResult, ApplianceError> {
        let credentials = &self.config.credentials.database;
        let name = db.name.as_deref().unwrap_or(&credentials.name);
        let username = db.username.as_deref().unwrap_or(&credentials.username);
        let password = db.password.as_deref().unwrap_or(&credentials.password);

        match self.db_setup_path().await? {
            DbSetupPath::CliAvailable => {
                self.copy_encryption_key().await?;
                self.run(&format!(
                    "appliance_console_cli --hostname {} --region {} --dbname {} --username {} --password {}",
                    db.address,
                    db.region,
                    shell_quote(name),
                    shell_quote(username),
                    shell_quote(password)
                ))
                .await
            }
            DbSetupPath::ScriptFallback => {
                let region = db.region.to_string();
                self.run_generated_script(
                    scripts::ENABLE_EXTERNAL_DB,
                    &[
                        ("miq_lib", MIQ_LIB),
                        ("host", &db.address),
                        ("region", &region),
                        ("database", name),
                        ("username", username),
                        ("password", password),
                    ],
                )
                .await
            }
        }
    }

    /// Copy the `v2_key` from the database host so both ends share encryption.
    async fn copy_encryption_key(&self) -> Result<(), ApplianceError> {
        let source = self.db_ssh_client().await?;
        let target = self.ssh_client().await?;
        let local = tempfile::NamedTempFile::new()?;
        source.get_file(V2_KEY, local.path()).await?;
        target.put_file(local.path(), V2_KEY).await?;
        debug!(appliance = %self, from = %source.host(), "Copied v2_key");
        Ok(())
    }

    /// Upload a rendered template, run it with `ruby`, and always remove it.
    ///
    /// Values are escaped for the single-quoted Ruby literals they land in.
    pub(crate) async fn run_generated_script(
        &self,
        template: &str,
        values: &[(&str, &str)],
    ) -> Result<CommandResult, ApplianceError> {
        let client = self.ssh_client().await?;
        let escaped: Vec<(&str, String)> = values
            .iter()
            .map(|(key, value)| (*key, ruby_escape(value)))
            .collect();
        let escaped: Vec<(&str, &str)> = escaped.iter().map(|(k, v)| (*k, v.as_str())).collect();
        let mut local = tempfile::NamedTempFile::new()?;
        local.write_all(render_template(template, &escaped).as_bytes())?;
        local.flush()?;
        let remote = random_remote_path("rb");
        let result = match client.put_file(local.path(), &remote).await {
            Ok(()) => client.run(&format!("ruby {remote}"), None).await,
            Err(e) => Err(e),
        };
        if let Err(e) = client.remove_remote(&remote).await {
            warn!(appliance = %self, path = %remote, error = %e, "Failed to remove generated script");
        }
        Ok(result?)
    }

    /// Install chrony's config and make sure it is tracking.
    pub async fn fix_ntp_clock(&self) -> Result<(), ApplianceError> {
        self.logged("fix NTP clock", async {
            let servers = &self.config.clock.servers;
            if servers.is_empty() {
                return Err(ConfigError::Missing("clock.servers".to_string()).into());
            }
            self.run_checked("check chrony installed", "yum list installed chrony")
                .await?;
            if self.run("systemctl is-enabled chronyd").await?.failed() {
                debug!(appliance = %self, "Enabling chronyd at boot");
                self.run("systemctl enable chronyd").await?;
                self.run("systemctl daemon-reload").await?;
            }

            let wanted = chrony_config(servers);
            let current = self.run(&format!("cat {CHRONY_CONF}")).await?;
            let changed = current.output.trim_end() != wanted;
            if changed {
                debug!(appliance = %self, "Rewriting chrony config");
                self.run_checked(
                    "write chrony config",
                    &format!("cat > {CHRONY_CONF} <<'EOF'\n{wanted}\nEOF"),
                )
                .await?;
            }
            if changed || self.run("systemctl status chronyd").await?.failed() {
                self.run("systemctl restart chronyd").await?;
            }
            self.run_checked("chronyc tracking", "chronyc tracking")
                .await?;
            Ok(())
        })
        .await
    }

    /// Accept password logins to PostgreSQL from anywhere.
    pub async fn loosen_pgssl(&self, with_ssl: bool) -> Result<(), ApplianceError> {
        self.logged("loosen pgssl", async {
            let credentials = &self.config.credentials.database;
            let alter = format!(
                "alter user {} with password {}",
                sql_identifier(&credentials.username),
                sql_literal(&credentials.password)
            );
            self.run(&format!("psql -d vmdb_production -c {}", shell_quote(&alter)))
                .await?;

            let data_dir = format!("/opt/rh/{POSTGRES_SCL}/root/var/lib/pgsql/data");
            self.run(&format!(
                "mv {data_dir}/pg_hba.conf {data_dir}/pg_hba.conf.sav"
            ))
            .await?;
            let ssl = if with_ssl {
                "hostssl all all all cert map=sslmap"
            } else {
                ""
            };
            self.run_checked(
                "write pg_hba.conf",
                &format!(
                    "cat > {data_dir}/pg_hba.conf <<EOF\nlocal all postgres,root trust\nhost all all 0.0.0.0/0 md5\n{ssl}\nEOF"
                ),
            )
            .await?;
            self.run(&format!("chown postgres:postgres {data_dir}/pg_hba.conf"))
                .await?;
            self.run_checked(
                "restart postgres",
                &format!("systemctl restart {POSTGRES_SCL}-postgresql"),
            )
            .await?;
            Ok(())
        })
        .await
    }

    /// Generate and install the self-signed certificate used by the HTML5 VM console.
    pub async fn configure_vm_console_cert(&self) -> Result<(), ApplianceError> {
        self.logged("configure VM console certificate", async {
            let cert = self
                .config
                .vm_console
                .as_ref()
                .ok_or_else(|| ConfigError::Missing("vm_console".to_string()))?;
            let client = self.ssh_client().await?;
            client
                .put_file(&cert.generator, CERT_GENERATOR_REMOTE)
                .await?;
            let install_dir = cert.install_dir.trim_end_matches('/');
            let command = format!(
                "chmod +x {gen} && {gen} --C={} --ST={} --L={} --O={} --OU={} --keyFile={} --certFile={}",
                shell_quote(&cert.country),
                shell_quote(&cert.state),
                shell_quote(&cert.city),
                shell_quote(&cert.organization),
                shell_quote(&cert.organizational_unit),
                shell_quote(&format!("{install_dir}/server.cer.key")),
                shell_quote(&format!("{install_dir}/server.cer")),
                gen = CERT_GENERATOR_REMOTE,
            );
            self.run_checked("generate VM console certificate", &command)
                .await?;
            Ok(())
        })
        .await
    }

    async fn evm_service_command(&self, verb: &str) -> Result<CommandResult, ApplianceError> {
        info!(appliance = %self, verb, "Running systemctl against evmserverd");
        self.run_checked(
            &format!("{verb} evmserverd"),
            &format!("systemctl {verb} evmserverd"),
        )
        .await
    }

    pub async fn start_evm_service(&self) -> Result<(), ApplianceError> {
        self.logged("start EVM service", async {
            self.evm_service_command("start").await.map(|_| ())
        })
        .await
    }

    pub async fn stop_evm_service(&self) -> Result<(), ApplianceError> {
        self.logged("stop EVM service", async {
            self.evm_service_command("stop").await.map(|_| ())
        })
        .await
    }

    /// Restart evmserverd. `rude` kills every ruby process and bounces
    /// PostgreSQL first, for when a graceful restart hangs.
    pub async fn restart_evm_service(&self, rude: bool) -> Result<(), ApplianceError> {
        self.logged("restart EVM service", async {
            if rude {
                info!(appliance = %self, "Restarting EVM service by killing processes");
                self.run(&format!(
                    "killall -9 ruby; systemctl restart {POSTGRES_SCL}-postgresql"
                ))
                .await?;
                self.evm_service_command("start").await?;
            } else {
                self.evm_service_command("restart").await?;
            }
            self.server_details_changed();
            Ok(())
        })
        .await
    }

    /// Reboot and wait for the machine to come back with a lower uptime.
    pub async fn reboot(&self, wait_for_web_ui: bool) -> Result<(), ApplianceError> {
        self.logged("reboot", async {
            let old_uptime = self.ssh_client().await?.uptime().await?;
            if let Err(e) = self.run("reboot").await {
                debug!(appliance = %self, error = %e, "Channel dropped while issuing reboot");
            }
            self.cache.invalidate_fact(Fact::Connection);

            WaitFor::new("appliance to reboot")
                .delay(Duration::from_secs(10))
                .timeout(Duration::from_secs(600))
                .handle_exception(true)
                .until(|| async move {
                    let uptime = match self.ssh_client().await {
                        Ok(client) => client.uptime().await.map_err(ApplianceError::from),
                        Err(e) => Err(e),
                    };
                    if uptime.is_err() {
                        self.cache.invalidate_fact(Fact::Connection);
                    }
                    uptime.map(|now| now < old_uptime)
                })
                .await?;

            if wait_for_web_ui {
                self.wait_for_web_ui(true, None).await?;
            }
            Ok(())
        })
        .await
    }

    /// Add update repos and run `yum update`.
    ///
    /// With no `urls`, the configured update URLs are used. Losing the
    /// channel mid-update aborts the run.
    pub async fn update_rhel(
        &self,
        urls: &[String],
        options: UpdateOptions,
    ) -> Result<CommandResult, ApplianceError> {
        self.logged("update RHEL", async {
            let urls = if urls.is_empty() {
                self.config.updates.urls.as_slice()
            } else {
                urls
            };
            if options.cleanup {
                self.run(
                    "cd /etc/yum.repos.d && find . -not -name 'redhat.repo' -not -name 'rhel-source.repo' -not -name . -exec rm {} \\;",
                )
                .await?;
            }
            for url in urls {
                self.add_product_repo(url, &Default::default()).await?;
            }

            let skip = if options.skip_broken { " --skip-broken" } else { "" };
            let result = match self
                .run_with_timeout(&format!("yum update -y --nogpgcheck{skip}"), Some(UPDATE_TIMEOUT))
                .await
            {
                Err(ApplianceError::Channel(e @ ChannelError::Timeout { .. })) => {
                    return Err(ApplianceError::Aborted(format!(
                        "SSH timed out while updating {}: {e}",
                        self.label()
                    )));
                }
                other => other?,
            };
            let result = self.check("update RHEL", result)?;
            if options.reboot {
                self.reboot(false).await?;
            }
            Ok(result)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chrony_config() {
        let conf = chrony_config(&["clock.example.com".to_string(), "10.0.0.1".to_string()]);
        assert_eq!(
            conf,
            "driftfile /var/lib/chrony/drift\nmakestep 10 10\nrtcsync\nserver clock.example.com iburst\nserver 10.0.0.1 iburst"
        );
    }

    #[test]
    fn test_configure_options_from_config() {
        let mut config = HarnessConfig::default();
        config.configure.loosen_pgssl = false;
        let options = ConfigureOptions::from_config(&config);
        assert!(!options.loosen_pgssl);
        assert!(options.fix_ntp_clock);
        assert_eq!(options.region, 0);
        assert!(options.db_address.is_none());
    }
}

//! Database maintenance, automate domains, host tweaks and optional software.

use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Appliance;
use super::properties::{POSTGRES_SCL, compile};
use super::settings::set_yaml_path;
use crate::cache::Fact;
use crate::config::ConfigError;
use crate::errors::ApplianceError;
use crate::remote::{CommandResult, ShellExt, VMDB_ROOT};
use crate::util::{random_remote_path, shell_quote};
use crate::wait::WaitFor;

pub const DEFAULT_BACKUP_PATH: &str = "/tmp/evm_db.backup";
const PARTITION_MARKER: &str = "/var/www/miq/vmdb/.db_partition_extended";
const VDDK_LIB: &str = "/usr/lib/vmware-vix-disklib/lib64";
const NETAPP_MARKER: &str = "/var/www/miq/vmdb/HAS_NETAPP";
const MIQQE_MARKER: &str = "/var/www/miq/vmdb/.miqqe_version";
const MIQ_APPLICATION_JS: &str = "/var/www/miq/vmdb/app/assets/javascripts/miq_application.js";
const AUTOFOCUS_JS: &str = "/var/www/miq/vmdb/app/assets/javascripts/directives/autofocus.js";

/// Last path segment of a download URL.
fn file_name_of(url: &str) -> Result<&str, ApplianceError> {
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty() && !name.contains(':'))
        .ok_or_else(|| ApplianceError::Address(format!("no file name in {url}")))
}

/// Version number embedded in the test-helper patch.
pub fn miqqe_patch_version(patch: &str) -> Result<Option<u32>, ApplianceError> {
    let pattern = compile(r"MiqQE_version = (\d+);")?;
    Ok(pattern
        .captures(patch)
        .and_then(|c| c[1].parse().ok()))
}

impl Appliance {
    async fn rake(&self, operation: &str, task: &str) -> Result<CommandResult, ApplianceError> {
        let client = self.ssh_client().await?;
        let result = client.run_rake(task).await?;
        self.check(operation, result)
    }

    /// Drop `vmdb_production` after restarting PostgreSQL to shed connections.
    pub async fn drop_database(&self) -> Result<(), ApplianceError> {
        self.logged("drop database", async {
            let client = self.db_ssh_client().await?;
            WaitFor::new("database to drop")
                .delay(Duration::from_secs(5))
                .timeout(Duration::from_secs(60))
                .until(|| {
                    let client = client.clone();
                    async move {
                        client
                            .run(
                                &format!("systemctl restart {POSTGRES_SCL}-postgresql"),
                                Some(Duration::from_secs(60)),
                            )
                            .await?;
                        client.run("dropdb vmdb_production", None).await?;
                        let left = client
                            .run("psql -l | grep vmdb_production | wc -l", None)
                            .await?;
                        Ok::<_, ApplianceError>(left.output.trim() == "0")
                    }
                })
                .await?;
            self.server_details_changed();
            Ok(())
        })
        .await
    }

    /// Dump the database to a local file on the appliance. Returns the path.
    pub async fn backup_database(&self, path: Option<&str>) -> Result<String, ApplianceError> {
        let path = path.unwrap_or(DEFAULT_BACKUP_PATH).to_string();
        self.logged("backup database", async {
            self.rake(
                "backup database",
                &format!(
                    "evm:db:backup:local --trace -- --local-file {} --dbname vmdb_production",
                    shell_quote(&path)
                ),
            )
            .await?;
            Ok(path.clone())
        })
        .await
    }

    pub async fn restore_database(&self, path: Option<&str>) -> Result<(), ApplianceError> {
        let path = path.unwrap_or(DEFAULT_BACKUP_PATH);
        self.logged("restore database", async {
            self.rake(
                "restore database",
                &format!("evm:db:restore:local --trace -- --local-file {}", shell_quote(path)),
            )
            .await?;
            self.server_details_changed();
            Ok(())
        })
        .await
    }

    pub async fn precompile_assets(&self) -> Result<(), ApplianceError> {
        self.logged("precompile assets", async {
            self.rake("clobber assets", "assets:clobber").await?;
            self.rake("precompile assets", "assets:precompile").await?;
            Ok(())
        })
        .await
    }

    /// Copy an automate domain under a new name, unlocked and enabled.
    pub async fn clone_domain(&self, source: &str, dest: &str) -> Result<(), ApplianceError> {
        self.logged("clone automate domain", async {
            self.wait_for_db(None).await?;
            info!(appliance = %self, source, dest, "Cloning automate domain");
            let dir = format!("/tmp/{source}");
            self.run_checked("create export directory", &format!("mkdir -p {dir}"))
                .await?;
            self.rake(
                "export automate domain",
                &format!(
                    "evm:automate:export DOMAIN={source} EXPORT_DIR={dir} PREVIEW=false OVERWRITE=true"
                ),
            )
            .await?;
            self.run_checked(
                "unlock exported domain",
                &format!("sed -i 's/system: true/system: false/g' {dir}/{source}/__domain__.yaml"),
            )
            .await?;
            self.rake(
                "import automate domain",
                &format!(
                    "evm:automate:import DOMAIN={source} IMPORT_DIR={dir} PREVIEW=false OVERWRITE=true IMPORT_AS={dest} ENABLED=true"
                ),
            )
            .await?;
            Ok(())
        })
        .await
    }

    pub async fn reset_automate_model(&self) -> Result<(), ApplianceError> {
        self.logged("reset automate model", async {
            self.rake("reset automate model", "evm:automate:reset")
                .await
                .map(|_| ())
        })
        .await
    }

    /// Move 9 GB from the repo volume to `/var`. Runs once per appliance.
    pub async fn extend_db_partition(&self) -> Result<bool, ApplianceError> {
        self.logged("extend DB partition", async {
            if self.run(&format!("test -e {PARTITION_MARKER}")).await?.success() {
                debug!(appliance = %self, "Partition already extended");
                return Ok(false);
            }
            let before = self.run("df -h").await?;
            debug!(appliance = %self, df = %before.output, "Disk usage before extending");
            for (operation, command) in [
                ("unmount repo volume", "umount /repo"),
                (
                    "shrink repo volume",
                    "lvreduce --force --size -9GB /dev/mapper/VG--CFME-lv_repo",
                ),
                ("format repo volume", "mkfs.xfs -f /dev/mapper/VG--CFME-lv_repo"),
                (
                    "extend var volume",
                    "lvextend --resizefs --size +9GB /dev/mapper/VG--CFME-lv_var",
                ),
                ("remount volumes", "mount -a"),
            ] {
                self.run_checked(operation, command).await?;
            }
            let after = self.run("df -h").await?;
            debug!(appliance = %self, df = %after.output, "Disk usage after extending");
            self.run_checked("mark partition extended", &format!("touch {PARTITION_MARKER}"))
                .await?;
            Ok(true)
        })
        .await
    }

    /// Strip host identity (keys, MAC, hostname, logs) before templatizing.
    pub async fn seal_for_templatizing(&self) -> Result<(), ApplianceError> {
        self.logged("seal for templatizing", async {
            let network = "/etc/sysconfig/network";
            let ifcfg = "/etc/sysconfig/network-scripts/ifcfg-eth0";
            self.run_checked("remove SSH host keys", "rm -rf /etc/ssh/ssh_host_*")
                .await?;
            if self.run(&format!("grep '^HOSTNAME' {network}")).await?.success() {
                self.run_checked(
                    "reset hostname",
                    &format!("sed -i -r -e 's/^HOSTNAME=.*$/HOSTNAME=localhost.localdomain/' {network}"),
                )
                .await?;
            } else {
                self.run_checked(
                    "reset hostname",
                    &format!("echo HOSTNAME=localhost.localdomain >> {network}"),
                )
                .await?;
            }
            self.run_checked("remove HWADDR", &format!("sed -i -r -e '/^HWADDR/d' {ifcfg}"))
                .await?;
            self.run_checked("remove UUID", &format!("sed -i -r -e '/^UUID/d' {ifcfg}"))
                .await?;
            self.run_checked("remove udev rules", "rm -f /etc/udev/rules.d/70-*")
                .await?;
            self.run("restorecon -R /etc/sysconfig/network-scripts").await?;
            self.run(&format!("restorecon {network}")).await?;

            self.stop_evm_service().await?;
            self.run_checked(
                "archive logs",
                &format!(
                    "mkdir -p {VMDB_ROOT}/log/preconfigure-logs && \
                     mv {VMDB_ROOT}/log/*.log {VMDB_ROOT}/log/*.gz {VMDB_ROOT}/log/preconfigure-logs/ 2>/dev/null; true"
                ),
            )
            .await?;
            self.run_checked(
                "lower swappiness",
                "echo \"vm.swappiness = 1\" >> /etc/sysctl.conf",
            )
            .await?;
            Ok(())
        })
        .await
    }

    /// Install the VMware VDDK from an RPM URL.
    pub async fn install_vddk(&self, url: &str, reboot: bool, force: bool) -> Result<bool, ApplianceError> {
        self.logged("install VDDK", async {
            let installed = self.run(&format!("test -d {VDDK_LIB}")).await?.success();
            if installed && !force {
                info!(appliance = %self, "VDDK already installed");
                return Ok(false);
            }
            let file = format!("/tmp/{}", file_name_of(url)?);
            self.run_checked("download VDDK", &format!("curl {} -o {file}", shell_quote(url)))
                .await?;
            self.run_checked("install VDDK", &format!("yum -y install {file}"))
                .await?;
            self.run_checked("verify VDDK", "ldconfig -p | grep vix")
                .await?;
            if reboot {
                self.reboot(true).await?;
            }
            Ok(true)
        })
        .await
    }

    /// Install the NetApp SDK zip and enable storage support.
    pub async fn install_netapp_sdk(&self, url: &str, reboot: bool) -> Result<(), ApplianceError> {
        self.logged("install NetApp SDK", async {
            let name = file_name_of(url)?;
            let file = format!("/tmp/{name}");
            let folder = name.trim_end_matches(".zip");
            let lib_dir = format!("{VMDB_ROOT}/lib/{folder}/lib/linux-64");

            self.run_checked(
                "download NetApp SDK",
                &format!("wget {} -O {file} > /root/unzip.out 2>&1", shell_quote(url)),
            )
            .await?;
            self.run_checked(
                "unpack NetApp SDK",
                &format!("unzip -o -d {VMDB_ROOT}/lib/ {file}"),
            )
            .await?;
            if self
                .run(&format!("grep -F {} /etc/default/evm", shell_quote(&lib_dir)))
                .await?
                .failed()
            {
                self.run_checked(
                    "extend library path",
                    &format!(
                        "echo 'export LD_LIBRARY_PATH=$LD_LIBRARY_PATH:{lib_dir}' >> /etc/default/evm"
                    ),
                )
                .await?;
            }
            self.run_checked("refresh linker cache", "ldconfig").await?;
            self.update_yaml_config(|doc| {
                set_yaml_path(doc, "product.storage", serde_yaml_ng::Value::Bool(true))
            })
            .await?;
            self.run_checked("mark NetApp installed", &format!("touch {NETAPP_MARKER}"))
                .await?;
            self.cache.invalidate_fact(Fact::Storage);

            if reboot {
                self.reboot(true).await
            } else {
                self.restart_evm_service(false).await
            }
        })
        .await
    }

    /// Check out a development branch of the application and rebuild.
    pub async fn use_dev_branch(&self, repo: &str, branch: &str) -> Result<(), ApplianceError> {
        self.logged("switch to development branch", async {
            let add = format!("cd {VMDB_ROOT}; git remote add dev_branch {}", shell_quote(repo));
            if self.run(&add).await?.failed() {
                debug!(appliance = %self, "Replacing existing dev_branch remote");
                self.run(&format!("cd {VMDB_ROOT}; git remote remove dev_branch"))
                    .await?;
                self.run_checked("add git remote", &add).await?;
            }
            self.run_checked("fetch remotes", &format!("cd {VMDB_ROOT}; git remote update"))
                .await?;
            self.stop_evm_service().await?;
            self.run_checked(
                "check out branch",
                &format!("cd {VMDB_ROOT}; git checkout dev_branch/{}", shell_quote(branch)),
            )
            .await?;
            self.run_checked("rebuild application", &format!("cd {VMDB_ROOT}; bin/update"))
                .await?;
            self.start_evm_service().await?;
            self.wait_for_evm_service(None).await?;
            self.wait_for_web_ui(true, None).await
        })
        .await
    }

    /// Only builds older than 5.6.3 need the test-helper JS patch.
    pub async fn is_miqqe_patch_candidate(&self) -> Result<bool, ApplianceError> {
        Ok(self.version().await?.below("5.6.3"))
    }

    async fn local_miqqe_patch(&self) -> Result<(std::path::PathBuf, String), ApplianceError> {
        let dir = self
            .config
            .miqqe
            .patch_dir
            .clone()
            .ok_or_else(|| ConfigError::Missing("miqqe.patch_dir".to_string()))?;
        let text = tokio::fs::read_to_string(dir.join("miq_application.js.diff")).await?;
        Ok((dir, text))
    }

    /// Whether the installed patch matches the local one.
    pub async fn miqqe_patch_applied(&self) -> Result<bool, ApplianceError> {
        let (_, patch) = self.local_miqqe_patch().await?;
        let wanted = miqqe_patch_version(&patch)?;
        Ok(wanted.is_some() && self.miqqe_version().await? == wanted)
    }

    async fn apply_patch(&self, local: &Path, target: &str) -> Result<(), ApplianceError> {
        let client = self.ssh_client().await?;
        let remote = random_remote_path("diff");
        client.put_file(local, &remote).await?;
        let result = client.run(&format!("patch {target} {remote}"), None).await;
        if let Err(e) = client.remove_remote(&remote).await {
            warn!(appliance = %self, path = %remote, error = %e, "Failed to remove uploaded patch");
        }
        self.check(&format!("patch {target}"), result?)?;
        Ok(())
    }

    /// Apply the test-helper JS patch and rebuild assets.
    ///
    /// Returns `false` when the build does not need it or it is already applied.
    pub async fn patch_with_miqqe(&self) -> Result<bool, ApplianceError> {
        self.logged("apply test-helper patch", async {
            if !self.is_miqqe_patch_candidate().await? {
                debug!(appliance = %self, "Build does not need the test-helper patch");
                return Ok(false);
            }
            if self.miqqe_patch_applied().await? {
                return Ok(false);
            }
            let (dir, patch) = self.local_miqqe_patch().await?;
            let version = miqqe_patch_version(&patch)?.ok_or_else(|| {
                ConfigError::Invalid {
                    key: "miqqe.patch_dir".to_string(),
                    message: format!(
                        "{} has no MiqQE_version marker",
                        dir.join("miq_application.js.diff").display()
                    ),
                }
            })?;
            let autofocus = if self.version().await?.below("5.7") {
                "autofocus.js.diff"
            } else {
                "autofocus_57.js.diff"
            };
            self.apply_patch(&dir.join("miq_application.js.diff"), MIQ_APPLICATION_JS)
                .await?;
            self.apply_patch(&dir.join(autofocus), AUTOFOCUS_JS).await?;

            self.precompile_assets().await?;
            self.restart_evm_service(false).await?;
            self.wait_for_web_ui(true, Some(Duration::from_secs(300)))
                .await?;
            self.run_checked(
                "record patch version",
                &format!("echo '{version}' > {MIQQE_MARKER}"),
            )
            .await?;
            self.cache.invalidate_fact(Fact::MiqqePatch);
            Ok(true)
        })
        .await
    }

    /// Best-effort explanation of why the EVM service is not coming up.
    ///
    /// Tries the cheap fixes (restart PostgreSQL, restart evmserverd) along
    /// the way. `None` means nothing wrong was found.
    pub async fn diagnose_evm_failure(&self) -> Result<Option<String>, ApplianceError> {
        if self.address().await.is_err() {
            return Ok(Some(
                "appliance has no IP Address; provisioning failed or networking is broken".into(),
            ));
        }
        if !self.is_ssh_running().await {
            return Ok(Some("ssh is not running; ssh auth or networking failed".into()));
        }
        if !self.db_online().await {
            let client = self.db_ssh_client().await?;
            let restart = client
                .run(&format!("systemctl restart {POSTGRES_SCL}-postgresql"), None)
                .await?;
            if restart.failed() {
                return Ok(Some(format!("postgres failed to start:\n{}", restart.output)));
            }
            return Ok(Some("postgres was not running for unknown reasons".into()));
        }
        if !self.db_has_database().await {
            return Ok(Some("vmdb_production database does not exist".into()));
        }
        if !self.db_has_tables().await {
            return Ok(Some("vmdb_production has no tables".into()));
        }
        if let Err(e) = self.restart_evm_service(false).await {
            return Ok(Some(format!("evmserverd failed to start:\n{e}")));
        }
        Ok(None)
    }
}

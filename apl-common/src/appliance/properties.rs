//! Facts read off the appliance filesystem and cached for its lifetime.

use chrono::{DateTime, FixedOffset};
use regex::Regex;
use tracing::warn;

use super::Appliance;
use super::scripts;
use crate::errors::ApplianceError;
use crate::remote::{ShellExt, VMDB_ROOT};
use crate::util::{random_remote_path, render_template};
use crate::version::Version;

/// Software collection that ships PostgreSQL on the appliance.
pub const POSTGRES_SCL: &str = "rh-postgresql95";

pub(crate) fn compile(pattern: &str) -> Result<Regex, ApplianceError> {
    Regex::new(pattern)
        .map_err(|e| ApplianceError::Consistency(format!("bad pattern {pattern}: {e}")))
}

impl Appliance {
    /// Product version from `VERSION`.
    pub async fn version(&self) -> Result<Version, ApplianceError> {
        self.cache
            .version
            .get_or_try_init(|| async {
                let result = self.run(&format!("cat {VMDB_ROOT}/VERSION")).await?;
                let result = self.check("read VMDB version", result)?;
                Ok(Version::parse(result.output.trim()))
            })
            .await
    }

    /// Build identifier; upstream appliances have none and report `master`.
    pub async fn build(&self) -> Result<String, ApplianceError> {
        self.cache
            .build
            .get_or_try_init(|| async {
                if !self.is_downstream().await? {
                    return Ok(crate::version::LATEST.to_string());
                }
                let result = self.run(&format!("cat {VMDB_ROOT}/BUILD")).await?;
                let result = self.check("read VMDB build", result)?;
                Ok(result.output.trim_end_matches('\n').to_string())
            })
            .await
    }

    /// Operating system release, parsed from `/etc/redhat-release`.
    pub async fn os_version(&self) -> Result<Version, ApplianceError> {
        self.cache
            .os_version
            .get_or_try_init(|| async {
                let result = self.run("cat /etc/redhat-release").await?;
                let result = self.check("read OS release", result)?;
                let release = compile(r"release\s+(\S+)")?;
                let raw = release
                    .captures(&result.output)
                    .and_then(|c| c.get(1))
                    .map(|m| m.as_str())
                    .ok_or_else(|| {
                        self.lifecycle_error("parse OS release", &result.output)
                    })?;
                Ok(Version::parse(raw))
            })
            .await
    }

    pub async fn guid(&self) -> Result<String, ApplianceError> {
        self.cache
            .guid
            .get_or_try_init(|| async {
                let result = self.run(&format!("cat {VMDB_ROOT}/GUID")).await?;
                let result = self.check("read server GUID", result)?;
                Ok(result.output.trim().to_string())
            })
            .await
    }

    /// Downstream (product) builds ship a `BUILD` file.
    pub async fn is_downstream(&self) -> Result<bool, ApplianceError> {
        self.cache
            .is_downstream
            .get_or_try_init(|| async {
                Ok(self.run(&format!("stat {VMDB_ROOT}/BUILD")).await?.success())
            })
            .await
    }

    /// Product name as the UI shows it. Falls back to `ManageIQ`.
    pub async fn product_name(&self) -> Result<String, ApplianceError> {
        self.cache
            .product_name
            .get_or_try_init(|| async {
                let out_file = random_remote_path("txt");
                let client = self.ssh_client().await?;
                let script = render_template(scripts::PRODUCT_NAME, &[("out_file", &out_file)]);
                let written = client.run_rails(&script).await?;
                let name = match client.read_remote(&out_file).await? {
                    Some(name) if written.success() && !name.trim().is_empty() => {
                        name.trim().to_string()
                    }
                    _ => {
                        warn!(appliance = %self, "Could not read product name, assuming ManageIQ");
                        "ManageIQ".to_string()
                    }
                };
                client.remove_remote(&out_file).await?;
                Ok(name)
            })
            .await
    }

    /// Version of the test-helper JS patch, if applied.
    pub async fn miqqe_version(&self) -> Result<Option<u32>, ApplianceError> {
        self.cache
            .miqqe_version
            .get_or_try_init(|| async {
                let result = self
                    .run(&format!("grep \"[0-9]\\+\" {VMDB_ROOT}/.miqqe_version"))
                    .await?;
                if result.failed() {
                    return Ok(None);
                }
                Ok(result.output.trim().parse().ok())
            })
            .await
    }

    /// Current appliance clock, in UTC.
    pub async fn utc_time(&self) -> Result<DateTime<FixedOffset>, ApplianceError> {
        let result = self.run_checked("read clock", "date --iso-8601=seconds -u").await?;
        DateTime::parse_from_rfc3339(result.output.trim())
            .map_err(|e| self.lifecycle_error("parse clock", &format!("{e}: {}", result.output)))
    }

    /// Used swap in megabytes; `None` if `free` output was not parsable.
    pub async fn swap(&self) -> Result<Option<u64>, ApplianceError> {
        let result = self
            .run_with_timeout(
                "free -m | tr -s \" \" \" \" | cut -f 3 -d \" \" | tail -n 1",
                Some(std::time::Duration::from_secs(15)),
            )
            .await?;
        Ok(result.output.trim().parse().ok())
    }

    /// Whether `host` names this machine (loopback or one of its interfaces).
    pub(crate) async fn is_local_address(&self, host: &str) -> bool {
        let host = host.trim();
        if host.starts_with("127.") || host.contains("localhost") {
            return true;
        }
        match self.run("ip address show").await {
            Ok(result) => result.output.contains(host),
            Err(e) => {
                warn!(appliance = %self, error = %e, "Could not list interfaces");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_pattern() {
        let re = compile(r"release\s+(\S+)").unwrap();
        let caps = re
            .captures("Red Hat Enterprise Linux Server release 7.3 (Maipo)")
            .unwrap();
        assert_eq!(&caps[1], "7.3");
        let caps = re.captures("CentOS Linux release 7.4.1708 (Core)").unwrap();
        assert_eq!(&caps[1], "7.4.1708");
    }

    #[test]
    fn test_bad_pattern_is_consistency_error() {
        assert!(matches!(compile("("), Err(ApplianceError::Consistency(_))));
    }
}

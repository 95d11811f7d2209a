//! The appliance's advanced settings document.
//!
//! Reads dump the server-side settings to YAML and fetch the file. Writes
//! upload a replacement document plus a small Ruby script that applies it.
//! Every write clears whatever was derived from the old document.

use serde_yaml_ng::{Mapping, Value};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Appliance;
use super::scripts;
use crate::errors::ApplianceError;
use crate::remote::ShellExt;
use crate::util::{random_remote_path, render_template};
use crate::wait::WaitFor;

const DUMP_FILE: &str = "/tmp/yam_dump.yaml";

/// Look up `a.b.c` in a YAML mapping tree.
pub fn yaml_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(doc, |node, key| node.get(key))
}

/// Set `a.b.c` in a YAML mapping tree, creating intermediate mappings.
pub fn set_yaml_path(doc: &mut Value, path: &str, value: Value) -> Result<(), ApplianceError> {
    let mut keys = path.split('.').peekable();
    let mut node = doc;
    while let Some(key) = keys.next() {
        if node.is_null() {
            *node = Value::Mapping(Mapping::new());
        }
        let map = node.as_mapping_mut().ok_or_else(|| {
            ApplianceError::Settings(format!(
                "cannot set {path}: {key} is under a non-mapping value"
            ))
        })?;
        let key = Value::String(key.to_string());
        if keys.peek().is_none() {
            map.insert(key, value);
            return Ok(());
        }
        node = map.entry(key).or_insert(Value::Null);
    }
    Ok(())
}

impl Appliance {
    /// Fetch the effective settings document.
    pub async fn get_yaml_config(&self) -> Result<Value, ApplianceError> {
        let client = self.ssh_client().await?;
        let dump = render_template(scripts::DUMP_CONFIG, &[("dump_file", DUMP_FILE)]);
        let result = client.run_rails(&dump).await?;
        if result.failed() {
            return Err(self.lifecycle_error("dump settings", &result.output));
        }
        let result = client.run(&format!("cat {DUMP_FILE}"), None).await?;
        if result.failed() {
            return Err(self.lifecycle_error("read settings dump", &result.output));
        }
        serde_yaml_ng::from_str(&result.output)
            .map_err(|e| ApplianceError::Settings(format!("{DUMP_FILE}: {e}")))
    }

    /// Replace the settings document.
    pub async fn set_yaml_config(&self, document: &Value) -> Result<(), ApplianceError> {
        let outcome = self.push_yaml_config(document).await;
        // Even a failed apply may have partially written settings.
        self.settings_changed();
        outcome
    }

    async fn push_yaml_config(&self, document: &Value) -> Result<(), ApplianceError> {
        let client = self.ssh_client().await?;
        let yaml = serde_yaml_ng::to_string(document)
            .map_err(|e| ApplianceError::Settings(e.to_string()))?;

        let mut local_yaml = tempfile::NamedTempFile::new()?;
        local_yaml.write_all(yaml.as_bytes())?;
        local_yaml.flush()?;
        let remote_yaml = random_remote_path("yaml");
        client.put_file(local_yaml.path(), &remote_yaml).await?;

        let script = render_template(scripts::SET_CONFIG, &[("config_file", &remote_yaml)]);
        let mut local_rb = tempfile::NamedTempFile::new()?;
        local_rb.write_all(script.as_bytes())?;
        local_rb.flush()?;
        let remote_rb = random_remote_path("rb");

        let result = match client.put_file(local_rb.path(), &remote_rb).await {
            Ok(()) => client.run_rails(&remote_rb).await,
            Err(e) => Err(e),
        };
        for path in [&remote_yaml, &remote_rb] {
            if let Err(e) = client.remove_remote(path).await {
                warn!(appliance = %self, path = %path, error = %e, "Failed to remove generated file");
            }
        }
        let result = result?;
        if result.failed() {
            return Err(self.lifecycle_error("apply settings", &result.output));
        }
        debug!(appliance = %self, "Settings applied");
        Ok(())
    }

    /// Fetch, edit and write back the settings document.
    pub async fn update_yaml_config<F>(&self, edit: F) -> Result<(), ApplianceError>
    where
        F: FnOnce(&mut Value) -> Result<(), ApplianceError>,
    {
        let mut document = self.get_yaml_config().await?;
        edit(&mut document)?;
        self.set_yaml_config(&document).await
    }

    /// Set the UI session timeout, writing only when it differs.
    pub async fn set_session_timeout(&self, timeout: Duration) -> Result<(), ApplianceError> {
        let mut document = self.get_yaml_config().await?;
        let seconds = timeout.as_secs();
        if yaml_path(&document, "session.timeout").and_then(Value::as_u64) == Some(seconds) {
            return Ok(());
        }
        set_yaml_path(&mut document, "session.timeout", Value::from(seconds))?;
        self.set_yaml_config(&document).await
    }

    /// Change the server name. Takes effect after an EVM restart.
    pub async fn rename(&self, new_name: &str) -> Result<(), ApplianceError> {
        info!(appliance = %self, name = new_name, "Renaming appliance");
        self.update_yaml_config(|doc| {
            set_yaml_path(doc, "server.name", Value::String(new_name.to_string()))
        })
        .await
    }

    /// `server.host` from the settings, if any.
    pub async fn get_host_address(&self) -> Result<Option<String>, ApplianceError> {
        self.cache
            .host_address
            .get_or_try_init(|| async {
                let document = self.get_yaml_config().await?;
                Ok(yaml_path(&document, "server.host")
                    .and_then(Value::as_str)
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty()))
            })
            .await
    }

    /// Poll the settings for `server.host`; `None` if it never shows up.
    pub async fn wait_for_host_address(&self) -> Option<String> {
        let outcome = WaitFor::new("host address in settings")
            .delay(Duration::from_secs(5))
            .timeout(Duration::from_secs(120))
            .until(|| async move {
                self.cache.host_address.clear();
                self.get_host_address().await
            })
            .await;
        match outcome {
            Ok(outcome) => outcome.value,
            Err(e) => {
                warn!(appliance = %self, error = %e, "Host address never appeared in settings");
                None
            }
        }
    }

    pub async fn company_name(&self) -> Result<Option<String>, ApplianceError> {
        self.cache
            .company_name
            .get_or_try_init(|| async {
                let document = self.get_yaml_config().await?;
                Ok(yaml_path(&document, "server.company")
                    .and_then(Value::as_str)
                    .map(str::to_string))
            })
            .await
    }

    /// Whether the settings carry a `product.storage` key.
    pub async fn is_storage_enabled(&self) -> Result<bool, ApplianceError> {
        self.cache
            .is_storage_enabled
            .get_or_try_init(|| async {
                let document = self.get_yaml_config().await?;
                Ok(yaml_path(&document, "product.storage").is_some())
            })
            .await
    }
}

//! Yum repository files under `/etc/yum.repos.d`.

use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

use super::Appliance;
use super::properties::compile;
use crate::errors::ApplianceError;
use crate::util::shell_quote;

pub const REPO_DIR: &str = "/etc/yum.repos.d";

/// Product name and version in an update URL, e.g. `/CloudForms/5.8/`.
const PRODUCT_URL: &str = r"/((?:[A-Z]+|CloudForms|rhel|RHEL_Guest))(?:-|/|/server/)(\d+[^/]*)/";

/// A repo file to write: `[update-<id>]` plus extra `key=value` options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoFile {
    pub id: String,
    pub url: String,
    pub options: BTreeMap<String, String>,
}

impl RepoFile {
    /// `gpgcheck=0` and `enabled=1` unless overridden.
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        let options = [("enabled", "1"), ("gpgcheck", "0")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            id: id.into(),
            url: url.into(),
            options,
        }
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn path(&self) -> String {
        format!("{REPO_DIR}/{}.repo", self.id)
    }

    pub fn render(&self) -> String {
        let mut out = format!(
            "[update-{id}]\nname=update-url-{id}\nbaseurl={url}\n",
            id = self.id,
            url = self.url
        );
        for (key, value) in &self.options {
            out.push_str(&format!("{key}={value}\n"));
        }
        out
    }
}

/// `(repo id, baseurl)` of a repo file written by this module.
pub fn parse_repo(contents: &str) -> Result<Option<(String, String)>, ApplianceError> {
    let name = compile(r"(?m)^\[update-([^\]]+)\]")?;
    let baseurl = compile(r"baseurl\s*=\s*(\S+)")?;
    let Some(id) = name.captures(contents).and_then(|c| c.get(1)) else {
        return Ok(None);
    };
    let Some(url) = baseurl.captures(contents).and_then(|c| c.get(1)) else {
        return Ok(None);
    };
    Ok(Some((id.as_str().to_string(), url.as_str().to_string())))
}

/// `(product, version)` named by an update URL.
pub fn product_of_url(url: &str) -> Result<Option<(String, String)>, ApplianceError> {
    let pattern = compile(PRODUCT_URL)?;
    Ok(pattern
        .captures(url)
        .map(|c| (c[1].to_string(), c[2].to_string())))
}

impl Appliance {
    /// Repo files on the appliance, except `redhat.repo`.
    pub async fn get_repofile_list(&self) -> Result<Vec<String>, ApplianceError> {
        let result = self.run(&format!("ls {REPO_DIR}")).await?;
        Ok(result
            .output
            .lines()
            .map(str::trim)
            .filter(|f| f.ends_with(".repo") && *f != "redhat.repo")
            .map(str::to_string)
            .collect())
    }

    /// Repo id to baseurl for every `update-*` repo.
    pub async fn read_repos(&self) -> Result<BTreeMap<String, String>, ApplianceError> {
        let mut repos = BTreeMap::new();
        for file in self.get_repofile_list().await? {
            let result = self.run(&format!("cat {REPO_DIR}/{file}")).await?;
            if result.failed() {
                continue;
            }
            if let Some((id, url)) = parse_repo(result.output.trim())? {
                repos.insert(id, url);
            }
        }
        Ok(repos)
    }

    /// Product to (version to repo id).
    pub async fn find_product_repos(
        &self,
    ) -> Result<BTreeMap<String, BTreeMap<String, String>>, ApplianceError> {
        let mut products: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (id, url) in self.read_repos().await? {
            if let Some((product, version)) = product_of_url(&url)? {
                products.entry(product).or_default().insert(version, id);
            }
        }
        Ok(products)
    }

    pub async fn write_repofile(&self, repo: &RepoFile) -> Result<String, ApplianceError> {
        info!(appliance = %self, id = %repo.id, url = %repo.url, "Writing repo file");
        self.run_checked(
            "write repo file",
            &format!("printf '%s' {} > {}", shell_quote(&repo.render()), repo.path()),
        )
        .await?;
        Ok(repo.id.clone())
    }

    /// Add an update URL, replacing any other version of the same product.
    ///
    /// A URL that is already configured is just enabled. `options` only
    /// apply to a newly written file.
    pub async fn add_product_repo(
        &self,
        url: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<String, ApplianceError> {
        let Some((product, _)) = product_of_url(url)? else {
            return Err(ApplianceError::Unsupported(format!(
                "update URL {url} names no product and version"
            )));
        };
        for (id, existing) in self.read_repos().await? {
            if existing == url {
                self.enable_disable_repo(&id, true).await?;
                return Ok(id);
            }
        }
        if let Some(versions) = self.find_product_repos().await?.get(&product) {
            for (version, id) in versions {
                info!(appliance = %self, %product, %version, id = %id, "Removing older product repo");
                self.run(&format!("rm -f {REPO_DIR}/{id}.repo")).await?;
            }
        }
        let mut repo = RepoFile::new(Uuid::new_v4().simple().to_string(), url);
        for (key, value) in options {
            repo = repo.option(key, value);
        }
        self.write_repofile(&repo).await
    }

    pub async fn enable_disable_repo(&self, id: &str, enable: bool) -> Result<bool, ApplianceError> {
        info!(appliance = %self, id, enable, "Toggling repository");
        let flag = u8::from(enable);
        let result = self
            .run(&format!(
                "sed -i 's/^enabled=./enabled={flag}/' {REPO_DIR}/{id}.repo"
            ))
            .await?;
        Ok(result.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_product_of_url() {
        assert_eq!(
            product_of_url("http://example.com/CloudForms/5.8/x86_64/").unwrap(),
            Some(("CloudForms".to_string(), "5.8".to_string()))
        );
        assert_eq!(
            product_of_url("http://example.com/rhel/server/7.3/os/").unwrap(),
            Some(("rhel".to_string(), "7.3".to_string()))
        );
        assert_eq!(product_of_url("http://example.com/other/").unwrap(), None);
    }

    #[test]
    fn test_render_then_parse() {
        let repo = RepoFile::new("abc", "http://example.com/CFME-5.8/").option("priority", "1");
        let text = repo.render();
        assert!(text.contains("gpgcheck=0\n"));
        assert!(text.contains("priority=1\n"));
        assert_eq!(
            parse_repo(&text).unwrap(),
            Some(("abc".to_string(), "http://example.com/CFME-5.8/".to_string()))
        );
    }

    #[test]
    fn test_foreign_repo_ignored() {
        let text = "[rhel-7-server-rpms]\nbaseurl=http://cdn/\n";
        assert_eq!(parse_repo(text).unwrap(), None);
    }
}

//! Server identity, zones and roles, as recorded in the region database.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Appliance;
use super::settings::set_yaml_path;
use crate::errors::{ApplianceError, StoreError};
use crate::store::{Query, Row};
use crate::wait::WaitFor;

/// Width of each region's id range.
pub const REGION_ID_SPAN: i64 = 1_000_000_000_000;

/// EMS types recognised by endpoint address.
pub const RECOGNIZED_BY_IP: &[&str] = &[
    "InfraManager",
    "ContainerManager",
    "MiddlewareManager",
    "Openstack::CloudManager",
];

/// EMS types recognised by credentials.
pub const RECOGNIZED_BY_CREDS: &[&str] = &["CloudManager"];

const OPENSTACK_INFRA: &str = "EmsOpenstackInfra";

/// Where this appliance's server sits in the region database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerIdentity {
    pub region: i64,
    pub name: String,
    pub id: i64,
    pub zone_id: Option<i64>,
}

/// Pick this appliance's server out of `servers` for one region.
///
/// Only servers whose id falls in the region's range are considered, and
/// of those only one whose address or GUID is ours.
pub fn match_server<'a>(
    servers: &'a [Row],
    region: i64,
    address: &str,
    guid: Option<&str>,
) -> Option<&'a Row> {
    let low = region * REGION_ID_SPAN;
    let high = low + REGION_ID_SPAN;
    servers.iter().find(|server| {
        let in_region = server.i64("id").is_some_and(|id| id >= low && id < high);
        let ours = server.str("ipaddress") == Some(address)
            || (guid.is_some() && server.str("guid") == guid);
        in_region && ours
    })
}

fn missing_table_as_none<T>(result: Result<T, StoreError>) -> Result<Option<T>, ApplianceError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StoreError::MissingTable(table)) => {
            debug!(table, "Table not present");
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

impl Appliance {
    /// Region, name, id and zone of this appliance's server; `None` if the
    /// database does not know it.
    pub async fn configuration_details(&self) -> Result<Option<ServerIdentity>, ApplianceError> {
        self.cache
            .configuration_details
            .get_or_try_init(|| async {
                let db = self.db().await?;
                let Some(regions) =
                    missing_table_as_none(db.fetch_existing(&Query::table("miq_regions")).await)?
                else {
                    return Ok(None);
                };
                let Some(servers) = missing_table_as_none(
                    db.fetch_existing(&Query::table("miq_servers").order_by("id")).await,
                )?
                else {
                    return Ok(None);
                };
                let address = self.address().await?;
                let guid = match self.guid().await {
                    Ok(guid) => Some(guid),
                    Err(e) => {
                        debug!(appliance = %self, error = %e, "No GUID, matching by address only");
                        None
                    }
                };
                for region in regions.iter().filter_map(|r| r.i64("region")) {
                    if let Some(server) = match_server(&servers, region, &address, guid.as_deref())
                    {
                        return Ok(Some(ServerIdentity {
                            region,
                            name: server.str("name").unwrap_or_default().to_string(),
                            id: server.i64("id").unwrap_or_default(),
                            zone_id: server.i64("zone_id"),
                        }));
                    }
                }
                Ok(None)
            })
            .await
    }

    pub async fn server_id(&self) -> Result<Option<i64>, ApplianceError> {
        Ok(self.configuration_details().await?.map(|s| s.id))
    }

    pub async fn server_region(&self) -> Result<Option<i64>, ApplianceError> {
        Ok(self.configuration_details().await?.map(|s| s.region))
    }

    pub async fn server_name(&self) -> Result<Option<String>, ApplianceError> {
        Ok(self.configuration_details().await?.map(|s| s.name))
    }

    pub async fn server_zone_id(&self) -> Result<Option<i64>, ApplianceError> {
        Ok(self.configuration_details().await?.and_then(|s| s.zone_id))
    }

    /// Region label as the UI prints it.
    pub async fn server_region_string(&self) -> Result<String, ApplianceError> {
        let product = self.product_name().await?;
        let region = self
            .server_region()
            .await?
            .map(|r| r.to_string())
            .unwrap_or_else(|| "None".to_string());
        Ok(format!("{product} Region: Region {region} [{region}]"))
    }

    /// Id of the server row carrying our GUID.
    pub async fn evm_id(&self) -> Result<Option<i64>, ApplianceError> {
        self.cache
            .evm_id
            .get_or_try_init(|| async {
                let guid = self.guid().await?;
                let db = self.db().await?;
                let row = db
                    .first(&Query::table("miq_servers").eq("guid", guid))
                    .await?;
                Ok(row.and_then(|r| r.i64("id")))
            })
            .await
    }

    pub async fn zone_description(&self) -> Result<Option<String>, ApplianceError> {
        self.cache
            .zone_description
            .get_or_try_init(|| async {
                let Some(zone_id) = self.server_zone_id().await? else {
                    return Ok(None);
                };
                let db = self.db().await?;
                let row = db.first(&Query::table("zones").eq("id", zone_id)).await?;
                Ok(row.and_then(|r| r.str("description").map(str::to_string)))
            })
            .await
    }

    /// Id of the first non-master server.
    pub async fn slave_server_zone_id(&self) -> Result<Option<i64>, ApplianceError> {
        let db = self.db().await?;
        let row = db
            .first(&Query::table("miq_servers").eq("is_master", false).order_by("id"))
            .await?;
        Ok(row.and_then(|r| r.i64("id")))
    }

    pub async fn slave_server_name(&self) -> Result<Option<String>, ApplianceError> {
        let Some(id) = self.slave_server_zone_id().await? else {
            return Ok(None);
        };
        let db = self.db().await?;
        let row = db.first(&Query::table("miq_servers").eq("id", id)).await?;
        Ok(row.and_then(|r| r.str("name").map(str::to_string)))
    }

    pub async fn host_id(&self, hostname: &str) -> Result<Option<String>, ApplianceError> {
        let db = self.db().await?;
        let row = db.first(&Query::table("hosts").eq("name", hostname)).await?;
        Ok(row.and_then(|r| r.i64("id")).map(|id| id.to_string()))
    }

    /// Names of providers of a type this harness knows how to recognise.
    /// Database errors yield an empty list.
    pub async fn managed_provider_names(&self) -> Result<Vec<String>, ApplianceError> {
        let db = self.db().await?;
        let rows = match db.fetch(&Query::table("ext_management_systems")).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(appliance = %self, error = %e, "Unable to query managed providers");
                return Ok(Vec::new());
            }
        };
        Ok(rows
            .iter()
            .filter(|ems| {
                let kind = ems.str("type").unwrap_or_default();
                RECOGNIZED_BY_IP
                    .iter()
                    .chain(RECOGNIZED_BY_CREDS)
                    .any(|known| kind.contains(known))
            })
            .filter_map(|ems| ems.str("name").map(str::to_string))
            .collect())
    }

    pub async fn has_os_infra(&self) -> Result<bool, ApplianceError> {
        let db = self.db().await?;
        let rows = db
            .fetch(&Query::table("ext_management_systems").eq("type", OPENSTACK_INFRA).limit(1))
            .await?;
        Ok(!rows.is_empty())
    }

    pub async fn has_non_os_infra(&self) -> Result<bool, ApplianceError> {
        let db = self.db().await?;
        let rows = db
            .fetch(&Query::table("ext_management_systems").ne("type", OPENSTACK_INFRA).limit(1))
            .await?;
        Ok(!rows.is_empty())
    }

    /// Whether the top-level automate domain is enabled. Unknown domains are an error.
    pub async fn check_domain_enabled(&self, domain: &str) -> Result<bool, ApplianceError> {
        let db = self.db().await?;
        let row = db
            .first(
                &Query::table("miq_ae_namespaces")
                    .eq("parent_id", Value::Null)
                    .eq("name", domain),
            )
            .await?;
        row.and_then(|r| r.bool("enabled"))
            .ok_or_else(|| self.lifecycle_error("check automate domain", &format!("No such domain: {domain}")))
    }

    /// Role name to active flag for this server.
    ///
    /// `database_owner` and `vdi_inventory` are never shown; storage roles
    /// are hidden while storage support is off.
    pub async fn server_roles(&self) -> Result<BTreeMap<String, bool>, ApplianceError> {
        let db = self.db().await?;
        let evm_id = self.evm_id().await?;
        let all_roles = db.fetch(&Query::table("server_roles")).await?;
        let active: Vec<i64> = match evm_id {
            Some(id) => db
                .fetch(
                    &Query::table("assigned_server_roles")
                        .eq("miq_server_id", id)
                        .eq("active", true),
                )
                .await?
                .iter()
                .filter_map(|r| r.i64("server_role_id"))
                .collect(),
            None => Vec::new(),
        };
        let storage = self.is_storage_enabled().await?;
        Ok(all_roles
            .iter()
            .filter_map(|role| {
                let name = role.str("name")?;
                let id = role.i64("id")?;
                Some((name.to_string(), active.contains(&id)))
            })
            .filter(|(name, _)| {
                let hidden = matches!(name.as_str(), "database_owner" | "vdi_inventory")
                    || (!storage && (name.starts_with("storage") || name == "vmdb_storage_bridge"));
                !hidden
            })
            .collect())
    }

    /// Make exactly the `true` entries of `roles` active.
    ///
    /// Returns `false` without writing anything when the roles already match.
    pub async fn set_server_roles(&self, roles: &BTreeMap<String, bool>) -> Result<bool, ApplianceError> {
        if self.server_roles().await? == *roles {
            debug!(appliance = %self, "Roles already match");
            return Ok(false);
        }
        let wanted = roles
            .iter()
            .filter(|(_, active)| **active)
            .map(|(name, _)| name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        info!(appliance = %self, roles = %wanted, "Setting server roles");
        self.update_yaml_config(|doc| {
            set_yaml_path(doc, "server.role", serde_yaml_ng::Value::String(wanted.clone()))
        })
        .await?;
        WaitFor::new("server roles to converge")
            .delay(Duration::from_secs(15))
            .timeout(self.config.timeouts.roles())
            .until(|| async move { Ok::<_, ApplianceError>(self.server_roles().await? == *roles) })
            .await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers() -> Vec<Row> {
        vec![
            Row::new().with("id", 1).with("name", "EVM").with("ipaddress", "10.0.0.5").with("guid", "g-1"),
            Row::new().with("id", 2).with("name", "EVM-2").with("ipaddress", "10.0.0.6").with("guid", "g-2"),
            Row::new()
                .with("id", REGION_ID_SPAN + 1)
                .with("name", "R1")
                .with("ipaddress", "10.0.0.6")
                .with("guid", "g-3"),
        ]
    }

    #[test]
    fn test_match_by_address_within_region() {
        let servers = servers();
        let found = match_server(&servers, 0, "10.0.0.6", None).unwrap();
        assert_eq!(found.str("name"), Some("EVM-2"));
        let found = match_server(&servers, 1, "10.0.0.6", None).unwrap();
        assert_eq!(found.str("name"), Some("R1"));
    }

    #[test]
    fn test_match_by_guid_when_address_differs() {
        let servers = servers();
        let found = match_server(&servers, 0, "192.168.1.1", Some("g-2")).unwrap();
        assert_eq!(found.i64("id"), Some(2));
    }

    #[test]
    fn test_no_match_is_none() {
        let servers = servers();
        assert!(match_server(&servers, 0, "192.168.1.1", None).is_none());
        assert!(match_server(&servers, 2, "10.0.0.5", Some("g-1")).is_none());
    }
}

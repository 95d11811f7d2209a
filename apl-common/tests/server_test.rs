//! Server identity, roles and the settings document.

mod common;

use std::collections::BTreeMap;

use apl_common::cache::CachedField;
use apl_common::remote::CommandResult;
use apl_common::store::Row;
use common::{ADDRESS, TestAppliance};

const GUID_CMD: &str = "cat /var/www/miq/vmdb/GUID";
const DUMP_CMD: &str = "cat /tmp/yam_dump.yaml";

fn seed_region(t: &TestAppliance) {
    t.store.insert("miq_regions", Row::new().with("region", 0));
    t.store.insert(
        "miq_servers",
        Row::new()
            .with("id", 1)
            .with("name", "EVM")
            .with("ipaddress", ADDRESS)
            .with("guid", "g-1")
            .with("zone_id", 1),
    );
    t.store
        .insert("zones", Row::new().with("id", 1).with("description", "Default Zone"));
}

fn seed_roles(t: &TestAppliance) {
    for (id, name) in [
        (1, "ems_inventory"),
        (2, "database_owner"),
        (3, "storage_metrics_collector"),
        (4, "reporting"),
    ] {
        t.store
            .insert("server_roles", Row::new().with("id", id).with("name", name));
    }
    t.store.insert(
        "assigned_server_roles",
        Row::new()
            .with("miq_server_id", 1)
            .with("server_role_id", 1)
            .with("active", true),
    );
    t.store.insert(
        "assigned_server_roles",
        Row::new()
            .with("miq_server_id", 1)
            .with("server_role_id", 2)
            .with("active", true),
    );
}

#[tokio::test]
async fn test_configuration_details_match_by_address() {
    let t = TestAppliance::new();
    seed_region(&t);

    assert_eq!(t.appliance.server_id().await.unwrap(), Some(1));
    assert_eq!(t.appliance.server_region().await.unwrap(), Some(0));
    assert_eq!(t.appliance.server_name().await.unwrap().as_deref(), Some("EVM"));
    assert_eq!(
        t.appliance.zone_description().await.unwrap().as_deref(),
        Some("Default Zone")
    );
}

#[tokio::test]
async fn test_configuration_details_unknown_server_is_none() {
    let t = TestAppliance::new();
    t.store.insert("miq_regions", Row::new().with("region", 0));
    t.store.insert(
        "miq_servers",
        Row::new().with("id", 1).with("name", "other").with("ipaddress", "10.0.0.77"),
    );

    assert_eq!(t.appliance.configuration_details().await.unwrap(), None);
    assert_eq!(t.appliance.server_id().await.unwrap(), None);
    assert_eq!(t.appliance.server_name().await.unwrap(), None);
    assert_eq!(t.appliance.zone_description().await.unwrap(), None);
}

#[tokio::test]
async fn test_configuration_details_without_tables_is_none() {
    let t = TestAppliance::new();
    assert_eq!(t.appliance.configuration_details().await.unwrap(), None);
}

#[tokio::test]
async fn test_configuration_details_match_by_guid() {
    let t = TestAppliance::new();
    t.channel().respond(GUID_CMD, CommandResult::new(0, "g-42\n"));
    t.store.insert("miq_regions", Row::new().with("region", 0));
    t.store.insert(
        "miq_servers",
        Row::new()
            .with("id", 7)
            .with("name", "behind-nat")
            .with("ipaddress", "172.16.0.3")
            .with("guid", "g-42"),
    );

    assert_eq!(t.appliance.server_id().await.unwrap(), Some(7));
    assert_eq!(t.appliance.evm_id().await.unwrap(), Some(7));
}

#[tokio::test]
async fn test_server_roles_hide_internal_and_storage_roles() {
    let t = TestAppliance::new();
    t.channel().respond(GUID_CMD, CommandResult::new(0, "g-1"));
    t.channel().respond(DUMP_CMD, CommandResult::new(0, "server:\n  name: EVM\n"));
    seed_region(&t);
    seed_roles(&t);

    let roles = t.appliance.server_roles().await.unwrap();
    let expected = BTreeMap::from([
        ("ems_inventory".to_string(), true),
        ("reporting".to_string(), false),
    ]);
    assert_eq!(roles, expected);
}

#[tokio::test]
async fn test_server_roles_show_storage_when_enabled() {
    let t = TestAppliance::new();
    t.channel().respond(GUID_CMD, CommandResult::new(0, "g-1"));
    t.channel().respond(
        DUMP_CMD,
        CommandResult::new(0, "product:\n  storage: true\nserver:\n  name: EVM\n"),
    );
    seed_region(&t);
    seed_roles(&t);

    let roles = t.appliance.server_roles().await.unwrap();
    assert_eq!(roles.get("storage_metrics_collector"), Some(&false));
    assert!(!roles.contains_key("database_owner"));
}

#[tokio::test]
async fn test_set_server_roles_is_idempotent() {
    let t = TestAppliance::new();
    let channel = t.channel();
    channel.respond(GUID_CMD, CommandResult::new(0, "g-1"));
    channel.respond(DUMP_CMD, CommandResult::new(0, "server:\n  name: EVM\n"));
    seed_region(&t);
    seed_roles(&t);

    let current = t.appliance.server_roles().await.unwrap();
    let changed = t.appliance.set_server_roles(&current).await.unwrap();

    assert!(!changed);
    assert!(!channel.ran("rm -f"));
    assert!(!channel.ran(".rb"));
}

#[tokio::test]
async fn test_settings_write_forgets_server_identity() {
    let t = TestAppliance::new();
    let channel = t.channel();
    channel.respond(DUMP_CMD, CommandResult::new(0, "server:\n  name: EVM\n"));
    seed_region(&t);

    t.appliance.configuration_details().await.unwrap();
    t.appliance.guid().await.unwrap();
    assert!(t.appliance.cache().is_cached(CachedField::ConfigurationDetails));

    t.appliance.rename("EVM-renamed").await.unwrap();

    assert!(!t.appliance.cache().is_cached(CachedField::ConfigurationDetails));
    assert!(!t.appliance.cache().is_cached(CachedField::HostAddress));
    assert!(t.appliance.cache().is_cached(CachedField::Guid));

    let uploaded = channel
        .commands()
        .iter()
        .filter(|c| c.starts_with("rm -f"))
        .count();
    assert_eq!(uploaded, 2);
}

#[tokio::test]
async fn test_settings_write_failure_still_invalidates() {
    let t = TestAppliance::new();
    let channel = t.channel();
    channel.respond(DUMP_CMD, CommandResult::new(0, "server:\n  name: EVM\n"));
    seed_region(&t);
    t.appliance.configuration_details().await.unwrap();

    channel.respond("bin/rails runner /tmp/", CommandResult::new(1, "validation failed"));
    let err = t.appliance.rename("bad name").await.unwrap_err();

    assert!(err.captured_output().unwrap().contains("validation failed"));
    assert!(!t.appliance.cache().is_cached(CachedField::ConfigurationDetails));
}

#[tokio::test]
async fn test_managed_provider_names_filters_unknown_types() {
    let t = TestAppliance::new();
    for (name, kind) in [
        ("vsphere", "ManageIQ::Providers::Vmware::InfraManager"),
        ("ec2", "ManageIQ::Providers::Amazon::CloudManager"),
        ("odd", "ManageIQ::Providers::Something::Else"),
    ] {
        t.store.insert(
            "ext_management_systems",
            Row::new().with("name", name).with("type", kind),
        );
    }
    let names = t.appliance.managed_provider_names().await.unwrap();
    assert_eq!(names, vec!["vsphere".to_string(), "ec2".to_string()]);
}

#[tokio::test]
async fn test_check_domain_enabled() {
    let t = TestAppliance::new();
    t.store.insert(
        "miq_ae_namespaces",
        Row::new()
            .with("name", "ManageIQ")
            .with("parent_id", serde_json::Value::Null)
            .with("enabled", "t"),
    );
    assert!(t.appliance.check_domain_enabled("ManageIQ").await.unwrap());
    assert!(t.appliance.check_domain_enabled("Nope").await.is_err());
}

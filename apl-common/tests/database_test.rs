//! Database enablement and the cached state that hangs off the database address.

mod common;

use std::sync::Arc;

use apl_common::ApplianceError;
use apl_common::appliance::ExternalDb;
use apl_common::cache::CachedField;
use apl_common::remote::CommandResult;
use apl_common::store::RelationalStore;
use common::{ADDRESS, TestAppliance};

const V2_KEY: &str = "/var/www/miq/vmdb/certs/v2_key";
const EXTERNAL: &str = "10.0.0.9";

#[tokio::test]
async fn test_enable_internal_db_reopens_store() {
    let t = TestAppliance::new();
    let before = t.appliance.db().await.unwrap();
    assert!(t.appliance.cache().is_cached(CachedField::Db));

    let result = t
        .appliance
        .enable_internal_db(0, None, Some("smartvm"), None)
        .await
        .unwrap();
    assert!(result.success());
    assert!(!t.appliance.cache().is_cached(CachedField::Db));

    let after = t.appliance.db().await.unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(t.opener.opened(), vec![ADDRESS.to_string(), ADDRESS.to_string()]);

    let cmds = t.channel().commands();
    assert!(cmds.iter().any(|c| c.starts_with("appliance_console_cli --region 0 --internal --force-key")));
}

#[tokio::test]
async fn test_enable_internal_db_reports_failure_without_raising() {
    let t = TestAppliance::new();
    t.channel()
        .respond("appliance_console_cli --region", CommandResult::new(1, "region already exists"));
    let result = t
        .appliance
        .enable_internal_db(0, None, None, None)
        .await
        .unwrap();
    assert_eq!(result.exit_status, 1);
    assert_eq!(result.output, "region already exists");
    assert!(!t.channel().ran("ruby /tmp/"));
}

#[tokio::test]
async fn test_enable_internal_db_fetch_key_needs_ssh_password() {
    let t = TestAppliance::new();
    let err = t
        .appliance
        .enable_internal_db(0, Some("10.0.0.2"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ApplianceError::Config(_)));
}

#[tokio::test]
async fn test_script_fallback_removes_generated_script() {
    let t = TestAppliance::new();
    let channel = t.channel();
    channel.respond("ls -l /bin/appliance_console_cli", CommandResult::new(2, "No such file"));
    channel.respond("ruby /tmp/", CommandResult::new(1, "boom"));

    let result = t
        .appliance
        .enable_internal_db(1, None, Some("smartvm"), None)
        .await
        .unwrap();
    assert_eq!(result.exit_status, 1);

    let cmds = channel.commands();
    let run = cmds.iter().position(|c| c.starts_with("ruby /tmp/")).unwrap();
    let script = cmds[run].trim_start_matches("ruby ").to_string();
    assert!(cmds[run + 1..].iter().any(|c| c.starts_with("rm -f") && c.contains(&script)));
    let uploaded = String::from_utf8(channel.remote_file(&script).unwrap()).unwrap();
    assert!(uploaded.contains("smartvm"));
}

#[tokio::test]
async fn test_script_fallback_escapes_password_quotes() {
    let t = TestAppliance::new();
    let channel = t.channel();
    channel.respond("ls -l /bin/appliance_console_cli", CommandResult::new(2, "No such file"));

    t.appliance
        .enable_internal_db(1, None, Some(r"it's\here"), None)
        .await
        .unwrap();

    let cmds = channel.commands();
    let run = cmds.iter().find(|c| c.starts_with("ruby /tmp/")).unwrap();
    let script = run.trim_start_matches("ruby ");
    let uploaded = String::from_utf8(channel.remote_file(script).unwrap()).unwrap();
    assert!(uploaded.contains(r"it\'s\\here"));
    assert!(!uploaded.contains("it's"));
}

#[tokio::test]
async fn test_enable_external_db_failure_is_observable() {
    let t = TestAppliance::new();
    t.connector
        .channel(EXTERNAL)
        .put_remote(V2_KEY, b"key-material".to_vec());
    t.channel().respond(
        "appliance_console_cli --hostname",
        CommandResult::new(1, "could not connect to 10.0.0.9:5432"),
    );

    let err = t
        .appliance
        .enable_external_db(&ExternalDb::new(EXTERNAL, 1))
        .await
        .unwrap_err();

    assert!(matches!(err, ApplianceError::Lifecycle { .. }));
    assert!(err.captured_output().unwrap().contains("could not connect"));
    assert_eq!(t.appliance.db_address().await.unwrap(), ADDRESS);
    assert!(t.appliance.is_db_internal().await.unwrap());
}

#[tokio::test]
async fn test_enable_external_db_copies_key_and_repoints() {
    let t = TestAppliance::new();
    t.connector
        .channel(EXTERNAL)
        .put_remote(V2_KEY, b"key-material".to_vec());
    let internal = t.appliance.db().await.unwrap();

    let result = t
        .appliance
        .enable_external_db(&ExternalDb::new(EXTERNAL, 1))
        .await
        .unwrap();
    assert!(result.success());

    assert_eq!(t.channel().remote_file(V2_KEY).unwrap(), b"key-material");
    assert_eq!(t.appliance.db_address().await.unwrap(), EXTERNAL);
    let external = t.appliance.db().await.unwrap();
    assert!(!Arc::ptr_eq(&internal, &external));
    assert_eq!(external.hostname(), EXTERNAL);
}

#[tokio::test]
async fn test_enable_external_db_without_key_fails_and_reverts() {
    let t = TestAppliance::new();
    let err = t
        .appliance
        .enable_external_db(&ExternalDb::new(EXTERNAL, 1))
        .await
        .unwrap_err();
    assert!(matches!(err, ApplianceError::Channel(_)));
    assert_eq!(t.appliance.db_address().await.unwrap(), ADDRESS);
    assert!(!t.channel().ran("appliance_console_cli --hostname"));
}

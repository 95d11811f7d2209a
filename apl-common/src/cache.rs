//! Lazily computed appliance properties and their invalidation.
//!
//! Each property is a [`Slot`]: empty until first read, then memoized until
//! something clears it. Remote facts that other properties are derived from
//! are named by [`Fact`]; changing a fact clears every dependent slot, so a
//! stale value is never served after a local mutation.

use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::appliance::ServerIdentity;
use crate::remote::CommandChannel;
use crate::store::RelationalStore;
use crate::version::Version;

/// A memoized value that can be cleared.
#[derive(Debug)]
pub struct Slot<T> {
    value: Mutex<Option<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }
}

impl<T: Clone> Slot<T> {
    pub fn get(&self) -> Option<T> {
        self.lock().clone()
    }

    pub fn set(&self, value: T) {
        *self.lock() = Some(value);
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    pub fn is_set(&self) -> bool {
        self.lock().is_some()
    }

    /// Return the cached value, or compute, store and return it. Failures
    /// are not cached.
    pub async fn get_or_try_init<F, Fut, E>(&self, init: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get() {
            return Ok(value);
        }
        let value = init().await?;
        self.set(value.clone());
        Ok(value)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Every cached appliance property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CachedField {
    Address,
    Version,
    Build,
    OsVersion,
    Guid,
    ProductName,
    IsDownstream,
    MiqqeVersion,
    DbAddress,
    Db,
    SshClient,
    DbSshClient,
    ConfigurationDetails,
    ZoneDescription,
    EvmId,
    IsStorageEnabled,
    CompanyName,
    HostAddress,
}

/// Remote facts whose change invalidates derived properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fact {
    /// The appliance's own network address (e.g. a new lease on VM start).
    Address,
    /// Where the region database lives.
    DbAddress,
    /// Server record, zone and name as seen in the database.
    ServerDetails,
    /// The advanced settings document.
    Settings,
    /// Storage support installed or removed.
    Storage,
    /// The test-helper patch set applied or upgraded.
    MiqqePatch,
    /// SSH reachability (e.g. across a reboot).
    Connection,
}

impl Fact {
    pub fn dependents(self) -> &'static [CachedField] {
        use CachedField::*;
        match self {
            Fact::Address => &[
                Address,
                DbAddress,
                Db,
                SshClient,
                DbSshClient,
                ConfigurationDetails,
                ZoneDescription,
                EvmId,
            ],
            Fact::DbAddress => &[
                DbAddress,
                Db,
                DbSshClient,
                ConfigurationDetails,
                ZoneDescription,
                EvmId,
            ],
            Fact::ServerDetails => &[ConfigurationDetails, ZoneDescription, EvmId, CompanyName],
            Fact::Settings => &[
                HostAddress,
                DbAddress,
                Db,
                DbSshClient,
                CompanyName,
                IsStorageEnabled,
                ConfigurationDetails,
                ZoneDescription,
            ],
            Fact::Storage => &[IsStorageEnabled],
            Fact::MiqqePatch => &[MiqqeVersion],
            Fact::Connection => &[SshClient, DbSshClient, Db],
        }
    }
}

/// Per-appliance property cache.
#[derive(Debug, Default)]
pub struct PropertyCache {
    pub address: Slot<String>,
    pub version: Slot<Version>,
    pub build: Slot<String>,
    pub os_version: Slot<Version>,
    pub guid: Slot<String>,
    pub product_name: Slot<String>,
    pub is_downstream: Slot<bool>,
    pub miqqe_version: Slot<Option<u32>>,
    pub db_address: Slot<String>,
    pub db: Slot<Arc<dyn RelationalStore>>,
    pub ssh_client: Slot<Arc<dyn CommandChannel>>,
    pub db_ssh_client: Slot<Arc<dyn CommandChannel>>,
    pub configuration_details: Slot<Option<ServerIdentity>>,
    pub zone_description: Slot<Option<String>>,
    pub evm_id: Slot<Option<i64>>,
    pub is_storage_enabled: Slot<bool>,
    pub company_name: Slot<Option<String>>,
    pub host_address: Slot<Option<String>>,
}

impl PropertyCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cached(&self, field: CachedField) -> bool {
        use CachedField::*;
        match field {
            Address => self.address.is_set(),
            Version => self.version.is_set(),
            Build => self.build.is_set(),
            OsVersion => self.os_version.is_set(),
            Guid => self.guid.is_set(),
            ProductName => self.product_name.is_set(),
            IsDownstream => self.is_downstream.is_set(),
            MiqqeVersion => self.miqqe_version.is_set(),
            DbAddress => self.db_address.is_set(),
            Db => self.db.is_set(),
            SshClient => self.ssh_client.is_set(),
            DbSshClient => self.db_ssh_client.is_set(),
            ConfigurationDetails => self.configuration_details.is_set(),
            ZoneDescription => self.zone_description.is_set(),
            EvmId => self.evm_id.is_set(),
            IsStorageEnabled => self.is_storage_enabled.is_set(),
            CompanyName => self.company_name.is_set(),
            HostAddress => self.host_address.is_set(),
        }
    }

    /// Clear the named fields. Clearing an empty field is a no-op.
    pub fn invalidate(&self, fields: &[CachedField]) {
        use CachedField::*;
        for field in fields {
            match field {
                Address => self.address.clear(),
                Version => self.version.clear(),
                Build => self.build.clear(),
                OsVersion => self.os_version.clear(),
                Guid => self.guid.clear(),
                ProductName => self.product_name.clear(),
                IsDownstream => self.is_downstream.clear(),
                MiqqeVersion => self.miqqe_version.clear(),
                DbAddress => self.db_address.clear(),
                Db => self.db.clear(),
                SshClient => self.ssh_client.clear(),
                DbSshClient => self.db_ssh_client.clear(),
                ConfigurationDetails => self.configuration_details.clear(),
                ZoneDescription => self.zone_description.clear(),
                EvmId => self.evm_id.clear(),
                IsStorageEnabled => self.is_storage_enabled.clear(),
                CompanyName => self.company_name.clear(),
                HostAddress => self.host_address.clear(),
            }
        }
    }

    pub fn invalidate_fact(&self, fact: Fact) {
        debug!(fact = ?fact, "Invalidating cached properties");
        self.invalidate(fact.dependents());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_slot_memoizes_success_only() {
        let slot: Slot<u32> = Slot::default();
        let calls = AtomicU32::new(0);

        let err: Result<u32, &str> = slot
            .get_or_try_init(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("ssh down")
            })
            .await;
        assert!(err.is_err());
        assert!(!slot.is_set());

        for _ in 0..3 {
            let v: Result<u32, &str> = slot
                .get_or_try_init(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                })
                .await;
            assert_eq!(v, Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalidate_fact_clears_dependents_only() {
        let cache = PropertyCache::new();
        cache.db_address.set("10.0.0.1".into());
        cache.evm_id.set(Some(1));
        cache.version.set(Version::parse("5.8"));

        cache.invalidate_fact(Fact::DbAddress);

        assert!(!cache.is_cached(CachedField::DbAddress));
        assert!(!cache.is_cached(CachedField::EvmId));
        assert!(cache.is_cached(CachedField::Version));
    }

    #[test]
    fn test_invalidate_is_idempotent() {
        let cache = PropertyCache::new();
        cache.invalidate(&[CachedField::Guid, CachedField::Guid]);
        cache.invalidate_fact(Fact::Settings);
        assert!(!cache.is_cached(CachedField::Guid));
    }

    #[test]
    fn test_address_change_drops_derived_db_location() {
        let cache = PropertyCache::new();
        cache.address.set("10.0.0.5".into());
        cache.db_address.set("10.0.0.5".into());
        cache.guid.set("abc".into());

        cache.invalidate_fact(Fact::Address);

        assert!(!cache.is_cached(CachedField::Address));
        assert!(!cache.is_cached(CachedField::DbAddress));
        assert!(cache.is_cached(CachedField::Guid));
    }

    #[test]
    fn test_db_handle_follows_db_address() {
        for fact in [Fact::Address, Fact::DbAddress, Fact::Settings, Fact::Connection] {
            assert!(fact.dependents().contains(&CachedField::Db), "{fact:?}");
        }
    }
}

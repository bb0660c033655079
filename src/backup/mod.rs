//! # Backup manager
//!
//! Snapshots the in-memory state of every registered store into a bounded ring persisted under a bare
//! key (`SyncOptions::backup_key`), outside the live envelope namespace. Records are kept oldest first
//! (newest last); once the ring holds `backup_capacity` records, each new backup evicts the oldest.
//!
//! A backup is all-or-nothing: if any store fails to serialize, nothing is written. Concurrent tabs
//! writing the ring race on truncation; the last writer's view wins.

pub mod error;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use error::{BackupError, BackupErrorCode, BackupResult};

use crate::backup::error::{invalid_snapshot, not_found, snapshot_failed};
use crate::durable::{DurableStore, Envelope};
use crate::logger::Logger;
use crate::platform::runtime::{sleep, spawn_detached};
use crate::schema::SchemaRegistry;
use crate::store::{PersistedDomain, StateStore, StoreContext};

static BACKUP_LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@storefront/backup"));

/// A store whose state can be captured into and restored from a backup.
pub trait BackupSource: Send + Sync {
    fn store_id(&self) -> &str;
    fn snapshot(&self) -> serde_json::Result<Value>;
    /// Applies an already validated snapshot. Returns `false` if it cannot be decoded.
    fn restore_snapshot(&self, state: Value) -> bool;
    fn reset_to_default(&self);
}

impl<D: PersistedDomain> BackupSource for StateStore<D> {
    fn store_id(&self) -> &str {
        D::STORE_ID
    }

    fn snapshot(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self.state())
    }

    fn restore_snapshot(&self, state: Value) -> bool {
        match serde_json::from_value::<D>(state) {
            Ok(next) => {
                self.replace(next);
                true
            }
            Err(err) => {
                BACKUP_LOGGER.warn(format!("failed to decode '{}' snapshot: {err}", D::STORE_ID));
                false
            }
        }
    }

    fn reset_to_default(&self) {
        self.reset();
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecord {
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub snapshot: BTreeMap<String, Value>,
}

/// Outcome of [`BackupManager::validate_and_repair_state`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub checked: Vec<String>,
    pub repaired: Vec<String>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.repaired.is_empty()
    }
}

#[derive(Clone)]
pub struct BackupManager {
    inner: Arc<BackupInner>,
}

struct BackupInner {
    durable: DurableStore,
    registry: Arc<SchemaRegistry>,
    key: String,
    capacity: usize,
    sources: Vec<Arc<dyn BackupSource>>,
    ring: Mutex<()>,
}

impl fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stores: Vec<_> = self.inner.sources.iter().map(|source| source.store_id()).collect();
        f.debug_struct("BackupManager")
            .field("key", &self.inner.key)
            .field("capacity", &self.inner.capacity)
            .field("stores", &stores)
            .finish()
    }
}

impl BackupManager {
    pub fn new(context: &StoreContext, sources: Vec<Arc<dyn BackupSource>>) -> Self {
        Self {
            inner: Arc::new(BackupInner {
                durable: context.durable.clone(),
                registry: Arc::clone(&context.registry),
                key: context.options.backup_key.clone(),
                capacity: context.options.backup_capacity.max(1),
                sources,
                ring: Mutex::new(()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn create_backup(&self) -> BackupResult<BackupRecord> {
        self.record(None)
    }

    /// Best-effort backup after a significant action. Failures are logged and reported as `None`.
    pub fn create_auto_backup(&self, reason: &str) -> Option<BackupRecord> {
        match self.record(Some(reason.to_owned())) {
            Ok(record) => {
                BACKUP_LOGGER.debug(format!("auto backup '{reason}' at {}", record.timestamp));
                Some(record)
            }
            Err(err) => {
                BACKUP_LOGGER.warn(format!("auto backup '{reason}' failed: {err}"));
                None
            }
        }
    }

    fn record(&self, reason: Option<String>) -> BackupResult<BackupRecord> {
        let mut snapshot = BTreeMap::new();
        for source in &self.inner.sources {
            let state = source
                .snapshot()
                .map_err(|err| snapshot_failed(format!("failed to capture '{}': {err}", source.store_id())))?;
            snapshot.insert(source.store_id().to_owned(), state);
        }
        let record = BackupRecord {
            timestamp: self.inner.durable.now_millis(),
            reason,
            snapshot,
        };

        let _ring = self.inner.ring.lock().unwrap_or_else(PoisonError::into_inner);
        let mut records = self.read_ring();
        records.push(record.clone());
        if records.len() > self.inner.capacity {
            let excess = records.len() - self.inner.capacity;
            records.drain(..excess);
        }
        let raw = serde_json::to_string(&records)?;
        self.inner.durable.set_plain(&self.inner.key, &raw)?;
        Ok(record)
    }

    fn read_ring(&self) -> Vec<BackupRecord> {
        let raw = match self.inner.durable.get_plain(&self.inner.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(err) => {
                BACKUP_LOGGER.warn(format!("failed to read backups: {err}"));
                return Vec::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|err| {
            BACKUP_LOGGER.warn(format!("discarding unreadable backups: {err}"));
            Vec::new()
        })
    }

    /// Retained records, oldest first.
    pub fn get_backups(&self) -> Vec<BackupRecord> {
        self.read_ring()
    }

    pub fn latest_backup(&self) -> Option<BackupRecord> {
        self.read_ring().pop()
    }

    /// Restores the newest record taken at `timestamp`. Every store's snapshot is validated before any
    /// store is touched; snapshots are not migrated.
    pub fn restore_backup(&self, timestamp: i64) -> BackupResult<BackupRecord> {
        let record = self
            .read_ring()
            .into_iter()
            .rev()
            .find(|record| record.timestamp == timestamp)
            .ok_or_else(|| not_found(format!("no backup taken at {timestamp}")))?;

        let mut validated = Vec::with_capacity(self.inner.sources.len());
        for source in &self.inner.sources {
            let id = source.store_id();
            let state = record
                .snapshot
                .get(id)
                .and_then(|state| self.inner.registry.restore_backup(id, state))
                .ok_or_else(|| invalid_snapshot(format!("backup {timestamp} has no valid '{id}' state")))?;
            validated.push((source, state));
        }

        for (source, state) in validated {
            source.restore_snapshot(state);
        }
        BACKUP_LOGGER.info(format!("restored backup {timestamp}"));
        Ok(record)
    }

    pub fn clear_backups(&self) -> BackupResult<()> {
        let _ring = self.inner.ring.lock().unwrap_or_else(PoisonError::into_inner);
        self.inner.durable.remove_plain(&self.inner.key)?;
        Ok(())
    }

    /// Checks every store's persisted envelope against its schema and resets the ones that no longer
    /// validate. Missing entries are fine.
    pub fn validate_and_repair_state(&self) -> RepairReport {
        let mut report = RepairReport::default();
        for source in &self.inner.sources {
            let id = source.store_id();
            report.checked.push(id.to_owned());

            let key = self.inner.durable.key_for(id);
            let raw = match self.inner.durable.get_plain(&key) {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(err) => {
                    BACKUP_LOGGER.warn(format!("skipping '{id}' check: {err}"));
                    continue;
                }
            };

            let valid = Envelope::parse(&raw)
                .ok()
                .and_then(|envelope| self.inner.registry.restore(id, &envelope))
                .is_some();
            if !valid {
                BACKUP_LOGGER.warn(format!("persisted '{id}' state is invalid; resetting to default"));
                source.reset_to_default();
                report.repaired.push(id.to_owned());
            }
        }
        report
    }

    /// Takes an automatic backup every `interval` until the returned handle is stopped or dropped.
    pub fn spawn_periodic(&self, interval: Duration) -> PeriodicBackup {
        let stopped = Arc::new(AtomicBool::new(false));
        let manager = self.clone();
        let flag = Arc::clone(&stopped);
        spawn_detached(async move {
            loop {
                sleep(interval).await;
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                manager.create_auto_backup("periodic");
            }
        });
        PeriodicBackup { stopped }
    }
}

#[must_use = "dropping a PeriodicBackup stops it"]
#[derive(Debug)]
pub struct PeriodicBackup {
    stopped: Arc<AtomicBool>,
}

impl PeriodicBackup {
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for PeriodicBackup {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::{MemoryOrigin, StorageArea};
    use crate::options::SyncOptions;
    use crate::store::{AuthState, AuthStore, CartState, CartStore, LineItem, TenantState, TenantStore, User};
    use crate::util::ManualClock;
    use serde_json::json;

    struct Fixture {
        origin: MemoryOrigin,
        clock: ManualClock,
        auth: AuthStore,
        cart: CartStore,
        tenant: TenantStore,
        backups: BackupManager,
    }

    fn fixture(capacity: usize) -> Fixture {
        let origin = MemoryOrigin::new();
        let clock = ManualClock::new(1_000);
        let options = SyncOptions {
            backup_capacity: capacity,
            ..SyncOptions::default()
        };
        let durable = DurableStore::with_clock(
            Arc::new(origin.tab()),
            &options.prefix,
            &options.schema_version,
            Arc::new(clock.clone()),
        );
        let mut registry = SchemaRegistry::new(&options.schema_version);
        AuthState::register(&mut registry);
        CartState::register(&mut registry);
        TenantState::register(&mut registry);
        let context = StoreContext::new(durable, registry, options).unwrap();

        let auth = AuthStore::new(context.clone());
        let cart = CartStore::new(context.clone());
        let tenant = TenantStore::new(context.clone());
        auth.initialize();
        cart.initialize();
        tenant.initialize();
        let backups = BackupManager::new(
            &context,
            vec![
                Arc::new(auth.clone()) as Arc<dyn BackupSource>,
                Arc::new(cart.clone()),
                Arc::new(tenant.clone()),
            ],
        );
        Fixture {
            origin,
            clock,
            auth,
            cart,
            tenant,
            backups,
        }
    }

    #[test]
    fn ring_keeps_the_most_recent_records() {
        let fixture = fixture(3);
        for _ in 0..4 {
            fixture.clock.advance(10);
            fixture.backups.create_backup().unwrap();
        }

        let timestamps: Vec<_> = fixture.backups.get_backups().iter().map(|record| record.timestamp).collect();
        assert_eq!(timestamps, [1_020, 1_030, 1_040]);
        assert_eq!(fixture.backups.latest_backup().unwrap().timestamp, 1_040);
    }

    #[test]
    fn records_capture_every_store() {
        let fixture = fixture(5);
        fixture.cart.add_item(LineItem::new("p1", "Lamp", 10.0, 1));
        let record = fixture.backups.create_auto_backup("checkout").unwrap();

        assert_eq!(record.reason.as_deref(), Some("checkout"));
        assert_eq!(
            record.snapshot.keys().map(String::as_str).collect::<Vec<_>>(),
            ["auth", "cart", "tenant"]
        );
        assert_eq!(record.snapshot["cart"]["itemCount"], json!(1));
    }

    #[test]
    fn restore_brings_every_store_back() {
        let fixture = fixture(5);
        fixture.auth.login(User::new("u1"), "t1");
        fixture.cart.add_item(LineItem::new("p1", "Lamp", 10.0, 2));
        let record = fixture.backups.create_backup().unwrap();

        fixture.auth.logout();
        fixture.cart.clear();
        fixture.backups.restore_backup(record.timestamp).unwrap();

        assert_eq!(fixture.auth.user().map(|user| user.id).as_deref(), Some("u1"));
        assert_eq!(fixture.cart.state().item_count, 2);
        assert_eq!(
            fixture.backups.restore_backup(42).unwrap_err().code,
            BackupErrorCode::NotFound
        );
    }

    #[test]
    fn invalid_snapshot_restores_nothing() {
        let fixture = fixture(5);
        fixture.cart.add_item(LineItem::new("p1", "Lamp", 10.0, 2));
        let tampered = json!([{
            "timestamp": 7,
            "snapshot": {
                "auth": {"user": null, "token": null, "isAuthenticated": false},
                "cart": {"items": [], "total": 0.0, "itemCount": 0},
                "tenant": {"id": 3, "branding": {}}
            }
        }]);
        fixture
            .origin
            .tab()
            .set_item("storefront_backups", &tampered.to_string())
            .unwrap();

        let err = fixture.backups.restore_backup(7).unwrap_err();
        assert_eq!(err.code, BackupErrorCode::InvalidSnapshot);
        assert_eq!(fixture.cart.state().item_count, 2);
    }

    #[test]
    fn repair_resets_invalid_persisted_state() {
        let fixture = fixture(5);
        fixture.tenant.set_tenant("acme", Default::default());
        let raw = fixture.origin.tab();
        raw.set_item(
            "storefront-cart",
            r#"{"state":{"items":"nope"},"version":"1.0","timestamp":1}"#,
        )
        .unwrap();
        raw.set_item("storefront-auth", "{garbage").unwrap();

        let report = fixture.backups.validate_and_repair_state();
        assert_eq!(report.checked, ["auth", "cart", "tenant"]);
        assert_eq!(report.repaired, ["auth", "cart"]);
        assert!(!report.is_clean());
        assert_eq!(fixture.tenant.tenant_id().as_deref(), Some("acme"));
        assert!(fixture.backups.validate_and_repair_state().is_clean());
    }

    #[test]
    fn auto_backup_failure_is_swallowed() {
        let fixture = fixture(5);
        fixture.origin.set_quota_bytes(Some(16));
        assert!(fixture.backups.create_auto_backup("checkout").is_none());
        assert!(fixture.backups.create_backup().is_err());

        fixture.origin.set_quota_bytes(None);
        fixture.backups.create_backup().unwrap();
        fixture.backups.clear_backups().unwrap();
        assert!(fixture.backups.get_backups().is_empty());
    }

    #[test]
    fn periodic_backups_run_without_an_ambient_runtime() {
        let fixture = fixture(10);
        let handle = fixture.backups.spawn_periodic(Duration::from_millis(10));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while fixture.backups.get_backups().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        handle.stop();
        assert!(!fixture.backups.get_backups().is_empty());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn periodic_backups_stop_with_their_handle() {
        let fixture = fixture(10);
        let handle = fixture.backups.spawn_periodic(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(150)).await;
        handle.stop();
        let taken = fixture.backups.get_backups().len();
        assert_eq!(taken, 2);
        assert!(fixture
            .backups
            .get_backups()
            .iter()
            .all(|record| record.reason.as_deref() == Some("periodic")));

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(fixture.backups.get_backups().len(), taken);
    }
}

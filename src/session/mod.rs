//! # Tab session
//!
//! Per-tab composition root: one durable store, one schema registry, one cross-tab notifier, the
//! auth, cart and tenant stores and the backup manager, all built explicitly from a [`StorageArea`]
//! and [`SyncOptions`].
//!
//! ```
//! use std::sync::Arc;
//! use storefront_state::durable::MemoryOrigin;
//! use storefront_state::options::SyncOptions;
//! use storefront_state::session::TabSession;
//! use storefront_state::store::User;
//!
//! let origin = MemoryOrigin::new();
//! let first = TabSession::open(Arc::new(origin.tab()), SyncOptions::default()).unwrap();
//! let second = TabSession::open(Arc::new(origin.tab()), SyncOptions::default()).unwrap();
//! first.initialize();
//! second.initialize();
//!
//! first.auth().login(User::new("u1"), "t1");
//! assert!(second.auth().is_authenticated());
//! ```

use std::sync::Arc;

use crate::backup::{BackupManager, BackupSource};
use crate::durable::{DurableStore, StorageArea, StorageResult};
use crate::notifier::CrossTabNotifier;
use crate::options::SyncOptions;
use crate::schema::SchemaRegistry;
use crate::store::{
    AuthState, AuthStore, CartState, CartStore, PersistedDomain, StoreContext, TenantState,
    TenantStore,
};
use crate::util::{system_clock, Clock};

#[derive(Clone, Debug)]
pub struct TabSession {
    context: StoreContext,
    auth: AuthStore,
    cart: CartStore,
    tenant: TenantStore,
    backups: BackupManager,
}

impl TabSession {
    pub fn open(area: Arc<dyn StorageArea>, options: SyncOptions) -> StorageResult<Self> {
        Self::open_with_clock(area, options, system_clock())
    }

    pub fn open_with_clock(
        area: Arc<dyn StorageArea>,
        options: SyncOptions,
        clock: Arc<dyn Clock>,
    ) -> StorageResult<Self> {
        let durable =
            DurableStore::with_clock(area, &options.prefix, &options.schema_version, clock);
        let mut registry = SchemaRegistry::new(&options.schema_version);
        AuthState::register(&mut registry);
        CartState::register(&mut registry);
        TenantState::register(&mut registry);
        Self::with_registry(durable, registry, options)
    }

    /// Builds a session over a caller-assembled registry, e.g. one carrying migrations. The auth, cart
    /// and tenant schemas must be registered. Fails with `storage/invalid-argument` when `options` do not
    /// validate.
    pub fn with_registry(
        durable: DurableStore,
        registry: SchemaRegistry,
        options: SyncOptions,
    ) -> StorageResult<Self> {
        options.validate()?;
        let context = StoreContext::new(durable, registry, options)?;
        let auth = AuthStore::new(context.clone());
        let cart = CartStore::new(context.clone());
        let tenant = TenantStore::new(context.clone());
        let backups = BackupManager::new(
            &context,
            vec![
                Arc::new(auth.clone()) as Arc<dyn BackupSource>,
                Arc::new(cart.clone()),
                Arc::new(tenant.clone()),
            ],
        );
        Ok(Self {
            context,
            auth,
            cart,
            tenant,
            backups,
        })
    }

    /// Restores every store and subscribes it to cross-tab changes. Safe to call repeatedly.
    pub fn initialize(&self) {
        self.auth.initialize();
        self.cart.initialize();
        self.tenant.initialize();
    }

    pub fn auth(&self) -> &AuthStore {
        &self.auth
    }

    pub fn cart(&self) -> &CartStore {
        &self.cart
    }

    pub fn tenant(&self) -> &TenantStore {
        &self.tenant
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn durable(&self) -> &DurableStore {
        &self.context.durable
    }

    pub fn notifier(&self) -> &CrossTabNotifier {
        &self.context.notifier
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.context.registry
    }

    pub fn options(&self) -> &SyncOptions {
        &self.context.options
    }
}

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::logger::Logger;
use crate::store::{PersistedDomain, StateStore};

static AUTH_LOGGER: LazyLock<Logger> = LazyLock::new(|| Logger::new("@storefront/auth"));

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

/// Partial profile update; `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserPatch {
    pub email: Option<String>,
    pub name: Option<String>,
    pub role: Option<String>,
    pub tenant_id: Option<String>,
}

impl UserPatch {
    fn apply(self, user: &mut User) {
        if let Some(email) = self.email {
            user.email = Some(email);
        }
        if let Some(name) = self.name {
            user.name = Some(name);
        }
        if let Some(role) = self.role {
            user.role = Some(role);
        }
        if let Some(tenant_id) = self.tenant_id {
            user.tenant_id = Some(tenant_id);
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub user: Option<User>,
    pub token: Option<String>,
    pub is_authenticated: bool,
}

impl PersistedDomain for AuthState {
    const STORE_ID: &'static str = "auth";

    /// `is_authenticated` holds iff both a user and a token are present.
    fn normalize(&mut self) {
        self.is_authenticated = self.user.is_some() && self.token.is_some();
    }
}

pub type AuthStore = StateStore<AuthState>;

impl StateStore<AuthState> {
    pub fn login(&self, user: User, token: impl Into<String>) -> AuthState {
        let token = token.into();
        let state = self.update(|state| {
            state.user = Some(user);
            state.token = Some(token.clone());
        });
        self.mirror_token(Some(&token));
        state
    }

    /// Clears the session and removes the token mirror.
    pub fn logout(&self) -> AuthState {
        let state = self.reset();
        self.mirror_token(None);
        state
    }

    /// Patches the signed-in user. Without a user this is a no-op.
    pub fn update_user(&self, patch: UserPatch) -> AuthState {
        if self.state().user.is_none() {
            AUTH_LOGGER.debug("ignoring profile update without a signed-in user");
            return self.state();
        }
        self.update(|state| {
            if let Some(user) = state.user.as_mut() {
                patch.apply(user);
            }
        })
    }

    /// Swaps the credential, e.g. after a refresh.
    pub fn set_token(&self, token: impl Into<String>) -> AuthState {
        let token = token.into();
        let state = self.update(|state| state.token = Some(token.clone()));
        self.mirror_token(Some(&token));
        state
    }

    /// Fast-path read of the mirrored token, falling back to the in-memory state.
    pub fn token(&self) -> Option<String> {
        let context = self.context();
        match context.durable.get_plain(&context.options.token_key) {
            Ok(Some(token)) => Some(token),
            Ok(None) => self.state().token,
            Err(err) => {
                AUTH_LOGGER.warn(format!("failed to read token mirror: {err}"));
                self.state().token
            }
        }
    }

    pub fn user(&self) -> Option<User> {
        self.state().user
    }

    pub fn is_authenticated(&self) -> bool {
        self.state().is_authenticated
    }

    fn mirror_token(&self, token: Option<&str>) {
        let context = self.context();
        let key = &context.options.token_key;
        let result = match token {
            Some(token) => context.durable.set_plain(key, token),
            None => context.durable.remove_plain(key),
        };
        if let Err(err) = result {
            AUTH_LOGGER.warn(format!("failed to update token mirror '{key}': {err}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::{DurableStore, MemoryOrigin, StorageArea};
    use crate::options::SyncOptions;
    use crate::schema::SchemaRegistry;
    use crate::store::StoreContext;
    use serde_json::json;
    use std::sync::Arc;

    fn auth_store(origin: &MemoryOrigin) -> AuthStore {
        let options = SyncOptions::default();
        let durable = DurableStore::new(Arc::new(origin.tab()), &options.prefix, &options.schema_version);
        let mut registry = SchemaRegistry::new(&options.schema_version);
        AuthState::register(&mut registry);
        AuthStore::new(StoreContext::new(durable, registry, options).unwrap())
    }

    #[test]
    fn login_mirrors_token_and_logout_removes_it() {
        let origin = MemoryOrigin::new();
        let store = auth_store(&origin);
        store.initialize();

        let state = store.login(User::new("u1"), "t1");
        assert!(state.is_authenticated);
        assert_eq!(origin.tab().get_item("storefront_auth_token").unwrap().as_deref(), Some("t1"));
        assert_eq!(store.token().as_deref(), Some("t1"));

        let state = store.logout();
        assert_eq!(state, AuthState::default());
        assert_eq!(origin.tab().get_item("storefront_auth_token").unwrap(), None);
        assert_eq!(store.token(), None);
    }

    #[test]
    fn update_user_requires_a_user() {
        let origin = MemoryOrigin::new();
        let store = auth_store(&origin);
        store.initialize();

        let unchanged = store.update_user(UserPatch {
            name: Some("Ada".into()),
            ..UserPatch::default()
        });
        assert_eq!(unchanged.user, None);

        store.login(User::new("u1"), "t1");
        let state = store.update_user(UserPatch {
            name: Some("Ada".into()),
            tenant_id: Some("acme".into()),
            ..UserPatch::default()
        });
        let user = state.user.unwrap();
        assert_eq!(user.name.as_deref(), Some("Ada"));
        assert_eq!(user.tenant_id.as_deref(), Some("acme"));
    }

    #[test]
    fn authenticated_flag_follows_user_and_token() {
        let origin = MemoryOrigin::new();
        let store = auth_store(&origin);
        store.initialize();

        assert!(store.sync_from_other_tab(json!({"user": null, "token": "t1", "isAuthenticated": true})));
        assert!(!store.is_authenticated());
        assert!(!store.sync_from_other_tab(json!({"user": {"id": 7}, "token": "t1", "isAuthenticated": true})));

        let state = store.set_token("t2");
        assert_eq!(state.token.as_deref(), Some("t2"));
        assert!(!state.is_authenticated);
    }
}

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::{PersistedDomain, StateStore};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantState {
    pub id: Option<String>,
    pub branding: Map<String, Value>,
}

impl PersistedDomain for TenantState {
    const STORE_ID: &'static str = "tenant";
}

pub type TenantStore = StateStore<TenantState>;

impl StateStore<TenantState> {
    pub fn set_tenant(&self, id: impl Into<String>, branding: Map<String, Value>) -> TenantState {
        let id = id.into();
        self.update(|tenant| {
            tenant.id = Some(id);
            tenant.branding = branding;
        })
    }

    /// Merges `patch` into the branding; `null` values delete their key.
    pub fn update_branding(&self, patch: Map<String, Value>) -> TenantState {
        self.update(|tenant| {
            for (key, value) in patch {
                if value.is_null() {
                    tenant.branding.remove(&key);
                } else {
                    tenant.branding.insert(key, value);
                }
            }
        })
    }

    pub fn clear_tenant(&self) -> TenantState {
        self.reset()
    }

    pub fn tenant_id(&self) -> Option<String> {
        self.state().id
    }
}

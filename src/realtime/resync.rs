use std::sync::Arc;

use crate::realtime::{ConnectionManager, HandlerId};

/// Data-fetch cache refreshed after the realtime link comes back.
pub trait QueryCache: Send + Sync {
    fn invalidate(&self, query_key: &str);
    fn refetch(&self, query_key: &str);
}

/// Registers a resync callback that invalidates and then refetches every key in `query_keys` on each
/// connect, including the first one.
pub fn register_query_resync<I, K>(manager: &ConnectionManager, cache: Arc<dyn QueryCache>, query_keys: I) -> HandlerId
where
    I: IntoIterator<Item = K>,
    K: Into<String>,
{
    let query_keys: Vec<String> = query_keys.into_iter().map(Into::into).collect();
    manager.on_reconnect(move || {
        for key in &query_keys {
            cache.invalidate(key);
        }
        for key in &query_keys {
            cache.refetch(key);
        }
    })
}

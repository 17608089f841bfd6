use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use shared::domain::UserId;
use tokio::sync::{Mutex, OnceCell};

use crate::{api::ApiClient, error::ClientError};

/// Maps identity-provider ids to internal numeric ids, memoized for the
/// process lifetime.
///
/// Each key owns one `OnceCell`; concurrent resolves for the same unresolved
/// key await the single in-flight lookup instead of issuing duplicates. A
/// failed lookup leaves the cell empty, so the next call re-resolves.
pub struct IdentityResolver {
    api: Arc<ApiClient>,
    cache: Mutex<HashMap<String, Arc<OnceCell<UserId>>>>,
}

impl IdentityResolver {
    pub fn new(api: Arc<ApiClient>) -> Self {
        Self {
            api,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, external_id: &str) -> Result<UserId> {
        let cell = {
            let mut cache = self.cache.lock().await;
            Arc::clone(cache.entry(external_id.to_string()).or_default())
        };

        let resolved = cell
            .get_or_try_init(|| async {
                match self.api.lookup_identity(external_id).await? {
                    Some(peer) => Ok(peer.internal_id),
                    None => Err(anyhow::Error::new(ClientError::IdentityNotFound(
                        external_id.to_string(),
                    ))),
                }
            })
            .await?;

        Ok(*resolved)
    }
}

#[cfg(test)]
#[path = "tests/identity_tests.rs"]
mod tests;

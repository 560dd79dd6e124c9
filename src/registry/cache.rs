//! Read-through cache for listing queries.
//!
//! Every cached listing is addressed by a [`QueryKey`]. Every write to the
//! registry is described by a [`Mutation`], and [`Mutation::invalidates`] is
//! the single place that decides which listings a write makes stale.
//! Handlers call [`ListingCache::apply`] once the write has committed.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use tracing::debug;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::Entry;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    Children { owner: Uuid, parent: Option<Uuid> },
    Search { owner: Uuid, term: String },
    Trash { owner: Uuid },
}

impl QueryKey {
    pub fn owner(&self) -> Uuid {
        match self {
            QueryKey::Children { owner, .. }
            | QueryKey::Search { owner, .. }
            | QueryKey::Trash { owner } => *owner,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Created {
        owner: Uuid,
        parent: Option<Uuid>,
    },
    Renamed {
        owner: Uuid,
        parent: Option<Uuid>,
    },
    Moved {
        owner: Uuid,
        from: Option<Uuid>,
        to: Option<Uuid>,
    },
    Trashed {
        owner: Uuid,
        parent: Option<Uuid>,
    },
    Restored {
        owner: Uuid,
        parent: Option<Uuid>,
    },
    /// Purges can cascade through a whole subtree, so they stale every
    /// listing of the owner.
    Purged {
        owner: Uuid,
    },
}

impl Mutation {
    pub fn owner(&self) -> Uuid {
        match self {
            Mutation::Created { owner, .. }
            | Mutation::Renamed { owner, .. }
            | Mutation::Moved { owner, .. }
            | Mutation::Trashed { owner, .. }
            | Mutation::Restored { owner, .. }
            | Mutation::Purged { owner } => *owner,
        }
    }

    pub fn invalidates(&self, key: &QueryKey) -> bool {
        if self.owner() != key.owner() {
            return false;
        }

        match (self, key) {
            (_, QueryKey::Search { .. }) => true,
            (Mutation::Purged { .. }, _) => true,
            (
                Mutation::Trashed { .. } | Mutation::Restored { .. },
                QueryKey::Trash { .. },
            ) => true,
            (_, QueryKey::Trash { .. }) => false,
            (
                Mutation::Created { parent, .. }
                | Mutation::Renamed { parent, .. }
                | Mutation::Trashed { parent, .. }
                | Mutation::Restored { parent, .. },
                QueryKey::Children { parent: listed, .. },
            ) => parent == listed,
            (
                Mutation::Moved { from, to, .. },
                QueryKey::Children { parent: listed, .. },
            ) => from == listed || to == listed,
        }
    }
}

#[derive(Clone)]
pub struct ListingCache {
    inner: Cache<QueryKey, Arc<Vec<Entry>>>,
}

impl ListingCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    /// Returns the cached listing for `key`, running `load` on a miss.
    /// Failed loads are not cached.
    pub async fn get_or_load<F>(&self, key: QueryKey, load: F) -> AppResult<Vec<Entry>>
    where
        F: FnOnce() -> AppResult<Vec<Entry>>,
    {
        if let Some(hit) = self.inner.get(&key).await {
            return Ok(hit.as_ref().clone());
        }

        let fresh = load()?;
        self.inner.insert(key, Arc::new(fresh.clone())).await;
        Ok(fresh)
    }

    pub async fn apply(&self, mutation: &Mutation) {
        let stale: Vec<Arc<QueryKey>> = self
            .inner
            .iter()
            .filter(|(key, _)| mutation.invalidates(key))
            .map(|(key, _)| key)
            .collect();

        for key in &stale {
            self.inner.invalidate(key.as_ref()).await;
        }

        if !stale.is_empty() {
            debug!(
                owner_id = %mutation.owner(),
                invalidated = stale.len(),
                "invalidated cached listings"
            );
        }
    }
}

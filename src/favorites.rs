use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tracing::warn;

use crate::client::{Client, Filters};
use crate::state_file::StateFile;
use crate::types::{ResourceRef, ResourceType};
use crate::{AiopError, Result};

const TABLE: &str = "user_favorites";

/// A user-scoped bookmark of a catalog resource. Unique per
/// (user, resource type, resource id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Favorite {
    pub id: String,
    pub user_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Favorite {
    pub fn resource(&self) -> ResourceRef {
        ResourceRef::new(self.resource_type, self.resource_id.clone())
    }

    fn key(&self) -> (ResourceType, &str) {
        (self.resource_type, self.resource_id.as_str())
    }
}

/// Storage backend for favorites. Both the remote table and the device-local
/// mirror implement this, so the continuity policy can switch between them.
#[async_trait]
pub trait FavoriteStore: Send + Sync {
    /// Idempotent: adding an already-favorited resource returns `None` and
    /// leaves the set unchanged.
    async fn add(&self, resource: &ResourceRef) -> Result<Option<Favorite>>;

    /// Removing a favorite that does not exist is a no-op.
    async fn remove(&self, resource: &ResourceRef) -> Result<()>;

    async fn contains(&self, resource: &ResourceRef) -> Result<bool>;

    /// Returns the favorited subset of `ids`; never an id outside the input.
    async fn check(
        &self,
        resource_type: ResourceType,
        ids: &[String],
    ) -> Result<BTreeSet<String>>;

    async fn list(&self, resource_type: Option<ResourceType>) -> Result<Vec<Favorite>>;
}

/// Favorites as rows in the remote store's `user_favorites` table.
#[derive(Clone)]
pub struct RemoteFavorites {
    client: Client,
    user_id: String,
}

impl RemoteFavorites {
    pub fn new(client: Client, user_id: impl Into<String>) -> Self {
        Self {
            client,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl FavoriteStore for RemoteFavorites {
    async fn add(&self, resource: &ResourceRef) -> Result<Option<Favorite>> {
        let row = json!({
            "user_id": self.user_id,
            "resource_type": resource.resource_type,
            "resource_id": resource.resource_id,
        });
        match self.client.insert::<Favorite>(TABLE, &row).await {
            Ok(favorite) => Ok(Some(favorite)),
            Err(err) if err.is_unique_violation() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn remove(&self, resource: &ResourceRef) -> Result<()> {
        let filters = Filters::new()
            .eq("user_id", &self.user_id)
            .eq("resource_type", resource.resource_type)
            .eq("resource_id", &resource.resource_id);
        self.client.delete(TABLE, &filters).await
    }

    async fn contains(&self, resource: &ResourceRef) -> Result<bool> {
        let row = self
            .client
            .select(TABLE)
            .columns("id")
            .eq("user_id", &self.user_id)
            .eq("resource_type", resource.resource_type)
            .eq("resource_id", &resource.resource_id)
            .maybe_single::<serde_json::Value>()
            .await?;
        Ok(row.is_some())
    }

    async fn check(
        &self,
        resource_type: ResourceType,
        ids: &[String],
    ) -> Result<BTreeSet<String>> {
        if ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        #[derive(Deserialize)]
        struct Row {
            resource_id: String,
        }
        let rows: Vec<Row> = self
            .client
            .select(TABLE)
            .columns("resource_id")
            .eq("user_id", &self.user_id)
            .eq("resource_type", resource_type)
            .in_list("resource_id", ids)
            .fetch()
            .await?;
        let wanted: BTreeSet<&String> = ids.iter().collect();
        Ok(rows
            .into_iter()
            .map(|row| row.resource_id)
            .filter(|id| wanted.contains(id))
            .collect())
    }

    async fn list(&self, resource_type: Option<ResourceType>) -> Result<Vec<Favorite>> {
        let mut query = self
            .client
            .select(TABLE)
            .eq("user_id", &self.user_id)
            .order("created_at", true);
        if let Some(resource_type) = resource_type {
            query = query.eq("resource_type", resource_type);
        }
        query.fetch().await
    }
}

/// Favorites mirrored in a device-local JSON file; keeps the same
/// idempotence semantics as the remote table.
pub struct LocalFavorites {
    file: StateFile<Vec<Favorite>>,
    entries: Mutex<Vec<Favorite>>,
    user_id: String,
}

impl LocalFavorites {
    pub fn open(path: impl Into<PathBuf>, user_id: impl Into<String>) -> Result<Self> {
        let file = StateFile::new(path);
        let entries = file.load()?;
        Ok(Self {
            file,
            entries: Mutex::new(entries),
            user_id: user_id.into(),
        })
    }

    /// Records a favorite that already exists remotely, so an offline read
    /// later still sees it. Keeps the remote row's id and timestamp.
    pub fn mirror(&self, favorite: &Favorite) -> Result<()> {
        self.mutate(|entries| {
            if entries.iter().any(|f| f.key() == favorite.key()) {
                false
            } else {
                entries.insert(0, favorite.clone());
                true
            }
        })
        .map(|_| ())
    }

    /// Rewrites the mirror wholesale from a remote listing.
    pub fn replace_all(&self, favorites: Vec<Favorite>) -> Result<()> {
        let mut entries = self.lock()?;
        *entries = favorites;
        self.file.save(&entries)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<Favorite>>> {
        self.entries
            .lock()
            .map_err(|_| AiopError::InvalidResponse("favorites mirror lock is poisoned".to_string()))
    }

    fn mutate(&self, apply: impl FnOnce(&mut Vec<Favorite>) -> bool) -> Result<bool> {
        let mut entries = self.lock()?;
        let changed = apply(&mut entries);
        if changed {
            self.file.save(&entries)?;
        }
        Ok(changed)
    }

    fn local_id() -> String {
        let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
        millis.to_string()
    }
}

#[async_trait]
impl FavoriteStore for LocalFavorites {
    async fn add(&self, resource: &ResourceRef) -> Result<Option<Favorite>> {
        let favorite = Favorite {
            id: Self::local_id(),
            user_id: self.user_id.clone(),
            resource_type: resource.resource_type,
            resource_id: resource.resource_id.clone(),
            created_at: OffsetDateTime::now_utc(),
        };
        let added = self.mutate(|entries| {
            if entries
                .iter()
                .any(|f| f.key() == (resource.resource_type, resource.resource_id.as_str()))
            {
                false
            } else {
                entries.insert(0, favorite.clone());
                true
            }
        })?;
        Ok(added.then_some(favorite))
    }

    async fn remove(&self, resource: &ResourceRef) -> Result<()> {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|f| {
                f.key() != (resource.resource_type, resource.resource_id.as_str())
            });
            entries.len() != before
        })?;
        Ok(())
    }

    async fn contains(&self, resource: &ResourceRef) -> Result<bool> {
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .any(|f| f.key() == (resource.resource_type, resource.resource_id.as_str())))
    }

    async fn check(
        &self,
        resource_type: ResourceType,
        ids: &[String],
    ) -> Result<BTreeSet<String>> {
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .filter(|f| f.resource_type == resource_type && ids.contains(&f.resource_id))
            .map(|f| f.resource_id.clone())
            .collect())
    }

    async fn list(&self, resource_type: Option<ResourceType>) -> Result<Vec<Favorite>> {
        let entries = self.lock()?;
        Ok(entries
            .iter()
            .filter(|f| resource_type.is_none_or(|t| f.resource_type == t))
            .cloned()
            .collect())
    }
}

/// Reconciliation summary for [`Favorites::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Local-only entries pushed to the remote store.
    pub pushed: usize,
    /// Entries the mirror now holds after pulling the remote listing.
    pub pulled: usize,
}

/// Remote-first favorites with silent degraded-mode continuity: every
/// operation tries the remote table and, on any remote failure, completes
/// against the local mirror with the same return shape.
pub struct Favorites<R: FavoriteStore = RemoteFavorites> {
    remote: R,
    local: LocalFavorites,
}

impl Favorites<RemoteFavorites> {
    pub fn new(client: Client, user_id: &str, mirror_path: impl Into<PathBuf>) -> Result<Self> {
        let local = LocalFavorites::open(mirror_path, user_id)?;
        Ok(Self {
            remote: RemoteFavorites::new(client, user_id),
            local,
        })
    }
}

impl<R: FavoriteStore> Favorites<R> {
    pub fn with_stores(remote: R, local: LocalFavorites) -> Self {
        Self { remote, local }
    }

    pub async fn add(&self, resource: &ResourceRef) -> Result<Option<Favorite>> {
        match self.remote.add(resource).await {
            Ok(added) => {
                // Best effort: a failed mirror write must not fail the add.
                // A duplicate means the row already exists remotely, so the
                // mirror gets a synthetic entry for it.
                let mirrored = match &added {
                    Some(favorite) => self.local.mirror(favorite),
                    None => self.local.add(resource).await.map(|_| ()),
                };
                if let Err(err) = mirrored {
                    warn!(error = %err, "failed to mirror favorite locally");
                }
                Ok(added)
            }
            Err(err) => {
                warn!(error = %err, resource = %resource, "favorites backend unreachable, adding to local mirror");
                self.local.add(resource).await
            }
        }
    }

    pub async fn remove(&self, resource: &ResourceRef) -> Result<()> {
        match self.remote.remove(resource).await {
            Ok(()) => self.local.remove(resource).await,
            Err(err) => {
                warn!(error = %err, resource = %resource, "favorites backend unreachable, removing from local mirror");
                self.local.remove(resource).await
            }
        }
    }

    pub async fn contains(&self, resource: &ResourceRef) -> Result<bool> {
        match self.remote.contains(resource).await {
            Ok(found) => Ok(found),
            Err(err) => {
                warn!(error = %err, "favorites backend unreachable, checking local mirror");
                self.local.contains(resource).await
            }
        }
    }

    pub async fn check(
        &self,
        resource_type: ResourceType,
        ids: &[String],
    ) -> Result<BTreeSet<String>> {
        match self.remote.check(resource_type, ids).await {
            Ok(found) => Ok(found),
            Err(err) => {
                warn!(error = %err, "favorites backend unreachable, checking local mirror");
                self.local.check(resource_type, ids).await
            }
        }
    }

    pub async fn list(&self, resource_type: Option<ResourceType>) -> Result<Vec<Favorite>> {
        match self.remote.list(resource_type).await {
            Ok(favorites) => Ok(favorites),
            Err(err) => {
                warn!(error = %err, "favorites backend unreachable, listing local mirror");
                self.local.list(resource_type).await
            }
        }
    }

    /// Flips the favorite state and reports the new one.
    pub async fn toggle(&self, resource: &ResourceRef) -> Result<bool> {
        if self.contains(resource).await? {
            self.remove(resource).await?;
            Ok(false)
        } else {
            self.add(resource).await?;
            Ok(true)
        }
    }

    /// Explicit reconciliation of the two stores: pushes local-only entries
    /// to the remote table, then rewrites the mirror from the remote
    /// listing. Unlike the regular operations this is not degraded-mode
    /// tolerant; a sync against an unreachable backend fails.
    pub async fn sync(&self) -> Result<SyncReport> {
        let remote_entries = self.remote.list(None).await?;
        let remote_keys: BTreeSet<(ResourceType, String)> = remote_entries
            .iter()
            .map(|f| (f.resource_type, f.resource_id.clone()))
            .collect();

        let mut pushed = 0;
        for favorite in self.local.list(None).await? {
            let key = (favorite.resource_type, favorite.resource_id.clone());
            if remote_keys.contains(&key) {
                continue;
            }
            if self.remote.add(&favorite.resource()).await?.is_some() {
                pushed += 1;
            }
        }

        let merged = self.remote.list(None).await?;
        let pulled = merged.len();
        self.local.replace_all(merged)?;
        Ok(SyncReport { pushed, pulled })
    }
}

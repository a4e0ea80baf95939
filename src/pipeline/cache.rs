//! Entity cache collaborator interface

use crate::entity::Entity;
use crate::resource::Resource;
use std::sync::Arc;
use tokio::time::Instant;

/// Persistent store for processed entities, attached to one pipeline stage.
///
/// `key` runs on the main thread; every other method may run on a
/// background thread. A cache receives and returns content exactly as it
/// stood after its stage.
pub trait EntityCache: Send + Sync + 'static {
    /// Opaque key identifying one resource's entry
    type Key: Clone + Send + Sync + 'static;

    /// Key for `resource`, or `None` to decline caching it
    fn key(&self, resource: &Resource) -> Option<Self::Key>;

    /// Read a previously written entity
    fn read_entity(&self, key: &Self::Key) -> Option<Entity>;

    /// Store an entity, replacing any previous one
    fn write_entity(&self, entity: &Entity, key: &Self::Key);

    /// Remove the entity, if any
    fn remove_entity(&self, key: &Self::Key);

    /// Mark an entity as confirmed fresh at `timestamp`.
    ///
    /// The default re-reads and rewrites the whole entity.
    fn update_entity_timestamp(&self, timestamp: Instant, key: &Self::Key) {
        if let Some(entity) = self.read_entity(key) {
            self.write_entity(&entity.with_timestamp(timestamp), key);
        }
    }
}

/// A cache with its key type erased, as stored in a pipeline stage
pub(crate) trait ErasedCache: Send + Sync {
    fn entry(&self, resource: &Resource) -> Option<Box<dyn CacheEntry>>;
}

/// One resource's slot in a cache; safe to move to a background thread
pub(crate) trait CacheEntry: Send {
    fn read(&self) -> Option<Entity>;
    fn write(&self, entity: &Entity);
    fn remove(&self);
    fn update_timestamp(&self, timestamp: Instant);
}

pub(crate) struct CacheBox<C>(pub(crate) Arc<C>);

struct KeyedEntry<C: EntityCache> {
    cache: Arc<C>,
    key: C::Key,
}

impl<C: EntityCache> ErasedCache for CacheBox<C> {
    fn entry(&self, resource: &Resource) -> Option<Box<dyn CacheEntry>> {
        let key = self.0.key(resource)?;
        Some(Box::new(KeyedEntry {
            cache: self.0.clone(),
            key,
        }))
    }
}

impl<C: EntityCache> CacheEntry for KeyedEntry<C> {
    fn read(&self) -> Option<Entity> {
        self.cache.read_entity(&self.key)
    }

    fn write(&self, entity: &Entity) {
        self.cache.write_entity(entity, &self.key);
    }

    fn remove(&self) {
        self.cache.remove_entity(&self.key);
    }

    fn update_timestamp(&self, timestamp: Instant) {
        self.cache.update_entity_timestamp(timestamp, &self.key);
    }
}

//! Tracked child collections and identity-preserving reconciliation.
//!
//! A device tracks its services, a service its characteristics, a scanner
//! the devices it has seen. When native discovery returns a fresh list,
//! [`TrackedCollection::reconcile`] keeps every entity that still has a
//! native counterpart (the same `Arc`, so references and subscriptions held
//! by the application stay valid), creates entities for new elements and
//! drops and disposes the rest.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::entity::EntityKey;
use crate::error::{Error, Result};

/// An entity that can live in a [`TrackedCollection`].
pub trait Tracked: Send + Sync {
    /// Native description the entity is reconciled against.
    type Native;

    /// Stable key of the entity.
    fn key(&self) -> &EntityKey;

    /// Whether the entity represents `native`.
    fn matches(&self, native: &Self::Native) -> bool;

    /// Release the entity after it left the collection.
    fn dispose(&self);
}

/// Result of a reconciliation.
#[derive(Debug)]
pub struct Delta<E> {
    pub added: Vec<Arc<E>>,
    pub removed: Vec<Arc<E>>,
}

impl<E> Delta<E> {
    fn empty() -> Self {
        Self {
            added: Vec::new(),
            removed: Vec::new(),
        }
    }

    /// Whether membership changed.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl<E: Tracked> Delta<E> {
    pub fn added_keys(&self) -> Vec<EntityKey> {
        self.added.iter().map(|e| e.key().clone()).collect()
    }

    pub fn removed_keys(&self) -> Vec<EntityKey> {
        self.removed.iter().map(|e| e.key().clone()).collect()
    }
}

/// Ordered set of child entities.
#[derive(Debug)]
pub struct TrackedCollection<E> {
    items: Mutex<Vec<Arc<E>>>,
}

impl<E> Default for TrackedCollection<E> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Tracked> TrackedCollection<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time copy of the members.
    pub fn snapshot(&self) -> Vec<Arc<E>> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Members matching `filter`, in collection order.
    ///
    /// The filter runs on a snapshot, never under the collection lock.
    pub fn filter<F>(&self, mut filter: F) -> Vec<Arc<E>>
    where
        F: FnMut(&E) -> bool,
    {
        self.snapshot().into_iter().filter(|e| filter(e)).collect()
    }

    /// First member matching `filter`.
    pub fn find<F>(&self, mut filter: F) -> Option<Arc<E>>
    where
        F: FnMut(&E) -> bool,
    {
        self.snapshot().into_iter().find(|e| filter(e))
    }

    /// The only member matching `filter`, `None` if there is none.
    ///
    /// Fails with [`Error::MultipleFound`] when more than one matches.
    pub fn single<F>(&self, what: &str, filter: F) -> Result<Option<Arc<E>>>
    where
        F: FnMut(&E) -> bool,
    {
        let mut matches = self.filter(filter);
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            count => Err(Error::MultipleFound {
                what: what.to_string(),
                count,
            }),
        }
    }

    /// Member with the given key.
    pub fn get(&self, key: &EntityKey) -> Option<Arc<E>> {
        self.find(|e| e.key() == key)
    }

    /// Refresh membership from a native list.
    ///
    /// The resulting order follows `natives`. Each existing member is matched
    /// at most once; `create` builds members for the native elements left
    /// unmatched. Removed members are disposed after the lock is released.
    pub fn reconcile<F>(&self, natives: &[E::Native], mut create: F) -> Delta<E>
    where
        F: FnMut(&E::Native) -> Arc<E>,
    {
        let mut delta = Delta::empty();
        {
            let mut items = self.lock();
            let mut remaining: Vec<Option<Arc<E>>> = items.drain(..).map(Some).collect();
            let mut next = Vec::with_capacity(natives.len());

            for native in natives {
                let existing = remaining
                    .iter_mut()
                    .find(|slot| slot.as_ref().is_some_and(|e| e.matches(native)))
                    .and_then(Option::take);
                match existing {
                    Some(entity) => next.push(entity),
                    None => {
                        let entity = create(native);
                        delta.added.push(Arc::clone(&entity));
                        next.push(entity);
                    }
                }
            }

            delta.removed = remaining.into_iter().flatten().collect();
            *items = next;
        }

        for entity in &delta.removed {
            entity.dispose();
        }
        delta
    }

    /// Return the member matching `filter`, or insert the one built by
    /// `create`. The flag is `true` when a member was inserted.
    pub fn get_or_insert_with<F, C>(&self, mut filter: F, create: C) -> (Arc<E>, bool)
    where
        F: FnMut(&E) -> bool,
        C: FnOnce() -> Arc<E>,
    {
        let mut items = self.lock();
        if let Some(existing) = items.iter().find(|e| filter(e)) {
            return (Arc::clone(existing), false);
        }
        let entity = create();
        items.push(Arc::clone(&entity));
        (entity, true)
    }

    /// Remove and dispose members for which `keep` returns `false`.
    pub fn retain<F>(&self, mut keep: F) -> Vec<Arc<E>>
    where
        F: FnMut(&E) -> bool,
    {
        let removed: Vec<Arc<E>> = {
            let mut items = self.lock();
            let (kept, removed) = items.drain(..).partition(|e| keep(e));
            *items = kept;
            removed
        };
        for entity in &removed {
            entity.dispose();
        }
        removed
    }

    /// Remove and dispose every member.
    pub fn clear(&self) -> Vec<Arc<E>> {
        self.retain(|_| false)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<E>>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

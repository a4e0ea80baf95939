//! Observers, owners and the per-resource observer registry

use super::Resource;
use std::fmt;
use std::rc::{Rc, Weak};

/// Why a resource notified its observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceEvent {
    /// Sent only to an observer when it starts observing
    ObserverAdded,
    /// A load request started
    Requested,
    /// A load request was cancelled
    RequestCancelled,
    /// `latest_data` changed
    NewData(NewDataSource),
    /// The server confirmed `latest_data` is still current
    NotModified,
    /// A load request failed; `latest_error` is set
    Error,
}

impl fmt::Display for ResourceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObserverAdded => f.write_str("observerAdded"),
            Self::Requested => f.write_str("requested"),
            Self::RequestCancelled => f.write_str("requestCancelled"),
            Self::NewData(source) => write!(f, "newData({})", source),
            Self::NotModified => f.write_str("notModified"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Where new data came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewDataSource {
    /// A network response
    Network,
    /// A pipeline cache
    Cache,
    /// `override_local_data` or `override_local_content`
    LocalOverride,
    /// `wipe`, which cleared the data
    Wipe,
}

impl fmt::Display for NewDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Network => "network",
            Self::Cache => "cache",
            Self::LocalOverride => "localOverride",
            Self::Wipe => "wipe",
        })
    }
}

/// Something interested in a resource's state changes
pub trait ResourceObserver {
    /// The resource's state changed
    fn resource_changed(&self, resource: &Resource, event: &ResourceEvent);

    /// A load request made progress
    fn resource_request_progress(&self, _resource: &Resource, _progress: f64) {}

    /// This observer was removed from the resource
    fn stopped_observing(&self, _resource: &Resource) {}
}

impl<F: Fn(&Resource, &ResourceEvent)> ResourceObserver for F {
    fn resource_changed(&self, resource: &Resource, event: &ResourceEvent) {
        self(resource, event)
    }
}

pub(crate) struct OwnerToken;

/// Lifetime token for observer registrations.
///
/// An observer added with an owner stays registered, and strongly held, for
/// as long as any clone of the owner is alive.
#[derive(Clone)]
pub struct Owner(Rc<OwnerToken>);

impl Owner {
    /// A new owner
    pub fn new() -> Self {
        Self(Rc::new(OwnerToken))
    }

    fn downgrade(&self) -> Weak<OwnerToken> {
        Rc::downgrade(&self.0)
    }
}

impl Default for Owner {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owner({:p})", Rc::as_ptr(&self.0))
    }
}

/// Who keeps an observer registration alive
pub(crate) enum Ownership<'a> {
    /// The observer owns itself and stays while the caller keeps it
    SelfOwned,
    /// An external owner; the observer is held until every such owner dies
    External(&'a Owner),
}

struct ObserverEntry {
    id: *const (),
    observer: Weak<dyn ResourceObserver>,
    strong: Option<Rc<dyn ResourceObserver>>,
    self_owned: bool,
    owners: Vec<Weak<OwnerToken>>,
}

impl ObserverEntry {
    fn is_alive(&mut self) -> bool {
        self.owners.retain(|owner| owner.strong_count() > 0);
        if self.owners.is_empty() {
            self.strong = None;
        }
        !self.owners.is_empty() || (self.self_owned && self.observer.strong_count() > 0)
    }
}

/// Observers of one resource, in registration order
#[derive(Default)]
pub(crate) struct ObserverSet {
    entries: Vec<ObserverEntry>,
}

fn identity(observer: &Rc<dyn ResourceObserver>) -> *const () {
    Rc::as_ptr(observer) as *const ()
}

impl ObserverSet {
    /// Register `observer`, merging with an existing entry for the same
    /// observer. Returns true if this created a new entry.
    pub(crate) fn add(
        &mut self,
        observer: Rc<dyn ResourceObserver>,
        ownership: Ownership<'_>,
    ) -> bool {
        let id = identity(&observer);
        let (index, is_new) = match self.entries.iter().position(|entry| entry.id == id) {
            Some(index) => (index, false),
            None => {
                self.entries.push(ObserverEntry {
                    id,
                    observer: Rc::downgrade(&observer),
                    strong: None,
                    self_owned: false,
                    owners: Vec::new(),
                });
                (self.entries.len() - 1, true)
            }
        };

        let entry = &mut self.entries[index];
        match ownership {
            Ownership::SelfOwned => entry.self_owned = true,
            Ownership::External(owner) => {
                let token = owner.downgrade();
                if !entry.owners.iter().any(|o| o.ptr_eq(&token)) {
                    entry.owners.push(token);
                }
                entry.strong = Some(observer);
            }
        }
        is_new
    }

    /// Drop `owner` from every entry
    pub(crate) fn remove_owner(&mut self, owner: &Owner) {
        let token = owner.downgrade();
        for entry in &mut self.entries {
            entry.owners.retain(|o| !o.ptr_eq(&token));
        }
    }

    /// Drop the entry for `observer`, returning whether it was registered
    pub(crate) fn remove(&mut self, observer: &Rc<dyn ResourceObserver>) -> bool {
        let id = identity(observer);
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    /// Remove dead entries, returning those observers still reachable so
    /// they can be told they stopped observing
    pub(crate) fn sweep(&mut self) -> Vec<Rc<dyn ResourceObserver>> {
        let mut removed = Vec::new();
        self.entries.retain_mut(|entry| {
            let strong = entry.strong.clone();
            if entry.is_alive() {
                return true;
            }
            if let Some(observer) = strong.or_else(|| entry.observer.upgrade()) {
                removed.push(observer);
            }
            false
        });
        removed
    }

    /// Live observers, in registration order
    pub(crate) fn snapshot(&self) -> Vec<Rc<dyn ResourceObserver>> {
        self.entries
            .iter()
            .filter_map(|entry| entry.strong.clone().or_else(|| entry.observer.upgrade()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Quiet;

    impl ResourceObserver for Quiet {
        fn resource_changed(&self, _: &Resource, _: &ResourceEvent) {}
    }

    fn observer() -> Rc<dyn ResourceObserver> {
        Rc::new(Quiet)
    }

    #[test]
    fn test_self_owned_lives_while_referenced() {
        let mut set = ObserverSet::default();
        let o = observer();
        assert!(set.add(o.clone(), Ownership::SelfOwned));
        assert!(set.sweep().is_empty());
        assert_eq!(set.len(), 1);

        drop(o);
        assert!(set.sweep().is_empty());
        assert!(set.is_empty());
    }

    #[test]
    fn test_external_owner_holds_observer() {
        let mut set = ObserverSet::default();
        let owner = Owner::new();
        assert!(set.add(observer(), Ownership::External(&owner)));
        assert!(set.sweep().is_empty());
        assert_eq!(set.snapshot().len(), 1);

        drop(owner);
        assert_eq!(set.sweep().len(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_remove_owner() {
        let mut set = ObserverSet::default();
        let first = Owner::new();
        let second = Owner::new();
        let o = observer();
        assert!(set.add(o.clone(), Ownership::External(&first)));
        assert!(!set.add(o.clone(), Ownership::External(&second)));
        assert_eq!(set.len(), 1);

        set.remove_owner(&first);
        assert!(set.sweep().is_empty());
        set.remove_owner(&second);
        assert_eq!(set.sweep().len(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_self_owned_with_external_owner() {
        let mut set = ObserverSet::default();
        let owner = Owner::new();
        let o = observer();
        set.add(o.clone(), Ownership::SelfOwned);
        set.add(o.clone(), Ownership::External(&owner));

        drop(owner);
        assert!(set.sweep().is_empty());
        assert_eq!(set.len(), 1);

        drop(o);
        set.sweep();
        assert!(set.is_empty());
    }
}

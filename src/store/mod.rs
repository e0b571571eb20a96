//! Versioned, namespaced resource store
//!
//! The store is the only shared mutable state in the system. Every resource
//! is addressed by `(namespace, type, id)` and carries its own version
//! sequence; writes are optimistic (the caller names the version it read) so
//! concurrent writers to the same object are linearized by the version check
//! while writers to different objects never block each other.
//!
//! Every successful mutation fans out exactly one [`WatchEvent`] to the
//! watchers of its `(namespace, type)` scope.

mod memory;
mod watch;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::resources::{Resource, ResourceType, Version};
use crate::Error;

pub use memory::InMemoryStore;
pub use watch::{WatchEvent, WatchStream};

/// Storage backend for resources
///
/// The in-memory implementation is the only one shipped; the trait exists so
/// reconcile logic can be exercised against injected failures.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a resource
    ///
    /// Fails with [`Error::NotFound`] if it does not exist.
    async fn get(
        &self,
        namespace: &str,
        resource_type: ResourceType,
        id: &str,
    ) -> Result<Resource, Error>;

    /// List all resources of a type in a namespace, ordered by id
    async fn list(&self, namespace: &str, resource_type: ResourceType)
        -> Result<Vec<Resource>, Error>;

    /// Insert a new resource at version 0
    ///
    /// Fails with [`Error::AlreadyExists`] if the identity is taken. Returns
    /// the stored snapshot.
    async fn create(&self, resource: Resource) -> Result<Resource, Error>;

    /// Replace a resource's payload if its current version is `expected`
    ///
    /// Fails with [`Error::Conflict`] on a version mismatch and
    /// [`Error::NotFound`] if the resource is gone. Returns the stored
    /// snapshot at the incremented version.
    async fn update(&self, resource: Resource, expected: Version) -> Result<Resource, Error>;

    /// Remove a resource if its current version is `expected`
    async fn destroy(
        &self,
        namespace: &str,
        resource_type: ResourceType,
        id: &str,
        expected: Version,
    ) -> Result<(), Error>;

    /// Subscribe to mutations of a type in a namespace
    ///
    /// With `id` set, only events for that resource are delivered (resync
    /// markers are always delivered). Only mutations committed after the
    /// call are observed; callers that need current state should list after
    /// subscribing.
    async fn watch(
        &self,
        namespace: &str,
        resource_type: ResourceType,
        id: Option<String>,
    ) -> Result<WatchStream, Error>;
}

//! In-memory [`ResourceStore`] backed by concurrent hash maps

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use super::watch::{into_stream, WatchEvent, WatchStream};
use super::ResourceStore;
use crate::config::DEFAULT_WATCH_BUFFER;
use crate::resources::{Resource, ResourceType, Version};
use crate::Error;

type ObjectKey = (String, ResourceType, String);
type ScopeKey = (String, ResourceType);

/// Thread-safe in-memory resource store
///
/// Mutations of a `(namespace, type)` scope are serialized on that scope's
/// broadcast sender, so watchers observe them in commit order. Lock order is
/// always scope then object.
pub struct InMemoryStore {
    objects: DashMap<ObjectKey, Resource>,
    scopes: DashMap<ScopeKey, broadcast::Sender<WatchEvent>>,
    watch_buffer: usize,
}

impl InMemoryStore {
    /// Create an empty store with the default watch buffer
    pub fn new() -> Self {
        Self::with_watch_buffer(DEFAULT_WATCH_BUFFER)
    }

    /// Create an empty store whose watchers buffer up to `watch_buffer`
    /// events before falling behind
    pub fn with_watch_buffer(watch_buffer: usize) -> Self {
        Self {
            objects: DashMap::new(),
            scopes: DashMap::new(),
            watch_buffer: watch_buffer.max(1),
        }
    }

    fn scope(
        &self,
        namespace: &str,
        resource_type: ResourceType,
    ) -> dashmap::mapref::one::RefMut<'_, ScopeKey, broadcast::Sender<WatchEvent>> {
        let buffer = self.watch_buffer;
        self.scopes
            .entry((namespace.to_string(), resource_type))
            .or_insert_with(|| broadcast::channel(buffer).0)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn object_key(namespace: &str, resource_type: ResourceType, id: &str) -> ObjectKey {
    (namespace.to_string(), resource_type, id.to_string())
}

fn publish(sender: &broadcast::Sender<WatchEvent>, event: WatchEvent) {
    // No receivers is not an error: nobody is watching this scope
    let receivers = sender.send(event).unwrap_or(0);
    trace!(receivers, "published watch event");
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get(
        &self,
        namespace: &str,
        resource_type: ResourceType,
        id: &str,
    ) -> Result<Resource, Error> {
        self.objects
            .get(&object_key(namespace, resource_type, id))
            .map(|r| r.value().clone())
            .ok_or_else(|| Error::not_found(namespace, resource_type, id))
    }

    async fn list(
        &self,
        namespace: &str,
        resource_type: ResourceType,
    ) -> Result<Vec<Resource>, Error> {
        let mut resources: Vec<Resource> = self
            .objects
            .iter()
            .filter(|entry| {
                let (ns, ty, _) = entry.key();
                ns == namespace && *ty == resource_type
            })
            .map(|entry| entry.value().clone())
            .collect();
        resources.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(resources)
    }

    async fn create(&self, resource: Resource) -> Result<Resource, Error> {
        let scope = self.scope(resource.namespace(), resource.resource_type());
        let key = object_key(resource.namespace(), resource.resource_type(), resource.id());

        match self.objects.entry(key) {
            Entry::Occupied(_) => Err(Error::already_exists(
                resource.namespace(),
                resource.resource_type(),
                resource.id(),
            )),
            Entry::Vacant(slot) => {
                let stored = resource.with_version(Version::INITIAL);
                slot.insert(stored.clone());
                publish(&scope, WatchEvent::Created(stored.clone()));
                Ok(stored)
            }
        }
    }

    async fn update(&self, resource: Resource, expected: Version) -> Result<Resource, Error> {
        let scope = self.scope(resource.namespace(), resource.resource_type());
        let key = object_key(resource.namespace(), resource.resource_type(), resource.id());

        let mut current = self.objects.get_mut(&key).ok_or_else(|| {
            Error::not_found(resource.namespace(), resource.resource_type(), resource.id())
        })?;

        if current.version() != expected {
            return Err(Error::conflict(
                resource.namespace(),
                resource.resource_type(),
                resource.id(),
                expected,
                current.version(),
            ));
        }

        let stored = resource.with_version(expected.next());
        *current = stored.clone();
        publish(&scope, WatchEvent::Updated(stored.clone()));
        Ok(stored)
    }

    async fn destroy(
        &self,
        namespace: &str,
        resource_type: ResourceType,
        id: &str,
        expected: Version,
    ) -> Result<(), Error> {
        let scope = self.scope(namespace, resource_type);

        match self.objects.entry(object_key(namespace, resource_type, id)) {
            Entry::Vacant(_) => Err(Error::not_found(namespace, resource_type, id)),
            Entry::Occupied(entry) => {
                let actual = entry.get().version();
                if actual != expected {
                    return Err(Error::conflict(namespace, resource_type, id, expected, actual));
                }
                let (_, last) = entry.remove_entry();
                publish(&scope, WatchEvent::Destroyed(last));
                Ok(())
            }
        }
    }

    async fn watch(
        &self,
        namespace: &str,
        resource_type: ResourceType,
        id: Option<String>,
    ) -> Result<WatchStream, Error> {
        let rx = self.scope(namespace, resource_type).subscribe();
        Ok(into_stream(rx, id))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::StreamExt;
    use serde_json::json;

    use super::*;
    use crate::resources::{KubernetesRootSpec, ManifestSpec, CONTROL_PLANE_NAMESPACE};

    fn manifest(id: &str, kind: &str) -> Resource {
        Resource::manifest(id, ManifestSpec::new(vec![json!({ "kind": kind })]))
    }

    async fn next_event(stream: &mut WatchStream) -> WatchEvent {
        tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("watch event within timeout")
            .expect("watch stream open")
    }

    // =========================================================================
    // CRUD Stories
    // =========================================================================

    /// Story: a created resource starts at version 0 and reads back as stored
    #[tokio::test]
    async fn story_create_then_get() {
        let store = InMemoryStore::new();

        let created = store.create(manifest("10-kube-proxy", "DaemonSet")).await.unwrap();
        assert_eq!(created.version(), Version::INITIAL);

        let read = store
            .get(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest, "10-kube-proxy")
            .await
            .unwrap();
        assert_eq!(read, created);
    }

    #[tokio::test]
    async fn story_create_twice_is_already_exists() {
        let store = InMemoryStore::new();
        store.create(manifest("10-kube-proxy", "DaemonSet")).await.unwrap();

        let err = store
            .create(manifest("10-kube-proxy", "DaemonSet"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn story_get_missing_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .get(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest, "nope")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    /// Story: the same id under a different type is a different resource
    #[tokio::test]
    async fn story_identity_includes_type() {
        let store = InMemoryStore::new();
        store.create(manifest("k8s", "Secret")).await.unwrap();
        store
            .create(Resource::new(
                CONTROL_PLANE_NAMESPACE,
                "k8s",
                KubernetesRootSpec::default(),
            ))
            .await
            .unwrap();

        let manifests = store
            .list(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest)
            .await
            .unwrap();
        assert_eq!(manifests.len(), 1);
    }

    /// Story: list order is by id regardless of insertion order
    #[tokio::test]
    async fn story_list_is_sorted_by_id() {
        let store = InMemoryStore::new();
        for id in ["11-core-dns", "00-token", "05-flannel", "01-csr"] {
            store.create(manifest(id, "ConfigMap")).await.unwrap();
        }
        store
            .create(Resource::new("other", "02-elsewhere", ManifestSpec::default()))
            .await
            .unwrap();

        let ids: Vec<String> = store
            .list(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest)
            .await
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["00-token", "01-csr", "05-flannel", "11-core-dns"]);
    }

    // =========================================================================
    // Optimistic Concurrency Stories
    // =========================================================================

    /// Story: each update bumps the version; a write based on a stale read
    /// is rejected with both versions reported
    #[tokio::test]
    async fn story_update_with_stale_version_conflicts() {
        let store = InMemoryStore::new();
        let v0 = store.create(manifest("10-kube-proxy", "DaemonSet")).await.unwrap();

        let v1 = store
            .update(manifest("10-kube-proxy", "ServiceAccount"), v0.version())
            .await
            .unwrap();
        assert_eq!(v1.version(), Version::new(1));

        let err = store
            .update(manifest("10-kube-proxy", "Secret"), v0.version())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(
            err,
            Error::Conflict { expected, actual, .. }
                if expected == Version::new(0) && actual == Version::new(1)
        ));
    }

    #[tokio::test]
    async fn story_update_missing_is_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .update(manifest("10-kube-proxy", "DaemonSet"), Version::INITIAL)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn story_destroy_checks_version() {
        let store = InMemoryStore::new();
        store.create(manifest("05-flannel", "DaemonSet")).await.unwrap();

        let err = store
            .destroy(
                CONTROL_PLANE_NAMESPACE,
                ResourceType::Manifest,
                "05-flannel",
                Version::new(7),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        store
            .destroy(
                CONTROL_PLANE_NAMESPACE,
                ResourceType::Manifest,
                "05-flannel",
                Version::INITIAL,
            )
            .await
            .unwrap();

        let err = store
            .destroy(
                CONTROL_PLANE_NAMESPACE,
                ResourceType::Manifest,
                "05-flannel",
                Version::INITIAL,
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    /// Story: concurrent writers racing on one version, exactly one wins
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn story_concurrent_updates_linearize() {
        let store = Arc::new(InMemoryStore::new());
        store.create(manifest("11-core-dns", "Deployment")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .update(manifest("11-core-dns", &format!("Kind{i}")), Version::INITIAL)
                    .await
            }));
        }

        let mut wins = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) => assert!(e.is_retryable()),
            }
        }
        assert_eq!(wins, 1);

        let current = store
            .get(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest, "11-core-dns")
            .await
            .unwrap();
        assert_eq!(current.version(), Version::new(1));
    }

    // =========================================================================
    // Watch Stories
    // =========================================================================

    /// Story: a watcher sees create, update and destroy in commit order
    #[tokio::test]
    async fn story_watch_delivers_mutations_in_order() {
        let store = InMemoryStore::new();
        let mut events = store
            .watch(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest, None)
            .await
            .unwrap();

        let created = store.create(manifest("a", "ConfigMap")).await.unwrap();
        let updated = store
            .update(manifest("a", "Secret"), created.version())
            .await
            .unwrap();
        store.create(manifest("b", "ConfigMap")).await.unwrap();
        store
            .destroy(
                CONTROL_PLANE_NAMESPACE,
                ResourceType::Manifest,
                "a",
                updated.version(),
            )
            .await
            .unwrap();

        assert_eq!(next_event(&mut events).await, WatchEvent::Created(created));
        assert_eq!(
            next_event(&mut events).await,
            WatchEvent::Updated(updated.clone())
        );
        assert!(matches!(next_event(&mut events).await, WatchEvent::Created(r) if r.id() == "b"));
        assert_eq!(next_event(&mut events).await, WatchEvent::Destroyed(updated));
    }

    #[tokio::test]
    async fn story_watch_is_scoped_and_filterable_by_id() {
        let store = InMemoryStore::new();
        let mut only_b = store
            .watch(
                CONTROL_PLANE_NAMESPACE,
                ResourceType::Manifest,
                Some("b".to_string()),
            )
            .await
            .unwrap();

        store.create(manifest("a", "ConfigMap")).await.unwrap();
        store
            .create(Resource::new("elsewhere", "b", ManifestSpec::default()))
            .await
            .unwrap();
        store.create(manifest("b", "ConfigMap")).await.unwrap();

        let event = next_event(&mut only_b).await;
        let resource = event.resource().unwrap();
        assert_eq!(resource.id(), "b");
        assert_eq!(resource.namespace(), CONTROL_PLANE_NAMESPACE);
    }

    /// Story: failed mutations produce no notification
    #[tokio::test]
    async fn story_rejected_writes_are_silent() {
        let store = InMemoryStore::new();
        store.create(manifest("a", "ConfigMap")).await.unwrap();

        let mut events = store
            .watch(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest, None)
            .await
            .unwrap();

        assert!(store.create(manifest("a", "ConfigMap")).await.is_err());
        assert!(store
            .update(manifest("a", "Secret"), Version::new(9))
            .await
            .is_err());

        let nothing = tokio::time::timeout(Duration::from_millis(50), events.next()).await;
        assert!(nothing.is_err());
    }

    /// Story: a slow watcher never blocks writers; it gets a resync marker
    /// and then keeps receiving live events
    #[tokio::test]
    async fn story_lagging_watcher_gets_resync() {
        let store = InMemoryStore::with_watch_buffer(2);
        let mut events = store
            .watch(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest, None)
            .await
            .unwrap();

        for i in 0..5 {
            store
                .create(manifest(&format!("{i:02}-m"), "ConfigMap"))
                .await
                .unwrap();
        }

        assert_eq!(next_event(&mut events).await, WatchEvent::Resync { missed: 3 });
        assert!(matches!(next_event(&mut events).await, WatchEvent::Created(r) if r.id() == "03-m"));
        assert!(matches!(next_event(&mut events).await, WatchEvent::Created(r) if r.id() == "04-m"));
    }
}

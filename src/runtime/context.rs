//! Store access handed to a reconcile invocation

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::Output;
use crate::resources::{Resource, ResourceType, Version};
use crate::store::ResourceStore;
use crate::Error;

/// A controller's view of the store during reconcile
///
/// Every operation first checks the runtime's cancellation signal and fails
/// with [`Error::Cancelled`] once it has fired, so a reconcile stops at the
/// next store call after shutdown begins. Writes are restricted to the
/// `(namespace, type)` outputs the controller declared.
#[derive(Clone)]
pub struct ReconcileContext {
    store: Arc<dyn ResourceStore>,
    controller: String,
    outputs: Vec<Output>,
    cancel: CancellationToken,
}

impl ReconcileContext {
    /// Build a context for `controller`
    ///
    /// The runtime builds one per controller task; tests build them directly
    /// to drive a reconcile by hand.
    pub fn new(
        store: Arc<dyn ResourceStore>,
        controller: impl Into<String>,
        outputs: Vec<Output>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            controller: controller.into(),
            outputs,
            cancel,
        }
    }

    /// Name of the controller this context belongs to
    pub fn controller_name(&self) -> &str {
        &self.controller
    }

    /// Whether shutdown has begun
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    fn check_owned(&self, namespace: &str, resource_type: ResourceType) -> Result<(), Error> {
        let owned = self
            .outputs
            .iter()
            .any(|o| o.namespace == namespace && o.resource_type == resource_type);
        if owned {
            Ok(())
        } else {
            Err(Error::OwnershipViolation {
                controller: self.controller.clone(),
                namespace: namespace.to_string(),
                resource_type,
            })
        }
    }

    /// Read a resource
    pub async fn get(
        &self,
        namespace: &str,
        resource_type: ResourceType,
        id: &str,
    ) -> Result<Resource, Error> {
        self.check_cancelled()?;
        self.store.get(namespace, resource_type, id).await
    }

    /// Read a resource, mapping absence to `None`
    pub async fn get_optional(
        &self,
        namespace: &str,
        resource_type: ResourceType,
        id: &str,
    ) -> Result<Option<Resource>, Error> {
        match self.get(namespace, resource_type, id).await {
            Ok(resource) => Ok(Some(resource)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List resources of a type in a namespace, ordered by id
    pub async fn list(
        &self,
        namespace: &str,
        resource_type: ResourceType,
    ) -> Result<Vec<Resource>, Error> {
        self.check_cancelled()?;
        self.store.list(namespace, resource_type).await
    }

    /// Create an owned resource
    pub async fn create(&self, resource: Resource) -> Result<Resource, Error> {
        self.check_cancelled()?;
        self.check_owned(resource.namespace(), resource.resource_type())?;
        self.store.create(resource).await
    }

    /// Update an owned resource read at `expected`
    pub async fn update(&self, resource: Resource, expected: Version) -> Result<Resource, Error> {
        self.check_cancelled()?;
        self.check_owned(resource.namespace(), resource.resource_type())?;
        self.store.update(resource, expected).await
    }

    /// Destroy an owned resource read at `expected`
    pub async fn destroy(
        &self,
        namespace: &str,
        resource_type: ResourceType,
        id: &str,
        expected: Version,
    ) -> Result<(), Error> {
        self.check_cancelled()?;
        self.check_owned(namespace, resource_type)?;
        self.store
            .destroy(namespace, resource_type, id, expected)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ManifestSpec, CONTROL_PLANE_NAMESPACE, SECRETS_NAMESPACE};
    use crate::store::{InMemoryStore, MockResourceStore};

    fn ctx_with(store: Arc<dyn ResourceStore>, cancel: CancellationToken) -> ReconcileContext {
        ReconcileContext::new(
            store,
            "manifests",
            vec![Output::new(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest)],
            cancel,
        )
    }

    #[tokio::test]
    async fn test_writes_outside_outputs_are_rejected() {
        let ctx = ctx_with(Arc::new(InMemoryStore::new()), CancellationToken::new());

        let err = ctx
            .create(Resource::new(SECRETS_NAMESPACE, "x", ManifestSpec::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::OwnershipViolation { .. }));
        assert!(err.is_fatal());

        ctx.create(Resource::manifest("x", ManifestSpec::default()))
            .await
            .unwrap();
    }

    /// Story: after cancellation no store call reaches the backend
    #[tokio::test]
    async fn story_cancelled_context_short_circuits() {
        // A mock with no expectations panics if called
        let store = MockResourceStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = ctx_with(Arc::new(store), cancel);

        assert!(ctx
            .get(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest, "a")
            .await
            .unwrap_err()
            .is_cancelled());
        assert!(ctx
            .list(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest)
            .await
            .unwrap_err()
            .is_cancelled());
        assert!(ctx
            .create(Resource::manifest("a", ManifestSpec::default()))
            .await
            .unwrap_err()
            .is_cancelled());
    }

    #[tokio::test]
    async fn test_get_optional_maps_not_found() {
        let ctx = ctx_with(Arc::new(InMemoryStore::new()), CancellationToken::new());
        let missing = ctx
            .get_optional(SECRETS_NAMESPACE, ResourceType::KubernetesRoot, "k8s")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_get_optional_propagates_other_errors() {
        let mut store = MockResourceStore::new();
        store
            .expect_get()
            .returning(|_, _, _| Err(Error::unavailable("down")));
        let ctx = ctx_with(Arc::new(store), CancellationToken::new());

        let err = ctx
            .get_optional(SECRETS_NAMESPACE, ResourceType::KubernetesRoot, "k8s")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}

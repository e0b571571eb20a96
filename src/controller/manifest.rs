//! Manifest controller
//!
//! Watches the BootstrapManifestsConfig and KubernetesRoot resources and keeps
//! the Manifest resources in the control-plane namespace equal to the set
//! rendered from them:
//!
//! 1. Read both inputs. If either is missing, destroy every owned manifest
//!    and wait for the next change.
//! 2. Render the enabled catalogue slots.
//! 3. Diff against the listed manifests ([`plan_changes`]).
//! 4. Apply creates, updates and destroys against the listed versions.
//!
//! A reconcile that loses a race with another writer fails with a retryable
//! error and is run again by the runtime from step 1.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::bootstrap::{render_desired, DefaultManifestRenderer, DesiredManifest, ManifestRenderer};
use crate::resources::{
    BootstrapManifestsConfigSpec, KubernetesRootSpec, ManifestSpec, Resource, ResourceType,
    Version, BOOTSTRAP_MANIFESTS_CONFIG_ID, CONFIG_NAMESPACE, CONTROL_PLANE_NAMESPACE,
    KUBERNETES_ROOT_ID, SECRETS_NAMESPACE,
};
use crate::runtime::{Action, Controller, Input, Output, ReconcileContext};
use crate::Error;

/// Registered name of the manifest controller
pub const CONTROLLER_NAME: &str = "ManifestController";

/// One step toward the desired manifest set
#[derive(Clone, Debug, PartialEq)]
pub enum ManifestChange {
    /// Manifest is desired but absent
    Create {
        /// Manifest id
        id: String,
        /// Rendered body
        spec: ManifestSpec,
    },
    /// Manifest exists with a different body
    Update {
        /// Manifest id
        id: String,
        /// Rendered body
        spec: ManifestSpec,
        /// Version the manifest was listed at
        expected: Version,
    },
    /// Manifest exists but is no longer desired
    Destroy {
        /// Manifest id
        id: String,
        /// Version the manifest was listed at
        expected: Version,
    },
}

impl ManifestChange {
    /// Id of the manifest this change touches
    pub fn id(&self) -> &str {
        match self {
            Self::Create { id, .. } | Self::Update { id, .. } | Self::Destroy { id, .. } => id,
        }
    }
}

/// Diff the desired set against the current manifests
///
/// Creates and updates come first, in desired (catalogue) order, followed by
/// destroys in id order. Manifests whose body already matches produce no
/// change, so an already converged store yields an empty plan.
pub fn plan_changes(desired: &[DesiredManifest], current: &[Resource]) -> Vec<ManifestChange> {
    let mut existing: HashMap<&str, &Resource> =
        current.iter().map(|r| (r.id(), r)).collect();

    let mut changes = Vec::new();
    for manifest in desired {
        match existing.remove(manifest.id) {
            None => changes.push(ManifestChange::Create {
                id: manifest.id.to_string(),
                spec: manifest.spec.clone(),
            }),
            Some(resource) => {
                let unchanged = resource
                    .typed::<ManifestSpec>()
                    .map(|spec| *spec == manifest.spec)
                    .unwrap_or(false);
                if !unchanged {
                    changes.push(ManifestChange::Update {
                        id: manifest.id.to_string(),
                        spec: manifest.spec.clone(),
                        expected: resource.version(),
                    });
                }
            }
        }
    }

    // `current` is listed in id order; keep destroys in that order
    changes.extend(
        current
            .iter()
            .filter(|r| existing.contains_key(r.id()))
            .map(|r| ManifestChange::Destroy {
                id: r.id().to_string(),
                expected: r.version(),
            }),
    );
    changes
}

/// Renders and maintains the bootstrap manifests
pub struct ManifestController {
    renderer: Arc<dyn ManifestRenderer>,
}

impl ManifestController {
    /// Controller using the built-in templates
    pub fn new() -> Self {
        Self::with_renderer(Arc::new(DefaultManifestRenderer))
    }

    /// Controller using a custom template collaborator
    pub fn with_renderer(renderer: Arc<dyn ManifestRenderer>) -> Self {
        Self { renderer }
    }
}

impl Default for ManifestController {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Controller for ManifestController {
    fn name(&self) -> &str {
        CONTROLLER_NAME
    }

    fn inputs(&self) -> Vec<Input> {
        vec![
            Input::named(
                CONFIG_NAMESPACE,
                ResourceType::BootstrapManifestsConfig,
                BOOTSTRAP_MANIFESTS_CONFIG_ID,
            ),
            Input::named(
                SECRETS_NAMESPACE,
                ResourceType::KubernetesRoot,
                KUBERNETES_ROOT_ID,
            ),
        ]
    }

    fn outputs(&self) -> Vec<Output> {
        vec![Output::new(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest)]
    }

    #[instrument(skip_all)]
    async fn reconcile(&self, ctx: &ReconcileContext) -> Result<Action, Error> {
        let config = ctx
            .get_optional(
                CONFIG_NAMESPACE,
                ResourceType::BootstrapManifestsConfig,
                BOOTSTRAP_MANIFESTS_CONFIG_ID,
            )
            .await?;
        let secrets = ctx
            .get_optional(
                SECRETS_NAMESPACE,
                ResourceType::KubernetesRoot,
                KUBERNETES_ROOT_ID,
            )
            .await?;

        let (config, secrets) = match (config, secrets) {
            (Some(config), Some(secrets)) => (config, secrets),
            (config, secrets) => {
                debug!(
                    config_present = config.is_some(),
                    secrets_present = secrets.is_some(),
                    "Inputs not ready"
                );
                teardown(ctx).await?;
                return Ok(Action::await_change());
            }
        };

        let config_spec = config.typed::<BootstrapManifestsConfigSpec>()?;
        let secrets_spec = secrets.typed::<KubernetesRootSpec>()?;

        let desired = render_desired(self.renderer.as_ref(), config_spec, secrets_spec)?;
        let current = ctx
            .list(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest)
            .await?;

        let changes = plan_changes(&desired, &current);
        if changes.is_empty() {
            debug!(
                config_version = %config.version(),
                secrets_version = %secrets.version(),
                manifests = desired.len(),
                "Manifests up to date"
            );
            return Ok(Action::await_change());
        }

        debug!(changes = changes.len(), "Applying manifest changes");
        for change in changes {
            apply(ctx, change).await?;
        }

        Ok(Action::await_change())
    }
}

/// Apply one change
///
/// A destroy of an already missing manifest counts as done. A create that
/// finds the manifest already present, or an update that finds it gone,
/// means the listing was stale; both converge forward from what the store
/// holds now.
async fn apply(ctx: &ReconcileContext, change: ManifestChange) -> Result<(), Error> {
    match change {
        ManifestChange::Create { id, spec } => {
            match ctx.create(Resource::manifest(id.as_str(), spec.clone())).await {
                Ok(created) => {
                    info!(manifest = %id, version = %created.version(), "Created manifest");
                    Ok(())
                }
                Err(Error::AlreadyExists { .. }) => {
                    warn!(manifest = %id, "Manifest appeared since listing, updating instead");
                    let current = ctx
                        .get(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest, &id)
                        .await
                        .map_err(|e| raced(&id, e))?;
                    if current.typed::<ManifestSpec>().ok() == Some(&spec) {
                        return Ok(());
                    }
                    update(ctx, id.clone(), spec, current.version())
                        .await
                        .map_err(|e| raced(&id, e))
                }
                Err(e) => Err(e),
            }
        }
        ManifestChange::Update { id, spec, expected } => {
            match update(ctx, id.clone(), spec.clone(), expected).await {
                Err(e) if e.is_not_found() => {
                    warn!(manifest = %id, "Manifest vanished since listing, recreating");
                    let created = ctx
                        .create(Resource::manifest(id.as_str(), spec))
                        .await
                        .map_err(|e| raced(&id, e))?;
                    info!(manifest = %id, version = %created.version(), "Created manifest");
                    Ok(())
                }
                result => result,
            }
        }
        ManifestChange::Destroy { id, expected } => destroy(ctx, &id, expected).await,
    }
}

/// A follow-up write that lost a second race
///
/// The listing is stale twice over; the reconcile is retried from a fresh
/// read instead of being charged against the error budget.
fn raced(id: &str, error: Error) -> Error {
    if error.is_not_found() || matches!(error, Error::AlreadyExists { .. }) {
        Error::unavailable(format!("manifest {id} changed during reconcile: {error}"))
    } else {
        error
    }
}

async fn update(
    ctx: &ReconcileContext,
    id: String,
    spec: ManifestSpec,
    expected: Version,
) -> Result<(), Error> {
    let updated = ctx
        .update(Resource::manifest(id.as_str(), spec), expected)
        .await?;
    info!(manifest = %id, version = %updated.version(), "Updated manifest");
    Ok(())
}

async fn destroy(ctx: &ReconcileContext, id: &str, expected: Version) -> Result<(), Error> {
    match ctx
        .destroy(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest, id, expected)
        .await
    {
        Ok(()) => {
            info!(manifest = %id, "Destroyed manifest");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Destroy every owned manifest
async fn teardown(ctx: &ReconcileContext) -> Result<(), Error> {
    let current = ctx
        .list(CONTROL_PLANE_NAMESPACE, ResourceType::Manifest)
        .await?;
    if current.is_empty() {
        return Ok(());
    }

    info!(manifests = current.len(), "Inputs withdrawn, removing manifests");
    for resource in current {
        destroy(ctx, resource.id(), resource.version()).await?;
    }
    Ok(())
}

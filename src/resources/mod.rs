//! Typed resources held by the store
//!
//! A [`Resource`] is addressed by `(namespace, type, id)` and carries a
//! monotonically increasing [`Version`] plus a payload. The payload is the
//! [`Spec`] tagged union: the type tag decides the schema, so the store stays
//! generic while callers keep compile-time shape checking through
//! [`TypedSpec`].
//!
//! On the wire a resource serializes as
//! `{namespace, id, version, type: "<Type>", spec: {...}}`.

mod config;
mod manifest;
mod secrets;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

pub use config::BootstrapManifestsConfigSpec;
pub use manifest::ManifestSpec;
pub use secrets::{CertificateAndKey, KubernetesRootSpec};

/// Namespace holding rendered Manifest resources
pub const CONTROL_PLANE_NAMESPACE: &str = "controlplane";

/// Namespace holding the bootstrap manifests configuration
pub const CONFIG_NAMESPACE: &str = "config";

/// Namespace holding root credential material
pub const SECRETS_NAMESPACE: &str = "secrets";

/// Well-known id of the single BootstrapManifestsConfig resource
pub const BOOTSTRAP_MANIFESTS_CONFIG_ID: &str = "manifests";

/// Well-known id of the single KubernetesRoot secret resource
pub const KUBERNETES_ROOT_ID: &str = "k8s";

/// Per-object version counter
///
/// Resources are created at [`Version::INITIAL`] and every update bumps the
/// counter by one.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Version assigned on create
    pub const INITIAL: Version = Version(0);

    /// Wrap a raw version number
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    /// Raw version number
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The version following this one
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource type tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    /// Rendered bootstrap manifest
    Manifest,
    /// Desired-state input for the manifest controller
    BootstrapManifestsConfig,
    /// Root Kubernetes credential material
    KubernetesRoot,
}

impl ResourceType {
    /// Canonical name, identical to the serialized `type` field
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manifest => "Manifest",
            Self::BootstrapManifestsConfig => "BootstrapManifestsConfig",
            Self::KubernetesRoot => "KubernetesRoot",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Manifest" => Ok(Self::Manifest),
            "BootstrapManifestsConfig" => Ok(Self::BootstrapManifestsConfig),
            "KubernetesRoot" => Ok(Self::KubernetesRoot),
            _ => Err(Error::serialization(format!(
                "unknown resource type: {s}, expected one of: Manifest, BootstrapManifestsConfig, KubernetesRoot"
            ))),
        }
    }
}

/// Resource payload, tagged by type
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec")]
pub enum Spec {
    /// Rendered manifest body
    Manifest(ManifestSpec),
    /// Bootstrap manifests configuration
    BootstrapManifestsConfig(BootstrapManifestsConfigSpec),
    /// Root credential material
    KubernetesRoot(KubernetesRootSpec),
}

impl Spec {
    /// Type tag of this payload
    pub fn resource_type(&self) -> ResourceType {
        match self {
            Self::Manifest(_) => ResourceType::Manifest,
            Self::BootstrapManifestsConfig(_) => ResourceType::BootstrapManifestsConfig,
            Self::KubernetesRoot(_) => ResourceType::KubernetesRoot,
        }
    }
}

/// Payload types that can be stored as a [`Spec`] variant
pub trait TypedSpec: Clone + PartialEq + Sized {
    /// Type tag of this payload
    const TYPE: ResourceType;

    /// Wrap into the tagged union
    fn into_spec(self) -> Spec;

    /// Borrow out of the tagged union if the tag matches
    fn from_spec(spec: &Spec) -> Option<&Self>;
}

macro_rules! typed_spec {
    ($ty:ty, $variant:ident) => {
        impl TypedSpec for $ty {
            const TYPE: ResourceType = ResourceType::$variant;

            fn into_spec(self) -> Spec {
                Spec::$variant(self)
            }

            fn from_spec(spec: &Spec) -> Option<&Self> {
                match spec {
                    Spec::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

typed_spec!(ManifestSpec, Manifest);
typed_spec!(BootstrapManifestsConfigSpec, BootstrapManifestsConfig);
typed_spec!(KubernetesRootSpec, KubernetesRoot);

/// The store's unit of storage
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    namespace: String,
    id: String,
    #[serde(default)]
    version: Version,
    #[serde(flatten)]
    spec: Spec,
}

impl Resource {
    /// Create a resource at the initial version
    pub fn new(namespace: impl Into<String>, id: impl Into<String>, spec: impl TypedSpec) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
            version: Version::INITIAL,
            spec: spec.into_spec(),
        }
    }

    /// The well-known BootstrapManifestsConfig resource
    pub fn bootstrap_manifests_config(spec: BootstrapManifestsConfigSpec) -> Self {
        Self::new(CONFIG_NAMESPACE, BOOTSTRAP_MANIFESTS_CONFIG_ID, spec)
    }

    /// The well-known KubernetesRoot secret resource
    pub fn kubernetes_root(spec: KubernetesRootSpec) -> Self {
        Self::new(SECRETS_NAMESPACE, KUBERNETES_ROOT_ID, spec)
    }

    /// A Manifest resource in the control-plane namespace
    pub fn manifest(id: impl Into<String>, spec: ManifestSpec) -> Self {
        Self::new(CONTROL_PLANE_NAMESPACE, id, spec)
    }

    /// Namespace of this resource
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Id of this resource
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Type tag of this resource
    pub fn resource_type(&self) -> ResourceType {
        self.spec.resource_type()
    }

    /// Version this snapshot was read at
    pub fn version(&self) -> Version {
        self.version
    }

    /// Untyped payload
    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    /// Replace the payload, keeping identity and version
    ///
    /// Fails with [`Error::TypeMismatch`] if the new payload would change the
    /// resource's type.
    pub fn set_spec(&mut self, spec: impl TypedSpec) -> Result<(), Error> {
        let spec = spec.into_spec();
        if spec.resource_type() != self.resource_type() {
            return Err(Error::TypeMismatch {
                namespace: self.namespace.clone(),
                id: self.id.clone(),
                expected: self.resource_type(),
                actual: spec.resource_type(),
            });
        }
        self.spec = spec;
        Ok(())
    }

    /// Typed view of the payload
    pub fn typed<T: TypedSpec>(&self) -> Result<&T, Error> {
        T::from_spec(&self.spec).ok_or_else(|| Error::TypeMismatch {
            namespace: self.namespace.clone(),
            id: self.id.clone(),
            expected: T::TYPE,
            actual: self.resource_type(),
        })
    }

    pub(crate) fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }
}

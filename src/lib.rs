//! Bootstrap manifests - convergence controller for cluster bootstrap manifests
//!
//! A small reconciliation engine: typed resources live in a versioned,
//! namespaced in-memory store; controllers declare the resources they watch
//! and the resource types they own; a runtime drives each controller's
//! reconcile loop whenever one of its inputs changes.
//!
//! The one concrete controller renders the set of Kubernetes manifests a
//! freshly bootstrapped control plane needs (kube-proxy, CoreDNS, flannel,
//! CSR approval bindings, ...) from a configuration resource and a root
//! credential secret, and keeps the Manifest resources in the store equal to
//! that desired set.
//!
//! # Modules
//!
//! - [`resources`] - Resource model (Resource, Version, typed specs)
//! - [`store`] - Versioned resource store with watches
//! - [`runtime`] - Controller trait and the runtime that drives it
//! - [`bootstrap`] - Manifest slot catalogue and templates
//! - [`controller`] - Manifest controller reconciliation logic
//! - [`retry`] - Backoff and polling helpers
//! - [`config`] - Runtime configuration
//! - [`telemetry`] - Tracing subscriber setup
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod controller;
pub mod error;
pub mod resources;
pub mod retry;
pub mod runtime;
pub mod store;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

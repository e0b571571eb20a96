//! Controllers registered with the runtime
//!
//! Each controller follows the observe-diff-act pattern: read inputs through
//! the [`ReconcileContext`](crate::runtime::ReconcileContext), compute the
//! desired outputs, then write only the difference.

mod manifest;

pub use manifest::{plan_changes, ManifestChange, ManifestController, CONTROLLER_NAME};

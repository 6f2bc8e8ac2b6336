//! Common types for rolesync: CRDs, errors, naming and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod naming;
pub mod telemetry;

pub use error::Error;
pub use naming::{domain_to_namespace, namespace_to_domain, namespace_to_domain_key, split_key};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write to the API server
pub const FIELD_MANAGER: &str = "rolesync";

/// Label identifying objects created by rolesync
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on rolesync objects
pub const LABEL_MANAGED_BY_ROLESYNC: &str = "rolesync";

/// Service label that opts a workload into authorization enforcement
pub const ENABLED_SERVICE_LABEL: &str = "authz.rolesync.dev/enabled";

/// Default cluster DNS suffix used when building service hostnames
pub const DEFAULT_DNS_SUFFIX: &str = "cluster.local";

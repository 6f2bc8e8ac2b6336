//! Istio `rbac.istio.io/v1alpha1` authorization kinds
//!
//! Only the fields rolesync writes are modelled. Each spec exposes a
//! `canonical()` form where lists whose order carries no meaning are
//! sorted and de-duplicated, so two specs granting the same access compare
//! equal regardless of how the API server or a human ordered them.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::canonical_set;

/// Name of the singleton ClusterRbacConfig
pub const CLUSTER_RBAC_CONFIG_NAME: &str = "default";

/// ServiceRole grants a set of access rules within a namespace
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rbac.istio.io",
    version = "v1alpha1",
    kind = "ServiceRole",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRoleSpec {
    /// Access rules granted by the role
    #[serde(default)]
    pub rules: Vec<AccessRule>,
}

impl ServiceRoleSpec {
    /// Order-insensitive form of this spec
    pub fn canonical(&self) -> Self {
        let rules: Vec<AccessRule> = self.rules.iter().map(AccessRule::canonical).collect();
        Self {
            rules: canonical_set(&rules),
        }
    }
}

/// A single allowed (services, methods, paths) combination
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "camelCase")]
pub struct AccessRule {
    /// Fully qualified service hostnames
    #[serde(default)]
    pub services: Vec<String>,
    /// HTTP methods, `*` for any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub methods: Vec<String>,
    /// HTTP paths, `*` for any
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

impl AccessRule {
    /// Order-insensitive form of this rule
    pub fn canonical(&self) -> Self {
        Self {
            services: canonical_set(&self.services),
            methods: canonical_set(&self.methods),
            paths: canonical_set(&self.paths),
        }
    }
}

/// ServiceRoleBinding assigns a ServiceRole to subjects
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rbac.istio.io",
    version = "v1alpha1",
    kind = "ServiceRoleBinding",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRoleBindingSpec {
    /// Subjects granted the role
    #[serde(default)]
    pub subjects: Vec<Subject>,
    /// The role being granted
    pub role_ref: RoleRef,
}

impl ServiceRoleBindingSpec {
    /// Order-insensitive form of this spec
    pub fn canonical(&self) -> Self {
        Self {
            subjects: canonical_set(&self.subjects),
            role_ref: self.role_ref.clone(),
        }
    }
}

/// A principal a binding applies to
#[derive(
    Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    /// User principal (`<prefix>/sa/<name>` or `*`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Group principal
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

impl Subject {
    /// Subject for a single user principal
    pub fn user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            group: None,
        }
    }
}

/// Reference from a binding to its role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    /// Always `ServiceRole`
    pub kind: String,
    /// Name of the ServiceRole in the same namespace
    pub name: String,
}

impl RoleRef {
    /// Reference to the ServiceRole named `name`
    pub fn service_role(name: impl Into<String>) -> Self {
        Self {
            kind: "ServiceRole".to_string(),
            name: name.into(),
        }
    }
}

/// ClusterRbacConfig toggles mesh-wide enforcement
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rbac.istio.io",
    version = "v1alpha1",
    kind = "ClusterRbacConfig"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRbacConfigSpec {
    /// Enforcement mode
    #[serde(default)]
    pub mode: RbacMode,
    /// Targets enforced under `ON_WITH_INCLUSION`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inclusion: Option<RbacTarget>,
    /// Targets exempted under `ON_WITH_EXCLUSION`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclusion: Option<RbacTarget>,
}

impl ClusterRbacConfigSpec {
    /// Order-insensitive form of this spec
    pub fn canonical(&self) -> Self {
        Self {
            mode: self.mode,
            inclusion: self.inclusion.as_ref().map(RbacTarget::canonical),
            exclusion: self.exclusion.as_ref().map(RbacTarget::canonical),
        }
    }
}

/// Enforcement mode of a ClusterRbacConfig
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RbacMode {
    /// No enforcement
    #[default]
    Off,
    /// Enforce everywhere
    On,
    /// Enforce only on the inclusion targets
    OnWithInclusion,
    /// Enforce everywhere except the exclusion targets
    OnWithExclusion,
}

/// Services and namespaces targeted by a ClusterRbacConfig
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RbacTarget {
    /// Fully qualified service hostnames
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<String>,
    /// Namespaces
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
}

impl RbacTarget {
    /// Order-insensitive form of this target
    pub fn canonical(&self) -> Self {
        Self {
            services: canonical_set(&self.services),
            namespaces: canonical_set(&self.namespaces),
        }
    }
}

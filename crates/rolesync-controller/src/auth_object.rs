//! Kind-agnostic view of the authorization objects rolesync manages
//!
//! The differ and the config store work on [`AuthObject`], which pairs a
//! small metadata block with a typed payload. Conversion to and from the
//! typed kube resources happens at the config store boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use rolesync_common::crd::{
    ClusterRbacConfig, ClusterRbacConfigSpec, ServiceRole, ServiceRoleBinding,
    ServiceRoleBindingSpec, ServiceRoleSpec, CLUSTER_RBAC_CONFIG_NAME,
};
use rolesync_common::{Error, LABEL_MANAGED_BY, LABEL_MANAGED_BY_ROLESYNC};

/// Kind of an authorization object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuthKind {
    /// `rbac.istio.io/v1alpha1` ServiceRole
    ServiceRole,
    /// `rbac.istio.io/v1alpha1` ServiceRoleBinding
    ServiceRoleBinding,
    /// `rbac.istio.io/v1alpha1` ClusterRbacConfig
    ClusterRbacConfig,
}

impl AuthKind {
    /// Kubernetes kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthKind::ServiceRole => "ServiceRole",
            AuthKind::ServiceRoleBinding => "ServiceRoleBinding",
            AuthKind::ClusterRbacConfig => "ClusterRbacConfig",
        }
    }
}

impl fmt::Display for AuthKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata carried by an [`AuthObject`]
///
/// `resource_version` is opaque; it is sent back on update and delete so
/// the API server rejects writes based on a stale read.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AuthMeta {
    /// Object name
    pub name: String,
    /// Namespace, `None` for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Optimistic concurrency token from the API server
    pub resource_version: Option<String>,
    /// Labels
    pub labels: BTreeMap<String, String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
}

impl AuthMeta {
    /// Metadata for a new object owned by rolesync
    pub fn managed(name: impl Into<String>, namespace: Option<String>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_ROLESYNC.to_string(),
        );
        Self {
            name: name.into(),
            namespace,
            resource_version: None,
            labels,
            annotations: BTreeMap::new(),
        }
    }

    /// Read metadata from a kube object
    pub fn from_object_meta(meta: &ObjectMeta) -> Self {
        Self {
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
            resource_version: meta.resource_version.clone(),
            labels: meta.labels.clone().unwrap_or_default(),
            annotations: meta.annotations.clone().unwrap_or_default(),
        }
    }

    /// Build kube object metadata for a write
    pub fn to_object_meta(&self) -> ObjectMeta {
        ObjectMeta {
            name: Some(self.name.clone()),
            namespace: self.namespace.clone(),
            resource_version: self.resource_version.clone(),
            labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
            annotations: (!self.annotations.is_empty())
                .then(|| self.annotations.clone()),
            ..Default::default()
        }
    }
}

/// Typed payload of an [`AuthObject`]
#[derive(Clone, Debug, PartialEq)]
pub enum AuthSpec {
    /// ServiceRole rules
    ServiceRole(ServiceRoleSpec),
    /// ServiceRoleBinding subjects and role reference
    ServiceRoleBinding(ServiceRoleBindingSpec),
    /// ClusterRbacConfig mode and targets
    ClusterRbacConfig(ClusterRbacConfigSpec),
}

impl AuthSpec {
    /// Kind of this payload
    pub fn kind(&self) -> AuthKind {
        match self {
            AuthSpec::ServiceRole(_) => AuthKind::ServiceRole,
            AuthSpec::ServiceRoleBinding(_) => AuthKind::ServiceRoleBinding,
            AuthSpec::ClusterRbacConfig(_) => AuthKind::ClusterRbacConfig,
        }
    }

    /// Order-insensitive form of this payload
    pub fn canonical(&self) -> Self {
        match self {
            AuthSpec::ServiceRole(s) => AuthSpec::ServiceRole(s.canonical()),
            AuthSpec::ServiceRoleBinding(s) => AuthSpec::ServiceRoleBinding(s.canonical()),
            AuthSpec::ClusterRbacConfig(s) => AuthSpec::ClusterRbacConfig(s.canonical()),
        }
    }
}

/// One authorization object, identified by `(kind, namespace, name)`
#[derive(Clone, Debug, PartialEq)]
pub struct AuthObject {
    /// Metadata
    pub meta: AuthMeta,
    /// Payload
    pub spec: AuthSpec,
}

impl AuthObject {
    /// A managed ServiceRole
    pub fn service_role(
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: ServiceRoleSpec,
    ) -> Self {
        Self {
            meta: AuthMeta::managed(name, Some(namespace.into())),
            spec: AuthSpec::ServiceRole(spec),
        }
    }

    /// A managed ServiceRoleBinding
    pub fn service_role_binding(
        namespace: impl Into<String>,
        name: impl Into<String>,
        spec: ServiceRoleBindingSpec,
    ) -> Self {
        Self {
            meta: AuthMeta::managed(name, Some(namespace.into())),
            spec: AuthSpec::ServiceRoleBinding(spec),
        }
    }

    /// The managed singleton ClusterRbacConfig
    pub fn cluster_rbac_config(spec: ClusterRbacConfigSpec) -> Self {
        Self {
            meta: AuthMeta::managed(CLUSTER_RBAC_CONFIG_NAME, None),
            spec: AuthSpec::ClusterRbacConfig(spec),
        }
    }

    /// Kind of this object
    pub fn kind(&self) -> AuthKind {
        self.spec.kind()
    }

    /// Identity key: `Kind/namespace/name`, or `Kind/name` if cluster-scoped
    pub fn key(&self) -> String {
        match &self.meta.namespace {
            Some(ns) => format!("{}/{}/{}", self.kind(), ns, self.meta.name),
            None => format!("{}/{}", self.kind(), self.meta.name),
        }
    }

    /// `namespace/name` (or `name`), used in logs and errors
    pub fn namespaced_name(&self) -> String {
        match &self.meta.namespace {
            Some(ns) => format!("{}/{}", ns, self.meta.name),
            None => self.meta.name.clone(),
        }
    }

    /// Whether two objects carry the same payload, ignoring metadata and
    /// the order of unordered lists
    pub fn payload_eq(&self, other: &AuthObject) -> bool {
        self.spec.canonical() == other.spec.canonical()
    }
}

impl From<&ServiceRole> for AuthObject {
    fn from(role: &ServiceRole) -> Self {
        Self {
            meta: AuthMeta::from_object_meta(&role.metadata),
            spec: AuthSpec::ServiceRole(role.spec.clone()),
        }
    }
}

impl From<&ServiceRoleBinding> for AuthObject {
    fn from(binding: &ServiceRoleBinding) -> Self {
        Self {
            meta: AuthMeta::from_object_meta(&binding.metadata),
            spec: AuthSpec::ServiceRoleBinding(binding.spec.clone()),
        }
    }
}

impl From<&ClusterRbacConfig> for AuthObject {
    fn from(config: &ClusterRbacConfig) -> Self {
        Self {
            meta: AuthMeta::from_object_meta(&config.metadata),
            spec: AuthSpec::ClusterRbacConfig(config.spec.clone()),
        }
    }
}

/// Change operation on an authorization object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create the object
    Add,
    /// Replace the object's payload
    Update,
    /// Remove the object
    Delete,
}

impl Operation {
    /// Lowercase name used in logs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Add => "add",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback invoked when applying a [`ChangeItem`] fails
pub type ErrorHandler = Arc<dyn Fn(&Error, &ChangeItem) + Send + Sync>;

/// An operation to perform on one authorization object
#[derive(Clone)]
pub struct ChangeItem {
    /// What to do
    pub operation: Operation,
    /// Object to write; for updates it carries the current resourceVersion
    pub object: AuthObject,
    /// Called with the apply error if the operation fails
    pub error_handler: ErrorHandler,
}

impl ChangeItem {
    /// Report a failed apply of this item to its error handler
    pub fn fail(&self, err: &Error) {
        (self.error_handler)(err, self)
    }
}

impl fmt::Debug for ChangeItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeItem")
            .field("operation", &self.operation)
            .field("object", &self.object)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rolesync_common::crd::{AccessRule, RoleRef, Subject};

    #[test]
    fn keys_include_kind_and_scope() {
        let role = AuthObject::service_role("payments", "admin", ServiceRoleSpec::default());
        assert_eq!(role.key(), "ServiceRole/payments/admin");
        assert_eq!(role.namespaced_name(), "payments/admin");

        let crc = AuthObject::cluster_rbac_config(ClusterRbacConfigSpec::default());
        assert_eq!(crc.key(), "ClusterRbacConfig/default");
    }

    #[test]
    fn role_and_binding_with_same_name_are_distinct() {
        let role = AuthObject::service_role("payments", "admin", ServiceRoleSpec::default());
        let binding = AuthObject::service_role_binding(
            "payments",
            "admin",
            ServiceRoleBindingSpec {
                subjects: vec![],
                role_ref: RoleRef::service_role("admin"),
            },
        );
        assert_ne!(role.key(), binding.key());
    }

    #[test]
    fn payload_eq_ignores_metadata_and_order() {
        let spec = |services: Vec<&str>| ServiceRoleSpec {
            rules: vec![AccessRule {
                services: services.into_iter().map(String::from).collect(),
                methods: vec!["GET".into()],
                paths: vec!["*".into()],
            }],
        };
        let a = AuthObject::service_role("ns", "reader", spec(vec!["a", "b"]));
        let mut b = AuthObject::service_role("ns", "reader", spec(vec!["b", "a"]));
        b.meta.resource_version = Some("42".into());
        b.meta.labels.clear();
        assert!(a.payload_eq(&b));

        let c = AuthObject::service_role("ns", "reader", spec(vec!["a"]));
        assert!(!a.payload_eq(&c));
    }

    #[test]
    fn managed_objects_are_labelled() {
        let obj = AuthObject::service_role("ns", "reader", ServiceRoleSpec::default());
        let meta = obj.meta.to_object_meta();
        let labels = meta.labels.unwrap();
        assert_eq!(
            labels.get(LABEL_MANAGED_BY).map(String::as_str),
            Some(LABEL_MANAGED_BY_ROLESYNC)
        );
        assert!(meta.annotations.is_none());
        assert!(meta.resource_version.is_none());
    }

    #[test]
    fn converts_from_kube_resource() {
        let mut binding = ServiceRoleBinding::new(
            "admin",
            ServiceRoleBindingSpec {
                subjects: vec![Subject::user("user/sa/alice")],
                role_ref: RoleRef::service_role("admin"),
            },
        );
        binding.metadata.namespace = Some("payments".into());
        binding.metadata.resource_version = Some("7".into());

        let obj = AuthObject::from(&binding);
        assert_eq!(obj.kind(), AuthKind::ServiceRoleBinding);
        assert_eq!(obj.key(), "ServiceRoleBinding/payments/admin");
        assert_eq!(obj.meta.resource_version.as_deref(), Some("7"));
    }
}

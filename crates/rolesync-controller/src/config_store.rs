//! Cluster-side authorization state: cached reads and conditional writes
//!
//! [`ConfigStore`] answers "what exists now" from watch caches, and
//! [`ChangeApplier`] performs one change against the API server. Both are
//! traits so the synchronizer can be tested without a cluster.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, PostParams, Preconditions};
use kube::runtime::watcher;
use kube::{Client, Resource};
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use rolesync_common::crd::{ClusterRbacConfig, ServiceRole, ServiceRoleBinding};
use rolesync_common::kube_utils::WATCH_TIMEOUT_SECS;
use rolesync_common::metrics::{CHANGES_APPLIED, RESULT_ERROR, RESULT_SUCCESS};
use rolesync_common::{Error, Result, FIELD_MANAGER};
use rolesync_runtime::{HasSynced, ResourceEventHandler, WatchCache};

use crate::auth_object::{AuthKind, AuthObject, AuthSpec, ChangeItem, Operation};

/// Callback for cluster-side changes to authorization objects
pub type ConfigEventHandler = Arc<dyn Fn(&AuthObject, Operation) + Send + Sync>;

/// Read access to the cluster's current authorization objects
#[cfg_attr(test, automock)]
pub trait ConfigStore: Send + Sync {
    /// ServiceRoles and ServiceRoleBindings in `namespace`
    fn list_current(&self, namespace: &str) -> Vec<AuthObject>;

    /// Every object of `kind`
    fn list_kind(&self, kind: AuthKind) -> Vec<AuthObject>;

    /// Subscribe to changes of `kind`
    fn register_event_handler(&self, kind: AuthKind, handler: ConfigEventHandler);

    /// Whether every backing cache has completed its initial list
    fn has_synced(&self) -> bool;
}

/// Performs one change against the cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChangeApplier: Send + Sync {
    /// Create, update or delete `item.object`
    ///
    /// Updates and deletes are conditional on the object's resourceVersion.
    async fn apply(&self, item: &ChangeItem) -> Result<()>;
}

struct ConfigForwarder {
    handler: ConfigEventHandler,
}

impl<K> ResourceEventHandler<K> for ConfigForwarder
where
    for<'a> AuthObject: From<&'a K>,
{
    fn on_add(&self, obj: &K) {
        (self.handler)(&AuthObject::from(obj), Operation::Add);
    }

    fn on_update(&self, _old: &K, new: &K) {
        (self.handler)(&AuthObject::from(new), Operation::Update);
    }

    fn on_delete(&self, obj: &K) {
        (self.handler)(&AuthObject::from(obj), Operation::Delete);
    }
}

/// [`ConfigStore`] backed by watch caches of the three managed kinds
pub struct KubeConfigStore {
    service_roles: WatchCache<ServiceRole>,
    service_role_bindings: WatchCache<ServiceRoleBinding>,
    cluster_rbac_configs: WatchCache<ClusterRbacConfig>,
}

impl Default for KubeConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KubeConfigStore {
    /// Create a store with empty, unsynced caches
    pub fn new() -> Self {
        Self {
            service_roles: WatchCache::new("service-roles"),
            service_role_bindings: WatchCache::new("service-role-bindings"),
            cluster_rbac_configs: WatchCache::new("cluster-rbac-configs"),
        }
    }

    /// Sync handles of the backing caches
    pub fn caches(&self) -> [&dyn HasSynced; 3] {
        [
            &self.service_roles,
            &self.service_role_bindings,
            &self.cluster_rbac_configs,
        ]
    }

    /// Watch all three kinds cluster-wide until `cancel` fires
    pub async fn run(&self, client: Client, cancel: CancellationToken) {
        let config = || watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);
        tokio::join!(
            self.service_roles
                .run(Api::all(client.clone()), config(), cancel.clone()),
            self.service_role_bindings
                .run(Api::all(client.clone()), config(), cancel.clone()),
            self.cluster_rbac_configs
                .run(Api::all(client), config(), cancel),
        );
    }
}

fn sorted(mut objects: Vec<AuthObject>) -> Vec<AuthObject> {
    objects.sort_by_key(AuthObject::key);
    objects
}

impl ConfigStore for KubeConfigStore {
    fn list_current(&self, namespace: &str) -> Vec<AuthObject> {
        let in_namespace = |ns: &Option<String>| ns.as_deref() == Some(namespace);
        let roles = self
            .service_roles
            .list()
            .into_iter()
            .filter(|r| in_namespace(&r.metadata.namespace))
            .map(|r| AuthObject::from(r.as_ref()));
        let bindings = self
            .service_role_bindings
            .list()
            .into_iter()
            .filter(|b| in_namespace(&b.metadata.namespace))
            .map(|b| AuthObject::from(b.as_ref()));
        sorted(roles.chain(bindings).collect())
    }

    fn list_kind(&self, kind: AuthKind) -> Vec<AuthObject> {
        let objects = match kind {
            AuthKind::ServiceRole => self
                .service_roles
                .list()
                .iter()
                .map(|o| AuthObject::from(o.as_ref()))
                .collect(),
            AuthKind::ServiceRoleBinding => self
                .service_role_bindings
                .list()
                .iter()
                .map(|o| AuthObject::from(o.as_ref()))
                .collect(),
            AuthKind::ClusterRbacConfig => self
                .cluster_rbac_configs
                .list()
                .iter()
                .map(|o| AuthObject::from(o.as_ref()))
                .collect(),
        };
        sorted(objects)
    }

    fn register_event_handler(&self, kind: AuthKind, handler: ConfigEventHandler) {
        let forwarder = Arc::new(ConfigForwarder { handler });
        match kind {
            AuthKind::ServiceRole => self.service_roles.add_event_handler(forwarder),
            AuthKind::ServiceRoleBinding => self.service_role_bindings.add_event_handler(forwarder),
            AuthKind::ClusterRbacConfig => self.cluster_rbac_configs.add_event_handler(forwarder),
        }
    }

    fn has_synced(&self) -> bool {
        self.caches().iter().all(|c| c.has_synced())
    }
}

/// [`ChangeApplier`] writing through the Kubernetes API
pub struct KubeChangeApplier {
    client: Client,
}

impl KubeChangeApplier {
    /// Create an applier using `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced_api<K>(&self, obj: &AuthObject) -> Result<Api<K>>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        let namespace = obj.meta.namespace.as_deref().ok_or_else(|| {
            Error::apply(
                obj.kind().as_str(),
                obj.namespaced_name(),
                "object has no namespace",
            )
        })?;
        Ok(Api::namespaced(self.client.clone(), namespace))
    }

    async fn write<K>(
        &self,
        api: Api<K>,
        operation: Operation,
        resource: K,
    ) -> std::result::Result<(), kube::Error>
    where
        K: Resource + Clone + Serialize + DeserializeOwned + Debug,
    {
        let name = resource.meta().name.clone().unwrap_or_default();
        let post_params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };

        match operation {
            Operation::Add => {
                api.create(&post_params, &resource).await?;
            }
            Operation::Update => {
                api.replace(&name, &post_params, &resource).await?;
            }
            Operation::Delete => {
                let params = DeleteParams {
                    preconditions: Some(Preconditions {
                        resource_version: resource.meta().resource_version.clone(),
                        uid: None,
                    }),
                    ..Default::default()
                };
                match api.delete(&name, &params).await {
                    Ok(_) => {}
                    Err(kube::Error::Api(e)) if e.code == 404 => {
                        debug!(name = %name, "Object already deleted");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}

/// Map a failed write to an [`Error::Apply`], flagging version conflicts
fn apply_error(obj: &AuthObject, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(e) if e.code == 409 => {
            Error::apply_conflict(obj.kind().as_str(), obj.namespaced_name(), e.message)
        }
        e => Error::apply(obj.kind().as_str(), obj.namespaced_name(), e.to_string()),
    }
}

#[async_trait]
impl ChangeApplier for KubeChangeApplier {
    async fn apply(&self, item: &ChangeItem) -> Result<()> {
        let obj = &item.object;
        let metadata = obj.meta.to_object_meta();

        let result = match &obj.spec {
            AuthSpec::ServiceRole(spec) => {
                let api = self.namespaced_api::<ServiceRole>(obj)?;
                let resource = ServiceRole {
                    metadata,
                    spec: spec.clone(),
                };
                self.write(api, item.operation, resource).await
            }
            AuthSpec::ServiceRoleBinding(spec) => {
                let api = self.namespaced_api::<ServiceRoleBinding>(obj)?;
                let resource = ServiceRoleBinding {
                    metadata,
                    spec: spec.clone(),
                };
                self.write(api, item.operation, resource).await
            }
            AuthSpec::ClusterRbacConfig(spec) => {
                let api: Api<ClusterRbacConfig> = Api::all(self.client.clone());
                let resource = ClusterRbacConfig {
                    metadata,
                    spec: spec.clone(),
                };
                self.write(api, item.operation, resource).await
            }
        };

        let outcome = if result.is_ok() {
            RESULT_SUCCESS
        } else {
            RESULT_ERROR
        };
        CHANGES_APPLIED.add(
            1,
            &[
                KeyValue::new("operation", item.operation.as_str()),
                KeyValue::new("kind", obj.kind().as_str()),
                KeyValue::new("result", outcome),
            ],
        );

        result.map_err(|e| apply_error(obj, e))?;
        info!(
            operation = %item.operation,
            kind = %obj.kind(),
            name = %obj.namespaced_name(),
            "Applied change"
        );
        Ok(())
    }
}

/// Outcome of applying a change list
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Changes applied successfully
    pub applied: usize,
    /// Changes that failed and were reported to their error handler
    pub failed: usize,
}

impl SyncReport {
    /// Whether nothing needed to change
    pub fn is_noop(&self) -> bool {
        self.applied == 0 && self.failed == 0
    }
}

/// Apply `changes` in order, reporting each failure to the item's handler
///
/// A failed item does not stop the ones after it.
pub async fn apply_changes(applier: &dyn ChangeApplier, changes: &[ChangeItem]) -> SyncReport {
    let mut report = SyncReport::default();
    for item in changes {
        match applier.apply(item).await {
            Ok(()) => report.applied += 1,
            Err(e) => {
                report.failed += 1;
                item.fail(&e);
            }
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::runtime::watcher::Event;
    use parking_lot::Mutex;
    use rolesync_common::crd::{
        ClusterRbacConfigSpec, RoleRef, ServiceRoleBindingSpec, ServiceRoleSpec, Subject,
    };

    fn role(ns: &str, name: &str) -> ServiceRole {
        let mut role = ServiceRole::new(name, ServiceRoleSpec::default());
        role.metadata.namespace = Some(ns.to_string());
        role.metadata.resource_version = Some("1".to_string());
        role
    }

    fn binding(ns: &str, name: &str) -> ServiceRoleBinding {
        let mut binding = ServiceRoleBinding::new(
            name,
            ServiceRoleBindingSpec {
                subjects: vec![Subject::user("*")],
                role_ref: RoleRef::service_role(name),
            },
        );
        binding.metadata.namespace = Some(ns.to_string());
        binding
    }

    fn synced_store() -> KubeConfigStore {
        let store = KubeConfigStore::new();
        store.service_roles.apply(Event::Init);
        store
            .service_roles
            .apply(Event::InitApply(role("payments", "admin")));
        store
            .service_roles
            .apply(Event::InitApply(role("media", "reader")));
        store.service_roles.apply(Event::InitDone);
        store.service_role_bindings.apply(Event::Init);
        store
            .service_role_bindings
            .apply(Event::InitApply(binding("payments", "admin")));
        store.service_role_bindings.apply(Event::InitDone);
        store
    }

    #[test]
    fn has_synced_requires_every_cache() {
        let store = synced_store();
        assert!(!store.has_synced());
        store.cluster_rbac_configs.apply(Event::Init);
        store.cluster_rbac_configs.apply(Event::InitDone);
        assert!(store.has_synced());
    }

    #[test]
    fn list_current_is_scoped_to_namespace() {
        let store = synced_store();
        let keys: Vec<String> = store
            .list_current("payments")
            .iter()
            .map(AuthObject::key)
            .collect();
        assert_eq!(
            keys,
            vec![
                "ServiceRole/payments/admin",
                "ServiceRoleBinding/payments/admin"
            ]
        );
        let current = store.list_current("payments");
        assert_eq!(current[0].meta.resource_version.as_deref(), Some("1"));
        assert!(store.list_current("unknown").is_empty());
    }

    #[test]
    fn list_kind_spans_namespaces() {
        let store = synced_store();
        assert_eq!(store.list_kind(AuthKind::ServiceRole).len(), 2);
        assert_eq!(store.list_kind(AuthKind::ServiceRoleBinding).len(), 1);
        assert!(store.list_kind(AuthKind::ClusterRbacConfig).is_empty());
    }

    #[test]
    fn registered_handlers_receive_typed_changes() {
        let store = KubeConfigStore::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        store.register_event_handler(
            AuthKind::ClusterRbacConfig,
            Arc::new(move |obj: &AuthObject, op: Operation| {
                sink.lock().push((op, obj.key()));
            }),
        );

        let crc = ClusterRbacConfig::new("default", ClusterRbacConfigSpec::default());
        store.cluster_rbac_configs.apply(Event::Apply(crc.clone()));
        store.cluster_rbac_configs.apply(Event::Delete(crc));
        // Other kinds are not forwarded to this handler
        store
            .service_roles
            .apply(Event::Apply(role("payments", "admin")));

        assert_eq!(
            *seen.lock(),
            vec![
                (Operation::Add, "ClusterRbacConfig/default".to_string()),
                (Operation::Delete, "ClusterRbacConfig/default".to_string()),
            ]
        );
    }

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code,
        })
    }

    #[test]
    fn conflicts_map_to_retryable_apply_errors() {
        let obj = AuthObject::from(&role("payments", "admin"));
        let err = apply_error(&obj, api_error(409));
        assert!(matches!(err, Error::Apply { conflict: true, .. }));
        assert!(err.is_retryable());

        let err = apply_error(&obj, api_error(500));
        assert!(matches!(err, Error::Apply { conflict: false, .. }));
        assert!(err.to_string().contains("ServiceRole payments/admin"));
    }
}

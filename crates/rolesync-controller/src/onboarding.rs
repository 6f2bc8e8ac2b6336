//! Cluster-wide enforcement toggle driven by service labels
//!
//! Services labelled `authz.rolesync.dev/enabled=true` are listed in the
//! inclusion targets of the singleton `ClusterRbacConfig`. When no service
//! opts in, the config is removed.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rolesync_common::crd::{
    ClusterRbacConfigSpec, RbacMode, RbacTarget, CLUSTER_RBAC_CONFIG_NAME,
};
use rolesync_common::{Error, ENABLED_SERVICE_LABEL};
use rolesync_runtime::{EventHandlerFns, ResourceEventHandler, WatchCache};

use crate::auth_object::{AuthKind, AuthObject, ChangeItem, ErrorHandler, Operation};
use crate::config_store::{
    apply_changes, ChangeApplier, ConfigEventHandler, ConfigStore, SyncReport,
};
use crate::convert::service_host;
use crate::differ::diff;

/// Default interval between full onboarding syncs
pub const DEFAULT_CRC_RESYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Maintains the `ClusterRbacConfig` inclusion list
pub struct OnboardingController {
    services: Arc<WatchCache<Service>>,
    config_store: Arc<dyn ConfigStore>,
    applier: Arc<dyn ChangeApplier>,
    dns_suffix: String,
    resync_interval: Duration,
    trigger: Arc<Notify>,
}

fn is_enabled(service: &Service) -> bool {
    service
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(ENABLED_SERVICE_LABEL))
        .is_some_and(|v| v == "true")
}

impl OnboardingController {
    /// Create a controller over `services`
    pub fn new(
        services: Arc<WatchCache<Service>>,
        config_store: Arc<dyn ConfigStore>,
        applier: Arc<dyn ChangeApplier>,
        dns_suffix: impl Into<String>,
        resync_interval: Duration,
    ) -> Self {
        Self {
            services,
            config_store,
            applier,
            dns_suffix: dns_suffix.into(),
            resync_interval,
            trigger: Arc::new(Notify::new()),
        }
    }

    /// Request a sync; repeated requests before the sync runs coalesce
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Handler for Service changes
    pub fn service_event_handler(&self) -> Arc<dyn ResourceEventHandler<Service>> {
        let add = self.trigger.clone();
        let update = self.trigger.clone();
        let delete = self.trigger.clone();
        Arc::new(EventHandlerFns {
            add: Some(Box::new(move |_: &Service| add.notify_one())),
            update: Some(Box::new(move |old: &Service, new: &Service| {
                if is_enabled(old) != is_enabled(new) {
                    update.notify_one();
                }
            })),
            delete: Some(Box::new(move |_: &Service| delete.notify_one())),
        })
    }

    /// Handler for ClusterRbacConfig changes
    pub fn config_event_handler(&self) -> ConfigEventHandler {
        let trigger = self.trigger.clone();
        Arc::new(move |obj: &AuthObject, op: Operation| {
            debug!(name = %obj.meta.name, operation = %op, "ClusterRbacConfig changed");
            trigger.notify_one();
        })
    }

    /// The ClusterRbacConfig the cluster should have, if any
    pub fn desired_state(&self) -> Vec<AuthObject> {
        let mut hosts: Vec<String> = self
            .services
            .list()
            .iter()
            .filter(|svc| is_enabled(svc))
            .filter_map(|svc| {
                let name = svc.metadata.name.as_deref()?;
                let namespace = svc.metadata.namespace.as_deref()?;
                Some(service_host(name, namespace, &self.dns_suffix))
            })
            .collect();
        if hosts.is_empty() {
            return Vec::new();
        }
        hosts.sort();
        hosts.dedup();

        vec![AuthObject::cluster_rbac_config(ClusterRbacConfigSpec {
            mode: RbacMode::OnWithInclusion,
            inclusion: Some(RbacTarget {
                services: hosts,
                namespaces: Vec::new(),
            }),
            exclusion: None,
        })]
    }

    /// Converge the ClusterRbacConfig once
    ///
    /// Failures are logged; the next trigger or interval retries them.
    pub async fn sync(&self) -> SyncReport {
        let current: Vec<AuthObject> = self
            .config_store
            .list_kind(AuthKind::ClusterRbacConfig)
            .into_iter()
            .filter(|obj| obj.meta.name == CLUSTER_RBAC_CONFIG_NAME)
            .collect();
        let desired = self.desired_state();

        let on_error: ErrorHandler = Arc::new(|err: &Error, item: &ChangeItem| {
            warn!(
                operation = %item.operation,
                name = %item.object.meta.name,
                error = %err,
                "Failed to apply ClusterRbacConfig change, will retry"
            );
        });
        let changes = diff(&current, &desired, on_error);
        let report = apply_changes(self.applier.as_ref(), &changes).await;
        if !report.is_noop() {
            info!(
                applied = report.applied,
                failed = report.failed,
                "Synced ClusterRbacConfig"
            );
        }
        report
    }

    /// Sync on every trigger and every resync interval until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.resync_interval, "Starting onboarding controller");
        let mut ticker = tokio::time::interval(self.resync_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.trigger.notified() => {}
            }
            self.sync().await;
        }
        info!("Stopped onboarding controller");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;
    use kube::runtime::watcher::Event;
    use mockall::predicate::*;

    use crate::auth_object::AuthSpec;
    use crate::config_store::{MockChangeApplier, MockConfigStore};

    fn service(ns: &str, name: &str, enabled: bool) -> Service {
        let mut labels = BTreeMap::new();
        if enabled {
            labels.insert(ENABLED_SERVICE_LABEL.to_string(), "true".to_string());
        }
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn services(items: Vec<Service>) -> Arc<WatchCache<Service>> {
        let cache = Arc::new(WatchCache::new("services"));
        cache.apply(Event::Init);
        for svc in items {
            cache.apply(Event::InitApply(svc));
        }
        cache.apply(Event::InitDone);
        cache
    }

    fn controller(
        services: Arc<WatchCache<Service>>,
        store: MockConfigStore,
        applier: MockChangeApplier,
    ) -> OnboardingController {
        OnboardingController::new(
            services,
            Arc::new(store),
            Arc::new(applier),
            "cluster.local",
            DEFAULT_CRC_RESYNC_INTERVAL,
        )
    }

    #[test]
    fn desired_state_lists_enabled_services_sorted() {
        let ctrl = controller(
            services(vec![
                service("web", "frontend", true),
                service("api", "backend", true),
                service("api", "internal", false),
            ]),
            MockConfigStore::new(),
            MockChangeApplier::new(),
        );

        let desired = ctrl.desired_state();
        assert_eq!(desired.len(), 1);
        assert_eq!(desired[0].meta.name, CLUSTER_RBAC_CONFIG_NAME);
        let AuthSpec::ClusterRbacConfig(spec) = &desired[0].spec else {
            panic!("expected ClusterRbacConfig");
        };
        assert_eq!(spec.mode, RbacMode::OnWithInclusion);
        assert_eq!(
            spec.inclusion.as_ref().unwrap().services,
            vec![
                "backend.api.svc.cluster.local",
                "frontend.web.svc.cluster.local"
            ]
        );
    }

    #[test]
    fn no_enabled_services_means_no_config() {
        let ctrl = controller(
            services(vec![service("api", "internal", false)]),
            MockConfigStore::new(),
            MockChangeApplier::new(),
        );
        assert!(ctrl.desired_state().is_empty());
    }

    #[tokio::test]
    async fn sync_creates_missing_config() {
        let mut store = MockConfigStore::new();
        store
            .expect_list_kind()
            .with(eq(AuthKind::ClusterRbacConfig))
            .returning(|_| Vec::new());
        let mut applier = MockChangeApplier::new();
        applier
            .expect_apply()
            .withf(|item| {
                item.operation == Operation::Add
                    && item.object.key() == "ClusterRbacConfig/default"
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctrl = controller(
            services(vec![service("api", "backend", true)]),
            store,
            applier,
        );
        let report = ctrl.sync().await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn sync_deletes_config_when_nothing_is_enabled() {
        let mut existing = AuthObject::cluster_rbac_config(ClusterRbacConfigSpec {
            mode: RbacMode::OnWithInclusion,
            inclusion: Some(RbacTarget {
                services: vec!["backend.api.svc.cluster.local".into()],
                namespaces: vec![],
            }),
            exclusion: None,
        });
        existing.meta.resource_version = Some("12".into());

        let mut store = MockConfigStore::new();
        store
            .expect_list_kind()
            .returning(move |_| vec![existing.clone()]);
        let mut applier = MockChangeApplier::new();
        applier
            .expect_apply()
            .withf(|item| {
                item.operation == Operation::Delete
                    && item.object.meta.resource_version.as_deref() == Some("12")
            })
            .times(1)
            .returning(|_| Ok(()));

        let ctrl = controller(services(vec![]), store, applier);
        assert_eq!(ctrl.sync().await.applied, 1);
    }

    #[tokio::test]
    async fn failed_apply_is_reported_not_raised() {
        let mut store = MockConfigStore::new();
        store.expect_list_kind().returning(|_| Vec::new());
        let mut applier = MockChangeApplier::new();
        applier
            .expect_apply()
            .times(1)
            .returning(|_| Err(Error::apply("ClusterRbacConfig", "default", "unavailable")));

        let ctrl = controller(
            services(vec![service("api", "backend", true)]),
            store,
            applier,
        );
        let report = ctrl.sync().await;
        assert_eq!(report.applied, 0);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn label_flip_triggers_sync() {
        let ctrl = controller(
            services(vec![]),
            MockConfigStore::new(),
            MockChangeApplier::new(),
        );
        let handler = ctrl.service_event_handler();

        // Unrelated update does not trigger
        let plain = service("api", "backend", false);
        handler.on_update(&plain, &service("api", "backend", false));
        let pending =
            tokio::time::timeout(Duration::from_millis(10), ctrl.trigger.notified()).await;
        assert!(pending.is_err());

        handler.on_update(&plain, &service("api", "backend", true));
        let pending =
            tokio::time::timeout(Duration::from_millis(10), ctrl.trigger.notified()).await;
        assert!(pending.is_ok());
    }
}

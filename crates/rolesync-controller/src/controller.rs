//! Controller lifecycle: caches, sync barrier, workers, shutdown
//!
//! Created → Starting (caches running, waiting for sync) → Running
//! (onboarding, resync timer and workers) → ShuttingDown (queue closed,
//! workers finish their current key) → Stopped.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Service;
use kube::runtime::watcher;
use kube::{Api, Client};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use rolesync_common::crd::PolicyDomain;
use rolesync_common::kube_utils::WATCH_TIMEOUT_SECS;
use rolesync_common::{Error, Result, DEFAULT_DNS_SUFFIX};
use rolesync_runtime::{
    default_controller_rate_limiter, wait_for_cache_sync, HasSynced, ResourceEventHandler,
    WatchCache, WorkQueue,
};

use crate::auth_object::AuthKind;
use crate::config_store::{
    ChangeApplier, ConfigEventHandler, ConfigStore, KubeChangeApplier, KubeConfigStore,
};
use crate::onboarding::{OnboardingController, DEFAULT_CRC_RESYNC_INTERVAL};
use crate::synchronizer::Synchronizer;

/// Default interval between full PolicyDomain resyncs
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Default bound on the initial cache sync
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default number of concurrent workers
pub const DEFAULT_WORKERS: usize = 1;

/// Controller settings
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Cluster DNS suffix for service hostnames
    pub dns_suffix: String,
    /// Interval between full PolicyDomain resyncs
    pub resync_interval: Duration,
    /// Interval between ClusterRbacConfig syncs
    pub crc_resync_interval: Duration,
    /// Number of concurrent workers
    pub workers: usize,
    /// Bound on the initial cache sync
    pub cache_sync_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            dns_suffix: DEFAULT_DNS_SUFFIX.to_string(),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            crc_resync_interval: DEFAULT_CRC_RESYNC_INTERVAL,
            workers: DEFAULT_WORKERS,
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
        }
    }
}

/// The rolesync controller
pub struct Controller {
    client: Client,
    config: ControllerConfig,
    policy_domains: Arc<WatchCache<PolicyDomain>>,
    services: Arc<WatchCache<Service>>,
    config_store: Arc<KubeConfigStore>,
    synchronizer: Arc<Synchronizer>,
    onboarding: Arc<OnboardingController>,
}

fn spawn<F>(future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(future)
}

impl Controller {
    /// Build the controller and wire every event handler
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        let policy_domains = Arc::new(WatchCache::new("policy-domains"));
        let services = Arc::new(WatchCache::new("services"));
        let config_store = Arc::new(KubeConfigStore::new());
        let applier: Arc<dyn ChangeApplier> = Arc::new(KubeChangeApplier::new(client.clone()));
        let queue = WorkQueue::new("policy-domains", default_controller_rate_limiter());

        let synchronizer = Arc::new(Synchronizer::new(
            policy_domains.clone(),
            config_store.clone(),
            applier.clone(),
            queue,
            config.dns_suffix.clone(),
        ));
        let onboarding = Arc::new(OnboardingController::new(
            services.clone(),
            config_store.clone(),
            applier,
            config.dns_suffix.clone(),
            config.crc_resync_interval,
        ));

        policy_domains
            .add_event_handler(synchronizer.domain_event_handler());
        services
            .add_event_handler(onboarding.service_event_handler());
        config_store.register_event_handler(
            AuthKind::ServiceRole,
            synchronizer.config_event_handler(),
        );
        config_store.register_event_handler(
            AuthKind::ServiceRoleBinding,
            synchronizer.config_event_handler(),
        );
        config_store.register_event_handler(
            AuthKind::ClusterRbacConfig,
            onboarding.config_event_handler(),
        );

        Self {
            client,
            config,
            policy_domains,
            services,
            config_store,
            synchronizer,
            onboarding,
        }
    }

    /// Handler turning PolicyDomain changes into reconciliation keys
    pub fn domain_event_handler(&self) -> Arc<dyn ResourceEventHandler<PolicyDomain>> {
        self.synchronizer.domain_event_handler()
    }

    /// Handler turning authorization object changes into reconciliation keys
    pub fn config_event_handler(&self) -> ConfigEventHandler {
        self.synchronizer.config_event_handler()
    }

    fn start_caches(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        let watch_config = || watcher::Config::default().timeout(WATCH_TIMEOUT_SECS);

        let domains = self.policy_domains.clone();
        let domains_api: Api<PolicyDomain> = Api::all(self.client.clone());
        let domains_cancel = cancel.clone();

        let services = self.services.clone();
        let services_api: Api<Service> = Api::all(self.client.clone());
        let services_cancel = cancel.clone();

        let store = self.config_store.clone();
        let client = self.client.clone();
        let store_cancel = cancel.clone();

        vec![
            spawn(async move {
                domains
                    .run(domains_api, watch_config(), domains_cancel)
                    .await
            }),
            spawn(async move {
                services
                    .run(services_api, watch_config(), services_cancel)
                    .await
            }),
            spawn(async move { store.run(client, store_cancel).await }),
        ]
    }

    /// Run until `cancel` fires
    ///
    /// Returns [`Error::CacheSync`] if the caches do not sync within the
    /// configured timeout.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            workers = self.config.workers,
            resync_interval = ?self.config.resync_interval,
            dns_suffix = %self.config.dns_suffix,
            "Starting rolesync controller"
        );

        let cache_cancel = cancel.child_token();
        let cache_tasks = self.start_caches(&cache_cancel);

        let mut caches: Vec<&dyn HasSynced> = Vec::new();
        caches.push(self.policy_domains.as_ref());
        caches.push(self.services.as_ref());
        caches.extend(self.config_store.caches());
        let pending = wait_for_cache_sync(&caches, self.config.cache_sync_timeout, &cancel).await;

        if cancel.is_cancelled() {
            cache_cancel.cancel();
            futures::future::join_all(cache_tasks).await;
            info!("Cancelled before caches synced");
            return Ok(());
        }
        if !pending.is_empty() {
            error!(caches = ?pending, "Timed out waiting for caches to sync");
            cache_cancel.cancel();
            futures::future::join_all(cache_tasks).await;
            return Err(Error::cache_sync(pending));
        }
        info!("Caches synced");

        let mut tasks = Vec::new();
        {
            let onboarding = self.onboarding.clone();
            let cancel = cancel.clone();
            tasks.push(spawn(async move { onboarding.run(cancel).await }));
        }
        {
            let synchronizer = self.synchronizer.clone();
            let cancel = cancel.clone();
            let interval = self.config.resync_interval;
            tasks.push(spawn(async move {
                synchronizer.run_resync(interval, cancel).await
            }));
        }
        for _ in 0..self.config.workers.max(1) {
            let synchronizer = self.synchronizer.clone();
            tasks.push(spawn(async move { synchronizer.run_worker().await }));
        }
        info!("Controller running");

        cancel.cancelled().await;
        info!("Shutting down controller");
        self.synchronizer.queue().shut_down();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Controller task failed");
            }
        }

        cache_cancel.cancel();
        futures::future::join_all(cache_tasks).await;
        info!("Controller stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use futures::future::{self, BoxFuture, FutureExt};
    use http::{Request, Response};
    use kube::client::Body;

    type Reply = BoxFuture<'static, std::result::Result<Response<Body>, Infallible>>;

    const EMPTY_LIST: &[u8] =
        br#"{"apiVersion":"v1","kind":"List","metadata":{"resourceVersion":"1"},"items":[]}"#;

    /// Client whose requests never complete, so no cache ever lists
    fn unresponsive_client() -> Client {
        let service = tower::service_fn(|_: Request<Body>| -> Reply {
            future::pending().boxed()
        });
        Client::new(service, "default")
    }

    /// Client answering every list with no items and holding watches open
    fn empty_cluster_client() -> Client {
        let service = tower::service_fn(|req: Request<Body>| -> Reply {
            let watch = req.uri().query().is_some_and(|q| q.contains("watch=true"));
            if watch {
                return future::pending().boxed();
            }
            let response = Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(Body::from(EMPTY_LIST.to_vec()))
                .unwrap();
            future::ready(Ok(response)).boxed()
        });
        Client::new(service, "default")
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.dns_suffix, "cluster.local");
        assert_eq!(config.resync_interval, Duration::from_secs(3600));
        assert_eq!(config.crc_resync_interval, Duration::from_secs(60));
        assert_eq!(config.workers, 1);
        assert_eq!(config.cache_sync_timeout, Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn unsynced_caches_fail_startup() {
        let config = ControllerConfig {
            cache_sync_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let controller = Controller::new(unresponsive_client(), config);

        match controller.run(CancellationToken::new()).await {
            Err(Error::CacheSync { caches }) => assert_eq!(
                caches,
                vec![
                    "policy-domains",
                    "services",
                    "service-roles",
                    "service-role-bindings",
                    "cluster-rbac-configs",
                ]
            ),
            other => panic!("expected CacheSync, got {other:?}"),
        }
        assert!(!controller.synchronizer.queue().is_shutting_down());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_cache_sync_stops_cleanly() {
        let controller = Controller::new(unresponsive_client(), ControllerConfig::default());
        let cancel = CancellationToken::new();

        let (result, ()) = tokio::join!(controller.run(cancel.clone()), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });
        assert!(result.is_ok());
        assert!(!controller.policy_domains.has_synced());
    }

    #[tokio::test(start_paused = true)]
    async fn runs_until_cancelled_then_shuts_down_queue() {
        let config = ControllerConfig {
            workers: 2,
            ..Default::default()
        };
        let controller = Controller::new(empty_cluster_client(), config);
        let cancel = CancellationToken::new();

        let (result, ()) = tokio::join!(controller.run(cancel.clone()), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            assert!(controller.policy_domains.has_synced());
            assert!(controller.services.has_synced());
            assert!(controller.config_store.has_synced());
            assert!(!controller.synchronizer.queue().is_shutting_down());
            cancel.cancel();
        });
        assert!(result.is_ok());
        assert!(controller.synchronizer.queue().is_shutting_down());
    }
}

//! Per-key reconciliation of a PolicyDomain into authorization objects
//!
//! Keys reach the queue from three places: PolicyDomain events, changes to
//! ServiceRoles and ServiceRoleBindings made outside rolesync, and the
//! periodic resync. Workers pull keys and run [`Synchronizer::sync`].
//!
//! Retry: a key whose sync fails, or one of whose changes fails to apply,
//! is requeued through the rate limiter at most [`QUEUE_NUM_RETRIES`]
//! times, then forgotten until the next event or resync brings it back.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use rolesync_common::crd::PolicyDomain;
use rolesync_common::metrics::{
    QUEUE_RETRIES, RESULT_ERROR, RESULT_SUCCESS, SYNC_DURATION, SYNC_ERRORS,
};
use rolesync_common::{namespace_to_domain_key, split_key, Error, Result};
use rolesync_runtime::{object_key, EventHandlerFns, ResourceEventHandler, WatchCache, WorkQueue};

use crate::auth_object::{AuthObject, ChangeItem, ErrorHandler, Operation};
use crate::config_store::{
    apply_changes, ChangeApplier, ConfigEventHandler, ConfigStore, SyncReport,
};
use crate::convert::convert_rbac_to_auth_objects;
use crate::differ::diff;
use crate::model::convert_policy_to_rbac;

/// Rate-limited requeues allowed before a failing key is dropped
pub const QUEUE_NUM_RETRIES: u32 = 3;

/// Requeue `key` through the rate limiter, or drop it once the budget is spent
fn requeue_with_budget(queue: &WorkQueue<String>, key: &str) {
    let key = key.to_string();
    if queue.num_requeues(&key) < QUEUE_NUM_RETRIES {
        debug!(key = %key, "Requeueing key");
        queue.add_rate_limited(key);
        QUEUE_RETRIES.add(1, &[KeyValue::new("outcome", "requeued")]);
    } else {
        warn!(key = %key, retries = QUEUE_NUM_RETRIES, "Dropping key after exhausting retries");
        queue.forget(&key);
        QUEUE_RETRIES.add(1, &[KeyValue::new("outcome", "dropped")]);
    }
}

fn error_reason(err: &Error) -> &'static str {
    match err {
        Error::DomainNotFound { .. } => "not_found",
        Error::MalformedKey { .. } => "malformed_key",
        Error::Conversion { .. } => "conversion",
        _ => "other",
    }
}

/// Turns queued reconciliation keys into applied changes
pub struct Synchronizer {
    policy_domains: Arc<WatchCache<PolicyDomain>>,
    config_store: Arc<dyn ConfigStore>,
    applier: Arc<dyn ChangeApplier>,
    queue: WorkQueue<String>,
    dns_suffix: String,
}

impl Synchronizer {
    /// Create a synchronizer reading domains from `policy_domains`
    pub fn new(
        policy_domains: Arc<WatchCache<PolicyDomain>>,
        config_store: Arc<dyn ConfigStore>,
        applier: Arc<dyn ChangeApplier>,
        queue: WorkQueue<String>,
        dns_suffix: impl Into<String>,
    ) -> Self {
        Self {
            policy_domains,
            config_store,
            applier,
            queue,
            dns_suffix: dns_suffix.into(),
        }
    }

    /// The work queue feeding this synchronizer
    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Handler enqueueing the key of every changed PolicyDomain
    ///
    /// Deletes carry the last known object, so the key is always derivable
    /// for named objects.
    pub fn domain_event_handler(&self) -> Arc<dyn ResourceEventHandler<PolicyDomain>> {
        let enqueue = |queue: WorkQueue<String>| {
            move |domain: &PolicyDomain| match object_key(domain) {
                Some(key) => queue.add(key),
                None => error!("PolicyDomain event without a name, dropping"),
            }
        };
        let on_add = enqueue(self.queue.clone());
        let on_new = enqueue(self.queue.clone());
        let on_update = move |_: &PolicyDomain, new: &PolicyDomain| on_new(new);
        let on_delete = enqueue(self.queue.clone());
        Arc::new(EventHandlerFns {
            add: Some(Box::new(on_add)),
            update: Some(Box::new(on_update)),
            delete: Some(Box::new(on_delete)),
        })
    }

    /// Handler mapping a changed ServiceRole or ServiceRoleBinding back to
    /// the key of the domain owning its namespace
    pub fn config_event_handler(&self) -> ConfigEventHandler {
        let queue = self.queue.clone();
        Arc::new(move |obj: &AuthObject, op: Operation| {
            let Some(namespace) = obj.meta.namespace.as_deref() else {
                debug!(key = %obj.key(), "Ignoring cluster-scoped object");
                return;
            };
            let key = namespace_to_domain_key(namespace);
            debug!(
                object = %obj.key(),
                operation = %op,
                key = %key,
                "Authorization object changed"
            );
            queue.add(key);
        })
    }

    /// Enqueue every cached PolicyDomain; returns how many keys were added
    pub fn resync_once(&self) -> usize {
        let keys = self.policy_domains.list_keys();
        let count = keys.len();
        for key in keys {
            self.queue.add(key);
        }
        count
    }

    /// Run [`Synchronizer::resync_once`] every `interval` until `cancel` fires
    pub async fn run_resync(&self, interval: Duration, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let count = self.resync_once();
                    info!(domains = count, "Resynced policy domains");
                }
            }
        }
        info!("Stopped policy domain resync");
    }

    /// Error handler for the change items of one sync of `key`
    ///
    /// However many items fail, the key is requeued at most once.
    pub fn error_handler_for(&self, key: String) -> ErrorHandler {
        let queue = self.queue.clone();
        let requeued = Arc::new(AtomicBool::new(false));
        Arc::new(move |err: &Error, item: &ChangeItem| {
            error!(
                key = %key,
                operation = %item.operation,
                object = %item.object.key(),
                error = %err,
                "Failed to apply change"
            );
            if !requeued.swap(true, Ordering::AcqRel) {
                requeue_with_budget(&queue, &key);
            }
        })
    }

    /// Converge the authorization objects of the domain behind `key`
    ///
    /// A missing domain is an error and changes nothing. Apply failures do
    /// not fail the sync; they are counted in the report and handled by the
    /// key's error handler.
    #[instrument(skip(self))]
    pub async fn sync(&self, key: &str) -> Result<SyncReport> {
        let (namespace, _) = split_key(key).ok_or_else(|| Error::malformed_key(key))?;
        let domain = self
            .policy_domains
            .get_by_key(key)
            .ok_or_else(|| Error::domain_not_found(key))?;

        let model = convert_policy_to_rbac(&domain.spec.signed_domain)?;
        if model.namespace != namespace {
            return Err(Error::conversion(
                &model.domain,
                format!(
                    "domain belongs in namespace {} but was found in {}",
                    model.namespace, namespace
                ),
            ));
        }

        let desired = convert_rbac_to_auth_objects(&model, &self.dns_suffix);
        let current = self.config_store.list_current(namespace);
        let changes = diff(&current, &desired, self.error_handler_for(key.to_string()));
        if changes.is_empty() {
            debug!("Authorization objects up to date");
            return Ok(SyncReport::default());
        }

        let report = apply_changes(self.applier.as_ref(), &changes).await;
        info!(
            applied = report.applied,
            failed = report.failed,
            "Synced policy domain"
        );
        Ok(report)
    }

    /// Take one key off the queue and sync it; `false` once the queue shuts down
    pub async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.next().await else {
            return false;
        };

        debug!(key = %*key, "Processing key");
        let start = Instant::now();
        let result = self.sync(&key).await;
        let outcome = if result.is_ok() {
            RESULT_SUCCESS
        } else {
            RESULT_ERROR
        };
        SYNC_DURATION.record(
            start.elapsed().as_secs_f64(),
            &[KeyValue::new("result", outcome)],
        );

        match result {
            // The error handler already requeued the key
            Ok(report) if report.failed > 0 => {}
            Ok(_) => self.queue.forget(&key),
            Err(e) => {
                SYNC_ERRORS.add(1, &[KeyValue::new("reason", error_reason(&e))]);
                if e.is_retryable() {
                    error!(key = %*key, error = %e, "Sync failed");
                    requeue_with_budget(&self.queue, &key);
                } else {
                    error!(key = %*key, error = %e, "Sync failed permanently, dropping key");
                    self.queue.forget(&key);
                }
            }
        }
        true
    }

    /// Process keys until the queue shuts down
    pub async fn run_worker(&self) {
        while self.process_next_item().await {}
    }
}

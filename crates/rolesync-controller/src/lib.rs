//! Reconciles PolicyDomain resources into Istio authorization objects
//!
//! Data flow: watch caches → event handlers → work queue → workers →
//! [`synchronizer::Synchronizer::sync`] → [`differ::diff`] →
//! [`config_store::ChangeApplier`], with failures flowing back to the queue
//! through each change's error handler.

#![deny(missing_docs)]

pub mod auth_object;
pub mod config_store;
pub mod controller;
pub mod convert;
pub mod differ;
pub mod model;
pub mod onboarding;
pub mod synchronizer;

pub use auth_object::{AuthKind, AuthMeta, AuthObject, AuthSpec, ChangeItem, Operation};
pub use config_store::{ChangeApplier, ConfigStore, KubeChangeApplier, KubeConfigStore, SyncReport};
pub use controller::{Controller, ControllerConfig};
pub use convert::convert_rbac_to_auth_objects;
pub use differ::diff;
pub use model::{convert_policy_to_rbac, RbacModel};
pub use synchronizer::{Synchronizer, QUEUE_NUM_RETRIES};

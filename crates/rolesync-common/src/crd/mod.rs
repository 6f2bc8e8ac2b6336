//! Custom Resource Definitions used by rolesync
//!
//! `PolicyDomain` is the upstream source of truth. The `rbac.istio.io`
//! kinds are the authorization objects rolesync writes.

mod istio_rbac;
mod policy_domain;

pub use istio_rbac::{
    AccessRule, ClusterRbacConfig, ClusterRbacConfigSpec, RbacMode, RbacTarget, RoleRef,
    ServiceRole, ServiceRoleBinding, ServiceRoleBindingSpec, ServiceRoleSpec, Subject,
    CLUSTER_RBAC_CONFIG_NAME,
};
pub use policy_domain::{
    Assertion, AssertionEffect, DomainData, DomainPolicies, Policy, PolicyDomain,
    PolicyDomainSpec, Role, RoleMember, SignedDomain, SignedPolicies,
};

/// Sort and de-duplicate a list whose order carries no meaning
pub(crate) fn canonical_set<T: Ord + Clone>(items: &[T]) -> Vec<T> {
    let mut out = items.to_vec();
    out.sort();
    out.dedup();
    out
}

//! Grouping of a signed domain's roles, members and rules by role
//!
//! [`convert_policy_to_rbac`] flattens the upstream payload into an
//! [`RbacModel`]: one [`RoleModel`] per role of the domain, holding the
//! role's current members and the allow rules asserted for it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use rolesync_common::crd::{Assertion, AssertionEffect, Role, SignedDomain};
use rolesync_common::{domain_to_namespace, Error, Result};

const ROLE_MARKER: &str = ":role.";
const SERVICE_MARKER: &str = ":svc.";

/// Roles of one domain, keyed by short role name
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RbacModel {
    /// Fully qualified domain name
    pub domain: String,
    /// Namespace hosting the domain
    pub namespace: String,
    /// Roles by short name
    pub roles: BTreeMap<String, RoleModel>,
}

/// A role with its members and allow rules
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RoleModel {
    /// Principal names (e.g. `user.alice`, `*`)
    pub members: Vec<String>,
    /// Allow rules
    pub rules: Vec<RoleRule>,
}

/// One allowed action on a service
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct RoleRule {
    /// Short service name within the domain's namespace
    pub service: String,
    /// Action, as asserted upstream
    pub action: String,
    /// Optional path suffix of the resource
    pub path: Option<String>,
}

/// Convert a signed domain into its role model, evaluating expiry now
pub fn convert_policy_to_rbac(signed: &SignedDomain) -> Result<RbacModel> {
    convert_policy_to_rbac_at(signed, Utc::now())
}

/// Convert a signed domain into its role model, evaluating expiry at `now`
pub fn convert_policy_to_rbac_at(signed: &SignedDomain, now: DateTime<Utc>) -> Result<RbacModel> {
    let data = &signed.domain;
    let domain = data.name.as_str();
    if domain.is_empty() {
        return Err(Error::conversion("<unnamed>", "domain name is empty"));
    }

    let mut roles: BTreeMap<String, RoleModel> = BTreeMap::new();
    for role in &data.roles {
        let Some(short) = short_role_name(domain, &role.name) else {
            debug!(domain, role = %role.name, "Skipping role of another domain");
            continue;
        };
        let model = roles.entry(short.to_string()).or_default();
        model.members.extend(active_members(role, now));
    }

    let contents = &data.policies.contents;
    if !contents.domain.is_empty() && contents.domain != domain {
        return Err(Error::conversion(
            domain,
            format!("policies belong to domain {}", contents.domain),
        ));
    }

    for assertion in contents.policies.iter().flat_map(|p| p.assertions.iter()) {
        if assertion.effect == Some(AssertionEffect::Deny) {
            debug!(domain, role = %assertion.role, "Ignoring DENY assertion");
            continue;
        }
        let Some(short) = short_role_name(domain, &assertion.role) else {
            debug!(domain, role = %assertion.role, "Skipping assertion for a foreign role");
            continue;
        };
        let Some(rule) = parse_rule(domain, assertion) else {
            debug!(domain, resource = %assertion.resource, "Skipping non-service resource");
            continue;
        };
        roles.entry(short.to_string()).or_default().rules.push(rule);
    }

    for model in roles.values_mut() {
        model.members.sort();
        model.members.dedup();
        model.rules.sort();
        model.rules.dedup();
    }

    Ok(RbacModel {
        domain: domain.to_string(),
        namespace: domain_to_namespace(domain),
        roles,
    })
}

fn short_role_name<'a>(domain: &str, role: &'a str) -> Option<&'a str> {
    role.strip_prefix(domain)
        .and_then(|rest| rest.strip_prefix(ROLE_MARKER))
        .filter(|name| !name.is_empty())
}

fn parse_rule(domain: &str, assertion: &Assertion) -> Option<RoleRule> {
    let rest = assertion
        .resource
        .strip_prefix(domain)?
        .strip_prefix(SERVICE_MARKER)?;
    let (service, path) = match rest.split_once(':') {
        Some((service, path)) => (service, Some(path.to_string()).filter(|p| !p.is_empty())),
        None => (rest, None),
    };
    if service.is_empty() {
        return None;
    }
    Some(RoleRule {
        service: service.to_string(),
        action: assertion.action.clone(),
        path,
    })
}

fn active_members(role: &Role, now: DateTime<Utc>) -> Vec<String> {
    let current = role.role_members.iter().filter(|m| match &m.expiration {
        None => true,
        Some(expiration) => match DateTime::parse_from_rfc3339(expiration) {
            Ok(at) => at.with_timezone(&Utc) > now,
            Err(e) => {
                warn!(
                    role = %role.name,
                    member = %m.member_name,
                    expiration = %expiration,
                    error = %e,
                    "Ignoring member with unparseable expiration"
                );
                false
            }
        },
    });

    current
        .map(|m| m.member_name.clone())
        .chain(role.members.iter().cloned())
        .filter(|m| !m.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rolesync_common::crd::{DomainData, DomainPolicies, Policy, RoleMember, SignedPolicies};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()
    }

    fn assertion(
        role: &str,
        resource: &str,
        action: &str,
        effect: Option<AssertionEffect>,
    ) -> Assertion {
        Assertion {
            role: role.into(),
            resource: resource.into(),
            action: action.into(),
            effect,
        }
    }

    fn member(name: &str, expiration: Option<&str>) -> RoleMember {
        RoleMember {
            member_name: name.into(),
            expiration: expiration.map(String::from),
        }
    }

    fn domain(roles: Vec<Role>, assertions: Vec<Assertion>) -> SignedDomain {
        SignedDomain {
            domain: DomainData {
                name: "media.streaming".into(),
                roles,
                policies: SignedPolicies {
                    contents: DomainPolicies {
                        domain: "media.streaming".into(),
                        policies: vec![Policy {
                            name: "media.streaming:policy.all".into(),
                            assertions,
                        }],
                    },
                    ..Default::default()
                },
                modified: None,
            },
            ..Default::default()
        }
    }

    #[test]
    fn groups_members_and_rules_by_short_role_name() {
        let signed = domain(
            vec![Role {
                name: "media.streaming:role.admin".into(),
                role_members: vec![member("user.bob", None), member("user.alice", None)],
                ..Default::default()
            }],
            vec![
                assertion(
                    "media.streaming:role.admin",
                    "media.streaming:svc.frontend",
                    "get",
                    None,
                ),
                assertion(
                    "media.streaming:role.admin",
                    "media.streaming:svc.backend:/api/*",
                    "post",
                    Some(AssertionEffect::Allow),
                ),
            ],
        );

        let model = convert_policy_to_rbac_at(&signed, now()).unwrap();
        assert_eq!(model.namespace, "media-streaming");
        let admin = &model.roles["admin"];
        assert_eq!(admin.members, vec!["user.alice", "user.bob"]);
        assert_eq!(
            admin.rules,
            vec![
                RoleRule {
                    service: "backend".into(),
                    action: "post".into(),
                    path: Some("/api/*".into()),
                },
                RoleRule {
                    service: "frontend".into(),
                    action: "get".into(),
                    path: None,
                },
            ]
        );
    }

    #[test]
    fn deny_assertions_are_ignored() {
        let signed = domain(
            vec![],
            vec![assertion(
                "media.streaming:role.reader",
                "media.streaming:svc.frontend",
                "delete",
                Some(AssertionEffect::Deny),
            )],
        );
        let model = convert_policy_to_rbac_at(&signed, now()).unwrap();
        assert!(model.roles.is_empty());
    }

    #[test]
    fn expired_members_are_dropped() {
        let signed = domain(
            vec![Role {
                name: "media.streaming:role.reader".into(),
                members: vec!["user.legacy".into()],
                role_members: vec![
                    member("user.old", Some("2020-01-01T00:00:00Z")),
                    member("user.current", Some("2030-01-01T00:00:00Z")),
                    member("user.garbled", Some("next tuesday")),
                ],
                trust: None,
            }],
            vec![],
        );
        let model = convert_policy_to_rbac_at(&signed, now()).unwrap();
        assert_eq!(
            model.roles["reader"].members,
            vec!["user.current", "user.legacy"]
        );
    }

    #[test]
    fn foreign_roles_and_resources_are_skipped() {
        let signed = domain(
            vec![Role {
                name: "other.domain:role.admin".into(),
                role_members: vec![member("user.eve", None)],
                ..Default::default()
            }],
            vec![
                assertion(
                    "media.streaming:role.admin",
                    "other.domain:svc.api",
                    "get",
                    None,
                ),
                assertion(
                    "media.streaming:role.admin",
                    "media.streaming:table.users",
                    "get",
                    None,
                ),
                assertion(
                    "other.domain:role.admin",
                    "media.streaming:svc.api",
                    "get",
                    None,
                ),
            ],
        );
        let model = convert_policy_to_rbac_at(&signed, now()).unwrap();
        for role in model.roles.values() {
            assert!(role.rules.is_empty() && role.members.is_empty());
        }
    }

    #[test]
    fn empty_domain_name_is_a_conversion_error() {
        let mut signed = domain(vec![], vec![]);
        signed.domain.name.clear();
        let err = convert_policy_to_rbac_at(&signed, now()).unwrap_err();
        assert!(matches!(err, Error::Conversion { .. }));
    }

    #[test]
    fn mismatched_policy_domain_is_a_conversion_error() {
        let mut signed = domain(vec![], vec![]);
        signed.domain.policies.contents.domain = "other.domain".into();
        let err = convert_policy_to_rbac_at(&signed, now()).unwrap_err();
        assert!(err.to_string().contains("other.domain"));
    }
}

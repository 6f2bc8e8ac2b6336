//! Conversion of a role model into ServiceRole and ServiceRoleBinding objects

use tracing::debug;

use rolesync_common::crd::{
    AccessRule, RoleRef, ServiceRoleBindingSpec, ServiceRoleSpec, Subject,
};

use crate::auth_object::AuthObject;
use crate::model::{RbacModel, RoleRule};

const WILDCARD: &str = "*";

/// Fully qualified hostname of `service` in `namespace`
pub fn service_host(service: &str, namespace: &str, dns_suffix: &str) -> String {
    format!("{}.{}.svc.{}", service, namespace, dns_suffix)
}

/// Subject user for an upstream principal
///
/// `<prefix>.<name>` becomes `<prefix>/sa/<name>`, `*` stays `*`. Returns
/// `None` for names without a prefix.
pub fn member_to_user(member: &str) -> Option<String> {
    if member == WILDCARD {
        return Some(WILDCARD.to_string());
    }
    match member.rsplit_once('.') {
        Some((prefix, name)) if !prefix.is_empty() && !name.is_empty() => {
            Some(format!("{}/sa/{}", prefix, name))
        }
        _ => None,
    }
}

fn access_rule(rule: &RoleRule, namespace: &str, dns_suffix: &str) -> AccessRule {
    let method = if rule.action == WILDCARD {
        WILDCARD.to_string()
    } else {
        rule.action.to_uppercase()
    };
    AccessRule {
        services: vec![service_host(&rule.service, namespace, dns_suffix)],
        methods: vec![method],
        paths: vec![rule.path.clone().unwrap_or_else(|| WILDCARD.to_string())],
    }
}

/// Desired authorization objects for a domain
///
/// Every role with at least one rule yields a ServiceRole; if it also has
/// members, a ServiceRoleBinding of the same name grants it to them.
pub fn convert_rbac_to_auth_objects(model: &RbacModel, dns_suffix: &str) -> Vec<AuthObject> {
    let mut out = Vec::new();
    for (name, role) in &model.roles {
        if role.rules.is_empty() {
            debug!(domain = %model.domain, role = %name, "Role has no rules, skipping");
            continue;
        }

        let rules = role
            .rules
            .iter()
            .map(|r| access_rule(r, &model.namespace, dns_suffix))
            .collect();
        out.push(AuthObject::service_role(
            &model.namespace,
            name,
            ServiceRoleSpec { rules },
        ));

        let subjects: Vec<Subject> = role
            .members
            .iter()
            .filter_map(|m| {
                let user = member_to_user(m);
                if user.is_none() {
                    debug!(
                        domain = %model.domain,
                        role = %name,
                        member = %m,
                        "Skipping unmappable member"
                    );
                }
                user
            })
            .map(Subject::user)
            .collect();
        if subjects.is_empty() {
            continue;
        }
        out.push(AuthObject::service_role_binding(
            &model.namespace,
            name,
            ServiceRoleBindingSpec {
                subjects,
                role_ref: RoleRef::service_role(name),
            },
        ));
    }
    out
}

//! PolicyDomain CRD carrying a signed authorization domain
//!
//! The payload is produced by an upstream syncer that fetches the domain
//! from the identity provider and copies it verbatim into the cluster. One
//! PolicyDomain exists per namespace; its name is the domain name.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// PolicyDomain mirrors one signed upstream domain into the cluster.
///
/// Example:
/// ```yaml
/// apiVersion: authz.rolesync.dev/v1
/// kind: PolicyDomain
/// metadata:
///   name: media.streaming
///   namespace: media-streaming
/// spec:
///   signedDomain:
///     keyId: "0"
///     signature: "..."
///     domain:
///       name: media.streaming
///       roles:
///         - name: "media.streaming:role.admin"
///           roleMembers:
///             - memberName: user.alice
///       policies:
///         keyId: "0"
///         signature: "..."
///         contents:
///           domain: media.streaming
///           policies:
///             - name: "media.streaming:policy.admin"
///               assertions:
///                 - role: "media.streaming:role.admin"
///                   resource: "media.streaming:svc.frontend"
///                   action: get
///                   effect: ALLOW
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "authz.rolesync.dev",
    version = "v1",
    kind = "PolicyDomain",
    namespaced,
    printcolumn = r#"{"name":"Domain","type":"string","jsonPath":".spec.signedDomain.domain.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDomainSpec {
    /// The signed domain payload
    pub signed_domain: SignedDomain,
}

/// A domain together with the signature over it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignedDomain {
    /// Domain contents
    pub domain: DomainData,
    /// Signature over the serialized domain
    #[serde(default)]
    pub signature: String,
    /// Identifier of the signing key
    #[serde(default)]
    pub key_id: String,
}

/// Roles and policies of one domain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainData {
    /// Fully qualified domain name (e.g. `media.streaming`)
    pub name: String,
    /// Role definitions
    #[serde(default)]
    pub roles: Vec<Role>,
    /// Signed policy set
    #[serde(default)]
    pub policies: SignedPolicies,
    /// Last modification timestamp reported upstream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
}

/// A role and its members
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    /// Fully qualified role name (`<domain>:role.<name>`)
    pub name: String,
    /// Legacy member list without expiry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
    /// Members with optional expiry
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub role_members: Vec<RoleMember>,
    /// Delegating domain for trust roles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust: Option<String>,
}

/// A member of a role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoleMember {
    /// Principal name (e.g. `user.alice`, `media.api.frontend`)
    pub member_name: String,
    /// RFC 3339 expiry; the membership is ignored once it has passed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<String>,
}

/// Policies with the signature over them
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SignedPolicies {
    /// Policy contents
    #[serde(default)]
    pub contents: DomainPolicies,
    /// Signature over the policy contents
    #[serde(default)]
    pub signature: String,
    /// Identifier of the signing key
    #[serde(default)]
    pub key_id: String,
}

/// The policies of a domain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DomainPolicies {
    /// Domain the policies belong to
    #[serde(default)]
    pub domain: String,
    /// Policy list
    #[serde(default)]
    pub policies: Vec<Policy>,
}

/// A named group of assertions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Fully qualified policy name
    pub name: String,
    /// Assertions granted by this policy
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

/// A single permission rule scoped to a role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Assertion {
    /// Fully qualified role name the rule applies to
    pub role: String,
    /// Resource (`<domain>:svc.<service>[:<path>]`)
    pub resource: String,
    /// Action, usually an HTTP method or `*`
    pub action: String,
    /// Effect; absent means allow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<AssertionEffect>,
}

/// Effect of an assertion
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AssertionEffect {
    /// Grant the action
    Allow,
    /// Deny the action
    Deny,
}

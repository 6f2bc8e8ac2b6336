//! Mapping between Kubernetes namespaces and policy domain names
//!
//! A domain such as `media.streaming-api` lives in the namespace
//! `media-streaming--api`: literal dashes are doubled and dots become single
//! dashes. Reconciliation keys are `<namespace>/<domain>`, so a change to any
//! authorization object can be traced back to the domain that owns it.

/// Convert a namespace into the policy domain it hosts
pub fn namespace_to_domain(namespace: &str) -> String {
    let mut domain = String::with_capacity(namespace.len());
    let mut chars = namespace.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '-' {
            if chars.peek() == Some(&'-') {
                chars.next();
                domain.push('-');
            } else {
                domain.push('.');
            }
        } else {
            domain.push(c);
        }
    }
    domain
}

/// Convert a policy domain name into the namespace that hosts it
pub fn domain_to_namespace(domain: &str) -> String {
    domain.replace('-', "--").replace('.', "-")
}

/// Reconciliation key for the domain hosted in `namespace`
pub fn namespace_to_domain_key(namespace: &str) -> String {
    format!("{}/{}", namespace, namespace_to_domain(namespace))
}

/// Split a `namespace/name` key into its parts
///
/// Returns `None` when the key has no separator or either side is empty.
pub fn split_key(key: &str) -> Option<(&str, &str)> {
    match key.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Some((ns, name))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dots_become_single_dashes() {
        assert_eq!(namespace_to_domain("media-streaming"), "media.streaming");
        assert_eq!(domain_to_namespace("media.streaming"), "media-streaming");
    }

    #[test]
    fn literal_dashes_are_doubled() {
        assert_eq!(
            namespace_to_domain("media-streaming--api"),
            "media.streaming-api"
        );
        assert_eq!(
            domain_to_namespace("media.streaming-api"),
            "media-streaming--api"
        );
    }

    #[test]
    fn plain_names_are_unchanged() {
        assert_eq!(namespace_to_domain("payments"), "payments");
        assert_eq!(domain_to_namespace("payments"), "payments");
    }

    #[test]
    fn round_trip() {
        for domain in ["a", "a.b", "a-b", "a.b-c.d", "sys.auth-core.prod"] {
            assert_eq!(namespace_to_domain(&domain_to_namespace(domain)), domain);
        }
    }

    #[test]
    fn key_combines_namespace_and_domain() {
        assert_eq!(
            namespace_to_domain_key("media-streaming--api"),
            "media-streaming--api/media.streaming-api"
        );
    }

    #[test]
    fn split_key_rejects_malformed_input() {
        assert_eq!(split_key("ns/name"), Some(("ns", "name")));
        assert_eq!(split_key("name"), None);
        assert_eq!(split_key("/name"), None);
        assert_eq!(split_key("ns/"), None);
        assert_eq!(split_key("a/b/c"), None);
    }
}

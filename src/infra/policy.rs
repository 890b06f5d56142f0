//! Creation policy backed by static settings.

use std::collections::HashMap;

use url::Url;

use crate::{
    application::collaborators::{CreationLimit, CreationPolicy},
    domain::{source::SourceLocator, types::ActorId},
};

/// Host allow-list plus a default creation limit with per-actor overrides.
#[derive(Debug, Clone, Default)]
pub struct SettingsPolicy {
    allowed_hosts: Vec<String>,
    default_limit: i64,
    limits: HashMap<ActorId, i64>,
}

impl SettingsPolicy {
    /// An empty `allowed_hosts` list allows every http(s) location.
    pub fn new(allowed_hosts: Vec<String>, default_limit: i64, limits: HashMap<ActorId, i64>) -> Self {
        let allowed_hosts = allowed_hosts
            .into_iter()
            .map(|host| host.trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|host| !host.is_empty())
            .collect();
        Self {
            allowed_hosts,
            default_limit,
            limits,
        }
    }

    fn host_allowed(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.allowed_hosts.iter().any(|allowed| {
            host == *allowed
                || host
                    .strip_suffix(allowed.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
    }
}

impl CreationPolicy for SettingsPolicy {
    fn is_source_allowed(&self, source: &SourceLocator) -> bool {
        let location = match source {
            SourceLocator::Upload => return true,
            SourceLocator::Remote(location) => location,
        };
        let Ok(url) = Url::parse(location) else {
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        if self.allowed_hosts.is_empty() {
            return true;
        }

        url.host_str().is_some_and(|host| self.host_allowed(host))
    }

    fn creation_limit(&self, actor: ActorId) -> CreationLimit {
        CreationLimit::from_raw(self.limits.get(&actor).copied().unwrap_or(self.default_limit))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn remote(location: &str) -> SourceLocator {
        SourceLocator::parse(location)
    }

    #[test]
    fn empty_allow_list_allows_any_web_host() {
        let policy = SettingsPolicy::default();
        assert!(policy.is_source_allowed(&remote("http://anywhere.test/a.png")));
        assert!(policy.is_source_allowed(&remote("HTTPS://anywhere.test/a.png")));
        assert!(policy.is_source_allowed(&SourceLocator::Upload));
    }

    #[test]
    fn local_and_malformed_locations_are_refused() {
        let policy = SettingsPolicy::default();
        assert!(!policy.is_source_allowed(&remote("file:///etc/passwd")));
        assert!(!policy.is_source_allowed(&remote("ftp://anywhere.test/a.png")));
        assert!(!policy.is_source_allowed(&remote("whatever")));
    }

    #[test]
    fn allow_list_matches_hosts_and_subdomains() {
        let policy = SettingsPolicy::new(vec!["Imgur.com".to_string()], 0, HashMap::new());
        assert!(policy.is_source_allowed(&remote("https://imgur.com/a.png")));
        assert!(policy.is_source_allowed(&remote("https://i.IMGUR.com/a.png")));
        assert!(!policy.is_source_allowed(&remote("https://notimgur.com/a.png")));
        assert!(!policy.is_source_allowed(&remote("file:///tmp/a.png")));
        assert!(!policy.is_source_allowed(&remote("not a url")));
        assert!(policy.is_source_allowed(&SourceLocator::Upload));
    }

    #[test]
    fn per_actor_limits_override_default() {
        let vip = ActorId::new(Uuid::new_v4());
        let other = ActorId::new(Uuid::new_v4());
        let policy = SettingsPolicy::new(Vec::new(), 3, HashMap::from([(vip, -1)]));

        assert_eq!(policy.creation_limit(vip), CreationLimit::Unlimited);
        assert_eq!(policy.creation_limit(other), CreationLimit::AtMost(3));
    }
}

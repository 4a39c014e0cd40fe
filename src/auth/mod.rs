//! Authentication and authorization.
//!
//! The broker core only knows the [`AuthProvider`] capability interface;
//! concrete policies are collaborators. Three implementations ship with the
//! crate: a username/password dictionary ([`StaticAuth`]), a role-based ACL
//! ([`AclAuth`]), and a callback adapter ([`CallbackAuth`]) for applications
//! that want to plug in their own logic without a new type.

mod acl;
mod static_auth;

pub use acl::AclAuth;
pub use static_auth::StaticAuth;

use crate::config::Config;
use crate::packet::QoS;

/// Pluggable authentication/authorization policy.
///
/// `authorize_subscribe` returns the maximum QoS the client may be granted
/// on the filter, or `None` to deny (reported as 0x80 in the SUBACK).
pub trait AuthProvider: Send {
    /// Validate credentials presented in CONNECT.
    fn authenticate(&self, client_id: &str, username: Option<&str>, password: Option<&[u8]>)
        -> bool;

    /// May the client publish to this topic?
    fn authorize_publish(&self, client_id: &str, topic: &str) -> bool;

    /// May the client subscribe to this filter, and at what maximum QoS?
    fn authorize_subscribe(&self, client_id: &str, filter: &str) -> Option<QoS>;

    /// Drop any per-client state. Called when the client disconnects.
    fn cleanup_client(&self, _client_id: &str) {}
}

/// Default provider: every connection and operation is allowed.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AuthProvider for AllowAll {
    #[inline]
    fn authenticate(&self, _: &str, _: Option<&str>, _: Option<&[u8]>) -> bool {
        true
    }

    #[inline]
    fn authorize_publish(&self, _: &str, _: &str) -> bool {
        true
    }

    #[inline]
    fn authorize_subscribe(&self, _: &str, _: &str) -> Option<QoS> {
        Some(QoS::ExactlyOnce)
    }
}

type AuthenticateFn = dyn Fn(&str, Option<&str>, Option<&[u8]>) -> bool + Send;
type PublishFn = dyn Fn(&str, &str) -> bool + Send;
type SubscribeFn = dyn Fn(&str, &str) -> Option<QoS> + Send;

/// Provider that delegates each decision to an optional closure.
/// Unset closures allow everything, like [`AllowAll`].
#[derive(Default)]
pub struct CallbackAuth {
    authenticate: Option<Box<AuthenticateFn>>,
    authorize_publish: Option<Box<PublishFn>>,
    authorize_subscribe: Option<Box<SubscribeFn>>,
}

impl CallbackAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_authenticate<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, Option<&str>, Option<&[u8]>) -> bool + Send + 'static,
    {
        self.authenticate = Some(Box::new(f));
        self
    }

    pub fn on_authorize_publish<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) -> bool + Send + 'static,
    {
        self.authorize_publish = Some(Box::new(f));
        self
    }

    pub fn on_authorize_subscribe<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &str) -> Option<QoS> + Send + 'static,
    {
        self.authorize_subscribe = Some(Box::new(f));
        self
    }
}

impl AuthProvider for CallbackAuth {
    fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        match &self.authenticate {
            Some(f) => f(client_id, username, password),
            None => true,
        }
    }

    fn authorize_publish(&self, client_id: &str, topic: &str) -> bool {
        match &self.authorize_publish {
            Some(f) => f(client_id, topic),
            None => true,
        }
    }

    fn authorize_subscribe(&self, client_id: &str, filter: &str) -> Option<QoS> {
        match &self.authorize_subscribe {
            Some(f) => f(client_id, filter),
            None => Some(QoS::ExactlyOnce),
        }
    }
}

/// Build the provider selected by the configuration: ACL when enabled,
/// otherwise the static user list, otherwise allow-all.
pub fn from_config(config: &Config) -> Box<dyn AuthProvider> {
    if config.acl.enabled {
        Box::new(AclAuth::from_config(&config.acl))
    } else if config.auth.enabled {
        Box::new(StaticAuth::from_config(&config.auth))
    } else {
        Box::new(AllowAll)
    }
}

/// Check whether a topic matches an ACL pattern (`+` single level, `#`
/// terminal multi-level). Used by the ACL provider; subscription filters are
/// matched literally against the pattern the same way concrete topics are.
pub(crate) fn topic_matches_pattern(topic: &str, pattern: &str) -> bool {
    let topic_levels: Vec<&str> = topic.split('/').collect();
    let pattern_levels: Vec<&str> = pattern.split('/').collect();

    let mut ti = 0;
    let mut pi = 0;

    while pi < pattern_levels.len() {
        let pattern_level = pattern_levels[pi];

        if pattern_level == "#" {
            return true;
        }

        if ti >= topic_levels.len() {
            return false;
        }

        if pattern_level == "+" || pattern_level == topic_levels[ti] {
            ti += 1;
            pi += 1;
        } else {
            return false;
        }
    }

    ti == topic_levels.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_all() {
        let auth = AllowAll;
        assert!(auth.authenticate("c1", None, None));
        assert!(auth.authorize_publish("c1", "any/topic"));
        assert_eq!(auth.authorize_subscribe("c1", "#"), Some(QoS::ExactlyOnce));
    }

    #[test]
    fn test_callback_auth() {
        let auth = CallbackAuth::new()
            .on_authenticate(|_, username, _| username == Some("admin"))
            .on_authorize_publish(|client_id, topic| topic.starts_with(client_id))
            .on_authorize_subscribe(|_, filter| {
                if filter.starts_with("private/") {
                    None
                } else {
                    Some(QoS::AtLeastOnce)
                }
            });

        assert!(auth.authenticate("c1", Some("admin"), None));
        assert!(!auth.authenticate("c1", Some("guest"), None));
        assert!(auth.authorize_publish("c1", "c1/data"));
        assert!(!auth.authorize_publish("c1", "c2/data"));
        assert_eq!(auth.authorize_subscribe("c1", "public/x"), Some(QoS::AtLeastOnce));
        assert_eq!(auth.authorize_subscribe("c1", "private/x"), None);
    }

    #[test]
    fn test_pattern_matching() {
        assert!(topic_matches_pattern("sensors/temp", "sensors/temp"));
        assert!(topic_matches_pattern("sensors/temp", "sensors/+"));
        assert!(topic_matches_pattern("sensors/room1/temp", "sensors/#"));
        assert!(topic_matches_pattern("sensors", "#"));
        assert!(!topic_matches_pattern("sensors/room1/temp", "sensors/+"));
        assert!(!topic_matches_pattern("other/temp", "sensors/#"));
    }
}

//! Static username/password authentication from configuration.

use ahash::AHashMap;

use super::AuthProvider;
use crate::config::AuthConfig;
use crate::packet::QoS;

/// Dictionary authenticator: a fixed username -> password map.
///
/// Authenticated clients may publish and subscribe anywhere; combine with
/// [`super::AclAuth`] when per-topic control is needed.
pub struct StaticAuth {
    users: AHashMap<String, String>,
}

impl StaticAuth {
    pub fn new(users: AHashMap<String, String>) -> Self {
        Self { users }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| (u.username.clone(), u.password.clone()))
            .collect();
        Self { users }
    }
}

impl AuthProvider for StaticAuth {
    fn authenticate(
        &self,
        _client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        let (Some(username), Some(password)) = (username, password) else {
            return false;
        };
        self.users
            .get(username)
            .is_some_and(|stored| stored.as_bytes() == password)
    }

    fn authorize_publish(&self, _client_id: &str, _topic: &str) -> bool {
        true
    }

    fn authorize_subscribe(&self, _client_id: &str, _filter: &str) -> Option<QoS> {
        Some(QoS::ExactlyOnce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_auth() -> StaticAuth {
        let mut users = AHashMap::new();
        users.insert("admin".to_string(), "secret".to_string());
        StaticAuth::new(users)
    }

    #[test]
    fn test_valid_credentials() {
        let auth = make_auth();
        assert!(auth.authenticate("c1", Some("admin"), Some(b"secret")));
    }

    #[test]
    fn test_invalid_password() {
        let auth = make_auth();
        assert!(!auth.authenticate("c1", Some("admin"), Some(b"wrong")));
    }

    #[test]
    fn test_unknown_user() {
        let auth = make_auth();
        assert!(!auth.authenticate("c1", Some("nobody"), Some(b"secret")));
    }

    #[test]
    fn test_missing_credentials() {
        let auth = make_auth();
        assert!(!auth.authenticate("c1", None, None));
        assert!(!auth.authenticate("c1", Some("admin"), None));
    }
}

//! Role-based topic access control.
//!
//! Users authenticate against a static list and are assigned a role; ACL
//! rules bind roles to topic patterns with separate publish/subscribe
//! permissions. Patterns support MQTT wildcards plus `%c` (client id) and
//! `%u` (username) substitution.

use ahash::AHashMap;
use parking_lot::Mutex;

use super::{topic_matches_pattern, AuthProvider};
use crate::config::{AclConfig, AclRuleConfig};
use crate::packet::QoS;

struct AclUser {
    password: String,
    role: String,
}

/// Role-based ACL provider.
pub struct AclAuth {
    users: AHashMap<String, AclUser>,
    rules: Vec<AclRuleConfig>,
    /// client id -> (role, username) for connected clients.
    /// Populated on authenticate, cleared on cleanup_client.
    client_roles: Mutex<AHashMap<String, (String, String)>>,
}

impl AclAuth {
    pub fn from_config(config: &AclConfig) -> Self {
        let users = config
            .users
            .iter()
            .map(|u| {
                (
                    u.username.clone(),
                    AclUser {
                        password: u.password.clone(),
                        role: u.role.clone(),
                    },
                )
            })
            .collect();

        Self {
            users,
            rules: config.rules.clone(),
            client_roles: Mutex::new(AHashMap::new()),
        }
    }

    fn check(&self, client_id: &str, topic: &str, publish: bool) -> bool {
        let roles = self.client_roles.lock();
        let Some((role, username)) = roles.get(client_id) else {
            return false;
        };

        self.rules.iter().any(|rule| {
            if rule.role != *role {
                return false;
            }
            let allowed = if publish { rule.publish } else { rule.subscribe };
            if !allowed {
                return false;
            }
            let pattern = rule
                .pattern
                .replace("%c", client_id)
                .replace("%u", username);
            topic_matches_pattern(topic, &pattern)
        })
    }
}

impl AuthProvider for AclAuth {
    fn authenticate(
        &self,
        client_id: &str,
        username: Option<&str>,
        password: Option<&[u8]>,
    ) -> bool {
        let (Some(username), Some(password)) = (username, password) else {
            return false;
        };
        let Some(user) = self.users.get(username) else {
            return false;
        };
        if user.password.as_bytes() != password {
            return false;
        }
        self.client_roles.lock().insert(
            client_id.to_string(),
            (user.role.clone(), username.to_string()),
        );
        true
    }

    fn authorize_publish(&self, client_id: &str, topic: &str) -> bool {
        self.check(client_id, topic, true)
    }

    fn authorize_subscribe(&self, client_id: &str, filter: &str) -> Option<QoS> {
        if self.check(client_id, filter, false) {
            Some(QoS::ExactlyOnce)
        } else {
            None
        }
    }

    fn cleanup_client(&self, client_id: &str) {
        self.client_roles.lock().remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AclUserConfig;

    fn make_acl() -> AclAuth {
        AclAuth::from_config(&AclConfig {
            enabled: true,
            users: vec![
                AclUserConfig {
                    username: "dev1".into(),
                    password: "pw1".into(),
                    role: "device".into(),
                },
                AclUserConfig {
                    username: "op".into(),
                    password: "pw2".into(),
                    role: "admin".into(),
                },
            ],
            rules: vec![
                AclRuleConfig {
                    role: "device".into(),
                    pattern: "sensors/%c/#".into(),
                    publish: true,
                    subscribe: false,
                },
                AclRuleConfig {
                    role: "device".into(),
                    pattern: "commands/%c".into(),
                    publish: false,
                    subscribe: true,
                },
                AclRuleConfig {
                    role: "admin".into(),
                    pattern: "#".into(),
                    publish: true,
                    subscribe: true,
                },
            ],
        })
    }

    #[test]
    fn test_authenticate_assigns_role() {
        let acl = make_acl();
        assert!(acl.authenticate("d1", Some("dev1"), Some(b"pw1")));
        assert!(!acl.authenticate("d2", Some("dev1"), Some(b"bad")));
        assert!(!acl.authenticate("d3", Some("ghost"), Some(b"pw1")));
    }

    #[test]
    fn test_device_role_scoped_to_own_topics() {
        let acl = make_acl();
        acl.authenticate("d1", Some("dev1"), Some(b"pw1"));

        assert!(acl.authorize_publish("d1", "sensors/d1/temp"));
        assert!(!acl.authorize_publish("d1", "sensors/other/temp"));
        // Publish-only rule does not grant subscribe
        assert!(acl.authorize_subscribe("d1", "sensors/d1/temp").is_none());
        assert_eq!(
            acl.authorize_subscribe("d1", "commands/d1"),
            Some(QoS::ExactlyOnce)
        );
    }

    #[test]
    fn test_admin_role_unrestricted() {
        let acl = make_acl();
        acl.authenticate("a1", Some("op"), Some(b"pw2"));
        assert!(acl.authorize_publish("a1", "any/topic"));
        assert!(acl.authorize_subscribe("a1", "any/#").is_some());
    }

    #[test]
    fn test_unauthenticated_client_denied() {
        let acl = make_acl();
        assert!(!acl.authorize_publish("stranger", "sensors/x"));
        assert!(acl.authorize_subscribe("stranger", "#").is_none());
    }

    #[test]
    fn test_cleanup_client_drops_role() {
        let acl = make_acl();
        acl.authenticate("d1", Some("dev1"), Some(b"pw1"));
        assert!(acl.authorize_publish("d1", "sensors/d1/temp"));
        acl.cleanup_client("d1");
        assert!(!acl.authorize_publish("d1", "sensors/d1/temp"));
    }
}

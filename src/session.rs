//! Client session records and the session store.
//!
//! Sessions are keyed by client identifier and owned by the store; the
//! connection loop owns the sockets. The two sides reference each other by
//! identifier (client id one way, mio token the other), never by an owning
//! reference.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ahash::{AHashMap, AHashSet};
use bytes::Bytes;
use mio::Token;

use crate::packet::{QoS, Will};
use crate::qos::Outbound;

/// A message parked in a persistent session's offline/overflow queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
}

/// State for one MQTT client, surviving reconnects when
/// `clean_session = false`.
pub struct Session {
    pub client_id: String,
    pub clean_session: bool,
    /// Granted subscriptions: topic filter -> QoS.
    pub subscriptions: AHashMap<String, QoS>,
    /// Outbound QoS 1/2 inflight table and packet-id cursor.
    pub outbound: Outbound,
    /// Inbound QoS 2 packet ids received but not yet released by PUBREL.
    pub inflight_in: AHashSet<u16>,
    /// Messages waiting for delivery (offline, or inflight table full).
    pub offline_queue: VecDeque<QueuedMessage>,
    pub will: Option<Will>,
    pub username: Option<String>,
    pub keep_alive: u16,
    /// Token of the live connection; None while offline.
    pub connection: Option<Token>,
    /// Set when the connection drops on a persistent session, for expiry.
    pub disconnected_at: Option<Instant>,
}

impl Session {
    pub fn new(client_id: &str, clean_session: bool) -> Self {
        Self {
            client_id: client_id.to_string(),
            clean_session,
            subscriptions: AHashMap::new(),
            outbound: Outbound::new(),
            inflight_in: AHashSet::new(),
            offline_queue: VecDeque::new(),
            will: None,
            username: None,
            keep_alive: 0,
            connection: None,
            disconnected_at: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.connection.is_some()
    }

    /// Park a message in the offline/overflow queue, dropping the oldest
    /// entry when the queue is at capacity. Returns true if an old message
    /// was evicted.
    pub fn queue_message(&mut self, msg: QueuedMessage, max_queued: usize) -> bool {
        let mut evicted = false;
        if max_queued == 0 {
            return true;
        }
        while self.offline_queue.len() >= max_queued {
            self.offline_queue.pop_front();
            evicted = true;
        }
        self.offline_queue.push_back(msg);
        evicted
    }

    /// Take the queued messages for replay, in arrival order.
    pub fn drain_queued(&mut self) -> Vec<QueuedMessage> {
        self.offline_queue.drain(..).collect()
    }

    /// Record an inbound QoS 2 packet id. Returns true on first receipt;
    /// false means this is a duplicate and must not be routed again.
    pub fn register_inbound_qos2(&mut self, packet_id: u16) -> bool {
        self.inflight_in.insert(packet_id)
    }

    /// Release an inbound QoS 2 packet id on PUBREL.
    pub fn release_inbound_qos2(&mut self, packet_id: u16) -> bool {
        self.inflight_in.remove(&packet_id)
    }
}

/// What `create_or_takeover` found.
pub struct TakeoverResult {
    /// Token of a previous live connection that must be closed (no will).
    pub previous_connection: Option<Token>,
    /// Whether stored session state was resumed (CONNACK session-present).
    pub session_present: bool,
}

/// Mapping from client identifier to session record.
#[derive(Default)]
pub struct SessionStore {
    sessions: AHashMap<String, Session>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: AHashMap::new(),
        }
    }

    pub fn get(&self, client_id: &str) -> Option<&Session> {
        self.sessions.get(client_id)
    }

    pub fn get_mut(&mut self, client_id: &str) -> Option<&mut Session> {
        self.sessions.get_mut(client_id)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Session> {
        self.sessions.values_mut()
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.values().filter(|s| s.is_online()).count()
    }

    /// Establish a session for a connecting client, evicting any previous
    /// connection with the same identifier.
    ///
    /// With `clean_session = true` any stored state is discarded and
    /// `session_present` is false; otherwise a stored record is resumed.
    pub fn create_or_takeover(&mut self, client_id: &str, clean_session: bool) -> TakeoverResult {
        let previous_connection = self
            .sessions
            .get_mut(client_id)
            .and_then(|s| s.connection.take());

        if clean_session {
            self.sessions
                .insert(client_id.to_string(), Session::new(client_id, true));
            return TakeoverResult {
                previous_connection,
                session_present: false,
            };
        }

        if let Some(session) = self.sessions.get_mut(client_id) {
            session.clean_session = false;
            session.disconnected_at = None;
            TakeoverResult {
                previous_connection,
                session_present: true,
            }
        } else {
            self.sessions
                .insert(client_id.to_string(), Session::new(client_id, false));
            TakeoverResult {
                previous_connection,
                session_present: false,
            }
        }
    }

    /// Detach a session from its connection.
    ///
    /// Returns the will to publish (only on an ungraceful detach with a will
    /// set; the caller still consults the will-publish hook). Clean sessions
    /// are deleted; persistent ones stay with `disconnected_at` stamped.
    pub fn detach(&mut self, client_id: &str, graceful: bool, now: Instant) -> Option<Will> {
        let session = self.sessions.get_mut(client_id)?;
        session.connection = None;

        let will = if graceful {
            session.will = None;
            None
        } else {
            session.will.take()
        };

        if session.clean_session {
            self.sessions.remove(client_id);
        } else {
            session.disconnected_at = Some(now);
        }

        will
    }

    /// Delete offline persistent sessions older than `expiry`.
    /// Returns the identifiers removed so the caller can clean the topic tree.
    pub fn expire_offline(&mut self, now: Instant, expiry: Duration) -> Vec<String> {
        let expired: Vec<String> = self
            .sessions
            .values()
            .filter(|s| {
                !s.is_online()
                    && s.disconnected_at
                        .is_some_and(|at| now.duration_since(at) >= expiry)
            })
            .map(|s| s.client_id.clone())
            .collect();

        for client_id in &expired {
            self.sessions.remove(client_id);
        }
        expired
    }

    pub fn remove(&mut self, client_id: &str) -> Option<Session> {
        self.sessions.remove(client_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_session_discards_state() {
        let mut store = SessionStore::new();
        let result = store.create_or_takeover("c1", false);
        assert!(!result.session_present);
        store
            .get_mut("c1")
            .unwrap()
            .subscriptions
            .insert("a/b".into(), QoS::AtLeastOnce);

        // Reconnect with clean_session=true wipes the stored subscriptions
        let result = store.create_or_takeover("c1", true);
        assert!(!result.session_present);
        assert!(store.get("c1").unwrap().subscriptions.is_empty());
    }

    #[test]
    fn test_persistent_session_resumes() {
        let mut store = SessionStore::new();
        store.create_or_takeover("c1", false);
        store
            .get_mut("c1")
            .unwrap()
            .subscriptions
            .insert("a/b".into(), QoS::AtLeastOnce);
        store.detach("c1", true, Instant::now());

        let result = store.create_or_takeover("c1", false);
        assert!(result.session_present);
        assert_eq!(store.get("c1").unwrap().subscriptions.len(), 1);
    }

    #[test]
    fn test_takeover_returns_previous_connection() {
        let mut store = SessionStore::new();
        store.create_or_takeover("c1", false);
        store.get_mut("c1").unwrap().connection = Some(Token(7));

        let result = store.create_or_takeover("c1", false);
        assert_eq!(result.previous_connection, Some(Token(7)));
        assert!(result.session_present);
        assert!(store.get("c1").unwrap().connection.is_none());
    }

    #[test]
    fn test_graceful_detach_suppresses_will() {
        let mut store = SessionStore::new();
        store.create_or_takeover("c1", true);
        store.get_mut("c1").unwrap().will = Some(Will {
            topic: "goodbye".into(),
            payload: Bytes::from_static(b"bye"),
            qos: QoS::AtLeastOnce,
            retain: false,
        });

        assert!(store.detach("c1", true, Instant::now()).is_none());
        // Clean session record is gone after detach
        assert!(store.get("c1").is_none());
    }

    #[test]
    fn test_ungraceful_detach_returns_will() {
        let mut store = SessionStore::new();
        store.create_or_takeover("c1", false);
        store.get_mut("c1").unwrap().will = Some(Will {
            topic: "goodbye".into(),
            payload: Bytes::from_static(b"bye"),
            qos: QoS::AtLeastOnce,
            retain: false,
        });

        let will = store.detach("c1", false, Instant::now()).unwrap();
        assert_eq!(will.topic, "goodbye");
        // Persistent record survives, stamped for expiry
        let session = store.get("c1").unwrap();
        assert!(session.disconnected_at.is_some());
        assert!(session.will.is_none());
    }

    #[test]
    fn test_expire_offline() {
        let mut store = SessionStore::new();
        let now = Instant::now();
        store.create_or_takeover("old", false);
        store.create_or_takeover("fresh", false);
        store.create_or_takeover("online", false);
        store.get_mut("old").unwrap().disconnected_at = Some(now);
        store.get_mut("fresh").unwrap().disconnected_at = Some(now + Duration::from_secs(7000));
        store.get_mut("online").unwrap().connection = Some(Token(1));

        let expired = store.expire_offline(now + Duration::from_secs(7200), Duration::from_secs(3600));
        assert_eq!(expired, vec!["old".to_string()]);
        assert!(store.get("old").is_none());
        assert!(store.get("fresh").is_some());
        assert!(store.get("online").is_some());
    }

    #[test]
    fn test_offline_queue_drops_oldest() {
        let mut session = Session::new("c1", false);
        for i in 0..5 {
            session.queue_message(
                QueuedMessage {
                    topic: format!("t/{}", i),
                    payload: Bytes::new(),
                    qos: QoS::AtLeastOnce,
                },
                3,
            );
        }
        let queued = session.drain_queued();
        let topics: Vec<&str> = queued.iter().map(|m| m.topic.as_str()).collect();
        assert_eq!(topics, ["t/2", "t/3", "t/4"]);
        assert!(session.offline_queue.is_empty());
    }

    #[test]
    fn test_inbound_qos2_dedup() {
        let mut session = Session::new("c1", true);
        assert!(session.register_inbound_qos2(7));
        // Duplicate receipt is flagged
        assert!(!session.register_inbound_qos2(7));
        assert!(session.release_inbound_qos2(7));
        // Release without state still succeeds at the engine level
        assert!(!session.release_inbound_qos2(7));
        // After release the id can be reused
        assert!(session.register_inbound_qos2(7));
    }
}

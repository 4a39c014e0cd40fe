//! Message routing: interceptor pipeline, retained write-through, and
//! fan-out to matching sessions.
//!
//! The router decides *what* every recipient gets (effective QoS, tracked
//! inflight entry, offline queueing) and returns the frames to transmit,
//! addressed by connection token. Socket writes stay in the broker's event
//! loop, which keeps this module free of I/O and easy to test.

use std::time::Instant;

use bytes::Bytes;
use mio::Token;

use crate::config::Config;
use crate::hooks::{guarded, Interceptor};
use crate::packet::{Packet, Publish, QoS};
use crate::session::{QueuedMessage, SessionStore};
use crate::topic::TopicTree;

/// Mutable view of a message passed through the interceptor pipeline.
pub struct MessageContext {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Publishing client, or None for broker-origin messages.
    pub sender_id: Option<String>,
    dropped: bool,
}

impl MessageContext {
    pub fn new(
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        sender_id: Option<String>,
    ) -> Self {
        Self {
            topic,
            payload,
            qos,
            retain,
            sender_id,
            dropped: false,
        }
    }

    /// Drop this message: it will not be retained or routed.
    pub fn discard(&mut self) {
        self.dropped = true;
    }

    pub fn is_dropped(&self) -> bool {
        self.dropped
    }
}

/// Result of routing one message.
pub struct RouteOutcome {
    /// PUBLISH frames to write, addressed by connection token.
    pub frames: Vec<(Token, Packet)>,
    /// Recipients whose message went to an offline/overflow queue.
    pub queued: usize,
    /// The message as the interceptors left it (for the publish hook).
    pub message: MessageContext,
}

/// Routes messages through interceptors, the retained store, and the
/// subscription tree into per-session QoS deliveries.
pub struct Router {
    interceptors: Vec<Box<dyn Interceptor>>,
}

impl Router {
    pub fn new(interceptors: Vec<Box<dyn Interceptor>>) -> Self {
        Self { interceptors }
    }

    /// Append an interceptor; the pipeline runs in registration order.
    pub fn add(&mut self, interceptor: Box<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    /// Route a message to every matching subscriber.
    ///
    /// Returns None when an interceptor dropped the message. The publisher
    /// never receives its own message back.
    pub fn route(
        &self,
        sessions: &mut SessionStore,
        tree: &mut TopicTree,
        config: &Config,
        mut ctx: MessageContext,
        now: Instant,
    ) -> Option<RouteOutcome> {
        for interceptor in &self.interceptors {
            guarded("interceptor", (), || interceptor.intercept(&mut ctx));
            if ctx.is_dropped() {
                return None;
            }
        }

        if ctx.retain && config.mqtt.retain_enabled {
            tree.set_retained(
                &ctx.topic,
                ctx.payload.clone(),
                ctx.qos,
                config.limits.max_retained_messages,
            );
        }

        let mut frames = Vec::new();
        let mut queued = 0;

        for (client_id, granted_qos) in tree.matches(&ctx.topic) {
            // No echo back to the publisher
            if ctx.sender_id.as_deref() == Some(client_id.as_str()) {
                continue;
            }

            let Some(session) = sessions.get_mut(&client_id) else {
                continue;
            };

            let effective_qos = ctx.qos.min(granted_qos);

            match session.connection {
                Some(token) => {
                    if effective_qos == QoS::AtMostOnce {
                        frames.push((
                            token,
                            Packet::Publish(Publish {
                                dup: false,
                                qos: QoS::AtMostOnce,
                                retain: false,
                                topic: ctx.topic.clone(),
                                packet_id: None,
                                payload: ctx.payload.clone(),
                            }),
                        ));
                    } else if session.outbound.len() >= config.limits.max_inflight {
                        // Inflight table full: park in the overflow queue
                        session.queue_message(
                            QueuedMessage {
                                topic: ctx.topic.clone(),
                                payload: ctx.payload.clone(),
                                qos: effective_qos,
                            },
                            config.limits.max_queued_messages,
                        );
                        queued += 1;
                    } else {
                        match session.outbound.start(
                            &ctx.topic,
                            ctx.payload.clone(),
                            effective_qos,
                            false,
                            now,
                        ) {
                            Some(publish) => frames.push((token, Packet::Publish(publish))),
                            None => {
                                session.queue_message(
                                    QueuedMessage {
                                        topic: ctx.topic.clone(),
                                        payload: ctx.payload.clone(),
                                        qos: effective_qos,
                                    },
                                    config.limits.max_queued_messages,
                                );
                                queued += 1;
                            }
                        }
                    }
                }
                None => {
                    // Offline: queue for persistent sessions, QoS 0 never queued
                    if !session.clean_session && effective_qos != QoS::AtMostOnce {
                        session.queue_message(
                            QueuedMessage {
                                topic: ctx.topic.clone(),
                                payload: ctx.payload.clone(),
                                qos: effective_qos,
                            },
                            config.limits.max_queued_messages,
                        );
                        queued += 1;
                    }
                }
            }
        }

        Some(RouteOutcome {
            frames,
            queued,
            message: ctx,
        })
    }

    /// Deliver retained messages matching a freshly granted subscription.
    /// The retain flag is set on every frame; QoS is capped by the grant.
    pub fn deliver_retained(
        &self,
        sessions: &mut SessionStore,
        tree: &TopicTree,
        config: &Config,
        client_id: &str,
        filter: &str,
        granted_qos: QoS,
        now: Instant,
    ) -> Vec<(Token, Packet)> {
        if !config.mqtt.retain_enabled {
            return Vec::new();
        }
        let Some(session) = sessions.get_mut(client_id) else {
            return Vec::new();
        };
        let Some(token) = session.connection else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        for retained in tree.matching_retained(filter) {
            let effective_qos = retained.qos.min(granted_qos);
            if effective_qos == QoS::AtMostOnce {
                frames.push((
                    token,
                    Packet::Publish(Publish {
                        dup: false,
                        qos: QoS::AtMostOnce,
                        retain: true,
                        topic: retained.topic,
                        packet_id: None,
                        payload: retained.payload,
                    }),
                ));
            } else if session.outbound.len() < config.limits.max_inflight {
                if let Some(publish) = session.outbound.start(
                    &retained.topic,
                    retained.payload,
                    effective_qos,
                    true,
                    now,
                ) {
                    frames.push((token, Packet::Publish(publish)));
                }
            } else {
                session.queue_message(
                    QueuedMessage {
                        topic: retained.topic,
                        payload: retained.payload,
                        qos: effective_qos,
                    },
                    config.limits.max_queued_messages,
                );
            }
        }
        frames
    }

    /// Replay a reconnected session's queued messages in arrival order.
    /// Stops early when the inflight table fills; the remainder stays queued.
    pub fn deliver_queued(
        &self,
        sessions: &mut SessionStore,
        config: &Config,
        client_id: &str,
        now: Instant,
    ) -> Vec<(Token, Packet)> {
        let Some(session) = sessions.get_mut(client_id) else {
            return Vec::new();
        };
        let Some(token) = session.connection else {
            return Vec::new();
        };

        let mut frames = Vec::new();
        while let Some(msg) = session.offline_queue.pop_front() {
            if msg.qos == QoS::AtMostOnce {
                frames.push((
                    token,
                    Packet::Publish(Publish {
                        dup: false,
                        qos: QoS::AtMostOnce,
                        retain: false,
                        topic: msg.topic,
                        packet_id: None,
                        payload: msg.payload,
                    }),
                ));
                continue;
            }
            if session.outbound.len() >= config.limits.max_inflight {
                session.offline_queue.push_front(msg);
                break;
            }
            match session
                .outbound
                .start(&msg.topic, msg.payload.clone(), msg.qos, false, now)
            {
                Some(publish) => frames.push((token, Packet::Publish(publish))),
                None => {
                    session.offline_queue.push_front(msg);
                    break;
                }
            }
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn setup() -> (Router, SessionStore, TopicTree, Config) {
        (
            Router::new(Vec::new()),
            SessionStore::new(),
            TopicTree::new(),
            Config::default(),
        )
    }

    fn online_session(store: &mut SessionStore, client_id: &str, token: usize) {
        store.create_or_takeover(client_id, false);
        store.get_mut(client_id).unwrap().connection = Some(Token(token));
    }

    fn ctx(topic: &str, payload: &'static [u8], qos: QoS, retain: bool) -> MessageContext {
        MessageContext::new(
            topic.into(),
            Bytes::from_static(payload),
            qos,
            retain,
            Some("publisher".into()),
        )
    }

    fn publish_of(frame: &(Token, Packet)) -> &Publish {
        match &frame.1 {
            Packet::Publish(p) => p,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }

    #[test]
    fn test_route_to_matching_subscriber_effective_qos() {
        let (router, mut sessions, mut tree, config) = setup();
        online_session(&mut sessions, "sub", 5);
        tree.subscribe("sensors/+/temp", "sub", QoS::AtLeastOnce);

        let outcome = router
            .route(
                &mut sessions,
                &mut tree,
                &config,
                ctx("sensors/room1/temp", b"22.5", QoS::ExactlyOnce, false),
                Instant::now(),
            )
            .unwrap();

        assert_eq!(outcome.frames.len(), 1);
        let publish = publish_of(&outcome.frames[0]);
        assert_eq!(outcome.frames[0].0, Token(5));
        // min(publish 2, granted 1) = 1
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert!(publish.packet_id.is_some());
        assert!(!publish.retain);
        assert_eq!(sessions.get("sub").unwrap().outbound.len(), 1);
    }

    #[test]
    fn test_no_echo_to_sender() {
        let (router, mut sessions, mut tree, config) = setup();
        online_session(&mut sessions, "publisher", 1);
        tree.subscribe("loop/topic", "publisher", QoS::AtMostOnce);

        let outcome = router
            .route(
                &mut sessions,
                &mut tree,
                &config,
                ctx("loop/topic", b"x", QoS::AtMostOnce, false),
                Instant::now(),
            )
            .unwrap();
        assert!(outcome.frames.is_empty());
    }

    #[test]
    fn test_offline_persistent_session_queues_qos1() {
        let (router, mut sessions, mut tree, config) = setup();
        sessions.create_or_takeover("offline", false);
        tree.subscribe("alerts/#", "offline", QoS::AtLeastOnce);

        let outcome = router
            .route(
                &mut sessions,
                &mut tree,
                &config,
                ctx("alerts/fire", b"!", QoS::AtLeastOnce, false),
                Instant::now(),
            )
            .unwrap();

        assert!(outcome.frames.is_empty());
        assert_eq!(outcome.queued, 1);
        assert_eq!(sessions.get("offline").unwrap().offline_queue.len(), 1);
    }

    #[test]
    fn test_offline_qos0_never_queued() {
        let (router, mut sessions, mut tree, config) = setup();
        sessions.create_or_takeover("offline", false);
        tree.subscribe("alerts/#", "offline", QoS::AtLeastOnce);

        let outcome = router
            .route(
                &mut sessions,
                &mut tree,
                &config,
                ctx("alerts/fire", b"!", QoS::AtMostOnce, false),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(outcome.queued, 0);
        assert!(sessions.get("offline").unwrap().offline_queue.is_empty());
    }

    #[test]
    fn test_inflight_full_overflows_to_queue() {
        let (router, mut sessions, mut tree, mut config) = setup();
        config.limits.max_inflight = 1;
        online_session(&mut sessions, "slow", 2);
        tree.subscribe("data", "slow", QoS::AtLeastOnce);

        let now = Instant::now();
        let first = router
            .route(
                &mut sessions,
                &mut tree,
                &config,
                ctx("data", b"1", QoS::AtLeastOnce, false),
                now,
            )
            .unwrap();
        assert_eq!(first.frames.len(), 1);

        let second = router
            .route(
                &mut sessions,
                &mut tree,
                &config,
                ctx("data", b"2", QoS::AtLeastOnce, false),
                now,
            )
            .unwrap();
        assert!(second.frames.is_empty());
        assert_eq!(second.queued, 1);
    }

    #[test]
    fn test_retain_write_and_clear() {
        let (router, mut sessions, mut tree, config) = setup();

        router
            .route(
                &mut sessions,
                &mut tree,
                &config,
                ctx("status/d1", b"online", QoS::AtLeastOnce, true),
                Instant::now(),
            )
            .unwrap();
        assert!(tree.get_retained("status/d1").is_some());

        // Empty retained payload clears the entry
        router
            .route(
                &mut sessions,
                &mut tree,
                &config,
                ctx("status/d1", b"", QoS::AtMostOnce, true),
                Instant::now(),
            )
            .unwrap();
        assert!(tree.get_retained("status/d1").is_none());
    }

    #[test]
    fn test_retain_disabled_skips_store() {
        let (router, mut sessions, mut tree, mut config) = setup();
        config.mqtt.retain_enabled = false;

        router
            .route(
                &mut sessions,
                &mut tree,
                &config,
                ctx("status/d1", b"online", QoS::AtMostOnce, true),
                Instant::now(),
            )
            .unwrap();
        assert!(tree.get_retained("status/d1").is_none());
    }

    #[test]
    fn test_interceptor_can_drop_and_rewrite() {
        let (_, mut sessions, mut tree, config) = setup();
        online_session(&mut sessions, "sub", 3);
        tree.subscribe("rewritten", "sub", QoS::AtMostOnce);

        let router = Router::new(vec![
            Box::new(|ctx: &mut MessageContext| {
                if ctx.topic == "secret" {
                    ctx.discard();
                }
            }) as Box<dyn Interceptor>,
            Box::new(|ctx: &mut MessageContext| {
                ctx.topic = "rewritten".into();
            }),
        ]);

        assert!(router
            .route(
                &mut sessions,
                &mut tree,
                &config,
                ctx("secret", b"x", QoS::AtMostOnce, false),
                Instant::now(),
            )
            .is_none());

        let outcome = router
            .route(
                &mut sessions,
                &mut tree,
                &config,
                ctx("original", b"x", QoS::AtMostOnce, false),
                Instant::now(),
            )
            .unwrap();
        assert_eq!(outcome.frames.len(), 1);
        assert_eq!(publish_of(&outcome.frames[0]).topic, "rewritten");
    }

    #[test]
    fn test_deliver_retained_sets_retain_flag() {
        let (router, mut sessions, mut tree, config) = setup();
        online_session(&mut sessions, "sub", 4);
        tree.set_retained("status/d1", Bytes::from_static(b"online"), QoS::AtLeastOnce, 100);

        let frames = router.deliver_retained(
            &mut sessions,
            &tree,
            &config,
            "sub",
            "status/+",
            QoS::ExactlyOnce,
            Instant::now(),
        );

        assert_eq!(frames.len(), 1);
        let publish = publish_of(&frames[0]);
        assert!(publish.retain);
        // min(retained 1, granted 2) = 1
        assert_eq!(publish.qos, QoS::AtLeastOnce);
        assert_eq!(publish.payload, Bytes::from_static(b"online"));
    }

    #[test]
    fn test_deliver_queued_in_order() {
        let (router, mut sessions, _, config) = setup();
        let mut session = Session::new("c1", false);
        session.connection = Some(Token(9));
        for i in 0..3 {
            session.queue_message(
                QueuedMessage {
                    topic: format!("t/{}", i),
                    payload: Bytes::from_static(b"m"),
                    qos: QoS::AtLeastOnce,
                },
                50,
            );
        }
        sessions.create_or_takeover("c1", false);
        *sessions.get_mut("c1").unwrap() = session;

        let frames = router.deliver_queued(&mut sessions, &config, "c1", Instant::now());
        let topics: Vec<String> = frames.iter().map(|f| publish_of(f).topic.clone()).collect();
        assert_eq!(topics, ["t/0", "t/1", "t/2"]);
        assert_eq!(sessions.get("c1").unwrap().outbound.len(), 3);
    }
}

//! Outbound QoS 1/2 state machines and packet-id allocation.
//!
//! Each session owns one [`Outbound`] table for broker-to-client deliveries.
//! Entries keep insertion order so reconnect replay preserves the original
//! send order. The table is small (bounded by `max_inflight`), so linear
//! scans beat a map here.

use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::packet::{Packet, Publish, QoS};

/// Where an outbound QoS >= 1 delivery sits in its handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundState {
    /// QoS 1 PUBLISH sent, waiting for PUBACK.
    AwaitPuback,
    /// QoS 2 PUBLISH sent, waiting for PUBREC.
    AwaitPubrec,
    /// PUBREL sent, waiting for PUBCOMP.
    AwaitPubcomp,
}

/// One in-flight outbound delivery.
#[derive(Debug, Clone)]
pub struct OutflightEntry {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    /// Retain flag of the delivery frame (set for retained-on-subscribe).
    pub retain: bool,
    pub state: OutboundState,
    pub last_sent_at: Instant,
    /// Send attempts of the currently outstanding frame, including the first.
    pub attempts: u32,
}

/// Per-session outbound inflight table plus the packet-id cursor.
#[derive(Debug, Default, Clone)]
pub struct Outbound {
    /// Insertion-ordered inflight entries, keyed by packet id.
    entries: Vec<(u16, OutflightEntry)>,
    /// Rolling cursor over 1..=65535; 0 is never a valid packet id.
    next_packet_id: u16,
}

impl Outbound {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_packet_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, packet_id: u16) -> bool {
        self.entries.iter().any(|(id, _)| *id == packet_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u16, &OutflightEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    /// Allocate the next free packet id, skipping ids still inflight.
    /// Returns None when every id is taken (the table is saturated).
    fn allocate_packet_id(&mut self) -> Option<u16> {
        if self.entries.len() >= u16::MAX as usize {
            return None;
        }
        loop {
            self.next_packet_id = if self.next_packet_id == u16::MAX {
                1
            } else {
                self.next_packet_id + 1
            };
            if !self.contains(self.next_packet_id) {
                return Some(self.next_packet_id);
            }
        }
    }

    /// Begin a QoS 1/2 delivery: allocate an id, record the entry, and
    /// return the PUBLISH frame to send. Returns None when no packet id is
    /// free; the caller queues the message instead.
    pub fn start(
        &mut self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        now: Instant,
    ) -> Option<Publish> {
        debug_assert!(qos != QoS::AtMostOnce);
        let packet_id = self.allocate_packet_id()?;

        let state = match qos {
            QoS::AtLeastOnce => OutboundState::AwaitPuback,
            _ => OutboundState::AwaitPubrec,
        };
        self.entries.push((
            packet_id,
            OutflightEntry {
                topic: topic.to_string(),
                payload: payload.clone(),
                qos,
                retain,
                state,
                last_sent_at: now,
                attempts: 1,
            },
        ));

        Some(Publish {
            dup: false,
            qos,
            retain,
            topic: topic.to_string(),
            packet_id: Some(packet_id),
            payload,
        })
    }

    /// PUBACK received: complete a QoS 1 delivery. Returns true if the
    /// packet id matched an entry awaiting PUBACK.
    pub fn handle_puback(&mut self, packet_id: u16) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|(id, e)| !(*id == packet_id && e.state == OutboundState::AwaitPuback));
        self.entries.len() != before
    }

    /// PUBREC received: advance a QoS 2 delivery to AwaitPubcomp. Returns
    /// the PUBREL frame to send, or None if the id is unknown. The PUBREL
    /// gets a fresh retry budget.
    pub fn handle_pubrec(&mut self, packet_id: u16, now: Instant) -> Option<Packet> {
        let entry = self
            .entries
            .iter_mut()
            .find(|(id, e)| *id == packet_id && e.state == OutboundState::AwaitPubrec)?;
        entry.1.state = OutboundState::AwaitPubcomp;
        entry.1.last_sent_at = now;
        entry.1.attempts = 1;
        Some(Packet::Pubrel { packet_id })
    }

    /// PUBCOMP received: complete a QoS 2 delivery.
    pub fn handle_pubcomp(&mut self, packet_id: u16) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|(id, e)| !(*id == packet_id && e.state == OutboundState::AwaitPubcomp));
        self.entries.len() != before
    }

    /// Collect retransmissions that are due, dropping entries whose frame
    /// has already been sent `max_retries + 1` times.
    ///
    /// PUBLISH retransmissions carry DUP=1; PUBREL has no DUP flag.
    pub fn retransmit_due(
        &mut self,
        now: Instant,
        retry_interval: Duration,
        max_retries: u32,
    ) -> (Vec<Packet>, Vec<u16>) {
        let mut frames = Vec::new();
        let mut dropped = Vec::new();

        self.entries.retain_mut(|(packet_id, entry)| {
            if now.duration_since(entry.last_sent_at) < retry_interval {
                return true;
            }
            if entry.attempts > max_retries {
                dropped.push(*packet_id);
                return false;
            }
            let frame = match entry.state {
                OutboundState::AwaitPuback | OutboundState::AwaitPubrec => {
                    Packet::Publish(Publish {
                        dup: true,
                        qos: entry.qos,
                        retain: entry.retain,
                        topic: entry.topic.clone(),
                        packet_id: Some(*packet_id),
                        payload: entry.payload.clone(),
                    })
                }
                OutboundState::AwaitPubcomp => Packet::Pubrel {
                    packet_id: *packet_id,
                },
            };
            frames.push(frame);
            entry.attempts += 1;
            entry.last_sent_at = now;
            true
        });

        (frames, dropped)
    }

    /// Re-send every inflight frame after a persistent-session reconnect
    /// (MQTT-4.4.0-1), in the original send order. Each entry gets a fresh
    /// retry budget on the new connection.
    pub fn replay_all(&mut self, now: Instant) -> Vec<Packet> {
        let mut frames = Vec::with_capacity(self.entries.len());
        for (packet_id, entry) in self.entries.iter_mut() {
            entry.last_sent_at = now;
            entry.attempts = 1;
            let frame = match entry.state {
                OutboundState::AwaitPuback | OutboundState::AwaitPubrec => {
                    Packet::Publish(Publish {
                        dup: true,
                        qos: entry.qos,
                        retain: entry.retain,
                        topic: entry.topic.clone(),
                        packet_id: Some(*packet_id),
                        payload: entry.payload.clone(),
                    })
                }
                OutboundState::AwaitPubcomp => Packet::Pubrel {
                    packet_id: *packet_id,
                },
            };
            frames.push(frame);
        }
        frames
    }
}

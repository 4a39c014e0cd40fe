//! Broker statistics, `$SYS` topic generation, and the memory guard.
//!
//! Counters are atomics so the management handle can snapshot them from
//! another thread while the event loop keeps counting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::session::SessionStore;

/// `$SYS` topic names.
pub mod topics {
    pub const VERSION: &str = "$SYS/broker/version";
    pub const UPTIME: &str = "$SYS/broker/uptime";
    pub const CLIENTS_CONNECTED: &str = "$SYS/broker/clients/connected";
    pub const CLIENTS_TOTAL: &str = "$SYS/broker/clients/total";
    pub const MESSAGES_RECEIVED: &str = "$SYS/broker/messages/received";
    pub const MESSAGES_SENT: &str = "$SYS/broker/messages/sent";
    pub const PUBLISH_RECEIVED: &str = "$SYS/broker/messages/publish/received";
    pub const PUBLISH_SENT: &str = "$SYS/broker/messages/publish/sent";
    pub const BYTES_RECEIVED: &str = "$SYS/broker/bytes/received";
    pub const BYTES_SENT: &str = "$SYS/broker/bytes/sent";
    pub const SUBSCRIPTIONS_COUNT: &str = "$SYS/broker/subscriptions/count";
    pub const RETAINED_COUNT: &str = "$SYS/broker/messages/retained/count";
    pub const LOAD_CONNECTIONS: &str = "$SYS/broker/load/connections";
    pub const HEAP_FREE: &str = "$SYS/broker/heap/free";
    pub const HEAP_USED: &str = "$SYS/broker/heap/used";
}

/// Global broker counters, updated on the hot path.
#[derive(Default)]
pub struct BrokerMetrics {
    pub messages_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub publishes_received: AtomicU64,
    pub publishes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub connections_total: AtomicU64,
}

impl BrokerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add_messages_received(&self, n: u64) {
        self.messages_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_messages_sent(&self, n: u64) {
        self.messages_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_publishes_received(&self, n: u64) {
        self.publishes_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_publishes_sent(&self, n: u64) {
        self.publishes_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_bytes_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time statistics snapshot for management queries.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub clients_connected: usize,
    pub clients_total: usize,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub publishes_received: u64,
    pub publishes_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connections_total: u64,
    pub subscriptions: usize,
    pub retained_messages: usize,
}

/// Builds the `$SYS` topic set each stats interval.
pub struct SysPublisher {
    started_at: Instant,
    window_start: Instant,
    window_base: u64,
    connection_rate: u64,
}

impl SysPublisher {
    pub fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            window_start: now,
            window_base: 0,
            connection_rate: 0,
        }
    }

    /// Connections per minute, sampled over rolling 60 s windows.
    fn update_connection_rate(&mut self, connections_total: u64, now: Instant) -> u64 {
        if now.duration_since(self.window_start) >= Duration::from_secs(60) {
            self.connection_rate = connections_total.saturating_sub(self.window_base);
            self.window_base = connections_total;
            self.window_start = now;
        }
        self.connection_rate
    }

    /// Produce the `$SYS` topic/value pairs for this interval.
    pub fn topics(
        &mut self,
        metrics: &BrokerMetrics,
        clients_connected: usize,
        clients_total: usize,
        subscriptions: usize,
        retained: usize,
        now: Instant,
    ) -> Vec<(String, String)> {
        let connections_total = metrics.connections_total.load(Ordering::Relaxed);
        let rate = self.update_connection_rate(connections_total, now);

        let mut out = vec![
            (
                topics::VERSION.to_string(),
                format!("apiary {}", env!("CARGO_PKG_VERSION")),
            ),
            (
                topics::UPTIME.to_string(),
                now.duration_since(self.started_at).as_secs().to_string(),
            ),
            (
                topics::CLIENTS_CONNECTED.to_string(),
                clients_connected.to_string(),
            ),
            (topics::CLIENTS_TOTAL.to_string(), clients_total.to_string()),
            (
                topics::MESSAGES_RECEIVED.to_string(),
                metrics.messages_received.load(Ordering::Relaxed).to_string(),
            ),
            (
                topics::MESSAGES_SENT.to_string(),
                metrics.messages_sent.load(Ordering::Relaxed).to_string(),
            ),
            (
                topics::PUBLISH_RECEIVED.to_string(),
                metrics
                    .publishes_received
                    .load(Ordering::Relaxed)
                    .to_string(),
            ),
            (
                topics::PUBLISH_SENT.to_string(),
                metrics.publishes_sent.load(Ordering::Relaxed).to_string(),
            ),
            (
                topics::BYTES_RECEIVED.to_string(),
                metrics.bytes_received.load(Ordering::Relaxed).to_string(),
            ),
            (
                topics::BYTES_SENT.to_string(),
                metrics.bytes_sent.load(Ordering::Relaxed).to_string(),
            ),
            (
                topics::SUBSCRIPTIONS_COUNT.to_string(),
                subscriptions.to_string(),
            ),
            (topics::RETAINED_COUNT.to_string(), retained.to_string()),
            (topics::LOAD_CONNECTIONS.to_string(), rate.to_string()),
        ];

        if let Some(free) = free_memory() {
            out.push((topics::HEAP_FREE.to_string(), free.to_string()));
        }
        if let Some(used) = used_memory() {
            out.push((topics::HEAP_USED.to_string(), used.to_string()));
        }

        out
    }
}

/// Free-memory thresholds for the platform-conditional memory scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLevel {
    Ok,
    /// Below the low watermark: queues get trimmed.
    Low,
    /// Below the critical watermark: new connections are refused.
    Critical,
}

/// Watches available memory and sheds load when it runs short.
/// On platforms without a readable memory figure every check reports Ok.
pub struct MemoryGuard {
    low_watermark: u64,
    critical_watermark: u64,
}

impl MemoryGuard {
    /// Defaults: low at 8 MiB available, critical at 4 MiB.
    pub fn new() -> Self {
        Self {
            low_watermark: 8 * 1024 * 1024,
            critical_watermark: 4 * 1024 * 1024,
        }
    }

    pub fn check(&self) -> MemoryLevel {
        let Some(free) = free_memory() else {
            return MemoryLevel::Ok;
        };
        if free < self.critical_watermark {
            MemoryLevel::Critical
        } else if free < self.low_watermark {
            MemoryLevel::Low
        } else {
            MemoryLevel::Ok
        }
    }

    /// Shrink per-session queues to relieve memory pressure.
    pub fn trim_queues(&self, sessions: &mut SessionStore) {
        const KEEP: usize = 10;
        for session in sessions.iter_mut() {
            while session.offline_queue.len() > KEEP {
                session.offline_queue.pop_front();
            }
        }
    }
}

impl Default for MemoryGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Available memory in bytes, if the platform exposes it.
#[cfg(target_os = "linux")]
pub fn free_memory() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn free_memory() -> Option<u64> {
    None
}

/// Resident set size in bytes, if the platform exposes it.
#[cfg(target_os = "linux")]
pub fn used_memory() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
pub fn used_memory() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sys_topics_cover_required_set() {
        let metrics = BrokerMetrics::new();
        metrics.add_messages_received(5);
        metrics.add_publishes_sent(2);
        metrics.record_connection();

        let now = Instant::now();
        let mut publisher = SysPublisher::new(now);
        let topics = publisher.topics(&metrics, 3, 7, 11, 2, now + Duration::from_secs(90));

        let find = |name: &str| {
            topics
                .iter()
                .find(|(t, _)| t == name)
                .map(|(_, v)| v.clone())
        };

        assert!(find(topics::VERSION).unwrap().starts_with("apiary "));
        assert_eq!(find(topics::UPTIME).unwrap(), "90");
        assert_eq!(find(topics::CLIENTS_CONNECTED).unwrap(), "3");
        assert_eq!(find(topics::CLIENTS_TOTAL).unwrap(), "7");
        assert_eq!(find(topics::MESSAGES_RECEIVED).unwrap(), "5");
        assert_eq!(find(topics::PUBLISH_SENT).unwrap(), "2");
        assert_eq!(find(topics::SUBSCRIPTIONS_COUNT).unwrap(), "11");
        assert_eq!(find(topics::RETAINED_COUNT).unwrap(), "2");
        assert!(find(topics::LOAD_CONNECTIONS).is_some());
    }

    #[test]
    fn test_connection_rate_window() {
        let t0 = Instant::now();
        let mut publisher = SysPublisher::new(t0);
        // Inside the first window the rate stays at its initial value
        assert_eq!(publisher.update_connection_rate(5, t0 + Duration::from_secs(30)), 0);
        // Window rolls over: rate is the delta since the window base
        assert_eq!(publisher.update_connection_rate(5, t0 + Duration::from_secs(61)), 5);
        assert_eq!(publisher.update_connection_rate(8, t0 + Duration::from_secs(122)), 3);
    }

    #[test]
    fn test_memory_guard_trim() {
        use crate::packet::QoS;
        use crate::session::QueuedMessage;
        use bytes::Bytes;

        let mut sessions = SessionStore::new();
        sessions.create_or_takeover("c1", false);
        let session = sessions.get_mut("c1").unwrap();
        for i in 0..40 {
            session.queue_message(
                QueuedMessage {
                    topic: format!("t/{}", i),
                    payload: Bytes::new(),
                    qos: QoS::AtLeastOnce,
                },
                50,
            );
        }

        MemoryGuard::new().trim_queues(&mut sessions);
        let queue = &sessions.get("c1").unwrap().offline_queue;
        assert_eq!(queue.len(), 10);
        // The newest messages survive
        assert_eq!(queue.back().unwrap().topic, "t/39");
        assert_eq!(queue.front().unwrap().topic, "t/30");
    }
}

//! apiary - a native MQTT 3.1.1 broker for constrained single-node
//! deployments (edge gateways, IoT hubs).
//!
//! The broker accepts concurrent TCP sessions, speaks bit-exact MQTT 3.1.1,
//! routes PUBLISH messages through a wildcard-aware subscription tree,
//! enforces QoS 0/1/2 with retransmission and duplicate suppression, keeps
//! persistent sessions across reconnects, stores retained messages, and
//! publishes wills on ungraceful disconnects. Authentication, authorization,
//! lifecycle hooks, and message interceptors are pluggable.
//!
//! Everything runs on a single event-loop thread; a cloneable
//! [`BrokerHandle`] provides management queries and commands from outside.
//!
//! ```no_run
//! use apiary::{Broker, Config};
//!
//! let mut broker = Broker::new(Config::default()).unwrap();
//! let handle = broker.handle();
//! std::thread::spawn(move || broker.run().unwrap());
//! // ... later:
//! handle.shutdown();
//! ```

pub mod auth;
pub mod broker;
pub mod config;
mod conn;
pub mod error;
pub mod hooks;
pub mod packet;
pub mod qos;
pub mod router;
pub mod session;
pub mod stats;
pub mod topic;

pub use broker::{Broker, BrokerHandle, ClientSnapshot};
pub use config::Config;
pub use error::{Error, ProtocolError, Result};
pub use hooks::{Hooks, Interceptor, SubscribeOutcome};
pub use packet::QoS;
pub use router::MessageContext;

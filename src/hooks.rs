//! Lifecycle hooks and the message interceptor pipeline.
//!
//! Hooks observe or veto broker events; interceptors rewrite or drop
//! messages before routing. Both run synchronously on the event loop, so
//! implementations must return quickly. A panicking callback is caught,
//! logged, and treated as a no-op; it never takes the connection down.

use bytes::Bytes;

use crate::packet::QoS;
use crate::router::MessageContext;

/// Decision returned by [`Hooks::on_subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Grant the subscription at this QoS (may differ from the request).
    Grant(QoS),
    /// Refuse the filter; the SUBACK carries 0x80 for it.
    Reject,
}

/// Broker lifecycle callbacks. Every method has a permissive default, so
/// implementors override only what they need.
pub trait Hooks: Send {
    /// Fired before CONNACK. Returning false rejects the client with
    /// CONNACK 0x05 (not authorized).
    fn on_connect(
        &self,
        _client_id: &str,
        _username: Option<&str>,
        _will_topic: Option<&str>,
    ) -> bool {
        true
    }

    /// Fired for each accepted PUBLISH after interceptors ran, only when the
    /// message was not dropped. `client_id` is None for broker-origin
    /// messages ($SYS, management publishes).
    fn on_publish(
        &self,
        _client_id: Option<&str>,
        _topic: &str,
        _payload: &Bytes,
        _qos: QoS,
        _retain: bool,
    ) {
    }

    /// Fired per filter in a SUBSCRIBE. The returned outcome overrides the
    /// granted QoS or rejects the filter.
    fn on_subscribe(&self, _client_id: &str, _filter: &str, granted: QoS) -> SubscribeOutcome {
        SubscribeOutcome::Grant(granted)
    }

    fn on_unsubscribe(&self, _client_id: &str, _filter: &str) {}

    fn on_disconnect(&self, _client_id: &str, _graceful: bool) {}

    /// Fired before a will is published. Returning false suppresses it.
    fn on_will_publish(&self, _client_id: &str, _topic: &str, _payload: &Bytes) -> bool {
        true
    }
}

/// Default hook set: observes nothing, permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl Hooks for NoHooks {}

/// A message rewrite/filter stage. Interceptors run in registration order;
/// each may mutate the context or [`MessageContext::discard`] it.
pub trait Interceptor: Send {
    fn intercept(&self, ctx: &mut MessageContext);
}

impl<F> Interceptor for F
where
    F: Fn(&mut MessageContext) + Send,
{
    fn intercept(&self, ctx: &mut MessageContext) {
        self(ctx)
    }
}

/// Run a callback with panic isolation. A panicking hook is logged and its
/// default value used instead.
pub(crate) fn guarded<R>(name: &str, default: R, f: impl FnOnce() -> R) -> R {
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(_) => {
            log::error!("Panic in {} callback; treating as no-op", name);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hooks_permit_everything() {
        let hooks = NoHooks;
        assert!(hooks.on_connect("c1", None, None));
        assert_eq!(
            hooks.on_subscribe("c1", "a/b", QoS::AtLeastOnce),
            SubscribeOutcome::Grant(QoS::AtLeastOnce)
        );
        assert!(hooks.on_will_publish("c1", "t", &Bytes::new()));
    }

    #[test]
    fn test_guarded_catches_panics() {
        let result = guarded("test", 42, || panic!("boom"));
        assert_eq!(result, 42);
        let result = guarded("test", 0, || 7);
        assert_eq!(result, 7);
    }
}

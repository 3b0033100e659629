use crate::error::ErrorKind;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

/// A decoded Dispatch frame, forwarded to the consumer in arrival order.
#[derive(Debug, Clone)]
pub struct DispatchEvent {
    /// Shard that received the event
    pub shard_id: u32,
    /// Event name (`t`), e.g. `MESSAGE_CREATE`
    pub name: String,
    /// Sequence number (`s`), absent on frames the gateway does not number
    pub sequence: Option<u64>,
    /// Opaque event payload (`d`)
    pub data: Value,
}

/// Trait that users implement to consume gateway events.
///
/// The manager owns connection lifecycle, heartbeating and session recovery.
/// The handler receives every dispatch plus lifecycle notifications. Each
/// callback is awaited before the shard reads its next frame, so events of
/// one shard arrive strictly in order.
///
/// # Example
///
/// ```ignore
/// use gateway_shard_manager::{DispatchEvent, EventHandler};
///
/// struct Bot;
///
/// impl EventHandler for Bot {
///     async fn on_dispatch(&self, event: DispatchEvent) {
///         if event.name == "MESSAGE_CREATE" {
///             println!("[{}] {}", event.shard_id, event.data["content"]);
///         }
///     }
///
///     async fn on_all_ready(&self) {
///         println!("every shard is ready");
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync + 'static {
    /// Called for every Dispatch frame, after the shard recorded its sequence.
    fn on_dispatch(&self, event: DispatchEvent) -> impl Future<Output = ()> + Send;

    /// Called when a shard finished its guild wait after READY.
    ///
    /// `unavailable_guilds` holds the expected guilds that never arrived.
    fn on_shard_ready(
        &self,
        _shard_id: u32,
        _unavailable_guilds: HashSet<u64>,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called when a shard resumed its session; `replayed` events were re-sent.
    fn on_shard_resumed(&self, _shard_id: u32, _replayed: u64) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called exactly once, after every shard of the manager became ready.
    fn on_all_ready(&self) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called before a shard reconnects.
    fn on_shard_reconnecting(&self, _shard_id: u32) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called when a shard's socket closed. `code` is `None` without a close frame.
    fn on_shard_disconnect(
        &self,
        _shard_id: u32,
        _code: Option<u16>,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called when a shard hits an error.
    ///
    /// Fatal errors ([`ErrorKind::FatalClose`]) end the shard; every other kind
    /// is retried by the shard itself.
    fn on_shard_error(
        &self,
        _shard_id: u32,
        _kind: ErrorKind,
        _message: &str,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called when the gateway invalidated a session (op 9).
    fn on_invalid_session(
        &self,
        _shard_id: u32,
        _resumable: bool,
    ) -> impl Future<Output = ()> + Send {
        async {}
    }

    /// Called with the round trip of every acked heartbeat.
    fn on_ping(&self, _shard_id: u32, _ping: Duration) -> impl Future<Output = ()> + Send {
        async {}
    }
}

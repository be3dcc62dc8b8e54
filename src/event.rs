//! Topology event fan-out.
//!
//! Membership and SDAM events are broadcast to every subscriber; a slow or
//! absent subscriber never blocks the topology.

use std::time::Duration;

use bson::Document;
use tokio::sync::broadcast;
use tracing::trace;

/// Everything the topology announces to the outside world.
#[derive(Debug, Clone)]
pub enum TopologyEvent {
    /// The topology started opening its seed list.
    TopologyOpening { topology_id: u32 },
    /// The topology was destroyed. Emitted exactly once per lifetime.
    TopologyClosed { topology_id: u32 },
    /// First transition into the connected state.
    Connect,
    /// All seeds have settled after the initial connect.
    Fullsetup,
    /// Legacy companion of [`Fullsetup`](Self::Fullsetup).
    All,
    /// A rehabilitation pass brought at least one proxy back.
    Reconnect,
    /// A proxy joined the connected set.
    Joined { kind: &'static str, name: String },
    /// A proxy left the connected set.
    Left { kind: &'static str, name: String },
    /// A proxy's connect attempt failed or was discarded.
    Failed { name: String },
    /// Debug-only trace of `get_server` picks.
    PickedServer { name: Option<String> },
    /// A connection attempt to a proxy began.
    ServerOpening { address: String },
    /// A proxy's ismaster description changed.
    ServerDescriptionChanged { address: String },
    /// A proxy handle was destroyed.
    ServerClosed { address: String },
    /// An ismaster probe was sent.
    ServerHeartbeatStarted { connection_id: String },
    /// An ismaster probe succeeded.
    ServerHeartbeatSucceeded {
        connection_id: String,
        duration: Duration,
        reply: Document,
    },
    /// An ismaster probe failed.
    ServerHeartbeatFailed {
        connection_id: String,
        duration: Duration,
        failure: String,
    },
    /// A topology-level error the owner asked to hear about.
    Error { message: String },
}

/// Broadcast bus carrying [`TopologyEvent`]s to subscribers.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<TopologyEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.tx.subscribe()
    }

    /// Emit an event. Send errors (no subscribers) are ignored.
    pub(crate) fn emit(&self, event: TopologyEvent) {
        trace!(?event, "topology event");
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(TopologyEvent::Connect);
        assert!(matches!(rx.recv().await, Ok(TopologyEvent::Connect)));
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let bus = EventBus::new(8);
        bus.emit(TopologyEvent::TopologyOpening { topology_id: 1 });
    }
}

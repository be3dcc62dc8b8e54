//! Topology state: the lifecycle state machine and the actor-owned core.

use std::sync::atomic::{AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::proxy::{IsMaster, ProxyAddress, ProxySet};

/// Lifecycle state of the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyState {
    Disconnected,
    Connecting,
    Connected,
    Destroyed,
}

impl TopologyState {
    /// Whether moving from `self` to `to` is a legal transition.
    ///
    /// Destroyed is terminal; everything else may re-enter itself or move
    /// forward/backward along the connect path.
    fn allows(self, to: TopologyState) -> bool {
        use TopologyState::*;
        matches!(
            (self, to),
            (Disconnected, Connecting | Disconnected | Destroyed)
                | (Connecting, Connecting | Connected | Disconnected | Destroyed)
                | (Connected, Connected | Disconnected | Destroyed)
                | (Destroyed, Destroyed)
        )
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Destroyed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Destroyed,
            _ => Self::Disconnected,
        }
    }
}

static TOPOLOGY_ID: AtomicU32 = AtomicU32::new(0);

/// Allocate the next topology identifier. Monotone per process.
pub(crate) fn next_topology_id() -> u32 {
    TOPOLOGY_ID.fetch_add(1, Ordering::Relaxed)
}

/// The mutable heart of the topology. Owned by the actor task; nothing
/// outside it ever touches these fields.
pub(crate) struct TopologyCore {
    pub(crate) id: u32,
    pub(crate) state: TopologyState,
    pub(crate) seed_list: Vec<ProxyAddress>,
    /// Handles with a connect attempt in flight.
    pub(crate) connecting: ProxySet,
    /// Handles eligible for dispatch.
    pub(crate) connected: ProxySet,
    /// Dead entries awaiting rehabilitation, keyed by the address to retry.
    pub(crate) disconnected: ProxySet,
    /// Smallest ismaster round-trip ever observed; `None` is +inf.
    pub(crate) min_latency: Option<Duration>,
    /// Latched during an authentication fan-out.
    pub(crate) authenticating: bool,
    /// Rotating selection cursor.
    pub(crate) index: usize,
    /// The single outstanding HA timer, if any.
    pub(crate) monitor_timer: Option<JoinHandle<()>>,
}

impl TopologyCore {
    pub(crate) fn new(id: u32, seed_list: Vec<ProxyAddress>) -> Self {
        Self {
            id,
            state: TopologyState::Disconnected,
            seed_list,
            connecting: ProxySet::default(),
            connected: ProxySet::default(),
            disconnected: ProxySet::default(),
            min_latency: None,
            authenticating: false,
            index: 0,
            monitor_timer: None,
        }
    }

    /// Apply a state transition, rejecting and logging illegal ones.
    pub(crate) fn transition(&mut self, to: TopologyState) -> bool {
        if self.state.allows(to) {
            self.state = to;
            true
        } else {
            warn!(
                topology_id = self.id,
                from = ?self.state,
                to = ?to,
                "illegal state transition rejected"
            );
            false
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        !self.connected.is_empty()
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state == TopologyState::Destroyed
    }

    /// Lower the latency floor. The floor only ever decreases while the
    /// topology is alive.
    pub(crate) fn observe_latency(&mut self, sample: Duration) {
        if self.is_destroyed() {
            return;
        }
        self.min_latency = Some(match self.min_latency {
            Some(current) => current.min(sample),
            None => sample,
        });
    }

    /// Cancel the outstanding HA timer, if any.
    pub(crate) fn cancel_monitor_timer(&mut self) {
        if let Some(timer) = self.monitor_timer.take() {
            timer.abort();
        }
    }
}

/// Lock-free mirror of the pieces of topology state that callers read
/// synchronously. Written only by the actor.
#[derive(Debug, Default)]
pub(crate) struct SharedStatus {
    state: AtomicU8,
    connected_count: AtomicUsize,
    last_ismaster: Mutex<Option<IsMaster>>,
}

impl SharedStatus {
    pub(crate) fn state(&self) -> TopologyState {
        TopologyState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected_count.load(Ordering::Acquire) > 0
    }

    pub(crate) fn is_destroyed(&self) -> bool {
        self.state() == TopologyState::Destroyed
    }

    pub(crate) fn last_ismaster(&self) -> Option<IsMaster> {
        self.last_ismaster.lock().clone()
    }

    /// Refresh the mirror from the authoritative core. Actor-only.
    pub(crate) fn sync(&self, core: &TopologyCore) {
        self.state.store(core.state.as_u8(), Ordering::Release);
        self.connected_count
            .store(core.connected.len(), Ordering::Release);
    }

    pub(crate) fn record_ismaster(&self, ismaster: IsMaster) {
        *self.last_ismaster.lock() = Some(ismaster);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> TopologyCore {
        TopologyCore::new(next_topology_id(), vec![ProxyAddress::new("localhost", 27017)])
    }

    #[test]
    fn destroyed_is_terminal() {
        let mut core = core();
        assert!(core.transition(TopologyState::Destroyed));
        assert!(!core.transition(TopologyState::Connecting));
        assert!(!core.transition(TopologyState::Connected));
        assert!(!core.transition(TopologyState::Disconnected));
        assert!(core.transition(TopologyState::Destroyed));
        assert_eq!(core.state, TopologyState::Destroyed);
    }

    #[test]
    fn disconnected_cannot_jump_to_connected() {
        let mut core = core();
        assert!(!core.transition(TopologyState::Connected));
        assert_eq!(core.state, TopologyState::Disconnected);
    }

    #[test]
    fn connect_path_is_legal() {
        let mut core = core();
        assert!(core.transition(TopologyState::Connecting));
        assert!(core.transition(TopologyState::Connecting));
        assert!(core.transition(TopologyState::Connected));
        assert!(core.transition(TopologyState::Disconnected));
        assert!(core.transition(TopologyState::Connecting));
    }

    #[test]
    fn connected_cannot_reenter_connecting() {
        let mut core = core();
        core.transition(TopologyState::Connecting);
        core.transition(TopologyState::Connected);
        assert!(!core.transition(TopologyState::Connecting));
        assert_eq!(core.state, TopologyState::Connected);
    }

    #[test]
    fn latency_floor_only_decreases() {
        let mut core = core();
        assert_eq!(core.min_latency, None);
        core.observe_latency(Duration::from_millis(8));
        assert_eq!(core.min_latency, Some(Duration::from_millis(8)));
        core.observe_latency(Duration::from_millis(20));
        assert_eq!(core.min_latency, Some(Duration::from_millis(8)));
        core.observe_latency(Duration::from_millis(5));
        assert_eq!(core.min_latency, Some(Duration::from_millis(5)));
    }

    #[test]
    fn latency_floor_freezes_after_destroy() {
        let mut core = core();
        core.observe_latency(Duration::from_millis(8));
        core.transition(TopologyState::Destroyed);
        core.observe_latency(Duration::from_millis(1));
        assert_eq!(core.min_latency, Some(Duration::from_millis(8)));
    }

    #[test]
    fn status_mirror_tracks_core() {
        let status = SharedStatus::default();
        let mut core = core();
        assert!(!status.is_connected());

        core.transition(TopologyState::Connecting);
        status.sync(&core);
        assert_eq!(status.state(), TopologyState::Connecting);
        assert!(!status.is_destroyed());

        core.transition(TopologyState::Destroyed);
        status.sync(&core);
        assert!(status.is_destroyed());
    }

    #[test]
    fn topology_ids_increase() {
        let a = next_topology_id();
        let b = next_topology_id();
        assert!(b > a);
    }
}

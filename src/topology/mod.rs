//! The mongos proxy topology.
//!
//! # Architecture
//!
//! [`Mongos`] is a cheap, cloneable handle onto a single actor task that
//! owns every piece of mutable topology state: the three proxy sets
//! (connecting / connected / disconnected), the lifecycle state machine,
//! the latency floor, the authentication latch, and the selection cursor.
//! Public calls become mailbox messages; replies come back over oneshot
//! channels, so each caller hears exactly once.
//!
//! ```text
//! application ──► dispatcher gate ──► selector ──► ProxyTransport ──► wire
//!                      │
//!                      └─ offline? ──► DisconnectHandler (replayed by the
//!                                      health monitor on reconnect)
//! ```
//!
//! The health monitor pings every connected proxy once per `ha_interval`,
//! demotes failures, and rebuilds demoted proxies with fresh transports.
//! Membership and SDAM events fan out through [`Mongos::subscribe`].

mod actor;
mod auth;
mod monitor;
mod state;

use std::sync::Arc;

use bson::Document;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::{ConnectionOptions, TopologyConfig};
use crate::cursor::{Cursor, CursorContext, CursorOptions, TopologyCursor};
use crate::error::{Error, Result};
use crate::event::{EventBus, TopologyEvent};
use crate::operation::{
    CommandOptions, Credential, Namespace, Operation, WriteOptions,
};
use crate::proxy::{IsMaster, ProxyAddress, ProxyFactory, ProxyTransport};

use actor::{Message, TopologyActor};
use state::{next_topology_id, SharedStatus, TopologyCore};

pub use state::TopologyState;

/// A proxy chosen by the selector, as handed to callers of
/// [`Mongos::get_server`].
#[derive(Clone)]
pub struct SelectedProxy {
    /// `host:port` of the chosen proxy.
    pub name: String,
    /// The proxy's transport; operations may be run on it directly.
    pub transport: Arc<dyn ProxyTransport>,
}

struct Inner {
    id: u32,
    tx: mpsc::UnboundedSender<Message>,
    status: Arc<SharedStatus>,
    events: EventBus,
    config: Arc<TopologyConfig>,
    seed_list: Vec<ProxyAddress>,
}

/// Handle to a mongos proxy topology.
///
/// Cloning is cheap and every clone drives the same topology. The topology
/// keeps running until [`destroy`](Self::destroy) is called or the last
/// clone is dropped, whichever comes first.
///
/// Requires a tokio runtime: construction spawns the topology's actor task.
#[derive(Clone)]
pub struct Mongos {
    inner: Arc<Inner>,
}

impl Mongos {
    /// Create a topology over `seed_list`, minting proxy connections through
    /// `factory`.
    ///
    /// The topology starts disconnected; call [`connect`](Self::connect) to
    /// bring the seed list up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the seed list is empty or the
    /// configuration fails validation.
    pub fn new(
        seed_list: Vec<ProxyAddress>,
        factory: Arc<dyn ProxyFactory>,
        config: TopologyConfig,
    ) -> Result<Self> {
        if seed_list.is_empty() {
            return Err(Error::Config {
                field: "seed_list",
                reason: "at least one mongos proxy address is required".to_string(),
            });
        }
        config.validate()?;

        let config = Arc::new(config);
        let id = next_topology_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventBus::new(config.event_capacity);
        let status = Arc::new(SharedStatus::default());

        let actor = TopologyActor::new(
            TopologyCore::new(id, seed_list.clone()),
            rx,
            tx.downgrade(),
            events.clone(),
            factory,
            status.clone(),
            config.clone(),
        );
        tokio::spawn(actor.run());

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                tx,
                status,
                events,
                config,
                seed_list,
            }),
        })
    }

    /// Rebuild a handle from the actor's pieces (disconnect-handler replay).
    pub(crate) fn from_actor(
        id: u32,
        tx: mpsc::UnboundedSender<Message>,
        status: Arc<SharedStatus>,
        events: EventBus,
        config: Arc<TopologyConfig>,
        seed_list: Vec<ProxyAddress>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                tx,
                status,
                events,
                config,
                seed_list,
            }),
        }
    }

    /// Always `"mongos"`.
    #[must_use]
    pub const fn topology_type(&self) -> &'static str {
        "mongos"
    }

    /// The topology's process-unique identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// The seed list supplied at construction.
    #[must_use]
    pub fn seed_list(&self) -> &[ProxyAddress] {
        &self.inner.seed_list
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> TopologyState {
        self.inner.status.state()
    }

    /// `true` while at least one proxy is in the connected set.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.status.is_connected()
    }

    /// `true` once the topology has been destroyed or unrefed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.status.is_destroyed()
    }

    /// The most recent ismaster reply recorded from any proxy.
    #[must_use]
    pub fn last_ismaster(&self) -> Option<IsMaster> {
        self.inner.status.last_ismaster()
    }

    /// Subscribe to membership and SDAM events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.events.subscribe()
    }

    /// Begin the initial connect. Non-blocking: progress is reported through
    /// events, and completion flips [`is_connected`](Self::is_connected).
    ///
    /// Only honored while the topology is disconnected.
    pub fn connect(&self) {
        let _ = self.inner.tx.send(Message::Connect { options: None });
    }

    /// [`connect`](Self::connect) with per-connection option overrides, which
    /// also apply to every later rehabilitation attempt.
    pub fn connect_with(&self, options: ConnectionOptions) {
        let _ = self.inner.tx.send(Message::Connect {
            options: Some(options),
        });
    }

    /// Route one operation to an eligible proxy.
    ///
    /// This is the dispatcher entry the convenience wrappers build on. When
    /// the topology is offline and a disconnect handler is configured, the
    /// call parks in the handler and this future resolves only once the
    /// handler replays or fails it.
    pub async fn dispatch(&self, op: Operation) -> Result<Document> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Message::Dispatch { op, reply: tx })
            .map_err(|_| Error::Destroyed)?;
        rx.await.map_err(|_| Error::Destroyed)?
    }

    /// Insert documents into `ns`.
    pub async fn insert(
        &self,
        ns: Namespace,
        docs: Vec<Document>,
        options: WriteOptions,
    ) -> Result<Document> {
        self.dispatch(Operation::Insert { ns, docs, options }).await
    }

    /// Apply update statements to `ns`.
    pub async fn update(
        &self,
        ns: Namespace,
        updates: Vec<Document>,
        options: WriteOptions,
    ) -> Result<Document> {
        self.dispatch(Operation::Update {
            ns,
            updates,
            options,
        })
        .await
    }

    /// Apply delete statements to `ns`.
    pub async fn remove(
        &self,
        ns: Namespace,
        deletes: Vec<Document>,
        options: WriteOptions,
    ) -> Result<Document> {
        self.dispatch(Operation::Remove {
            ns,
            deletes,
            options,
        })
        .await
    }

    /// Run a command against `ns`. The read preference in `options` is
    /// forwarded to the proxy unchanged.
    pub async fn command(
        &self,
        ns: Namespace,
        command: Document,
        options: CommandOptions,
    ) -> Result<Document> {
        self.dispatch(Operation::Command {
            ns,
            command,
            options,
        })
        .await
    }

    /// Build a cursor for `command` over `ns`. Construction is synchronous
    /// and performs no I/O; the per-call factory wins over the configured
    /// one, which wins over the default cursor.
    #[must_use]
    pub fn cursor(
        &self,
        ns: Namespace,
        command: Document,
        options: CursorOptions,
    ) -> Box<dyn TopologyCursor> {
        let factory = options
            .cursor_factory
            .clone()
            .or_else(|| self.inner.config.cursor_factory.clone());
        let context = CursorContext {
            topology: self.clone(),
            ns,
            command,
            options,
        };
        match factory {
            Some(factory) => factory.build(context),
            None => Box::new(Cursor::new(context)),
        }
    }

    /// Authenticate every non-arbiter proxy in the connected set with one
    /// credential.
    pub async fn auth(&self, credential: Credential) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .tx
            .send(Message::Auth {
                credential,
                reply: tx,
            })
            .map_err(|_| Error::Destroyed)?;
        rx.await.map_err(|_| Error::Destroyed)?
    }

    /// Pick one eligible proxy, or `None` when nothing passes the latency
    /// window.
    pub async fn get_server(&self) -> Option<SelectedProxy> {
        let (tx, rx) = oneshot::channel();
        self.inner.tx.send(Message::GetServer { reply: tx }).ok()?;
        rx.await.ok().flatten()
    }

    /// The live connections across the connected set.
    pub async fn connections(&self) -> Vec<Arc<dyn ProxyTransport>> {
        let (tx, rx) = oneshot::channel();
        if self
            .inner
            .tx
            .send(Message::Connections { reply: tx })
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Detach the topology from the runtime: cancels monitoring and unrefs
    /// every handle without closing connections. Terminal, like
    /// [`destroy`](Self::destroy).
    pub fn unref(&self) {
        let _ = self.inner.tx.send(Message::Unref);
    }

    /// Destroy the topology: cancel monitoring, close every proxy, and emit
    /// `TopologyClosed`. Idempotent; resolves once teardown has happened.
    pub async fn destroy(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.tx.send(Message::Destroy { done: tx }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl std::fmt::Debug for Mongos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mongos")
            .field("id", &self.inner.id)
            .field("type", &self.topology_type())
            .field("state", &self.state())
            .field("seed_list", &self.inner.seed_list)
            .finish()
    }
}

//! The topology actor: one task owning all mutable state.
//!
//! Every mutation of the proxy sets, the lifecycle state, the latency floor,
//! the auth latch, and the rotation cursor happens inside this task, driven
//! by the [`Message`] mailbox. Connect attempts, ismaster probes, operation
//! I/O, and the HA timer run in spawned tasks that report back through the
//! mailbox; they never touch topology state directly. Each state-mutating
//! message re-checks for destruction on entry and destroys any handle it
//! carries instead of mutating a dead topology.

use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::buffer::BufferedRequest;
use crate::config::{ConnectionOptions, TopologyConfig};
use crate::error::{AuthFailure, Error, Result};
use crate::event::{EventBus, TopologyEvent};
use crate::operation::{Credential, Operation};
use crate::proxy::{self, IsMaster, ProxyAddress, ProxyFactory, ProxyHandle, ProxyTransport};
use crate::selection;

use super::state::{SharedStatus, TopologyCore, TopologyState};
use super::{Mongos, SelectedProxy};

/// A successful proxy handshake: the ismaster reply and its round-trip.
pub(crate) struct Handshake {
    pub(crate) ismaster: IsMaster,
    pub(crate) rtt: Duration,
}

/// Mailbox messages consumed by the actor.
pub(crate) enum Message {
    /// Begin the initial connect, optionally overriding connection options.
    Connect { options: Option<ConnectionOptions> },
    /// A seed's connect attempt finished. Carries the attempt's transport:
    /// the settlement owns its fate regardless of set membership.
    SeedSettled {
        address: ProxyAddress,
        transport: Arc<dyn ProxyTransport>,
        outcome: Result<Handshake>,
    },
    /// The HA timer fired.
    HaTick,
    /// An ismaster probe finished.
    PingSettled {
        name: String,
        duration: Duration,
        outcome: Result<Document>,
    },
    /// A rehabilitation connect attempt finished. Carries the fresh
    /// transport, which has not been installed into any set yet.
    RehabSettled {
        address: ProxyAddress,
        transport: Arc<dyn ProxyTransport>,
        outcome: Result<Handshake>,
    },
    /// A caller wants an operation routed.
    Dispatch {
        op: Operation,
        reply: oneshot::Sender<Result<Document>>,
    },
    /// A caller wants to authenticate the whole connected set.
    Auth {
        credential: Credential,
        reply: oneshot::Sender<Result<()>>,
    },
    /// The auth fan-out finished.
    AuthSettled {
        failures: Vec<AuthFailure>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// A caller wants one eligible proxy.
    GetServer {
        reply: oneshot::Sender<Option<SelectedProxy>>,
    },
    /// A caller wants the live connections.
    Connections {
        reply: oneshot::Sender<Vec<Arc<dyn ProxyTransport>>>,
    },
    /// Detach from the runtime without closing connections.
    Unref,
    /// Tear the topology down.
    Destroy { done: oneshot::Sender<()> },
}

/// Progress of the in-flight ping round, if any.
pub(super) struct TickProgress {
    pub(super) pending: usize,
}

/// Progress of the in-flight rehabilitation pass, if any.
pub(super) struct RehabProgress {
    pub(super) pending: usize,
    pub(super) promoted: usize,
    /// Whether this pass started from an empty connected set.
    pub(super) from_empty: bool,
}

pub(super) struct TopologyActor {
    pub(super) core: TopologyCore,
    rx: mpsc::UnboundedReceiver<Message>,
    /// Weak handle to our own mailbox for spawned tasks. Weak so that idle
    /// timers never keep a dropped topology alive.
    pub(super) tx: mpsc::WeakUnboundedSender<Message>,
    pub(super) events: EventBus,
    pub(super) factory: Arc<dyn ProxyFactory>,
    pub(super) status: Arc<SharedStatus>,
    pub(super) config: Arc<TopologyConfig>,
    /// Effective per-connection options, replaced by `connect_with` overrides.
    pub(super) connect_options: ConnectionOptions,
    seeds_pending: usize,
    seed_batch_done: bool,
    /// True from monitor start until the first tick completes.
    pub(super) first_connect_tick: bool,
    cold_start_announced: bool,
    pub(super) tick: Option<TickProgress>,
    pub(super) rehab: Option<RehabProgress>,
}

impl TopologyActor {
    pub(super) fn new(
        core: TopologyCore,
        rx: mpsc::UnboundedReceiver<Message>,
        tx: mpsc::WeakUnboundedSender<Message>,
        events: EventBus,
        factory: Arc<dyn ProxyFactory>,
        status: Arc<SharedStatus>,
        config: Arc<TopologyConfig>,
    ) -> Self {
        let connect_options = config.connection.clone();
        Self {
            core,
            rx,
            tx,
            events,
            factory,
            status,
            config,
            connect_options,
            seeds_pending: 0,
            seed_batch_done: false,
            first_connect_tick: false,
            cold_start_announced: false,
            tick: None,
            rehab: None,
        }
    }

    pub(super) async fn run(mut self) {
        while let Some(message) = self.rx.recv().await {
            self.handle(message);
        }
        // Every public handle and in-flight task is gone; make teardown
        // unconditional so transports never leak.
        self.destroy_topology();
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Connect { options } => self.handle_connect(options),
            Message::SeedSettled {
                address,
                transport,
                outcome,
            } => self.handle_seed_settled(address, transport, outcome),
            Message::HaTick => self.handle_ha_tick(),
            Message::PingSettled {
                name,
                duration,
                outcome,
            } => self.handle_ping_settled(name, duration, outcome),
            Message::RehabSettled {
                address,
                transport,
                outcome,
            } => self.handle_rehab_settled(address, transport, outcome),
            Message::Dispatch { op, reply } => self.handle_dispatch(op, reply),
            Message::Auth { credential, reply } => self.handle_auth(credential, reply),
            Message::AuthSettled { failures, reply } => self.handle_auth_settled(failures, reply),
            Message::GetServer { reply } => self.handle_get_server(reply),
            Message::Connections { reply } => self.handle_connections(reply),
            Message::Unref => self.handle_unref(),
            Message::Destroy { done } => {
                self.destroy_topology();
                let _ = done.send(());
            }
        }
    }

    /// Rebuild a public handle for collaborators that need to call back into
    /// the topology (the disconnect handler's replay).
    pub(super) fn client(&self) -> Option<Mongos> {
        self.tx.upgrade().map(|tx| {
            Mongos::from_actor(
                self.core.id,
                tx,
                self.status.clone(),
                self.events.clone(),
                self.config.clone(),
                self.core.seed_list.clone(),
            )
        })
    }

    /// Destroy a handle's transport and announce the closure.
    pub(super) fn close_handle(&self, handle: ProxyHandle) {
        handle.destroy();
        self.events.emit(TopologyEvent::ServerClosed {
            address: handle.name().to_string(),
        });
    }

    // -----------------------------------------------------------------------
    // Initial connect
    // -----------------------------------------------------------------------

    fn handle_connect(&mut self, options: Option<ConnectionOptions>) {
        if self.core.is_destroyed() {
            return;
        }
        if self.core.state != TopologyState::Disconnected {
            warn!(
                topology_id = self.core.id,
                state = ?self.core.state,
                "connect ignored: topology is not disconnected"
            );
            return;
        }
        if let Some(options) = options {
            self.connect_options = options;
        }

        self.core.transition(TopologyState::Connecting);
        self.status.sync(&self.core);
        self.events.emit(TopologyEvent::TopologyOpening {
            topology_id: self.core.id,
        });

        let member_options = self.connect_options.for_topology_member();
        let seeds = self.core.seed_list.clone();
        self.seeds_pending = seeds.len();
        info!(
            topology_id = self.core.id,
            seeds = seeds.len(),
            "connecting to seed list"
        );

        for (i, address) in seeds.into_iter().enumerate() {
            let transport = self.factory.create(&address, &member_options);
            self.core
                .connecting
                .push(ProxyHandle::new(address.clone(), transport.clone()));
            self.events.emit(TopologyEvent::ServerOpening {
                address: address.to_string(),
            });

            // Stagger attempts by one millisecond per seed so a large seed
            // list does not burst-connect.
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i as u64)).await;
                let started = Instant::now();
                let outcome = transport.connect().await.map(|doc| Handshake {
                    ismaster: IsMaster::new(doc),
                    rtt: started.elapsed(),
                });
                match tx.upgrade() {
                    Some(tx) => {
                        let _ = tx.send(Message::SeedSettled {
                            address,
                            transport,
                            outcome,
                        });
                    }
                    None => transport.destroy(),
                }
            });
        }
    }

    fn handle_seed_settled(
        &mut self,
        address: ProxyAddress,
        transport: Arc<dyn ProxyTransport>,
        outcome: Result<Handshake>,
    ) {
        let name = address.to_string();
        if self.core.is_destroyed() {
            for handle in self.core.connecting.remove_all(&name) {
                self.close_handle(handle);
            }
            transport.destroy();
            return;
        }

        match outcome {
            Ok(handshake) => {
                self.status.record_ismaster(handshake.ismaster.clone());
                if self.core.connected.contains(&name) {
                    debug!(proxy = %name, "duplicate proxy discarded");
                    transport.destroy();
                    self.events.emit(TopologyEvent::Failed { name: name.clone() });
                    self.events
                        .emit(TopologyEvent::ServerClosed { address: name });
                } else {
                    let mut handle = ProxyHandle::new(address, transport);
                    handle.last_ismaster = Some(handshake.ismaster);
                    handle.last_rtt = Some(handshake.rtt);
                    proxy::install(&mut self.core.connecting, &mut self.core.connected, handle);
                    self.core.observe_latency(handshake.rtt);
                    info!(topology_id = self.core.id, proxy = %name, rtt_ms = handshake.rtt.as_millis() as u64, "proxy joined");
                    self.events.emit(TopologyEvent::Joined {
                        kind: "mongos",
                        name,
                    });
                }
            }
            Err(err) => {
                debug!(proxy = %name, error = %err, "seed connect failed");
                transport.destroy();
                let placeholder = ProxyHandle::new(address, transport);
                proxy::install(
                    &mut self.core.connecting,
                    &mut self.core.disconnected,
                    placeholder,
                );
                self.events.emit(TopologyEvent::Left {
                    kind: "mongos",
                    name: name.clone(),
                });
                self.events.emit(TopologyEvent::Failed { name: name.clone() });
                self.events
                    .emit(TopologyEvent::ServerClosed { address: name });
            }
        }
        self.status.sync(&self.core);

        self.seeds_pending = self.seeds_pending.saturating_sub(1);
        if self.seeds_pending == 0 && !self.seed_batch_done {
            self.seed_batch_done = true;
            self.finish_initial_connect();
        }
    }

    /// The seed batch has settled for the first time.
    fn finish_initial_connect(&mut self) {
        if self.core.is_connected() {
            self.core.transition(TopologyState::Connected);
            self.status.sync(&self.core);
            self.announce_cold_start();
        }
        // The monitor starts either way; if every seed failed it owns the
        // rest of the first connect through rehabilitation.
        self.first_connect_tick = true;
        self.schedule_tick(self.config.ha_interval());
    }

    /// Emit `connect`/`fullsetup`/`all` exactly once per cold start.
    pub(super) fn announce_cold_start(&mut self) {
        if self.cold_start_announced {
            return;
        }
        self.cold_start_announced = true;
        self.events.emit(TopologyEvent::Connect);
        self.events.emit(TopologyEvent::Fullsetup);
        self.events.emit(TopologyEvent::All);
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn handle_dispatch(&mut self, op: Operation, reply: oneshot::Sender<Result<Document>>) {
        if self.core.is_destroyed() {
            let _ = reply.send(Err(Error::Destroyed));
            return;
        }
        if !self.core.is_connected() {
            if let Some(handler) = self.config.disconnect_handler.clone() {
                handler.add(BufferedRequest::Operation { op, reply });
            } else {
                let _ = reply.send(Err(Error::NoProxyAvailable));
            }
            return;
        }
        let Some(transport) = self.pick_transport() else {
            let _ = reply.send(Err(Error::NoProxyAvailable));
            return;
        };
        // Proxy I/O happens off the actor; the reply channel guarantees the
        // caller hears back exactly once.
        tokio::spawn(async move {
            let result = op.execute(transport.as_ref()).await;
            let _ = reply.send(result);
        });
    }

    fn pick_transport(&mut self) -> Option<Arc<dyn ProxyTransport>> {
        selection::pick(
            self.core.connected.as_slice(),
            self.core.min_latency,
            self.config.local_threshold(),
            &mut self.core.index,
        )
        .map(|handle| handle.transport.clone())
    }

    fn handle_get_server(&mut self, reply: oneshot::Sender<Option<SelectedProxy>>) {
        let picked = if self.core.is_destroyed() {
            None
        } else {
            selection::pick(
                self.core.connected.as_slice(),
                self.core.min_latency,
                self.config.local_threshold(),
                &mut self.core.index,
            )
            .map(|handle| SelectedProxy {
                name: handle.name().to_string(),
                transport: handle.transport.clone(),
            })
        };
        if self.config.debug {
            self.events.emit(TopologyEvent::PickedServer {
                name: picked.as_ref().map(|p| p.name.clone()),
            });
        }
        let _ = reply.send(picked);
    }

    fn handle_connections(&mut self, reply: oneshot::Sender<Vec<Arc<dyn ProxyTransport>>>) {
        let list = self
            .core
            .connected
            .iter()
            .map(|handle| handle.transport.clone())
            .collect();
        let _ = reply.send(list);
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    fn handle_unref(&mut self) {
        if self.core.is_destroyed() {
            return;
        }
        info!(topology_id = self.core.id, "unref: detaching topology");
        self.core.transition(TopologyState::Destroyed);
        self.core.cancel_monitor_timer();
        for handle in self.core.connected.iter().chain(self.core.connecting.iter()) {
            handle.transport.unref();
        }
        self.status.sync(&self.core);
    }

    pub(super) fn destroy_topology(&mut self) {
        if self.core.is_destroyed() {
            return;
        }
        info!(topology_id = self.core.id, "destroying topology");
        self.core.transition(TopologyState::Destroyed);
        self.core.cancel_monitor_timer();

        let handles: Vec<ProxyHandle> = self
            .core
            .connecting
            .drain()
            .into_iter()
            .chain(self.core.connected.drain())
            .collect();
        for handle in handles {
            self.close_handle(handle);
        }
        // Disconnected entries carry already-destroyed transports.
        self.core.disconnected.drain();

        self.status.sync(&self.core);
        self.events.emit(TopologyEvent::TopologyClosed {
            topology_id: self.core.id,
        });
    }
}

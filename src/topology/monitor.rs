//! Health monitoring: the HA tick, ismaster probes, and rehabilitation.
//!
//! One single-shot timer is outstanding at a time; it is rescheduled at the
//! end of each tick, so at most one tick is ever in flight. A tick either
//! pings every connected proxy concurrently or, when nothing is connected,
//! goes straight to rehabilitating the disconnected entries. Every tick ends
//! with a rehabilitation pass and a fresh timer.

use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Document};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::TopologyEvent;
use crate::operation::{CommandOptions, Namespace};
use crate::proxy::{self, IsMaster, ProxyAddress, ProxyHandle, ProxyTransport};

use super::actor::{Handshake, Message, RehabProgress, TickProgress, TopologyActor};
use super::state::TopologyState;

impl TopologyActor {
    /// Arm the single-shot HA timer. Any previously armed timer is replaced.
    pub(super) fn schedule_tick(&mut self, delay: Duration) {
        self.core.cancel_monitor_timer();
        let tx = self.tx.clone();
        self.core.monitor_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::HaTick);
            }
        }));
    }

    pub(super) fn handle_ha_tick(&mut self) {
        if self.core.is_destroyed() {
            return;
        }
        debug!(topology_id = self.core.id, "health monitor tick");

        // Connected again: give the offline buffer a chance to drain.
        if self.core.is_connected() {
            if let Some(handler) = self.config.disconnect_handler.clone() {
                if let Some(client) = self.client() {
                    handler.execute(client);
                }
            }
        }

        let proxies: Vec<(String, Arc<dyn ProxyTransport>)> = self
            .core
            .connected
            .iter()
            .map(|handle| (handle.name().to_string(), handle.transport.clone()))
            .collect();

        if proxies.is_empty() {
            self.start_rehab(true);
            return;
        }

        self.tick = Some(TickProgress {
            pending: proxies.len(),
        });
        for (name, transport) in proxies {
            self.events.emit(TopologyEvent::ServerHeartbeatStarted {
                connection_id: name.clone(),
            });
            let tx = self.tx.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                let outcome = transport
                    .command(
                        &Namespace::admin_command(),
                        doc! {"ismaster": 1},
                        &CommandOptions::monitoring(),
                    )
                    .await;
                let duration = started.elapsed();
                if let Some(tx) = tx.upgrade() {
                    let _ = tx.send(Message::PingSettled {
                        name,
                        duration,
                        outcome,
                    });
                }
            });
        }
    }

    pub(super) fn handle_ping_settled(
        &mut self,
        name: String,
        duration: Duration,
        outcome: Result<Document>,
    ) {
        if self.core.is_destroyed() {
            return;
        }

        match outcome {
            Ok(reply) => {
                let mut floor_sample = None;
                let mut description_changed = false;
                if let Some(handle) = self.core.connected.get_mut(&name) {
                    // The floor is lowered from the handle's previous sample;
                    // the freshly measured value only replaces it when
                    // `min_latency_uses_fresh_sample` is set.
                    floor_sample = Some(if self.config.min_latency_uses_fresh_sample {
                        duration
                    } else {
                        handle.last_rtt.unwrap_or(duration)
                    });
                    let description = IsMaster::new(reply.clone());
                    description_changed = handle.last_ismaster.as_ref() != Some(&description);
                    handle.last_ismaster = Some(description);
                    handle.last_rtt = Some(duration);
                }
                if let Some(sample) = floor_sample {
                    self.core.observe_latency(sample);
                    self.events.emit(TopologyEvent::ServerHeartbeatSucceeded {
                        connection_id: name.clone(),
                        duration,
                        reply,
                    });
                    if description_changed {
                        self.events
                            .emit(TopologyEvent::ServerDescriptionChanged { address: name });
                    }
                }
            }
            Err(err) => {
                warn!(proxy = %name, error = %err, "ismaster probe failed");
                self.events.emit(TopologyEvent::ServerHeartbeatFailed {
                    connection_id: name.clone(),
                    duration,
                    failure: err.to_string(),
                });
                if proxy::transfer(
                    &mut self.core.connected,
                    &mut self.core.disconnected,
                    &name,
                ) {
                    if let Some(handle) = self.core.disconnected.get_mut(&name) {
                        handle.destroy();
                    }
                    self.events.emit(TopologyEvent::Left {
                        kind: "mongos",
                        name: name.clone(),
                    });
                    self.events.emit(TopologyEvent::ServerClosed {
                        address: name.clone(),
                    });
                    if self.config.emit_error {
                        self.events.emit(TopologyEvent::Error {
                            message: err.to_string(),
                        });
                    }
                }
                self.status.sync(&self.core);
            }
        }

        let round_done = match self.tick.as_mut() {
            Some(tick) => {
                tick.pending = tick.pending.saturating_sub(1);
                tick.pending == 0
            }
            None => false,
        };
        if round_done {
            self.tick = None;
            self.start_rehab(false);
        }
    }

    /// Kick off a rehabilitation pass over the disconnected entries.
    ///
    /// Each entry gets a fresh transport, connected at a one-millisecond
    /// stagger per entry. Completion is tracked through `RehabSettled`
    /// messages; an empty disconnected set completes immediately.
    pub(super) fn start_rehab(&mut self, from_empty: bool) {
        let entries: Vec<ProxyAddress> = self
            .core
            .disconnected
            .iter()
            .map(|handle| handle.address().clone())
            .collect();
        if entries.is_empty() {
            self.finish_rehab(from_empty, 0);
            return;
        }

        debug!(
            topology_id = self.core.id,
            count = entries.len(),
            "rehabilitating disconnected proxies"
        );
        self.rehab = Some(RehabProgress {
            pending: entries.len(),
            promoted: 0,
            from_empty,
        });

        let member_options = self.connect_options.for_topology_member();
        for (i, address) in entries.into_iter().enumerate() {
            self.events.emit(TopologyEvent::ServerOpening {
                address: address.to_string(),
            });
            let factory = self.factory.clone();
            let options = member_options.clone();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i as u64)).await;
                let transport = factory.create(&address, &options);
                let started = Instant::now();
                let outcome = transport.connect().await.map(|doc| Handshake {
                    ismaster: IsMaster::new(doc),
                    rtt: started.elapsed(),
                });
                match tx.upgrade() {
                    Some(tx) => {
                        let _ = tx.send(Message::RehabSettled {
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

    pub(super) fn handle_rehab_settled(
        &mut self,
        address: ProxyAddress,
        transport: Arc<dyn ProxyTransport>,
        outcome: Result<Handshake>,
    ) {
        let name = address.to_string();
        if self.core.is_destroyed() {
            transport.destroy();
            return;
        }

        match outcome {
            Ok(handshake) if !self.core.authenticating => {
                self.status.record_ismaster(handshake.ismaster.clone());
                let mut handle = ProxyHandle::new(address, transport);
                handle.last_ismaster = Some(handshake.ismaster);
                handle.last_rtt = Some(handshake.rtt);
                proxy::install(
                    &mut self.core.disconnected,
                    &mut self.core.connected,
                    handle,
                );
                self.core.observe_latency(handshake.rtt);
                info!(topology_id = self.core.id, proxy = %name, "proxy rejoined");
                self.events.emit(TopologyEvent::Joined {
                    kind: "mongos",
                    name,
                });
                if let Some(rehab) = self.rehab.as_mut() {
                    rehab.promoted += 1;
                }
                self.status.sync(&self.core);
            }
            Ok(_) => {
                // Connected mid-auth: it missed the fan-out, so it cannot be
                // trusted as authenticated. The next tick retries.
                debug!(proxy = %name, "rehabilitated proxy discarded during authentication");
                transport.destroy();
                self.events
                    .emit(TopologyEvent::ServerClosed { address: name });
            }
            Err(err) => {
                debug!(proxy = %name, error = %err, "rehabilitation attempt failed");
                transport.destroy();
            }
        }

        let pass_done = match self.rehab.as_mut() {
            Some(rehab) => {
                rehab.pending = rehab.pending.saturating_sub(1);
                rehab.pending == 0
            }
            None => false,
        };
        if pass_done {
            if let Some(rehab) = self.rehab.take() {
                self.finish_rehab(rehab.from_empty, rehab.promoted);
            }
        }
    }

    /// A rehabilitation pass completed; announce what changed and arm the
    /// next tick.
    pub(super) fn finish_rehab(&mut self, from_empty: bool, promoted: usize) {
        if self.core.is_destroyed() {
            return;
        }

        if from_empty {
            if self.core.state == TopologyState::Connecting && self.first_connect_tick {
                // The initial batch never produced a proxy; the first tick
                // completes the cold start, promoted or not.
                self.core.transition(TopologyState::Connected);
                self.status.sync(&self.core);
                self.announce_cold_start();
            } else if self.core.is_connected() && promoted > 0 {
                self.events.emit(TopologyEvent::Reconnect);
            } else if promoted == 0
                && !self.core.is_connected()
                && self.config.fatal_when_unavailable
            {
                self.events.emit(TopologyEvent::Error {
                    message: "no valid mongos proxies found".to_string(),
                });
            }
        } else if promoted > 0 && self.core.state == TopologyState::Connected {
            self.events.emit(TopologyEvent::Reconnect);
        }

        self.first_connect_tick = false;
        self.schedule_tick(self.config.ha_interval());
    }
}

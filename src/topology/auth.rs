//! Authentication fan-out coordination.
//!
//! `auth` applies one credential to every non-arbiter proxy in the connected
//! set. The `authenticating` latch makes the fan-out mutually exclusive with
//! itself and with rehabilitation promotions: while it is held, a proxy that
//! finishes connecting is destroyed rather than admitted with stale
//! credentials. Pings continue normally.

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::buffer::BufferedRequest;
use crate::error::{AuthFailure, Error, Result};
use crate::operation::Credential;
use crate::proxy::ProxyTransport;

use super::actor::{Message, TopologyActor};

impl TopologyActor {
    pub(super) fn handle_auth(&mut self, credential: Credential, reply: oneshot::Sender<Result<()>>) {
        if self.core.is_destroyed() {
            let _ = reply.send(Err(Error::Destroyed));
            return;
        }
        if !self.config.supports_mechanism(&credential.mechanism) {
            let _ = reply.send(Err(Error::AuthProviderMissing(credential.mechanism)));
            return;
        }
        if self.core.authenticating {
            let _ = reply.send(Err(Error::AuthInProgress));
            return;
        }
        if !self.core.is_connected() {
            if let Some(handler) = self.config.disconnect_handler.clone() {
                handler.add(BufferedRequest::Auth { credential, reply });
            } else {
                let _ = reply.send(Err(Error::NoProxyAvailable));
            }
            return;
        }

        let snapshot: Vec<(String, Arc<dyn ProxyTransport>, bool)> = self
            .core
            .connected
            .iter()
            .map(|handle| {
                (
                    handle.name().to_string(),
                    handle.transport.clone(),
                    handle.arbiter_only(),
                )
            })
            .collect();
        if snapshot.is_empty() {
            let _ = reply.send(Ok(()));
            return;
        }

        self.core.authenticating = true;
        info!(
            topology_id = self.core.id,
            mechanism = %credential.mechanism,
            proxies = snapshot.len(),
            "authenticating connected proxies"
        );

        let tx = self.tx.clone();
        tokio::spawn(async move {
            let attempts = snapshot
                .into_iter()
                .filter(|(_, _, arbiter_only)| !*arbiter_only)
                .map(|(name, transport, _)| {
                    let credential = credential.clone();
                    async move {
                        match transport.auth(&credential).await {
                            Ok(()) => None,
                            Err(err) => Some(AuthFailure {
                                name,
                                error: err.to_string(),
                            }),
                        }
                    }
                });
            let failures: Vec<AuthFailure> =
                join_all(attempts).await.into_iter().flatten().collect();
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Message::AuthSettled { failures, reply });
            }
        });
    }

    pub(super) fn handle_auth_settled(
        &mut self,
        failures: Vec<AuthFailure>,
        reply: oneshot::Sender<Result<()>>,
    ) {
        self.core.authenticating = false;
        if failures.is_empty() {
            let _ = reply.send(Ok(()));
        } else {
            warn!(
                topology_id = self.core.id,
                failures = failures.len(),
                "authentication fan-out failed"
            );
            let _ = reply.send(Err(Error::Authentication { failures }));
        }
    }
}

//! Buffered-offline handling.
//!
//! When the topology is not connected and a [`DisconnectHandler`] is
//! configured, the dispatcher hands the whole call (arguments and reply
//! channel) to the handler instead of failing it. The health monitor asks
//! the handler to replay once the topology is connected again. The caller's
//! future stays pending until the replay (or a flush) resolves it; the
//! topology itself never resolves a buffered call.

use std::collections::VecDeque;
use std::fmt;

use bson::Document;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Error, Result};
use crate::operation::{Credential, Operation};
use crate::topology::Mongos;

/// One call captured while the topology was offline.
pub enum BufferedRequest {
    /// A write or command dispatch.
    Operation {
        op: Operation,
        reply: oneshot::Sender<Result<Document>>,
    },
    /// An authentication request.
    Auth {
        credential: Credential,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl fmt::Debug for BufferedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operation { op, .. } => f.debug_tuple("Operation").field(op.namespace()).finish(),
            Self::Auth { credential, .. } => {
                f.debug_tuple("Auth").field(&credential.mechanism).finish()
            }
        }
    }
}

/// Collaborator receiving operations submitted while disconnected.
pub trait DisconnectHandler: Send + Sync {
    /// Accept a call that could not be dispatched.
    fn add(&self, request: BufferedRequest);

    /// Replay everything buffered so far against the (now connected)
    /// topology. Called by the health monitor at the start of a tick.
    fn execute(&self, topology: Mongos);
}

/// Ready-made FIFO implementation of [`DisconnectHandler`].
#[derive(Default)]
pub struct OperationBuffer {
    queue: Mutex<VecDeque<BufferedRequest>>,
}

impl OperationBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of calls currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Fail every buffered call with [`Error::Destroyed`]. For owners
    /// tearing the topology down while calls are still parked here.
    pub fn fail_all(&self) {
        let drained: Vec<BufferedRequest> = self.queue.lock().drain(..).collect();
        for request in drained {
            match request {
                BufferedRequest::Operation { reply, .. } => {
                    let _ = reply.send(Err(Error::Destroyed));
                }
                BufferedRequest::Auth { reply, .. } => {
                    let _ = reply.send(Err(Error::Destroyed));
                }
            }
        }
    }
}

impl DisconnectHandler for OperationBuffer {
    fn add(&self, request: BufferedRequest) {
        debug!(?request, "buffering call while disconnected");
        self.queue.lock().push_back(request);
    }

    fn execute(&self, topology: Mongos) {
        let drained: Vec<BufferedRequest> = self.queue.lock().drain(..).collect();
        if drained.is_empty() {
            return;
        }
        debug!(count = drained.len(), "replaying buffered calls");
        for request in drained {
            let topology = topology.clone();
            tokio::spawn(async move {
                match request {
                    BufferedRequest::Operation { op, reply } => {
                        let result = topology.dispatch(op).await;
                        let _ = reply.send(result);
                    }
                    BufferedRequest::Auth { credential, reply } => {
                        let result = topology.auth(credential).await;
                        let _ = reply.send(result);
                    }
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Namespace, WriteOptions};

    fn insert_request() -> (BufferedRequest, oneshot::Receiver<Result<Document>>) {
        let (tx, rx) = oneshot::channel();
        let request = BufferedRequest::Operation {
            op: Operation::Insert {
                ns: Namespace::new("db", "coll"),
                docs: vec![bson::doc! {"x": 1}],
                options: WriteOptions::default(),
            },
            reply: tx,
        };
        (request, rx)
    }

    #[test]
    fn buffer_accumulates_in_order() {
        let buffer = OperationBuffer::new();
        assert!(buffer.is_empty());
        let (request, _rx) = insert_request();
        buffer.add(request);
        let (request, _rx2) = insert_request();
        buffer.add(request);
        assert_eq!(buffer.len(), 2);
    }

    #[tokio::test]
    async fn fail_all_resolves_pending_callers() {
        let buffer = OperationBuffer::new();
        let (request, rx) = insert_request();
        buffer.add(request);

        buffer.fail_all();
        assert!(buffer.is_empty());
        assert!(matches!(rx.await, Ok(Err(Error::Destroyed))));
    }
}

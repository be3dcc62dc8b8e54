//! Cursor construction.
//!
//! [`Mongos::cursor`](crate::Mongos::cursor) builds cursors synchronously;
//! no I/O happens until the cursor is first polled. The default cursor runs
//! the originating command through the topology on first use and drains the
//! reply's first batch; continuation (getMore) belongs to the iteration
//! layer above this crate.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use bson::{Bson, Document};

use crate::error::{Error, Result};
use crate::operation::{CommandOptions, Namespace, ReadPreference};
use crate::topology::Mongos;

/// Options for cursor construction.
#[derive(Clone, Default)]
pub struct CursorOptions {
    /// Requested batch size, injected into the command when set.
    pub batch_size: Option<i64>,
    /// Routing preference for the originating command.
    pub read_preference: ReadPreference,
    /// Factory overriding the topology-level cursor factory for this call.
    pub cursor_factory: Option<Arc<dyn CursorFactory>>,
}

/// Everything a cursor implementation needs: the topology to dispatch
/// through, the target namespace, and the originating command.
pub struct CursorContext {
    pub topology: Mongos,
    pub ns: Namespace,
    pub command: Document,
    pub options: CursorOptions,
}

/// A cursor over command results.
#[async_trait]
pub trait TopologyCursor: Send {
    /// Fetch the next document, `None` once exhausted.
    async fn next(&mut self) -> Result<Option<Document>>;

    /// The namespace this cursor reads from.
    fn namespace(&self) -> &Namespace;
}

/// Builder for custom cursor implementations.
pub trait CursorFactory: Send + Sync {
    fn build(&self, context: CursorContext) -> Box<dyn TopologyCursor>;
}

/// Default cursor: runs the command once and drains its first batch.
pub struct Cursor {
    context: CursorContext,
    started: bool,
    buffer: VecDeque<Document>,
}

impl Cursor {
    #[must_use]
    pub fn new(context: CursorContext) -> Self {
        Self {
            context,
            started: false,
            buffer: VecDeque::new(),
        }
    }

    async fn run_initial_command(&mut self) -> Result<()> {
        let mut command = self.context.command.clone();
        if let Some(batch_size) = self.context.options.batch_size {
            command.insert("batchSize", batch_size);
        }

        let reply = self
            .context
            .topology
            .command(
                self.context.ns.command_namespace(),
                command,
                CommandOptions {
                    read_preference: self.context.options.read_preference,
                    monitoring: false,
                },
            )
            .await?;

        self.buffer = first_batch(&reply)?;
        Ok(())
    }
}

/// Extract `cursor.firstBatch` from a command reply.
fn first_batch(reply: &Document) -> Result<VecDeque<Document>> {
    let cursor = reply
        .get_document("cursor")
        .map_err(|_| Error::InvalidResponse("reply has no cursor document".to_string()))?;
    let batch = cursor
        .get_array("firstBatch")
        .map_err(|_| Error::InvalidResponse("cursor reply has no firstBatch".to_string()))?;
    batch
        .iter()
        .map(|value| match value {
            Bson::Document(doc) => Ok(doc.clone()),
            other => Err(Error::InvalidResponse(format!(
                "non-document entry in firstBatch: {other}"
            ))),
        })
        .collect()
}

#[async_trait]
impl TopologyCursor for Cursor {
    async fn next(&mut self) -> Result<Option<Document>> {
        if !self.started {
            self.started = true;
            self.run_initial_command().await?;
        }
        Ok(self.buffer.pop_front())
    }

    fn namespace(&self) -> &Namespace {
        &self.context.ns
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_batch_extracts_documents() {
        let reply = bson::doc! {
            "cursor": {
                "id": 0_i64,
                "ns": "db.coll",
                "firstBatch": [{"x": 1}, {"x": 2}],
            },
            "ok": 1,
        };
        let batch = first_batch(&reply).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], bson::doc! {"x": 1});
    }

    #[test]
    fn malformed_replies_are_rejected() {
        assert!(first_batch(&bson::doc! {"ok": 1}).is_err());
        assert!(first_batch(&bson::doc! {"cursor": {"id": 0_i64}}).is_err());
    }
}

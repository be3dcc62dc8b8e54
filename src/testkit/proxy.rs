//! Mock [`ProxyTransport`] implementations for testing.
//!
//! Two mock proxy types for different testing needs:
//!
//! - [`ScriptedProxy`]: pops pre-loaded connect/command/auth results from
//!   queues (defaulting to success when exhausted) and simulates round-trip
//!   latency with a tokio sleep, so paused-clock tests observe exact
//!   latencies. Best for: selection windows, demotion, rehabilitation.
//!
//! - [`ChannelProxy`]: command replies are delivered externally through a
//!   [`ChannelProxyHandle`]. Best for: holding a probe in flight and
//!   resolving it exactly when the test chooses.
//!
//! [`ScriptedFactory`] hands registered proxies to the topology and
//! fabricates default ones for addresses with no script.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Document};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::config::ConnectionOptions;
use crate::error::{Error, Result};
use crate::operation::{CommandOptions, Credential, Namespace, WriteOptions};
use crate::proxy::{ProxyAddress, ProxyFactory, ProxyTransport};

/// A healthy mongos ismaster reply.
pub fn ismaster_doc() -> Document {
    doc! {
        "ismaster": true,
        "msg": "isdbgrid",
        "maxBsonObjectSize": 16_777_216_i32,
        "maxWireVersion": 6_i32,
        "ok": 1,
    }
}

/// An ismaster reply flagged as an arbiter (skipped by auth fan-outs).
pub fn arbiter_ismaster_doc() -> Document {
    let mut doc = ismaster_doc();
    doc.insert("arbiterOnly", true);
    doc
}

/// One write recorded by a [`ScriptedProxy`].
#[derive(Debug, Clone)]
pub struct RecordedWrite {
    pub kind: &'static str,
    pub ns: Namespace,
    pub docs: Vec<Document>,
}

// ---------------------------------------------------------------------------
// ScriptedProxy
// ---------------------------------------------------------------------------

/// A mock proxy with scripted results and simulated latency.
///
/// Result queues default to success when exhausted, so most tests only
/// script the interesting failures. All scripting methods take `&self`;
/// keep an `Arc` around to inspect the proxy after handing it to a
/// topology.
pub struct ScriptedProxy {
    address: ProxyAddress,
    latency: Mutex<Duration>,
    auth_latency: Mutex<Duration>,
    connect_results: Mutex<VecDeque<Result<Document>>>,
    command_results: Mutex<VecDeque<Result<Document>>>,
    auth_results: Mutex<VecDeque<Result<()>>>,
    write_results: Mutex<VecDeque<Result<Document>>>,
    connected: AtomicBool,
    destroyed: AtomicBool,
    unreffed: AtomicBool,
    connect_count: AtomicU32,
    command_count: AtomicU32,
    auth_count: AtomicU32,
    writes: Mutex<Vec<RecordedWrite>>,
    commands: Mutex<Vec<(Namespace, Document)>>,
}

impl ScriptedProxy {
    pub fn new(address: ProxyAddress) -> Self {
        Self {
            address,
            latency: Mutex::new(Duration::ZERO),
            auth_latency: Mutex::new(Duration::ZERO),
            connect_results: Mutex::new(VecDeque::new()),
            command_results: Mutex::new(VecDeque::new()),
            auth_results: Mutex::new(VecDeque::new()),
            write_results: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            unreffed: AtomicBool::new(false),
            connect_count: AtomicU32::new(0),
            command_count: AtomicU32::new(0),
            auth_count: AtomicU32::new(0),
            writes: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Simulated round-trip applied to connect and command calls.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Simulated duration of an auth exchange. Lets tests hold the
    /// topology's authentication latch open for a known span.
    pub fn set_auth_latency(&self, latency: Duration) {
        *self.auth_latency.lock() = latency;
    }

    pub fn push_connect_result(&self, result: Result<Document>) {
        self.connect_results.lock().push_back(result);
    }

    pub fn push_command_result(&self, result: Result<Document>) {
        self.command_results.lock().push_back(result);
    }

    pub fn push_auth_result(&self, result: Result<()>) {
        self.auth_results.lock().push_back(result);
    }

    pub fn push_write_result(&self, result: Result<Document>) {
        self.write_results.lock().push_back(result);
    }

    /// Mark the proxy connected without going through `connect`. For unit
    /// tests exercising selection directly.
    pub fn force_connected(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn command_count(&self) -> u32 {
        self.command_count.load(Ordering::SeqCst)
    }

    pub fn auth_count(&self) -> u32 {
        self.auth_count.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn unreffed(&self) -> bool {
        self.unreffed.load(Ordering::SeqCst)
    }

    /// Writes this proxy has executed, in order.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.writes.lock().clone()
    }

    /// Commands this proxy has executed (including monitoring probes).
    pub fn commands(&self) -> Vec<(Namespace, Document)> {
        self.commands.lock().clone()
    }

    async fn simulate_round_trip(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn record_write(&self, kind: &'static str, ns: &Namespace, docs: &[Document]) {
        self.writes.lock().push(RecordedWrite {
            kind,
            ns: ns.clone(),
            docs: docs.to_vec(),
        });
    }

    fn gate(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!(
                "connection to {} was destroyed",
                self.address
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyTransport for ScriptedProxy {
    async fn connect(&self) -> Result<Document> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.gate()?;
        self.simulate_round_trip().await;
        // The proxy may have been destroyed while the handshake was in
        // flight; a real connection would observe the close.
        self.gate()?;
        let result = self
            .connect_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ismaster_doc()));
        self.connected.store(result.is_ok(), Ordering::SeqCst);
        result
    }

    async fn command(
        &self,
        ns: &Namespace,
        command: Document,
        _options: &CommandOptions,
    ) -> Result<Document> {
        self.command_count.fetch_add(1, Ordering::SeqCst);
        self.gate()?;
        self.simulate_round_trip().await;
        self.commands.lock().push((ns.clone(), command));
        let result = self
            .command_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(ismaster_doc()));
        if result.is_err() {
            self.connected.store(false, Ordering::SeqCst);
        }
        result
    }

    async fn insert(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
        _options: &WriteOptions,
    ) -> Result<Document> {
        self.gate()?;
        self.record_write("insert", ns, &docs);
        let n = docs.len() as i32;
        self.write_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(doc! {"ok": 1, "n": n}))
    }

    async fn update(
        &self,
        ns: &Namespace,
        updates: Vec<Document>,
        _options: &WriteOptions,
    ) -> Result<Document> {
        self.gate()?;
        self.record_write("update", ns, &updates);
        let n = updates.len() as i32;
        self.write_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(doc! {"ok": 1, "n": n}))
    }

    async fn remove(
        &self,
        ns: &Namespace,
        deletes: Vec<Document>,
        _options: &WriteOptions,
    ) -> Result<Document> {
        self.gate()?;
        self.record_write("remove", ns, &deletes);
        let n = deletes.len() as i32;
        self.write_results
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(doc! {"ok": 1, "n": n}))
    }

    async fn auth(&self, _credential: &Credential) -> Result<()> {
        self.auth_count.fetch_add(1, Ordering::SeqCst);
        self.gate()?;
        let latency = *self.auth_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.auth_results.lock().pop_front().unwrap_or(Ok(()))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn address(&self) -> &ProxyAddress {
        &self.address
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn unref(&self) {
        self.unreffed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// ChannelProxy
// ---------------------------------------------------------------------------

/// A mock proxy controlled externally via a [`ChannelProxyHandle`].
///
/// `command` parks until the handle delivers the next reply, so tests decide
/// exactly when an in-flight probe resolves. Dropping the handle closes the
/// channel and fails any parked or later command. Connects and writes
/// succeed immediately. No real network I/O.
pub struct ChannelProxy {
    address: ProxyAddress,
    reply_rx: AsyncMutex<mpsc::Receiver<Result<Document>>>,
    connected: AtomicBool,
    destroyed: AtomicBool,
    unreffed: AtomicBool,
    connect_count: Arc<AtomicU32>,
    command_count: Arc<AtomicU32>,
    commands: Arc<Mutex<Vec<(Namespace, Document)>>>,
}

/// Control handle for a [`ChannelProxy`].
pub struct ChannelProxyHandle {
    reply_tx: mpsc::Sender<Result<Document>>,
    connect_count: Arc<AtomicU32>,
    command_count: Arc<AtomicU32>,
    commands: Arc<Mutex<Vec<(Namespace, Document)>>>,
}

impl ChannelProxyHandle {
    /// Deliver the reply for the oldest parked command.
    pub async fn send(&self, reply: Result<Document>) {
        let _ = self.reply_tx.send(reply).await;
    }

    /// How many times `connect()` was called.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// How many times `command()` was called.
    pub fn command_count(&self) -> u32 {
        self.command_count.load(Ordering::SeqCst)
    }

    /// Commands the proxy has received (including monitoring probes).
    pub fn commands(&self) -> Vec<(Namespace, Document)> {
        self.commands.lock().clone()
    }
}

/// Create a [`ChannelProxy`] and its control [`ChannelProxyHandle`].
pub fn channel_proxy(address: ProxyAddress, buffer: usize) -> (Arc<ChannelProxy>, ChannelProxyHandle) {
    let (tx, rx) = mpsc::channel(buffer);
    let cc = Arc::new(AtomicU32::new(0));
    let mc = Arc::new(AtomicU32::new(0));
    let cmds = Arc::new(Mutex::new(Vec::new()));
    (
        Arc::new(ChannelProxy {
            address,
            reply_rx: AsyncMutex::new(rx),
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            unreffed: AtomicBool::new(false),
            connect_count: cc.clone(),
            command_count: mc.clone(),
            commands: cmds.clone(),
        }),
        ChannelProxyHandle {
            reply_tx: tx,
            connect_count: cc,
            command_count: mc,
            commands: cmds,
        },
    )
}

impl ChannelProxy {
    pub fn destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn unreffed(&self) -> bool {
        self.unreffed.load(Ordering::SeqCst)
    }

    fn gate(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!(
                "connection to {} was destroyed",
                self.address
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ProxyTransport for ChannelProxy {
    async fn connect(&self) -> Result<Document> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        self.gate()?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(ismaster_doc())
    }

    async fn command(
        &self,
        ns: &Namespace,
        command: Document,
        _options: &CommandOptions,
    ) -> Result<Document> {
        self.command_count.fetch_add(1, Ordering::SeqCst);
        self.gate()?;
        self.commands.lock().push((ns.clone(), command));
        let reply = self.reply_rx.lock().await.recv().await;
        match reply {
            Some(Ok(doc)) => Ok(doc),
            Some(Err(err)) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(err)
            }
            None => {
                self.connected.store(false, Ordering::SeqCst);
                Err(Error::Connection("reply channel closed".to_string()))
            }
        }
    }

    async fn insert(
        &self,
        _ns: &Namespace,
        docs: Vec<Document>,
        _options: &WriteOptions,
    ) -> Result<Document> {
        self.gate()?;
        Ok(doc! {"ok": 1, "n": docs.len() as i32})
    }

    async fn update(
        &self,
        _ns: &Namespace,
        updates: Vec<Document>,
        _options: &WriteOptions,
    ) -> Result<Document> {
        self.gate()?;
        Ok(doc! {"ok": 1, "n": updates.len() as i32})
    }

    async fn remove(
        &self,
        _ns: &Namespace,
        deletes: Vec<Document>,
        _options: &WriteOptions,
    ) -> Result<Document> {
        self.gate()?;
        Ok(doc! {"ok": 1, "n": deletes.len() as i32})
    }

    async fn auth(&self, _credential: &Credential) -> Result<()> {
        self.gate()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn address(&self) -> &ProxyAddress {
        &self.address
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn unref(&self) {
        self.unreffed.store(true, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// ScriptedFactory
// ---------------------------------------------------------------------------

/// Factory handing out registered [`ScriptedProxy`]s by address.
///
/// Each `create` call pops the next registered proxy for that address;
/// addresses with no remaining script get a fresh default-success proxy.
/// Everything ever handed out is retained in [`created`](Self::created)
/// for inspection.
#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<String, VecDeque<Arc<ScriptedProxy>>>>,
    created: Mutex<Vec<Arc<ScriptedProxy>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a proxy to be returned for its address.
    pub fn register(&self, proxy: Arc<ScriptedProxy>) {
        self.scripts
            .lock()
            .entry(proxy.address().to_string())
            .or_default()
            .push_back(proxy);
    }

    /// Every proxy this factory has handed out, in creation order.
    pub fn created(&self) -> Vec<Arc<ScriptedProxy>> {
        self.created.lock().clone()
    }

    /// Proxies handed out for a specific address.
    pub fn created_for(&self, address: &str) -> Vec<Arc<ScriptedProxy>> {
        self.created
            .lock()
            .iter()
            .filter(|p| p.address().to_string() == address)
            .cloned()
            .collect()
    }
}

impl ProxyFactory for ScriptedFactory {
    fn create(
        &self,
        address: &ProxyAddress,
        _options: &ConnectionOptions,
    ) -> Arc<dyn ProxyTransport> {
        let scripted = self
            .scripts
            .lock()
            .get_mut(&address.to_string())
            .and_then(VecDeque::pop_front);
        let proxy = scripted.unwrap_or_else(|| Arc::new(ScriptedProxy::new(address.clone())));
        self.created.lock().push(proxy.clone());
        proxy
    }
}

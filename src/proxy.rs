//! Proxy collaborator ports and the handle bookkeeping built on top of them.
//!
//! The topology never touches a socket. Everything wire-level (TCP, message
//! framing, handshakes, per-proxy connection pooling, concrete auth
//! mechanisms) lives behind [`ProxyTransport`], and new transports are
//! minted through [`ProxyFactory`]. What the topology owns is the
//! bookkeeping around those transports: one [`ProxyHandle`] per proxy,
//! grouped into the three insertion-ordered [`ProxySet`]s.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bson::Document;

use crate::config::ConnectionOptions;
use crate::error::{Error, Result};
use crate::operation::{CommandOptions, Credential, Namespace, WriteOptions};

/// A `host:port` proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyAddress {
    pub host: String,
    pub port: u16,
}

impl ProxyAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ProxyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ProxyAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::Connection(format!("invalid proxy address: {s}")))?;
        let port = port
            .parse()
            .map_err(|_| Error::Connection(format!("invalid proxy address: {s}")))?;
        if host.is_empty() {
            return Err(Error::Connection(format!("invalid proxy address: {s}")));
        }
        Ok(Self::new(host, port))
    }
}

/// The last ismaster reply received from a proxy.
///
/// Kept as the raw document with typed accessors for the fields the
/// topology itself consults.
#[derive(Debug, Clone, PartialEq)]
pub struct IsMaster(Document);

impl IsMaster {
    #[must_use]
    pub fn new(doc: Document) -> Self {
        Self(doc)
    }

    /// Whether the responding member is an arbiter. Arbiters are skipped by
    /// the authentication fan-out.
    #[must_use]
    pub fn arbiter_only(&self) -> bool {
        self.0.get_bool("arbiterOnly").unwrap_or(false)
    }

    /// The reply's `ok` field.
    #[must_use]
    pub fn ok(&self) -> bool {
        matches!(self.0.get("ok"), Some(v) if v.as_f64() == Some(1.0) || v.as_i32() == Some(1) || v.as_i64() == Some(1))
    }

    /// The raw reply document.
    #[must_use]
    pub fn document(&self) -> &Document {
        &self.0
    }
}

/// A single proxy connection: the external collaborator the topology
/// dispatches to.
///
/// # Lifecycle
///
/// 1. [`connect`](Self::connect) performs the transport handshake and
///    returns the ismaster reply.
/// 2. Operations run against the connection until it fails or the topology
///    [`destroy`](Self::destroy)s it.
///
/// # Thread safety
///
/// Implementations must be `Send + Sync`; the topology calls them from
/// spawned tasks and keeps only `Arc` references. `destroy` must be
/// idempotent.
#[async_trait]
pub trait ProxyTransport: Send + Sync {
    /// Establish the connection and run the handshake.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// handshake fails.
    async fn connect(&self) -> Result<Document>;

    /// Execute a command against the proxy.
    async fn command(
        &self,
        ns: &Namespace,
        command: Document,
        options: &CommandOptions,
    ) -> Result<Document>;

    /// Insert documents.
    async fn insert(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
        options: &WriteOptions,
    ) -> Result<Document>;

    /// Apply update statements.
    async fn update(
        &self,
        ns: &Namespace,
        updates: Vec<Document>,
        options: &WriteOptions,
    ) -> Result<Document>;

    /// Apply delete statements.
    async fn remove(
        &self,
        ns: &Namespace,
        deletes: Vec<Document>,
        options: &WriteOptions,
    ) -> Result<Document>;

    /// Authenticate this connection.
    async fn auth(&self, credential: &Credential) -> Result<()>;

    /// Whether the underlying connection is currently usable.
    fn is_connected(&self) -> bool;

    /// The endpoint this transport is bound to.
    fn address(&self) -> &ProxyAddress;

    /// Tear the connection down. Idempotent.
    fn destroy(&self);

    /// Detach the connection from the runtime without closing it.
    fn unref(&self);
}

/// Factory minting transports for the topology.
///
/// Called once per seed at connect time and once per rehabilitation
/// attempt; each call must return a fresh, unconnected transport.
pub trait ProxyFactory: Send + Sync {
    fn create(&self, address: &ProxyAddress, options: &ConnectionOptions)
        -> Arc<dyn ProxyTransport>;
}

/// A proxy as the topology tracks it: the transport plus the description
/// and latency learned from its last successful ismaster.
pub(crate) struct ProxyHandle {
    name: String,
    address: ProxyAddress,
    pub(crate) transport: Arc<dyn ProxyTransport>,
    pub(crate) last_ismaster: Option<IsMaster>,
    pub(crate) last_rtt: Option<Duration>,
}

impl ProxyHandle {
    pub(crate) fn new(address: ProxyAddress, transport: Arc<dyn ProxyTransport>) -> Self {
        Self {
            name: address.to_string(),
            address,
            transport,
            last_ismaster: None,
            last_rtt: None,
        }
    }

    /// `host:port`, the key under which the handle lives in its set.
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn address(&self) -> &ProxyAddress {
        &self.address
    }

    /// Whether the last known description marks this proxy as an arbiter.
    pub(crate) fn arbiter_only(&self) -> bool {
        self.last_ismaster
            .as_ref()
            .map(IsMaster::arbiter_only)
            .unwrap_or(false)
    }

    /// Tear down the underlying transport.
    pub(crate) fn destroy(&self) {
        self.transport.destroy();
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyHandle")
            .field("name", &self.name)
            .field("last_rtt", &self.last_rtt)
            .field("connected", &self.transport.is_connected())
            .finish()
    }
}

/// An insertion-ordered set of proxy handles keyed by `host:port`.
///
/// Insertion order is load-bearing: the selector's rotation and all
/// tie-breaks follow it.
#[derive(Debug, Default)]
pub(crate) struct ProxySet {
    items: Vec<ProxyHandle>,
}

impl ProxySet {
    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.items.iter().any(|h| h.name() == name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut ProxyHandle> {
        self.items.iter_mut().find(|h| h.name() == name)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ProxyHandle> {
        self.items.iter()
    }

    pub(crate) fn as_slice(&self) -> &[ProxyHandle] {
        &self.items
    }

    pub(crate) fn push(&mut self, handle: ProxyHandle) {
        self.items.push(handle);
    }

    /// Remove and return every handle with the given name.
    pub(crate) fn remove_all(&mut self, name: &str) -> Vec<ProxyHandle> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.items.len() {
            if self.items[i].name() == name {
                removed.push(self.items.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Remove and return all handles, emptying the set.
    pub(crate) fn drain(&mut self) -> Vec<ProxyHandle> {
        std::mem::take(&mut self.items)
    }
}

/// Atomically transfer the handle named `name` from one set to another.
///
/// Every same-name entry is removed from *both* sets first, and the
/// surviving handle (the first match in `from`) is appended to `to`. This is
/// what keeps a proxy from appearing twice in a set even when a stale entry
/// and its replacement briefly coexist.
///
/// Ownership rule: entries displaced from the *destination* are being
/// replaced and are destroyed here; entries vacuumed from the *source* still
/// belong to an in-flight attempt whose settlement decides their fate, so
/// they are dropped untouched.
pub(crate) fn transfer(from: &mut ProxySet, to: &mut ProxySet, name: &str) -> bool {
    let mut removed = from.remove_all(name);
    if removed.is_empty() {
        return false;
    }
    let survivor = removed.remove(0);
    for stale in to.remove_all(name) {
        stale.destroy();
    }
    to.push(survivor);
    true
}

/// Install a freshly built handle into `to`, vacuuming any same-name entry
/// from both sets. Used when the handle arriving was never registered in a
/// set (rehabilitation replacements) or replaces its own placeholder (seed
/// settlement). The same ownership rule as [`transfer`] applies.
pub(crate) fn install(from: &mut ProxySet, to: &mut ProxySet, handle: ProxyHandle) {
    from.remove_all(handle.name());
    for stale in to.remove_all(handle.name()) {
        stale.destroy();
    }
    to.push(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::proxy::ScriptedProxy;

    fn handle(name: &str) -> ProxyHandle {
        let address: ProxyAddress = name.parse().unwrap();
        let transport = Arc::new(ScriptedProxy::new(address.clone()));
        ProxyHandle::new(address, transport)
    }

    #[test]
    fn address_round_trips_through_display() {
        let address: ProxyAddress = "localhost:27017".parse().unwrap();
        assert_eq!(address.host, "localhost");
        assert_eq!(address.port, 27017);
        assert_eq!(address.to_string(), "localhost:27017");
    }

    #[test]
    fn bad_addresses_are_rejected() {
        assert!("localhost".parse::<ProxyAddress>().is_err());
        assert!(":27017".parse::<ProxyAddress>().is_err());
        assert!("localhost:notaport".parse::<ProxyAddress>().is_err());
    }

    #[test]
    fn ismaster_reads_arbiter_flag() {
        let doc = bson::doc! {"ismaster": true, "arbiterOnly": true, "ok": 1};
        let ismaster = IsMaster::new(doc);
        assert!(ismaster.arbiter_only());
        assert!(ismaster.ok());

        let plain = IsMaster::new(bson::doc! {"ismaster": true, "ok": 1.0});
        assert!(!plain.arbiter_only());
        assert!(plain.ok());
    }

    #[test]
    fn transfer_moves_between_sets() {
        let mut from = ProxySet::default();
        let mut to = ProxySet::default();
        from.push(handle("a:1"));
        from.push(handle("b:2"));

        assert!(transfer(&mut from, &mut to, "a:1"));
        assert_eq!(from.len(), 1);
        assert_eq!(to.len(), 1);
        assert!(to.contains("a:1"));
        assert!(!transfer(&mut from, &mut to, "missing:3"));
    }

    #[test]
    fn transfer_collapses_duplicates() {
        let mut from = ProxySet::default();
        let mut to = ProxySet::default();
        let sibling = Arc::new(ScriptedProxy::new("a:1".parse().unwrap()));
        let displaced = Arc::new(ScriptedProxy::new("a:1".parse().unwrap()));
        from.push(handle("a:1"));
        from.push(ProxyHandle::new("a:1".parse().unwrap(), sibling.clone()));
        to.push(ProxyHandle::new("a:1".parse().unwrap(), displaced.clone()));

        assert!(transfer(&mut from, &mut to, "a:1"));
        assert!(from.is_empty());
        assert_eq!(to.len(), 1);
        // The destination's stale entry is replaced and destroyed; the
        // source's sibling still belongs to its in-flight attempt.
        assert!(displaced.destroyed());
        assert!(!sibling.destroyed());
    }

    #[test]
    fn install_displaces_stale_entries() {
        let mut disconnected = ProxySet::default();
        let mut connected = ProxySet::default();
        disconnected.push(handle("a:1"));

        install(&mut disconnected, &mut connected, handle("a:1"));
        assert!(disconnected.is_empty());
        assert_eq!(connected.len(), 1);
    }

    #[test]
    fn sets_preserve_insertion_order() {
        let mut set = ProxySet::default();
        set.push(handle("a:1"));
        set.push(handle("b:2"));
        set.push(handle("c:3"));
        let names: Vec<_> = set.iter().map(|h| h.name().to_string()).collect();
        assert_eq!(names, ["a:1", "b:2", "c:3"]);
    }
}

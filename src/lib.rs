//! Client-side topology management for MongoDB sharded-cluster routers.
//!
//! A [`Mongos`] topology takes a seed list of router (`mongos`) addresses,
//! brings them up without blocking callers, keeps probing them for health
//! and latency, and routes every operation to one eligible proxy using a
//! latency-windowed round-robin. Proxies that fail are demoted and
//! continually rebuilt; operations submitted while offline can be parked in
//! a [`DisconnectHandler`] and replayed on reconnect.
//!
//! Wire-level concerns (sockets, protocol framing, BSON encoding, concrete
//! auth mechanisms) live behind the [`ProxyTransport`] port; this crate is
//! the coordination core a driver builds on.
//!
//! # Architecture
//!
//! ```text
//! src/
//! ├── topology/     # The Mongos handle and its state-owning actor
//! │   ├── state     # Lifecycle state machine + the three proxy sets
//! │   ├── monitor   # HA ticks, ismaster probes, rehabilitation
//! │   └── auth      # Authentication fan-out
//! ├── proxy         # ProxyTransport / ProxyFactory ports + handle sets
//! ├── selection     # Latency-windowed round-robin
//! ├── operation     # Namespaces, operation envelopes, credentials
//! ├── cursor        # Synchronous cursor construction
//! ├── buffer        # Buffered-offline collaborator
//! └── event         # Broadcast fan-out of membership/SDAM events
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mongos_topology::{Mongos, Namespace, ProxyAddress, TopologyConfig, WriteOptions};
//! # use mongos_topology::ProxyFactory;
//! # fn transport_factory() -> Arc<dyn ProxyFactory> { unimplemented!() }
//!
//! # async fn run() -> mongos_topology::Result<()> {
//! let seeds = vec![
//!     ProxyAddress::new("router-a", 27017),
//!     ProxyAddress::new("router-b", 27017),
//! ];
//! let topology = Mongos::new(seeds, transport_factory(), TopologyConfig::default())?;
//! topology.connect();
//!
//! // ... once connected:
//! let ns: Namespace = "app.events".parse()?;
//! topology
//!     .insert(ns, vec![bson::doc! {"hello": "world"}], WriteOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod config;
pub mod cursor;
pub mod error;
pub mod event;
pub mod operation;
pub mod proxy;
mod selection;
pub mod topology;

#[cfg(any(test, feature = "testkit"))]
pub mod testkit;

pub use buffer::{BufferedRequest, DisconnectHandler, OperationBuffer};
pub use config::{ConnectionOptions, TlsOptions, TopologyConfig, DEFAULT_AUTH_PROVIDERS};
pub use cursor::{Cursor, CursorContext, CursorFactory, CursorOptions, TopologyCursor};
pub use error::{AuthFailure, Error, Result};
pub use event::TopologyEvent;
pub use operation::{
    CommandOptions, Credential, Namespace, Operation, ReadPreference, WriteOptions,
};
pub use proxy::{IsMaster, ProxyAddress, ProxyFactory, ProxyTransport};
pub use topology::{Mongos, SelectedProxy, TopologyState};

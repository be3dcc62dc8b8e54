//! Shared test utilities available to both unit and integration tests.
//!
//! Enabled via `#[cfg(test)]` (unit tests) or the `testkit` feature
//! (integration tests and downstream suites).
//!
//! # Modules
//!
//! - [`proxy`]: mock [`ProxyTransport`](crate::proxy::ProxyTransport)
//!   implementations: `ScriptedProxy` with scripted results and latency,
//!   `ChannelProxy` with externally delivered replies, and
//!   `ScriptedFactory` for wiring them into a topology.

pub mod proxy;

pub use proxy::{
    arbiter_ismaster_doc, channel_proxy, ismaster_doc, ChannelProxy, ChannelProxyHandle,
    ScriptedFactory, ScriptedProxy,
};

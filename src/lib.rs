//! cad-bridge: dispatch bridge for single-threaded CAD automation APIs
//!
//! This library marshals asynchronous, concurrent tool-call requests onto the
//! one execution thread a host CAD application permits. Network threads
//! route and validate requests; host-API work is queued and executed serially
//! by a drain loop pinned to the host thread.
//!
//! # Architecture
//!
//! - **Router** matches path+method, extracts `{name}` path parameters, and
//!   dispatches to registered handlers.
//! - **Validator** applies declarative per-route parameter rules.
//! - **Registry** holds named, categorised capabilities with declared
//!   parameter schemas.
//! - **Loader** discovers module manifests and binds them to compiled-in
//!   capability providers, tracking per-module health.
//! - **Task queue** carries host-API work from network threads to the drain
//!   loop; ordering is `(priority, sequence)`.
//! - **Error handler** aggregates categorised faults with bounded history
//!   and recovery callbacks.
//!
//! # Modules
//!
//! - [`client`] — outbound client for forwarding to a remote dispatcher
//! - [`config`] — configuration loading and validation
//! - [`dispatch`] — the dispatch substrate
//! - [`error`] — configuration error types
//! - [`providers`] — built-in capability providers
//! - [`server`] — HTTP transport boundary

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod providers;
pub mod server;

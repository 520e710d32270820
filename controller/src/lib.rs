//! # burrow-controller
//!
//! Control plane of the burrow reverse-tunnel platform. A fleet of edge
//! agents — Newts terminating tunnels per site, Olms running redundant local
//! resolvers — connect inbound over persistent channels; the controller
//! derives each agent's configuration from relational state and pushes
//! deltas whenever operator edits or target-health signals change the
//! answer.
//!
//! The moving parts:
//!
//! - [`store`] — the relational source of truth (PostgreSQL, with an
//!   in-memory twin for tests and local development)
//! - [`bus`] — one bounded, order-preserving channel per connected agent;
//!   best-effort sends, inbound dispatch by message type
//! - [`dns`] — rebuilds per-resource zone configs and fans them out to the
//!   agents that answer for them
//! - [`authproxy`] — per-site auth-proxy configuration for request gating at
//!   the edge
//! - [`health`] — ingests per-target health reports, tenancy-checked
//! - [`sync`] — rebuilds an agent's whole view at (re)connect
//! - [`keys`] / [`session`] — the RSA keypair and the out-of-band
//!   session-validation endpoint backing SSO gating
//!
//! Messages are advisory full snapshots: any dropped push is repaired by the
//! next reconciliation or the agent's reconnect-time resync.

pub mod authproxy;
pub mod bus;
pub mod config;
pub mod dns;
pub mod error;
pub mod health;
pub mod keys;
pub mod model;
pub mod server;
pub mod session;
pub mod state;
pub mod store;
pub mod sync;

pub use config::Config;
pub use error::{Error, Result};
pub use state::AppState;

//! # OJP proxy core
//!
//! Connection virtualization for relational databases. Clients hold cheap
//! virtual sessions; a proxy node binds a pooled backend connection to a
//! session only while a statement, cursor or transaction needs one.
//!
//! Several nodes share one database. Each client relays its view of which
//! nodes are healthy, and every node sizes its pools to its share of the
//! cluster-wide totals.
//!
//! ## Layout
//!
//! - [`node`]: the proxy node, its wire messages and TCP server
//! - [`session`]: sessions and the connection retention rule
//! - [`pool`], [`segregation`], [`health`], [`capacity`]: backend pools,
//!   fast/slow slots, circuit breakers and cluster-aware sizing
//! - [`xa`]: distributed transaction branches over reusable XA sessions
//! - [`client`]: endpoint URLs and the multinode router

pub mod args;
pub mod backend;
pub mod capacity;
pub mod client;
pub mod config;
pub mod error;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod node;
pub mod pool;
pub mod runtime;
pub mod segregation;
pub mod session;
pub mod types;
pub mod xa;

pub use client::{EndpointUrl, InProcessTransport, MultinodeRouter, TcpTransport, Transport};
pub use config::{ClientConfig, Config, create_default_config, load_config};
pub use error::{ProxyError, XaErrorCode};
pub use node::{NodeServer, ProxyNode};
pub use session::SessionManager;

//! dtest-harness
//!
//! A test harness control plane for provisioning, supervising, and mutating
//! clusters of database server processes during integration test runs. Each
//! test gets its own [`Manager`], which owns a [`Cluster`] leased from a
//! [`ClusterPool`] and exposes it over a local Unix-socket HTTP API so
//! out-of-process test drivers (in any language) can install servers, start
//! and stop them, inject faults, and inspect state without linking against
//! this crate directly.
//!
//! # Components
//!
//! - [`HostRegistry`]: leases unique loopback addresses for the lifetime of
//!   a test session.
//! - [`Server`]: owns one subprocess through install, start, readiness,
//!   mutation, and teardown.
//! - [`Cluster`]: aggregates Servers sharing a seed list, tracking which are
//!   running, stopped, or removed, and whether the cluster is safe to reuse.
//! - [`ClusterPool`]: keeps a bounded number of warm Clusters so tests don't
//!   pay full provisioning cost inline; retires dirty ones instead of
//!   reusing them.
//! - [`Manager`]: the per-test façade that binds the control-plane socket.
//!
//! # External collaborators
//!
//! Three concerns are deliberately kept outside this crate's scope and
//! exposed as injectable trait seams so the core stays testable without a
//! real server binary: [`admin_client::AdminApi`] (the server's own admin
//! REST surface), [`query_probe::QueryProbe`] (the query-protocol
//! connectivity check), and [`schema_probe::SchemaProbe`] (keyspace
//! inspection for postcondition checks). Each ships a default
//! implementation suitable for a real ScyllaDB-style server binary, and the
//! [`testing`] module provides fakes for use in this crate's own test
//! suite and in downstream integration tests.
//!
//! # Configuration
//!
//! Per-server configuration is a YAML document (see [`config`]), built by
//! layering a baseline onto per-server overrides the same way command lines
//! are merged in [`cmdline`].
//!
//! # Errors
//!
//! All fallible operations return [`error::HarnessError`] via the crate's
//! [`Result`] alias. Cluster mutators exposed over HTTP instead return an
//! [`ids::ActionResult`], the wire-level success/message/data envelope.

pub mod admin_client;
pub mod cluster;
pub mod cmdline;
pub mod config;
pub mod error;
pub mod host_registry;
pub mod ids;
pub mod manager;
pub mod pool;
pub mod query_probe;
pub mod schema_probe;
pub mod server;

#[cfg(feature = "test-support")]
pub mod testing;

pub use cluster::{AddServerOptions, Cluster, ClusterDeps};
pub use error::{HarnessError, Result};
pub use host_registry::HostRegistry;
pub use ids::{ActionResult, HostId, IpAddress, ReplaceConfig, ServerId, ServerIdGenerator};
pub use manager::Manager;
pub use pool::ClusterPool;
pub use server::Server;

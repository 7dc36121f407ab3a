//! Warden keeps a desktop knowledge-capture app's moving parts alive.
//!
//! It supervises the long-running worker process, exposes a loopback control
//! plane for tool calls, relays the worker's server-sent event stream across
//! restarts, and fans graph mutations out to consumers with gap detection.
//!
//! | Component | Failure handling |
//! |-----------|------------------|
//! | **Supervisor** | Capped exponential restart, give-up after repeated crashes, SIGTERM before SIGKILL |
//! | **Control plane** | Per-request task isolation, timeout, body limit, rate limit |
//! | **Stream gateway** | Reconnect with backoff, endpoint re-resolved every attempt |
//! | **Delta broadcaster** | Sequence numbers, snapshot resync on any gap |
//! | **Port registry** | File-locked leases, stale owners reclaimed |
//!
//! # Modules
//!
//! - [`config`]: TOML configuration with environment overrides
//! - [`supervisor`]: worker spawning, restart policy, staged shutdown
//! - [`server`]: the HTTP control plane; [`tools`] holds the tool set
//! - [`stream`]: the event stream gateway and its SSE client
//! - [`graph`]: graph store and delta broadcaster
//! - [`layout`]: view mode and saved positions
//! - [`ports`]: the port lease registry
//! - [`bridge`]: queued delivery to the presentation layer
//! - [`app`]: startup and shutdown ordering

pub mod app;
pub mod backoff;
pub mod bridge;
pub mod config;
pub mod graph;
pub mod layout;
pub mod ports;
pub mod server;
pub mod stream;
pub mod supervisor;
pub mod tools;

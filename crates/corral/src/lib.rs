//! corral - control plane for a fleet of sandbox hosts.
//!
//! Sandbox-host daemons dial in over long-lived bidirectional streams;
//! corral keeps an authoritative in-memory table of who is connected and
//! what they advertise, and turns the stream into synchronous
//! command/response calls for the orchestration layer sitting above it.
//!
//! The moving parts:
//! - [`registry::HostRegistry`] - the connected-host table
//! - [`session`] - per-stream state machine (handshake, receive loop, teardown)
//! - [`correlation::CorrelationTable`] - request/response matching
//! - [`monitor`] - per-session heartbeat staleness checks
//! - [`store`] - fire-and-forget persistence of host records
//! - [`dispatcher::Dispatcher`] - the `send_and_wait` facade
//! - [`server::ControlPlane`] - the ROUTER listener tying it together

pub mod correlation;
pub mod dispatcher;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;

pub use dispatcher::Dispatcher;
pub use error::DispatchError;
pub use registry::{HostInfo, HostRegistry, HostStatus};
pub use server::{ControlPlane, ControlPlaneConfig};
pub use session::{PeerId, SendHandle, SessionConfig};
pub use store::{HostStore, SqliteStore, StoreHandle};

//! tunl tunnel server library.
//!
//! Provides the building blocks of the edge server so it can be embedded in
//! other binaries and driven directly from integration tests: the public
//! HTTP dispatcher, the websocket control plane, the tunnel registry, the
//! pending-request table, and the liveness supervisor.

mod config;
mod control;
mod edge;
mod events;
mod liveness;
mod pending;
mod registry;
mod sessions;
mod users;

pub use config::ServerConfig;
pub use control::ControlPlane;
pub use edge::EdgeServer;
pub use events::{EventSink, NullSink, RequestLog, TunnelClosed, TunnelOpened};
pub use liveness::LivenessSupervisor;
pub use pending::{PendingTable, RequestMetadata, ResponseData};
pub use registry::{RegisterError, Registry, TunnelHandle};
pub use sessions::{SessionHandle, SessionSet};
pub use users::{MemoryUserDirectory, UserDirectory, UserRecord};

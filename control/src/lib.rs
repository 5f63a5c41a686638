//! The control service: a single-writer HTTP/JSON RPC facade over the
//! network engine, with concurrent streaming status.

pub mod routes;
pub mod service;
pub mod stream;
pub mod types;

pub use routes::create_router;
pub use service::{ControlService, ServiceConfig, State};

/// Version of the RPC surface, reported by `RPCVersion`.
pub const RPC_VERSION: u32 = 1;

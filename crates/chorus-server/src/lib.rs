pub mod client;
pub mod envelope;
pub mod error;
pub mod relay;
pub mod server;

pub use client::{Connection, ConnectionRegistry};
pub use envelope::{EnvelopeError, InboundEnvelope, OutboundEnvelope};
pub use error::ServerError;
pub use relay::{Outlet, Relay};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle, Services};

pub mod compat;
pub mod connection;
pub mod handlers;
pub mod rpc;
pub mod server;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};

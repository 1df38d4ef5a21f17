//! API module for the cache administration HTTP server

pub mod routes;
pub mod server;

pub use server::{router, ApiServer, ApiServerConfig};

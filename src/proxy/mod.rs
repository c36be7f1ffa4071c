pub mod auth;
pub mod connect;
pub mod error;
pub mod forward;
pub mod http;
pub mod relay;
pub mod server;
pub mod tls;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{ProxyError, ProxyResult};
pub use server::{ProxyServer, ProxyState};

//! HTTP surface: listener, request pipeline and system endpoints.

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod module;

pub use config::{NetworkConfig, TlsConfig};
pub use handlers::AppState;
pub use module::{build_app, HttpApp, NetworkModule, SYSTEM_PATHS};

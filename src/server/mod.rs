mod batch_routes;
pub mod config;
mod envelope;
mod http_layers;
pub mod metrics;
pub mod server;
pub(self) mod session;
pub mod state;

pub use config::ServerConfig;
pub use http_layers::*;
#[allow(unused_imports)] // Used by main.rs
pub use server::{make_app, run_server};

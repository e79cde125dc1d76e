pub mod config;
pub mod server;
pub mod session;

pub use config::ServerConfig;

//! Pool side of a mining proxy: keeps one upstream pool session alive while
//! miners are attached, fails over between pools, and forwards each share
//! upstream at most once.

pub mod config;
pub mod endpoint;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod miners;
pub mod scheduler;
pub mod supervisor;
pub mod transport;
pub mod work;


pub use config::{load_config, Endpoint, Protocol, ProxyConfig};
pub use error::{ConfigError, ProxyError, TransportError};
pub use supervisor::{Collaborators, PoolSupervisor, SessionState};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("fail to read config file: {0}")]
    Read(#[from] io::Error),
    #[error("fail to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no pool endpoints configured")]
    NoEndpoints,
    #[error("`{0}` must be greater than zero")]
    ZeroInterval(&'static str),
}

/// transport level faults, both count toward failover
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("fail to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    #[error("connection fault: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fail to listen for miners on port {port}: {source}")]
    Listen {
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("no tokio runtime available")]
    NoRuntime,
}

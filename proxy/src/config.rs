use std::{
    fmt::{Display, Formatter},
    fs::File,
    io::BufReader,
    path::Path,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use shared::types::WorkerName;

use crate::error::ConfigError;

const DEFAULT_GET_WORK_INTERVAL_MS: u64 = 1000;
const DEFAULT_STATS_INTERVAL_MS: u64 = 60_000;

/// one candidate upstream pool and the credentials used to log in to it
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
    pub wallet: String,
    pub worker: WorkerName,
    #[serde(default = "default_password")]
    pub password: String,
    /// some pools key the hashrate report on an id distinct from the worker
    #[serde(default)]
    pub hashrate_id: Option<String>,
}

fn default_password() -> String {
    "x".to_string()
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Stratum,
    EthProxy,
    CryptoNote,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Stratum => "stratum",
            Protocol::EthProxy => "eth_proxy",
            Protocol::CryptoNote => "cryptonote",
        };
        f.write_str(name)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    /// ordered by preference, failover walks them circularly
    pub pools: Vec<Endpoint>,
    /// port the miner listener binds
    pub local_port: u16,
    #[serde(default = "default_get_work_interval")]
    pub get_work_interval_ms: u64,
    #[serde(default = "default_stats_interval")]
    pub stats_interval_ms: u64,
    pub protocol: Protocol,
}

fn default_get_work_interval() -> u64 {
    DEFAULT_GET_WORK_INTERVAL_MS
}

fn default_stats_interval() -> u64 {
    DEFAULT_STATS_INTERVAL_MS
}

impl ProxyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        if self.get_work_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("getWorkIntervalMs"));
        }
        if self.stats_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("statsIntervalMs"));
        }
        Ok(())
    }

    pub fn get_work_interval(&self) -> Duration {
        Duration::from_millis(self.get_work_interval_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }
}

pub fn load_config<P>(config_file: P) -> Result<ProxyConfig, ConfigError>
where
    P: AsRef<Path>, {
    let file = File::open(config_file)?;
    let config: ProxyConfig = serde_json::from_reader(BufReader::new(file))?;
    config.validate()?;
    Ok(config)
}

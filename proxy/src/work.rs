use bytes::Bytes;

use crate::config::Protocol;

/// Work unit currently advertised to the miners, shaped by the pool protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolWork {
    /// `mining.notify` parameters, kept as the raw encoded notification
    Stratum { job_id: String, notify: Bytes },
    /// `eth_getWork` result triple
    EthProxy { header: String, seed: String, target: String },
    /// job blob handed out by cryptonote style pools
    CryptoNote { job_id: String, blob: Bytes, target: String },
}

impl PoolWork {
    pub fn protocol(&self) -> Protocol {
        match self {
            PoolWork::Stratum { .. } => Protocol::Stratum,
            PoolWork::EthProxy { .. } => Protocol::EthProxy,
            PoolWork::CryptoNote { .. } => Protocol::CryptoNote,
        }
    }

    pub fn job_id(&self) -> &str {
        match self {
            PoolWork::Stratum { job_id, .. } | PoolWork::CryptoNote { job_id, .. } => job_id,
            PoolWork::EthProxy { header, .. } => header,
        }
    }
}

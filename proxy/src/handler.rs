use std::{
    io,
    sync::{Arc, Weak},
};

use bytes::Bytes;
use shared::types::MinerId;

use crate::{supervisor::PoolSupervisor, work::PoolWork};

/// Back-references handed to every protocol handler when the supervisor is built.
#[derive(Clone)]
pub struct HandlerContext {
    pub pool: Weak<PoolSupervisor>,
    pub miners: Arc<dyn MinerRegistry>,
    pub listener: Arc<dyn MinerListener>,
}

impl HandlerContext {
    pub fn pool(&self) -> Option<Arc<PoolSupervisor>> {
        self.pool.upgrade()
    }
}

/// Pool facing protocol: encodes requests for, and decodes replies from, the pool.
///
/// Implementations own every wire format detail. Faults in decoding are
/// theirs to handle, the supervisor never inspects payloads.
pub trait PoolHandler: Send + Sync {
    fn attach(&self, ctx: HandlerContext);

    fn login(&self, pool: &PoolSupervisor);

    /// May be called again before the previous request was answered.
    fn request_work(&self, pool: &PoolSupervisor);

    fn report_hashrate(&self, pool: &PoolSupervisor);

    fn data_received(&self, data: Bytes, pool: &PoolSupervisor);

    /// Last step of a deduplicated share submission.
    fn submit_share(&self, share: Bytes, pool: &PoolSupervisor) {
        pool.send_to_pool(share);
    }
}

/// Miner facing protocol.
pub trait MinerHandler: Send + Sync {
    fn attach(&self, ctx: HandlerContext);

    fn broadcast_work(&self, work: &PoolWork);
}

/// Per-miner summary printed with each status report.
#[derive(Debug, Clone, PartialEq)]
pub struct MinerSummary {
    pub id: MinerId,
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub hashrate: f64,
}

/// Tracks attached miners and their share and hashrate counters.
pub trait MinerRegistry: Send + Sync {
    fn connected_miners(&self) -> usize;

    fn record_submission(&self, miner: &MinerId);

    /// aggregate hashes per second over every attached miner
    fn hashrate(&self) -> f64;

    /// Reconciles submissions the pool never answered.
    fn correct_response_times(&self);

    fn summaries(&self) -> Vec<MinerSummary>;
}

/// Accepts downstream miner connections.
pub trait MinerListener: Send + Sync {
    fn listen(&self, port: u16) -> io::Result<()>;

    fn connection_count(&self) -> usize;
}

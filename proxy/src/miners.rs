use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use shared::types::MinerId;
use tracing::*;

use crate::handler::{MinerRegistry, MinerSummary};

/// a submission still waiting for the pool's verdict after this long is given up on
pub const SHARE_RESPONSE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct MinerEntry {
    submitted: u64,
    accepted: u64,
    rejected: u64,
    unanswered: u64,
    hashrate: f64,
    // submit instants of shares the pool has not answered yet, oldest first
    pending: VecDeque<Instant>,
}

/// In-memory registry of the miners attached to this proxy.
#[derive(Default)]
pub struct MinerManager {
    miners: Mutex<HashMap<MinerId, MinerEntry>>,
}

impl MinerManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, miner: MinerId) {
        info!("miner attached: {miner}");
        self.miners.lock().unwrap().entry(miner).or_default();
    }

    pub fn detach(&self, miner: &MinerId) {
        if self.miners.lock().unwrap().remove(miner).is_some() {
            info!("miner detached: {miner}");
        }
    }

    /// Pool answered the oldest outstanding share of `miner`.
    pub fn record_response(&self, miner: &MinerId, accepted: bool) {
        let mut guard = self.miners.lock().unwrap();
        let Some(entry) = guard.get_mut(miner) else {
            debug!("share response for unknown miner {miner}");
            return;
        };
        entry.pending.pop_front();
        if accepted {
            entry.accepted += 1;
        } else {
            entry.rejected += 1;
        }
    }

    pub fn report_hashrate(&self, miner: &MinerId, hashrate: f64) {
        if let Some(entry) = self.miners.lock().unwrap().get_mut(miner) {
            entry.hashrate = hashrate;
        }
    }

    pub fn pending(&self, miner: &MinerId) -> usize {
        self.miners.lock().unwrap().get(miner).map_or(0, |entry| entry.pending.len())
    }

    pub fn unanswered(&self, miner: &MinerId) -> u64 {
        self.miners.lock().unwrap().get(miner).map_or(0, |entry| entry.unanswered)
    }

    fn expire_pending(&self, now: Instant) -> u64 {
        let mut expired = 0;
        let mut guard = self.miners.lock().unwrap();
        for (id, entry) in guard.iter_mut() {
            let before = entry.pending.len();
            while let Some(at) = entry.pending.front() {
                if now.saturating_duration_since(*at) < SHARE_RESPONSE_TIMEOUT {
                    break;
                }
                entry.pending.pop_front();
            }
            let dropped = (before - entry.pending.len()) as u64;
            if dropped > 0 {
                warn!("{id}: {dropped} share(s) never answered by the pool");
                entry.unanswered += dropped;
                expired += dropped;
            }
        }
        expired
    }
}

impl MinerRegistry for MinerManager {
    fn connected_miners(&self) -> usize {
        self.miners.lock().unwrap().len()
    }

    fn record_submission(&self, miner: &MinerId) {
        let mut guard = self.miners.lock().unwrap();
        let Some(entry) = guard.get_mut(miner) else {
            debug!("share submission for unknown miner {miner}");
            return;
        };
        entry.submitted += 1;
        entry.pending.push_back(Instant::now());
    }

    fn hashrate(&self) -> f64 {
        self.miners.lock().unwrap().values().map(|entry| entry.hashrate).sum()
    }

    fn correct_response_times(&self) {
        let expired = self.expire_pending(Instant::now());
        trace!("response check expired {expired} share(s)");
    }

    fn summaries(&self) -> Vec<MinerSummary> {
        let guard = self.miners.lock().unwrap();
        let mut list: Vec<_> = guard
            .iter()
            .map(|(id, entry)| {
                MinerSummary {
                    id: id.clone(),
                    submitted: entry.submitted,
                    accepted: entry.accepted,
                    rejected: entry.rejected,
                    hashrate: entry.hashrate,
                }
            })
            .collect();
        list.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_and_hashrate() {
        let manager = MinerManager::new();
        let a = MinerId::from("a");
        let b = MinerId::from("b");
        manager.attach(a.clone());
        manager.attach(b.clone());
        manager.report_hashrate(&a, 1500.0);
        manager.report_hashrate(&b, 500.0);

        manager.record_submission(&a);
        manager.record_submission(&a);
        manager.record_response(&a, true);
        manager.record_response(&a, false);

        assert_eq!(manager.connected_miners(), 2);
        assert_eq!(manager.hashrate(), 2000.0);
        assert_eq!(manager.pending(&a), 0);

        let summaries = manager.summaries();
        assert_eq!(summaries[0], MinerSummary {
            id: a.clone(),
            submitted: 2,
            accepted: 1,
            rejected: 1,
            hashrate: 1500.0,
        });

        manager.detach(&a);
        assert_eq!(manager.connected_miners(), 1);
    }

    #[test]
    fn stale_pending_shares_expire() {
        let manager = MinerManager::new();
        let a = MinerId::from("a");
        manager.attach(a.clone());
        manager.record_submission(&a);
        manager.record_submission(&a);

        assert_eq!(manager.expire_pending(Instant::now()), 0);
        assert_eq!(manager.pending(&a), 2);

        let later = Instant::now() + SHARE_RESPONSE_TIMEOUT + Duration::from_secs(1);
        assert_eq!(manager.expire_pending(later), 2);
        assert_eq!(manager.pending(&a), 0);
        assert_eq!(manager.unanswered(&a), 2);
    }

    #[test]
    fn submission_after_detach_does_not_revive_miner() {
        let manager = MinerManager::new();
        let a = MinerId::from("a");
        manager.attach(a.clone());
        manager.detach(&a);

        manager.record_submission(&a);
        assert_eq!(manager.connected_miners(), 0);
        assert!(manager.summaries().is_empty());
        assert_eq!(manager.pending(&a), 0);
    }
}

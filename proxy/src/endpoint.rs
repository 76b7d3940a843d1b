use crate::{config::Endpoint, error::ConfigError};

/// consecutive connection failures tolerated before switching endpoints
pub const FAILOVER_THRESHOLD: u32 = 5;

/// Ordered candidate pools, the selected one, and how many times in a row
/// connecting to it has failed.
#[derive(Debug, Clone)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
    index: usize,
    failures: u32,
}

impl EndpointSet {
    pub fn new(endpoints: Vec<Endpoint>) -> Result<Self, ConfigError> {
        if endpoints.is_empty() {
            return Err(ConfigError::NoEndpoints);
        }
        Ok(Self { endpoints, index: 0, failures: 0 })
    }

    pub fn current(&self) -> &Endpoint {
        &self.endpoints[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset_failures(&mut self) {
        self.failures = 0;
    }

    /// Counts one failure. Returns the newly selected endpoint when the
    /// threshold was reached and the set failed over.
    pub fn record_failure(&mut self) -> Option<&Endpoint> {
        self.failures += 1;
        if self.failures < FAILOVER_THRESHOLD {
            return None;
        }
        self.failover();
        Some(self.current())
    }

    fn failover(&mut self) {
        self.index = (self.index + 1) % self.endpoints.len();
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use shared::types::WorkerName;

    use super::*;

    fn endpoint(address: &str) -> Endpoint {
        Endpoint {
            address: address.to_string(),
            port: 4444,
            wallet: "wallet".to_string(),
            worker: WorkerName("rig".to_string()),
            password: "x".to_string(),
            hashrate_id: None,
        }
    }

    #[test]
    fn empty_set_is_rejected() {
        assert!(matches!(EndpointSet::new(vec![]), Err(ConfigError::NoEndpoints)));
    }

    #[test]
    fn failover_after_threshold() {
        let mut set = EndpointSet::new(vec![endpoint("a"), endpoint("b")]).unwrap();

        for _ in 0..FAILOVER_THRESHOLD - 1 {
            assert!(set.record_failure().is_none());
        }
        assert_eq!(set.index(), 0);
        assert_eq!(set.failures(), FAILOVER_THRESHOLD - 1);

        let next = set.record_failure().map(|e| e.address.clone());
        assert_eq!(next.as_deref(), Some("b"));
        assert_eq!(set.index(), 1);
        assert_eq!(set.failures(), 0);
    }

    #[test]
    fn failover_wraps_around() {
        let mut set = EndpointSet::new(vec![endpoint("a"), endpoint("b")]).unwrap();
        for _ in 0..FAILOVER_THRESHOLD * 2 {
            set.record_failure();
        }
        assert_eq!(set.current().address, "a");
    }

    #[test]
    fn single_endpoint_stays_selected() {
        let mut set = EndpointSet::new(vec![endpoint("a")]).unwrap();
        for _ in 0..FAILOVER_THRESHOLD {
            set.record_failure();
        }
        assert_eq!(set.index(), 0);
        assert_eq!(set.failures(), 0);
    }

    #[test]
    fn reset_clears_partial_count() {
        let mut set = EndpointSet::new(vec![endpoint("a"), endpoint("b")]).unwrap();
        for _ in 0..FAILOVER_THRESHOLD - 1 {
            set.record_failure();
        }
        set.reset_failures();
        assert!(set.record_failure().is_none());
        assert_eq!(set.index(), 0);
    }
}

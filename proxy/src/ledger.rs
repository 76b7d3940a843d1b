use std::{collections::HashSet, sync::Mutex};

use bytes::Bytes;
use tracing::*;

/// Shares already forwarded upstream, keyed by content.
#[derive(Default)]
pub struct SubmissionLedger {
    submitted: Mutex<HashSet<Bytes>>,
}

impl SubmissionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when an identical payload was recorded before and the
    /// caller must drop it, `false` when it was recorded now and must be
    /// forwarded. Lookup and insert share one critical section.
    pub fn check_and_record(&self, share: &Bytes) -> bool {
        let mut guard = self.submitted.lock().unwrap();
        !guard.insert(share.clone())
    }

    pub fn clear(&self) {
        trace!("clearing submitted shares history");
        self.submitted.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

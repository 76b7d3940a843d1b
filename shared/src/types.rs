use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// identifies one attached downstream miner
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinerId(pub String);

impl MinerId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for MinerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MinerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// worker identity announced to the pool
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerName(pub String);

impl WorkerName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WorkerName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

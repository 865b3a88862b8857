use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::UnknownPoolType;

/// The independent classes of worker instances. Each is coordinated separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    Simple,
    Hierarchical,
}

impl PoolType {
    pub const ALL: [PoolType; 2] = [PoolType::Simple, PoolType::Hierarchical];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolType::Simple => "simple",
            PoolType::Hierarchical => "hierarchical",
        }
    }
}

impl fmt::Display for PoolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PoolType {
    type Err = UnknownPoolType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(PoolType::Simple),
            "hierarchical" => Ok(PoolType::Hierarchical),
            other => Err(UnknownPoolType(other.to_owned())),
        }
    }
}

/// Liveness of one instance as last observed by the health checker.
/// Always read and replaced as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceHealth {
    pub is_healthy: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
}

/// A point-in-time view of a registered worker instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerInstance {
    pub pool_type: PoolType,
    pub url: String,
    /// Only used to pick a deterministic instance when every lease is taken.
    pub identity_hint: Option<u16>,
    #[serde(flatten)]
    pub health: InstanceHealth,
}

impl WorkerInstance {
    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy
    }
}

/// How an assignment was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tenure {
    /// Backed by a live lease this process holds and heartbeats.
    Leased,
    /// Adopted through the identity hint without a lease. Nothing prevents
    /// another process from using the same instance concurrently.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentState {
    Unassigned,
    Assigned {
        instance: WorkerInstance,
        tenure: Tenure,
    },
}

impl AssignmentState {
    pub fn instance(&self) -> Option<&WorkerInstance> {
        match self {
            AssignmentState::Unassigned => None,
            AssignmentState::Assigned { instance, .. } => Some(instance),
        }
    }

    /// The URL of the instance this process holds a lease on, if any.
    pub fn leased_url(&self) -> Option<&str> {
        match self {
            AssignmentState::Assigned {
                instance,
                tenure: Tenure::Leased,
            } => Some(&instance.url),
            _ => None,
        }
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, AssignmentState::Assigned { .. })
    }
}

//! Active health checking.
//!
//! Each target carries a three-valued health state. `Unknown` is explicit:
//! never-probed targets (and targets whose upstream disables checking) are
//! eligible for selection, so the gateway fails open instead of blackholing
//! traffic when probing is off.

pub mod checker;

use serde::Serialize;
use std::time::Duration;

pub use checker::HealthChecker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Unknown,
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => HealthState::Healthy,
            2 => HealthState::Unhealthy,
            _ => HealthState::Unknown,
        }
    }

    pub(crate) fn as_u8(self) -> u8 {
        match self {
            HealthState::Unknown => 0,
            HealthState::Healthy => 1,
            HealthState::Unhealthy => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Unknown => "unknown",
            HealthState::Healthy => "healthy",
            HealthState::Unhealthy => "unhealthy",
        }
    }
}

/// Point-in-time view of one target's health, served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct TargetHealth {
    pub url: String,
    pub upstream: String,
    pub state: HealthState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rtt: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Outcome of a single probe.
#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    /// 2xx response within the timeout.
    Ok { rtt: Duration },
    /// Non-2xx status, transport error, or timeout.
    Fail { reason: String },
}

use serde::Serialize;

use crate::util::mask_credential;

/// Health of a single credential.
///
/// ```text
/// ELIGIBLE ──[failure_threshold consecutive failures]──► TRIPPED
///     ▲                                                     │
///     │                                            [cooldown elapsed]
/// [probes_to_close successes]                               │
///     │                                                     ▼
///     └───────────────────────────────────────────────── PROBING
///                     (any probe failure re-trips immediately)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    Eligible,
    Tripped,
    Probing,
}

#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub id: String,
    pub health: HealthState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_request_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub last_failure_at: Option<i64>,
    /// Set iff `health == Tripped`.
    pub cooldown_until: Option<i64>,
    /// Meaningful only while `health == Probing`.
    pub probe_successes: u32,
    pub in_flight: u32,
    pub registered_at: i64,
}

impl CredentialRecord {
    pub fn new(id: String, now_ms: i64) -> Self {
        Self {
            id,
            health: HealthState::Eligible,
            consecutive_failures: 0,
            total_requests: 0,
            total_successes: 0,
            total_failures: 0,
            last_request_at: None,
            last_success_at: None,
            last_failure_at: None,
            cooldown_until: None,
            probe_successes: 0,
            in_flight: 0,
            registered_at: now_ms,
        }
    }

    /// Timestamp that drives idle garbage collection.
    pub fn last_seen(&self) -> i64 {
        self.last_request_at.unwrap_or(self.registered_at)
    }

    pub fn snapshot(&self) -> CredentialSnapshot {
        CredentialSnapshot {
            key: mask_credential(&self.id),
            health: self.health,
            consecutive_failures: self.consecutive_failures,
            total_requests: self.total_requests,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            last_request_at: self.last_request_at,
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
            cooldown_until: self.cooldown_until,
            in_flight: self.in_flight,
        }
    }
}

/// Copy-out of a record for `/stats`; the credential itself is masked.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSnapshot {
    pub key: String,
    pub health: HealthState,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_request_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<i64>,
    pub in_flight: u32,
}

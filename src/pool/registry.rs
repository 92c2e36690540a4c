use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::GatewayError;
use crate::pool::record::{CredentialRecord, CredentialSnapshot, HealthState};
use crate::pool::selector::SelectionPolicy;
use crate::util::mask_credential;

/// Records idle longer than this are garbage-collected.
const IDLE_TTL_MS: i64 = 24 * 60 * 60 * 1000;

struct PoolInner {
    records: HashMap<String, CredentialRecord>,
    /// Registration order; the round-robin cursor walks this.
    order: Vec<String>,
    rr_cursor: u64,
}

/// The process-local credential registry and scheduler.
///
/// All mutations happen under one mutex so that fetching the eligible set,
/// advancing the round-robin cursor, and applying a health transition are a
/// single atomic step. Critical sections never block on I/O.
pub struct CredentialPool {
    config: SchedulerConfig,
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub policy: &'static str,
    pub total: usize,
    pub eligible: usize,
    pub tripped: usize,
    pub probing: usize,
    pub credentials: Vec<CredentialSnapshot>,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

impl CredentialPool {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(PoolInner {
                records: HashMap::new(),
                order: Vec::new(),
                rr_cursor: 0,
            }),
        }
    }

    pub fn policy(&self) -> SelectionPolicy {
        self.config.selection_policy
    }

    /// Idempotent registration; first appearance wins a slot in the
    /// round-robin order.
    pub fn ensure(&self, id: &str) {
        self.ensure_at(id, now_ms());
    }

    pub(crate) fn ensure_at(&self, id: &str, now_ms: i64) {
        let mut inner = self.inner.lock().expect("credential pool lock");
        if !inner.records.contains_key(id) {
            debug!("Registered credential {}", mask_credential(id));
            inner.records.insert(id.to_string(), CredentialRecord::new(id.to_string(), now_ms));
            inner.order.push(id.to_string());
        }
    }

    pub fn register_all(&self, ids: &[String]) {
        let now = now_ms();
        for id in ids {
            self.ensure_at(id, now);
        }
    }

    /// Select one credential out of `candidates` per the configured policy.
    ///
    /// Only registered candidates whose health is ELIGIBLE or PROBING are
    /// considered; TRIPPED entries whose cooldown has elapsed are promoted to
    /// PROBING on the spot. The chosen record's `in_flight` and
    /// `total_requests` are bumped before the lock is released.
    pub fn select(&self, candidates: &[String]) -> Result<String, GatewayError> {
        self.select_at(candidates, now_ms())
    }

    pub(crate) fn select_at(
        &self,
        candidates: &[String],
        now_ms: i64,
    ) -> Result<String, GatewayError> {
        let mut inner = self.inner.lock().expect("credential pool lock");

        for id in candidates {
            if let Some(record) = inner.records.get_mut(id) {
                promote_if_cooled(record, now_ms);
            }
        }

        let eligible: Vec<String> = inner
            .order
            .iter()
            .filter(|id| candidates.contains(*id))
            .filter(|id| {
                matches!(
                    inner.records[id.as_str()].health,
                    HealthState::Eligible | HealthState::Probing
                )
            })
            .cloned()
            .collect();

        if eligible.is_empty() {
            return Err(GatewayError::NoCredentialAvailable);
        }

        let idx = match self.config.selection_policy {
            SelectionPolicy::RoundRobin => {
                let idx = (inner.rr_cursor % eligible.len() as u64) as usize;
                inner.rr_cursor += 1;
                idx
            }
            SelectionPolicy::Random => rand::thread_rng().gen_range(0..eligible.len()),
            SelectionPolicy::LeastInFlight => eligible
                .iter()
                .enumerate()
                .min_by_key(|(pos, id)| (inner.records[id.as_str()].in_flight, *pos))
                .map(|(pos, _)| pos)
                .expect("non-empty eligible set"),
        };

        let chosen = eligible[idx].clone();
        let record = inner.records.get_mut(&chosen).expect("selected record");
        record.in_flight += 1;
        record.total_requests += 1;
        record.last_request_at = Some(now_ms);
        Ok(chosen)
    }

    /// Drop the in-flight hold taken by `select`. Called on every completion:
    /// success, failure, or cancellation.
    pub fn release(&self, id: &str) {
        let mut inner = self.inner.lock().expect("credential pool lock");
        if let Some(record) = inner.records.get_mut(id) {
            record.in_flight = record.in_flight.saturating_sub(1);
        }
    }

    pub fn record_success(&self, id: &str) {
        self.record_success_at(id, now_ms());
    }

    pub(crate) fn record_success_at(&self, id: &str, now_ms: i64) {
        let mut inner = self.inner.lock().expect("credential pool lock");
        let Some(record) = inner.records.get_mut(id) else {
            return;
        };
        record.total_successes += 1;
        record.last_success_at = Some(now_ms);
        match record.health {
            HealthState::Eligible => {
                record.consecutive_failures = 0;
            }
            HealthState::Probing => {
                record.probe_successes += 1;
                if record.probe_successes >= self.config.probes_to_close {
                    record.health = HealthState::Eligible;
                    record.consecutive_failures = 0;
                    record.probe_successes = 0;
                    info!("Credential {} recovered", mask_credential(id));
                }
            }
            // A request that was in flight when the trip happened; the
            // cooldown stays authoritative.
            HealthState::Tripped => {}
        }
    }

    pub fn record_failure(&self, id: &str) {
        self.record_failure_at(id, now_ms());
    }

    pub(crate) fn record_failure_at(&self, id: &str, now_ms: i64) {
        let mut inner = self.inner.lock().expect("credential pool lock");
        let threshold = self.config.failure_threshold;
        let cooldown = self.config.cooldown_duration_ms as i64;
        let Some(record) = inner.records.get_mut(id) else {
            return;
        };
        record.total_failures += 1;
        record.last_failure_at = Some(now_ms);
        record.consecutive_failures += 1;
        match record.health {
            HealthState::Eligible => {
                if record.consecutive_failures >= threshold {
                    trip(record, now_ms, cooldown);
                }
            }
            HealthState::Probing => {
                trip(record, now_ms, cooldown);
            }
            HealthState::Tripped => {}
        }
    }

    /// Force a credential back to ELIGIBLE. Cumulative totals survive.
    pub fn reset(&self, id: &str) {
        let mut inner = self.inner.lock().expect("credential pool lock");
        if let Some(record) = inner.records.get_mut(id) {
            record.health = HealthState::Eligible;
            record.consecutive_failures = 0;
            record.cooldown_until = None;
            record.probe_successes = 0;
            info!("Credential {} manually reset", mask_credential(id));
        }
    }

    /// One sweeper pass: promote cooled-down credentials to PROBING and
    /// garbage-collect records idle past the 24 h TTL. Returns
    /// (promoted, collected) for logging.
    pub fn sweep(&self) -> (usize, usize) {
        self.sweep_at(now_ms())
    }

    pub(crate) fn sweep_at(&self, now_ms: i64) -> (usize, usize) {
        let mut inner = self.inner.lock().expect("credential pool lock");

        let mut promoted = 0;
        for record in inner.records.values_mut() {
            if promote_if_cooled(record, now_ms) {
                promoted += 1;
            }
        }

        let expired: Vec<String> = inner
            .records
            .values()
            .filter(|r| r.in_flight == 0 && now_ms - r.last_seen() >= IDLE_TTL_MS)
            .map(|r| r.id.clone())
            .collect();
        for id in &expired {
            debug!("Garbage-collected idle credential {}", mask_credential(id));
            inner.records.remove(id);
        }
        inner.order.retain(|id| !expired.contains(id));

        (promoted, expired.len())
    }

    pub fn snapshot(&self, id: &str) -> Option<CredentialSnapshot> {
        let inner = self.inner.lock().expect("credential pool lock");
        inner.records.get(id).map(CredentialRecord::snapshot)
    }

    #[cfg(test)]
    pub(crate) fn health_of(&self, id: &str) -> Option<HealthState> {
        let inner = self.inner.lock().expect("credential pool lock");
        inner.records.get(id).map(|r| r.health)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("credential pool lock").records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().expect("credential pool lock");
        let mut stats = PoolStats {
            policy: self.config.selection_policy.as_str(),
            total: inner.order.len(),
            eligible: 0,
            tripped: 0,
            probing: 0,
            credentials: Vec::with_capacity(inner.order.len()),
        };
        for id in &inner.order {
            let record = &inner.records[id.as_str()];
            match record.health {
                HealthState::Eligible => stats.eligible += 1,
                HealthState::Tripped => stats.tripped += 1,
                HealthState::Probing => stats.probing += 1,
            }
            stats.credentials.push(record.snapshot());
        }
        stats
    }
}

fn trip(record: &mut CredentialRecord, now_ms: i64, cooldown_ms: i64) {
    record.health = HealthState::Tripped;
    record.cooldown_until = Some(now_ms + cooldown_ms);
    record.probe_successes = 0;
    warn!(
        "Credential {} tripped after {} consecutive failures, cooling down for {}ms",
        mask_credential(&record.id),
        record.consecutive_failures,
        cooldown_ms
    );
}

fn promote_if_cooled(record: &mut CredentialRecord, now_ms: i64) -> bool {
    if record.health == HealthState::Tripped {
        if let Some(until) = record.cooldown_until {
            if now_ms >= until {
                record.health = HealthState::Probing;
                record.cooldown_until = None;
                record.probe_successes = 0;
                debug!("Credential {} entering probe window", mask_credential(&record.id));
                return true;
            }
        }
    }
    false
}

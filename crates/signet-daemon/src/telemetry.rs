use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Default, Clone)]
pub struct TelemetrySnapshot {
    pub exchanges_total: u64,
    pub idempotent_hits_total: u64,
    pub denied_total: HashMap<String, u64>,
    pub forward_total: HashMap<String, u64>,
    pub forward_errors_total: HashMap<String, u64>,
    pub repair_attempts_total: u64,
    pub repair_success_total: u64,
    pub fallback_used_total: u64,
    pub semantic_violation_total: u64,
    pub chain_conflicts_total: u64,
    pub vex_units_total: u64,
    pub fu_tokens_total: u64,
}

/// In-process counters for the exchange pipeline. Exposition wiring is left
/// to the deployment; these exist for operational logging and tests.
#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    state: Arc<Mutex<TelemetrySnapshot>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_exchange(&self) {
        let mut guard = self.state.lock();
        guard.exchanges_total = guard.exchanges_total.saturating_add(1);
    }

    pub fn record_idempotent_hit(&self) {
        let mut guard = self.state.lock();
        guard.idempotent_hits_total = guard.idempotent_hits_total.saturating_add(1);
    }

    pub fn record_denied(&self, reason: &str) {
        let mut guard = self.state.lock();
        let entry = guard.denied_total.entry(reason.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_forward(&self, host: &str) {
        let mut guard = self.state.lock();
        let entry = guard.forward_total.entry(host.to_string()).or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_forward_error(&self, reason: &str) {
        let mut guard = self.state.lock();
        let entry = guard
            .forward_errors_total
            .entry(reason.to_string())
            .or_insert(0);
        *entry = entry.saturating_add(1);
    }

    pub fn record_repair_attempt(&self) {
        let mut guard = self.state.lock();
        guard.repair_attempts_total = guard.repair_attempts_total.saturating_add(1);
    }

    pub fn record_repair_success(&self) {
        let mut guard = self.state.lock();
        guard.repair_success_total = guard.repair_success_total.saturating_add(1);
    }

    pub fn record_fallback_used(&self) {
        let mut guard = self.state.lock();
        guard.fallback_used_total = guard.fallback_used_total.saturating_add(1);
    }

    pub fn record_semantic_violation(&self) {
        let mut guard = self.state.lock();
        guard.semantic_violation_total = guard.semantic_violation_total.saturating_add(1);
    }

    pub fn record_chain_conflict(&self) {
        let mut guard = self.state.lock();
        guard.chain_conflicts_total = guard.chain_conflicts_total.saturating_add(1);
    }

    pub fn record_usage(&self, vex: u64, fu_tokens: u64) {
        let mut guard = self.state.lock();
        guard.vex_units_total = guard.vex_units_total.saturating_add(vex);
        guard.fu_tokens_total = guard.fu_tokens_total.saturating_add(fu_tokens);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        self.state.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let t = Telemetry::new();
        t.record_exchange();
        t.record_exchange();
        t.record_denied("host_not_allowlisted");
        t.record_usage(1, 42);
        let snap = t.snapshot();
        assert_eq!(snap.exchanges_total, 2);
        assert_eq!(snap.denied_total.get("host_not_allowlisted"), Some(&1));
        assert_eq!(snap.fu_tokens_total, 42);
    }
}

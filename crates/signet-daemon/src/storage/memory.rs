use super::{ExchangeCommit, StorageError, StoragePort, UsageTotals};
use parking_lot::Mutex;
use serde_json::Value;
use signet_core::receipt::Receipt;
use std::collections::HashMap;

#[derive(Default)]
struct Inner {
    chains: HashMap<String, Vec<Receipt>>,
    idempotency: HashMap<(String, String), Value>,
    usage: HashMap<(String, String), UsageTotals>,
}

/// In-memory store for tests and development.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoragePort for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn append_exchange(&self, commit: &ExchangeCommit<'_>) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let chain = inner
            .chains
            .entry(commit.receipt.trace_id.clone())
            .or_default();
        let current = chain.last().map(|r| r.hop).unwrap_or(0);
        if current != commit.expected_prev_hop {
            return Err(StorageError::ChainConflict);
        }
        if commit.receipt.hop != current + 1 {
            return Err(StorageError::Backend(format!(
                "receipt hop {} does not extend hop {current}",
                commit.receipt.hop
            )));
        }
        chain.push(commit.receipt.clone());

        inner
            .idempotency
            .entry((
                commit.api_key.to_string(),
                commit.idempotency_key.to_string(),
            ))
            .or_insert_with(|| commit.response_snapshot.clone());

        let totals = inner
            .usage
            .entry((
                commit.receipt.tenant.clone(),
                commit.month.to_string(),
            ))
            .or_default();
        totals.vex = totals.vex.saturating_add(commit.vex_delta);
        totals.fu_tokens = totals.fu_tokens.saturating_add(commit.fu_delta);
        Ok(())
    }

    fn get_chain(&self, trace_id: &str) -> Result<Vec<Receipt>, StorageError> {
        Ok(self
            .inner
            .lock()
            .chains
            .get(trace_id)
            .cloned()
            .unwrap_or_default())
    }

    fn get_last(&self, trace_id: &str) -> Result<Option<Receipt>, StorageError> {
        Ok(self
            .inner
            .lock()
            .chains
            .get(trace_id)
            .and_then(|chain| chain.last().cloned()))
    }

    fn get_idempotent(
        &self,
        api_key: &str,
        idempotency_key: &str,
    ) -> Result<Option<Value>, StorageError> {
        Ok(self
            .inner
            .lock()
            .idempotency
            .get(&(api_key.to_string(), idempotency_key.to_string()))
            .cloned())
    }

    fn get_monthly_usage(&self, tenant: &str, month: &str) -> Result<UsageTotals, StorageError> {
        Ok(self
            .inner
            .lock()
            .usage
            .get(&(tenant.to_string(), month.to_string()))
            .copied()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use signet_core::cid::HASH_ALGO;
    use signet_core::receipt::PolicyBlock;

    fn receipt(trace: &str, hop: u64) -> Receipt {
        let mut r = Receipt {
            trace_id: trace.to_string(),
            hop,
            ts: "2026-08-02T10:00:00Z".to_string(),
            tenant: "acme".to_string(),
            cid: "sha256:00".to_string(),
            canon: "{}".to_string(),
            algo: HASH_ALGO.to_string(),
            prev_receipt_hash: None,
            policy: PolicyBlock::allowed("ok"),
            forwarded: None,
            fallback_used: None,
            fu_tokens: None,
            semantic_violations: None,
            receipt_hash: None,
            signature: None,
            kid: None,
        };
        r.seal("c2ln".to_string(), "key-1".to_string()).unwrap();
        r
    }

    fn commit<'a>(
        receipt: &'a Receipt,
        expected: u64,
        snapshot: &'a Value,
        fu: u64,
    ) -> ExchangeCommit<'a> {
        ExchangeCommit {
            receipt,
            expected_prev_hop: expected,
            api_key: "key-acme",
            idempotency_key: "idem-1",
            response_snapshot: snapshot,
            month: "2026-08",
            vex_delta: 1,
            fu_delta: fu,
        }
    }

    #[test]
    fn append_and_read_back() {
        let store = MemoryStore::new();
        let snapshot = json!({"trace_id": "t1"});
        let r = receipt("t1", 1);
        store.append_exchange(&commit(&r, 0, &snapshot, 5)).unwrap();
        assert_eq!(store.get_chain("t1").unwrap().len(), 1);
        assert_eq!(store.get_last("t1").unwrap().unwrap().hop, 1);
        assert_eq!(
            store.get_idempotent("key-acme", "idem-1").unwrap(),
            Some(snapshot)
        );
        let usage = store.get_monthly_usage("acme", "2026-08").unwrap();
        assert_eq!(usage, UsageTotals { vex: 1, fu_tokens: 5 });
    }

    #[test]
    fn stale_expected_hop_conflicts() {
        let store = MemoryStore::new();
        let snapshot = json!({});
        let first = receipt("t1", 1);
        store
            .append_exchange(&commit(&first, 0, &snapshot, 0))
            .unwrap();
        // A second appender that also observed an empty chain loses.
        let rival = receipt("t1", 1);
        let err = store
            .append_exchange(&commit(&rival, 0, &snapshot, 0))
            .unwrap_err();
        assert!(matches!(err, StorageError::ChainConflict));
        assert_eq!(store.get_chain("t1").unwrap().len(), 1);
    }

    #[test]
    fn first_idempotency_snapshot_wins() {
        let store = MemoryStore::new();
        let first_snapshot = json!({"n": 1});
        let r1 = receipt("t1", 1);
        store
            .append_exchange(&commit(&r1, 0, &first_snapshot, 0))
            .unwrap();
        let second_snapshot = json!({"n": 2});
        let r2 = receipt("t2", 1);
        store
            .append_exchange(&commit(&r2, 0, &second_snapshot, 0))
            .unwrap();
        assert_eq!(
            store.get_idempotent("key-acme", "idem-1").unwrap(),
            Some(first_snapshot)
        );
    }
}

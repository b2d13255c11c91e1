// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! Storage port: append-only receipt chains, idempotency records, and
//! monthly usage counters.
//!
//! `append_exchange` is the single transactional write: the conditional
//! chain append, the idempotency snapshot, and the usage increment commit
//! or fail together. Concurrent appenders for one trace serialize; the
//! loser observes `ChainConflict`.

pub mod memory;
pub mod sqlite;

use serde_json::Value;
use signet_core::receipt::Receipt;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("chain conflict: another append advanced this trace")]
    ChainConflict,
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageTotals {
    pub vex: u64,
    pub fu_tokens: u64,
}

/// Everything one successful exchange writes, committed atomically.
pub struct ExchangeCommit<'a> {
    pub receipt: &'a Receipt,
    /// Hop the chain must currently end at (0 for a new chain).
    pub expected_prev_hop: u64,
    pub api_key: &'a str,
    pub idempotency_key: &'a str,
    pub response_snapshot: &'a Value,
    pub month: &'a str,
    pub vex_delta: u64,
    pub fu_delta: u64,
}

pub trait StoragePort: Send + Sync {
    fn kind(&self) -> &'static str;

    fn append_exchange(&self, commit: &ExchangeCommit<'_>) -> Result<(), StorageError>;

    fn get_chain(&self, trace_id: &str) -> Result<Vec<Receipt>, StorageError>;

    fn get_last(&self, trace_id: &str) -> Result<Option<Receipt>, StorageError>;

    fn get_idempotent(
        &self,
        api_key: &str,
        idempotency_key: &str,
    ) -> Result<Option<Value>, StorageError>;

    fn get_monthly_usage(&self, tenant: &str, month: &str) -> Result<UsageTotals, StorageError>;
}

/// Usage counters are bucketed by the receipt timestamp's `YYYY-MM` prefix.
pub fn month_of_ts(ts: &str) -> String {
    ts.chars().take(7).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn month_prefix() {
        assert_eq!(month_of_ts("2026-08-02T10:00:00Z"), "2026-08");
        assert_eq!(month_of_ts("2026"), "2026");
    }
}

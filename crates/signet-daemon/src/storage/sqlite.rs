use super::{month_of_ts, ExchangeCommit, StorageError, StoragePort, UsageTotals};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use signet_core::receipt::{ForwardedBlock, PolicyBlock, Receipt};
use std::path::Path;

/// Embedded single-file engine. One connection guarded by a mutex; every
/// exchange commit runs in a single transaction so the conditional append,
/// the idempotency snapshot, and the usage counters land together.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS receipts (
    trace_id TEXT NOT NULL,
    hop INTEGER NOT NULL,
    ts TEXT NOT NULL,
    month TEXT NOT NULL,
    tenant TEXT NOT NULL,
    cid TEXT NOT NULL,
    canon_bytes TEXT NOT NULL,
    algo TEXT NOT NULL,
    prev_receipt_hash TEXT,
    receipt_hash TEXT NOT NULL,
    policy_blob TEXT NOT NULL,
    forwarded_blob TEXT,
    fallback_used INTEGER,
    fu_tokens INTEGER,
    semantic_violations_blob TEXT,
    signature TEXT NOT NULL,
    kid TEXT NOT NULL,
    PRIMARY KEY (trace_id, hop)
);
CREATE INDEX IF NOT EXISTS receipts_tenant_month ON receipts (tenant, month);
CREATE TABLE IF NOT EXISTS idempotency (
    api_key TEXT NOT NULL,
    idem_key TEXT NOT NULL,
    response_blob TEXT NOT NULL,
    created_at TEXT NOT NULL,
    PRIMARY KEY (api_key, idem_key)
);
CREATE TABLE IF NOT EXISTS usage (
    tenant TEXT NOT NULL,
    month TEXT NOT NULL,
    vex_count INTEGER NOT NULL DEFAULT 0,
    fu_tokens INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (tenant, month)
);
CREATE INDEX IF NOT EXISTS usage_tenant ON usage (tenant);
";

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path).map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn backend(e: rusqlite::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn encode<T: serde::Serialize>(v: &T) -> Result<String, StorageError> {
    serde_json::to_string(v).map_err(|e| StorageError::Backend(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(s: &str) -> Result<T, StorageError> {
    serde_json::from_str(s).map_err(|e| StorageError::Backend(e.to_string()))
}

fn row_to_receipt(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        trace_id: row.get(0)?,
        hop: row.get(1)?,
        ts: row.get(2)?,
        tenant: row.get(3)?,
        cid: row.get(4)?,
        canon: row.get(5)?,
        algo: row.get(6)?,
        prev_receipt_hash: row.get(7)?,
        receipt_hash: row.get(8)?,
        policy_blob: row.get(9)?,
        forwarded_blob: row.get(10)?,
        fallback_used: row.get(11)?,
        fu_tokens: row.get(12)?,
        semantic_violations_blob: row.get(13)?,
        signature: row.get(14)?,
        kid: row.get(15)?,
    })
}

struct RawRow {
    trace_id: String,
    hop: u64,
    ts: String,
    tenant: String,
    cid: String,
    canon: String,
    algo: String,
    prev_receipt_hash: Option<String>,
    receipt_hash: String,
    policy_blob: String,
    forwarded_blob: Option<String>,
    fallback_used: Option<bool>,
    fu_tokens: Option<u64>,
    semantic_violations_blob: Option<String>,
    signature: String,
    kid: String,
}

impl RawRow {
    fn into_receipt(self) -> Result<Receipt, StorageError> {
        let policy: PolicyBlock = decode(&self.policy_blob)?;
        let forwarded: Option<ForwardedBlock> = match self.forwarded_blob {
            Some(blob) => Some(decode(&blob)?),
            None => None,
        };
        let semantic_violations: Option<Vec<String>> = match self.semantic_violations_blob {
            Some(blob) => Some(decode(&blob)?),
            None => None,
        };
        Ok(Receipt {
            trace_id: self.trace_id,
            hop: self.hop,
            ts: self.ts,
            tenant: self.tenant,
            cid: self.cid,
            canon: self.canon,
            algo: self.algo,
            prev_receipt_hash: self.prev_receipt_hash,
            policy,
            forwarded,
            fallback_used: self.fallback_used,
            fu_tokens: self.fu_tokens,
            semantic_violations,
            receipt_hash: Some(self.receipt_hash),
            signature: Some(self.signature),
            kid: Some(self.kid),
        })
    }
}

const SELECT_COLUMNS: &str = "trace_id, hop, ts, tenant, cid, canon_bytes, algo, \
     prev_receipt_hash, receipt_hash, policy_blob, forwarded_blob, fallback_used, \
     fu_tokens, semantic_violations_blob, signature, kid";

impl StoragePort for SqliteStore {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn append_exchange(&self, commit: &ExchangeCommit<'_>) -> Result<(), StorageError> {
        let receipt = commit.receipt;
        let (Some(receipt_hash), Some(signature), Some(kid)) = (
            receipt.receipt_hash.as_deref(),
            receipt.signature.as_deref(),
            receipt.kid.as_deref(),
        ) else {
            return Err(StorageError::Backend(
                "refusing to persist an unsealed receipt".to_string(),
            ));
        };

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)
            .map_err(backend)?;

        let current: u64 = tx
            .query_row(
                "SELECT COALESCE(MAX(hop), 0) FROM receipts WHERE trace_id = ?1",
                params![receipt.trace_id],
                |row| row.get(0),
            )
            .map_err(backend)?;
        if current != commit.expected_prev_hop {
            return Err(StorageError::ChainConflict);
        }

        let forwarded_blob = match &receipt.forwarded {
            Some(block) => Some(encode(block)?),
            None => None,
        };
        let violations_blob = match &receipt.semantic_violations {
            Some(list) => Some(encode(list)?),
            None => None,
        };
        tx.execute(
            "INSERT INTO receipts (trace_id, hop, ts, month, tenant, cid, canon_bytes, algo, \
             prev_receipt_hash, receipt_hash, policy_blob, forwarded_blob, fallback_used, \
             fu_tokens, semantic_violations_blob, signature, kid) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                receipt.trace_id,
                receipt.hop,
                receipt.ts,
                month_of_ts(&receipt.ts),
                receipt.tenant,
                receipt.cid,
                receipt.canon,
                receipt.algo,
                receipt.prev_receipt_hash,
                receipt_hash,
                encode(&receipt.policy)?,
                forwarded_blob,
                receipt.fallback_used,
                receipt.fu_tokens,
                violations_blob,
                signature,
                kid,
            ],
        )
        .map_err(backend)?;

        tx.execute(
            "INSERT OR IGNORE INTO idempotency (api_key, idem_key, response_blob, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                commit.api_key,
                commit.idempotency_key,
                encode(commit.response_snapshot)?,
                receipt.ts,
            ],
        )
        .map_err(backend)?;

        tx.execute(
            "INSERT INTO usage (tenant, month, vex_count, fu_tokens) VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (tenant, month) DO UPDATE SET \
             vex_count = vex_count + excluded.vex_count, \
             fu_tokens = fu_tokens + excluded.fu_tokens",
            params![receipt.tenant, commit.month, commit.vex_delta, commit.fu_delta],
        )
        .map_err(backend)?;

        tx.commit().map_err(backend)
    }

    fn get_chain(&self, trace_id: &str) -> Result<Vec<Receipt>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM receipts WHERE trace_id = ?1 ORDER BY hop"
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![trace_id], row_to_receipt)
            .map_err(backend)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(backend)?.into_receipt()?);
        }
        Ok(out)
    }

    fn get_last(&self, trace_id: &str) -> Result<Option<Receipt>, StorageError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM receipts WHERE trace_id = ?1 \
                     ORDER BY hop DESC LIMIT 1"
                ),
                params![trace_id],
                row_to_receipt,
            )
            .optional()
            .map_err(backend)?;
        row.map(RawRow::into_receipt).transpose()
    }

    fn get_idempotent(
        &self,
        api_key: &str,
        idempotency_key: &str,
    ) -> Result<Option<Value>, StorageError> {
        let conn = self.conn.lock();
        let blob: Option<String> = conn
            .query_row(
                "SELECT response_blob FROM idempotency WHERE api_key = ?1 AND idem_key = ?2",
                params![api_key, idempotency_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(backend)?;
        blob.map(|b| decode(&b)).transpose()
    }

    fn get_monthly_usage(&self, tenant: &str, month: &str) -> Result<UsageTotals, StorageError> {
        let conn = self.conn.lock();
        let totals = conn
            .query_row(
                "SELECT vex_count, fu_tokens FROM usage WHERE tenant = ?1 AND month = ?2",
                params![tenant, month],
                |row| {
                    Ok(UsageTotals {
                        vex: row.get(0)?,
                        fu_tokens: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(backend)?;
        Ok(totals.unwrap_or_default())
    }
}

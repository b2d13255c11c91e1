// Copyright (c) 2026 Signet Protocol Contributors
// SPDX-License-Identifier: Apache-2.0

//! Usage metering buffer and reserved-capacity accounting.
//!
//! Pipeline workers enqueue metering events into a bounded channel; a
//! single flusher aggregates per `(tenant, unit, billing item)` and drains
//! to a [`BillingSink`] on an interval and at shutdown. A full channel
//! applies backpressure to the pipeline rather than dropping counted
//! usage.

use crate::config::OverageTier;
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeterUnit {
    Vex,
    Fu,
}

impl MeterUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeterUnit::Vex => "vex",
            MeterUnit::Fu => "fu",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterEvent {
    pub tenant: String,
    pub unit: MeterUnit,
    pub amount: u64,
    pub billing_item: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedUsage {
    pub tenant: String,
    pub unit: MeterUnit,
    pub billing_item: Option<String>,
    pub amount: u64,
}

#[async_trait]
pub trait BillingSink: Send + Sync {
    async fn flush(&self, batch: Vec<AggregatedUsage>);
}

/// Default sink: structured log lines in place of the external billing
/// provider's enqueue call.
pub struct LogSink;

#[async_trait]
impl BillingSink for LogSink {
    async fn flush(&self, batch: Vec<AggregatedUsage>) {
        for entry in batch {
            tracing::info!(
                target: "signet.billing",
                tenant = %entry.tenant,
                unit = entry.unit.as_str(),
                amount = entry.amount,
                billing_item = entry.billing_item.as_deref().unwrap_or("-"),
                "billing flush"
            );
        }
    }
}

/// Test sink capturing every flushed batch.
#[derive(Default)]
pub struct CollectingSink {
    batches: parking_lot::Mutex<Vec<Vec<AggregatedUsage>>>,
}

impl CollectingSink {
    pub fn flushed(&self) -> Vec<AggregatedUsage> {
        self.batches.lock().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl BillingSink for CollectingSink {
    async fn flush(&self, batch: Vec<AggregatedUsage>) {
        self.batches.lock().push(batch);
    }
}

#[derive(Clone)]
pub struct BillingBuffer {
    tx: mpsc::Sender<MeterEvent>,
}

impl BillingBuffer {
    /// Spawn the flusher worker. Dropping every `BillingBuffer` clone closes
    /// the channel; the worker then performs a final flush and exits, which
    /// is how shutdown drains the queue.
    pub fn spawn(
        sink: Arc<dyn BillingSink>,
        capacity: usize,
        flush_interval: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<MeterEvent>(capacity);
        let handle = tokio::spawn(async move {
            let mut pending: HashMap<(String, MeterUnit, Option<String>), u64> = HashMap::new();
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => {
                            let key = (event.tenant, event.unit, event.billing_item);
                            let slot = pending.entry(key).or_insert(0);
                            *slot = slot.saturating_add(event.amount);
                        }
                        None => {
                            flush_pending(&sink, &mut pending).await;
                            return;
                        }
                    },
                    _ = ticker.tick() => {
                        flush_pending(&sink, &mut pending).await;
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    /// Blocks when the buffer is full; counted usage is never dropped.
    pub async fn enqueue(&self, event: MeterEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::error!("billing buffer closed before shutdown drain");
        }
    }
}

async fn flush_pending(
    sink: &Arc<dyn BillingSink>,
    pending: &mut HashMap<(String, MeterUnit, Option<String>), u64>,
) {
    if pending.is_empty() {
        return;
    }
    let batch: Vec<AggregatedUsage> = pending
        .drain()
        .map(|((tenant, unit, billing_item), amount)| AggregatedUsage {
            tenant,
            unit,
            billing_item,
            amount,
        })
        .collect();
    sink.flush(batch).await;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierCharge {
    pub threshold: u64,
    pub amount: u64,
    pub price_per_unit: Decimal,
    pub charge: Decimal,
    pub billing_item: Option<String>,
}

/// Reserved-capacity accounting: overage beyond the reservation is split
/// across ordered tiers; tier `k` absorbs `min(O, t_{k+1}) - t_k` units at
/// its price, with the last tier unbounded.
pub fn overage_breakdown(usage: u64, reserved: u64, tiers: &[OverageTier]) -> Vec<TierCharge> {
    let overage = usage.saturating_sub(reserved);
    if overage == 0 || tiers.is_empty() {
        return Vec::new();
    }
    let mut out = Vec::new();
    for (i, tier) in tiers.iter().enumerate() {
        let upper = tiers.get(i + 1).map(|t| t.threshold).unwrap_or(u64::MAX);
        let amount = overage.min(upper).saturating_sub(tier.threshold);
        if amount == 0 {
            continue;
        }
        out.push(TierCharge {
            threshold: tier.threshold,
            amount,
            price_per_unit: tier.price_per_unit,
            charge: Decimal::from(amount) * tier.price_per_unit,
            billing_item: tier.stripe_item.clone(),
        });
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthlyCharges {
    pub vex: Vec<TierCharge>,
    pub fu: Vec<TierCharge>,
    pub total: Decimal,
}

/// Query-time reserved-capacity statement for one tenant-month.
pub fn monthly_charges(
    reserved: &crate::config::ReservedCapacity,
    usage: &crate::storage::UsageTotals,
) -> MonthlyCharges {
    let vex = overage_breakdown(usage.vex, reserved.vex_reserved, &reserved.vex_overage_tiers);
    let fu = overage_breakdown(
        usage.fu_tokens,
        reserved.fu_reserved,
        &reserved.fu_overage_tiers,
    );
    let total = vex
        .iter()
        .chain(fu.iter())
        .map(|c| c.charge)
        .fold(Decimal::ZERO, |acc, c| acc + c);
    MonthlyCharges { vex, fu, total }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReservedCapacity;
    use crate::storage::UsageTotals;
    use std::str::FromStr;

    fn tier(threshold: u64, price: &str) -> OverageTier {
        OverageTier {
            threshold,
            price_per_unit: Decimal::from_str(price).unwrap(),
            stripe_item: None,
        }
    }

    #[test]
    fn usage_within_reservation_costs_nothing() {
        let tiers = vec![tier(0, "0.01")];
        assert!(overage_breakdown(100, 100, &tiers).is_empty());
        assert!(overage_breakdown(50, 100, &tiers).is_empty());
    }

    #[test]
    fn overage_splits_across_tiers_in_order() {
        let tiers = vec![tier(0, "0.01"), tier(1000, "0.008"), tier(5000, "0.005")];
        let charges = overage_breakdown(7500, 1000, &tiers);
        // Overage is 6500: 1000 at the first tier, 4000 at the second,
        // 1500 in the unbounded tail.
        assert_eq!(
            charges.iter().map(|c| c.amount).collect::<Vec<_>>(),
            vec![1000, 4000, 1500]
        );
        assert_eq!(charges[0].charge, Decimal::from_str("10.00").unwrap());
        assert_eq!(charges[1].charge, Decimal::from_str("32.000").unwrap());
        assert_eq!(charges[2].charge, Decimal::from_str("7.500").unwrap());
    }

    #[test]
    fn partial_first_tier() {
        let tiers = vec![tier(0, "0.01"), tier(1000, "0.008")];
        let charges = overage_breakdown(1500, 1000, &tiers);
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].amount, 500);
    }

    #[test]
    fn monthly_statement_combines_both_units() {
        let reserved = ReservedCapacity {
            vex_reserved: 1000,
            fu_reserved: 0,
            vex_overage_tiers: vec![tier(0, "0.01")],
            fu_overage_tiers: vec![tier(0, "0.0002")],
        };
        let usage = UsageTotals {
            vex: 1500,
            fu_tokens: 10_000,
        };
        let statement = monthly_charges(&reserved, &usage);
        assert_eq!(statement.vex.len(), 1);
        assert_eq!(statement.vex[0].amount, 500);
        assert_eq!(statement.fu[0].amount, 10_000);
        // 500 * 0.01 + 10000 * 0.0002 = 5 + 2 = 7
        assert_eq!(statement.total, Decimal::from_str("7").unwrap());
    }

    #[tokio::test]
    async fn flusher_aggregates_and_drains_on_shutdown() {
        let sink = Arc::new(CollectingSink::default());
        let (buffer, handle) = BillingBuffer::spawn(
            sink.clone(),
            64,
            // Long interval so only the shutdown drain flushes.
            Duration::from_secs(3600),
        );
        for _ in 0..3 {
            buffer
                .enqueue(MeterEvent {
                    tenant: "acme".to_string(),
                    unit: MeterUnit::Vex,
                    amount: 1,
                    billing_item: Some("si_vex".to_string()),
                })
                .await;
        }
        buffer
            .enqueue(MeterEvent {
                tenant: "acme".to_string(),
                unit: MeterUnit::Fu,
                amount: 63,
                billing_item: Some("si_fu".to_string()),
            })
            .await;
        drop(buffer);
        handle.await.unwrap();

        let flushed = sink.flushed();
        assert_eq!(flushed.len(), 2);
        let vex = flushed.iter().find(|e| e.unit == MeterUnit::Vex).unwrap();
        assert_eq!(vex.amount, 3);
        let fu = flushed.iter().find(|e| e.unit == MeterUnit::Fu).unwrap();
        assert_eq!(fu.amount, 63);
    }
}

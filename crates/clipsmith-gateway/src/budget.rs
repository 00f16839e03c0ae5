//! Run-scoped cost ledger.
//!
//! Every counter is an atomic behind a `DashMap` entry, so concurrent stages
//! record without read-modify-write races. Costs are kept in micro-dollars.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// One gateway attempt, successful or not.
#[derive(Debug, Clone)]
pub struct CallRecord<'a> {
    pub stage: &'a str,
    pub provider: &'a str,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub wall_time: Duration,
    pub cost_usd: f64,
    pub success: bool,
}

#[derive(Default)]
struct Ledger {
    calls: AtomicU64,
    failures: AtomicU64,
    tokens_in: AtomicU64,
    tokens_out: AtomicU64,
    cost_micros: AtomicU64,
    wall_ms: AtomicU64,
}

impl Ledger {
    fn add(&self, record: &CallRecord<'_>, micros: u64) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if !record.success {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.tokens_in.fetch_add(record.tokens_in, Ordering::Relaxed);
        self.tokens_out.fetch_add(record.tokens_out, Ordering::Relaxed);
        self.cost_micros.fetch_add(micros, Ordering::Relaxed);
        self.wall_ms
            .fetch_add(record.wall_time.as_millis() as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> LedgerSummary {
        LedgerSummary {
            calls: self.calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            tokens_in: self.tokens_in.load(Ordering::Relaxed),
            tokens_out: self.tokens_out.load(Ordering::Relaxed),
            cost_usd: self.cost_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            wall_ms: self.wall_ms.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerSummary {
    pub calls: u64,
    pub failures: u64,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub wall_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetReport {
    pub cap_usd: Option<f64>,
    pub spent_usd: f64,
    pub by_stage: BTreeMap<String, LedgerSummary>,
    pub by_provider: BTreeMap<String, LedgerSummary>,
}

pub struct BudgetTracker {
    cap_micros: Option<u64>,
    total_micros: AtomicU64,
    stages: DashMap<String, Ledger>,
    providers: DashMap<String, Ledger>,
}

fn to_micros(usd: f64) -> u64 {
    if usd.is_finite() && usd > 0.0 {
        (usd * 1_000_000.0).round() as u64
    } else {
        0
    }
}

impl BudgetTracker {
    pub fn new(cap_usd: Option<f64>) -> Self {
        Self {
            cap_micros: cap_usd.map(to_micros),
            total_micros: AtomicU64::new(0),
            stages: DashMap::new(),
            providers: DashMap::new(),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn record(&self, record: &CallRecord<'_>) {
        let micros = to_micros(record.cost_usd);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.stages
            .entry(record.stage.to_string())
            .or_default()
            .add(record, micros);
        self.providers
            .entry(record.provider.to_string())
            .or_default()
            .add(record, micros);
    }

    pub fn cap_usd(&self) -> Option<f64> {
        self.cap_micros.map(|m| m as f64 / 1_000_000.0)
    }

    pub fn spent_usd(&self) -> f64 {
        self.total_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    pub fn remaining_usd(&self) -> Option<f64> {
        self.cap_micros.map(|cap| {
            cap.saturating_sub(self.total_micros.load(Ordering::Relaxed)) as f64 / 1_000_000.0
        })
    }

    pub fn is_exhausted(&self) -> bool {
        match self.cap_micros {
            Some(cap) => self.total_micros.load(Ordering::Relaxed) >= cap,
            None => false,
        }
    }

    pub fn stage(&self, stage: &str) -> LedgerSummary {
        self.stages
            .get(stage)
            .map(|l| l.snapshot())
            .unwrap_or_default()
    }

    pub fn report(&self) -> BudgetReport {
        BudgetReport {
            cap_usd: self.cap_usd(),
            spent_usd: self.spent_usd(),
            by_stage: self
                .stages
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect(),
            by_provider: self
                .providers
                .iter()
                .map(|e| (e.key().clone(), e.value().snapshot()))
                .collect(),
        }
    }

    /// Start a new run with the same cap.
    pub fn reset(&self) {
        self.total_micros.store(0, Ordering::Relaxed);
        self.stages.clear();
        self.providers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn record(stage: &'static str, cost: f64, success: bool) -> CallRecord<'static> {
        CallRecord {
            stage,
            provider: "p",
            tokens_in: 100,
            tokens_out: 20,
            wall_time: Duration::from_millis(5),
            cost_usd: cost,
            success,
        }
    }

    #[test]
    fn test_failed_calls_still_cost() {
        let budget = BudgetTracker::new(Some(1.0));
        budget.record(&record("gate", 0.25, false));
        let gate = budget.stage("gate");
        assert_eq!(gate.calls, 1);
        assert_eq!(gate.failures, 1);
        assert!((budget.spent_usd() - 0.25).abs() < 1e-9);
        assert!((budget.remaining_usd().unwrap() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_exhaustion() {
        let budget = BudgetTracker::new(Some(0.5));
        assert!(!budget.is_exhausted());
        budget.record(&record("a", 0.3, true));
        budget.record(&record("b", 0.3, true));
        assert!(budget.is_exhausted());
        assert_eq!(budget.remaining_usd(), Some(0.0));
        assert!(!BudgetTracker::unlimited().is_exhausted());
    }

    #[test]
    fn test_concurrent_records_sum_exactly() {
        let budget = Arc::new(BudgetTracker::unlimited());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&budget);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        b.record(&record("s", 0.001, true));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let s = budget.stage("s");
        assert_eq!(s.calls, 4000);
        assert_eq!(s.tokens_in, 400_000);
        assert!((budget.spent_usd() - 4.0).abs() < 1e-9);
        assert_eq!(budget.report().by_provider["p"].calls, 4000);
    }

    #[test]
    fn test_reset_clears_ledger() {
        let budget = BudgetTracker::new(Some(1.0));
        budget.record(&record("a", 0.5, true));
        budget.reset();
        assert_eq!(budget.spent_usd(), 0.0);
        assert!(budget.report().by_stage.is_empty());
    }
}

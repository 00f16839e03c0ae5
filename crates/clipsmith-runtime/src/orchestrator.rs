//! Orchestrator: runs the item set through the stage list, one stage at a time.
//!
//! Batches of one stage run concurrently up to `max_concurrent_batches`,
//! all under one per-stage deadline. Stages work on copies; results are
//! merged back by item id after invariant checks, so a failing or late batch
//! never leaves an item half-updated.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use clipsmith_core::{CandidateItem, DiscardReason, Error, ItemId, ItemStatus, Result, StageId};

use crate::report::StageSummary;
use crate::stage::{FailureScope, RunContext, Stage, StageTraits};

/// Per-item result of one batch.
enum ItemRun {
    Updated(CandidateItem),
    Failed(String),
    Skipped(String),
    RolledBack(String),
    TimedOut,
}

struct BatchRun {
    results: Vec<(ItemId, ItemRun)>,
    low_confidence: bool,
    cached: bool,
    retried_alone: usize,
}

impl BatchRun {
    fn uniform(ids: Vec<ItemId>, make: impl Fn() -> ItemRun) -> Self {
        Self {
            results: ids.into_iter().map(|id| (id, make())).collect(),
            low_confidence: false,
            cached: false,
            retried_alone: 0,
        }
    }
}

pub struct Orchestrator {
    stages: Vec<Arc<dyn Stage>>,
}

impl Orchestrator {
    /// Build an orchestrator over `stages`, rejecting orders that would gate
    /// twice or judge completeness before spans settle.
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Result<Self> {
        validate_order(&stages)?;
        Ok(Self { stages })
    }

    pub fn stages(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Run every stage over `items`. Never fails: per-item and per-stage
    /// problems end up in the items' status and the summaries.
    pub async fn run(&self, items: &mut [CandidateItem], ctx: &RunContext) -> Vec<StageSummary> {
        let mut summaries = Vec::with_capacity(self.stages.len());
        for stage in &self.stages {
            summaries.push(self.run_stage(stage.as_ref(), items, ctx).await);
        }
        summaries
    }

    pub async fn run_stage(
        &self,
        stage: &dyn Stage,
        items: &mut [CandidateItem],
        ctx: &RunContext,
    ) -> StageSummary {
        let started = Instant::now();
        let id = stage.id().clone();
        let traits = stage.traits();
        let ledger_before = ctx.budget().stage(id.as_str());
        let mut summary = StageSummary::new(id.as_str());

        // Highest priority first; the sort is stable so ties keep discovery order.
        let mut order: Vec<usize> = (0..items.len()).filter(|&i| items[i].is_active()).collect();
        order.sort_by(|&a, &b| items[b].priority().total_cmp(&items[a].priority()));

        let mut eligible = Vec::with_capacity(order.len());
        for i in order {
            if stage.applies_to(&items[i]) {
                eligible.push(i);
            } else {
                items[i].note_skip(&id, "not needed");
                summary.skipped += 1;
            }
        }

        let batches: Vec<Vec<CandidateItem>> = eligible
            .chunks(traits.batch_size.max(1))
            .map(|chunk| chunk.iter().map(|&i| items[i].clone()).collect())
            .collect();
        let deadline = started + ctx.config.stage_timeout();
        let runs: Vec<BatchRun> = stream::iter(
            batches
                .into_iter()
                .map(|batch| run_batch(stage, traits, batch, ctx, deadline)),
        )
        .buffer_unordered(ctx.config.max_concurrent_batches.max(1))
        .collect()
        .await;

        let index: HashMap<ItemId, usize> = items
            .iter()
            .enumerate()
            .map(|(i, item)| (item.id().clone(), i))
            .collect();
        for run in runs {
            summary.retried_alone += run.retried_alone;
            if run.low_confidence {
                summary.low_confidence_batches += 1;
            }
            if run.cached {
                summary.cached_batches += 1;
            }
            for (item_id, result) in run.results {
                let Some(&i) = index.get(&item_id) else {
                    warn!(stage = %id, item_id = %item_id, "Stage returned an unknown item");
                    continue;
                };
                merge(&id, traits, &mut items[i], result, &mut summary);
            }
        }

        let ledger = ctx.budget().stage(id.as_str());
        summary.calls = ledger.calls.saturating_sub(ledger_before.calls);
        summary.cost_usd = (ledger.cost_usd - ledger_before.cost_usd).max(0.0);
        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            stage = %id,
            "Stage done: processed={}, skipped={}, discarded={}, rolled_back={}, timed_out={}, cost=${:.4}, duration={}ms",
            summary.processed,
            summary.skipped,
            summary.discarded,
            summary.rolled_back,
            summary.timed_out,
            summary.cost_usd,
            summary.duration_ms
        );
        summary
    }
}

async fn run_batch(
    stage: &dyn Stage,
    traits: StageTraits,
    mut batch: Vec<CandidateItem>,
    ctx: &RunContext,
    deadline: Instant,
) -> BatchRun {
    let ids: Vec<ItemId> = batch.iter().map(|item| item.id().clone()).collect();
    if traits.optional && ctx.budget().is_exhausted() {
        let reason = Error::BudgetExhausted {
            spent: ctx.budget().spent_usd(),
            cap: ctx.budget().cap_usd().unwrap_or(0.0),
        }
        .to_string();
        return BatchRun::uniform(ids, || ItemRun::Skipped(reason.clone()));
    }

    let originals = batch.clone();
    let applied = timeout_at(deadline, stage.apply(&mut batch, ctx)).await;
    match applied {
        Err(_) => {
            warn!(stage = %stage.id(), "Batch of {} missed the stage deadline", ids.len());
            BatchRun::uniform(ids, || ItemRun::TimedOut)
        }
        Ok(Err(e)) if traits.failure_scope == FailureScope::Batch => {
            warn!(stage = %stage.id(), error = %e, "Batch failed, rolling back");
            let reason = e.to_string();
            BatchRun::uniform(ids, || ItemRun::RolledBack(reason.clone()))
        }
        Ok(Err(e)) if originals.len() > 1 && e.is_per_item() => {
            debug!(stage = %stage.id(), error = %e, "Batch failed, retrying items alone");
            let retried_alone = originals.len();
            BatchRun {
                results: retry_alone(stage, originals, ctx, deadline).await,
                low_confidence: false,
                cached: false,
                retried_alone,
            }
        }
        Ok(Err(e)) => {
            warn!(stage = %stage.id(), error = %e, "Batch failed");
            let reason = e.to_string();
            BatchRun::uniform(ids, || ItemRun::Failed(reason.clone()))
        }
        Ok(Ok(outcome)) => {
            let mut run = BatchRun {
                results: Vec::with_capacity(ids.len()),
                low_confidence: outcome.low_confidence,
                cached: outcome.cached,
                retried_alone: 0,
            };
            if outcome.failed.is_empty() {
                run.results = batch
                    .into_iter()
                    .map(|item| (item.id().clone(), ItemRun::Updated(item)))
                    .collect();
                return run;
            }
            if traits.failure_scope == FailureScope::Batch {
                let reason = outcome
                    .failed
                    .iter()
                    .map(|(item, why)| format!("{}: {}", item, why))
                    .collect::<Vec<_>>()
                    .join("; ");
                warn!(stage = %stage.id(), "Rolling back batch: {}", reason);
                run.results = ids
                    .into_iter()
                    .map(|id| (id, ItemRun::RolledBack(reason.clone())))
                    .collect();
                return run;
            }

            let solo = originals.len() == 1;
            let mut retry = Vec::new();
            for (item, original) in batch.into_iter().zip(originals) {
                match outcome.failed.get(item.id()) {
                    None => run.results.push((item.id().clone(), ItemRun::Updated(item))),
                    Some(why) if solo => {
                        run.results.push((item.id().clone(), ItemRun::Failed(why.clone())))
                    }
                    Some(_) => retry.push(original),
                }
            }
            if !retry.is_empty() {
                debug!(stage = %stage.id(), "Retrying {} items alone", retry.len());
                run.retried_alone = retry.len();
                run.results
                    .extend(retry_alone(stage, retry, ctx, deadline).await);
            }
            run
        }
    }
}

/// Re-run each item in its own batch of one, from its pre-stage state.
async fn retry_alone(
    stage: &dyn Stage,
    items: Vec<CandidateItem>,
    ctx: &RunContext,
    deadline: Instant,
) -> Vec<(ItemId, ItemRun)> {
    join_all(items.into_iter().map(|item| async move {
        let id = item.id().clone();
        let mut single = vec![item];
        let applied = timeout_at(deadline, stage.apply(&mut single, ctx)).await;
        let run = match applied {
            Err(_) => ItemRun::TimedOut,
            Ok(Err(e)) => ItemRun::Failed(e.to_string()),
            Ok(Ok(outcome)) => match (outcome.failed.get(&id), single.pop()) {
                (Some(why), _) => ItemRun::Failed(why.clone()),
                (None, Some(item)) => ItemRun::Updated(item),
                (None, None) => ItemRun::Failed("stage dropped the item".into()),
            },
        };
        (id, run)
    }))
    .await
}

/// Fold one item's batch result into the authoritative item.
fn merge(
    stage: &StageId,
    traits: StageTraits,
    item: &mut CandidateItem,
    result: ItemRun,
    summary: &mut StageSummary,
) {
    match result {
        ItemRun::Updated(mut updated) => {
            if let Err(e) = verify_update(item, &updated) {
                warn!(stage = %stage, item_id = %item.id(), "Discarding item: {}", e);
                item.discard(
                    stage,
                    DiscardReason::InvariantViolation {
                        stage: stage.clone(),
                        detail: e.to_string(),
                    },
                );
                summary.discarded += 1;
                return;
            }
            if !traits.is_gate && updated.status() == ItemStatus::Candidate {
                if let Err(e) = updated.advance(stage, ItemStatus::Refined) {
                    warn!(stage = %stage, item_id = %item.id(), "Status not advanced: {}", e);
                }
            }
            *item = updated;
            summary.processed += 1;
        }
        ItemRun::Failed(detail) if traits.optional => {
            item.note_skip(stage, format!("stage failed: {}", detail));
            summary.skipped += 1;
        }
        ItemRun::Failed(detail) => {
            warn!(stage = %stage, item_id = %item.id(), "Discarding item: {}", detail);
            item.discard(
                stage,
                DiscardReason::StageFailure {
                    stage: stage.clone(),
                    detail,
                },
            );
            summary.discarded += 1;
        }
        ItemRun::Skipped(reason) => {
            item.note_skip(stage, reason);
            summary.skipped += 1;
        }
        ItemRun::RolledBack(reason) => {
            item.note_rollback(stage, reason);
            summary.rolled_back += 1;
        }
        ItemRun::TimedOut => {
            item.discard(
                stage,
                DiscardReason::StageTimeout {
                    stage: stage.clone(),
                },
            );
            summary.timed_out += 1;
            summary.discarded += 1;
        }
    }
}

/// Checks a stage's output against the state it started from.
fn verify_update(before: &CandidateItem, after: &CandidateItem) -> Result<()> {
    after.check_invariants()?;
    if after.id() != before.id() {
        return Err(Error::InvariantViolation(format!(
            "item {} came back as {}",
            before.id(),
            after.id()
        )));
    }
    if after.provenance().len() < before.provenance().len()
        || after.provenance()[..before.provenance().len()] != *before.provenance()
    {
        return Err(Error::InvariantViolation(format!(
            "provenance of {} was rewritten",
            before.id()
        )));
    }
    if before.is_span_locked() && after.span() != before.span() {
        return Err(Error::InvariantViolation(format!(
            "locked span of {} moved",
            before.id()
        )));
    }
    Ok(())
}

/// At most one gate, placed last; completeness checks after every stage
/// that can still move a span.
pub fn validate_order(stages: &[Arc<dyn Stage>]) -> Result<()> {
    let mut seen = std::collections::HashSet::new();
    for stage in stages {
        if !seen.insert(stage.id().as_str()) {
            return Err(Error::Config(format!("stage '{}' listed twice", stage.id())));
        }
    }

    let traits: Vec<(&StageId, StageTraits)> =
        stages.iter().map(|s| (s.id(), s.traits())).collect();
    let gates: Vec<usize> = traits
        .iter()
        .enumerate()
        .filter(|(_, (_, t))| t.is_gate)
        .map(|(i, _)| i)
        .collect();
    if gates.len() > 1 {
        return Err(Error::Config(format!(
            "{} hard gates in the pipeline; only one is allowed",
            gates.len()
        )));
    }
    if let Some(&gate) = gates.first() {
        if gate + 1 != traits.len() {
            return Err(Error::Config(format!(
                "gate '{}' must be the last stage",
                traits[gate].0
            )));
        }
    }

    let last_extender = traits.iter().rposition(|(_, t)| t.extends_span);
    for (i, (id, t)) in traits.iter().enumerate() {
        if !t.completeness_dependent {
            continue;
        }
        if let Some(last) = last_extender {
            if i < last {
                return Err(Error::Config(format!(
                    "'{}' judges completeness before '{}' can still extend spans",
                    id, traits[last].0
                )));
            }
        }
        if t.extends_span {
            return Err(Error::Config(format!(
                "'{}' cannot both extend spans and judge completeness",
                id
            )));
        }
    }
    Ok(())
}

/// Discard reasons keyed by item, for logging and reports.
pub fn discard_reasons(items: &[CandidateItem]) -> BTreeMap<ItemId, String> {
    items
        .iter()
        .filter_map(|item| {
            item.discard_reason()
                .map(|reason| (item.id().clone(), reason.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::BatchOutcome;
    use async_trait::async_trait;
    use clipsmith_cache::ResultCache;
    use clipsmith_consensus::{ConsensusEngine, QuorumSettings};
    use clipsmith_core::{
        PipelineConfig, PrinciplesSnapshot, ResolvedModels, ScoreMethod, Span, Transcript,
        TranscriptSegment,
    };
    use clipsmith_gateway::{BudgetTracker, GatewaySettings, ModelGateway};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted stage: marks items, fails the ones whose start is listed.
    struct StubStage {
        id: StageId,
        traits: StageTraits,
        fail_when_batched: Vec<f64>,
        fail_always: Vec<f64>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl StubStage {
        fn new(name: &str, traits: StageTraits) -> Self {
            Self {
                id: StageId::new(name),
                traits,
                fail_when_batched: Vec::new(),
                fail_always: Vec::new(),
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Stage for StubStage {
        fn id(&self) -> &StageId {
            &self.id
        }
        fn version(&self) -> u32 {
            1
        }
        fn traits(&self) -> StageTraits {
            self.traits
        }
        async fn apply(
            &self,
            batch: &mut [CandidateItem],
            _ctx: &RunContext,
        ) -> Result<BatchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let mut outcome = BatchOutcome::default();
            let batched = batch.len() > 1;
            for item in batch.iter_mut() {
                let start = item.span().start();
                if self.fail_always.contains(&start)
                    || (batched && self.fail_when_batched.contains(&start))
                {
                    outcome.fail(item.id(), "bad reply");
                    continue;
                }
                item.set_score(&self.id, "stub", 1.0, ScoreMethod::Rule, None);
            }
            Ok(outcome)
        }
    }

    fn transcript() -> Transcript {
        Transcript::new(
            "talk",
            (0..6)
                .map(|i| TranscriptSegment {
                    start: i as f64 * 10.0,
                    end: i as f64 * 10.0 + 10.0,
                    text: format!("segment {}", i),
                })
                .collect(),
        )
    }

    fn items(t: &Transcript, n: usize) -> Vec<CandidateItem> {
        (0..n)
            .map(|i| {
                let span = Span::new(i as f64 * 10.0, i as f64 * 10.0 + 10.0).unwrap();
                CandidateItem::new(&StageId::new("discover"), "talk", span, t.slice(&span))
                    .unwrap()
            })
            .collect()
    }

    fn context(config: PipelineConfig) -> RunContext {
        let gateway = ModelGateway::new(
            Arc::new(BudgetTracker::new(config.budget_cap_usd)),
            GatewaySettings::default(),
        );
        let engine = ConsensusEngine::new(
            Arc::new(gateway),
            Arc::new(ResultCache::in_memory(Duration::from_secs(60))),
            QuorumSettings::default(),
        );
        RunContext::new(
            Arc::new(config),
            Arc::new(transcript()),
            Arc::new(PrinciplesSnapshot::empty()),
            Arc::new(ResolvedModels {
                models: Default::default(),
                resolved_at: chrono::Utc::now(),
            }),
            Arc::new(engine),
            BTreeMap::new(),
        )
    }

    fn batched(size: usize) -> StageTraits {
        StageTraits {
            batch_size: size,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_failed_item_is_retried_alone() {
        let ctx = context(PipelineConfig::default());
        let mut stub = StubStage::new("stub", batched(3));
        stub.fail_when_batched = vec![10.0];
        let orch = Orchestrator::new(vec![]).unwrap();
        let mut items = items(&ctx.transcript, 3);

        let summary = orch.run_stage(&stub, &mut items, &ctx).await;
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.retried_alone, 1);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 2);
        assert!(items.iter().all(|i| i.score("stub") == Some(1.0)));
        assert!(items.iter().all(|i| i.status() == ItemStatus::Refined));
    }

    #[tokio::test]
    async fn test_item_failing_alone_is_discarded_others_survive() {
        let ctx = context(PipelineConfig::default());
        let mut stub = StubStage::new("stub", batched(3));
        stub.fail_always = vec![20.0];
        let orch = Orchestrator::new(vec![]).unwrap();
        let mut items = items(&ctx.transcript, 3);

        let summary = orch.run_stage(&stub, &mut items, &ctx).await;
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.discarded, 1);
        let reasons = discard_reasons(&items);
        assert_eq!(reasons.len(), 1);
        assert!(reasons.values().next().unwrap().contains("bad reply"));
    }

    #[tokio::test]
    async fn test_batch_scope_rolls_back_whole_batch() {
        let ctx = context(PipelineConfig::default());
        let mut stub = StubStage::new(
            "stub",
            StageTraits {
                batch_size: 3,
                failure_scope: FailureScope::Batch,
                ..Default::default()
            },
        );
        stub.fail_always = vec![0.0];
        let orch = Orchestrator::new(vec![]).unwrap();
        let mut items = items(&ctx.transcript, 3);

        let summary = orch.run_stage(&stub, &mut items, &ctx).await;
        assert_eq!(summary.rolled_back, 3);
        assert!(items.iter().all(|i| i.score("stub").is_none()));
        assert!(items.iter().all(|i| i.is_active()));
    }

    #[tokio::test]
    async fn test_stage_timeout_discards_unfinished_items() {
        let config = PipelineConfig {
            stage_timeout_secs: 0.05,
            ..Default::default()
        };
        let ctx = context(config);
        let mut stub = StubStage::new("slow", batched(2));
        stub.delay = Some(Duration::from_millis(500));
        let orch = Orchestrator::new(vec![]).unwrap();
        let mut items = items(&ctx.transcript, 2);

        let summary = orch.run_stage(&stub, &mut items, &ctx).await;
        assert_eq!(summary.timed_out, 2);
        for item in &items {
            assert_eq!(item.status(), ItemStatus::Discarded);
            assert!(matches!(
                item.discard_reason(),
                Some(DiscardReason::StageTimeout { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_exhausted_budget_skips_optional_stage() {
        let config = PipelineConfig {
            budget_cap_usd: Some(0.0),
            ..Default::default()
        };
        let ctx = context(config);
        let stub = StubStage::new(
            "optional",
            StageTraits {
                batch_size: 2,
                optional: true,
                ..Default::default()
            },
        );
        let orch = Orchestrator::new(vec![]).unwrap();
        let mut items = items(&ctx.transcript, 2);

        let summary = orch.run_stage(&stub, &mut items, &ctx).await;
        assert_eq!(summary.skipped, 2);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
        assert!(items.iter().all(|i| i.is_active()));
    }

    #[test]
    fn test_rejects_two_gates_and_early_completeness() {
        let gate = StageTraits {
            is_gate: true,
            ..Default::default()
        };
        let two_gates: Vec<Arc<dyn Stage>> = vec![
            Arc::new(StubStage::new("gate_a", gate)),
            Arc::new(StubStage::new("gate_b", gate)),
        ];
        assert!(matches!(
            Orchestrator::new(two_gates),
            Err(Error::Config(_))
        ));

        let early: Vec<Arc<dyn Stage>> = vec![
            Arc::new(StubStage::new(
                "completeness",
                StageTraits {
                    completeness_dependent: true,
                    ..Default::default()
                },
            )),
            Arc::new(StubStage::new(
                "bridge",
                StageTraits {
                    extends_span: true,
                    ..Default::default()
                },
            )),
        ];
        assert!(Orchestrator::new(early).is_err());

        let gate_first: Vec<Arc<dyn Stage>> = vec![
            Arc::new(StubStage::new("gate", gate)),
            Arc::new(StubStage::new("after", StageTraits::default())),
        ];
        assert!(Orchestrator::new(gate_first).is_err());
    }
}
